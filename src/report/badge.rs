//! SVG status badges
//!
//! Badges are a fixed 100x20 template with a grey topic on the left and a
//! coloured label on the right.

use super::classify::TestSummary;
use crate::pipeline::RunOutcome;

/// Label colour when passing
pub const PASS_COLOR: &str = "#4c1";

/// Label colour when failing
pub const FAIL_COLOR: &str = "#c30";

/// Fills the badge template
#[must_use]
pub fn status_badge(topic: &str, label: &str, color: &str) -> String {
    let topic = escape(topic);
    let label = escape(label);
    let color = escape(color);
    format!(
        r##"<?xml version='1.0'?>
<svg xmlns='http://www.w3.org/2000/svg' width='100' height='20'>
<linearGradient id='a' x2='0' y2='100%'>
    <stop offset='0' stop-color='#bbb' stop-opacity='.1'/>
    <stop offset='1' stop-opacity='.1'/>
</linearGradient>
<rect rx='3' width='100' height='20' fill='#555'/>
<rect rx='3' x='45' width='55' height='20' fill='{color}'/>
<path fill='{color}' d='M45 0h4v20h-4z'/>
<rect rx='3' width='100' height='20' fill='url(#a)'/>
<g fill='#fff' text-anchor='middle' font-family='DejaVu Sans,Verdana,Geneva,sans-serif' font-size='11'>
    <text x='24' y='15' fill='#010101' fill-opacity='.3'>{topic}</text>
    <text x='24' y='14'>{topic}</text>
    <text x='72' y='15' fill='#010101' fill-opacity='.3'>{label}</text>
    <text x='72' y='14'>{label}</text>
</g>
</svg>
"##
    )
}

/// Build stage attempted and every build step succeeded
#[must_use]
pub fn build_passed(outcome: &RunOutcome) -> bool {
    outcome.build.passed()
}

/// Test stage attempted, every test step succeeded and no test failed
#[must_use]
pub fn tests_passed(outcome: &RunOutcome, summary: &TestSummary) -> bool {
    outcome.test.passed() && summary.total().tests_failed == 0
}

/// `build passing` / `build failing`
#[must_use]
pub fn build_badge(outcome: &RunOutcome) -> String {
    pass_fail_badge("build", build_passed(outcome))
}

/// `tests passing` / `tests failing`
#[must_use]
pub fn test_badge(outcome: &RunOutcome, summary: &TestSummary) -> String {
    pass_fail_badge("tests", tests_passed(outcome, summary))
}

fn pass_fail_badge(topic: &str, passed: bool) -> String {
    if passed {
        status_badge(topic, "passing", PASS_COLOR)
    } else {
        status_badge(topic, "failing", FAIL_COLOR)
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
