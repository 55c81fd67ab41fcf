//! Process execution for pipeline steps
//!
//! [`CommandExecutor`] runs one [`Step`] as an external process:
//!
//! - the command line is split into argv with POSIX shell-word rules; no
//!   shell is interposed
//! - stdin is null, stdout and stderr are read line by line on one thread
//!   each and appended to a shared buffer in receipt order
//! - the child is polled until it exits or its timeout expires, in which
//!   case it is killed and reaped; on unix the child leads its own process
//!   group and the whole group is killed, so helpers started by `make` or
//!   `sh -c` do not outlive the step
//!
//! Lines from the two streams interleave in the order the reader threads
//! received them, which is not necessarily the order the child wrote them.

use super::traits::StepExecutor;
use crate::pipeline::{ExecError, OutputLine, OutputStream, Step, StepOutcome};
use chrono::Utc;
use parking_lot::Mutex;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Interval between exit checks while a timeout is armed
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long to wait for output pipes to close once the child is reaped
const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(1);

type SharedLines = Arc<Mutex<Vec<OutputLine>>>;

/// Runs steps as operating system processes
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    poll_interval: Duration,
    drain_grace: Duration,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }
}

impl CommandExecutor {
    /// Creates an executor with default polling
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the interval between exit checks
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets how long to wait for output after the child exits
    ///
    /// Descendants that inherited the pipes can keep them open after the
    /// child itself is gone; output arriving later than this is dropped.
    #[must_use]
    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    fn drain(&self, done: &mpsc::Receiver<()>, readers: usize, command: &str) {
        let deadline = Instant::now() + self.drain_grace;
        for _ in 0..readers {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if done.recv_timeout(remaining).is_err() {
                warn!(command = %command, "output still open after exit, keeping lines read so far");
                return;
            }
        }
    }
}

impl StepExecutor for CommandExecutor {
    fn execute(
        &self,
        step: &Step,
        default_timeout: Option<Duration>,
        base_dir: Option<&Path>,
    ) -> Result<StepOutcome, ExecError> {
        let argv = split_command(&step.command)?;
        let timeout = step.effective_timeout(default_timeout);

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .envs(&step.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = resolve_working_dir(step, base_dir) {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        debug!(
            command = %step.command,
            timeout = ?timeout,
            "launching step"
        );
        let started_at = Utc::now();
        let start = Instant::now();
        let mut child = command.spawn().map_err(|err| ExecError::Launch {
            program: argv[0].clone(),
            reason: err.to_string(),
        })?;

        let lines = SharedLines::default();
        let (done_tx, done_rx) = mpsc::channel();
        let mut readers = 0;
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, OutputStream::Stdout, Arc::clone(&lines), done_tx.clone());
            readers += 1;
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, OutputStream::Stderr, Arc::clone(&lines), done_tx.clone());
            readers += 1;
        }
        drop(done_tx);

        let (status, timed_out) =
            match wait_with_timeout(&mut child, timeout, start, self.poll_interval) {
                Ok(result) => result,
                Err(err) => {
                    let _ = kill_process_tree(&mut child);
                    let _ = child.wait();
                    return Err(ExecError::Launch {
                        program: argv[0].clone(),
                        reason: format!("failed to wait for process: {err}"),
                    });
                }
            };
        let duration = start.elapsed();

        self.drain(&done_rx, readers, &step.command);
        let lines = std::mem::take(&mut *lines.lock());
        let exit_code = status.code().unwrap_or(-1);

        if timed_out {
            warn!(
                command = %step.command,
                timeout = ?timeout,
                "step timed out and was killed"
            );
        } else {
            debug!(
                command = %step.command,
                exit_code,
                ?duration,
                "step finished"
            );
        }

        Ok(StepOutcome {
            step: step.clone(),
            lines,
            exit_code,
            timed_out,
            duration,
            started_at,
            launch_error: None,
        })
    }
}

/// Splits a command line into argv
///
/// # Errors
///
/// Returns [`ExecError::InvalidCommand`] for unbalanced quotes or a trailing
/// escape, and [`ExecError::EmptyCommand`] when no words remain.
pub fn split_command(command: &str) -> Result<Vec<String>, ExecError> {
    let argv = shell_words::split(command).map_err(|e| ExecError::InvalidCommand {
        command: command.to_string(),
        reason: e.to_string(),
    })?;
    if argv.is_empty() {
        return Err(ExecError::EmptyCommand);
    }
    Ok(argv)
}

/// Resolves the directory a step runs in
///
/// Returns `None` when the process's own working directory should be used.
#[must_use]
pub fn resolve_working_dir(step: &Step, base_dir: Option<&Path>) -> Option<PathBuf> {
    match (base_dir, step.working_directory.as_deref()) {
        (Some(base), Some(relative)) => Some(base.join(relative)),
        (Some(base), None) => Some(base.to_path_buf()),
        (None, Some(relative)) => Some(relative.to_path_buf()),
        (None, None) => None,
    }
}

fn spawn_reader<R>(source: R, stream: OutputStream, lines: SharedLines, done: mpsc::Sender<()>)
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = BufReader::new(source);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let raw = String::from_utf8_lossy(&buf);
                    let text = raw.strip_suffix('\n').unwrap_or(&*raw);
                    let text = text.strip_suffix('\r').unwrap_or(text);
                    lines.lock().push(OutputLine {
                        stream,
                        text: text.to_string(),
                    });
                }
                Err(err) => {
                    debug!(%stream, error = %err, "output reader stopped");
                    break;
                }
            }
        }
        let _ = done.send(());
    });
}

fn wait_with_timeout(
    child: &mut Child,
    timeout: Option<Duration>,
    start: Instant,
    poll_interval: Duration,
) -> io::Result<(ExitStatus, bool)> {
    let Some(timeout) = timeout else {
        return child.wait().map(|status| (status, false));
    };

    let deadline = start + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok((status, false));
        }
        let now = Instant::now();
        if now >= deadline {
            if let Err(err) = kill_process_tree(child) {
                debug!(error = %err, "kill failed, process already exited");
            }
            return child.wait().map(|status| (status, true));
        }
        thread::sleep(poll_interval.min(deadline - now));
    }
}

/// Kills the child's process group, falling back to the child alone
#[cfg(unix)]
fn kill_process_tree(child: &mut Child) -> io::Result<()> {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        return child.kill();
    };
    // SAFETY: kill(2) takes no pointers; a negative pid names the group the
    // child was placed in at spawn.
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } == 0 {
        Ok(())
    } else {
        child.kill()
    }
}

#[cfg(not(unix))]
fn kill_process_tree(child: &mut Child) -> io::Result<()> {
    child.kill()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn run(step: &Step) -> StepOutcome {
        CommandExecutor::new().execute(step, None, None).unwrap()
    }

    #[test]
    fn test_captures_both_streams() {
        let outcome = run(&Step::new(r#"sh -c "echo hello; echo oops >&2""#));
        assert!(outcome.succeeded());
        assert!(outcome.lines.contains(&OutputLine::stdout("hello")));
        assert!(outcome.lines.contains(&OutputLine::stderr("oops")));
    }

    #[test]
    fn test_preserves_line_order_within_a_stream() {
        let outcome = run(&Step::new(r#"sh -c "echo one; echo two; echo three""#));
        assert_eq!(outcome.stdout().collect::<Vec<_>>(), vec!["one", "two", "three"]);
    }

    #[test]
    fn test_strips_carriage_returns_and_keeps_unterminated_line() {
        let outcome = run(&Step::new(r#"sh -c "printf 'a\r\nb'""#));
        assert_eq!(outcome.stdout().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_nonzero_exit_is_data() {
        let outcome = run(&Step::new(r#"sh -c "exit 3""#));
        assert_eq!(outcome.exit_code, 3);
        assert!(!outcome.timed_out);
        assert!(!outcome.succeeded());
    }

    #[test]
    fn test_environment_override_wins() {
        let step = Step::new(r#"sh -c "echo $CCI_EXECUTOR_TEST""#).with_env("CCI_EXECUTOR_TEST", "overridden");
        let outcome = run(&step);
        assert_eq!(outcome.stdout().collect::<Vec<_>>(), vec!["overridden"]);
    }

    #[test]
    fn test_working_directory_is_joined_to_base() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let step = Step::new("pwd").in_dir("sub");

        let outcome = CommandExecutor::new()
            .execute(&step, None, Some(dir.path()))
            .unwrap();

        let printed = outcome.stdout().next().unwrap().to_string();
        assert!(Path::new(&printed).ends_with("sub"), "printed {printed}");
    }

    #[test]
    fn test_timeout_kills_process() {
        let timeout = Duration::from_millis(300);
        let step = Step::new("sleep 5").with_timeout(timeout);

        let outcome = run(&step);

        assert!(outcome.timed_out);
        assert!(!outcome.succeeded());
        assert_ne!(outcome.exit_code, 0);
        assert!(outcome.duration >= timeout);
        assert!(outcome.duration < timeout + Duration::from_secs(2));
    }

    #[test]
    fn test_timeout_kills_background_children() {
        // The background sleep holds stdout open; only a group kill lets the
        // readers finish well before the drain grace.
        let executor = CommandExecutor::new().with_drain_grace(Duration::from_secs(10));
        let step = Step::new(r#"sh -c "sleep 30 & wait""#).with_timeout(Duration::from_millis(300));

        let start = Instant::now();
        let outcome = executor.execute(&step, None, None).unwrap();

        assert!(outcome.timed_out);
        assert!(start.elapsed() < Duration::from_secs(5), "took {:?}", start.elapsed());
    }

    #[test]
    fn test_default_timeout_applies_when_step_has_none() {
        let outcome = CommandExecutor::new()
            .execute(&Step::new("sleep 5"), Some(Duration::from_millis(200)), None)
            .unwrap();
        assert!(outcome.timed_out);
    }

    #[test]
    fn test_fast_command_is_not_timed_out() {
        let step = Step::new("true").with_timeout(Duration::from_secs(5));
        let outcome = run(&step);
        assert!(outcome.succeeded());
        assert!(outcome.duration < Duration::from_secs(5));
    }

    #[test]
    fn test_missing_program_is_launch_error() {
        let err = CommandExecutor::new()
            .execute(&Step::new("cci-definitely-not-a-program --flag"), None, None)
            .unwrap_err();
        assert!(matches!(err, ExecError::Launch { ref program, .. } if program == "cci-definitely-not-a-program"));
    }

    #[test]
    fn test_missing_working_directory_is_launch_error() {
        let step = Step::new("true").in_dir("/nonexistent/cci/dir");
        let err = CommandExecutor::new().execute(&step, None, None).unwrap_err();
        assert!(matches!(err, ExecError::Launch { .. }));
    }

    #[test]
    fn test_split_command() {
        assert_eq!(
            split_command(r#"git commit -m "Results for 'x'""#).unwrap(),
            vec!["git", "commit", "-m", "Results for 'x'"]
        );
        assert_eq!(split_command("   "), Err(ExecError::EmptyCommand));
        assert!(matches!(
            split_command("echo 'open"),
            Err(ExecError::InvalidCommand { .. })
        ));
    }

    #[test]
    fn test_resolve_working_dir() {
        let base = Path::new("/ws");
        assert_eq!(resolve_working_dir(&Step::new("x"), None), None);
        assert_eq!(
            resolve_working_dir(&Step::new("x"), Some(base)),
            Some(PathBuf::from("/ws"))
        );
        assert_eq!(
            resolve_working_dir(&Step::new("x").in_dir("a/b"), Some(base)),
            Some(PathBuf::from("/ws/a/b"))
        );
        assert_eq!(
            resolve_working_dir(&Step::new("x").in_dir("a"), None),
            Some(PathBuf::from("a"))
        );
    }
}
