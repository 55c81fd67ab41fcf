//! `cci request` - One-shot client for a running daemon

use anyhow::{Context, Result};
use cci::server::{RUN_ACTION, Response, STATUS_ACTION};
use serde_json::{Value, json};
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::time::Duration;

pub fn run_request(task: &str) -> Value {
    json!({ "action": RUN_ACTION, "taskName": task })
}

pub fn status_request(run: u64) -> Value {
    json!({ "action": STATUS_ACTION, "buildReference": run })
}

/// Sends `request` and waits for the first reply line
pub fn send(addr: &str, request: &Value, timeout: Duration) -> Result<Response> {
    let mut stream =
        TcpStream::connect(addr).with_context(|| format!("Failed to connect to {addr}"))?;
    stream.set_read_timeout(Some(timeout))?;

    let mut line = serde_json::to_vec(request)?;
    line.push(b'\n');
    stream.write_all(&line).context("Failed to send request")?;

    let mut reader = BufReader::new(stream);
    let mut reply = String::new();
    reader
        .read_line(&mut reply)
        .context("Failed to read reply")?;
    if reply.trim().is_empty() {
        anyhow::bail!("Connection closed without a reply");
    }
    serde_json::from_str(&reply).with_context(|| format!("Unexpected reply: {}", reply.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_request_bodies() {
        assert_eq!(
            run_request("widgets"),
            json!({"action": "run", "taskName": "widgets"})
        );
        assert_eq!(
            status_request(3),
            json!({"action": "status", "buildReference": 3})
        );
    }

    #[test]
    fn test_send_reads_one_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let mut stream = stream;
            stream
                .write_all(b"{\"action\":\"run\",\"success\":true,\"buildReference\":0}\n")
                .unwrap();
            line
        });

        let response = send(&addr, &run_request("widgets"), Duration::from_secs(5)).unwrap();

        assert_eq!(response, Response::accepted(cci::server::RunId(0)));
        let sent: Value = serde_json::from_str(&server.join().unwrap()).unwrap();
        assert_eq!(sent["taskName"], "widgets");
    }
}
