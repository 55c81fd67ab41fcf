//! Wire protocol
//!
//! Clients write consecutive JSON objects to the connection; whitespace
//! between them is optional. Each reply is a single JSON object followed by
//! a newline.
//!
//! ```text
//! -> {"action": "run", "taskName": "widgets"}
//! <- {"action":"run","success":true,"buildReference":0}
//! -> {"action": "status", "buildReference": 0}
//! <- {"completed":false,"resultLink":"https://example.com/results/widgets"}
//! ```

use super::registry::RunId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Action name of a run request
pub const RUN_ACTION: &str = "run";
/// Action name of a status request
pub const STATUS_ACTION: &str = "status";

/// A decoded client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Start a run of the named task
    Run {
        /// Task (BuildSpec title) to run.
        task_name: String,
    },
    /// Report whether a run has completed
    Status {
        /// Run being queried.
        run: RunId,
    },
}

impl Request {
    /// Wire name of the request's action
    #[must_use]
    pub fn action(&self) -> &'static str {
        match self {
            Self::Run { .. } => RUN_ACTION,
            Self::Status { .. } => STATUS_ACTION,
        }
    }

    /// Interprets one decoded JSON value as a request
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Malformed`] for values that are not objects,
    /// [`RequestError::MissingField`] when a required field is absent or
    /// mistyped and [`RequestError::UnknownAction`] for other actions.
    pub fn from_value(value: &Value) -> Result<Self, RequestError> {
        let object = value.as_object().ok_or_else(|| RequestError::Malformed {
            reason: "request must be a JSON object".to_string(),
        })?;

        let action = match object.get("action") {
            Some(Value::String(action)) => action.as_str(),
            Some(_) => {
                return Err(RequestError::Malformed {
                    reason: "'action' must be a string".to_string(),
                });
            }
            None => {
                return Err(RequestError::MissingField {
                    action: None,
                    field: "action",
                });
            }
        };

        match action {
            RUN_ACTION => {
                let task_name = object
                    .get("taskName")
                    .and_then(Value::as_str)
                    .ok_or(RequestError::MissingField {
                        action: Some(RUN_ACTION.to_string()),
                        field: "taskName",
                    })?;
                Ok(Self::Run {
                    task_name: task_name.to_string(),
                })
            }
            STATUS_ACTION => {
                let run = object
                    .get("buildReference")
                    .and_then(Value::as_u64)
                    .ok_or(RequestError::MissingField {
                        action: Some(STATUS_ACTION.to_string()),
                        field: "buildReference",
                    })?;
                Ok(Self::Status { run: RunId(run) })
            }
            other => Err(RequestError::UnknownAction {
                action: other.to_string(),
            }),
        }
    }
}

/// Reasons a request is answered with an error reply
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// No task with this name is loaded
    #[error("Unknown task '{name}'")]
    UnknownTask {
        /// Requested task name.
        name: String,
    },

    /// No run with this identifier was registered
    #[error("Unknown run {run}")]
    UnknownRun {
        /// Requested run.
        run: RunId,
    },

    /// A required field is absent or has the wrong type
    #[error("Missing or invalid field '{field}'")]
    MissingField {
        /// Action of the request, when it had one.
        action: Option<String>,
        /// Name of the field.
        field: &'static str,
    },

    /// The action is neither "run" nor "status"
    #[error("Unknown action '{action}'")]
    UnknownAction {
        /// Action as sent.
        action: String,
    },

    /// The bytes are not a JSON request object
    #[error("Malformed request: {reason}")]
    Malformed {
        /// Parser message.
        reason: String,
    },

    /// A single request exceeded the size limit
    #[error("Request exceeds {limit} bytes")]
    TooLarge {
        /// Configured limit.
        limit: usize,
    },

    /// The server stopped before the request could be queued
    #[error("Server is shutting down")]
    ShuttingDown {
        /// Action of the rejected request.
        action: &'static str,
    },
}

impl RequestError {
    /// Action echoed in the error reply
    #[must_use]
    pub fn action(&self) -> Option<&str> {
        match self {
            Self::UnknownTask { .. } => Some(RUN_ACTION),
            Self::UnknownRun { .. } => Some(STATUS_ACTION),
            Self::MissingField { action, .. } => action.as_deref(),
            Self::UnknownAction { action } => Some(action),
            Self::ShuttingDown { action } => Some(action),
            Self::Malformed { .. } | Self::TooLarge { .. } => None,
        }
    }
}

/// A reply written back to the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    /// A run was registered and will start shortly
    #[serde(rename_all = "camelCase")]
    RunAccepted {
        /// Always "run".
        action: String,
        /// Always true.
        success: bool,
        /// Identifier for later status requests.
        build_reference: RunId,
    },

    /// State of a registered run
    #[serde(rename_all = "camelCase")]
    Status {
        /// Whether the run has finished.
        completed: bool,
        /// Where the run's results are published.
        result_link: String,
    },

    /// The request was rejected
    Error {
        /// Action of the request, or null when it could not be determined.
        action: Option<String>,
        /// Always false.
        success: bool,
        /// Human readable reason.
        error: String,
    },
}

impl Response {
    /// Acknowledges a registered run
    #[must_use]
    pub fn accepted(run: RunId) -> Self {
        Self::RunAccepted {
            action: RUN_ACTION.to_string(),
            success: true,
            build_reference: run,
        }
    }

    /// Reports the state of a run
    #[must_use]
    pub fn status(completed: bool, result_link: impl Into<String>) -> Self {
        Self::Status {
            completed,
            result_link: result_link.into(),
        }
    }

    /// Error reply for a rejected request
    #[must_use]
    pub fn error(err: &RequestError) -> Self {
        Self::Error {
            action: err.action().map(str::to_string),
            success: false,
            error: err.to_string(),
        }
    }
}

/// Incremental decoder for a stream of JSON requests
///
/// Values may arrive split across reads or packed several to a read. A
/// value that fails to parse is reported once and the rest of its line is
/// discarded, so a client sending one request per line resynchronizes at
/// the next line.
#[derive(Debug)]
pub struct RequestDecoder {
    buf: Vec<u8>,
    max_len: usize,
    /// A malformed value was reported and its line has not ended yet
    skipping_line: bool,
}

impl RequestDecoder {
    /// Creates a decoder buffering at most `max_len` bytes of one request
    #[must_use]
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_len,
            skipping_line: false,
        }
    }

    /// Bytes received but not yet decoded
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Feeds received bytes and returns every request completed by them
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::TooLarge`] when the incomplete request left
    /// in the buffer exceeds the limit. The buffer is cleared and the
    /// connection should be closed.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<Result<Request, RequestError>>, RequestError> {
        let bytes = if self.skipping_line {
            match bytes.iter().position(|&b| b == b'\n') {
                Some(newline) => {
                    self.skipping_line = false;
                    &bytes[newline + 1..]
                }
                None => return Ok(Vec::new()),
            }
        } else {
            bytes
        };
        self.buf.extend_from_slice(bytes);

        let mut decoded = Vec::new();
        let mut consumed = 0;
        while consumed < self.buf.len() {
            let mut values =
                serde_json::Deserializer::from_slice(&self.buf[consumed..]).into_iter::<Value>();
            match values.next() {
                None => {
                    consumed = self.buf.len();
                }
                Some(Ok(value)) => {
                    consumed += values.byte_offset();
                    decoded.push(Request::from_value(&value));
                }
                Some(Err(err)) if err.is_eof() => break,
                Some(Err(err)) => {
                    let start = consumed + values.byte_offset();
                    decoded.push(Err(RequestError::Malformed {
                        reason: err.to_string(),
                    }));
                    match self.buf[start..].iter().position(|&b| b == b'\n') {
                        Some(newline) => consumed = start + newline + 1,
                        None => {
                            self.skipping_line = true;
                            consumed = self.buf.len();
                        }
                    }
                }
            }
        }
        self.buf.drain(..consumed);

        if self.buf.len() > self.max_len {
            self.buf.clear();
            return Err(RequestError::TooLarge {
                limit: self.max_len,
            });
        }
        Ok(decoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn run(task: &str) -> Request {
        Request::Run {
            task_name: task.to_string(),
        }
    }

    #[test]
    fn test_parse_run_and_status() {
        let value = json!({"action": "run", "taskName": "widgets"});
        assert_eq!(Request::from_value(&value).unwrap(), run("widgets"));

        let value = json!({"action": "status", "buildReference": 7});
        assert_eq!(
            Request::from_value(&value).unwrap(),
            Request::Status { run: RunId(7) }
        );
    }

    #[test]
    fn test_parse_rejections() {
        let err = Request::from_value(&json!({"action": "run"})).unwrap_err();
        assert_eq!(
            err,
            RequestError::MissingField {
                action: Some("run".to_string()),
                field: "taskName"
            }
        );

        let err = Request::from_value(&json!({"action": "status", "buildReference": -1})).unwrap_err();
        assert!(matches!(err, RequestError::MissingField { field: "buildReference", .. }));

        let err = Request::from_value(&json!({"action": "cancel"})).unwrap_err();
        assert_eq!(err.action(), Some("cancel"));

        let err = Request::from_value(&json!({"taskName": "widgets"})).unwrap_err();
        assert_eq!(err.action(), None);

        assert!(matches!(
            Request::from_value(&json!([1, 2])),
            Err(RequestError::Malformed { .. })
        ));
    }

    #[test]
    fn test_response_wire_format() {
        let accepted = serde_json::to_value(Response::accepted(RunId(3))).unwrap();
        assert_eq!(
            accepted,
            json!({"action": "run", "success": true, "buildReference": 3})
        );

        let status = serde_json::to_value(Response::status(true, "file:///r/widgets")).unwrap();
        assert_eq!(
            status,
            json!({"completed": true, "resultLink": "file:///r/widgets"})
        );

        let error = Response::error(&RequestError::UnknownRun { run: RunId(9) });
        assert_eq!(
            serde_json::to_value(error).unwrap(),
            json!({"action": "status", "success": false, "error": "Unknown run 9"})
        );

        let error = Response::error(&RequestError::Malformed {
            reason: "bad".to_string(),
        });
        assert_eq!(serde_json::to_value(&error).unwrap()["action"], Value::Null);
    }

    #[test]
    fn test_response_parses_back() {
        for response in [
            Response::accepted(RunId(1)),
            Response::status(false, "x"),
            Response::error(&RequestError::UnknownTask {
                name: "w".to_string(),
            }),
        ] {
            let text = serde_json::to_string(&response).unwrap();
            assert_eq!(serde_json::from_str::<Response>(&text).unwrap(), response);
        }
    }

    #[test]
    fn test_decoder_joins_split_values() {
        let mut decoder = RequestDecoder::new(1024);
        assert!(decoder.push(br#"{"action": "ru"#).unwrap().is_empty());
        assert!(decoder.buffered() > 0);

        let decoded = decoder.push(br#"n", "taskName": "widgets"}"#).unwrap();
        assert_eq!(decoded, vec![Ok(run("widgets"))]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_splits_packed_values() {
        let mut decoder = RequestDecoder::new(1024);
        let decoded = decoder
            .push(br#"{"action":"run","taskName":"a"}{"action":"run","taskName":"b"} {"action":"st"#)
            .unwrap();
        assert_eq!(decoded, vec![Ok(run("a")), Ok(run("b"))]);

        let decoded = decoder.push(b"atus\",\"buildReference\":0}\n").unwrap();
        assert_eq!(decoded, vec![Ok(Request::Status { run: RunId(0) })]);
    }

    #[test]
    fn test_decoder_recovers_after_malformed_line() {
        let mut decoder = RequestDecoder::new(1024);
        let decoded = decoder
            .push(b"{oops}\n{\"action\":\"run\",\"taskName\":\"widgets\"}\n")
            .unwrap();

        assert_eq!(decoded.len(), 2);
        assert!(matches!(decoded[0], Err(RequestError::Malformed { .. })));
        assert_eq!(decoded[1], Ok(run("widgets")));
    }

    #[test]
    fn test_decoder_reports_split_malformed_line_once() {
        let mut decoder = RequestDecoder::new(1024);
        let first = decoder.push(b"{oops").unwrap();
        assert_eq!(first.len(), 1);
        assert!(matches!(first[0], Err(RequestError::Malformed { .. })));
        assert_eq!(decoder.buffered(), 0);

        let second = decoder
            .push(b"}\n{\"action\":\"run\",\"taskName\":\"widgets\"}\n")
            .unwrap();
        assert_eq!(second, vec![Ok(run("widgets"))]);
    }

    #[test]
    fn test_decoder_reports_long_garbage_line_once() {
        let mut decoder = RequestDecoder::new(64);
        let garbage = [b'x'; 1024];

        assert_eq!(decoder.push(&garbage).unwrap().len(), 1);
        assert!(decoder.push(&garbage).unwrap().is_empty());
        assert!(decoder.push(&garbage).unwrap().is_empty());

        let decoded = decoder
            .push(b"xx\n{\"action\":\"status\",\"buildReference\":4}\n")
            .unwrap();
        assert_eq!(decoded, vec![Ok(Request::Status { run: RunId(4) })]);
    }

    #[test]
    fn test_decoder_rejects_oversized_request() {
        let mut decoder = RequestDecoder::new(16);
        let err = decoder
            .push(br#"{"action": "run", "taskName": "#)
            .unwrap_err();
        assert_eq!(err, RequestError::TooLarge { limit: 16 });
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_ignores_whitespace() {
        let mut decoder = RequestDecoder::new(16);
        assert!(decoder.push(b"  \r\n\t").unwrap().is_empty());
        assert_eq!(decoder.buffered(), 0);
    }
}
