//! Wire schema for the daemon socket.
//!
//! One newline-terminated JSON request per connection, answered by one
//! newline-terminated JSON response. Requests are tagged by `action`; an
//! unknown action or a missing field is rejected here, before any handler
//! runs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const MAX_REQUEST_BYTES: usize = 1024 * 1024;
pub const DEFAULT_SEARCH_LIMIT: usize = 20;
pub const MAX_SEARCH_LIMIT: usize = 1_000;
pub const MAX_COMMAND_BYTES: usize = 64 * 1024;

#[derive(Error, Debug, PartialEq)]
pub enum ProtocolError {
    #[error("request body was empty")]
    Empty,

    #[error("request exceeded {} bytes", MAX_REQUEST_BYTES)]
    TooLarge,

    #[error("request timed out")]
    Timeout,

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("failed to read request: {0}")]
    Io(String),
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> ProtocolError {
        ProtocolError::Io(e.to_string())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case", deny_unknown_fields)]
pub enum Request {
    #[serde(alias = "complete")]
    Suggest {
        partial: String,
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default)]
        history: Vec<String>,
    },
    LogCommand {
        command: String,
        exit_code: i32,
        #[serde(default)]
        duration: Option<f64>,
        cwd: String,
        #[serde(default)]
        session_id: Option<String>,
    },
    Search {
        query: String,
        #[serde(default = "default_search_limit")]
        limit: usize,
        #[serde(default)]
        format: SearchFormat,
        /// Only commands run in this directory or below.
        #[serde(default)]
        cwd: Option<String>,
    },
    Sequences {
        #[serde(default = "default_search_limit")]
        limit: usize,
    },
    Context {
        command_id: i64,
        #[serde(default = "default_context_window")]
        window: usize,
    },
    Ping,
    Status,
    Shutdown,
}

fn default_search_limit() -> usize {
    DEFAULT_SEARCH_LIMIT
}

fn default_context_window() -> usize {
    5
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SearchFormat {
    /// Bare command strings.
    #[default]
    Client,
    /// Full history records.
    Dashboard,
}

impl Request {
    pub fn action(&self) -> &'static str {
        match self {
            Request::Suggest { .. } => "suggest",
            Request::LogCommand { .. } => "log_command",
            Request::Search { .. } => "search",
            Request::Sequences { .. } => "sequences",
            Request::Context { .. } => "context",
            Request::Ping => "ping",
            Request::Status => "status",
            Request::Shutdown => "shutdown",
        }
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Request::LogCommand { command, cwd, duration, .. } => {
                if command.trim().is_empty() {
                    return Err(ProtocolError::Invalid("command is required".to_string()));
                }
                if command.len() > MAX_COMMAND_BYTES {
                    return Err(ProtocolError::Invalid(format!(
                        "command must be {} bytes or fewer",
                        MAX_COMMAND_BYTES
                    )));
                }
                if cwd.trim().is_empty() {
                    return Err(ProtocolError::Invalid("cwd is required".to_string()));
                }
                if let Some(d) = duration {
                    if !d.is_finite() || *d < 0.0 {
                        return Err(ProtocolError::Invalid(
                            "duration must be a non-negative number".to_string(),
                        ));
                    }
                }
            }
            Request::Search { limit, .. } | Request::Sequences { limit } => {
                if *limit == 0 || *limit > MAX_SEARCH_LIMIT {
                    return Err(ProtocolError::Invalid(format!(
                        "limit must be between 1 and {}",
                        MAX_SEARCH_LIMIT
                    )));
                }
            }
            Request::Suggest { partial, .. } => {
                if partial.len() > MAX_COMMAND_BYTES {
                    return Err(ProtocolError::Invalid("partial is too long".to_string()));
                }
            }
            Request::Context { .. } | Request::Ping | Request::Status | Request::Shutdown => {}
        }
        Ok(())
    }
}

/// Parse one framed request. Anything after the first newline is ignored.
pub fn decode_request(buffer: &[u8]) -> Result<Request, ProtocolError> {
    let line = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer,
    };
    if line.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ProtocolError::Empty);
    }
    let request: Request =
        serde_json::from_slice(line).map_err(|e| ProtocolError::Invalid(e.to_string()))?;
    request.validate()?;
    Ok(request)
}

pub fn encode_line<T: Serialize>(message: &T) -> serde_json::Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    Ok(bytes)
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    Error,
    Filtered,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Response {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Response {
    /// `data` must be a JSON object; its fields become top-level response
    /// fields next to `status`.
    pub fn ok(data: Value) -> Self {
        let body = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        Response {
            status: Status::Ok,
            error: None,
            reason: None,
            body,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Response {
            status: Status::Error,
            error: Some(message.into()),
            reason: None,
            body: Map::new(),
        }
    }

    pub fn filtered(reason: &str) -> Self {
        Response {
            status: Status::Filtered,
            error: None,
            reason: Some(reason.to_string()),
            body: Map::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_suggest_and_complete_alias() {
        let req = decode_request(br#"{"action":"suggest","partial":"git st","cwd":"/r"}"#).unwrap();
        assert_eq!(
            req,
            Request::Suggest {
                partial: "git st".to_string(),
                cwd: Some("/r".to_string()),
                history: vec![],
            }
        );
        let alias = decode_request(br#"{"action":"complete","partial":"ls","history":["cd /"]}"#)
            .unwrap();
        assert_eq!(alias.action(), "suggest");
    }

    #[test]
    fn decodes_unit_actions_and_ignores_trailing_bytes() {
        assert_eq!(decode_request(b"{\"action\":\"ping\"}\n").unwrap(), Request::Ping);
        assert_eq!(
            decode_request(b"{\"action\":\"shutdown\"}\ngarbage").unwrap(),
            Request::Shutdown
        );
    }

    #[test]
    fn search_defaults() {
        let req = decode_request(br#"{"action":"search","query":"make"}"#).unwrap();
        assert_eq!(
            req,
            Request::Search {
                query: "make".to_string(),
                limit: DEFAULT_SEARCH_LIMIT,
                format: SearchFormat::Client,
                cwd: None,
            }
        );
    }

    #[test]
    fn malformed_payloads_fail_fast() {
        assert_eq!(decode_request(b"  \n"), Err(ProtocolError::Empty));
        assert!(matches!(
            decode_request(br#"{"action":"teleport"}"#),
            Err(ProtocolError::Invalid(_))
        ));
        assert!(matches!(
            decode_request(br#"{"action":"log_command","command":"ls"}"#),
            Err(ProtocolError::Invalid(_))
        ));
        assert!(matches!(
            decode_request(br#"{"action":"log_command","command":" ","exit_code":0,"cwd":"/"}"#),
            Err(ProtocolError::Invalid(_))
        ));
        assert!(matches!(
            decode_request(br#"{"action":"search","query":"x","limit":0}"#),
            Err(ProtocolError::Invalid(_))
        ));
        assert!(matches!(
            decode_request(br#"{"action":"suggest","partial":"x","bogus":1}"#),
            Err(ProtocolError::Invalid(_))
        ));
    }

    #[test]
    fn response_flattens_payload() {
        let response = Response::ok(json!({"suggestions": []}));
        let wire = serde_json::to_value(&response).unwrap();
        assert_eq!(wire, json!({"status": "ok", "suggestions": []}));

        let filtered = serde_json::to_value(Response::filtered("privacy")).unwrap();
        assert_eq!(filtered, json!({"status": "filtered", "reason": "privacy"}));

        let error = serde_json::to_value(Response::error("boom")).unwrap();
        assert_eq!(error, json!({"status": "error", "error": "boom"}));
    }

    #[test]
    fn response_round_trips_through_line() {
        let line = encode_line(&Response::ok(json!({"pong": true}))).unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        let back: Response = serde_json::from_slice(&line[..line.len() - 1]).unwrap();
        assert_eq!(back.status, Status::Ok);
        assert_eq!(back.get("pong"), Some(&Value::Bool(true)));
    }
}
