use serde_json::Value;
use thiserror::Error;

/// Malformed wire frame. Fatal to the session reader loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("expected frame delimiter at offset {0}")]
    MissingDelimiter(usize),
    #[error("invalid length marker: {0:?}")]
    InvalidLength(String),
    #[error("frame length {0} exceeds limit {1}")]
    TooLarge(usize, usize),
}

/// Frame payload that is neither a heartbeat, a protocol descriptor, nor an event.
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("invalid heartbeat token: {0}")]
    Heartbeat(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected payload shape: {0}")]
    Shape(String),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("invalid utf-8 in binary message: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("transport closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors surfaced to callers of the session and its resources.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),
    #[error("session closed")]
    Closed,
    #[error("timed out after {0} seconds")]
    Timeout(u64),
    #[error("remote error on {event}: {payload}")]
    Protocol { event: String, payload: Value },
    #[error("failed to decode {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FrameError::InvalidLength("abc".to_string());
        assert_eq!(err.to_string(), "invalid length marker: \"abc\"");

        let err = SessionError::Protocol {
            event: "symbol_error".to_string(),
            payload: serde_json::json!(["chart_1", "sds_sym_2", "invalid symbol"]),
        };
        assert_eq!(
            err.to_string(),
            r#"remote error on symbol_error: ["chart_1","sds_sym_2","invalid symbol"]"#
        );

        assert_eq!(SessionError::Timeout(5).to_string(), "timed out after 5 seconds");
    }

    #[test]
    fn test_frame_error_converts_into_session_error() {
        let err: SessionError = FrameError::MissingDelimiter(0).into();
        assert!(matches!(err, SessionError::Frame(FrameError::MissingDelimiter(0))));
    }
}
