//! Application messages carried inside frames.
//!
//! Inbound payloads are one of three shapes:
//! - heartbeat `~h~<n>`
//! - protocol descriptor, a JSON object carrying `session_id`
//! - named event `{"m": "<event>", "p": <payload>}`
//!
//! Outbound traffic is always a named event; [`Command`] builds each one the
//! remote understands.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::MessageError;
use crate::framing;

/// Prefix marking a keepalive payload
pub const HEARTBEAT_PREFIX: &str = "~h~";

/// Suffix that routes an event to [`ERROR_CHANNEL`]
pub const ERROR_SUFFIX: &str = "_error";

/// Router channel receiving every error-suffixed event
pub const ERROR_CHANNEL: &str = "error";

/// Token sent when no auth token is configured
pub const ANONYMOUS_TOKEN: &str = "unauthorized_user_token";

pub const SYMBOL_RESOLVED: &str = "symbol_resolved";
pub const TIMESCALE_UPDATE: &str = "timescale_update";
pub const DATA_UPDATE: &str = "du";
pub const QUOTE_DATA: &str = "qsd";
pub const QUOTE_COMPLETED: &str = "quote_completed";

/// Handshake-delivered description of the remote session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolDescriptor {
    pub session_id: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A decoded named event.
///
/// `name` is always the literal event name sent by the remote, also for
/// events delivered on [`ERROR_CHANNEL`].
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: String,
    pub payload: Value,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    /// Router channel this event is dispatched on
    pub fn channel(&self) -> &str {
        if self.is_error() {
            ERROR_CHANNEL
        } else {
            &self.name
        }
    }

    pub fn is_error(&self) -> bool {
        self.name.ends_with(ERROR_SUFFIX)
    }

    /// Positional payload element
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.payload.get(index)
    }

    /// Positional payload element as a string
    pub fn arg_str(&self, index: usize) -> Option<&str> {
        self.arg(index).and_then(Value::as_str)
    }

    /// Whether the leading payload elements equal `ids`, in order.
    ///
    /// Resources use this to pick their pushes out of a broadcast event.
    pub fn addressed_to(&self, ids: &[&str]) -> bool {
        ids.iter()
            .enumerate()
            .all(|(i, id)| self.arg_str(i) == Some(*id))
    }
}

#[derive(Deserialize)]
struct WireEvent {
    m: String,
    #[serde(default)]
    p: Value,
}

/// Classified inbound payload
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Keepalive token, kept verbatim so the echo is byte-identical
    Heartbeat(String),
    Descriptor(ProtocolDescriptor),
    Event(Event),
}

impl Inbound {
    /// Classify a frame payload.
    pub fn parse(payload: &str) -> Result<Self, MessageError> {
        if let Some(token) = payload.strip_prefix(HEARTBEAT_PREFIX) {
            if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
                return Err(MessageError::Heartbeat(token.to_string()));
            }
            return Ok(Inbound::Heartbeat(token.to_string()));
        }

        let value: Value = serde_json::from_str(payload)?;
        let Value::Object(ref object) = value else {
            return Err(MessageError::Shape(format!("expected object, got {value}")));
        };

        if object.contains_key("session_id") {
            return Ok(Inbound::Descriptor(serde_json::from_value(value)?));
        }
        if object.contains_key("m") {
            let WireEvent { m, p } = serde_json::from_value(value)?;
            return Ok(Inbound::Event(Event::new(m, p)));
        }
        Err(MessageError::Shape(format!("unrecognized object: {value}")))
    }
}

/// Framed heartbeat reply carrying the same token
pub fn heartbeat_frame(token: &str) -> String {
    framing::encode(&format!("{HEARTBEAT_PREFIX}{token}"))
}

/// Outbound named event
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: &'static str,
    pub params: Vec<Value>,
}

impl Command {
    pub fn new(name: &'static str, params: Vec<Value>) -> Self {
        Self { name, params }
    }

    /// JSON body `{"m": name, "p": params}`
    pub fn to_json(&self) -> String {
        json!({ "m": self.name, "p": self.params }).to_string()
    }

    /// Wire form, framed
    pub fn encode(&self) -> String {
        framing::encode(&self.to_json())
    }

    pub fn set_auth_token(token: &str) -> Self {
        Self::new("set_auth_token", vec![json!(token)])
    }

    pub fn set_locale(lang: &str, region: &str) -> Self {
        Self::new("set_locale", vec![json!(lang), json!(region)])
    }

    pub fn chart_create_session(chart_id: &str) -> Self {
        Self::new("chart_create_session", vec![json!(chart_id)])
    }

    pub fn chart_delete_session(chart_id: &str) -> Self {
        Self::new("chart_delete_session", vec![json!(chart_id)])
    }

    pub fn switch_timezone(chart_id: &str, timezone: &str) -> Self {
        Self::new("switch_timezone", vec![json!(chart_id), json!(timezone)])
    }

    /// `symbol` is `EXCHANGE:TICKER`
    pub fn resolve_symbol(chart_id: &str, ticket: &str, symbol: &str, adjustment: &str) -> Self {
        let spec = json!({ "adjustment": adjustment, "symbol": symbol });
        Self::new(
            "resolve_symbol",
            vec![json!(chart_id), json!(ticket), json!(format!("={spec}"))],
        )
    }

    pub fn create_series(
        chart_id: &str,
        series_id: &str,
        ticket: &str,
        timeframe: &str,
        bar_count: u32,
        range: &str,
    ) -> Self {
        Self::new(
            "create_series",
            vec![
                json!(chart_id),
                json!(series_id),
                json!("s1"),
                json!(ticket),
                json!(timeframe),
                json!(bar_count),
                json!(range),
            ],
        )
    }

    pub fn remove_series(chart_id: &str, series_id: &str) -> Self {
        Self::new("remove_series", vec![json!(chart_id), json!(series_id)])
    }

    pub fn create_study(
        chart_id: &str,
        study_id: &str,
        series_id: &str,
        study_type: &str,
        params: Value,
    ) -> Self {
        Self::new(
            "create_study",
            vec![
                json!(chart_id),
                json!(study_id),
                json!("st1"),
                json!(series_id),
                json!(study_type),
                params,
            ],
        )
    }

    /// Replace a live study's inputs; `params` has the `create_study` shape
    pub fn modify_study(chart_id: &str, study_id: &str, params: Value) -> Self {
        Self::new(
            "modify_study",
            vec![json!(chart_id), json!(study_id), json!("st1"), params],
        )
    }

    pub fn remove_study(chart_id: &str, study_id: &str) -> Self {
        Self::new("remove_study", vec![json!(chart_id), json!(study_id)])
    }

    pub fn quote_create_session(quote_id: &str) -> Self {
        Self::new("quote_create_session", vec![json!(quote_id)])
    }

    pub fn quote_delete_session(quote_id: &str) -> Self {
        Self::new("quote_delete_session", vec![json!(quote_id)])
    }

    pub fn quote_set_fields(quote_id: &str, fields: &[String]) -> Self {
        Self::with_list("quote_set_fields", quote_id, fields)
    }

    pub fn quote_add_symbols(quote_id: &str, symbols: &[String]) -> Self {
        Self::with_list("quote_add_symbols", quote_id, symbols)
    }

    pub fn quote_remove_symbols(quote_id: &str, symbols: &[String]) -> Self {
        Self::with_list("quote_remove_symbols", quote_id, symbols)
    }

    fn with_list(name: &'static str, id: &str, items: &[String]) -> Self {
        let mut params = Vec::with_capacity(items.len() + 1);
        params.push(json!(id));
        params.extend(items.iter().map(|item| json!(item)));
        Self::new(name, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_heartbeat() {
        assert_eq!(
            Inbound::parse("~h~42").unwrap(),
            Inbound::Heartbeat("42".to_string())
        );
        assert!(matches!(
            Inbound::parse("~h~x1"),
            Err(MessageError::Heartbeat(token)) if token == "x1"
        ));
        assert!(matches!(Inbound::parse("~h~"), Err(MessageError::Heartbeat(_))));
    }

    #[test]
    fn test_heartbeat_token_kept_verbatim() {
        assert_eq!(
            Inbound::parse("~h~007").unwrap(),
            Inbound::Heartbeat("007".to_string())
        );
        let wide = "123456789012345678901234567890";
        assert_eq!(
            Inbound::parse(&format!("~h~{wide}")).unwrap(),
            Inbound::Heartbeat(wide.to_string())
        );
        assert_eq!(heartbeat_frame("007"), "~m~6~m~~h~007");
    }

    #[test]
    fn test_parse_descriptor() {
        let raw = r#"{"session_id":"<0.123.456>_abc","timestamp":1700000000,"release":"registry.example/prod-1","protocol":"json","javastudies":["3.66"]}"#;
        match Inbound::parse(raw).unwrap() {
            Inbound::Descriptor(descriptor) => {
                assert_eq!(descriptor.session_id, "<0.123.456>_abc");
                assert_eq!(descriptor.protocol, "json");
                assert_eq!(descriptor.extra["timestamp"], 1700000000);
            }
            other => panic!("Expected Descriptor, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_event() {
        let raw = r#"{"m":"timescale_update","p":["chart_1",{"series_3":{"s":[]}}]}"#;
        match Inbound::parse(raw).unwrap() {
            Inbound::Event(event) => {
                assert_eq!(event.name, TIMESCALE_UPDATE);
                assert_eq!(event.channel(), TIMESCALE_UPDATE);
                assert_eq!(event.arg_str(0), Some("chart_1"));
                assert!(event.arg(1).unwrap()["series_3"]["s"].is_array());
            }
            other => panic!("Expected Event, got {:?}", other),
        }
    }

    #[test]
    fn test_error_suffix_maps_to_error_channel() {
        let event = Event::new("critical_error", json!(["boom"]));
        assert!(event.is_error());
        assert_eq!(event.channel(), ERROR_CHANNEL);
        assert_eq!(event.name, "critical_error");

        let event = Event::new("errors_seen", json!([]));
        assert!(!event.is_error());
        assert_eq!(event.channel(), "errors_seen");
    }

    #[test]
    fn test_parse_rejects_unknown_shapes() {
        assert!(matches!(Inbound::parse("not json"), Err(MessageError::Json(_))));
        assert!(matches!(Inbound::parse("[1,2]"), Err(MessageError::Shape(_))));
        assert!(matches!(
            Inbound::parse(r#"{"foo":1}"#),
            Err(MessageError::Shape(_))
        ));
    }

    #[test]
    fn test_addressed_to() {
        let event = Event::new(SYMBOL_RESOLVED, json!(["chart_1", "sds_sym_2", {}]));
        assert!(event.addressed_to(&["chart_1"]));
        assert!(event.addressed_to(&["chart_1", "sds_sym_2"]));
        assert!(!event.addressed_to(&["chart_1", "sds_sym_3"]));
        assert!(!event.addressed_to(&["chart_2"]));
        assert!(!Event::new("x", json!({})).addressed_to(&["chart_1"]));
    }

    #[test]
    fn test_heartbeat_frame() {
        assert_eq!(heartbeat_frame("42"), "~m~5~m~~h~42");
    }

    #[test]
    fn test_command_wire_shapes() {
        assert_eq!(
            Command::set_auth_token(ANONYMOUS_TOKEN).to_json(),
            r#"{"m":"set_auth_token","p":["unauthorized_user_token"]}"#
        );
        assert_eq!(
            Command::set_locale("en", "US").to_json(),
            r#"{"m":"set_locale","p":["en","US"]}"#
        );
        assert_eq!(
            Command::resolve_symbol("chart_1", "sds_sym_2", "BINANCE:BTCUSDT", "splits").to_json(),
            r#"{"m":"resolve_symbol","p":["chart_1","sds_sym_2","={\"adjustment\":\"splits\",\"symbol\":\"BINANCE:BTCUSDT\"}"]}"#
        );
        assert_eq!(
            Command::create_series("chart_1", "series_3", "sds_sym_2", "1", 10, "").to_json(),
            r#"{"m":"create_series","p":["chart_1","series_3","s1","sds_sym_2","1",10,""]}"#
        );
        assert_eq!(
            Command::quote_add_symbols("qs_4", &["NASDAQ:AAPL".to_string()]).to_json(),
            r#"{"m":"quote_add_symbols","p":["qs_4","NASDAQ:AAPL"]}"#
        );
    }

    #[test]
    fn test_command_encode_is_framed() {
        let command = Command::chart_create_session("chart_1");
        let body = command.to_json();
        assert_eq!(command.encode(), format!("~m~{}~m~{}", body.len(), body));
    }
}
