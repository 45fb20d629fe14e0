//! Indicator studies attached to a series.
//!
//! Parameters are positional: the k-th declared parameter is sent as
//! `in_<k>: {v, f: true, t}`. Nothing is validated locally; a wrong order or
//! count is accepted by the remote and shows up as missing output.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::feed::{self, BatchSubscription, Bar, Feed, Route};
use crate::message::{Command, DATA_UPDATE};
use crate::router::Lease;
use crate::series::Series;
use crate::session::Session;

/// Study type id for user Pine scripts
pub const SCRIPT_STUDY: &str = "Script@tv-scripting-101!";

const STUDY_PREFIX: &str = "study";
const STUDY_ROWS: &str = "st";
const STUDY_ERROR: &str = "study_error";
const STUDY_CHANNELS: &[&str] = &[DATA_UPDATE];

/// One typed study input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum StudyParam {
    Integer(i64),
    Float(f64),
    Text(String),
    Bool(bool),
    /// Price source such as `close` or `hl2`
    Source(String),
    Symbol(String),
    /// Unix milliseconds
    Time(i64),
    Resolution(String),
}

impl StudyParam {
    pub fn type_name(&self) -> &'static str {
        match self {
            StudyParam::Integer(_) => "integer",
            StudyParam::Float(_) => "float",
            StudyParam::Text(_) => "text",
            StudyParam::Bool(_) => "bool",
            StudyParam::Source(_) => "source",
            StudyParam::Symbol(_) => "symbol",
            StudyParam::Time(_) => "time",
            StudyParam::Resolution(_) => "resolution",
        }
    }

    pub fn value(&self) -> Value {
        match self {
            StudyParam::Integer(v) | StudyParam::Time(v) => json!(v),
            StudyParam::Float(v) => json!(v),
            StudyParam::Bool(v) => json!(v),
            StudyParam::Text(v)
            | StudyParam::Source(v)
            | StudyParam::Symbol(v)
            | StudyParam::Resolution(v) => json!(v),
        }
    }

    /// Wire form of one input
    pub fn to_input(&self) -> Value {
        json!({ "v": self.value(), "f": true, "t": self.type_name() })
    }
}

/// What to create: study type, free-form metadata and ordered inputs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StudySpec {
    pub id: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub parameters: Vec<StudyParam>,
}

impl StudySpec {
    /// Built-in indicator, e.g. `Volume@tv-basicstudies-144`
    pub fn builtin(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// User script; `text` is the compiled script body
    pub fn script(text: impl Into<String>) -> Self {
        Self::builtin(SCRIPT_STUDY).meta("text", Value::String(text.into()))
    }

    pub fn pine_id(self, pine_id: impl Into<String>) -> Self {
        self.meta("pineId", Value::String(pine_id.into()))
    }

    pub fn pine_version(self, version: impl Into<String>) -> Self {
        self.meta("pineVersion", Value::String(version.into()))
    }

    pub fn meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn param(mut self, param: StudyParam) -> Self {
        self.parameters.push(param);
        self
    }

    /// Parameter object sent with `create_study`: metadata plus `in_<k>`
    /// entries in declaration order.
    pub fn encode(&self) -> Value {
        let mut object = self.metadata.clone();
        for (k, param) in self.parameters.iter().enumerate() {
            object.insert(format!("in_{k}"), param.to_input());
        }
        Value::Object(object)
    }
}

#[derive(Debug)]
pub struct Study {
    session: Session,
    route: Route,
    series_id: String,
    spec: StudySpec,
    feed: Feed,
    listeners: BatchSubscription,
    lease: Option<Lease>,
}

impl Study {
    /// Attach `spec` to `series` and start buffering its output.
    pub fn create(series: &Series, spec: StudySpec) -> Result<Self, SessionError> {
        let session = series.session().clone();
        let route = Route {
            chart_id: series.chart_id().to_string(),
            resource_id: session.mint_id(STUDY_PREFIX),
            key: STUDY_ROWS,
            channels: STUDY_CHANNELS,
            error_event: STUDY_ERROR,
        };

        let lease = session.lease();
        let feed = Feed::new();
        let listeners = feed::attach(&session, &route, &feed);

        session.send(Command::create_study(
            &route.chart_id,
            &route.resource_id,
            series.id(),
            &spec.id,
            spec.encode(),
        ))?;
        debug!(
            chart_id = %route.chart_id,
            study_id = %route.resource_id,
            series_id = %series.id(),
            study = %spec.id,
            inputs = spec.parameters.len(),
            "Study created"
        );

        Ok(Self {
            session,
            route,
            series_id: series.id().to_string(),
            spec,
            feed,
            listeners,
            lease: Some(lease),
        })
    }

    pub fn id(&self) -> &str {
        &self.route.resource_id
    }

    pub fn chart_id(&self) -> &str {
        &self.route.chart_id
    }

    pub fn series_id(&self) -> &str {
        &self.series_id
    }

    pub fn spec(&self) -> &StudySpec {
        &self.spec
    }

    pub fn history(&self) -> Vec<Bar> {
        self.feed.history()
    }

    pub fn len(&self) -> usize {
        self.feed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> std::vec::IntoIter<Bar> {
        self.history().into_iter()
    }

    pub async fn ready(&self) -> Result<(), SessionError> {
        self.feed.ready(&self.session).await
    }

    pub async fn next_batch(&self) -> Result<Vec<Bar>, SessionError> {
        self.feed.next_batch(&self.session).await
    }

    pub fn on_batch<F>(&self, callback: F) -> BatchSubscription
    where
        F: Fn(&[Bar]) + Send + Sync + 'static,
    {
        feed::watch_batches(&self.session, &self.route, move |batch| callback(&batch))
    }

    /// Send new inputs for this study, keeping its type and metadata.
    ///
    /// Output already buffered stays; rows computed with the new inputs
    /// arrive as further batches.
    pub fn modify(&mut self, parameters: Vec<StudyParam>) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let spec = StudySpec {
            parameters,
            ..self.spec.clone()
        };
        self.session.send(Command::modify_study(
            &self.route.chart_id,
            &self.route.resource_id,
            spec.encode(),
        ))?;
        debug!(
            study_id = %self.route.resource_id,
            inputs = spec.parameters.len(),
            "Study modified"
        );
        self.spec = spec;
        Ok(())
    }

    /// Stop listening. Sends `remove_study` only when remote teardown is
    /// configured. Idempotent.
    pub fn close(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        self.listeners.cancel();
        if self.session.config().remote_teardown && self.session.is_open() {
            let command = Command::remove_study(&self.route.chart_id, &self.route.resource_id);
            if let Err(e) = self.session.send(command) {
                warn!(study_id = %self.route.resource_id, error = %e, "Failed to send study teardown");
            }
        }
        debug!(study_id = %self.route.resource_id, rows = self.len(), "Study closed");
        drop(lease);
    }

    pub fn is_closed(&self) -> bool {
        self.lease.is_none()
    }
}

impl Drop for Study {
    fn drop(&mut self) {
        self.close();
    }
}

impl<'a> IntoIterator for &'a Study {
    type Item = Bar;
    type IntoIter = std::vec::IntoIter<Bar>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_encode_positionally() {
        let spec = StudySpec::builtin("RSI@tv-basicstudies-241")
            .param(StudyParam::Integer(14))
            .param(StudyParam::Source("close".into()))
            .param(StudyParam::Bool(false));

        assert_eq!(
            spec.encode(),
            json!({
                "in_0": {"v": 14, "f": true, "t": "integer"},
                "in_1": {"v": "close", "f": true, "t": "source"},
                "in_2": {"v": false, "f": true, "t": "bool"}
            })
        );
    }

    #[test]
    fn test_script_metadata() {
        let spec = StudySpec::script("bmI9Rm...")
            .pine_id("PUB;abc")
            .pine_version("3.0")
            .param(StudyParam::Resolution("60".into()))
            .param(StudyParam::Float(2.5));

        let encoded = spec.encode();
        assert_eq!(spec.id, SCRIPT_STUDY);
        assert_eq!(encoded["text"], "bmI9Rm...");
        assert_eq!(encoded["pineId"], "PUB;abc");
        assert_eq!(encoded["pineVersion"], "3.0");
        assert_eq!(encoded["in_0"], json!({"v": "60", "f": true, "t": "resolution"}));
        assert_eq!(encoded["in_1"], json!({"v": 2.5, "f": true, "t": "float"}));
    }

    #[test]
    fn test_param_serde_is_type_value() {
        let param = StudyParam::Time(1_700_000_000_000);
        assert_eq!(
            serde_json::to_value(&param).unwrap(),
            json!({"type": "time", "value": 1_700_000_000_000i64})
        );
        let back: StudyParam =
            serde_json::from_value(json!({"type": "symbol", "value": "NASDAQ:AAPL"})).unwrap();
        assert_eq!(back, StudyParam::Symbol("NASDAQ:AAPL".into()));
    }

    #[test]
    fn test_spec_from_yaml() {
        let spec: StudySpec = serde_yaml::from_str(
            "id: EMA@tv-basicstudies-241\nparameters:\n  - type: integer\n    value: 9\n",
        )
        .unwrap();
        assert_eq!(spec.parameters, vec![StudyParam::Integer(9)]);
        assert!(spec.metadata.is_empty());
    }
}
