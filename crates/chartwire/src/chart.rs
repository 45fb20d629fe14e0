//! Chart sessions and symbol resolution.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::message::{Command, Event, SYMBOL_RESOLVED};
use crate::router::Lease;
use crate::series::{Series, DEFAULT_BAR_COUNT};
use crate::session::{ReplySlot, Session};

const CHART_PREFIX: &str = "chart";
const TICKET_PREFIX: &str = "sds_sym";
const SYMBOL_ERROR: &str = "symbol_error";

/// Symbol descriptor delivered by `symbol_resolved`.
///
/// Only the commonly used fields are typed; everything else the remote
/// sends is kept in `extra`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SymbolInfo {
    #[serde(default)]
    pub name: String,
    /// Canonical `EXCHANGE:TICKER`
    #[serde(default)]
    pub pro_name: String,
    #[serde(default)]
    pub exchange: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "type")]
    pub instrument_type: String,
    #[serde(default)]
    pub is_tradable: bool,
    #[serde(default)]
    pub currency_code: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A resolved symbol: the ticket series are created against, plus its descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSymbol {
    pub ticket: String,
    pub info: SymbolInfo,
}

/// A chart session on the remote. Series and studies live inside one.
#[derive(Debug)]
pub struct Chart {
    session: Session,
    id: String,
    lease: Option<Lease>,
}

impl Chart {
    /// Mint an id and send `chart_create_session` right away.
    pub fn create(session: &Session) -> Result<Self, SessionError> {
        let id = session.mint_id(CHART_PREFIX);
        let lease = session.lease();
        session.send(Command::chart_create_session(&id))?;
        debug!(chart_id = %id, "Chart created");
        Ok(Self {
            session: session.clone(),
            id,
            lease: Some(lease),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn switch_timezone(&self, timezone: &str) -> Result<(), SessionError> {
        self.session
            .send(Command::switch_timezone(&self.id, timezone))
    }

    /// Resolve `exchange:symbol` within this chart.
    ///
    /// Completes on the `symbol_resolved` push carrying this request's
    /// ticket, or fails on a matching `symbol_error`. Bounded by the session's
    /// request timeout when one is configured.
    pub async fn resolve(&self, symbol: &str, exchange: &str) -> Result<ResolvedSymbol, SessionError> {
        let ticket = self.session.mint_id(TICKET_PREFIX);
        let (slot, reply) = ReplySlot::<Result<Value, SessionError>>::new();

        let _resolved = {
            let slot = slot.clone();
            let (chart_id, ticket) = (self.id.clone(), ticket.clone());
            self.session.on(SYMBOL_RESOLVED, move |event: &Event| {
                if event.addressed_to(&[chart_id.as_str(), ticket.as_str()]) {
                    slot.fill(Ok(event.arg(2).cloned().unwrap_or(Value::Null)));
                }
            })
        };
        let _failed = {
            let (chart_id, ticket) = (self.id.clone(), ticket.clone());
            self.session.on_error(move |event: &Event| {
                if event.name == SYMBOL_ERROR && event.addressed_to(&[chart_id.as_str(), ticket.as_str()]) {
                    slot.fill(Err(SessionError::Protocol {
                        event: event.name.clone(),
                        payload: event.payload.clone(),
                    }));
                }
            })
        };

        let full_name = format!("{exchange}:{symbol}");
        debug!(chart_id = %self.id, ticket = %ticket, symbol = %full_name, "Resolving symbol");
        self.session.send(Command::resolve_symbol(
            &self.id,
            &ticket,
            &full_name,
            &self.session.config().symbol_adjustment,
        ))?;

        let descriptor = self
            .session
            .await_reply(async { reply.await.map_err(|_| SessionError::Closed)? })
            .await?;
        let info: SymbolInfo = serde_json::from_value(descriptor).map_err(|source| {
            SessionError::Decode {
                what: "symbol descriptor",
                source,
            }
        })?;
        debug!(ticket = %ticket, pro_name = %info.pro_name, "Symbol resolved");
        Ok(ResolvedSymbol { ticket, info })
    }

    /// Create a series with the default bar count and range.
    pub fn create_series(&self, symbol: &ResolvedSymbol, timeframe: &str) -> Result<Series, SessionError> {
        Series::create(self, symbol, timeframe, DEFAULT_BAR_COUNT)
    }

    /// Stop using the chart. Sends `chart_delete_session` only when remote
    /// teardown is configured. Idempotent.
    pub fn close(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        if self.session.config().remote_teardown && self.session.is_open() {
            if let Err(e) = self.session.send(Command::chart_delete_session(&self.id)) {
                warn!(chart_id = %self.id, error = %e, "Failed to send chart teardown");
            }
        }
        debug!(chart_id = %self.id, "Chart closed");
        drop(lease);
    }

    pub fn is_closed(&self) -> bool {
        self.lease.is_none()
    }
}

impl Drop for Chart {
    fn drop(&mut self) {
        self.close();
    }
}
