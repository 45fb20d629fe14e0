//! Quote sessions: live field snapshots for a set of symbols.
//!
//! The remote pushes `qsd` with `[quote_id, {n, s, v}]`, where `v` carries
//! only the fields that changed. Updates are merged into one snapshot per
//! symbol. `quote_completed` marks a symbol's initial snapshot as complete.
//!
//! Fundamentals arrive as history arrays, one field per metric and period
//! (`total_revenue_fy_h`, `total_revenue_fq_h`), aligned with
//! `fiscal_period_end_fy_h` / `fiscal_period_end_fq_h`. [`Quote::reports`]
//! turns those columns into one [`Report`] row per fiscal period.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::error::SessionError;
use crate::message::{Command, Event, QUOTE_COMPLETED, QUOTE_DATA};
use crate::router::{Lease, Subscription};
use crate::session::Session;

const QUOTE_PREFIX: &str = "quote";
const STATUS_OK: &str = "ok";

/// Fields requested when the caller does not pick any
pub const DEFAULT_FIELDS: &[&str] = &[
    "lp",
    "ch",
    "chp",
    "volume",
    "bid",
    "ask",
    "open_price",
    "high_price",
    "low_price",
    "prev_close_price",
    "currency_code",
    "description",
    "exchange",
    "type",
];

/// Fundamental metrics requested by [`fetch_reports`]
pub const REPORT_METRICS: &[&str] = &[
    "total_revenue",
    "gross_profit",
    "gross_margin",
    "oper_income",
    "net_income",
    "earnings_per_share_basic",
    "total_assets",
    "total_equity",
    "total_debt",
    "cash_n_equivalents",
    "free_cash_flow",
    "total_shares_outstanding",
];

/// Period-end column the report rows are aligned with
const FISCAL_PERIOD_END: &str = "fiscal_period_end";

/// Fiscal period a report covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportPeriod {
    Annual,
    Quarterly,
}

impl ReportPeriod {
    /// Field-name suffix of this period's history arrays
    pub fn suffix(self) -> &'static str {
        match self {
            ReportPeriod::Annual => "_fy_h",
            ReportPeriod::Quarterly => "_fq_h",
        }
    }

    /// Quote fields carrying `metric` for this period
    pub fn field(self, metric: &str) -> String {
        format!("{metric}{}", self.suffix())
    }
}

/// Financial figures for one fiscal period of one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    #[serde(rename = "type")]
    pub period: ReportPeriod,
    /// Period end, `YYYY-MM-DD`
    pub date: String,
    /// Ticker without the exchange prefix
    pub symbol: String,
    #[serde(flatten)]
    pub values: BTreeMap<String, f64>,
}

impl Report {
    pub fn value(&self, metric: &str) -> Option<f64> {
        self.values.get(metric).copied()
    }
}

/// Quote fields for `metrics` over both periods, plus the period ends.
pub fn report_fields(metrics: &[&str]) -> Vec<String> {
    [ReportPeriod::Annual, ReportPeriod::Quarterly]
        .into_iter()
        .flat_map(|period| {
            std::iter::once(FISCAL_PERIOD_END)
                .chain(metrics.iter().copied())
                .map(move |metric| period.field(metric))
        })
        .collect()
}

/// One `qsd` push
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteUpdate {
    #[serde(rename = "n")]
    pub symbol: String,
    #[serde(rename = "s")]
    pub status: String,
    #[serde(rename = "v", default)]
    pub values: Map<String, Value>,
}

/// Merged field values for one symbol
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Quote {
    pub symbol: String,
    pub status: String,
    pub values: Map<String, Value>,
    /// Initial snapshot delivered
    pub complete: bool,
}

impl Quote {
    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.field(name).and_then(Value::as_f64)
    }

    /// Last traded price
    pub fn last_price(&self) -> Option<f64> {
        self.number("lp")
    }

    /// Annual rows followed by quarterly rows, in the order the remote lists
    /// the periods. Periods without a usable end date are skipped.
    pub fn reports(&self) -> Vec<Report> {
        let ticker = self
            .symbol
            .split_once(':')
            .map_or(self.symbol.as_str(), |(_, ticker)| ticker);
        [ReportPeriod::Annual, ReportPeriod::Quarterly]
            .into_iter()
            .flat_map(|period| self.period_reports(period, ticker))
            .collect()
    }

    fn period_reports(&self, period: ReportPeriod, ticker: &str) -> Vec<Report> {
        let suffix = period.suffix();
        let Some(ends) = self
            .field(&period.field(FISCAL_PERIOD_END))
            .and_then(Value::as_array)
        else {
            return Vec::new();
        };
        let columns: Vec<(&str, &Vec<Value>)> = self
            .values
            .iter()
            .filter_map(|(key, value)| {
                let metric = key.strip_suffix(suffix)?;
                if metric == FISCAL_PERIOD_END {
                    return None;
                }
                Some((metric, value.as_array()?))
            })
            .collect();

        ends.iter()
            .enumerate()
            .filter_map(|(row, end)| {
                let date = end
                    .as_i64()
                    .and_then(|secs| Utc.timestamp_opt(secs, 0).single())?
                    .format("%Y-%m-%d")
                    .to_string();
                let values = columns
                    .iter()
                    .filter_map(|(metric, column)| {
                        Some((metric.to_string(), column.get(row)?.as_f64()?))
                    })
                    .collect();
                Some(Report {
                    period,
                    date,
                    symbol: ticker.to_string(),
                    values,
                })
            })
            .collect()
    }

    fn apply(&mut self, update: QuoteUpdate) {
        self.status = update.status;
        self.values.extend(update.values);
    }
}

type Book = HashMap<String, Quote>;

#[derive(Debug)]
pub struct QuoteSession {
    session: Session,
    id: String,
    book: Arc<watch::Sender<Book>>,
    listeners: Vec<Subscription>,
    lease: Option<Lease>,
}

impl QuoteSession {
    /// Create a quote session reporting `fields`.
    pub fn create(session: &Session, fields: &[&str]) -> Result<Self, SessionError> {
        let id = session.mint_id(QUOTE_PREFIX);
        let lease = session.lease();
        let book: Arc<watch::Sender<Book>> = Arc::new(watch::channel(Book::new()).0);

        let data = {
            let (id, book) = (id.clone(), Arc::clone(&book));
            session.on(QUOTE_DATA, move |event: &Event| {
                let Some(update) = decode_update(event, &id) else {
                    return;
                };
                trace!(quote_id = %id, symbol = %update.symbol, fields = update.values.len(), "Quote update");
                book.send_modify(|book| {
                    book.entry(update.symbol.clone())
                        .or_insert_with(|| Quote {
                            symbol: update.symbol.clone(),
                            ..Quote::default()
                        })
                        .apply(update);
                });
            })
        };
        let completed = {
            let (id, book) = (id.clone(), Arc::clone(&book));
            session.on(QUOTE_COMPLETED, move |event: &Event| {
                if !event.addressed_to(&[id.as_str()]) {
                    return;
                }
                let Some(symbol) = event.arg_str(1) else {
                    return;
                };
                book.send_modify(|book| {
                    book.entry(symbol.to_string())
                        .or_insert_with(|| Quote {
                            symbol: symbol.to_string(),
                            ..Quote::default()
                        })
                        .complete = true;
                });
            })
        };

        let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
        session.send(Command::quote_create_session(&id))?;
        session.send(Command::quote_set_fields(&id, &fields))?;
        debug!(quote_id = %id, fields = fields.len(), "Quote session created");

        Ok(Self {
            session: session.clone(),
            id,
            book,
            listeners: vec![data, completed],
            lease: Some(lease),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Subscribe to `EXCHANGE:TICKER` symbols
    pub fn add_symbols(&self, symbols: &[&str]) -> Result<(), SessionError> {
        let symbols: Vec<String> = symbols.iter().map(|s| s.to_string()).collect();
        self.session
            .send(Command::quote_add_symbols(&self.id, &symbols))
    }

    /// Unsubscribe and forget the symbols' snapshots
    pub fn remove_symbols(&self, symbols: &[&str]) -> Result<(), SessionError> {
        let owned: Vec<String> = symbols.iter().map(|s| s.to_string()).collect();
        self.session
            .send(Command::quote_remove_symbols(&self.id, &owned))?;
        self.book.send_modify(|book| {
            for symbol in symbols {
                book.remove(*symbol);
            }
        });
        Ok(())
    }

    pub fn snapshot(&self, symbol: &str) -> Option<Quote> {
        self.book.borrow().get(symbol).cloned()
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.book.borrow().keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Wait until `symbol`'s initial snapshot is complete.
    ///
    /// Fails with `Protocol` if the remote reports a non-`ok` status for it.
    pub async fn wait_for(&self, symbol: &str) -> Result<Quote, SessionError> {
        let mut rx = self.book.subscribe();
        let symbol = symbol.to_string();
        self.session
            .await_reply(async move {
                let book = rx
                    .wait_for(|book| {
                        book.get(&symbol)
                            .is_some_and(|q| q.complete || (!q.status.is_empty() && !q.is_ok()))
                    })
                    .await
                    .map_err(|_| SessionError::Closed)?;
                let quote = book.get(&symbol).cloned().unwrap_or_default();
                if !quote.status.is_empty() && !quote.is_ok() {
                    return Err(SessionError::Protocol {
                        event: QUOTE_DATA.to_string(),
                        payload: Value::Object(quote.values),
                    });
                }
                Ok(quote)
            })
            .await
    }

    /// Wait for `symbol`'s snapshot and split it into fiscal-period reports.
    ///
    /// The session must have been created with [`report_fields`].
    pub async fn reports(&self, symbol: &str) -> Result<Vec<Report>, SessionError> {
        Ok(self.wait_for(symbol).await?.reports())
    }

    /// Invoke `callback` with every raw update for this quote session.
    pub fn on_update<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&QuoteUpdate) + Send + Sync + 'static,
    {
        let id = self.id.clone();
        self.session.on(QUOTE_DATA, move |event: &Event| {
            if let Some(update) = decode_update(event, &id) {
                callback(&update);
            }
        })
    }

    /// Stop listening. Sends `quote_delete_session` only when remote
    /// teardown is configured. Idempotent.
    pub fn close(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        self.listeners.clear();
        if self.session.config().remote_teardown && self.session.is_open() {
            if let Err(e) = self.session.send(Command::quote_delete_session(&self.id)) {
                warn!(quote_id = %self.id, error = %e, "Failed to send quote teardown");
            }
        }
        debug!(quote_id = %self.id, "Quote session closed");
        drop(lease);
    }
}

impl Drop for QuoteSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Annual and quarterly reports for `exchange:symbol` on a short-lived
/// quote session.
///
/// Fails with `Protocol` when the remote rejects the symbol.
pub async fn fetch_reports(
    session: &Session,
    symbol: &str,
    exchange: &str,
) -> Result<Vec<Report>, SessionError> {
    let fields = report_fields(REPORT_METRICS);
    let fields: Vec<&str> = fields.iter().map(String::as_str).collect();
    let quotes = QuoteSession::create(session, &fields)?;

    let pro_name = format!("{exchange}:{symbol}");
    quotes.add_symbols(&[pro_name.as_str()])?;
    let reports = quotes.reports(&pro_name).await?;
    debug!(symbol = %pro_name, reports = reports.len(), "Fetched financial reports");
    Ok(reports)
}

fn decode_update(event: &Event, quote_id: &str) -> Option<QuoteUpdate> {
    if !event.addressed_to(&[quote_id]) {
        return None;
    }
    match serde_json::from_value(event.arg(1)?.clone()) {
        Ok(update) => Some(update),
        Err(e) => {
            warn!(quote_id = %quote_id, error = %e, "Dropping undecodable quote update");
            None
        }
    }
}
