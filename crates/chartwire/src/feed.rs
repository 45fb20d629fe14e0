//! Batch buffer shared by series and studies.
//!
//! Every matching push appends one batch to an append-only history. Waiters
//! observe the buffer through a watch channel, so a batch that lands between
//! a resource's creation and the first `next_batch` call is never missed.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{trace, warn};

use crate::error::SessionError;
use crate::message::Event;
use crate::router::Subscription;
use crate::session::Session;

/// One row of a series or study batch: `{i, v: [time, ...values]}`.
///
/// For series rows the values are `[time, open, high, low, close, volume]`;
/// for studies they are `[time, plot_0, plot_1, ...]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    #[serde(rename = "i")]
    pub index: i64,
    #[serde(rename = "v")]
    pub values: Vec<Option<f64>>,
}

impl Bar {
    pub fn value(&self, position: usize) -> Option<f64> {
        self.values.get(position).copied().flatten()
    }

    /// Bar open time in unix seconds
    pub fn timestamp(&self) -> Option<i64> {
        self.value(0).map(|t| t as i64)
    }

    pub fn time(&self) -> Option<DateTime<Utc>> {
        self.timestamp()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
    }

    pub fn open(&self) -> Option<f64> {
        self.value(1)
    }

    pub fn high(&self) -> Option<f64> {
        self.value(2)
    }

    pub fn low(&self) -> Option<f64> {
        self.value(3)
    }

    pub fn close(&self) -> Option<f64> {
        self.value(4)
    }

    pub fn volume(&self) -> Option<f64> {
        self.value(5)
    }

    /// Study plot output, zero-based after the time column
    pub fn plot(&self, index: usize) -> Option<f64> {
        self.value(index + 1)
    }
}

/// Remote error pushed for this resource
#[derive(Debug, Clone)]
pub(crate) struct Fault {
    event: String,
    payload: Value,
}

impl Fault {
    fn to_error(&self) -> SessionError {
        SessionError::Protocol {
            event: self.event.clone(),
            payload: self.payload.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct FeedState {
    history: Vec<Bar>,
    /// Offset into `history` where each batch begins
    batch_starts: Vec<usize>,
    fault: Option<Fault>,
}

impl FeedState {
    fn batch(&self, n: usize) -> Option<Vec<Bar>> {
        let start = *self.batch_starts.get(n)?;
        let end = self
            .batch_starts
            .get(n + 1)
            .copied()
            .unwrap_or(self.history.len());
        Some(self.history[start..end].to_vec())
    }
}

/// Append-only batch buffer with async waits.
#[derive(Debug, Clone)]
pub(crate) struct Feed {
    state: Arc<watch::Sender<FeedState>>,
}

impl Feed {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(watch::channel(FeedState::default()).0),
        }
    }

    pub(crate) fn push(&self, batch: Vec<Bar>) {
        self.state.send_modify(|state| {
            state.batch_starts.push(state.history.len());
            state.history.extend(batch);
        });
    }

    pub(crate) fn fail(&self, event: &Event) {
        self.state.send_modify(|state| {
            state.fault.get_or_insert(Fault {
                event: event.name.clone(),
                payload: event.payload.clone(),
            });
        });
    }

    pub(crate) fn history(&self) -> Vec<Bar> {
        self.state.borrow().history.clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.state.borrow().history.len()
    }

    pub(crate) fn batches(&self) -> usize {
        self.state.borrow().batch_starts.len()
    }

    pub(crate) fn last(&self) -> Option<Bar> {
        self.state.borrow().history.last().cloned()
    }

    /// Wait until at least one batch is buffered.
    pub(crate) async fn ready(&self, session: &Session) -> Result<(), SessionError> {
        self.wait_for_batch(session, 0).await.map(|_| ())
    }

    /// Wait for the first batch that arrives after this call.
    pub(crate) async fn next_batch(&self, session: &Session) -> Result<Vec<Bar>, SessionError> {
        let seen = self.batches();
        self.wait_for_batch(session, seen).await
    }

    async fn wait_for_batch(&self, session: &Session, n: usize) -> Result<Vec<Bar>, SessionError> {
        let mut rx = self.state.subscribe();
        session
            .await_reply(async move {
                let state = rx
                    .wait_for(|state| state.fault.is_some() || state.batch_starts.len() > n)
                    .await
                    .map_err(|_| SessionError::Closed)?;
                if let Some(batch) = state.batch(n) {
                    return Ok(batch);
                }
                Err(state
                    .fault
                    .as_ref()
                    .map_or(SessionError::Closed, Fault::to_error))
            })
            .await
    }
}

/// Where one resource's pushes arrive and how to pick them out.
#[derive(Debug, Clone)]
pub(crate) struct Route {
    pub(crate) chart_id: String,
    pub(crate) resource_id: String,
    /// Field holding the rows inside the resource entry
    pub(crate) key: &'static str,
    /// Broadcast events carrying rows for this kind of resource
    pub(crate) channels: &'static [&'static str],
    /// Error event naming this kind of resource
    pub(crate) error_event: &'static str,
}

/// Listeners delivering one resource's batches. Dropping it stops delivery.
#[derive(Debug)]
pub struct BatchSubscription {
    subscriptions: Vec<Subscription>,
}

impl BatchSubscription {
    pub fn cancel(&mut self) {
        for subscription in &mut self.subscriptions {
            subscription.cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.subscriptions.iter().any(|s| s.id().is_some())
    }
}

/// Invoke `on_batch` with every decoded batch addressed to `route`.
pub(crate) fn watch_batches<F>(session: &Session, route: &Route, on_batch: F) -> BatchSubscription
where
    F: Fn(Vec<Bar>) + Send + Sync + 'static,
{
    let on_batch = Arc::new(on_batch);
    let subscriptions = route
        .channels
        .iter()
        .map(|channel| {
            let (route, on_batch) = (route.clone(), Arc::clone(&on_batch));
            session.on(channel, move |event: &Event| {
                match extract_batch(event, &route.chart_id, &route.resource_id, route.key) {
                    Some(Ok(batch)) => {
                        trace!(resource = %route.resource_id, rows = batch.len(), "Batch received");
                        on_batch(batch);
                    }
                    Some(Err(e)) => {
                        warn!(resource = %route.resource_id, error = %e, "Dropping undecodable batch");
                    }
                    None => {}
                }
            })
        })
        .collect();
    BatchSubscription { subscriptions }
}

/// Buffer every batch for `route` into `feed` and record matching errors.
pub(crate) fn attach(session: &Session, route: &Route, feed: &Feed) -> BatchSubscription {
    let mut listeners = {
        let feed = feed.clone();
        watch_batches(session, route, move |batch| feed.push(batch))
    };
    let errors = {
        let (route, feed) = (route.clone(), feed.clone());
        session.on_error(move |event: &Event| {
            if event.name == route.error_event
                && event.addressed_to(&[route.chart_id.as_str(), route.resource_id.as_str()])
            {
                warn!(resource = %route.resource_id, payload = %event.payload, "Remote rejected resource");
                feed.fail(event);
            }
        })
    };
    listeners.subscriptions.push(errors);
    listeners
}

/// Decode the rows of a data push, keyed `payload[1][resource_id][key]`.
///
/// Returns `None` when the push is not addressed to this resource.
pub(crate) fn extract_batch(
    event: &Event,
    chart_id: &str,
    resource_id: &str,
    key: &str,
) -> Option<Result<Vec<Bar>, serde_json::Error>> {
    if !event.addressed_to(&[chart_id]) {
        return None;
    }
    let rows = event.arg(1)?.get(resource_id)?.get(key)?;
    Some(serde_json::from_value(rows.clone()))
}
