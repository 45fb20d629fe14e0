//! Price series inside a chart.
//!
//! All series share the `timescale_update` broadcast (history bursts) and the
//! `du` broadcast (live updates); each series keeps only the pushes carrying
//! its chart id and its own series id.

use tracing::{debug, warn};

use crate::chart::{Chart, ResolvedSymbol};
use crate::error::SessionError;
use crate::feed::{self, BatchSubscription, Bar, Feed, Route};
use crate::message::{Command, DATA_UPDATE, TIMESCALE_UPDATE};
use crate::router::Lease;
use crate::session::Session;

/// Bars requested when the caller does not say otherwise
pub const DEFAULT_BAR_COUNT: u32 = 300;

const SERIES_PREFIX: &str = "series";
const SERIES_ROWS: &str = "s";
const SERIES_ERROR: &str = "series_error";
const SERIES_CHANNELS: &[&str] = &[TIMESCALE_UPDATE, DATA_UPDATE];

/// Lifecycle: created and subscribed on construction, receiving batches
/// until [`close`](Series::close).
#[derive(Debug)]
pub struct Series {
    session: Session,
    route: Route,
    ticket: String,
    timeframe: String,
    feed: Feed,
    listeners: BatchSubscription,
    lease: Option<Lease>,
}

impl Series {
    /// Create a series of `bar_count` bars for a resolved symbol.
    pub fn create(
        chart: &Chart,
        symbol: &ResolvedSymbol,
        timeframe: &str,
        bar_count: u32,
    ) -> Result<Self, SessionError> {
        Self::create_with_range(chart, symbol, timeframe, bar_count, "")
    }

    /// Like [`create`](Self::create), with an explicit range argument
    /// passed through to the remote.
    pub fn create_with_range(
        chart: &Chart,
        symbol: &ResolvedSymbol,
        timeframe: &str,
        bar_count: u32,
        range: &str,
    ) -> Result<Self, SessionError> {
        let session = chart.session().clone();
        let route = Route {
            chart_id: chart.id().to_string(),
            resource_id: session.mint_id(SERIES_PREFIX),
            key: SERIES_ROWS,
            channels: SERIES_CHANNELS,
            error_event: SERIES_ERROR,
        };

        // listen before sending so the first burst cannot be missed
        let lease = session.lease();
        let feed = Feed::new();
        let listeners = feed::attach(&session, &route, &feed);

        session.send(Command::create_series(
            &route.chart_id,
            &route.resource_id,
            &symbol.ticket,
            timeframe,
            bar_count,
            range,
        ))?;
        debug!(
            chart_id = %route.chart_id,
            series_id = %route.resource_id,
            ticket = %symbol.ticket,
            timeframe = %timeframe,
            bar_count,
            "Series created"
        );

        Ok(Self {
            session,
            route,
            ticket: symbol.ticket.clone(),
            timeframe: timeframe.to_string(),
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

    /// Resolution ticket this series was created against
    pub fn ticket(&self) -> &str {
        &self.ticket
    }

    pub fn timeframe(&self) -> &str {
        &self.timeframe
    }

    pub(crate) fn session(&self) -> &Session {
        &self.session
    }

    /// Snapshot of every bar received so far, in arrival order
    pub fn history(&self) -> Vec<Bar> {
        self.feed.history()
    }

    pub fn len(&self) -> usize {
        self.feed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Most recent bar
    pub fn last(&self) -> Option<Bar> {
        self.feed.last()
    }

    /// Iterate a snapshot of the buffered history. Never waits for data.
    pub fn iter(&self) -> std::vec::IntoIter<Bar> {
        self.history().into_iter()
    }

    /// Wait until the first batch has arrived.
    pub async fn ready(&self) -> Result<(), SessionError> {
        self.feed.ready(&self.session).await
    }

    /// Wait for the next batch pushed after this call.
    pub async fn next_batch(&self) -> Result<Vec<Bar>, SessionError> {
        self.feed.next_batch(&self.session).await
    }

    /// Invoke `callback` with every batch until the returned guard drops.
    pub fn on_batch<F>(&self, callback: F) -> BatchSubscription
    where
        F: Fn(&[Bar]) + Send + Sync + 'static,
    {
        feed::watch_batches(&self.session, &self.route, move |batch| callback(&batch))
    }

    /// Stop listening. Sends `remove_series` only when remote teardown is
    /// configured. Idempotent.
    pub fn close(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        self.listeners.cancel();
        if self.session.config().remote_teardown && self.session.is_open() {
            let command = Command::remove_series(&self.route.chart_id, &self.route.resource_id);
            if let Err(e) = self.session.send(command) {
                warn!(series_id = %self.route.resource_id, error = %e, "Failed to send series teardown");
            }
        }
        debug!(series_id = %self.route.resource_id, bars = self.len(), "Series closed");
        drop(lease);
    }

    pub fn is_closed(&self) -> bool {
        self.lease.is_none()
    }
}

impl Drop for Series {
    fn drop(&mut self) {
        self.close();
    }
}

impl<'a> IntoIterator for &'a Series {
    type Item = Bar;
    type IntoIter = std::vec::IntoIter<Bar>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
