//! Prometheus metrics for chart sessions
//!
//! Process-wide: every session in the process records into the same registry.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

use crate::message;

const LABEL_KIND: &str = "kind";
const LABEL_CHANNEL: &str = "channel";

/// Frames received, by classification
static FRAMES_RECEIVED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "chartwire_frames_received_total",
        "Frames received from the remote by kind",
        &[LABEL_KIND]
    )
    .expect("Failed to register frames_received metric")
});

static FRAMES_SENT: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "chartwire_frames_sent_total",
        "Frames written to the transport"
    )
    .expect("Failed to register frames_sent metric")
});

static EVENTS_DISPATCHED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "chartwire_events_dispatched_total",
        "Events dispatched through the router by channel",
        &[LABEL_CHANNEL]
    )
    .expect("Failed to register events_dispatched metric")
});

static FRAMING_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "chartwire_framing_errors_total",
        "Malformed frames that terminated a session"
    )
    .expect("Failed to register framing_errors metric")
});

static LISTENERS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "chartwire_listeners",
        "Listeners currently registered across all sessions"
    )
    .expect("Failed to register listeners metric")
});

static SESSIONS_OPEN: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("chartwire_sessions_open", "Sessions currently open")
        .expect("Failed to register sessions_open metric")
});

/// Frame classification used as the `kind` label
#[derive(Debug, Clone, Copy)]
pub enum FrameKind {
    Heartbeat,
    Descriptor,
    Event,
    Unparsed,
}

impl FrameKind {
    fn as_str(self) -> &'static str {
        match self {
            FrameKind::Heartbeat => "heartbeat",
            FrameKind::Descriptor => "descriptor",
            FrameKind::Event => "event",
            FrameKind::Unparsed => "unparsed",
        }
    }
}

pub fn inc_frame_received(kind: FrameKind) {
    FRAMES_RECEIVED.with_label_values(&[kind.as_str()]).inc();
}

pub fn inc_frame_sent() {
    FRAMES_SENT.inc();
}

/// Router channels that get their own `channel` label value
const KNOWN_CHANNELS: &[&str] = &[
    message::ERROR_CHANNEL,
    message::SYMBOL_RESOLVED,
    message::TIMESCALE_UPDATE,
    message::DATA_UPDATE,
    message::QUOTE_DATA,
    message::QUOTE_COMPLETED,
];

/// Channel names come from the remote; anything unknown is folded into
/// `other` to keep the label set bounded.
fn channel_label(channel: &str) -> &'static str {
    KNOWN_CHANNELS
        .iter()
        .find(|known| **known == channel)
        .copied()
        .unwrap_or("other")
}

pub fn inc_dispatched(channel: &str) {
    EVENTS_DISPATCHED
        .with_label_values(&[channel_label(channel)])
        .inc();
}

pub fn inc_framing_error() {
    FRAMING_ERRORS.inc();
}

pub fn inc_listeners() {
    LISTENERS.inc();
}

pub fn dec_listeners() {
    LISTENERS.dec();
}

pub fn sub_listeners(count: usize) {
    LISTENERS.sub(count as i64);
}

pub fn session_opened() {
    SESSIONS_OPEN.inc();
}

pub fn session_closed() {
    SESSIONS_OPEN.dec();
}

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| {
        prometheus::Error::Msg(format!("Failed to encode metrics as UTF-8: {}", e))
    })
}
