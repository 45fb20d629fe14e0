//! chartwire: streaming chart session client
//!
//! One framed text connection carries every chart, series, study and quote
//! session. The session owns the transport, answers heartbeats, and fans
//! pushes out through an event router; resources filter the shared
//! broadcasts by the identifiers embedded in each payload.

pub mod chart;
pub mod config;
pub mod error;
pub mod feed;
pub mod framing;
pub mod memory;
pub mod message;
pub mod metrics;
pub mod quote;
pub mod router;
pub mod series;
pub mod session;
pub mod study;
pub mod transport;
pub mod websocket;

pub use chart::{Chart, ResolvedSymbol, SymbolInfo};
pub use config::SessionConfig;
pub use error::{ConfigError, FrameError, MessageError, SessionError, TransportError};
pub use feed::{Bar, BatchSubscription};
pub use framing::{Frame, Framer};
pub use memory::{MemoryTransport, RemoteEnd};
pub use message::{Command, Event, Inbound, ProtocolDescriptor};
pub use quote::{fetch_reports, Quote, QuoteSession, QuoteUpdate, Report, ReportPeriod};
pub use router::{EventRouter, Lease, ListenerId, Subscription};
pub use series::Series;
pub use session::{CloseReason, Session, SessionState};
pub use study::{Study, StudyParam, StudySpec};
pub use transport::Transport;
pub use websocket::WebSocketTransport;
