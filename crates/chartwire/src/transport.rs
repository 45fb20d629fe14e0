use async_trait::async_trait;

use crate::error::TransportError;

/// Text stream underneath a session.
///
/// The session loop owns the transport exclusively and polls `recv` inside
/// `tokio::select!` alongside its outbound queue, so `recv` must be cancel
/// safe: dropping an unfinished `recv` future must not lose data.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Next raw chunk. `None` once the remote has closed the stream.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    /// Write one chunk. Returns once it has been handed to the stream, not
    /// when the remote has processed it.
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Close the stream gracefully
    async fn close(&mut self) -> Result<(), TransportError>;
}
