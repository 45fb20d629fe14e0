//! In-process transport pair.
//!
//! [`MemoryTransport`] is handed to a session; [`RemoteEnd`] plays the server:
//! it pushes raw chunks (framed or deliberately mis-chunked) and observes
//! every chunk the session writes.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::framing::{self, Framer};
use crate::message::{Command, Inbound};
use crate::transport::Transport;

const CHANNEL_BUFFER_SIZE: usize = 1024;

pub struct MemoryTransport {
    incoming: mpsc::Receiver<Result<String, TransportError>>,
    outgoing: mpsc::Sender<String>,
}

impl MemoryTransport {
    /// Create a connected (session side, remote side) pair.
    pub fn pair() -> (MemoryTransport, RemoteEnd) {
        let (to_session, incoming) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let (outgoing, from_session) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        (
            MemoryTransport { incoming, outgoing },
            RemoteEnd {
                tx: Some(to_session),
                rx: from_session,
                framer: Framer::new(),
                pending: Vec::new(),
            },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.incoming.recv().await
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.outgoing
            .send(text)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.incoming.close();
        Ok(())
    }
}

/// Remote side of a [`MemoryTransport`].
pub struct RemoteEnd {
    tx: Option<mpsc::Sender<Result<String, TransportError>>>,
    rx: mpsc::Receiver<String>,
    framer: Framer,
    pending: Vec<String>,
}

impl RemoteEnd {
    /// Push one raw chunk exactly as given
    pub async fn push_raw(&self, chunk: impl Into<String>) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(Ok(chunk.into()))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Push one framed payload
    pub async fn push_frame(&self, payload: &str) -> Result<(), TransportError> {
        self.push_raw(framing::encode(payload)).await
    }

    /// Push a named event `{"m": name, "p": payload}`
    pub async fn push_event(
        &self,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<(), TransportError> {
        let body = serde_json::json!({ "m": name, "p": payload }).to_string();
        self.push_frame(&body).await
    }

    /// Inject a transport-level failure
    pub async fn push_error(&self, error: TransportError) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(Err(error)).await.map_err(|_| TransportError::Closed)
    }

    /// Close the remote side; the session sees end of stream.
    pub fn hang_up(&mut self) {
        self.tx = None;
    }

    /// Next raw chunk written by the session, `None` once the session side is gone
    pub async fn recv_raw(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Next frame payload written by the session, regardless of chunking
    pub async fn recv_payload(&mut self) -> Option<String> {
        loop {
            if !self.pending.is_empty() {
                return Some(self.pending.remove(0));
            }
            let chunk = self.rx.recv().await?;
            let frames = self.framer.push(&chunk).ok()?;
            self.pending
                .extend(frames.into_iter().map(framing::Frame::into_payload));
        }
    }

    /// Next outbound named event as `(name, params)`, skipping heartbeats
    /// and empty frames
    pub async fn recv_command(&mut self) -> Option<(String, serde_json::Value)> {
        loop {
            let payload = self.recv_payload().await?;
            if let Ok(Inbound::Event(event)) = Inbound::parse(&payload) {
                return Some((event.name, event.payload));
            }
        }
    }

    /// Push the frame a session would send for `command`; handy for
    /// replaying recorded traffic.
    pub async fn push_command(&self, command: &Command) -> Result<(), TransportError> {
        self.push_raw(command.encode()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_pair_roundtrip() {
        let (mut transport, mut remote) = MemoryTransport::pair();

        remote.push_frame("~h~7").await.unwrap();
        let chunk = transport.recv().await.unwrap().unwrap();
        assert_eq!(chunk, "~m~4~m~~h~7");

        transport
            .send(Command::set_locale("en", "US").encode())
            .await
            .unwrap();
        let (name, params) = remote.recv_command().await.unwrap();
        assert_eq!(name, "set_locale");
        assert_eq!(params, json!(["en", "US"]));
    }

    #[tokio::test]
    async fn test_recv_payload_reassembles_concatenated_chunks() {
        let (mut transport, mut remote) = MemoryTransport::pair();
        transport
            .send(format!("{}{}", framing::encode("a"), framing::encode("bc")))
            .await
            .unwrap();
        assert_eq!(remote.recv_payload().await.unwrap(), "a");
        assert_eq!(remote.recv_payload().await.unwrap(), "bc");
    }

    #[tokio::test]
    async fn test_hang_up_ends_stream() {
        let (mut transport, mut remote) = MemoryTransport::pair();
        remote.hang_up();
        assert!(transport.recv().await.is_none());
        assert!(remote.push_raw("x").await.is_err());
    }
}
