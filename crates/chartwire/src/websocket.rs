//! WebSocket transport
//!
//! Carries the framed text protocol over tokio-tungstenite. Websocket-level
//! pings are answered here; application heartbeats travel as frames and are
//! handled by the session.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header, HeaderValue},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, trace};
use url::Url;

use crate::config::SessionConfig;
use crate::error::TransportError;
use crate::transport::Transport;

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

pub struct WebSocketTransport {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WebSocketTransport {
    /// Open the websocket to the endpoint selected by `config`.
    pub async fn connect(config: &SessionConfig) -> Result<Self, TransportError> {
        let endpoint = config.endpoint();
        let url = Url::parse(endpoint)
            .map_err(|e| TransportError::ConnectionFailed(format!("{endpoint}: {e}")))?;

        let mut request = url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            header::ORIGIN,
            HeaderValue::from_str(&config.origin)
                .map_err(|e| TransportError::ConnectionFailed(format!("origin header: {e}")))?,
        );
        headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));

        info!(url = %url, "Connecting to chart WebSocket");
        let (ws, response) = connect_async(request).await?;
        info!(status = ?response.status(), "Chart WebSocket connected");

        Ok(Self { ws })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(data)) => {
                    return Some(String::from_utf8(data).map_err(TransportError::from));
                }
                Ok(Message::Ping(data)) => {
                    trace!("Received WS ping, sending pong");
                    if let Err(e) = self.ws.send(Message::Pong(data)).await {
                        return Some(Err(e.into()));
                    }
                }
                Ok(Message::Close(frame)) => {
                    info!(frame = ?frame, "Chart WebSocket closed by remote");
                    return None;
                }
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.ws.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        debug!("Closing chart WebSocket");
        self.ws.close(None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let config = SessionConfig {
            url: "not a url".to_string(),
            ..SessionConfig::default()
        };
        match WebSocketTransport::connect(&config).await {
            Err(TransportError::ConnectionFailed(msg)) => assert!(msg.contains("not a url")),
            Err(other) => panic!("Expected ConnectionFailed, got {other}"),
            Ok(_) => panic!("Expected connection failure"),
        }
    }
}
