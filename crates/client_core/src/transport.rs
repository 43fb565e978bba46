use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::protocol::{FrameError, HandshakeFrame, TransportEvent};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};
use url::Url;

use crate::{
    credentials::Credential,
    error::{ClientError, ClientResult},
};

/// Opens a transport and completes the authentication handshake.
///
/// A returned link has already been acknowledged by the server. Handshake
/// rejection maps to `Handshake` (or `Unauthorized` when the server says so).
#[async_trait]
pub trait TransportDialer: Send + Sync {
    async fn dial(&self, endpoint: &Url, credential: &Credential)
        -> ClientResult<Box<dyn TransportLink>>;
}

#[async_trait]
pub trait TransportLink: Send {
    /// Next inbound event; `None` once the link has dropped.
    async fn recv(&mut self) -> Option<ClientResult<TransportEvent>>;
    async fn close(&mut self);
}

/// Bounded exponential delay between redials.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            attempts: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempts.min(16));
        self.attempts = self.attempts.saturating_add(1);
        self.min.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

pub struct WsDialer;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsLink {
    stream: WsStream,
}

#[async_trait]
impl TransportDialer for WsDialer {
    async fn dial(
        &self,
        endpoint: &Url,
        credential: &Credential,
    ) -> ClientResult<Box<dyn TransportLink>> {
        let (mut stream, _) = connect_async(endpoint.as_str())
            .await
            .map_err(|err| ClientError::Handshake(format!("failed to open {endpoint}: {err}")))?;

        let handshake = serde_json::to_string(&HandshakeFrame::connect(credential.expose()))
            .map_err(|err| ClientError::Handshake(err.to_string()))?;
        stream
            .send(WsMessage::Text(handshake))
            .await
            .map_err(|err| ClientError::Handshake(format!("handshake send failed: {err}")))?;

        let mut link = WsLink { stream };
        match link.recv().await {
            Some(Ok(TransportEvent::Connect { sid })) => {
                debug!(endpoint = %endpoint, sid = sid.as_deref().unwrap_or("-"), "transport: handshake acknowledged");
                Ok(Box::new(link))
            }
            Some(Ok(TransportEvent::ConnectError { message })) => {
                link.close().await;
                Err(ClientError::Handshake(message))
            }
            Some(Ok(TransportEvent::Unauthorized { .. })) => {
                link.close().await;
                Err(ClientError::Unauthorized)
            }
            Some(Ok(other)) => {
                link.close().await;
                Err(ClientError::Handshake(format!(
                    "expected connect ack, got '{}'",
                    other.kind().wire_name()
                )))
            }
            Some(Err(err)) => Err(err),
            None => Err(ClientError::Handshake(
                "transport closed during handshake".into(),
            )),
        }
    }
}

#[async_trait]
impl TransportLink for WsLink {
    async fn recv(&mut self) -> Option<ClientResult<TransportEvent>> {
        loop {
            let frame = match self.stream.next().await? {
                Ok(frame) => frame,
                Err(err) => return Some(Err(ClientError::NetworkUnreachable(err.to_string()))),
            };
            match frame {
                WsMessage::Text(text) => match TransportEvent::from_frame(&text) {
                    Ok(event) => return Some(Ok(event)),
                    Err(FrameError::UnknownEvent(name)) => {
                        debug!(event = %name, "transport: ignoring unknown event");
                    }
                    Err(err) => warn!("transport: dropping malformed frame: {err}"),
                },
                WsMessage::Close(_) => return None,
                _ => {}
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
