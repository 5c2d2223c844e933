//! WebSocket push connector.
//!
//! Frames are JSON text messages. The identity travels as query
//! parameters: `token`, `userId`, `deviceId` and `scope`.

use crate::error::{SyncError, SyncResult};
use crate::realtime::{PushConnection, PushConnector};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use offsync_protocol::{ClientFrame, PushIdentity, ServerFrame};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

/// Opens push channels over WebSocket.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
    connect_timeout: Duration,
}

impl WsConnector {
    /// Creates a connector for a `ws://` or `wss://` URL.
    pub fn new(url: &str, connect_timeout: Duration) -> SyncResult<Self> {
        let url = Url::parse(url)
            .map_err(|e| SyncError::Config(format!("invalid push url {url:?}: {e}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(SyncError::Config(format!(
                "push url must use ws or wss, got {}",
                url.scheme()
            )));
        }
        Ok(Self {
            url,
            connect_timeout,
        })
    }

    /// Returns the URL a connection with `identity` would open.
    pub fn url_for(&self, identity: &PushIdentity) -> Url {
        let mut url = self.url.clone();
        {
            let mut query = url.query_pairs_mut();
            let params = [
                ("token", &identity.token),
                ("userId", &identity.user_id),
                ("deviceId", &identity.device_id),
                ("scope", &identity.scope),
            ];
            for (name, value) in params {
                if let Some(value) = value {
                    query.append_pair(name, value);
                }
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        url
    }
}

#[async_trait]
impl PushConnector for WsConnector {
    async fn connect(&self, identity: &PushIdentity) -> SyncResult<Box<dyn PushConnection>> {
        let url = self.url_for(identity);
        let (stream, response) = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| SyncError::Timeout)?
            .map_err(|e| SyncError::transport_retryable(format!("websocket connect failed: {e}")))?;
        debug!(status = %response.status(), "websocket connected");
        Ok(Box::new(WsConnection { stream }))
    }
}

/// One open WebSocket push channel.
pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl std::fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection").finish_non_exhaustive()
    }
}

#[async_trait]
impl PushConnection for WsConnection {
    async fn send(&mut self, frame: &ClientFrame) -> SyncResult<()> {
        let text = serde_json::to_string(frame)
            .map_err(|e| SyncError::Protocol(format!("failed to encode frame: {e}")))?;
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| SyncError::transport_retryable(format!("websocket send failed: {e}")))
    }

    async fn recv(&mut self) -> SyncResult<Option<ServerFrame>> {
        while let Some(message) = self.stream.next().await {
            let message = message
                .map_err(|e| SyncError::transport_retryable(format!("websocket read failed: {e}")))?;
            match message {
                Message::Text(text) => match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(frame) => return Ok(Some(frame)),
                    Err(err) => warn!(error = %err, "ignoring unreadable push frame"),
                },
                Message::Close(_) => return Ok(None),
                _ => {}
            }
        }
        Ok(None)
    }

    async fn close(&mut self) -> SyncResult<()> {
        self.stream
            .close(None)
            .await
            .map_err(|e| SyncError::transport_fatal(format!("websocket close failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_websocket_urls() {
        assert!(matches!(
            WsConnector::new("https://push.example.com", Duration::from_secs(1)),
            Err(SyncError::Config(_))
        ));
        assert!(WsConnector::new("wss://push.example.com/ws", Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn identity_goes_into_query() {
        let connector = WsConnector::new("wss://push.example.com/ws", Duration::from_secs(1)).unwrap();
        let identity = PushIdentity {
            token: Some("t 1".into()),
            user_id: Some("u-1".into()),
            device_id: Some("pos-1".into()),
            scope: None,
        };
        assert_eq!(
            connector.url_for(&identity).as_str(),
            "wss://push.example.com/ws?token=t+1&userId=u-1&deviceId=pos-1"
        );
        assert_eq!(
            connector.url_for(&PushIdentity::default()).as_str(),
            "wss://push.example.com/ws"
        );
    }
}
