//! Real-time push channel.
//!
//! The push channel delivers server changes faster than the sync interval.
//! It is an optimization: anything missed while disconnected is recovered
//! by the next full sync pass.
//!
//! ## Connection state machine
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──ok──▶ Connected
//!      ▲                          │                  │
//!      └───── backoff ◀── error ──┘◀── drop/error ───┘
//! ```
//!
//! Reconnects back off exponentially with jitter (1s initial, 30s cap by
//! default). [`RealtimeClient::disconnect`] cancels the loop at any point.

use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::{ListenerRegistry, SyncEvent};
use async_trait::async_trait;
use offsync_protocol::{ClientFrame, PushIdentity, RemoteChange, ServerFrame};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Interval of keep-alive pings on an open channel.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Push channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No channel; a reconnect may be scheduled.
    Disconnected,
    /// A connection attempt is running.
    Connecting,
    /// The channel is open.
    Connected,
}

/// Observable push channel diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    /// Current state.
    pub state: ConnectionState,
    /// Consecutive failed attempts since the last successful connect.
    pub attempts: u32,
    /// Why the channel last went down.
    pub last_error: Option<String>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            last_error: None,
        }
    }
}

/// Opens push channels.
#[async_trait]
pub trait PushConnector: Send + Sync {
    /// Opens a channel presenting `identity`.
    async fn connect(&self, identity: &PushIdentity) -> SyncResult<Box<dyn PushConnection>>;
}

/// One open push channel.
#[async_trait]
pub trait PushConnection: Send {
    /// Sends a frame.
    async fn send(&mut self, frame: &ClientFrame) -> SyncResult<()>;

    /// Waits for the next frame; `None` once the server closed the channel.
    async fn recv(&mut self) -> SyncResult<Option<ServerFrame>>;

    /// Closes the channel.
    async fn close(&mut self) -> SyncResult<()>;
}

/// Receives what the push channel delivers.
pub trait PushHandler: Send + Sync {
    /// Server changes, in delivery order.
    fn handle_changes(&self, changes: Vec<RemoteChange>);

    /// The channel came back after being down.
    fn reconnected(&self) {}
}

type Scope = (String, Option<String>);

struct Shared {
    connector: Arc<dyn PushConnector>,
    identity: PushIdentity,
    retry: RetryConfig,
    handler: Arc<dyn PushHandler>,
    subscriptions: Mutex<BTreeSet<Scope>>,
    status: watch::Sender<ConnectionStatus>,
    events: ListenerRegistry<SyncEvent>,
}

struct Running {
    commands: mpsc::UnboundedSender<ClientFrame>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

enum SessionEnd {
    Shutdown,
    Closed,
    Failed(SyncError),
}

/// Keeps a push channel open and feeds its updates to a [`PushHandler`].
pub struct RealtimeClient {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("status", &self.status())
            .field("subscriptions", &self.subscriptions())
            .finish_non_exhaustive()
    }
}

impl RealtimeClient {
    /// Creates a disconnected client.
    pub fn new(
        connector: Arc<dyn PushConnector>,
        identity: PushIdentity,
        retry: RetryConfig,
        handler: Arc<dyn PushHandler>,
        events: ListenerRegistry<SyncEvent>,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::default());
        Self {
            shared: Arc::new(Shared {
                connector,
                identity,
                retry,
                handler,
                subscriptions: Mutex::new(BTreeSet::new()),
                status,
                events,
            }),
            running: Mutex::new(None),
        }
    }

    /// Starts the connection loop. A no-op while it is running.
    ///
    /// Must be called within a Tokio runtime.
    pub fn connect(&self) {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return;
        }

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(connection_loop(
            Arc::clone(&self.shared),
            commands_rx,
            shutdown_rx,
        ));
        *running = Some(Running {
            commands,
            shutdown,
            task,
        });
    }

    /// Stops the connection loop and closes the channel.
    pub async fn disconnect(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            if let Err(err) = running.task.await {
                warn!(error = %err, "push connection task ended abnormally");
            }
        }
        self.shared.publish(ConnectionState::Disconnected, 0, None);
    }

    /// Receives updates for a kind, or one entity of it.
    ///
    /// Remembered across reconnects.
    pub fn subscribe(&self, kind: impl Into<String>, id: Option<String>) {
        let kind = kind.into();
        let added = self
            .shared
            .subscriptions
            .lock()
            .insert((kind.clone(), id.clone()));
        if added {
            self.send(ClientFrame::Subscribe {
                entity_kind: kind,
                entity_id: id,
            });
        }
    }

    /// Stops receiving updates for a scope.
    pub fn unsubscribe(&self, kind: impl Into<String>, id: Option<String>) {
        let kind = kind.into();
        let removed = self
            .shared
            .subscriptions
            .lock()
            .remove(&(kind.clone(), id.clone()));
        if removed {
            self.send(ClientFrame::Unsubscribe {
                entity_kind: kind,
                entity_id: id,
            });
        }
    }

    /// Returns the remembered subscriptions.
    pub fn subscriptions(&self) -> Vec<(String, Option<String>)> {
        self.shared.subscriptions.lock().iter().cloned().collect()
    }

    /// Returns the current status.
    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.borrow().clone()
    }

    /// Returns a receiver that observes every status change.
    pub fn watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    fn send(&self, frame: ClientFrame) {
        if let Some(running) = self.running.lock().as_ref() {
            // Only fails once the loop has ended; the scope is resent on the
            // next connect anyway.
            let _ = running.commands.send(frame);
        }
    }
}

impl Shared {
    fn publish(&self, state: ConnectionState, attempts: u32, last_error: Option<String>) {
        let previous = self.status.send_replace(ConnectionStatus {
            state,
            attempts,
            last_error,
        });
        if previous.state != state {
            info!(from = ?previous.state, to = ?state, attempts, "push channel state changed");
            self.events.emit(&SyncEvent::ConnectionChanged(state));
        }
    }

    async fn run_session(
        &self,
        connection: &mut dyn PushConnection,
        commands: &mut mpsc::UnboundedReceiver<ClientFrame>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        // Queued commands are superseded by the full resubscribe below.
        while commands.try_recv().is_ok() {}
        let scopes: Vec<Scope> = self.subscriptions.lock().iter().cloned().collect();
        for (entity_kind, entity_id) in scopes {
            let frame = ClientFrame::Subscribe {
                entity_kind,
                entity_id,
            };
            if let Err(err) = connection.send(&frame).await {
                return SessionEnd::Failed(err);
            }
        }

        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => return SessionEnd::Shutdown,
                Some(frame) = commands.recv() => {
                    if let Err(err) = connection.send(&frame).await {
                        return SessionEnd::Failed(err);
                    }
                }
                _ = ping.tick() => {
                    if let Err(err) = connection.send(&ClientFrame::Ping).await {
                        return SessionEnd::Failed(err);
                    }
                }
                frame = connection.recv() => match frame {
                    Ok(Some(frame)) => self.handle_frame(frame),
                    Ok(None) => return SessionEnd::Closed,
                    Err(err) => return SessionEnd::Failed(err),
                },
            }
        }
    }

    fn handle_frame(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::EntityUpdate(update) => match update.to_remote_change() {
                Some(change) => self.handler.handle_changes(vec![change]),
                None => warn!(entity_kind = %update.entity_kind, "push update without entity id"),
            },
            ServerFrame::Snapshot { changes } => {
                debug!(count = changes.len(), "push snapshot received");
                self.handler.handle_changes(changes);
            }
            ServerFrame::RecentChanges { changes } => {
                debug!(count = changes.len(), "push backlog received");
                self.handler.handle_changes(changes);
            }
            ServerFrame::Pong => debug!("push pong"),
            ServerFrame::Error { message } => warn!(%message, "push channel reported an error"),
        }
    }
}

async fn connection_loop(
    shared: Arc<Shared>,
    mut commands: mpsc::UnboundedReceiver<ClientFrame>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempts: u32 = 0;
    let mut connected_before = false;

    loop {
        shared.publish(ConnectionState::Connecting, attempts, None);
        let result = tokio::select! {
            result = shared.connector.connect(&shared.identity) => result,
            _ = shutdown.changed() => return,
        };

        let error = match result {
            Ok(mut connection) => {
                attempts = 0;
                shared.publish(ConnectionState::Connected, 0, None);
                if connected_before {
                    shared.handler.reconnected();
                }
                connected_before = true;

                match shared
                    .run_session(connection.as_mut(), &mut commands, &mut shutdown)
                    .await
                {
                    SessionEnd::Shutdown => {
                        if let Err(err) = connection.close().await {
                            debug!(error = %err, "push channel close failed");
                        }
                        return;
                    }
                    SessionEnd::Closed => "connection closed by server".to_string(),
                    SessionEnd::Failed(err) => err.to_string(),
                }
            }
            Err(err) => err.to_string(),
        };

        attempts = attempts.saturating_add(1);
        warn!(attempts, %error, "push channel down");
        shared.publish(ConnectionState::Disconnected, attempts, Some(error));
        if shared.retry.is_exhausted(attempts) {
            warn!(attempts, "push channel gave up reconnecting");
            return;
        }

        let delay = shared.retry.delay_for_attempt(attempts);
        debug!(?delay, "push channel reconnect scheduled");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RefusingConnector;

    #[async_trait]
    impl PushConnector for RefusingConnector {
        async fn connect(&self, _identity: &PushIdentity) -> SyncResult<Box<dyn PushConnection>> {
            Err(SyncError::transport_retryable("connection refused"))
        }
    }

    struct NullHandler;

    impl PushHandler for NullHandler {
        fn handle_changes(&self, _changes: Vec<RemoteChange>) {}
    }

    fn client(retry: RetryConfig) -> RealtimeClient {
        RealtimeClient::new(
            Arc::new(RefusingConnector),
            PushIdentity::default(),
            retry,
            Arc::new(NullHandler),
            ListenerRegistry::new(),
        )
    }

    #[test]
    fn subscriptions_are_remembered() {
        let client = client(RetryConfig::reconnect());
        client.subscribe("Product", None);
        client.subscribe("Customer", Some("7".into()));
        client.subscribe("Product", None);
        assert_eq!(client.subscriptions().len(), 2);

        client.unsubscribe("Product", None);
        assert_eq!(
            client.subscriptions(),
            vec![("Customer".to_string(), Some("7".to_string()))]
        );
    }

    #[tokio::test]
    async fn failed_attempts_are_counted_until_exhausted() {
        let retry = RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(5))
            .with_jitter(false);
        let client = client(retry);
        let mut watch = client.watch();

        client.connect();
        let status = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if watch.changed().await.is_err() {
                    break watch.borrow().clone();
                }
                let status = watch.borrow().clone();
                if status.attempts == 3 && status.state == ConnectionState::Disconnected {
                    break status;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(status.attempts, 3);
        assert_eq!(status.last_error.as_deref(), Some("transport error: connection refused"));
        client.disconnect().await;
        assert_eq!(client.status().state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_cancels_backoff() {
        let retry = RetryConfig::reconnect().with_initial_delay(Duration::from_secs(3600));
        let client = client(retry);
        client.connect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(1), client.disconnect())
            .await
            .unwrap();
        assert_eq!(client.status(), ConnectionStatus::default());
    }
}
