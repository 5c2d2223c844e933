//! Scripted push channel.
//!
//! [`ScriptedPush`] is a [`PushConnector`] whose connections are fed by the
//! test: frames go in with [`ScriptedPush::deliver`], and the frames the
//! client sent are recorded. Dropping the live connection or refusing new
//! ones drives the reconnect path.

use async_trait::async_trait;
use offsync_engine::{PushConnection, PushConnector, SyncError, SyncResult};
use offsync_protocol::{ClientFrame, PushIdentity, RemoteChange, ServerFrame};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct Inner {
    live: Option<mpsc::UnboundedSender<ServerFrame>>,
    sent: Vec<ClientFrame>,
    identities: Vec<PushIdentity>,
    refuse: bool,
}

/// A push connector controlled by the test.
#[derive(Debug, Clone, Default)]
pub struct ScriptedPush {
    inner: Arc<Mutex<Inner>>,
}

impl ScriptedPush {
    /// Creates a connector that accepts connections.
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuses new connections while true.
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.lock().refuse = refuse;
    }

    /// Returns true while a connection is open.
    pub fn is_connected(&self) -> bool {
        self.inner.lock().live.is_some()
    }

    /// Returns the number of successful connects.
    pub fn connect_count(&self) -> usize {
        self.inner.lock().identities.len()
    }

    /// Returns the identity presented on each connect.
    pub fn identities(&self) -> Vec<PushIdentity> {
        self.inner.lock().identities.clone()
    }

    /// Returns the frames the client sent, pings excluded.
    pub fn sent_frames(&self) -> Vec<ClientFrame> {
        self.inner
            .lock()
            .sent
            .iter()
            .filter(|frame| **frame != ClientFrame::Ping)
            .cloned()
            .collect()
    }

    /// Delivers a frame on the live connection. Returns false without one.
    pub fn deliver(&self, frame: ServerFrame) -> bool {
        match &self.inner.lock().live {
            Some(live) => live.send(frame).is_ok(),
            None => false,
        }
    }

    /// Delivers server changes as a backlog frame.
    pub fn deliver_changes(&self, changes: Vec<RemoteChange>) -> bool {
        self.deliver(ServerFrame::RecentChanges { changes })
    }

    /// Closes the live connection from the server side.
    pub fn drop_connection(&self) {
        self.inner.lock().live = None;
    }
}

#[async_trait]
impl PushConnector for ScriptedPush {
    async fn connect(&self, identity: &PushIdentity) -> SyncResult<Box<dyn PushConnection>> {
        let mut inner = self.inner.lock();
        if inner.refuse {
            return Err(SyncError::transport_retryable("connection refused"));
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        inner.live = Some(sender);
        inner.identities.push(identity.clone());
        Ok(Box::new(ScriptedConnection {
            inner: Arc::clone(&self.inner),
            receiver,
        }))
    }
}

struct ScriptedConnection {
    inner: Arc<Mutex<Inner>>,
    receiver: mpsc::UnboundedReceiver<ServerFrame>,
}

#[async_trait]
impl PushConnection for ScriptedConnection {
    async fn send(&mut self, frame: &ClientFrame) -> SyncResult<()> {
        self.inner.lock().sent.push(frame.clone());
        Ok(())
    }

    async fn recv(&mut self) -> SyncResult<Option<ServerFrame>> {
        Ok(self.receiver.recv().await)
    }

    async fn close(&mut self) -> SyncResult<()> {
        self.inner.lock().live = None;
        Ok(())
    }
}
