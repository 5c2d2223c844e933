//! # offsync Engine
//!
//! Offline-first sync engine.
//!
//! This crate provides:
//! - A durable operation queue with priorities and exponential backoff
//! - The bidirectional reconciliation pass (upload, acknowledge, download)
//! - A shared apply path feeding server changes through conflict resolution
//! - Device registration with cached and default fallbacks
//! - A real-time push channel over WebSocket with automatic reconnects
//! - HTTP transport abstraction
//! - The [`SyncEngine`] facade business code talks to
//!
//! ## Architecture
//!
//! Local mutations are written optimistically and queued in the same
//! atomic store unit. A sync pass then:
//! 1. Uploads the next batch, coalesced to one change per entity
//! 2. Settles each upload from the server's acknowledgements
//! 3. Applies downloaded changes, detecting and resolving conflicts
//! 4. Advances the last sync time
//!
//! Push updates take the same apply path as downloads, so a change seen
//! over both channels is applied once.
//!
//! ## Key Invariants
//!
//! - An operation leaves the queue only once the server acknowledged it
//! - Every queue mutation and its snapshot write share one store batch
//! - At most one sync pass runs per engine
//! - An entity with an open conflict is never uploaded
//! - No lock is held across an `.await`

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod apply;
mod config;
mod device;
mod engine;
mod error;
mod events;
mod http;
mod orchestrator;
mod queue;
mod realtime;
mod transport;
mod ws;

pub use apply::{ApplyOutcome, ChangeApplier, ChangeSource};
pub use config::{EngineConfig, RetryConfig};
pub use device::{ConfigSource, DeviceManager, DEVICE_CONFIG_META_KEY};
pub use engine::{EngineBuilder, EngineStats, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use events::{ListenerRegistry, Subscription, SyncEvent};
pub use http::{HttpClient, HttpFailure, HttpMethod, HttpTransport, ReqwestClient};
pub use orchestrator::{SkipReason, SyncOrchestrator, SyncReport, SyncStats, ALL_KINDS};
pub use queue::{
    EffectiveChange, OperationQueue, OutcomeEffect, QueueEdit, QueueItem, QueueStats,
};
pub use realtime::{
    ConnectionState, ConnectionStatus, PushConnection, PushConnector, PushHandler,
    RealtimeClient, PING_INTERVAL,
};
pub use transport::{MockTransport, SyncTransport};
pub use ws::{WsConnection, WsConnector};

pub use offsync_conflict::ManualResolution;
pub use offsync_protocol::{NewOperation, OperationType};
