//! # offsync Protocol
//!
//! Data model and wire messages for the offsync engine.
//!
//! This crate provides:
//! - `EntitySnapshot` and `EntityKey` for materialized entity state
//! - `SyncOperation` for queued local mutations
//! - `Conflict` and `ResolutionRecord` for conflict bookkeeping
//! - Reconciliation and push-channel messages (camelCase JSON)
//! - A `Clock` abstraction so time can be injected in tests
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod conflict;
mod entity;
mod messages;
mod operation;

pub use clock::{Clock, ManualClock, SystemClock};
pub use conflict::{
    Conflict, ConflictId, ConflictType, ResolutionChoice, ResolutionRecord, RiskLevel, Severity,
};
pub use entity::{EntityKey, EntitySnapshot};
pub use messages::{
    ClientFrame, DeviceConfig, DeviceRegistration, PushIdentity, PushUpdate, ReconcileRequest,
    ReconcileResponse, RemoteChange, ServerFrame, UploadAck,
};
pub use operation::{
    NewOperation, OperationId, OperationPatch, OperationStatus, OperationType, SyncOperation,
};
