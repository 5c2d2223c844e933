//! # offsync Store
//!
//! Durable local storage for the offsync engine.
//!
//! The store holds three kinds of state:
//! - entity snapshots, one per `(kind, id)`
//! - the pending-operation log
//! - sync metadata, conflicts and the resolution history
//!
//! ## Design Principles
//!
//! - Every call is atomic; [`StoreBatch`] makes multi-entity writes
//!   all-or-nothing
//! - A batch is validated before anything is written, so a failed batch
//!   leaves no trace
//! - Stores are `Send + Sync` and can be shared behind an `Arc`
//!
//! ## Available Stores
//!
//! - [`MemoryStore`] - For testing and ephemeral use
//! - [`FileStore`] - Journal-backed persistent storage
//!
//! ## Example
//!
//! ```rust
//! use offsync_store::{LocalStore, MemoryStore};
//! use offsync_protocol::EntitySnapshot;
//! use chrono::Utc;
//! use serde_json::json;
//!
//! let store = MemoryStore::new();
//! store
//!     .put(EntitySnapshot::new("Customer", "1", json!({"name": "Ada"}), Utc::now()))
//!     .unwrap();
//! assert!(store.get("Customer", "1").unwrap().is_some());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod batch;
mod error;
mod file;
mod journal;
mod memory;
mod state;

pub use backend::{ConflictFilter, LocalStore};
pub use batch::{BatchOp, StoreBatch};
pub use error::{StorageError, StorageResult};
pub use file::{CompactionReport, FileStore, FileStoreOptions};
pub use journal::{compute_crc32, JOURNAL_MAGIC};
pub use memory::MemoryStore;
