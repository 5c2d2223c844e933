//! # offsync Testkit
//!
//! Test utilities for offsync.
//!
//! This crate provides:
//! - Test fixtures, sample documents and an engine harness
//! - Property-based test generators using proptest
//! - An in-memory reconciliation server implementing `SyncTransport`
//! - A scripted push channel implementing `PushConnector`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use offsync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn uploads_a_customer() {
//!     let harness = TestHarness::new("pos-1");
//!     harness.engine.enqueue(NewOperation::create("Customer", "1", customer("Ada", "ada@x.com")))?;
//!     harness.engine.sync_now().await?;
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod push;
pub mod server;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::push::*;
    pub use crate::server::*;
}

pub use fixtures::*;
pub use generators::*;
pub use push::*;
pub use server::*;
