//! # offsync Conflict
//!
//! Conflict detection, analysis and resolution for the offsync engine.
//!
//! Given a local and a server snapshot of the same entity this crate:
//!
//! - decides whether they conflict ([`detect_conflict`])
//! - diffs them field by field ([`diff_documents`])
//! - scores severity and risk ([`ConflictAnalyzer`])
//! - runs a priority-ordered pipeline of [`ResolutionStrategy`]s
//! - keeps the conflict lifecycle and an immutable history
//!   ([`ConflictResolver`])
//!
//! Financial documents with core differences are never resolved
//! automatically.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod analysis;
mod diff;
mod error;
pub mod fields;
mod resolver;
mod strategy;

pub use analysis::{
    assess_risk, detect_conflict, severity, AutoResolution, ConflictAnalysis, ConflictAnalyzer,
    RiskAssessment,
};
pub use diff::{diff_documents, DiffKind, FieldDiff};
pub use error::{ConflictError, ConflictResult};
pub use fields::{EntityClass, FieldCategory, Significance};
pub use resolver::{
    ConflictOutcome, ConflictResolver, ManualResolution, ResolvedConflict, StrategyStats,
    DEFAULT_RETENTION_DAYS, MANUAL_RESOLVER,
};
pub use strategy::{
    AppendMerge, ConflictContext, LatestWinsNonCritical, ManualRequired, MetadataOnly,
    QuantityMerge, ResolutionStrategy, StrategyPipeline,
};
