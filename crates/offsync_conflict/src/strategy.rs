//! Resolution strategies and the priority-ordered pipeline.

use crate::analysis::AutoResolution;
use crate::diff::FieldDiff;
use crate::fields::{
    is_identity_scalar, is_stock_field, normalize, EntityClass, FieldCategory, NATURAL_KEYS,
};
use offsync_protocol::{EntitySnapshot, ResolutionChoice};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Everything a strategy may look at.
#[derive(Debug, Clone, Copy)]
pub struct ConflictContext<'a> {
    /// Entity kind as sent by the server.
    pub kind: &'a str,
    /// Class of the kind.
    pub class: EntityClass,
    /// Local side.
    pub local: &'a EntitySnapshot,
    /// Server side.
    pub server: &'a EntitySnapshot,
    /// Diffs between the two sides.
    pub diffs: &'a [FieldDiff],
}

impl ConflictContext<'_> {
    /// Returns the more recently modified side; ties go to the server.
    pub fn latest(&self) -> (ResolutionChoice, &EntitySnapshot) {
        if self.local.last_modified > self.server.last_modified {
            (ResolutionChoice::Local, self.local)
        } else {
            (ResolutionChoice::Server, self.server)
        }
    }
}

/// A named rule that proposes how to reconcile a conflict.
///
/// Strategies are evaluated highest [`priority`](Self::priority) first. The
/// first one that applies to the kind, finds the conflict applicable and
/// returns a resolution wins.
pub trait ResolutionStrategy: Send + Sync {
    /// Stable name, recorded in the resolution history.
    fn name(&self) -> &str;

    /// Evaluation priority. Higher runs first.
    fn priority(&self) -> i32;

    /// Whether the strategy may close conflicts without a human.
    fn auto_resolve(&self) -> bool {
        true
    }

    /// Whether the strategy covers entities of `class`.
    fn applies_to(&self, class: EntityClass) -> bool;

    /// Whether the strategy can handle this particular conflict.
    fn is_applicable(&self, ctx: &ConflictContext<'_>) -> bool;

    /// Proposes a resolution, or `None` to pass.
    fn resolve(&self, ctx: &ConflictContext<'_>) -> Option<AutoResolution>;
}

fn numeric_max(a: Option<&Value>, b: Option<&Value>) -> Option<Value> {
    match (a, b) {
        (Some(a), Some(b)) => {
            let (x, y) = (a.as_f64()?, b.as_f64()?);
            Some(if x >= y { a.clone() } else { b.clone() })
        }
        (Some(v), None) | (None, Some(v)) if v.is_number() => Some(v.clone()),
        _ => None,
    }
}

/// Takes the larger value of every differing stock or threshold field.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuantityMerge;

impl ResolutionStrategy for QuantityMerge {
    fn name(&self) -> &str {
        "quantity_merge"
    }

    fn priority(&self) -> i32 {
        50
    }

    fn applies_to(&self, class: EntityClass) -> bool {
        class == EntityClass::Inventory
    }

    fn is_applicable(&self, ctx: &ConflictContext<'_>) -> bool {
        !ctx.diffs.is_empty()
            && ctx
                .diffs
                .iter()
                .all(|d| !d.path.contains('.') && is_stock_field(&d.field))
    }

    fn resolve(&self, ctx: &ConflictContext<'_>) -> Option<AutoResolution> {
        let mut data = ctx.server.data.as_object()?.clone();
        let local = ctx.local.data.as_object()?;
        for diff in ctx.diffs {
            let merged = numeric_max(local.get(&diff.field), data.get(&diff.field))?;
            data.insert(diff.field.clone(), merged);
        }
        Some(AutoResolution {
            strategy: self.name().to_string(),
            choice: ResolutionChoice::Merge,
            data: Value::Object(data),
        })
    }
}

fn natural_key(item: &Value) -> Option<(String, Value)> {
    let object = item.as_object()?;
    NATURAL_KEYS.iter().find_map(|wanted| {
        object
            .iter()
            .find(|(key, value)| normalize(key) == *wanted && !value.is_null())
            .map(|(_, value)| ((*wanted).to_string(), value.clone()))
    })
}

fn union_by_key(local: &[Value], server: &[Value]) -> Vec<Value> {
    let mut merged: Vec<Value> = Vec::with_capacity(local.len() + server.len());
    for item in server.iter().chain(local) {
        let duplicate = match natural_key(item) {
            Some(key) => merged
                .iter()
                .any(|existing| natural_key(existing).as_ref() == Some(&key)),
            None => merged.contains(item),
        };
        if !duplicate {
            merged.push(item.clone());
        }
    }
    merged
}

/// Unions list-valued fields of identity entities.
///
/// Items are deduplicated by their natural key (`id`, `number`, `phone`,
/// `email` or `value`, first one present) or by full equality. Non-core
/// scalars come from the more recently modified side.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppendMerge;

impl ResolutionStrategy for AppendMerge {
    fn name(&self) -> &str {
        "append_merge"
    }

    fn priority(&self) -> i32 {
        40
    }

    fn applies_to(&self, class: EntityClass) -> bool {
        class == EntityClass::Identity
    }

    fn is_applicable(&self, ctx: &ConflictContext<'_>) -> bool {
        let scalar_core = ctx
            .diffs
            .iter()
            .any(|d| !d.is_array_item() && (d.is_core() || is_identity_scalar(&d.field)));
        !scalar_core && ctx.diffs.iter().any(FieldDiff::is_array_item)
    }

    fn resolve(&self, ctx: &ConflictContext<'_>) -> Option<AutoResolution> {
        let (_, latest) = ctx.latest();
        let mut data: Map<String, Value> = latest.data.as_object()?.clone();
        let local = ctx.local.data.as_object()?;
        let server = ctx.server.data.as_object()?;

        for diff in ctx.diffs.iter().filter(|d| d.is_array_item()) {
            if let (Some(Value::Array(l)), Some(Value::Array(s))) =
                (local.get(&diff.field), server.get(&diff.field))
            {
                data.insert(diff.field.clone(), Value::Array(union_by_key(l, s)));
            }
        }

        Some(AutoResolution {
            strategy: self.name().to_string(),
            choice: ResolutionChoice::Merge,
            data: Value::Object(data),
        })
    }
}

/// Keeps the more recently modified side when only metadata differs.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataOnly;

impl ResolutionStrategy for MetadataOnly {
    fn name(&self) -> &str {
        "metadata_only"
    }

    fn priority(&self) -> i32 {
        30
    }

    fn applies_to(&self, _class: EntityClass) -> bool {
        true
    }

    fn is_applicable(&self, ctx: &ConflictContext<'_>) -> bool {
        ctx.diffs
            .iter()
            .all(|d| d.category == FieldCategory::Metadata)
    }

    fn resolve(&self, ctx: &ConflictContext<'_>) -> Option<AutoResolution> {
        let (choice, latest) = ctx.latest();
        Some(AutoResolution {
            strategy: self.name().to_string(),
            choice,
            data: latest.data.clone(),
        })
    }
}

/// Keeps the more recently modified side when nothing important differs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatestWinsNonCritical;

impl ResolutionStrategy for LatestWinsNonCritical {
    fn name(&self) -> &str {
        "latest_wins_non_critical"
    }

    fn priority(&self) -> i32 {
        20
    }

    fn applies_to(&self, _class: EntityClass) -> bool {
        true
    }

    fn is_applicable(&self, ctx: &ConflictContext<'_>) -> bool {
        !ctx.diffs.iter().any(|d| d.is_high() || d.is_core())
    }

    fn resolve(&self, ctx: &ConflictContext<'_>) -> Option<AutoResolution> {
        let (choice, latest) = ctx.latest();
        Some(AutoResolution {
            strategy: self.name().to_string(),
            choice,
            data: latest.data.clone(),
        })
    }
}

/// Universal fallback. Never resolves; the conflict waits for a human.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualRequired;

impl ResolutionStrategy for ManualRequired {
    fn name(&self) -> &str {
        "manual_required"
    }

    fn priority(&self) -> i32 {
        0
    }

    fn auto_resolve(&self) -> bool {
        false
    }

    fn applies_to(&self, _class: EntityClass) -> bool {
        true
    }

    fn is_applicable(&self, _ctx: &ConflictContext<'_>) -> bool {
        true
    }

    fn resolve(&self, _ctx: &ConflictContext<'_>) -> Option<AutoResolution> {
        None
    }
}

/// Priority-ordered list of strategies.
///
/// # Example
///
/// ```rust
/// use offsync_conflict::StrategyPipeline;
///
/// let pipeline = StrategyPipeline::new();
/// assert_eq!(pipeline.names().first().copied(), Some("quantity_merge"));
/// assert_eq!(pipeline.names().last().copied(), Some("manual_required"));
/// ```
#[derive(Clone)]
pub struct StrategyPipeline {
    strategies: Vec<Arc<dyn ResolutionStrategy>>,
}

impl StrategyPipeline {
    /// Creates a pipeline with the five built-in strategies.
    pub fn new() -> Self {
        let mut pipeline = Self::empty();
        pipeline.register(Arc::new(QuantityMerge));
        pipeline.register(Arc::new(AppendMerge));
        pipeline.register(Arc::new(MetadataOnly));
        pipeline.register(Arc::new(LatestWinsNonCritical));
        pipeline.register(Arc::new(ManualRequired));
        pipeline
    }

    /// Creates a pipeline without strategies.
    pub fn empty() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// Adds a strategy, keeping the list ordered by descending priority.
    /// Strategies of equal priority keep registration order.
    pub fn register(&mut self, strategy: Arc<dyn ResolutionStrategy>) {
        let at = self
            .strategies
            .iter()
            .position(|s| s.priority() < strategy.priority())
            .unwrap_or(self.strategies.len());
        self.strategies.insert(at, strategy);
    }

    /// Returns strategy names in evaluation order.
    pub fn names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Runs the pipeline and returns the first proposed resolution.
    pub fn resolve(&self, ctx: &ConflictContext<'_>) -> Option<AutoResolution> {
        for strategy in &self.strategies {
            if !strategy.applies_to(ctx.class) || !strategy.is_applicable(ctx) {
                continue;
            }
            if !strategy.auto_resolve() {
                tracing::debug!(strategy = strategy.name(), "strategy requires a manual decision");
                return None;
            }
            if let Some(resolution) = strategy.resolve(ctx) {
                return Some(resolution);
            }
        }
        None
    }
}

impl Default for StrategyPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StrategyPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyPipeline")
            .field("strategies", &self.names())
            .finish()
    }
}
