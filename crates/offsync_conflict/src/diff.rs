//! Deep field diff between two entity documents.
//!
//! Differences are reported from the local side's point of view: a field or
//! list item present only on the server side is "added", one present only
//! locally is "removed".

use crate::fields::{category, significance, FieldCategory, Significance};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Kind of a single difference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffKind {
    /// Same type, different value.
    ValueChange,
    /// The JSON type differs.
    TypeChange,
    /// Present only on the server side.
    FieldAdded,
    /// Present only on the local side.
    FieldRemoved,
    /// A list item present only on the server side.
    ArrayItemAdded,
    /// A list item present only on the local side.
    ArrayItemRemoved,
}

/// One difference between the local and the server document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDiff {
    /// Dotted path to the differing value.
    pub path: String,
    /// Top-level field the path starts at; drives classification.
    pub field: String,
    /// Kind of difference.
    pub kind: DiffKind,
    /// Local value (the item, for list diffs).
    pub local: Option<Value>,
    /// Server value (the item, for list diffs).
    pub server: Option<Value>,
    /// Significance of `field`.
    pub significance: Significance,
    /// Category of `field`.
    pub category: FieldCategory,
}

impl FieldDiff {
    fn new(
        path: &str,
        field: &str,
        kind: DiffKind,
        local: Option<&Value>,
        server: Option<&Value>,
    ) -> Self {
        Self {
            path: path.to_string(),
            field: field.to_string(),
            kind,
            local: local.cloned(),
            server: server.cloned(),
            significance: significance(field),
            category: category(field),
        }
    }

    /// Returns true for list item differences.
    pub fn is_array_item(&self) -> bool {
        matches!(self.kind, DiffKind::ArrayItemAdded | DiffKind::ArrayItemRemoved)
    }

    /// Returns true if the diff is on a core field.
    pub fn is_core(&self) -> bool {
        self.category == FieldCategory::Core
    }

    /// Returns true if the diff is on a high-significance field.
    pub fn is_high(&self) -> bool {
        self.significance == Significance::High
    }
}

/// Diffs two documents.
///
/// Non-object documents are treated as a single unnamed field.
pub fn diff_documents(local: &Value, server: &Value) -> Vec<FieldDiff> {
    let mut diffs = Vec::new();
    match (local, server) {
        (Value::Object(l), Value::Object(s)) => diff_objects("", None, l, s, &mut diffs),
        _ => diff_values("", "", Some(local), Some(server), &mut diffs),
    }
    diffs
}

fn diff_objects(
    prefix: &str,
    root: Option<&str>,
    local: &Map<String, Value>,
    server: &Map<String, Value>,
    out: &mut Vec<FieldDiff>,
) {
    let keys: BTreeSet<&String> = local.keys().chain(server.keys()).collect();
    for key in keys {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        let field = root.unwrap_or(key.as_str());
        diff_values(&path, field, local.get(key), server.get(key), out);
    }
}

fn diff_values(
    path: &str,
    field: &str,
    local: Option<&Value>,
    server: Option<&Value>,
    out: &mut Vec<FieldDiff>,
) {
    match (local, server) {
        (None, None) => {}
        (None, Some(_)) => out.push(FieldDiff::new(path, field, DiffKind::FieldAdded, None, server)),
        (Some(_), None) => out.push(FieldDiff::new(path, field, DiffKind::FieldRemoved, local, None)),
        (Some(l), Some(s)) if l == s => {}
        (Some(Value::Object(l)), Some(Value::Object(s))) => {
            diff_objects(path, Some(field), l, s, out);
        }
        (Some(Value::Array(l)), Some(Value::Array(s))) => {
            for (item, extra) in surplus(s, l) {
                for _ in 0..extra {
                    out.push(FieldDiff::new(path, field, DiffKind::ArrayItemAdded, None, Some(item)));
                }
            }
            for (item, extra) in surplus(l, s) {
                for _ in 0..extra {
                    out.push(FieldDiff::new(path, field, DiffKind::ArrayItemRemoved, Some(item), None));
                }
            }
        }
        (Some(l), Some(s)) => {
            let kind = if same_type(l, s) {
                DiffKind::ValueChange
            } else {
                DiffKind::TypeChange
            };
            out.push(FieldDiff::new(path, field, kind, local, server));
        }
    }
}

/// Items occurring more often in `a` than in `b`, with the excess, in
/// first-seen order.
fn surplus<'a>(a: &'a [Value], b: &[Value]) -> Vec<(&'a Value, usize)> {
    let mut seen: Vec<&Value> = Vec::new();
    let mut out = Vec::new();
    for item in a {
        if seen.contains(&item) {
            continue;
        }
        seen.push(item);
        let in_a = a.iter().filter(|v| *v == item).count();
        let in_b = b.iter().filter(|v| *v == item).count();
        if in_a > in_b {
            out.push((item, in_a - in_b));
        }
    }
    out
}

fn same_type(a: &Value, b: &Value) -> bool {
    std::mem::discriminant(a) == std::mem::discriminant(b)
}
