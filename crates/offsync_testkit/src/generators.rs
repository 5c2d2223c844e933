//! Property-based test generators using proptest.
//!
//! Provides strategies for entity identities, JSON documents and queued
//! operations.

use offsync_protocol::{EntityKey, NewOperation, OperationType};
use proptest::prelude::*;
use serde_json::{Map, Value};

/// Strategy for entity kinds drawn from a small business vocabulary.
pub fn entity_kind_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec![
        "Customer",
        "Product",
        "ProductVariant",
        "Invoice",
        "Payment",
        "Order",
    ])
    .prop_map(String::from)
}

/// Strategy for entity ids.
pub fn entity_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z0-9]{1,8}").expect("Invalid regex")
}

/// Strategy for entity keys.
pub fn entity_key_strategy() -> impl Strategy<Value = EntityKey> {
    (entity_kind_strategy(), entity_id_strategy()).prop_map(|(kind, id)| EntityKey::new(kind, id))
}

/// Strategy for scalar JSON values.
pub fn json_scalar_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i32>().prop_map(|n| Value::from(i64::from(n))),
        prop::string::string_regex("[a-zA-Z0-9 @.]{0,16}")
            .expect("Invalid regex")
            .prop_map(Value::String),
    ]
}

/// Strategy for flat JSON documents with camelCase field names.
pub fn document_strategy() -> impl Strategy<Value = Value> {
    prop::collection::btree_map(
        prop::string::string_regex("[a-z][a-zA-Z]{0,11}").expect("Invalid regex"),
        json_scalar_strategy(),
        0..8,
    )
    .prop_map(|fields| Value::Object(fields.into_iter().collect::<Map<String, Value>>()))
}

/// Strategy for operation types.
pub fn op_type_strategy() -> impl Strategy<Value = OperationType> {
    prop_oneof![
        Just(OperationType::Create),
        Just(OperationType::Update),
        Just(OperationType::Delete),
    ]
}

/// Strategy for operations as business code would submit them.
pub fn new_operation_strategy() -> impl Strategy<Value = NewOperation> {
    (op_type_strategy(), entity_key_strategy(), document_strategy()).prop_map(
        |(op_type, key, document)| match op_type {
            OperationType::Create => NewOperation::create(key.kind, key.id, document),
            OperationType::Update => NewOperation::update(key.kind, key.id, document),
            OperationType::Delete => NewOperation::delete(key.kind, key.id),
        },
    )
}
