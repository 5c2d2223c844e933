//! Static field and entity-kind tables.
//!
//! Field names are compared in normalized form: lowercase with `_` and `-`
//! removed, so `stock_quantity`, `stockQuantity` and `StockQuantity` are the
//! same field.

use serde::{Deserialize, Serialize};

/// How much a difference in a field matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Significance {
    /// Everything not listed.
    Low,
    /// Descriptive and audit fields.
    Medium,
    /// Identifiers, money, quantities and status.
    High,
}

/// What role a field plays in the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldCategory {
    /// Business data proper.
    Core,
    /// Bookkeeping that carries no business meaning.
    Metadata,
    /// References to other entities and nested collections.
    Relations,
    /// Values derived from other fields.
    Computed,
}

/// Broad class of an entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityClass {
    /// Sales, purchase and payment documents.
    FinancialDocument,
    /// Products and stock.
    Inventory,
    /// Customers, suppliers and users.
    Identity,
    /// Anything else.
    General,
}

const HIGH_FIELDS: &[&str] = &[
    "id",
    "code",
    "sku",
    "barcode",
    "taxid",
    "email",
    "amount",
    "total",
    "subtotal",
    "grandtotal",
    "taxamount",
    "price",
    "unitprice",
    "cost",
    "unitcost",
    "balance",
    "discount",
    "quantity",
    "stock",
    "stockquantity",
    "quantityonhand",
    "availablequantity",
    "status",
    "paymentstatus",
    "currency",
];

const MEDIUM_FIELDS: &[&str] = &[
    "name",
    "title",
    "description",
    "notes",
    "phone",
    "address",
    "createdat",
    "updatedat",
    "lastmodified",
    "createdby",
    "updatedby",
    "lastsyncedat",
];

const METADATA_FIELDS: &[&str] = &[
    "createdat",
    "updatedat",
    "lastmodified",
    "createdby",
    "updatedby",
    "lastsyncedat",
    "syncedat",
    "etag",
    "revision",
    "version",
    "deviceid",
];

const RELATION_FIELDS: &[&str] = &[
    "addresses",
    "phonenumbers",
    "phones",
    "contacts",
    "emails",
    "tags",
    "items",
    "lines",
    "variants",
];

const COMPUTED_FIELDS: &[&str] = &[
    "total",
    "subtotal",
    "taxamount",
    "grandtotal",
    "balance",
    "fullname",
];

const CORE_FIELDS: &[&str] = &[
    "id",
    "code",
    "sku",
    "barcode",
    "taxid",
    "email",
    "name",
    "title",
    "description",
    "amount",
    "price",
    "unitprice",
    "cost",
    "unitcost",
    "discount",
    "quantity",
    "stock",
    "stockquantity",
    "quantityonhand",
    "availablequantity",
    "reorderlevel",
    "reorderpoint",
    "minstock",
    "maxstock",
    "safetystock",
    "lowstockthreshold",
    "status",
    "paymentstatus",
    "currency",
    "phone",
    "notes",
];

const STOCK_FIELDS: &[&str] = &[
    "stock",
    "stockquantity",
    "quantityonhand",
    "availablequantity",
    "reservedquantity",
    "reorderlevel",
    "reorderpoint",
    "reorderquantity",
    "minstock",
    "maxstock",
    "minimumstock",
    "maximumstock",
    "safetystock",
    "lowstockthreshold",
];

const FINANCIAL_KINDS: &[&str] = &[
    "sale",
    "sales",
    "salesorder",
    "invoice",
    "purchase",
    "purchaseorder",
    "payment",
    "receipt",
    "creditnote",
];

const INVENTORY_KINDS: &[&str] = &[
    "product",
    "productvariant",
    "inventory",
    "inventoryitem",
    "stock",
    "stockitem",
];

const IDENTITY_KINDS: &[&str] = &["customer", "supplier", "contact", "user"];

/// Fields compared by the version-less detection heuristic.
pub const IDENTITY_FIELDS: &[&str] = &["name", "title", "code", "description", "sku", "email"];

/// Scalar fields whose divergence rules out list merging on identity kinds.
pub const IDENTITY_SCALARS: &[&str] = &["name", "email", "taxid"];

/// Keys tried in order to match list items across sides.
pub const NATURAL_KEYS: &[&str] = &["id", "number", "phone", "email", "value"];

/// Normalizes a field or kind name for table lookups.
pub fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Returns the significance of `field`.
pub fn significance(field: &str) -> Significance {
    let field = normalize(field);
    if HIGH_FIELDS.contains(&field.as_str()) {
        Significance::High
    } else if MEDIUM_FIELDS.contains(&field.as_str()) {
        Significance::Medium
    } else {
        Significance::Low
    }
}

/// Returns the category of `field`.
///
/// Unknown fields are metadata: a difference nobody declared meaningful
/// must not block automatic resolution.
pub fn category(raw: &str) -> FieldCategory {
    let field = normalize(raw);
    let field = field.as_str();
    if METADATA_FIELDS.contains(&field) {
        FieldCategory::Metadata
    } else if COMPUTED_FIELDS.contains(&field) {
        FieldCategory::Computed
    } else if CORE_FIELDS.contains(&field) {
        FieldCategory::Core
    } else if RELATION_FIELDS.contains(&field) || is_reference(raw) {
        FieldCategory::Relations
    } else {
        FieldCategory::Metadata
    }
}

/// Returns true for `customerId`, `customer_id` and `customer-id` style names.
fn is_reference(raw: &str) -> bool {
    raw.len() > 2 && ["_id", "-id", "Id"].iter().any(|suffix| raw.ends_with(suffix))
}

/// Returns true for stock levels and reorder thresholds.
pub fn is_stock_field(field: &str) -> bool {
    STOCK_FIELDS.contains(&normalize(field).as_str())
}

/// Returns true for the identity scalars of [`IDENTITY_SCALARS`].
pub fn is_identity_scalar(field: &str) -> bool {
    IDENTITY_SCALARS.contains(&normalize(field).as_str())
}

/// Classifies an entity kind.
pub fn classify_kind(kind: &str) -> EntityClass {
    let kind = normalize(kind);
    let kind = kind.as_str();
    if FINANCIAL_KINDS.contains(&kind) {
        EntityClass::FinancialDocument
    } else if INVENTORY_KINDS.contains(&kind) {
        EntityClass::Inventory
    } else if IDENTITY_KINDS.contains(&kind) {
        EntityClass::Identity
    } else {
        EntityClass::General
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_separators_and_case() {
        assert_eq!(normalize("stock_quantity"), "stockquantity");
        assert_eq!(normalize("StockQuantity"), "stockquantity");
        assert_eq!(normalize("tax-id"), "taxid");
    }

    #[test]
    fn significance_table() {
        assert_eq!(significance("email"), Significance::High);
        assert_eq!(significance("stockQuantity"), Significance::High);
        assert_eq!(significance("updatedAt"), Significance::Medium);
        assert_eq!(significance("description"), Significance::Medium);
        assert_eq!(significance("favouriteColour"), Significance::Low);
    }

    #[test]
    fn category_table() {
        assert_eq!(category("email"), FieldCategory::Core);
        assert_eq!(category("updated_at"), FieldCategory::Metadata);
        assert_eq!(category("customerId"), FieldCategory::Relations);
        assert_eq!(category("addresses"), FieldCategory::Relations);
        assert_eq!(category("grandTotal"), FieldCategory::Computed);
        assert_eq!(category("id"), FieldCategory::Core);
        assert_eq!(category("somethingElse"), FieldCategory::Metadata);
    }

    #[test]
    fn only_id_suffixes_are_references() {
        for field in ["customerId", "customer_id", "warehouse-id"] {
            assert_eq!(category(field), FieldCategory::Relations, "{field}");
        }
        for field in ["paid", "void", "valid", "Id"] {
            assert_ne!(category(field), FieldCategory::Relations, "{field}");
        }
    }

    #[test]
    fn metadata_fields_are_never_high() {
        for field in METADATA_FIELDS {
            assert_ne!(significance(field), Significance::High, "{field}");
        }
    }

    #[test]
    fn kinds_are_classified() {
        assert_eq!(classify_kind("SalesOrder"), EntityClass::FinancialDocument);
        assert_eq!(classify_kind("invoice"), EntityClass::FinancialDocument);
        assert_eq!(classify_kind("ProductVariant"), EntityClass::Inventory);
        assert_eq!(classify_kind("Customer"), EntityClass::Identity);
        assert_eq!(classify_kind("Note"), EntityClass::General);
    }

    #[test]
    fn stock_fields() {
        assert!(is_stock_field("stockQuantity"));
        assert!(is_stock_field("reorder_level"));
        assert!(!is_stock_field("price"));
    }
}
