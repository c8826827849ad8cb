//! Table definitions.
//!
//! A table definition maps column names to their declared and storage
//! types and records which system properties the remote table supports.
//! Definitions are declared before [`crate::SyncContext`] initialization
//! and frozen thereafter.

use crate::value::{system, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Prefix reserved for engine-owned system tables.
pub const SYSTEM_TABLE_PREFIX: &str = "__";

/// Returns true for engine-owned system tables.
pub fn is_system_table(name: &str) -> bool {
    name.starts_with(SYSTEM_TABLE_PREFIX)
}

/// Column types supported in table definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Integer,
    Float,
    Bool,
    Timestamp,
    Blob,
    /// Arbitrary nested JSON.
    Json,
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ColumnType::String => "String",
            ColumnType::Integer => "Integer",
            ColumnType::Float => "Float",
            ColumnType::Bool => "Bool",
            ColumnType::Timestamp => "Timestamp",
            ColumnType::Blob => "Blob",
            ColumnType::Json => "Json",
        };
        f.write_str(name)
    }
}

/// Declared and storage type for a column.
///
/// The declared type is what the application sees; the storage type is
/// what the embedded store persists. They usually agree, but stores
/// without a native timestamp type may declare `Timestamp` and store
/// `String`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDef {
    pub declared: ColumnType,
    pub storage: ColumnType,
}

impl ColumnDef {
    /// Column whose declared and storage type agree.
    pub fn of(column_type: ColumnType) -> Self {
        Self {
            declared: column_type,
            storage: column_type,
        }
    }

    /// Column with distinct declared and storage types.
    pub fn stored_as(declared: ColumnType, storage: ColumnType) -> Self {
        Self { declared, storage }
    }
}

/// System properties a remote table supports, as a bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SystemProperties(u8);

impl SystemProperties {
    /// No system properties.
    pub const NONE: Self = Self(0);
    /// `createdAt` timestamp.
    pub const CREATED_AT: Self = Self(0x01);
    /// `updatedAt` timestamp.
    pub const UPDATED_AT: Self = Self(0x02);
    /// `version` concurrency token.
    pub const VERSION: Self = Self(0x04);
    /// `deleted` soft-delete flag.
    pub const DELETED: Self = Self(0x08);
    /// All system properties.
    pub const ALL: Self = Self(0x0f);

    /// Creates flags from a raw byte.
    #[must_use]
    pub const fn from_byte(b: u8) -> Self {
        Self(b & 0x0f)
    }

    /// Returns the raw byte value.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self.0
    }

    /// Returns true if all of `other`'s flags are set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns a copy with `other`'s flags added.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// True when the table exposes the `version` token.
    #[must_use]
    pub const fn has_version(self) -> bool {
        self.contains(Self::VERSION)
    }
}

/// Table kind. Single-valued today; reserved for future table flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    #[default]
    Table,
}

impl TableKind {
    /// Persisted integer code.
    pub const fn as_code(self) -> i64 {
        match self {
            TableKind::Table => 0,
        }
    }

    /// Parses a persisted integer code.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(TableKind::Table),
            _ => None,
        }
    }
}

/// Definition of a synchronized table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDefinition {
    /// Table name.
    pub name: String,
    /// Columns by name.
    pub columns: BTreeMap<String, ColumnDef>,
    /// System properties the remote table supports.
    pub system_properties: SystemProperties,
}

impl TableDefinition {
    /// Creates a definition with the required `id` column and full
    /// system-property support.
    pub fn new(name: impl Into<String>) -> Self {
        let mut columns = BTreeMap::new();
        columns.insert(system::ID.to_string(), ColumnDef::of(ColumnType::String));
        Self {
            name: name.into(),
            columns,
            system_properties: SystemProperties::ALL,
        }
    }

    /// Adds a column.
    pub fn with_column(mut self, name: impl Into<String>, def: ColumnDef) -> Self {
        self.columns.insert(name.into(), def);
        self
    }

    /// Overrides the supported system properties.
    pub fn with_system_properties(mut self, properties: SystemProperties) -> Self {
        self.system_properties = properties;
        self
    }

    /// Returns true if the column is declared.
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Returns a copy with columns for every supported system property
    /// declared. Timestamps store as text for stores without a native
    /// timestamp type.
    pub fn ensured_system_columns(mut self) -> TableDefinition {
        let flags = self.system_properties;
        let mut ensure = |name: &str, def: ColumnDef| {
            self.columns.entry(name.to_string()).or_insert(def);
        };
        if flags.contains(SystemProperties::VERSION) {
            ensure(system::VERSION, ColumnDef::of(ColumnType::String));
        }
        if flags.contains(SystemProperties::CREATED_AT) {
            ensure(
                system::CREATED_AT,
                ColumnDef::stored_as(ColumnType::Timestamp, ColumnType::String),
            );
        }
        if flags.contains(SystemProperties::UPDATED_AT) {
            ensure(
                system::UPDATED_AT,
                ColumnDef::stored_as(ColumnType::Timestamp, ColumnType::String),
            );
        }
        if flags.contains(SystemProperties::DELETED) {
            ensure(system::DELETED, ColumnDef::of(ColumnType::Bool));
        }
        self
    }

    /// Checks a value against the declared type of a column.
    ///
    /// Unknown columns pass; stores may be configured to ignore them.
    pub fn value_fits(&self, name: &str, value: &Value) -> bool {
        let Some(def) = self.columns.get(name) else {
            return true;
        };
        match def.declared {
            ColumnType::String => matches!(value, Value::Null | Value::String(_)),
            ColumnType::Integer => matches!(value, Value::Null | Value::Integer(_)),
            ColumnType::Float => {
                matches!(value, Value::Null | Value::Float(_) | Value::Integer(_))
            }
            ColumnType::Bool => matches!(value, Value::Null | Value::Bool(_)),
            ColumnType::Timestamp => {
                matches!(value, Value::Null | Value::Timestamp(_))
                    || value.as_timestamp().is_some()
            }
            ColumnType::Blob => matches!(value, Value::Null | Value::Blob(_)),
            ColumnType::Json => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_table_names() {
        assert!(is_system_table("__operations"));
        assert!(!is_system_table("todos"));
    }

    #[test]
    fn definition_carries_id_column() {
        let def = TableDefinition::new("todos");
        assert!(def.has_column("id"));
        assert_eq!(def.system_properties, SystemProperties::ALL);
    }

    #[test]
    fn system_property_flags() {
        let flags = SystemProperties::NONE
            .with(SystemProperties::VERSION)
            .with(SystemProperties::UPDATED_AT);
        assert!(flags.has_version());
        assert!(flags.contains(SystemProperties::UPDATED_AT));
        assert!(!flags.contains(SystemProperties::CREATED_AT));
        assert_eq!(SystemProperties::from_byte(flags.as_byte()), flags);
    }

    #[test]
    fn value_type_checks() {
        let def = TableDefinition::new("todos")
            .with_column("title", ColumnDef::of(ColumnType::String))
            .with_column("due", ColumnDef::stored_as(ColumnType::Timestamp, ColumnType::String));

        assert!(def.value_fits("title", &Value::String("x".into())));
        assert!(!def.value_fits("title", &Value::Integer(1)));
        assert!(def.value_fits("due", &Value::String("2024-01-01T00:00:00Z".into())));
        assert!(!def.value_fits("due", &Value::String("not a date".into())));
        assert!(def.value_fits("unknown", &Value::Integer(1)));
    }

    #[test]
    fn system_columns_are_ensured() {
        let def = TableDefinition::new("todos").ensured_system_columns();
        for column in ["id", "version", "createdAt", "updatedAt", "deleted"] {
            assert!(def.has_column(column), "missing column {column}");
        }

        let bare = TableDefinition::new("todos")
            .with_system_properties(SystemProperties::VERSION)
            .ensured_system_columns();
        assert!(bare.has_column("version"));
        assert!(!bare.has_column("createdAt"));
    }

    #[test]
    fn table_kind_codes() {
        assert_eq!(TableKind::from_code(TableKind::Table.as_code()), Some(TableKind::Table));
        assert_eq!(TableKind::from_code(7), None);
    }
}
