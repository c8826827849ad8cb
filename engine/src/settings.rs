//! Persisted sync settings.
//!
//! The `__config` system table stores two kinds of entries as
//! `id -> value` pairs: delta tokens under `deltaToken|<table>|<queryId>`
//! and per-table system-property flags under `systemProperties|<table>`.

use crate::error::Result;
use crate::store::LocalStore;
use crate::table::{ColumnDef, ColumnType, SystemProperties, TableDefinition};
use crate::value::{system, Item, Value};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use std::sync::Arc;

/// Name of the config system table.
pub const CONFIG_TABLE: &str = "__config";

/// Definition of the `__config` system table.
pub fn config_table_definition() -> TableDefinition {
    TableDefinition::new(CONFIG_TABLE).with_column("value", ColumnDef::of(ColumnType::String))
}

fn delta_token_key(table_name: &str, query_id: &str) -> String {
    format!("deltaToken|{table_name}|{query_id}")
}

fn system_properties_key(table_name: &str) -> String {
    format!("systemProperties|{table_name}")
}

/// Accessor over the `__config` table.
pub struct SyncSettings {
    store: Arc<dyn LocalStore>,
}

impl SyncSettings {
    /// Creates a settings accessor over the store.
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        let row = self.store.lookup(CONFIG_TABLE, key).await?;
        Ok(row
            .and_then(|r| r.get("value").and_then(Value::as_str).map(str::to_string)))
    }

    async fn set_value(&self, key: &str, value: String) -> Result<()> {
        let mut row = Item::new();
        row.insert(system::ID, key);
        row.insert("value", value);
        self.store.upsert(CONFIG_TABLE, vec![row], false).await?;
        Ok(())
    }

    /// Reads the delta token for `(table, query_id)`.
    ///
    /// Absent tokens read as the epoch, which makes the first
    /// incremental pull unbounded.
    pub async fn delta_token(
        &self,
        table_name: &str,
        query_id: &str,
    ) -> Result<DateTime<Utc>> {
        let value = self.get_value(&delta_token_key(table_name, query_id)).await?;
        Ok(value
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap()))
    }

    /// Upserts the delta token for `(table, query_id)`.
    pub async fn set_delta_token(
        &self,
        table_name: &str,
        query_id: &str,
        token: DateTime<Utc>,
    ) -> Result<()> {
        self.set_value(
            &delta_token_key(table_name, query_id),
            token.to_rfc3339_opts(SecondsFormat::Millis, true),
        )
        .await
    }

    /// Deletes the delta token for `(table, query_id)`.
    pub async fn reset_delta_token(&self, table_name: &str, query_id: &str) -> Result<()> {
        self.store
            .delete_ids(CONFIG_TABLE, &[delta_token_key(table_name, query_id)])
            .await?;
        Ok(())
    }

    /// Reads the persisted system-property flags for a table.
    pub async fn system_properties(&self, table_name: &str) -> Result<SystemProperties> {
        let value = self.get_value(&system_properties_key(table_name)).await?;
        Ok(value
            .and_then(|v| v.parse::<u8>().ok())
            .map(SystemProperties::from_byte)
            .unwrap_or(SystemProperties::ALL))
    }

    /// Persists the system-property flags for a table.
    pub async fn set_system_properties(
        &self,
        table_name: &str,
        properties: SystemProperties,
    ) -> Result<()> {
        self.set_value(
            &system_properties_key(table_name),
            properties.as_byte().to_string(),
        )
        .await
    }
}
