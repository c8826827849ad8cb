//! Three-way conflict resolution.
//!
//! An update that fails with a server conflict carries three versions
//! of the item: the merge base (last server-acknowledged state), the
//! local edit, and the server's current copy. The conflict engine diffs
//! them property by property, lets the application resolve each
//! conflicted property exactly once, and produces a merged item to
//! resubmit.

use crate::error::{Error, Result};
use crate::operations::OperationKind;
use crate::sync_error::TableOperationError;
use crate::value::{system, Item, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Pluggable equality for property values.
///
/// Registered per `(table, property)`; unregistered pairs use
/// structural equality.
pub trait PropertyValueComparer: Send + Sync {
    /// True when the two values are considered equal.
    fn equals(&self, a: &Value, b: &Value) -> bool;
}

impl<F> PropertyValueComparer for F
where
    F: Fn(&Value, &Value) -> bool + Send + Sync,
{
    fn equals(&self, a: &Value, b: &Value) -> bool {
        self(a, b)
    }
}

/// Registry of property comparers, keyed by `(table, property)`.
///
/// Scoped to one sync context; two contexts in a process never share
/// comparers.
#[derive(Default)]
pub struct ComparerRegistry {
    comparers: HashMap<(String, String), Arc<dyn PropertyValueComparer>>,
}

impl ComparerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a comparer for a `(table, property)` pair.
    pub fn register(
        &mut self,
        table_name: impl Into<String>,
        property_name: impl Into<String>,
        comparer: Arc<dyn PropertyValueComparer>,
    ) {
        self.comparers
            .insert((table_name.into(), property_name.into()), comparer);
    }

    /// Compares two values for a property, falling back to structural
    /// equality.
    pub fn equals(&self, table_name: &str, property_name: &str, a: &Value, b: &Value) -> bool {
        match self
            .comparers
            .get(&(table_name.to_string(), property_name.to_string()))
        {
            Some(comparer) => comparer.equals(a, b),
            None => a == b,
        }
    }
}

/// One conflicted property of an update error.
#[derive(Debug, Clone)]
pub struct PropertyConflict {
    /// Conflicted property name.
    pub property_name: String,
    /// Value in the merge base.
    pub base_value: Value,
    /// Value in the local edit.
    pub local_value: Value,
    /// Value in the server's current copy.
    pub remote_value: Value,
    /// The chosen resolution, once handled.
    pub resolved_value: Option<Value>,
    /// Set by the first resolution call; a second call fails.
    pub handled: bool,
    /// The local side diverged from the base.
    pub is_local_changed: bool,
    /// The remote side diverged from the base.
    pub is_remote_changed: bool,
}

impl PropertyConflict {
    fn resolve(&mut self, value: Value) -> Result<()> {
        if self.handled {
            return Err(Error::AlreadyHandled(self.property_name.clone()));
        }
        self.resolved_value = Some(value);
        self.handled = true;
        Ok(())
    }

    /// Resolves with the server's value.
    pub fn take_remote(&mut self) -> Result<()> {
        let value = self.remote_value.clone();
        self.resolve(value)
    }

    /// Resolves with the local value.
    pub fn take_local(&mut self) -> Result<()> {
        let value = self.local_value.clone();
        self.resolve(value)
    }

    /// Resolves with an arbitrary value.
    pub fn update_value(&mut self, value: impl Into<Value>) -> Result<()> {
        self.resolve(value.into())
    }
}

/// The conflict set of one failed update, ready for resolution.
#[derive(Debug)]
pub struct UpdateConflict {
    error: TableOperationError,
    remote_item: Item,
    conflicts: Vec<PropertyConflict>,
}

impl UpdateConflict {
    /// Builds the conflict set from an update error.
    ///
    /// The set contains one entry per property present in all three of
    /// base, local, and remote (system properties excluded), skipping
    /// properties where local and remote already agree and properties
    /// neither side changed. Non-primitive values in a surviving entry
    /// are rejected.
    pub fn build(error: TableOperationError, comparers: &ComparerRegistry) -> Result<Self> {
        if error.operation_kind != OperationKind::Update {
            return Err(Error::invalid_input(
                "property conflicts exist only for update operations",
            ));
        }
        let base = error.previous_item.clone().ok_or_else(|| {
            Error::invalid_input("the error does not carry the merge base")
        })?;
        let remote = error.result.clone().ok_or_else(|| {
            Error::invalid_input("the error does not carry the server item")
        })?;
        let local = error.item.clone();
        let table = error.table_name.clone();

        let mut conflicts = Vec::new();
        for (name, local_value) in local.iter() {
            if system::is_system_property(name) || name == system::ID {
                continue;
            }
            let (Some(base_value), Some(remote_value)) = (base.get(name), remote.get(name))
            else {
                continue;
            };
            if comparers.equals(&table, name, local_value, remote_value) {
                continue;
            }
            let is_local_changed = !comparers.equals(&table, name, base_value, local_value);
            let is_remote_changed = !comparers.equals(&table, name, base_value, remote_value);
            if !is_local_changed && !is_remote_changed {
                continue;
            }
            if !base_value.is_primitive()
                || !local_value.is_primitive()
                || !remote_value.is_primitive()
            {
                return Err(Error::UnsupportedConflictValue(name.clone()));
            }
            conflicts.push(PropertyConflict {
                property_name: name.clone(),
                base_value: base_value.clone(),
                local_value: local_value.clone(),
                remote_value: remote_value.clone(),
                resolved_value: None,
                handled: false,
                is_local_changed,
                is_remote_changed,
            });
        }

        Ok(Self {
            error,
            remote_item: remote,
            conflicts,
        })
    }

    /// The underlying error row.
    pub fn error(&self) -> &TableOperationError {
        &self.error
    }

    /// The conflicted properties.
    pub fn conflicts(&self) -> &[PropertyConflict] {
        &self.conflicts
    }

    /// The conflicted properties, for resolution.
    pub fn conflicts_mut(&mut self) -> &mut [PropertyConflict] {
        &mut self.conflicts
    }

    /// One conflicted property by name, for resolution.
    pub fn conflict_mut(&mut self, property_name: &str) -> Option<&mut PropertyConflict> {
        self.conflicts
            .iter_mut()
            .find(|c| c.property_name == property_name)
    }

    /// True when every conflict has been resolved. An empty set is
    /// fully handled: when local and remote already agree everywhere,
    /// the merge is immediate.
    pub fn is_fully_handled(&self) -> bool {
        self.conflicts.iter().all(|c| c.handled)
    }

    /// Produces the merged item: the server's copy with each conflicted
    /// property overwritten by its resolution.
    pub fn merged_item(&self) -> Result<Item> {
        if !self.is_fully_handled() {
            let unresolved: Vec<_> = self
                .conflicts
                .iter()
                .filter(|c| !c.handled)
                .map(|c| c.property_name.as_str())
                .collect();
            return Err(Error::invalid_input(format!(
                "unresolved conflicts remain for: {}",
                unresolved.join(", ")
            )));
        }
        let mut merged = self.remote_item.clone();
        for conflict in &self.conflicts {
            let value = conflict.resolved_value.clone().unwrap_or(Value::Null);
            merged.insert(conflict.property_name.clone(), value);
        }
        Ok(merged)
    }

    /// Consumes the set, returning the error and the merged item.
    pub(crate) fn into_parts(self) -> Result<(TableOperationError, Item)> {
        let merged = self.merged_item()?;
        Ok((self.error, merged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::PendingOperation;
    use crate::remote::RemoteError;
    use serde_json::json;

    fn item(json: serde_json::Value) -> Item {
        Item::from_json(json).unwrap()
    }

    fn update_error(
        base: serde_json::Value,
        local: serde_json::Value,
        remote_body: &str,
    ) -> TableOperationError {
        let op = PendingOperation::update("todos", "a", Some(item(base)));
        let remote = RemoteError::from_response(412, Some(remote_body.to_string()), "conflict");
        TableOperationError::from_remote(&op, item(local), &remote)
    }

    #[test]
    fn conflict_set_excludes_agreeing_and_unchanged() {
        let error = update_error(
            json!({"id": "a", "x": 1, "y": "a", "z": true}),
            json!({"id": "a", "x": 1, "y": "b", "z": true}),
            r#"{"id":"a","version":"2","x":2,"y":"a","z":true}"#,
        );
        let set = UpdateConflict::build(error, &ComparerRegistry::new()).unwrap();

        let names: Vec<_> = set.conflicts().iter().map(|c| c.property_name.as_str()).collect();
        assert_eq!(names, vec!["x", "y"]);

        let x = &set.conflicts()[0];
        assert!(!x.is_local_changed);
        assert!(x.is_remote_changed);
        let y = &set.conflicts()[1];
        assert!(y.is_local_changed);
        assert!(!y.is_remote_changed);
    }

    #[test]
    fn three_way_merge() {
        let error = update_error(
            json!({"id": "a", "x": 1, "y": "a"}),
            json!({"id": "a", "x": 1, "y": "b"}),
            r#"{"id":"a","version":"2","x":2,"y":"a"}"#,
        );
        let mut set = UpdateConflict::build(error, &ComparerRegistry::new()).unwrap();

        set.conflict_mut("x").unwrap().take_remote().unwrap();
        set.conflict_mut("y").unwrap().take_local().unwrap();
        assert!(set.is_fully_handled());

        let merged = set.merged_item().unwrap();
        assert_eq!(merged.get("x"), Some(&Value::Integer(2)));
        assert_eq!(merged.get("y"), Some(&Value::String("b".into())));
        // The merge starts from the server copy, version included.
        assert_eq!(merged.version(), Some("2"));
    }

    #[test]
    fn second_resolution_fails() {
        let error = update_error(
            json!({"id": "a", "x": 1}),
            json!({"id": "a", "x": 2}),
            r#"{"id":"a","x":3}"#,
        );
        let mut set = UpdateConflict::build(error, &ComparerRegistry::new()).unwrap();
        let conflict = set.conflict_mut("x").unwrap();
        conflict.take_local().unwrap();
        let err = conflict.take_remote().unwrap_err();
        assert!(matches!(err, Error::AlreadyHandled(name) if name == "x"));
    }

    #[test]
    fn unresolved_merge_is_rejected() {
        let error = update_error(
            json!({"id": "a", "x": 1}),
            json!({"id": "a", "x": 2}),
            r#"{"id":"a","x":3}"#,
        );
        let set = UpdateConflict::build(error, &ComparerRegistry::new()).unwrap();
        let err = set.merged_item().unwrap_err();
        assert!(matches!(err, Error::InvalidInput(msg) if msg.contains("x")));
    }

    #[test]
    fn empty_set_merges_immediately() {
        // Local matches remote even though both diverged from base.
        let error = update_error(
            json!({"id": "a", "x": 1}),
            json!({"id": "a", "x": 5}),
            r#"{"id":"a","version":"2","x":5}"#,
        );
        let set = UpdateConflict::build(error, &ComparerRegistry::new()).unwrap();
        assert!(set.conflicts().is_empty());
        assert!(set.is_fully_handled());
        let merged = set.merged_item().unwrap();
        assert_eq!(merged.get("x"), Some(&Value::Integer(5)));
    }

    #[test]
    fn non_primitive_values_are_rejected() {
        let error = update_error(
            json!({"id": "a", "tags": ["x"]}),
            json!({"id": "a", "tags": ["y"]}),
            r#"{"id":"a","tags":["z"]}"#,
        );
        let err = UpdateConflict::build(error, &ComparerRegistry::new()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedConflictValue(name) if name == "tags"));
    }

    #[test]
    fn custom_comparer_widens_equality() {
        let mut registry = ComparerRegistry::new();
        // Case-insensitive comparison for one column.
        registry.register(
            "todos",
            "title",
            Arc::new(|a: &Value, b: &Value| match (a.as_str(), b.as_str()) {
                (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                _ => a == b,
            }),
        );

        let error = update_error(
            json!({"id": "a", "title": "Milk"}),
            json!({"id": "a", "title": "MILK"}),
            r#"{"id":"a","title":"milk"}"#,
        );
        let set = UpdateConflict::build(error, &registry).unwrap();
        assert!(set.conflicts().is_empty());
    }

    #[test]
    fn non_update_errors_are_rejected() {
        let op = PendingOperation::delete("todos", "a", None);
        let remote = RemoteError::from_response(412, None, "conflict");
        let error = TableOperationError::from_remote(&op, Item::id_only("a"), &remote);
        let err = UpdateConflict::build(error, &ComparerRegistry::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
