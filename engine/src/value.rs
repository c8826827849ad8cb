//! Dynamic values and items.
//!
//! Records are untyped property bags: the engine never sees application
//! structs, only [`Item`]s whose properties are tagged [`Value`]s. The
//! conflict machinery operates on scalar values; objects and arrays pass
//! through storage untouched but cannot be merged property-wise.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Reserved system property names.
pub mod system {
    /// Required record identifier.
    pub const ID: &str = "id";
    /// Opaque server concurrency token (ETag).
    pub const VERSION: &str = "version";
    /// UTC creation timestamp, server-assigned.
    pub const CREATED_AT: &str = "createdAt";
    /// UTC last-update timestamp, server-assigned.
    pub const UPDATED_AT: &str = "updatedAt";
    /// Soft-delete flag.
    pub const DELETED: &str = "deleted";

    /// Returns true for reserved system property names.
    pub fn is_system_property(name: &str) -> bool {
        matches!(name, VERSION | CREATED_AT | UPDATED_AT | DELETED)
    }
}

/// A dynamic property value.
///
/// The first seven variants are scalars and participate in three-way
/// merges; `Object` and `Array` are opaque to the conflict engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer (full i64 range).
    Integer(i64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 text.
    String(String),
    /// UTC timestamp.
    Timestamp(DateTime<Utc>),
    /// Raw byte string.
    Blob(Vec<u8>),
    /// Nested object.
    Object(BTreeMap<String, Value>),
    /// Array of values.
    Array(Vec<Value>),
}

impl Value {
    /// Returns true for scalar variants the conflict engine can merge.
    pub fn is_primitive(&self) -> bool {
        !matches!(self, Value::Object(_) | Value::Array(_))
    }

    /// Returns the text content for `String` values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer content for `Integer` values.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the boolean content for `Bool` values.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the timestamp content, parsing RFC 3339 text if needed.
    ///
    /// Server payloads arrive with timestamps as JSON strings; persisted
    /// rows carry the typed variant. Both shapes resolve here.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(t) => Some(*t),
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|t| t.with_timezone(&Utc)),
            _ => None,
        }
    }

    /// Total ordering over scalar values of the same shape.
    ///
    /// Integers and floats compare numerically across variants; all
    /// other cross-variant comparisons return `None`.
    pub fn partial_cmp_scalar(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Integer(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Timestamp(_), _) | (_, Value::Timestamp(_)) => {
                match (self.as_timestamp(), other.as_timestamp()) {
                    (Some(a), Some(b)) => Some(a.cmp(&b)),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Converts from a JSON value.
    ///
    /// Strings stay strings: the JSON layer has no timestamp type, so
    /// revival into `Timestamp` happens lazily via [`Value::as_timestamp`].
    pub fn from_json(value: serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Integer(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(values) => {
                Value::Array(values.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Converts to a JSON value. Timestamps serialize as RFC 3339 text.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Timestamp(t) => {
                serde_json::Value::String(t.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            Value::Blob(bytes) => serde_json::Value::Array(
                bytes.iter().map(|b| serde_json::Value::from(*b)).collect(),
            ),
            Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Array(values) => {
                serde_json::Value::Array(values.iter().map(Value::to_json).collect())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(t: DateTime<Utc>) -> Self {
        Value::Timestamp(t)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Integer(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::String(s) => serializer.serialize_str(s),
            Value::Timestamp(t) => {
                serializer.serialize_str(&t.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            Value::Blob(bytes) => {
                let mut seq = serializer.serialize_seq(Some(bytes.len()))?;
                for b in bytes {
                    seq.serialize_element(b)?;
                }
                seq.end()
            }
            Value::Object(map) => {
                let mut ser = serializer.serialize_map(Some(map.len()))?;
                for (k, v) in map {
                    ser.serialize_entry(k, v)?;
                }
                ser.end()
            }
            Value::Array(values) => {
                let mut seq = serializer.serialize_seq(Some(values.len()))?;
                for v in values {
                    seq.serialize_element(v)?;
                }
                seq.end()
            }
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a dynamic property value")
    }

    fn visit_unit<E>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_bool<E>(self, b: bool) -> Result<Value, E> {
        Ok(Value::Bool(b))
    }

    fn visit_i64<E>(self, i: i64) -> Result<Value, E> {
        Ok(Value::Integer(i))
    }

    fn visit_u64<E: de::Error>(self, u: u64) -> Result<Value, E> {
        i64::try_from(u)
            .map(Value::Integer)
            .or(Ok(Value::Float(u as f64)))
    }

    fn visit_f64<E>(self, f: f64) -> Result<Value, E> {
        Ok(Value::Float(f))
    }

    fn visit_str<E>(self, s: &str) -> Result<Value, E> {
        Ok(Value::String(s.to_string()))
    }

    fn visit_string<E>(self, s: String) -> Result<Value, E> {
        Ok(Value::String(s))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut values = Vec::new();
        while let Some(v) = seq.next_element()? {
            values.push(v);
        }
        Ok(Value::Array(values))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Value, A::Error> {
        let mut entries = BTreeMap::new();
        while let Some((k, v)) = map.next_entry::<String, Value>()? {
            entries.insert(k, v);
        }
        Ok(Value::Object(entries))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Value, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

/// A record as a key-value property bag.
///
/// Every item carries a required string `id`; the reserved system
/// properties (`version`, `createdAt`, `updatedAt`, `deleted`) are
/// managed by the server and the engine.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Item {
    values: BTreeMap<String, Value>,
}

impl Item {
    /// Creates an empty item.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an item carrying only an id, used as a stub in error rows.
    pub fn id_only(id: impl Into<String>) -> Self {
        let mut item = Item::new();
        item.insert(system::ID, Value::String(id.into()));
        item
    }

    /// Builds an item from a JSON object.
    pub fn from_json(value: serde_json::Value) -> Option<Item> {
        match Value::from_json(value) {
            Value::Object(map) => Some(Item { values: map }),
            _ => None,
        }
    }

    /// Converts to a JSON object.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }

    /// Returns the record id, if present and a string.
    pub fn id(&self) -> Option<&str> {
        self.values.get(system::ID).and_then(Value::as_str)
    }

    /// Returns the server version token, if present.
    pub fn version(&self) -> Option<&str> {
        self.values.get(system::VERSION).and_then(Value::as_str)
    }

    /// Returns the `updatedAt` timestamp, if present.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.values
            .get(system::UPDATED_AT)
            .and_then(Value::as_timestamp)
    }

    /// Returns true if the soft-delete flag is set.
    pub fn is_deleted(&self) -> bool {
        self.values
            .get(system::DELETED)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Gets a property value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Sets a property value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    /// Removes a property, returning its previous value.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.values.remove(name)
    }

    /// Returns true if the property is present.
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Iterates over properties in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// Iterates over property names in order.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    /// Number of properties.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true when the item has no properties.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns a copy without server-managed system properties.
    ///
    /// `keep_version` retains the concurrency token so it can travel as
    /// an `If-Match` header on update and delete.
    pub fn without_system_properties(&self, keep_version: bool) -> Item {
        let values = self
            .values
            .iter()
            .filter(|(name, _)| {
                !system::is_system_property(name)
                    || (keep_version && name.as_str() == system::VERSION)
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Item { values }
    }
}

impl Serialize for Item {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (k, v) in &self.values {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Item {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Item, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Object(values) => Ok(Item { values }),
            other => Err(de::Error::custom(format!(
                "expected an object for an item, got {other:?}"
            ))),
        }
    }
}

impl FromIterator<(String, Value)> for Item {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Item {
            values: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn item_from_json() {
        let item = Item::from_json(json!({"id": "a", "name": "Alice", "age": 30})).unwrap();
        assert_eq!(item.id(), Some("a"));
        assert_eq!(item.get("age"), Some(&Value::Integer(30)));
        assert_eq!(item.get("name").and_then(Value::as_str), Some("Alice"));
    }

    #[test]
    fn item_from_non_object_json() {
        assert!(Item::from_json(json!([1, 2])).is_none());
        assert!(Item::from_json(json!("x")).is_none());
    }

    #[test]
    fn timestamp_revival_from_string() {
        let item = Item::from_json(json!({"id": "a", "updatedAt": "2024-03-01T12:00:00.000Z"}))
            .unwrap();
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(item.updated_at(), Some(expected));
    }

    #[test]
    fn strip_system_properties() {
        let item = Item::from_json(json!({
            "id": "a",
            "version": "v1",
            "createdAt": "2024-01-01T00:00:00Z",
            "updatedAt": "2024-01-02T00:00:00Z",
            "deleted": false,
            "name": "Alice"
        }))
        .unwrap();

        let stripped = item.without_system_properties(false);
        assert_eq!(stripped.keys().collect::<Vec<_>>(), vec!["id", "name"]);

        let with_version = item.without_system_properties(true);
        assert_eq!(with_version.version(), Some("v1"));
        assert!(!with_version.contains(system::UPDATED_AT));
    }

    #[test]
    fn json_roundtrip_preserves_scalars() {
        let item = Item::from_json(json!({"id": "a", "n": 1, "f": 1.5, "b": true, "s": "x"}))
            .unwrap();
        let back = Item::from_json(item.to_json()).unwrap();
        assert_eq!(item, back);
    }

    #[test]
    fn serde_roundtrip() {
        let mut item = Item::new();
        item.insert("id", "a");
        item.insert("count", 7i64);
        let text = serde_json::to_string(&item).unwrap();
        let parsed: Item = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, item);
    }

    #[test]
    fn scalar_ordering() {
        assert_eq!(
            Value::Integer(1).partial_cmp_scalar(&Value::Float(1.5)),
            Some(Ordering::Less)
        );
        assert_eq!(
            Value::String("b".into()).partial_cmp_scalar(&Value::String("a".into())),
            Some(Ordering::Greater)
        );
        assert!(Value::String("x".into())
            .partial_cmp_scalar(&Value::Integer(1))
            .is_none());

        let earlier = Value::Timestamp(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let later = Value::String("2024-06-01T00:00:00Z".into());
        assert_eq!(earlier.partial_cmp_scalar(&later), Some(Ordering::Less));
    }

    #[test]
    fn primitive_classification() {
        assert!(Value::Null.is_primitive());
        assert!(Value::Blob(vec![1]).is_primitive());
        assert!(!Value::Object(BTreeMap::new()).is_primitive());
        assert!(!Value::Array(vec![]).is_primitive());
    }
}
