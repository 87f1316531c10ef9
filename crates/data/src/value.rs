//! Host-side value tree

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Map node of a [`DataValue`] tree
pub type DataMap = BTreeMap<String, DataValue>;

/// A node in an immutable value tree
///
/// Cloning is cheap: strings, lists and maps are reference counted, so a
/// clone shares its children with the original.
#[derive(Debug, Clone, Default)]
pub enum DataValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(Arc<str>),
    List(Arc<Vec<DataValue>>),
    Map(Arc<DataMap>),
}

impl DataValue {
    /// An empty map
    pub fn empty_map() -> Self {
        DataValue::Map(Arc::new(DataMap::new()))
    }

    /// An empty list
    pub fn empty_list() -> Self {
        DataValue::List(Arc::new(Vec::new()))
    }

    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, DataValue)>,
    {
        DataValue::Map(Arc::new(
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    pub fn list<I: IntoIterator<Item = DataValue>>(items: I) -> Self {
        DataValue::List(Arc::new(items.into_iter().collect()))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, DataValue::Null)
    }

    pub fn is_map(&self) -> bool {
        matches!(self, DataValue::Map(_))
    }

    pub fn is_list(&self) -> bool {
        matches!(self, DataValue::List(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DataValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DataValue::Int(i) => Some(*i),
            DataValue::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DataValue::Int(i) => Some(*i as f64),
            DataValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DataValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[DataValue]> {
        match self {
            DataValue::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&DataMap> {
        match self {
            DataValue::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Look up a key on a map value
    pub fn get_key(&self, key: &str) -> Option<&DataValue> {
        self.as_map().and_then(|m| m.get(key))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            DataValue::Null => "null",
            DataValue::Bool(_) => "boolean",
            DataValue::Int(_) | DataValue::Float(_) => "number",
            DataValue::String(_) => "string",
            DataValue::List(_) => "list",
            DataValue::Map(_) => "map",
        }
    }

    /// Whether both values point at the same list or map allocation
    pub fn shares_with(&self, other: &DataValue) -> bool {
        match (self, other) {
            (DataValue::List(a), DataValue::List(b)) => Arc::ptr_eq(a, b),
            (DataValue::Map(a), DataValue::Map(b)) => Arc::ptr_eq(a, b),
            (DataValue::String(a), DataValue::String(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            DataValue::Null => serde_json::Value::Null,
            DataValue::Bool(b) => serde_json::Value::Bool(*b),
            DataValue::Int(i) => serde_json::Value::from(*i),
            DataValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            DataValue::String(s) => serde_json::Value::String(s.to_string()),
            DataValue::List(items) => {
                serde_json::Value::Array(items.iter().map(DataValue::to_json).collect())
            }
            DataValue::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

// Int and Float compare numerically so values survive a trip through an
// engine that only has one number type.
impl PartialEq for DataValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (DataValue::Null, DataValue::Null) => true,
            (DataValue::Bool(a), DataValue::Bool(b)) => a == b,
            (DataValue::Int(a), DataValue::Int(b)) => a == b,
            (DataValue::Int(_), DataValue::Float(_)) | (DataValue::Float(_), DataValue::Int(_)) => {
                self.as_f64() == other.as_f64()
            }
            (DataValue::Float(a), DataValue::Float(b)) => a == b,
            (DataValue::String(a), DataValue::String(b)) => a == b,
            (DataValue::List(a), DataValue::List(b)) => Arc::ptr_eq(a, b) || a == b,
            (DataValue::Map(a), DataValue::Map(b)) => Arc::ptr_eq(a, b) || a == b,
            _ => false,
        }
    }
}

impl fmt::Display for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataValue::String(s) => write!(f, "{}", s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<serde_json::Value> for DataValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => DataValue::Null,
            serde_json::Value::Bool(b) => DataValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => DataValue::Int(i),
                None => DataValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => DataValue::String(s.into()),
            serde_json::Value::Array(items) => {
                DataValue::list(items.into_iter().map(DataValue::from))
            }
            serde_json::Value::Object(map) => {
                DataValue::map(map.into_iter().map(|(k, v)| (k, DataValue::from(v))))
            }
        }
    }
}

impl From<&DataValue> for serde_json::Value {
    fn from(value: &DataValue) -> Self {
        value.to_json()
    }
}

impl From<DataValue> for serde_json::Value {
    fn from(value: DataValue) -> Self {
        value.to_json()
    }
}

impl From<bool> for DataValue {
    fn from(b: bool) -> Self {
        DataValue::Bool(b)
    }
}

impl From<i32> for DataValue {
    fn from(i: i32) -> Self {
        DataValue::Int(i as i64)
    }
}

impl From<i64> for DataValue {
    fn from(i: i64) -> Self {
        DataValue::Int(i)
    }
}

impl From<u64> for DataValue {
    fn from(i: u64) -> Self {
        i64::try_from(i)
            .map(DataValue::Int)
            .unwrap_or(DataValue::Float(i as f64))
    }
}

impl From<f64> for DataValue {
    fn from(f: f64) -> Self {
        DataValue::Float(f)
    }
}

impl From<&str> for DataValue {
    fn from(s: &str) -> Self {
        DataValue::String(s.into())
    }
}

impl From<String> for DataValue {
    fn from(s: String) -> Self {
        DataValue::String(s.into())
    }
}

impl From<Vec<DataValue>> for DataValue {
    fn from(items: Vec<DataValue>) -> Self {
        DataValue::List(Arc::new(items))
    }
}

impl From<DataMap> for DataValue {
    fn from(map: DataMap) -> Self {
        DataValue::Map(Arc::new(map))
    }
}

impl<T: Into<DataValue>> From<Option<T>> for DataValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(DataValue::Null)
    }
}

impl Serialize for DataValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DataValue::Null => serializer.serialize_unit(),
            DataValue::Bool(b) => serializer.serialize_bool(*b),
            DataValue::Int(i) => serializer.serialize_i64(*i),
            DataValue::Float(f) => serializer.serialize_f64(*f),
            DataValue::String(s) => serializer.serialize_str(s),
            DataValue::List(items) => serializer.collect_seq(items.iter()),
            DataValue::Map(map) => serializer.collect_map(map.iter()),
        }
    }
}

impl<'de> Deserialize<'de> for DataValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(DataValue::from)
    }
}
