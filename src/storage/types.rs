//! core value types for the storage layer.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::storage::error::{StorageError, StorageResult};

/// An item is an ordered map of attribute name to value.
///
/// BTreeMap keeps attribute order stable so serialized items are reproducible.
pub type Item = BTreeMap<String, AttributeValue>;

/// A primary key: the subset of an item named by the table's [`KeySchema`].
pub type Key = BTreeMap<String, AttributeValue>;

/// A single attribute value.
///
/// Numbers are kept as their decimal string so that values round-trip
/// exactly through every store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AttributeValue {
    #[serde(rename = "S")]
    S(String),
    #[serde(rename = "N")]
    N(String),
    #[serde(rename = "B")]
    B(Vec<u8>),
    #[serde(rename = "BOOL")]
    Bool(bool),
    #[serde(rename = "NULL")]
    Null,
    #[serde(rename = "L")]
    L(Vec<AttributeValue>),
    #[serde(rename = "M")]
    M(BTreeMap<String, AttributeValue>),
}

impl AttributeValue {
    /// create a string value
    pub fn s(value: impl Into<String>) -> Self {
        AttributeValue::S(value.into())
    }

    /// create a number value from anything that prints as a number
    pub fn n(value: impl fmt::Display) -> Self {
        AttributeValue::N(value.to_string())
    }

    /// the string payload, if this is an `S`
    pub fn as_s(&self) -> Option<&str> {
        match self {
            AttributeValue::S(s) => Some(s),
            _ => None,
        }
    }

    /// the number parsed as an i64, if this is an integral `N`
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttributeValue::N(n) => n.parse().ok(),
            _ => None,
        }
    }

    /// check whether this value may be used as a key attribute
    pub fn is_key_type(&self) -> bool {
        match self {
            AttributeValue::S(s) => !s.is_empty(),
            AttributeValue::N(_) => true,
            AttributeValue::B(b) => !b.is_empty(),
            _ => false,
        }
    }

    /// approximate stored size in bytes
    pub fn size(&self) -> usize {
        match self {
            AttributeValue::S(s) => s.len(),
            AttributeValue::N(n) => n.len().div_ceil(2) + 1,
            AttributeValue::B(b) => b.len(),
            AttributeValue::Bool(_) | AttributeValue::Null => 1,
            AttributeValue::L(values) => 3 + values.iter().map(|v| 1 + v.size()).sum::<usize>(),
            AttributeValue::M(map) => {
                3 + map.iter().map(|(k, v)| 1 + k.len() + v.size()).sum::<usize>()
            }
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::S(s) => write!(f, "{:?}", s),
            AttributeValue::N(n) => write!(f, "{}", n),
            AttributeValue::B(b) => write!(f, "<{} bytes>", b.len()),
            AttributeValue::Bool(b) => write!(f, "{}", b),
            AttributeValue::Null => write!(f, "null"),
            AttributeValue::L(values) => {
                write!(f, "[")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            AttributeValue::M(map) => write!(f, "{}", display_item(map)),
        }
    }
}

/// approximate stored size of a whole item
pub fn item_size(item: &Item) -> usize {
    item.iter().map(|(name, value)| name.len() + value.size()).sum()
}

/// render an item or key as `{a: 1, b: "x"}` for errors and logs
pub fn display_item(item: &Item) -> String {
    let fields: Vec<String> = item.iter().map(|(k, v)| format!("{}: {}", k, v)).collect();
    format!("{{{}}}", fields.join(", "))
}

/// The primary key layout declared by a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySchema {
    /// hash (partition) attribute name
    pub hash: String,
    /// optional range (sort) attribute name
    pub range: Option<String>,
}

impl KeySchema {
    /// a schema with only a hash attribute
    pub fn hash(name: impl Into<String>) -> Self {
        Self {
            hash: name.into(),
            range: None,
        }
    }

    /// a schema with hash and range attributes
    pub fn composite(hash: impl Into<String>, range: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            range: Some(range.into()),
        }
    }

    /// names of every key attribute, hash first
    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.hash.as_str()).chain(self.range.as_deref())
    }

    /// check if an attribute is part of the key
    pub fn is_key_attribute(&self, name: &str) -> bool {
        self.attribute_names().any(|n| n == name)
    }

    /// project an item onto this schema
    ///
    /// fails if any key attribute is missing or has an unusable type
    pub fn project(&self, item: &Item) -> StorageResult<Key> {
        let mut key = Key::new();
        for name in self.attribute_names() {
            match item.get(name) {
                Some(value) if value.is_key_type() => {
                    key.insert(name.to_string(), value.clone());
                }
                Some(value) => {
                    return Err(StorageError::InvalidKey(format!(
                        "key attribute {} has unsupported value {}",
                        name, value
                    )))
                }
                None => {
                    return Err(StorageError::InvalidKey(format!(
                        "missing key attribute {}",
                        name
                    )))
                }
            }
        }
        Ok(key)
    }

    /// check that a caller-supplied key names exactly the key attributes
    pub fn check_key(&self, key: &Key) -> StorageResult<()> {
        let projected = self.project(key)?;
        if projected.len() != key.len() {
            let extra: Vec<&str> = key
                .keys()
                .filter(|k| !self.is_key_attribute(k))
                .map(|k| k.as_str())
                .collect();
            return Err(StorageError::InvalidKey(format!(
                "key carries non-key attributes: {}",
                extra.join(", ")
            )));
        }
        Ok(())
    }
}

/// encode a key as a stable string, used to index items inside a table
pub fn encode_key(key: &Key) -> StorageResult<String> {
    Ok(serde_json::to_string(key)?)
}
