//! Requests that can join a transaction.
//!
//! A [`Request`] is one read-lock, put, update or delete against one item. It
//! is validated and canonicalized before it joins a transaction, then stored
//! inside the transaction's log record as deterministic JSON bytes.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::storage::{display_item, encode_key, item_size, AttributeValue, Expected, Item, Key, KeySchema, Updates};
use crate::transaction::attributes::{self, APPLIED, DATE, TRANSIENT, TX_ID};
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::manager::TransactionManager;

/// The operation a request performs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Read the item and hold a lock on it until the transaction completes.
    Get {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        projection: Option<Vec<String>>,
    },
    /// Insert or fully replace the item.
    Put { item: Item },
    /// Apply attribute updates, creating the item if missing.
    Update { updates: Updates },
    /// Delete the item when the transaction commits.
    Delete,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Get { .. } => "get",
            Operation::Put { .. } => "put",
            Operation::Update { .. } => "update",
            Operation::Delete => "delete",
        }
    }
}

/// Conditional clauses a caller may attach to a request.
///
/// Transactions provide their own isolation through item locks, so none of
/// these are supported; validation rejects any request that sets one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conditions {
    #[serde(default, skip_serializing_if = "Expected::is_empty")]
    pub expected: Expected,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_expression: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub expression_attribute_names: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub expression_attribute_values: BTreeMap<String, AttributeValue>,
}

impl Conditions {
    pub fn is_empty(&self) -> bool {
        self.first_present().is_none()
    }

    fn first_present(&self) -> Option<&'static str> {
        if !self.expected.is_empty() {
            Some("expected values")
        } else if self.condition_expression.is_some() {
            Some("a condition expression")
        } else if self.update_expression.is_some() {
            Some("an update expression")
        } else if !self.expression_attribute_names.is_empty() {
            Some("expression attribute names")
        } else if !self.expression_attribute_values.is_empty() {
            Some("expression attribute values")
        } else {
            None
        }
    }
}

/// One operation against one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Target table.
    pub table: String,
    /// Target key. Derived from the item for puts during validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Key>,
    /// Sequence number assigned when the request joins a transaction log.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<u32>,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Conditions::is_empty")]
    pub conditions: Conditions,
}

impl Request {
    fn new(table: impl Into<String>, key: Option<Key>, operation: Operation) -> Self {
        Self {
            table: table.into(),
            key,
            rid: None,
            operation,
            conditions: Conditions::default(),
        }
    }

    /// Read and lock an item.
    pub fn get(table: impl Into<String>, key: Key) -> Self {
        Self::new(table, Some(key), Operation::Get { projection: None })
    }

    /// Insert or replace an item; the key is taken from the item.
    pub fn put(table: impl Into<String>, item: Item) -> Self {
        Self::new(table, None, Operation::Put { item })
    }

    /// Update (or create) an item.
    pub fn update(table: impl Into<String>, key: Key, updates: Updates) -> Self {
        Self::new(table, Some(key), Operation::Update { updates })
    }

    /// Delete an item.
    pub fn delete(table: impl Into<String>, key: Key) -> Self {
        Self::new(table, Some(key), Operation::Delete)
    }

    /// Return only these attributes from a get.
    pub fn with_projection(mut self, names: Vec<String>) -> Self {
        if let Operation::Get { projection } = &mut self.operation {
            *projection = Some(names);
        }
        self
    }

    pub fn with_expected(mut self, expected: Expected) -> Self {
        self.conditions.expected = expected;
        self
    }

    pub fn with_condition_expression(mut self, expression: impl Into<String>) -> Self {
        self.conditions.condition_expression = Some(expression.into());
        self
    }

    pub fn with_update_expression(mut self, expression: impl Into<String>) -> Self {
        self.conditions.update_expression = Some(expression.into());
        self
    }

    pub fn with_expression_attribute_name(
        mut self,
        placeholder: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        self.conditions
            .expression_attribute_names
            .insert(placeholder.into(), name.into());
        self
    }

    pub fn with_expression_attribute_value(
        mut self,
        placeholder: impl Into<String>,
        value: AttributeValue,
    ) -> Self {
        self.conditions
            .expression_attribute_values
            .insert(placeholder.into(), value);
        self
    }

    /// True for a read-lock request.
    pub fn is_read(&self) -> bool {
        matches!(self.operation, Operation::Get { .. })
    }

    /// True for put and update, the requests that change the item before commit.
    pub fn mutates_on_apply(&self) -> bool {
        matches!(
            self.operation,
            Operation::Put { .. } | Operation::Update { .. }
        )
    }

    /// The target key; only missing on an unvalidated put.
    pub fn key(&self) -> TransactionResult<&Key> {
        self.key.as_ref().ok_or_else(|| TransactionError::InvalidRequest {
            tx_id: None,
            reason: format!("{} request on {} has no key", self.operation.name(), self.table),
        })
    }

    /// Identity of the target item within a transaction: (table, encoded key).
    pub fn item_id(&self) -> TransactionResult<(String, String)> {
        Ok((self.table.clone(), encode_key(self.key()?)?))
    }

    /// Same operation on the same item, ignoring the assigned rid.
    pub fn same_as(&self, other: &Request) -> bool {
        self.table == other.table && self.key == other.key && self.operation == other.operation
    }

    /// Validate against the table's key schema and the manager's store limits.
    ///
    /// An update is size-checked on its key and payload only. The merged item
    /// is checked by the store when the update is applied, so an update that
    /// grows an item past the limit fails there with
    /// [`StorageError::ItemTooLarge`](crate::storage::StorageError::ItemTooLarge)
    /// and the transaction has to be rolled back.
    pub fn validate(&mut self, tx_id: &str, manager: &TransactionManager) -> TransactionResult<()> {
        if self.table.is_empty() {
            return Err(TransactionError::invalid(tx_id, "table name is missing"));
        }
        let schema = manager.key_schema(&self.table)?;
        self.validate_with(tx_id, &schema, manager.store().max_item_size())
    }

    pub(crate) fn validate_with(
        &mut self,
        tx_id: &str,
        schema: &KeySchema,
        max_item_size: usize,
    ) -> TransactionResult<()> {
        if self.table.is_empty() {
            return Err(TransactionError::invalid(tx_id, "table name is missing"));
        }
        if let Some(what) = self.conditions.first_present() {
            return Err(TransactionError::invalid(
                tx_id,
                format!("transactional requests do not support {}", what),
            ));
        }

        match &self.operation {
            Operation::Put { item } => {
                check_no_reserved(tx_id, item.keys())?;
                let derived = schema
                    .project(item)
                    .map_err(|e| TransactionError::invalid(tx_id, e.to_string()))?;
                if let Some(key) = &self.key {
                    if *key != derived {
                        return Err(TransactionError::invalid(
                            tx_id,
                            format!(
                                "key {} does not match item key {}",
                                display_item(key),
                                display_item(&derived)
                            ),
                        ));
                    }
                }
                check_size(tx_id, &self.table, item_size(item), max_item_size)?;
                self.key = Some(derived);
            }
            Operation::Get { projection } => {
                self.check_key(tx_id, schema)?;
                if let Some(names) = projection {
                    check_no_reserved(tx_id, names.iter())?;
                }
            }
            Operation::Update { updates } => {
                self.check_key(tx_id, schema)?;
                check_no_reserved(tx_id, updates.keys())?;
                for (name, update) in updates {
                    if schema.is_key_attribute(name) {
                        return Err(TransactionError::invalid(
                            tx_id,
                            format!("cannot update key attribute {}", name),
                        ));
                    }
                    if !update.is_well_formed() {
                        return Err(TransactionError::invalid(
                            tx_id,
                            format!("malformed {:?} update on {}", update.action, name),
                        ));
                    }
                }
                let key_size = self.key.as_ref().map(item_size).unwrap_or(0);
                let update_size: usize = updates
                    .iter()
                    .map(|(name, u)| name.len() + u.value.as_ref().map(AttributeValue::size).unwrap_or(0))
                    .sum();
                check_size(tx_id, &self.table, key_size + update_size, max_item_size)?;
            }
            Operation::Delete => {
                self.check_key(tx_id, schema)?;
            }
        }
        Ok(())
    }

    fn check_key(&self, tx_id: &str, schema: &KeySchema) -> TransactionResult<()> {
        match &self.key {
            None => Err(TransactionError::invalid(tx_id, "key is missing")),
            Some(key) if key.is_empty() => Err(TransactionError::invalid(tx_id, "key is empty")),
            Some(key) => {
                check_no_reserved(tx_id, key.keys())?;
                schema
                    .check_key(key)
                    .map_err(|e| TransactionError::invalid(tx_id, e.to_string()))
            }
        }
    }

    /// Serialize to the bytes stored in a log record.
    ///
    /// Output is deterministic: equal requests always produce identical bytes.
    pub fn to_bytes(&self) -> TransactionResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize bytes produced by [`Request::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> TransactionResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key = self.key.as_ref().map(display_item).unwrap_or_else(|| "?".into());
        match self.rid {
            Some(rid) => write!(f, "{} {} {} (rid {})", self.operation.name(), self.table, key, rid),
            None => write!(f, "{} {} {}", self.operation.name(), self.table, key),
        }
    }
}

/// Bytes the lock attributes add to an item.
fn lock_overhead() -> usize {
    // ulid ids are 26 characters, dates are millisecond numbers
    TX_ID.len() + 26 + DATE.len() + 8 + TRANSIENT.len() + 1 + APPLIED.len() + 1
}

fn check_size(tx_id: &str, table: &str, size: usize, limit: usize) -> TransactionResult<()> {
    let total = size + lock_overhead();
    if total > limit {
        return Err(TransactionError::invalid(
            tx_id,
            format!(
                "item in {} would be {} bytes with lock attributes, over the {} byte limit",
                table, total, limit
            ),
        ));
    }
    Ok(())
}

fn check_no_reserved<'a>(
    tx_id: &str,
    mut names: impl Iterator<Item = &'a String>,
) -> TransactionResult<()> {
    match names.find(|name| attributes::is_reserved(name)) {
        Some(name) => Err(TransactionError::invalid(
            tx_id,
            format!("attribute {} is reserved for transactions", name),
        )),
        None => Ok(()),
    }
}
