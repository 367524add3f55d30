//! Expected-value preconditions and attribute updates.
//!
//! These are the only conditional primitives the store offers: every
//! conditional put/update/delete carries an [`Expected`] set that is checked
//! atomically against the stored item before the write lands.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{AttributeValue, Item};

/// A precondition on a single attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedValue {
    /// the attribute must be present (with any value)
    Exists,
    /// the attribute must be absent
    Absent,
    /// the attribute must be present and equal to the value
    Equals(AttributeValue),
}

impl ExpectedValue {
    fn holds(&self, actual: Option<&AttributeValue>) -> bool {
        match (self, actual) {
            (ExpectedValue::Exists, Some(_)) => true,
            (ExpectedValue::Absent, None) => true,
            (ExpectedValue::Equals(want), Some(got)) => want == got,
            _ => false,
        }
    }
}

/// A set of per-attribute preconditions, all of which must hold.
///
/// A missing item has no attributes, so it satisfies only `Absent` checks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expected(BTreeMap<String, ExpectedValue>);

impl Expected {
    /// no preconditions
    pub fn none() -> Self {
        Self::default()
    }

    /// require an attribute to be present
    pub fn exists(mut self, name: impl Into<String>) -> Self {
        self.0.insert(name.into(), ExpectedValue::Exists);
        self
    }

    /// require an attribute to be absent
    pub fn absent(mut self, name: impl Into<String>) -> Self {
        self.0.insert(name.into(), ExpectedValue::Absent);
        self
    }

    /// require an attribute to equal a value
    pub fn equals(mut self, name: impl Into<String>, value: AttributeValue) -> Self {
        self.0.insert(name.into(), ExpectedValue::Equals(value));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ExpectedValue)> {
        self.0.iter()
    }

    /// evaluate every precondition against the current item
    pub fn check(&self, current: Option<&Item>) -> bool {
        self.0.iter().all(|(name, expected)| {
            expected.holds(current.and_then(|item| item.get(name)))
        })
    }
}

/// What an update does to one attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateAction {
    /// replace the attribute value
    Put,
    /// remove the attribute
    Delete,
    /// add to a number or append to a list; acts as `Put` if the attribute is absent
    Add,
}

/// An update to one attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeUpdate {
    pub action: UpdateAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<AttributeValue>,
}

impl AttributeUpdate {
    pub fn put(value: AttributeValue) -> Self {
        Self {
            action: UpdateAction::Put,
            value: Some(value),
        }
    }

    pub fn delete() -> Self {
        Self {
            action: UpdateAction::Delete,
            value: None,
        }
    }

    pub fn add(value: AttributeValue) -> Self {
        Self {
            action: UpdateAction::Add,
            value: Some(value),
        }
    }

    /// check that the action carries the value it needs
    pub fn is_well_formed(&self) -> bool {
        match self.action {
            UpdateAction::Put => self.value.is_some(),
            UpdateAction::Delete => self.value.is_none(),
            UpdateAction::Add => matches!(
                self.value,
                Some(AttributeValue::N(_)) | Some(AttributeValue::L(_))
            ),
        }
    }
}

/// An ordered set of attribute updates.
pub type Updates = BTreeMap<String, AttributeUpdate>;

/// apply updates to an item in place
pub fn apply_updates(item: &mut Item, updates: &Updates) -> StorageResult<()> {
    for (name, update) in updates {
        match (&update.action, &update.value) {
            (UpdateAction::Put, Some(value)) => {
                item.insert(name.clone(), value.clone());
            }
            (UpdateAction::Delete, _) => {
                item.remove(name);
            }
            (UpdateAction::Add, Some(value)) => {
                let merged = match item.get(name) {
                    None => value.clone(),
                    Some(current) => add_values(name, current, value)?,
                };
                item.insert(name.clone(), merged);
            }
            (action, None) => {
                return Err(StorageError::InvalidUpdate {
                    attribute: name.clone(),
                    reason: format!("{:?} requires a value", action),
                })
            }
        }
    }
    Ok(())
}

fn add_values(
    name: &str,
    current: &AttributeValue,
    delta: &AttributeValue,
) -> StorageResult<AttributeValue> {
    match (current, delta) {
        (AttributeValue::N(a), AttributeValue::N(b)) => add_numbers(name, a, b),
        (AttributeValue::L(a), AttributeValue::L(b)) => {
            let mut list = a.clone();
            list.extend(b.iter().cloned());
            Ok(AttributeValue::L(list))
        }
        _ => Err(StorageError::InvalidUpdate {
            attribute: name.to_string(),
            reason: format!("cannot add {} to {}", delta, current),
        }),
    }
}

fn add_numbers(name: &str, a: &str, b: &str) -> StorageResult<AttributeValue> {
    if let (Ok(x), Ok(y)) = (a.parse::<i128>(), b.parse::<i128>()) {
        return x
            .checked_add(y)
            .map(|sum| AttributeValue::N(sum.to_string()))
            .ok_or_else(|| StorageError::InvalidUpdate {
                attribute: name.to_string(),
                reason: format!("{} + {} overflows", a, b),
            });
    }
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => Ok(AttributeValue::N((x + y).to_string())),
        _ => Err(StorageError::InvalidUpdate {
            attribute: name.to_string(),
            reason: format!("'{}' or '{}' is not a number", a, b),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> Item {
        let mut item = Item::new();
        item.insert("Id".into(), AttributeValue::s("a"));
        item.insert("count".into(), AttributeValue::n(2));
        item
    }

    #[test]
    fn test_expected_on_missing_item() {
        assert!(Expected::none().absent("Id").check(None));
        assert!(!Expected::none().exists("Id").check(None));
        assert!(!Expected::none()
            .equals("Id", AttributeValue::s("a"))
            .check(None));
    }

    #[test]
    fn test_expected_on_present_item() {
        let it = item();
        assert!(Expected::none()
            .equals("Id", AttributeValue::s("a"))
            .absent("_TxId")
            .check(Some(&it)));
        assert!(!Expected::none().absent("count").check(Some(&it)));
        assert!(!Expected::none()
            .equals("count", AttributeValue::n(3))
            .check(Some(&it)));
    }

    #[test]
    fn test_apply_updates() {
        let mut it = item();
        let mut updates = Updates::new();
        updates.insert("count".into(), AttributeUpdate::add(AttributeValue::n(5)));
        updates.insert("name".into(), AttributeUpdate::put(AttributeValue::s("x")));
        updates.insert("Id".into(), AttributeUpdate::delete());
        apply_updates(&mut it, &updates).unwrap();

        assert_eq!(it.get("count"), Some(&AttributeValue::n(7)));
        assert_eq!(it.get("name"), Some(&AttributeValue::s("x")));
        assert!(!it.contains_key("Id"));
    }

    #[test]
    fn test_add_appends_lists_and_rejects_mismatch() {
        let mut it = Item::new();
        it.insert("l".into(), AttributeValue::L(vec![AttributeValue::n(1)]));
        let mut updates = Updates::new();
        updates.insert(
            "l".into(),
            AttributeUpdate::add(AttributeValue::L(vec![AttributeValue::n(2)])),
        );
        apply_updates(&mut it, &updates).unwrap();
        assert_eq!(
            it.get("l"),
            Some(&AttributeValue::L(vec![AttributeValue::n(1), AttributeValue::n(2)]))
        );

        let mut bad = Updates::new();
        bad.insert("l".into(), AttributeUpdate::add(AttributeValue::n(1)));
        assert!(matches!(
            apply_updates(&mut it, &bad),
            Err(StorageError::InvalidUpdate { .. })
        ));
    }

    #[test]
    fn test_add_rejects_integer_overflow() {
        let mut it = Item::new();
        it.insert("v".into(), AttributeValue::N(i128::MAX.to_string()));
        let mut updates = Updates::new();
        updates.insert("v".into(), AttributeUpdate::add(AttributeValue::n(1)));
        assert!(matches!(
            apply_updates(&mut it, &updates),
            Err(StorageError::InvalidUpdate { .. })
        ));
        assert_eq!(it.get("v"), Some(&AttributeValue::N(i128::MAX.to_string())));
    }

    #[test]
    fn test_expected_iter_lists_every_condition() {
        let expected = Expected::none()
            .exists("Id")
            .absent("_TxId")
            .equals("count", AttributeValue::n(2));
        let names: Vec<&str> = expected.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["Id", "_TxId", "count"]);
    }

    #[test]
    fn test_well_formed_updates() {
        assert!(AttributeUpdate::put(AttributeValue::Null).is_well_formed());
        assert!(AttributeUpdate::delete().is_well_formed());
        assert!(!AttributeUpdate::add(AttributeValue::s("x")).is_well_formed());
        let missing = AttributeUpdate {
            action: UpdateAction::Put,
            value: None,
        };
        assert!(!missing.is_well_formed());
    }
}
