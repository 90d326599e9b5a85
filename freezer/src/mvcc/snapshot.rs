//! Immutable snapshots pinned to a head transaction.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use crate::codec::{Stored, Value};
use crate::error::{CResult, Error};
use crate::mvcc::TxId;
use crate::query::Query;
use crate::storage::tuple_log;
use crate::store::Shared;

/// An attribute resolved under a snapshot: a single value for scalar
/// attributes, the accumulated set for collection attributes.
#[derive(Clone, Debug, PartialEq)]
pub enum AttributeValue {
    Scalar(Value),
    Collection(Vec<Value>),
}

impl AttributeValue {
    /// The value, if this attribute is scalar.
    pub fn scalar(&self) -> Option<&Value> {
        match self {
            AttributeValue::Scalar(value) => Some(value),
            AttributeValue::Collection(_) => None,
        }
    }

    /// The elements, if this attribute is a collection.
    pub fn collection(&self) -> Option<&[Value]> {
        match self {
            AttributeValue::Scalar(_) => None,
            AttributeValue::Collection(values) => Some(values),
        }
    }

    /// Whether this attribute holds the value: scalar equality, or
    /// collection membership.
    pub fn contains(&self, value: &Value) -> bool {
        match self {
            AttributeValue::Scalar(v) => v == value,
            AttributeValue::Collection(values) => values.contains(value),
        }
    }
}

/// An entity's resolved attributes.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// An immutable view of the store pinned to a head transaction id.
///
/// A `Database` is a value: a non-owning handle to the store plus the head
/// id, trivially cheap to clone and safe to share across threads. Two
/// snapshots of one store with equal heads are observationally identical.
/// Reads resolve each `(entity, attribute)` to the newest tuple at or below
/// the head, so a snapshot keeps answering the same way no matter what is
/// committed after it.
///
/// The handle does not keep the store alive; reads after the store is
/// dropped fail with a storage error.
#[derive(Clone, Debug)]
pub struct Database {
    shared: Weak<Shared>,
    head: TxId,
}

impl PartialEq for Database {
    fn eq(&self, other: &Database) -> bool {
        self.head == other.head && Weak::ptr_eq(&self.shared, &other.shared)
    }
}

impl Database {
    pub(crate) fn at(shared: &Arc<Shared>, head: TxId) -> Database {
        Database { shared: Arc::downgrade(shared), head }
    }

    fn shared(&self) -> CResult<Arc<Shared>> {
        self.shared
            .upgrade()
            .ok_or_else(|| Error::Storage("store has been closed".to_string()))
    }

    /// The head transaction id this snapshot is pinned to. -1 on the empty
    /// snapshot of a store nothing was ever committed to.
    pub fn head_id(&self) -> TxId {
        self.head
    }

    /// Resolves the entity's full attribute map. Entities are never declared,
    /// so an unknown id simply resolves to an empty map.
    pub fn attributes(&self, entity_id: &str) -> CResult<Attributes> {
        let shared = self.shared()?;
        shared.backend().with_conn(|conn| tuple_log::all_for(conn, entity_id, self.head))
    }

    /// Resolves a single attribute of an entity. Scalars short-circuit to one
    /// indexed fetch; collections accumulate their live elements. Absent and
    /// removed attributes are `None`.
    pub fn get(&self, entity_id: &str, attribute: &str) -> CResult<Option<AttributeValue>> {
        let shared = self.shared()?;
        shared.backend().with_conn(|conn| {
            let collection = tuple_log::attribute_definition(conn, attribute, self.head)?
                .is_some_and(|def| def.collection);
            if collection {
                let values = tuple_log::collection_values(conn, entity_id, attribute, self.head)?;
                Ok((!values.is_empty()).then_some(AttributeValue::Collection(values)))
            } else {
                match tuple_log::latest_for(conn, entity_id, attribute, self.head)? {
                    Some(Stored::Value(value)) => Ok(Some(AttributeValue::Scalar(value))),
                    _ => Ok(None),
                }
            }
        })
    }

    /// A filter/take query builder over this snapshot. The builder reads
    /// entity ids and attributes from this snapshot only, never through the
    /// live store.
    pub fn query(&self) -> Query {
        Query::new(self.clone())
    }

    /// Entity ids with any tuple under this head, excluding the head chain
    /// and transaction records.
    pub(crate) fn entities(&self) -> CResult<Vec<String>> {
        let shared = self.shared()?;
        shared.backend().with_conn(|conn| tuple_log::entities(conn, self.head))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::AttrType;
    use crate::store::Store;
    use pretty_assertions::assert_eq;

    #[test]
    fn snapshots_are_stable() -> CResult<()> {
        let store = Store::open_in_memory()?;
        let t = store.transactor();
        t.add_attribute("age", AttrType::Integer, false)?;

        t.add_value(&Value::Integer(42), "age", "alice")?;
        let first = store.current_database()?;
        assert_eq!(first.get("alice", "age")?, Some(AttributeValue::Scalar(Value::Integer(42))));

        t.add_value(&Value::Integer(43), "age", "alice")?;
        let second = store.current_database()?;
        assert_eq!(second.get("alice", "age")?, Some(AttributeValue::Scalar(Value::Integer(43))));

        // The earlier snapshot still answers with the earlier state.
        assert_eq!(first.get("alice", "age")?, Some(AttributeValue::Scalar(Value::Integer(42))));
        assert!(first.head_id() < second.head_id());
        Ok(())
    }

    #[test]
    fn equal_heads_compare_equal() -> CResult<()> {
        let store = Store::open_in_memory()?;
        let t = store.transactor();
        t.add_attribute("age", AttrType::Integer, false)?;
        t.add_value(&Value::Integer(1), "age", "alice")?;

        let a = store.current_database()?;
        let b = store.current_database()?;
        assert_eq!(a, b);

        t.add_value(&Value::Integer(2), "age", "alice")?;
        let c = store.current_database()?;
        assert_ne!(a, c);

        // Snapshots of different stores never compare equal.
        let other = Store::open_in_memory()?;
        assert_ne!(store.current_database()?, other.current_database()?);
        Ok(())
    }

    #[test]
    fn unknown_entities_resolve_empty() -> CResult<()> {
        let store = Store::open_in_memory()?;
        let db = store.current_database()?;
        assert_eq!(db.head_id(), -1);
        assert!(db.attributes("nobody")?.is_empty());
        assert_eq!(db.get("nobody", "age")?, None);
        Ok(())
    }

    #[test]
    fn reads_fail_after_store_drop() -> CResult<()> {
        let store = Store::open_in_memory()?;
        let db = store.current_database()?;
        drop(store);
        assert!(matches!(db.attributes("alice"), Err(Error::Storage(_))));
        Ok(())
    }

    #[test]
    fn attribute_value_accessors() {
        let scalar = AttributeValue::Scalar(Value::Integer(1));
        assert_eq!(scalar.scalar(), Some(&Value::Integer(1)));
        assert_eq!(scalar.collection(), None);
        assert!(scalar.contains(&Value::Integer(1)));
        assert!(!scalar.contains(&Value::Integer(2)));

        let coll = AttributeValue::Collection(vec![Value::from("a"), Value::from("b")]);
        assert_eq!(coll.scalar(), None);
        assert_eq!(coll.collection().map(<[Value]>::len), Some(2));
        assert!(coll.contains(&Value::from("b")));
        assert!(!coll.contains(&Value::from("c")));
    }
}
