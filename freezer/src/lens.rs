//! The `Lens` accessor: an add/remove/read trio over one attribute of one
//! entity.

use crate::codec::Value;
use crate::error::CResult;
use crate::mvcc::snapshot::AttributeValue;
use crate::store::Store;

/// A fixed `(attribute, entity)` accessor. Obtained from `Store::lens()`.
///
/// Mutations go through the transactor, so they validate against the schema
/// and compose with any write transaction already open on the calling
/// thread; reads resolve against the store's current snapshot.
#[derive(Clone)]
pub struct Lens {
    store: Store,
    attribute: String,
    entity_id: String,
}

impl Lens {
    pub(crate) fn new(store: Store, attribute: &str, entity_id: &str) -> Lens {
        Lens { store, attribute: attribute.to_string(), entity_id: entity_id.to_string() }
    }

    /// Adds a value.
    pub fn add(&self, value: Value) -> CResult<()> {
        self.store.transactor().add_value(&value, &self.attribute, &self.entity_id)
    }

    /// Removes the attribute (`None`) or one collection element (`Some`).
    pub fn remove(&self, value: Option<&Value>) -> CResult<()> {
        self.store.transactor().remove_value(value, &self.attribute, &self.entity_id)
    }

    /// Reads the attribute under the current snapshot.
    pub fn read(&self) -> CResult<Option<AttributeValue>> {
        self.store.current_database()?.get(&self.entity_id, &self.attribute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::AttrType;
    use pretty_assertions::assert_eq;

    #[test]
    fn add_read_remove() -> CResult<()> {
        let store = Store::open_in_memory()?;
        store.transactor().add_attribute("age", AttrType::Integer, false)?;

        let lens = store.lens("age", "alice");
        assert_eq!(lens.read()?, None);

        lens.add(Value::Integer(42))?;
        assert_eq!(lens.read()?, Some(AttributeValue::Scalar(Value::Integer(42))));

        lens.remove(None)?;
        assert_eq!(lens.read()?, None);
        Ok(())
    }

    #[test]
    fn collection_lens() -> CResult<()> {
        let store = Store::open_in_memory()?;
        store.transactor().add_attribute("tags", AttrType::String, true)?;

        let lens = store.lens("tags", "x");
        lens.add(Value::from("a"))?;
        lens.add(Value::from("b"))?;
        lens.remove(Some(&Value::from("a")))?;

        assert_eq!(
            lens.read()?,
            Some(AttributeValue::Collection(vec![Value::from("b")]))
        );
        Ok(())
    }

    #[test]
    fn composes_with_open_write_transactions() -> CResult<()> {
        let store = Store::open_in_memory()?;
        store.transactor().add_attribute("age", AttrType::Integer, false)?;
        let lens = store.lens("age", "alice");

        let committed = store.write_transaction(|_, tx_id| {
            lens.add(Value::Integer(1))?;
            lens.add(Value::Integer(2))?;
            Ok(tx_id)
        })?;

        // Both adds landed in the bracketing transaction.
        let db = store.current_database()?;
        assert_eq!(db.head_id(), committed);
        assert_eq!(lens.read()?, Some(AttributeValue::Scalar(Value::Integer(2))));
        Ok(())
    }
}
