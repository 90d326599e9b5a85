//! `freezer` is an embedded, append-only, transactional key-value store with
//! multi-version snapshot reads and a change-notification stream.
//!
//! State is a log of `(entity, attribute, value)` tuples in a local SQLite
//! file, each stamped with the id of the transaction that wrote it. Tuples
//! are never updated or deleted; newer state is appended at a higher id, and
//! an immutable snapshot (a [`Database`](mvcc::snapshot::Database)) pinned at
//! a head id resolves each attribute to the newest tuple at or below it.
//! Historical snapshots therefore stay answerable forever.
//!
//! Writes run in nested, per-thread transactions: the outermost block opens
//! an exclusive transaction and allocates the id, inner blocks join it, and
//! the commit atomically advances the head and publishes the batch of
//! changes to subscribers, in commit order.
//!
//! ## Getting started
//!
//! ```
//! use freezer::{AttrType, Store, Value};
//!
//! fn main() -> Result<(), freezer::Error> {
//!     let store = Store::open_in_memory()?;
//!     let transactor = store.transactor();
//!
//!     transactor.add_attribute("age", AttrType::Integer, false)?;
//!     transactor.add_value(&Value::Integer(42), "age", "alice")?;
//!
//!     let db = store.current_database()?;
//!     assert_eq!(
//!         db.get("alice", "age")?.and_then(|age| age.scalar().cloned()),
//!         Some(Value::Integer(42)),
//!     );
//!     Ok(())
//! }
//! ```

pub mod changes;
pub mod codec;
pub mod error;
pub mod lens;
pub mod mvcc;
pub mod query;
pub mod storage;
pub mod store;

pub use changes::{Change, ChangeKind, ChangeStream, EntityChanges};
pub use codec::{AttrType, Value};
pub use error::{CResult, Error};
pub use lens::Lens;
pub use mvcc::snapshot::{AttributeValue, Attributes, Database};
pub use mvcc::transactor::Transactor;
pub use mvcc::TxId;
pub use query::Query;
pub use storage::Status;
pub use store::Store;

#[cfg(test)]
mod test {
    use crate::error::CResult;
    use crate::{AttrType, AttributeValue, Store, Value};

    #[test]
    fn run() -> CResult<()> {
        let store = Store::open_in_memory()?;
        let t = store.transactor();

        t.add_attribute("name", AttrType::String, false)?;
        t.add_attribute("tags", AttrType::String, true)?;

        let key = t.generate_new_key();
        t.add_value(&Value::from("alice"), "name", &key)?;
        t.add_value(&Value::from("admin"), "tags", &key)?;
        t.add_value(&Value::from("ops"), "tags", &key)?;

        let before = store.current_database()?;
        assert_eq!(
            before.get(&key, "name")?,
            Some(AttributeValue::Scalar(Value::from("alice")))
        );

        t.add_value(&Value::from("bob"), "name", &key)?;
        t.remove_value(Some(&Value::from("ops")), "tags", &key)?;

        let after = store.current_database()?;
        assert_eq!(after.get(&key, "name")?, Some(AttributeValue::Scalar(Value::from("bob"))));
        assert_eq!(
            after.get(&key, "tags")?,
            Some(AttributeValue::Collection(vec![Value::from("admin")]))
        );

        // The earlier snapshot is unaffected.
        assert_eq!(
            before.get(&key, "name")?,
            Some(AttributeValue::Scalar(Value::from("alice")))
        );
        assert_eq!(
            before.get(&key, "tags")?,
            Some(AttributeValue::Collection(vec![Value::from("admin"), Value::from("ops")]))
        );

        Ok(())
    }
}
