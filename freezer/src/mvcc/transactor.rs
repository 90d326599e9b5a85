//! The transactor: the only writer of tuples.
//!
//! Mutators validate against the attribute schema, append tuples under the
//! current write transaction's id, and queue change records for publication
//! at commit. Each mutator implicitly opens a write transaction when the
//! calling thread is not already inside one, so a bare `add_value` is a
//! one-tuple commit of its own.

use chrono::Utc;
use rand::Rng;
use rusqlite::Connection;

use crate::changes::{ChangeKind, QueuedChange};
use crate::codec::{self, AttrType, Value};
use crate::error::{CResult, Error};
use crate::mvcc::{coordinator, TxId};
use crate::storage::tuple_log;
use crate::store::Store;

/// Facade for appending tuples. Obtained from `Store::transactor()`; cheap
/// to clone and to recreate.
#[derive(Clone)]
pub struct Transactor {
    store: Store,
}

impl Transactor {
    pub(crate) fn new(store: Store) -> Transactor {
        Transactor { store }
    }

    /// Defines an attribute: its value type and whether it is a collection.
    /// Idempotent when the existing definition matches; a conflicting
    /// redefinition fails without mutating anything.
    pub fn add_attribute(&self, name: &str, attr_type: AttrType, collection: bool) -> CResult<()> {
        self.with_write_tx(|tx_id| {
            self.store.backend().with_conn(|conn| {
                match tuple_log::attribute_definition(conn, name, TxId::MAX)? {
                    Some(def) if def.attr_type == attr_type && def.collection == collection => {
                        Ok(())
                    }
                    Some(def) => Err(Error::Schema(format!(
                        "attribute {} is already defined as a {} {}",
                        name,
                        def.attr_type,
                        if def.collection { "collection" } else { "scalar" },
                    ))),
                    None => {
                        tuple_log::append(
                            conn,
                            name,
                            tuple_log::ATTR_TYPE_KEY,
                            &codec::encode_value(&Value::Integer(attr_type.tag() as i64)),
                            tx_id,
                        )?;
                        tuple_log::append(
                            conn,
                            name,
                            tuple_log::ATTR_COLLECTION_KEY,
                            &codec::encode_value(&Value::Integer(collection as i64)),
                            tx_id,
                        )
                    }
                }
            })
        })
    }

    /// Appends a value for `(entity, attribute)`.
    ///
    /// The attribute must be defined and the value must match its declared
    /// type. On a scalar attribute a second add within one transaction
    /// overrides the first (the later row wins on read); on a collection,
    /// adding a value that is already live is a no-op.
    pub fn add_value(&self, value: &Value, attribute: &str, entity_id: &str) -> CResult<()> {
        self.with_write_tx(|tx_id| {
            let appended = self.store.backend().with_conn(|conn| {
                let def = self.validated_definition(conn, attribute, Some(value))?;
                if def.collection
                    && tuple_log::collection_values(conn, entity_id, attribute, TxId::MAX)?
                        .contains(value)
                {
                    return Ok(false);
                }
                tuple_log::append(
                    conn,
                    entity_id,
                    attribute,
                    &codec::encode_value(value),
                    tx_id,
                )?;
                Ok(true)
            })?;

            if appended {
                coordinator::enqueue_change(
                    &self.store,
                    QueuedChange {
                        kind: ChangeKind::Add,
                        entity_id: entity_id.to_string(),
                        attribute: attribute.to_string(),
                        delta: Some(value.clone()),
                    },
                )?;
            }
            Ok(())
        })
    }

    /// Appends a removal for `(entity, attribute)`.
    ///
    /// With `None` the attribute becomes absent in snapshots at or above this
    /// transaction (a collection is cleared outright). With `Some(value)` on
    /// a collection attribute, only that element is removed.
    pub fn remove_value(
        &self,
        value: Option<&Value>,
        attribute: &str,
        entity_id: &str,
    ) -> CResult<()> {
        self.with_write_tx(|tx_id| {
            self.store.backend().with_conn(|conn| {
                let def = self.validated_definition(conn, attribute, value)?;
                let blob = match value {
                    Some(value) if def.collection => codec::encode_tombstone(Some(value)),
                    _ => codec::encode_tombstone(None),
                };
                tuple_log::append(conn, entity_id, attribute, &blob, tx_id)
            })?;

            coordinator::enqueue_change(
                &self.store,
                QueuedChange {
                    kind: ChangeKind::Remove,
                    entity_id: entity_id.to_string(),
                    attribute: attribute.to_string(),
                    delta: value.cloned(),
                },
            )?;
            Ok(())
        })
    }

    /// Returns a fresh opaque entity identifier: 128 random bits as 32 hex
    /// characters. Uniqueness is probabilistic; callers requiring certainty
    /// check against the current snapshot.
    pub fn generate_new_key(&self) -> String {
        format!("{:032x}", rand::thread_rng().gen::<u128>())
    }

    /// Runs `op` under the thread's open write transaction, or inside a
    /// fresh one when none is open. Joining an open transaction directly
    /// (rather than nesting a block) keeps a validation failure from forcing
    /// the enclosing stack to roll back: the caller may recover.
    fn with_write_tx<T>(&self, op: impl FnOnce(TxId) -> CResult<T>) -> CResult<T> {
        match coordinator::current_write_tx(&self.store)? {
            Some(tx_id) => op(tx_id),
            None => coordinator::write(&self.store, |_, tx_id| op(tx_id)),
        }
    }

    /// Looks up the attribute's definition, visible to the open transaction,
    /// and validates the value's type against it.
    fn validated_definition(
        &self,
        conn: &Connection,
        attribute: &str,
        value: Option<&Value>,
    ) -> CResult<tuple_log::AttrDef> {
        let def = tuple_log::attribute_definition(conn, attribute, TxId::MAX)?
            .ok_or_else(|| Error::Schema(format!("unknown attribute {}", attribute)))?;
        if let Some(value) = value {
            if value.attr_type() != def.attr_type {
                return Err(Error::Schema(format!(
                    "attribute {} holds {} values, got {}",
                    attribute,
                    def.attr_type,
                    value.attr_type()
                )));
            }
        }
        Ok(def)
    }
}

/// Allocates the next transaction id inside the open DB transaction and
/// appends its `<tx:N>` record, carrying the issuance timestamp.
pub(crate) fn insert_new_transaction(conn: &Connection) -> CResult<TxId> {
    let tx_id = tuple_log::max_tx(conn)? + 1;
    tuple_log::append(
        conn,
        &format!("{}{}>", tuple_log::TX_ENTITY_PREFIX, tx_id),
        tuple_log::TX_DATE_ATTR,
        &codec::encode_value(&Value::Date(Utc::now())),
        tx_id,
    )?;
    Ok(tx_id)
}

/// Appends a head pointer tuple advancing the head to `tx_id`.
pub(crate) fn update_head(conn: &Connection, tx_id: TxId) -> CResult<()> {
    tuple_log::append(
        conn,
        tuple_log::HEAD_ENTITY,
        tuple_log::HEAD_KEY,
        &codec::encode_value(&Value::Integer(tx_id)),
        tx_id,
    )
}
