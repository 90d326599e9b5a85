//! The append-only tuple log.
//!
//! Every piece of state is a row `(row_id, entity_id, key, value, tx_id)`.
//! Rows are never updated or deleted; newer state is expressed by appending
//! a row with a higher `tx_id`, and removal by appending a tombstone blob.
//! `row_id` establishes insertion order within a transaction, so the newest
//! row for `(entity, key)` under a head is found by the indexed descending
//! scan on `(entity_id, key, tx_id)` with ties broken by `row_id`.

use std::collections::BTreeMap;

use rusqlite::{params, Connection, OptionalExtension};

use crate::codec::{self, AttrType, Stored, Value};
use crate::error::{CResult, Error};
use crate::mvcc::snapshot::{AttributeValue, Attributes};
use crate::mvcc::TxId;

/// Entity id of the head pointer chain.
pub(crate) const HEAD_ENTITY: &str = "head";

/// Key of head pointer tuples.
pub(crate) const HEAD_KEY: &str = "tx";

/// Entity id prefix of transaction records.
pub(crate) const TX_ENTITY_PREFIX: &str = "<tx:";

/// Attribute carrying a transaction's issuance timestamp.
pub(crate) const TX_DATE_ATTR: &str = "Freezer/tx/date";

/// Schema key holding an attribute's declared type tag.
pub(crate) const ATTR_TYPE_KEY: &str = "Freezer/attr/type";

/// Schema key holding an attribute's cardinality (0 scalar, 1 collection).
pub(crate) const ATTR_COLLECTION_KEY: &str = "Freezer/attr/collection";

/// One row of the log, as enumerated for a commit.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Tuple {
    pub row_id: i64,
    pub entity_id: String,
    pub key: String,
    pub value: Stored,
}

/// An attribute's schema definition.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct AttrDef {
    pub attr_type: AttrType,
    pub collection: bool,
}

/// Appends one tuple. Called only by the transactor, inside an open write
/// transaction.
pub(crate) fn append(
    conn: &Connection,
    entity_id: &str,
    key: &str,
    value: &[u8],
    tx_id: TxId,
) -> CResult<()> {
    let mut stmt = conn
        .prepare_cached("INSERT INTO data (entity_id, key, value, tx_id) VALUES (?1, ?2, ?3, ?4)")?;
    stmt.execute(params![entity_id, key, value, tx_id])?;
    Ok(())
}

/// Returns the newest tuple for `(entity, key)` with `tx_id <= head`, if any.
pub(crate) fn latest_for(
    conn: &Connection,
    entity_id: &str,
    key: &str,
    head: TxId,
) -> CResult<Option<Stored>> {
    let mut stmt = conn.prepare_cached(
        "SELECT value FROM data WHERE entity_id = ?1 AND key = ?2 AND tx_id <= ?3 \
         ORDER BY tx_id DESC, row_id DESC LIMIT 1",
    )?;
    let blob: Option<Vec<u8>> = stmt
        .query_row(params![entity_id, key, head], |row| row.get(0))
        .optional()?;
    blob.map(|blob| codec::decode(&blob)).transpose()
}

/// Accumulates the live elements of a collection attribute under `head`:
/// value rows insert (duplicates ignored), element tombstones remove that
/// value, bare tombstones clear the set.
pub(crate) fn collection_values(
    conn: &Connection,
    entity_id: &str,
    key: &str,
    head: TxId,
) -> CResult<Vec<Value>> {
    let mut stmt = conn.prepare_cached(
        "SELECT value FROM data WHERE entity_id = ?1 AND key = ?2 AND tx_id <= ?3 \
         ORDER BY tx_id, row_id",
    )?;
    let mut rows = stmt.query(params![entity_id, key, head])?;

    let mut values = Vec::new();
    while let Some(row) = rows.next()? {
        let blob: Vec<u8> = row.get(0)?;
        fold_collection(&mut values, codec::decode(&blob)?);
    }
    Ok(values)
}

fn fold_collection(values: &mut Vec<Value>, stored: Stored) {
    match stored {
        Stored::Value(value) => {
            if !values.contains(&value) {
                values.push(value);
            }
        }
        Stored::Tombstone(Some(value)) => values.retain(|v| v != &value),
        Stored::Tombstone(None) => values.clear(),
    }
}

/// Resolves the full attribute map of an entity under `head`. Scalar
/// attributes observe last-writer-wins and drop tombstoned keys; collection
/// attributes accumulate. Keys resolving to nothing are absent.
pub(crate) fn all_for(conn: &Connection, entity_id: &str, head: TxId) -> CResult<Attributes> {
    let mut stmt = conn.prepare_cached(
        "SELECT key, value FROM data WHERE entity_id = ?1 AND tx_id <= ?2 \
         ORDER BY key, tx_id, row_id",
    )?;
    let mut rows = stmt.query(params![entity_id, head])?;

    // Rows arrive grouped by key and ordered within each group.
    let mut grouped: Vec<(String, Vec<Stored>)> = Vec::new();
    while let Some(row) = rows.next()? {
        let key: String = row.get(0)?;
        let blob: Vec<u8> = row.get(1)?;
        let stored = codec::decode(&blob)?;
        match grouped.last_mut() {
            Some((last, items)) if *last == key => items.push(stored),
            _ => grouped.push((key, vec![stored])),
        }
    }
    drop(rows);
    drop(stmt);

    let mut attrs = BTreeMap::new();
    for (key, items) in grouped {
        let collection = attribute_definition(conn, &key, head)?.is_some_and(|def| def.collection);
        if collection {
            let mut values = Vec::new();
            for item in items {
                fold_collection(&mut values, item);
            }
            if !values.is_empty() {
                attrs.insert(key, AttributeValue::Collection(values));
            }
        } else if let Some(Stored::Value(value)) = items.into_iter().next_back() {
            attrs.insert(key, AttributeValue::Scalar(value));
        }
    }
    Ok(attrs)
}

/// Returns all tuples of one transaction, in `row_id` order.
pub(crate) fn enumerate_at(conn: &Connection, tx_id: TxId) -> CResult<Vec<Tuple>> {
    let mut stmt = conn.prepare_cached(
        "SELECT row_id, entity_id, key, value FROM data WHERE tx_id = ?1 ORDER BY row_id",
    )?;
    let mut rows = stmt.query(params![tx_id])?;

    let mut tuples = Vec::new();
    while let Some(row) = rows.next()? {
        let blob: Vec<u8> = row.get(3)?;
        tuples.push(Tuple {
            row_id: row.get(0)?,
            entity_id: row.get(1)?,
            key: row.get(2)?,
            value: codec::decode(&blob)?,
        });
    }
    Ok(tuples)
}

/// The largest `tx_id` in the log, or 0 when empty. Transaction ids start
/// at 1.
pub(crate) fn max_tx(conn: &Connection) -> CResult<TxId> {
    let mut stmt = conn.prepare_cached("SELECT COALESCE(MAX(tx_id), 0) FROM data")?;
    Ok(stmt.query_row([], |row| row.get(0))?)
}

/// The current head: the value of the newest head tuple, or -1 when no
/// transaction has ever committed.
pub(crate) fn head(conn: &Connection) -> CResult<TxId> {
    let mut stmt = conn.prepare_cached(
        "SELECT value FROM data WHERE entity_id = ?1 AND key = ?2 ORDER BY row_id DESC LIMIT 1",
    )?;
    let blob: Option<Vec<u8>> = stmt
        .query_row(params![HEAD_ENTITY, HEAD_KEY], |row| row.get(0))
        .optional()?;
    match blob {
        None => Ok(-1),
        Some(blob) => match codec::decode(&blob)? {
            Stored::Value(Value::Integer(tx_id)) => Ok(tx_id),
            other => Err(Error::Encoding(format!("head tuple is not an integer: {:?}", other))),
        },
    }
}

/// Distinct entity ids with any tuple under `head`, excluding the head
/// chain and transaction records. Feeds the query builder.
pub(crate) fn entities(conn: &Connection, head: TxId) -> CResult<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT DISTINCT entity_id FROM data WHERE tx_id <= ?1 \
         AND entity_id <> ?2 AND entity_id NOT LIKE ?3 ORDER BY entity_id",
    )?;
    let pattern = format!("{}%", TX_ENTITY_PREFIX);
    let rows = stmt.query_map(params![head, HEAD_ENTITY, pattern], |row| row.get(0))?;

    let mut ids = Vec::new();
    for id in rows {
        ids.push(id?);
    }
    Ok(ids)
}

/// Resolves an attribute's schema definition under `head`, if the attribute
/// is defined.
pub(crate) fn attribute_definition(
    conn: &Connection,
    name: &str,
    head: TxId,
) -> CResult<Option<AttrDef>> {
    let tag = match latest_for(conn, name, ATTR_TYPE_KEY, head)? {
        Some(Stored::Value(Value::Integer(tag))) => tag,
        _ => return Ok(None),
    };
    let tag = u8::try_from(tag)
        .map_err(|_| Error::Encoding(format!("type tag out of range: {}", tag)))?;
    let attr_type = AttrType::from_tag(tag)?;

    let collection = matches!(
        latest_for(conn, name, ATTR_COLLECTION_KEY, head)?,
        Some(Stored::Value(Value::Integer(v))) if v != 0
    );
    Ok(Some(AttrDef { attr_type, collection }))
}
