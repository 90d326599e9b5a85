//! The nested-transaction coordinator.
//!
//! Transactions nest by reference count, per thread and per store. Only the
//! outermost open begins a DB transaction (deferred for reads, exclusive for
//! writes) and only the outermost close commits or rolls back; inner opens
//! reuse the outer transaction and its id. The first failing block marks the
//! whole stack failed, forcing a rollback at the top-level exit.
//!
//! Per-thread state lives in a thread-local map keyed by store identity and
//! is released at the outermost close (and at thread exit). The commit path
//! and change publication share one mutex so notification order equals
//! commit order.

use std::cell::RefCell;
use std::collections::HashMap;

use crate::changes::QueuedChange;
use crate::error::{CResult, Error};
use crate::mvcc::snapshot::Database;
use crate::mvcc::{transactor, TxId};
use crate::store::Store;

/// One thread's open transaction stack against one store.
struct ActiveTransaction {
    /// Nesting depth; the stack is released when it reaches zero.
    depth: usize,

    /// Whether the outermost open was a read. Writes cannot nest inside.
    read_only: bool,

    /// Set by the first failing block; forces rollback at top-level exit.
    failed: bool,

    /// The id allocated at write entry. `None` in read-only stacks.
    tx_id: Option<TxId>,

    /// Change records queued by the write block, published at commit.
    queue: Vec<QueuedChange>,

    /// The pre-transaction snapshot, passed to nested blocks and published
    /// as `previous` with the commit's changes.
    previous: Database,
}

thread_local! {
    /// Open transactions on this thread, keyed by store identity.
    static ACTIVE: RefCell<HashMap<u64, ActiveTransaction>> = RefCell::new(HashMap::new());
}

/// Runs `block` inside a read transaction, opening a deferred DB transaction
/// if the thread is not already inside one. The block's snapshot is the
/// pre-transaction snapshot; reads through it see a consistent view of the
/// file for the duration.
pub(crate) fn read<T>(store: &Store, block: impl FnOnce(&Database) -> CResult<T>) -> CResult<T> {
    let snapshot = enter_read(store)?;
    let result = block(&snapshot);
    exit(store, result)
}

/// Runs `block` inside a write transaction, opening an exclusive DB
/// transaction and allocating a fresh transaction id if the thread is not
/// already inside one. On top-level success the coordinator advances the
/// head, commits, and publishes the queued changes; on failure it rolls back
/// and drops them.
pub(crate) fn write<T>(
    store: &Store,
    block: impl FnOnce(&Database, TxId) -> CResult<T>,
) -> CResult<T> {
    let (snapshot, tx_id) = enter_write(store)?;
    let result = block(&snapshot, tx_id);
    exit(store, result)
}

/// The id of the thread's open write transaction against this store.
/// `Ok(None)` when no transaction is open; an error when the open stack is
/// read-only, since mutation cannot nest inside a read.
pub(crate) fn current_write_tx(store: &Store) -> CResult<Option<TxId>> {
    ACTIVE.with(|active| {
        let active = active.borrow();
        match active.get(&store.id()) {
            None => Ok(None),
            Some(tx) if tx.read_only => Err(Error::Nesting(
                "cannot open a write transaction inside a read transaction".to_string(),
            )),
            Some(tx) => tx
                .tx_id
                .map(Some)
                .ok_or_else(|| Error::Internal("write transaction without an id".to_string())),
        }
    })
}

/// Queues a change record on the thread's open write transaction.
pub(crate) fn enqueue_change(store: &Store, change: QueuedChange) -> CResult<()> {
    ACTIVE.with(|active| {
        let mut active = active.borrow_mut();
        match active.get_mut(&store.id()) {
            Some(tx) if !tx.read_only => {
                tx.queue.push(change);
                Ok(())
            }
            _ => Err(Error::Internal(
                "change queued outside a write transaction".to_string(),
            )),
        }
    })
}

fn enter_read(store: &Store) -> CResult<Database> {
    let nested = ACTIVE.with(|active| {
        let mut active = active.borrow_mut();
        active.get_mut(&store.id()).map(|tx| {
            tx.depth += 1;
            tx.previous.clone()
        })
    });
    if let Some(snapshot) = nested {
        return Ok(snapshot);
    }

    store.backend().with_conn(|conn| Ok(conn.execute_batch("BEGIN DEFERRED")?))?;
    let snapshot = match store.current_database() {
        Ok(snapshot) => snapshot,
        Err(err) => {
            rollback(store);
            return Err(err);
        }
    };
    ACTIVE.with(|active| {
        active.borrow_mut().insert(
            store.id(),
            ActiveTransaction {
                depth: 1,
                read_only: true,
                failed: false,
                tx_id: None,
                queue: Vec::new(),
                previous: snapshot.clone(),
            },
        );
    });
    Ok(snapshot)
}

fn enter_write(store: &Store) -> CResult<(Database, TxId)> {
    let nested = ACTIVE.with(|active| {
        let mut active = active.borrow_mut();
        match active.get_mut(&store.id()) {
            Some(tx) if tx.read_only => Err(Error::Nesting(
                "cannot open a write transaction inside a read transaction".to_string(),
            )),
            Some(tx) => {
                let tx_id = tx.tx_id.ok_or_else(|| {
                    Error::Internal("write transaction without an id".to_string())
                })?;
                tx.depth += 1;
                Ok(Some((tx.previous.clone(), tx_id)))
            }
            None => Ok(None),
        }
    })?;
    if let Some(open) = nested {
        return Ok(open);
    }

    store.backend().with_conn(|conn| Ok(conn.execute_batch("BEGIN EXCLUSIVE")?))?;
    let opened = store
        .backend()
        .with_conn(transactor::insert_new_transaction)
        .and_then(|tx_id| Ok((store.current_database()?, tx_id)));
    let (previous, tx_id) = match opened {
        Ok(open) => open,
        Err(err) => {
            rollback(store);
            return Err(err);
        }
    };
    ACTIVE.with(|active| {
        active.borrow_mut().insert(
            store.id(),
            ActiveTransaction {
                depth: 1,
                read_only: false,
                failed: false,
                tx_id: Some(tx_id),
                queue: Vec::new(),
                previous: previous.clone(),
            },
        );
    });
    Ok((previous, tx_id))
}

/// Closes one nesting level, committing or rolling back at the outermost
/// close. An error result (here or in any nested close) fails the whole
/// stack.
fn exit<T>(store: &Store, result: CResult<T>) -> CResult<T> {
    let finished = ACTIVE.with(|active| -> CResult<Option<ActiveTransaction>> {
        let mut active = active.borrow_mut();
        let tx = active.get_mut(&store.id()).ok_or_else(|| {
            Error::Internal("transaction closed without being open".to_string())
        })?;
        if result.is_err() {
            tx.failed = true;
        }
        tx.depth -= 1;
        let depth = tx.depth;
        if depth > 0 {
            Ok(None)
        } else {
            Ok(active.remove(&store.id()))
        }
    })?;
    let Some(tx) = finished else { return result };

    if tx.failed {
        rollback(store);
        log::debug!("rolled back transaction {:?}", tx.tx_id);
        return match result {
            Err(err) => Err(err),
            // A nested block failed but the outermost returned success; the
            // stack still rolls back, and silently dropping the writes would
            // be worse than an error.
            Ok(_) => Err(Error::Internal(
                "write transaction rolled back: a nested transaction failed".to_string(),
            )),
        };
    }

    if tx.read_only {
        store.backend().with_conn(|conn| Ok(conn.execute_batch("COMMIT")?))?;
        return result;
    }

    commit(store, tx)?;
    result
}

/// Top-level commit: advance the head, refresh the snapshot cache, commit
/// the DB transaction, and publish the queued changes, all ordered under the
/// store's publish lock.
fn commit(store: &Store, tx: ActiveTransaction) -> CResult<()> {
    let tx_id = tx
        .tx_id
        .ok_or_else(|| Error::Internal("write transaction without an id".to_string()))?;

    if let Err(err) = store.backend().with_conn(|conn| transactor::update_head(conn, tx_id)) {
        rollback(store);
        return Err(err);
    }

    store.invalidate_snapshot();
    let changed = store.snapshot_at(tx_id);

    let guard = store.publish_lock();
    if let Err(err) = store.backend().with_conn(|conn| Ok(conn.execute_batch("COMMIT")?)) {
        drop(guard);
        rollback(store);
        return Err(err);
    }
    store.prime_snapshot(changed.clone());
    if !tx.queue.is_empty() {
        store.hub().publish(tx.previous, changed, tx.queue);
    }
    drop(guard);

    log::debug!("committed transaction {}", tx_id);
    Ok(())
}

/// Best-effort rollback; a store that cannot roll back has nothing further
/// to lose, so the failure is only logged.
fn rollback(store: &Store) {
    if let Err(err) = store.backend().with_conn(|conn| Ok(conn.execute_batch("ROLLBACK")?)) {
        log::error!("rollback failed: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{AttrType, Value};
    use crate::mvcc::snapshot::AttributeValue;
    use crate::storage::tuple_log;
    use pretty_assertions::assert_eq;

    fn setup() -> CResult<Store> {
        let store = Store::open_in_memory()?;
        store.transactor().add_attribute("k", AttrType::Integer, false)?;
        Ok(store)
    }

    #[test]
    fn nested_write_shares_one_transaction() -> CResult<()> {
        let store = setup()?;
        let t = store.transactor();

        let outer_id = store.write_transaction(|_, outer_id| {
            t.add_value(&Value::Integer(1), "k", "e1")?;
            let inner_id = store.write_transaction(|_, inner_id| {
                t.add_value(&Value::Integer(2), "k", "e2")?;
                Ok(inner_id)
            })?;
            assert_eq!(inner_id, outer_id);
            Ok(outer_id)
        })?;

        // Exactly one transaction id was allocated; both tuples carry it.
        let db = store.current_database()?;
        assert_eq!(db.head_id(), outer_id);
        let tuples = store.backend().with_conn(|conn| tuple_log::enumerate_at(conn, outer_id))?;
        let entities: Vec<&str> =
            tuples.iter().map(|t| t.entity_id.as_str()).filter(|e| e.starts_with('e')).collect();
        assert_eq!(entities, vec!["e1", "e2"]);
        Ok(())
    }

    #[test]
    fn nested_failure_rolls_back_everything() -> CResult<()> {
        let store = setup()?;
        let t = store.transactor();
        let head = store.current_database()?.head_id();

        let mut aborted_id = 0;
        let result: CResult<()> = store.write_transaction(|_, tx_id| {
            aborted_id = tx_id;
            t.add_value(&Value::Integer(1), "k", "e1")?;
            store.write_transaction(|_, _| {
                t.add_value(&Value::Integer(2), "k", "e2")?;
                Err(Error::Internal("abort".to_string()))
            })
        });
        assert!(result.is_err());

        // No tuple carries the aborted id and the head is unchanged.
        let db = store.current_database()?;
        assert_eq!(db.head_id(), head);
        assert_eq!(db.get("e1", "k")?, None);
        assert_eq!(db.get("e2", "k")?, None);
        let tuples = store.backend().with_conn(|conn| tuple_log::enumerate_at(conn, aborted_id))?;
        assert!(tuples.is_empty());
        Ok(())
    }

    #[test]
    fn swallowed_nested_failure_still_rolls_back() -> CResult<()> {
        let store = setup()?;
        let t = store.transactor();
        let head = store.current_database()?.head_id();

        let result: CResult<()> = store.write_transaction(|_, _| {
            t.add_value(&Value::Integer(1), "k", "e1")?;
            // Swallow the nested failure; the stack must fail regardless.
            let _ = store.write_transaction(|_, _| -> CResult<()> {
                Err(Error::Internal("abort".to_string()))
            });
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(store.current_database()?.head_id(), head);
        assert_eq!(store.current_database()?.get("e1", "k")?, None);
        Ok(())
    }

    #[test]
    fn write_inside_read_is_rejected() -> CResult<()> {
        let store = setup()?;
        let t = store.transactor();

        let result = store.read_transaction(|_| {
            store.write_transaction(|_, _| {
                t.add_value(&Value::Integer(1), "k", "e1")?;
                Ok(())
            })
        });
        assert!(matches!(result, Err(Error::Nesting(_))));
        assert_eq!(store.current_database()?.get("e1", "k")?, None);
        Ok(())
    }

    #[test]
    fn read_inside_write_sees_pre_transaction_state() -> CResult<()> {
        let store = setup()?;
        let t = store.transactor();
        t.add_value(&Value::Integer(1), "k", "e1")?;

        store.write_transaction(|_, _| {
            t.add_value(&Value::Integer(2), "k", "e1")?;
            store.read_transaction(|db| {
                // The nested read's snapshot predates this transaction.
                assert_eq!(db.get("e1", "k")?, Some(AttributeValue::Scalar(Value::Integer(1))));
                Ok(())
            })
        })?;

        assert_eq!(
            store.current_database()?.get("e1", "k")?,
            Some(AttributeValue::Scalar(Value::Integer(2)))
        );
        Ok(())
    }

    #[test]
    fn read_transaction_returns_block_value() -> CResult<()> {
        let store = setup()?;
        let t = store.transactor();
        t.add_value(&Value::Integer(7), "k", "e1")?;

        let value = store.read_transaction(|db| db.get("e1", "k"))?;
        assert_eq!(value, Some(AttributeValue::Scalar(Value::Integer(7))));

        // A failing read block rolls back without side effects.
        let result: CResult<()> =
            store.read_transaction(|_| Err(Error::Internal("abort".to_string())));
        assert!(result.is_err());
        assert_eq!(store.current_database()?.head_id(), 2);
        Ok(())
    }

    #[test]
    fn failed_transaction_releases_thread_state() -> CResult<()> {
        let store = setup()?;
        let t = store.transactor();

        let result: CResult<()> =
            store.write_transaction(|_, _| Err(Error::Internal("abort".to_string())));
        assert!(result.is_err());

        // The thread can open fresh transactions afterwards.
        t.add_value(&Value::Integer(1), "k", "e1")?;
        assert_eq!(
            store.current_database()?.get("e1", "k")?,
            Some(AttributeValue::Scalar(Value::Integer(1)))
        );
        Ok(())
    }

    #[test]
    fn tx_ids_strictly_increase() -> CResult<()> {
        let store = setup()?;
        let t = store.transactor();

        let mut last = store.current_database()?.head_id();
        for i in 0..5 {
            t.add_value(&Value::Integer(i), "k", "e1")?;
            let head = store.current_database()?.head_id();
            assert_eq!(head, last + 1);
            last = head;
        }
        Ok(())
    }

    #[test]
    fn concurrent_writers_serialize() -> CResult<()> {
        // A file-backed store: contended exclusive transactions queue on the
        // busy timeout there, while a shared-cache memory store would fail
        // fast with a lock error.
        let dir = tempdir::TempDir::new("freezer")?;
        let store = Store::open(dir.path().join("concurrent.db"))?;
        store.transactor().add_attribute("k", AttrType::Integer, false)?;

        let mut handles = Vec::new();
        for i in 0..4 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || -> CResult<TxId> {
                let t = store.transactor();
                store.write_transaction(|_, tx_id| {
                    t.add_value(&Value::Integer(i), "k", &format!("e{}", i))?;
                    Ok(tx_id)
                })
            }));
        }

        let mut ids: Vec<TxId> =
            handles.into_iter().map(|h| h.join().expect("writer panicked")).collect::<CResult<_>>()?;
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 4);

        // Every writer's entity is visible at the final head.
        let db = store.current_database()?;
        assert_eq!(db.head_id(), *ids.last().expect("no ids"));
        for i in 0..4 {
            assert_eq!(
                db.get(&format!("e{}", i), "k")?,
                Some(AttributeValue::Scalar(Value::Integer(i)))
            );
        }
        Ok(())
    }
}
