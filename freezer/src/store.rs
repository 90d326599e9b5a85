//! The store facade: open, snapshot, transact, subscribe.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::changes::{ChangeHub, ChangeStream, EntityChanges};
use crate::error::CResult;
use crate::lens::Lens;
use crate::mvcc::coordinator;
use crate::mvcc::snapshot::Database;
use crate::mvcc::transactor::Transactor;
use crate::mvcc::TxId;
use crate::storage::backend::Backend;
use crate::storage::{tuple_log, Status};

/// Shared store state. `Store` handles and the change scheduler reach the
/// backend through this; snapshots hold it weakly, so the memoized snapshot
/// inside does not keep the store alive through itself.
pub(crate) struct Shared {
    backend: Backend,

    /// The memoized current snapshot: a single shared slot, cleared at each
    /// commit and recomputed lazily from the head chain. Readers may observe
    /// a snapshot one commit stale, never a torn one.
    cache: RwLock<Option<Database>>,

    /// Serializes the commit/publish step across threads so notification
    /// order equals commit order.
    publish_lock: Mutex<()>,

    hub: ChangeHub,
}

impl Shared {
    pub(crate) fn backend(&self) -> &Backend {
        &self.backend
    }
}

/// Computes (or returns the memoized) current snapshot.
pub(crate) fn current_database(shared: &Arc<Shared>) -> CResult<Database> {
    let cached = shared.cache.read().unwrap_or_else(|e| e.into_inner()).clone();
    if let Some(db) = cached {
        return Ok(db);
    }
    let head = shared.backend.with_conn(tuple_log::head)?;
    let db = Database::at(shared, head);
    *shared.cache.write().unwrap_or_else(|e| e.into_inner()) = Some(db.clone());
    Ok(db)
}

/// An embedded, append-only, transactional key-value store.
///
/// A `Store` is a cheap-clone handle; clones share one backing database,
/// snapshot cache, and change scheduler. Dropping the last handle stops the
/// scheduler and completes all change streams.
#[derive(Clone)]
pub struct Store {
    shared: Arc<Shared>,
}

impl Store {
    /// Opens the store at `path`, creating the backing file if missing.
    pub fn open(path: impl AsRef<Path>) -> CResult<Store> {
        let backend = Backend::open(path.as_ref())?;
        log::info!("opened freezer store at {}", backend.path());
        Ok(Store::with_backend(backend))
    }

    /// Opens a fresh in-memory store. Intended for tests and scratch use;
    /// the database vanishes when the last connection to it closes.
    pub fn open_in_memory() -> CResult<Store> {
        let backend = Backend::open_in_memory()?;
        log::info!("opened in-memory freezer store");
        Ok(Store::with_backend(backend))
    }

    fn with_backend(backend: Backend) -> Store {
        let shared = Arc::new_cyclic(|weak| Shared {
            backend,
            cache: RwLock::new(None),
            publish_lock: Mutex::new(()),
            hub: ChangeHub::spawn(weak.clone()),
        });
        Store { shared }
    }

    /// The transactor for appending tuples to this store.
    pub fn transactor(&self) -> Transactor {
        Transactor::new(self.clone())
    }

    /// An add/remove/read accessor for one `(attribute, entity)` pair.
    pub fn lens(&self, attribute: &str, entity_id: &str) -> Lens {
        Lens::new(self.clone(), attribute, entity_id)
    }

    /// The current snapshot: pinned at the newest committed transaction, or
    /// at -1 (the empty snapshot) on a store nothing was ever committed to.
    pub fn current_database(&self) -> CResult<Database> {
        current_database(&self.shared)
    }

    /// Runs `block` inside a read transaction; see the coordinator module.
    /// An `Err` from the block rolls back and propagates.
    pub fn read_transaction<T>(
        &self,
        block: impl FnOnce(&Database) -> CResult<T>,
    ) -> CResult<T> {
        coordinator::read(self, block)
    }

    /// Runs `block` inside a write transaction with the pre-transaction
    /// snapshot and the allocated transaction id. On top-level success the
    /// head advances, the commit lands, and queued changes are published;
    /// an `Err` rolls the whole stack back.
    pub fn write_transaction<T>(
        &self,
        block: impl FnOnce(&Database, TxId) -> CResult<T>,
    ) -> CResult<T> {
        coordinator::write(self, block)
    }

    /// Subscribes to commit batches. Every commit made after this call
    /// arrives as one non-empty batch, in commit order.
    pub fn changes(&self) -> CResult<ChangeStream> {
        Ok(ChangeStream::new(self.shared.hub.subscribe()?))
    }

    /// The per-entity feed: the entity's current state immediately, then its
    /// slice of every subsequent commit. Entity ids compare by value.
    pub fn values_and_changes_for(&self, entity_id: &str) -> CResult<EntityChanges> {
        let (initial, receiver) = self.shared.hub.watch(entity_id)?;
        Ok(EntityChanges::new(initial, receiver))
    }

    /// Store status: log and transaction counts, head, and on-disk size.
    pub fn status(&self) -> CResult<Status> {
        let (tuples, transactions, head) = self.shared.backend.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("SELECT COUNT(*) FROM data")?;
            let tuples: i64 = stmt.query_row([], |row| row.get(0))?;
            let mut stmt = conn.prepare_cached("SELECT COUNT(DISTINCT tx_id) FROM data")?;
            let transactions: i64 = stmt.query_row([], |row| row.get(0))?;
            Ok((tuples as u64, transactions as u64, tuple_log::head(conn)?))
        })?;
        let total_disk_size = if self.shared.backend.is_memory() {
            0
        } else {
            std::fs::metadata(self.shared.backend.path()).map(|meta| meta.len()).unwrap_or(0)
        };
        Ok(Status { name: "freezer".to_string(), tuples, transactions, head, total_disk_size })
    }

    /// The store identity keying per-thread coordinator and connection state.
    pub(crate) fn id(&self) -> u64 {
        self.shared.backend.id()
    }

    pub(crate) fn backend(&self) -> &Backend {
        &self.shared.backend
    }

    /// Clears the memoized snapshot; the next `current_database` recomputes
    /// from the head chain.
    pub(crate) fn invalidate_snapshot(&self) {
        *self.shared.cache.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Memoizes a freshly committed snapshot.
    pub(crate) fn prime_snapshot(&self, db: Database) {
        *self.shared.cache.write().unwrap_or_else(|e| e.into_inner()) = Some(db);
    }

    /// A snapshot pinned at `head`.
    pub(crate) fn snapshot_at(&self, head: TxId) -> Database {
        Database::at(&self.shared, head)
    }

    pub(crate) fn publish_lock(&self) -> MutexGuard<'_, ()> {
        self.shared.publish_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn hub(&self) -> &ChangeHub {
        &self.shared.hub
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{AttrType, Value};
    use crate::mvcc::snapshot::AttributeValue;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_store() -> CResult<()> {
        let store = Store::open_in_memory()?;
        let db = store.current_database()?;
        assert_eq!(db.head_id(), -1);
        assert!(db.attributes("anyone")?.is_empty());

        let status = store.status()?;
        assert_eq!(status.tuples, 0);
        assert_eq!(status.transactions, 0);
        assert_eq!(status.head, -1);
        assert_eq!(status.total_disk_size, 0);
        Ok(())
    }

    #[test]
    fn head_tracks_largest_committed_tx() -> CResult<()> {
        let store = Store::open_in_memory()?;
        let t = store.transactor();
        t.add_attribute("k", AttrType::Integer, false)?;

        for i in 0..3 {
            let committed = store.write_transaction(|_, tx_id| {
                t.add_value(&Value::Integer(i), "k", "e")?;
                Ok(tx_id)
            })?;
            assert_eq!(store.current_database()?.head_id(), committed);
        }
        Ok(())
    }

    #[test]
    fn current_database_is_memoized() -> CResult<()> {
        let store = Store::open_in_memory()?;
        let t = store.transactor();
        t.add_attribute("k", AttrType::Integer, false)?;

        let a = store.current_database()?;
        let b = store.current_database()?;
        assert_eq!(a, b);

        t.add_value(&Value::Integer(1), "k", "e")?;
        let c = store.current_database()?;
        assert_ne!(a, c);
        assert_eq!(c.head_id(), a.head_id() + 1);
        Ok(())
    }

    #[test]
    fn reopen_preserves_state() -> CResult<()> {
        let dir = tempdir::TempDir::new("freezer")?;
        let path = dir.path().join("store.db");

        {
            let store = Store::open(&path)?;
            let t = store.transactor();
            t.add_attribute("age", AttrType::Integer, false)?;
            t.add_value(&Value::Integer(42), "age", "alice")?;
        }

        let store = Store::open(&path)?;
        let db = store.current_database()?;
        assert_eq!(db.head_id(), 2);
        assert_eq!(db.get("alice", "age")?, Some(AttributeValue::Scalar(Value::Integer(42))));
        assert!(store.status()?.total_disk_size > 0);
        Ok(())
    }

    #[test]
    fn status_counts() -> CResult<()> {
        let store = Store::open_in_memory()?;
        let t = store.transactor();
        t.add_attribute("age", AttrType::Integer, false)?;
        t.add_value(&Value::Integer(42), "age", "alice")?;

        let status = store.status()?;
        assert_eq!(status.name, "freezer");
        // tx 1: attribute definition (2 tuples), tx record, head pointer.
        // tx 2: the value, tx record, head pointer.
        assert_eq!(status.transactions, 2);
        assert_eq!(status.tuples, 7);
        assert_eq!(status.head, 2);
        Ok(())
    }

    #[test]
    fn clones_share_state() -> CResult<()> {
        let store = Store::open_in_memory()?;
        let clone = store.clone();
        let t = store.transactor();
        t.add_attribute("k", AttrType::Integer, false)?;
        t.add_value(&Value::Integer(1), "k", "e")?;

        assert_eq!(clone.current_database()?, store.current_database()?);
        Ok(())
    }
}
