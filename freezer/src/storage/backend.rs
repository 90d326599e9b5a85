//! The SQLite storage backend.
//!
//! The backend owns no connection itself: each thread lazily constructs and
//! caches its own, keyed by store identity, and drops it at thread exit. WAL
//! journaling permits concurrent readers plus one writer without sharing a
//! handle across threads, so connections are opened without SQLite's internal
//! mutex; the transaction coordinator serializes writers.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use rusqlite::{Connection, OpenFlags};

use crate::error::CResult;

/// The append-only tuple table and its composite lookup index. Ensured
/// idempotently on every new connection.
const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS data (
        row_id INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_id TEXT NOT NULL,
        key TEXT NOT NULL,
        value BLOB,
        tx_id INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS lookup ON data (entity_id, key, tx_id);
";

/// Prepared statements cached per connection.
const STATEMENT_CACHE_CAPACITY: usize = 32;

/// How long a connection waits for the exclusive write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Process-unique backend identities, keying the per-thread connection map.
static NEXT_BACKEND_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// This thread's connections, one per open backend. Dropped at thread
    /// exit, closing the connections.
    static CONNECTIONS: RefCell<HashMap<u64, Rc<Connection>>> = RefCell::new(HashMap::new());
}

/// A handle to one backing database file (or shared in-memory database).
/// Cheap to share; holds only the location and open flags.
pub(crate) struct Backend {
    id: u64,
    path: String,
    flags: OpenFlags,
    memory: bool,
}

impl Backend {
    /// Opens the backing file, creating it if missing, and ensures the
    /// schema. The calling thread's connection is established eagerly so
    /// open failures surface here rather than on first use.
    pub fn open(path: &Path) -> CResult<Backend> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let backend = Backend {
            id: NEXT_BACKEND_ID.fetch_add(1, Ordering::Relaxed),
            path: path.to_string_lossy().into_owned(),
            flags: OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_PRIVATE_CACHE,
            memory: false,
        };
        backend.with_conn(|_| Ok(()))?;
        Ok(backend)
    }

    /// Opens a fresh in-memory database. The shared-cache URI lets every
    /// thread's connection observe the same database; it lives as long as
    /// any connection to it remains open.
    pub fn open_in_memory() -> CResult<Backend> {
        let uri = format!(
            "file:freezer-{:032x}?mode=memory&cache=shared",
            rand::thread_rng().gen::<u128>()
        );
        let backend = Backend {
            id: NEXT_BACKEND_ID.fetch_add(1, Ordering::Relaxed),
            path: uri,
            flags: OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
                | OpenFlags::SQLITE_OPEN_URI,
            memory: true,
        };
        backend.with_conn(|_| Ok(()))?;
        Ok(backend)
    }

    /// Runs `f` with this thread's connection, constructing and configuring
    /// it first if the thread has none yet.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> CResult<T>) -> CResult<T> {
        let conn = CONNECTIONS.with(|cache| -> CResult<Rc<Connection>> {
            let mut cache = cache.borrow_mut();
            if let Some(conn) = cache.get(&self.id) {
                return Ok(conn.clone());
            }
            let conn = Rc::new(self.new_connection()?);
            cache.insert(self.id, conn.clone());
            Ok(conn)
        })?;
        f(&conn)
    }

    /// The process-unique identity of this backend, keying per-thread state.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The location of the backing database.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether this backend is an in-memory database.
    pub fn is_memory(&self) -> bool {
        self.memory
    }

    /// Opens and configures a new connection for the calling thread.
    fn new_connection(&self) -> CResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags)?;
        conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
        conn.busy_timeout(BUSY_TIMEOUT)?;

        // The journal_mode pragma reports the active mode as a row; memory
        // databases stay on their own journal and report "memory".
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "legacy_file_format", false)?;
        if self.memory {
            // Shared-cache readers fail with SQLITE_LOCKED while a writer
            // holds table locks, and the busy timeout does not cover that.
            // Snapshot resolution is bounded by committed heads, so rows of
            // an in-flight transaction carry a higher tx_id and stay
            // invisible to read-uncommitted queries.
            conn.pragma_update(None, "read_uncommitted", true)?;
        }

        conn.execute_batch(SCHEMA)?;
        log::debug!("opened connection to {}", self.path);
        Ok(conn)
    }
}
