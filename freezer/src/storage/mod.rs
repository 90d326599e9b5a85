pub mod backend;
pub mod tuple_log;

use serde_derive::{Deserialize, Serialize};

use crate::mvcc::TxId;

/// Store status, as reported by `Store::status()`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The name of the storage backend.
    pub name: String,

    /// The number of tuples in the log, live and superseded.
    pub tuples: u64,

    /// The number of committed transactions.
    pub transactions: u64,

    /// The newest committed transaction id, or -1 on an empty store.
    pub head: TxId,

    /// The on-disk size of the backing file, or 0 for in-memory stores.
    pub total_disk_size: u64,
}
