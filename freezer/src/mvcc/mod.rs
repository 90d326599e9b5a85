//! Multi-version reads and transactional writes over the tuple log.
//!
//! Every committed write transaction is identified by a `TxId`, strictly
//! increasing across commits. A snapshot pinned at head `H` resolves each
//! `(entity, attribute)` to the newest tuple with `tx_id <= H`, so historical
//! snapshots stay stable forever: new state is only ever appended at higher
//! ids, and the log is retained indefinitely.
//!
//! Writers are serialized by the backend's exclusive transaction; readers
//! proceed concurrently through WAL. The coordinator brackets user blocks in
//! nested read/write transactions on the calling thread and publishes the
//! committed delta to the change stream.

pub mod coordinator;
pub mod snapshot;
pub mod transactor;

/// A transaction id: a logical timestamp assigned at write-transaction entry.
/// -1 denotes "no transaction", the head of a store nothing was ever
/// committed to.
pub type TxId = i64;
