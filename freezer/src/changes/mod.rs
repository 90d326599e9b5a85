//! The change stream: commit batches published to subscribers.
//!
//! A single dedicated scheduler thread owns the broadcast side and the
//! per-entity watchers. Every publication, subscription, and watch
//! registration is a command processed on that thread in arrival order, so
//! all subscribers observe a total order consistent with commit order. The
//! coordinator enqueues a publication while still holding the commit lock,
//! which pins command order to commit order.
//!
//! Publication failures are logged and dropped; by the time a batch reaches
//! the scheduler its commit has already succeeded. The streams complete when
//! the store is destroyed: dropping the last store handle closes the command
//! channel and stops the scheduler.

use std::pin::Pin;
use std::sync::mpsc::{self, SyncSender};
use std::sync::Weak;
use std::task::{Context, Poll};
use std::thread;

use tokio::sync::broadcast;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};
use tokio_stream::Stream;

use crate::codec::Value;
use crate::error::{CResult, Error};
use crate::mvcc::snapshot::{Attributes, Database};
use crate::store::{self, Shared};

/// Batches a slow subscriber may fall behind by before the stream skips
/// ahead. The producer is rate-limited by commits, so in practice the buffer
/// never fills.
const BROADCAST_CAPACITY: usize = 64;

/// Whether a change added a value or removed one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    Remove,
}

/// One committed change, as seen by subscribers.
#[derive(Clone, Debug, PartialEq)]
pub struct Change {
    pub kind: ChangeKind,

    /// The entity the change touched.
    pub entity_id: String,

    /// The attribute the change touched. Empty on the synthetic change that
    /// opens a per-entity feed.
    pub attribute: String,

    /// The value added, or the collection element removed. `None` on bare
    /// removals.
    pub delta: Option<Value>,

    /// The snapshot the transaction started from.
    pub previous: Database,

    /// The snapshot pinned at the committed transaction.
    pub changed: Database,
}

/// A change as queued inside a write transaction, before the commit's
/// snapshots exist.
#[derive(Clone, Debug)]
pub(crate) struct QueuedChange {
    pub kind: ChangeKind,
    pub entity_id: String,
    pub attribute: String,
    pub delta: Option<Value>,
}

type Element = Vec<(Attributes, Change)>;
type WatchReply = (Element, UnboundedReceiver<Element>);

enum Command {
    Publish { previous: Database, changed: Database, records: Vec<QueuedChange> },
    Subscribe { reply: SyncSender<broadcast::Receiver<Vec<Change>>> },
    Watch { entity: String, reply: SyncSender<CResult<WatchReply>> },
}

/// Handle to the scheduler thread, owned by the store.
pub(crate) struct ChangeHub {
    commands: mpsc::Sender<Command>,
}

impl ChangeHub {
    /// Spawns the scheduler. It holds only a weak store handle and exits
    /// when the owning store drops this hub, closing the command channel.
    pub fn spawn(shared: Weak<Shared>) -> ChangeHub {
        let (commands, receiver) = mpsc::channel();
        thread::Builder::new()
            .name("freezer-changes".to_string())
            .spawn(move || run(shared, receiver))
            .expect("failed to spawn change scheduler thread");
        ChangeHub { commands }
    }

    /// Hands a commit's batch to the scheduler. Dropped if the scheduler is
    /// gone; the commit has already succeeded.
    pub fn publish(&self, previous: Database, changed: Database, records: Vec<QueuedChange>) {
        let _ = self.commands.send(Command::Publish { previous, changed, records });
    }

    pub fn subscribe(&self) -> CResult<broadcast::Receiver<Vec<Change>>> {
        let (reply, response) = mpsc::sync_channel(1);
        self.commands
            .send(Command::Subscribe { reply })
            .map_err(|_| scheduler_stopped())?;
        response.recv().map_err(|_| scheduler_stopped())
    }

    pub fn watch(&self, entity: &str) -> CResult<WatchReply> {
        let (reply, response) = mpsc::sync_channel(1);
        self.commands
            .send(Command::Watch { entity: entity.to_string(), reply })
            .map_err(|_| scheduler_stopped())?;
        response.recv().map_err(|_| scheduler_stopped())?
    }
}

fn scheduler_stopped() -> Error {
    Error::Internal("change scheduler stopped".to_string())
}

fn run(shared: Weak<Shared>, commands: mpsc::Receiver<Command>) {
    let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
    let mut watchers: Vec<Watcher> = Vec::new();

    while let Ok(command) = commands.recv() {
        match command {
            Command::Publish { previous, changed, records } => {
                let batch: Vec<Change> = records
                    .into_iter()
                    .map(|record| Change {
                        kind: record.kind,
                        entity_id: record.entity_id,
                        attribute: record.attribute,
                        delta: record.delta,
                        previous: previous.clone(),
                        changed: changed.clone(),
                    })
                    .collect();
                // No live receivers is fine; subscribers come and go.
                let _ = broadcast_tx.send(batch.clone());
                watchers.retain(|watcher| watcher.deliver(&batch));
            }
            Command::Subscribe { reply } => {
                let _ = reply.send(broadcast_tx.subscribe());
            }
            Command::Watch { entity, reply } => {
                let _ = reply.send(register_watcher(&shared, entity, &mut watchers));
            }
        }
    }
    log::debug!("change scheduler stopped");
}

/// Reads the entity's current state and registers the watcher, both on the
/// scheduler so the initial element and subsequent batches form a total
/// order consistent with commits.
fn register_watcher(
    shared: &Weak<Shared>,
    entity: String,
    watchers: &mut Vec<Watcher>,
) -> CResult<WatchReply> {
    let shared = shared
        .upgrade()
        .ok_or_else(|| Error::Storage("store has been closed".to_string()))?;
    let current = store::current_database(&shared)?;
    let attrs = current.attributes(&entity)?;
    let synthetic = Change {
        kind: ChangeKind::Add,
        entity_id: entity.clone(),
        attribute: String::new(),
        delta: None,
        previous: current.clone(),
        changed: current,
    };

    let (sender, receiver) = unbounded_channel();
    watchers.push(Watcher { entity, sender });
    Ok((vec![(attrs, synthetic)], receiver))
}

/// One per-entity subscriber.
struct Watcher {
    entity: String,
    sender: UnboundedSender<Element>,
}

impl Watcher {
    /// Delivers the batch's records for this watcher's entity, each paired
    /// with the entity's state under the commit's snapshot. Returns false
    /// once the subscriber is gone.
    fn deliver(&self, batch: &[Change]) -> bool {
        let records: Vec<&Change> =
            batch.iter().filter(|change| change.entity_id == self.entity).collect();
        if records.is_empty() {
            return true;
        }

        let mut element = Vec::with_capacity(records.len());
        for record in records {
            match record.changed.attributes(&self.entity) {
                Ok(attrs) => element.push((attrs, record.clone())),
                Err(err) => {
                    log::error!("dropping change notification for {}: {}", self.entity, err);
                    return true;
                }
            }
        }
        self.sender.send(element).is_ok()
    }
}

/// The stream of commit batches, from `Store::changes()`. Completes when the
/// store is destroyed.
pub struct ChangeStream {
    inner: BroadcastStream<Vec<Change>>,
}

impl ChangeStream {
    pub(crate) fn new(receiver: broadcast::Receiver<Vec<Change>>) -> ChangeStream {
        ChangeStream { inner: BroadcastStream::new(receiver) }
    }
}

impl Stream for ChangeStream {
    type Item = Vec<Change>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(batch))) => return Poll::Ready(Some(batch)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    log::warn!("change subscriber lagged; skipped {} batches", skipped);
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// The per-entity feed, from `Store::values_and_changes_for()`: the entity's
/// current state first, then its slice of every subsequent commit.
pub struct EntityChanges {
    initial: Option<Element>,
    inner: UnboundedReceiverStream<Element>,
}

impl EntityChanges {
    pub(crate) fn new(initial: Element, receiver: UnboundedReceiver<Element>) -> EntityChanges {
        EntityChanges { initial: Some(initial), inner: UnboundedReceiverStream::new(receiver) }
    }
}

impl Stream for EntityChanges {
    type Item = Element;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(initial) = this.initial.take() {
            return Poll::Ready(Some(initial));
        }
        Pin::new(&mut this.inner).poll_next(cx)
    }
}
