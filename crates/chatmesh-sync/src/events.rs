//! Observer fan-out for sync progress.
//!
//! The engine owns its observer list; every registered observer receives
//! every event.

use std::sync::{Arc, PoisonError, RwLock};

use serde_json::{json, Value};
use tokio::sync::mpsc;

use chatmesh_core::{EntityId, EntityKind, PeerAddress};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncEvent {
    CycleStarted,
    /// A kind's root hash matched a peer's.
    KindSynchronized { kind: EntityKind, peer: PeerAddress },
    /// Local content changed during the cycle.
    ContentChanged,
    CycleFinished { changed: bool },
    FileFetched { file_id: EntityId, peer: PeerAddress },
}

impl SyncEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::CycleStarted => "sync-started",
            SyncEvent::KindSynchronized { .. } => "kind-synchronized",
            SyncEvent::ContentChanged => "content-changed",
            SyncEvent::CycleFinished { .. } => "sync-finished",
            SyncEvent::FileFetched { .. } => "file-fetched",
        }
    }

    /// Event body as JSON.
    pub fn payload(&self) -> Value {
        match self {
            SyncEvent::CycleStarted | SyncEvent::ContentChanged => Value::Null,
            SyncEvent::KindSynchronized { kind, peer } => {
                json!({"type": kind, "peer": peer.to_string()})
            }
            SyncEvent::CycleFinished { changed } => json!({"changed": changed}),
            SyncEvent::FileFetched { file_id, peer } => {
                json!({"fileId": file_id, "peer": peer.to_string()})
            }
        }
    }
}

pub trait SyncObserver: Send + Sync {
    fn on_event(&self, event: &SyncEvent);
}

/// Forwards events into an unbounded channel.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<SyncEvent>,
}

impl ChannelObserver {
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl SyncObserver for ChannelObserver {
    fn on_event(&self, event: &SyncEvent) {
        let _ = self.tx.send(event.clone());
    }
}

#[derive(Default)]
pub(crate) struct Observers {
    list: RwLock<Vec<Arc<dyn SyncObserver>>>,
}

impl Observers {
    pub(crate) fn add(&self, observer: Arc<dyn SyncObserver>) {
        self.list
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        let observers = self
            .list
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            observer.on_event(&event);
        }
    }
}
