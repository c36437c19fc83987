//! Track slot manager
//!
//! A fixed pool of named slots (`cam1`, `cam2`, ...). Each bound slot owns an
//! ingestion task that follows its stream and appends frames to the slot's
//! buffer in the [`FrameStore`].

use crate::buffer::FrameStore;
use crate::frame::FrameRecord;
use crate::transport::{FrameSubscription, MediaStream};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A slot bound to a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotHandle {
    pub name: String,
    pub stream_id: String,
}

/// Outcome of [`SlotPool::assign`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    Bound(SlotHandle),
    /// Every slot is occupied
    Rejected,
}

impl Assignment {
    pub fn handle(&self) -> Option<&SlotHandle> {
        match self {
            Assignment::Bound(handle) => Some(handle),
            Assignment::Rejected => None,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Assignment::Rejected)
    }
}

/// Occupancy snapshot of one slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotStatus {
    pub name: String,
    pub stream_id: Option<String>,
    pub buffered: usize,
}

struct IngestionTask {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

struct Slot {
    name: String,
    stream: Option<Arc<dyn MediaStream>>,
    task: Option<IngestionTask>,
}

impl Slot {
    fn is_bound_to(&self, stream_id: &str) -> bool {
        self.stream.as_ref().is_some_and(|s| s.id() == stream_id)
    }
}

/// Slot-to-stream bindings
///
/// Assignment and release go through one lock, so two concurrent
/// assignments can never bind the same slot.
pub struct SlotPool {
    slots: Mutex<Vec<Slot>>,
    /// Tasks of released slots that may still be winding down
    stopping: Mutex<Vec<JoinHandle<()>>>,
    store: Arc<FrameStore>,
    weak_self: Weak<SlotPool>,
}

impl SlotPool {
    /// Create an empty pool over `names`, in declared order
    pub fn new(names: Vec<String>, store: Arc<FrameStore>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            slots: Mutex::new(
                names
                    .into_iter()
                    .map(|name| Slot {
                        name,
                        stream: None,
                        task: None,
                    })
                    .collect(),
            ),
            stopping: Mutex::new(Vec::new()),
            store,
            weak_self: weak_self.clone(),
        })
    }

    /// Bind `stream` to the first free slot and start ingesting its frames
    ///
    /// A stream that is already bound gets its existing slot back.
    pub fn assign(&self, stream: Arc<dyn MediaStream>) -> Assignment {
        let mut slots = self.slots.lock();

        if let Some(slot) = slots.iter().find(|s| s.is_bound_to(stream.id())) {
            debug!("Stream {} already bound to slot {}", stream.id(), slot.name);
            return Assignment::Bound(SlotHandle {
                name: slot.name.clone(),
                stream_id: stream.id().to_string(),
            });
        }

        let Some(slot) = slots.iter_mut().find(|s| s.stream.is_none()) else {
            warn!("No free camera slot for stream {}, rejecting track", stream.id());
            return Assignment::Rejected;
        };

        // Subscribe before spawning so no frame published after binding is missed
        let subscription = stream.subscribe();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(run_ingestion(
            self.weak_self.clone(),
            slot.name.clone(),
            subscription,
            shutdown_rx,
        ));

        slot.stream = Some(Arc::clone(&stream));
        slot.task = Some(IngestionTask {
            shutdown_tx,
            handle,
        });

        info!("Bound stream {} to slot {}", stream.id(), slot.name);
        Assignment::Bound(SlotHandle {
            name: slot.name.clone(),
            stream_id: stream.id().to_string(),
        })
    }

    /// Unbind a slot, clear its buffer and cancel its ingestion task
    ///
    /// Returns `false` when the slot was unknown or already empty. The task
    /// is signalled but not awaited here; [`release_all`](Self::release_all)
    /// waits for it.
    pub fn release(&self, slot_name: &str) -> bool {
        let task = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots
                .iter_mut()
                .find(|s| s.name == slot_name && s.stream.is_some())
            else {
                return false;
            };
            self.unbind(slot)
        };

        if let Some(task) = task {
            self.stop(task);
        }
        true
    }

    /// Release whichever slot `stream_id` is bound to
    pub fn release_stream(&self, stream_id: &str) -> Option<String> {
        let name = self
            .slots
            .lock()
            .iter()
            .find(|s| s.is_bound_to(stream_id))
            .map(|s| s.name.clone())?;

        // Guard against the slot being rebound between lookup and release
        self.release_if_bound(&name, stream_id).then_some(name)
    }

    fn release_if_bound(&self, slot_name: &str, stream_id: &str) -> bool {
        let task = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots
                .iter_mut()
                .find(|s| s.name == slot_name && s.is_bound_to(stream_id))
            else {
                return false;
            };
            self.unbind(slot)
        };

        if let Some(task) = task {
            self.stop(task);
        }
        true
    }

    /// Release every slot and wait for all ingestion tasks to finish
    pub async fn release_all(&self) {
        let tasks: Vec<IngestionTask> = {
            let mut slots = self.slots.lock();
            slots
                .iter_mut()
                .filter_map(|slot| self.unbind(slot))
                .collect()
        };

        for task in &tasks {
            let _ = task.shutdown_tx.try_send(());
        }
        let mut handles: Vec<JoinHandle<()>> = tasks.into_iter().map(|t| t.handle).collect();
        handles.append(&mut *self.stopping.lock());

        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Ingestion task failed during shutdown: {}", e);
            }
        }
    }

    fn stop(&self, task: IngestionTask) {
        let _ = task.shutdown_tx.try_send(());
        let mut stopping = self.stopping.lock();
        stopping.retain(|h| !h.is_finished());
        stopping.push(task.handle);
    }

    /// Ingestion tasks that have not finished yet, bound or released
    pub fn running_tasks(&self) -> usize {
        let bound = self
            .slots
            .lock()
            .iter()
            .filter(|s| s.task.as_ref().is_some_and(|t| !t.handle.is_finished()))
            .count();
        let mut stopping = self.stopping.lock();
        stopping.retain(|h| !h.is_finished());
        bound + stopping.len()
    }

    // Caller holds the slots lock, so no ingestion append can land after the clear
    fn unbind(&self, slot: &mut Slot) -> Option<IngestionTask> {
        if let Some(stream) = slot.stream.take() {
            info!("Released slot {} (stream {})", slot.name, stream.id());
        }
        self.store.clear(&slot.name);
        slot.task.take()
    }

    /// Append a frame if `stream_id` still owns the slot
    fn ingest(&self, slot_name: &str, stream_id: &str, record: FrameRecord) -> bool {
        let slots = self.slots.lock();
        if !slots
            .iter()
            .any(|s| s.name == slot_name && s.is_bound_to(stream_id))
        {
            return false;
        }
        self.store
            .append(slot_name, record.timestamp, record.frame)
            .is_ok()
    }

    /// Stream bound to a slot, if any
    pub fn stream(&self, slot_name: &str) -> Option<Arc<dyn MediaStream>> {
        self.slots
            .lock()
            .iter()
            .find(|s| s.name == slot_name)
            .and_then(|s| s.stream.clone())
    }

    /// Streams of all bound slots, in slot order
    pub fn bound_streams(&self) -> Vec<(String, Arc<dyn MediaStream>)> {
        self.slots
            .lock()
            .iter()
            .filter_map(|s| s.stream.clone().map(|stream| (s.name.clone(), stream)))
            .collect()
    }

    pub fn is_occupied(&self, slot_name: &str) -> bool {
        self.stream(slot_name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.slots.lock().iter().map(|s| s.name.clone()).collect()
    }

    pub fn contains(&self, slot_name: &str) -> bool {
        self.slots.lock().iter().any(|s| s.name == slot_name)
    }

    pub fn status(&self) -> Vec<SlotStatus> {
        self.slots
            .lock()
            .iter()
            .map(|s| SlotStatus {
                name: s.name.clone(),
                stream_id: s.stream.as_ref().map(|stream| stream.id().to_string()),
                buffered: self.store.len(&s.name),
            })
            .collect()
    }

    pub fn store(&self) -> &Arc<FrameStore> {
        &self.store
    }
}

async fn run_ingestion(
    pool: Weak<SlotPool>,
    slot: String,
    mut subscription: FrameSubscription,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let stream_id = subscription.stream_id().to_string();
    debug!("Ingestion started for slot {} (stream {})", slot, stream_id);

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                debug!("Shutting down ingestion for slot {}", slot);
                return;
            }

            next = subscription.recv() => {
                let Some(pool) = pool.upgrade() else {
                    return;
                };
                match next {
                    Some(record) => {
                        if !pool.ingest(&slot, &stream_id, record) {
                            debug!("Slot {} no longer bound to stream {}", slot, stream_id);
                            return;
                        }
                    }
                    None => {
                        info!("Stream {} ended, releasing slot {}", stream_id, slot);
                        pool.release_if_bound(&slot, &stream_id);
                        return;
                    }
                }
            }
        }
    }
}
