//! Frame synchronization buffer
//!
//! Each camera slot keeps a bounded, time-ordered window of its most recent
//! [`FrameRecord`]s. The pose cycle pairs records across two slots by
//! nearest capture timestamp.

use crate::frame::{FrameRecord, VideoFrame};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::trace;

/// Counters for one slot's buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Records accepted
    pub appended: u64,
    /// Records evicted because the buffer was full
    pub evicted: u64,
    /// Records refused because they were older than the newest retained one
    pub out_of_order: u64,
    /// Records discarded by pruning after a missed match
    pub pruned: u64,
}

/// Bounded oldest-evicting buffer for one slot
#[derive(Debug)]
pub struct FrameBuffer {
    records: VecDeque<FrameRecord>,
    capacity: usize,
    stats: BufferStats,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
            stats: BufferStats::default(),
        }
    }

    /// Append a record, evicting the oldest when full
    ///
    /// Returns `false` when the record is older than the newest retained one
    /// and was dropped.
    pub fn append(&mut self, record: FrameRecord) -> bool {
        if let Some(newest) = self.records.back() {
            if record.timestamp < newest.timestamp {
                self.stats.out_of_order += 1;
                return false;
            }
        }

        if self.records.len() >= self.capacity {
            self.records.pop_front();
            self.stats.evicted += 1;
        }
        self.records.push_back(record);
        self.stats.appended += 1;
        true
    }

    pub fn latest(&self) -> Option<FrameRecord> {
        self.records.back().cloned()
    }

    /// Record whose timestamp is closest to `timestamp`
    pub fn closest_to(&self, timestamp: f64) -> Option<&FrameRecord> {
        self.records.iter().min_by(|a, b| {
            let da = (a.timestamp - timestamp).abs();
            let db = (b.timestamp - timestamp).abs();
            da.total_cmp(&db)
        })
    }

    /// Drop every record older than `timestamp`
    pub fn prune_before(&mut self, timestamp: f64) -> usize {
        let before = self.records.len();
        while self
            .records
            .front()
            .is_some_and(|r| r.timestamp < timestamp)
        {
            self.records.pop_front();
        }
        let removed = before - self.records.len();
        self.stats.pruned += removed as u64;
        removed
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BufferStats {
        self.stats
    }

    pub fn timestamps(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.timestamp).collect()
    }
}

/// Buffers for every configured slot, shared between ingestion, the pose
/// cycle and preview viewers
///
/// All operations take the store lock once and never hold it across an
/// await, so a pair lookup and its pruning are atomic with respect to
/// concurrent appends.
#[derive(Debug)]
pub struct FrameStore {
    buffers: Mutex<HashMap<String, FrameBuffer>>,
}

impl FrameStore {
    pub fn new<I, S>(slots: I, capacity: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let buffers = slots
            .into_iter()
            .map(|name| (name.into(), FrameBuffer::new(capacity)))
            .collect();
        Self {
            buffers: Mutex::new(buffers),
        }
    }

    pub fn contains(&self, slot: &str) -> bool {
        self.buffers.lock().contains_key(slot)
    }

    /// Append a frame to a slot's buffer
    pub fn append(&self, slot: &str, timestamp: f64, frame: Arc<VideoFrame>) -> Result<bool> {
        let mut buffers = self.buffers.lock();
        let buffer = buffers
            .get_mut(slot)
            .ok_or_else(|| Error::SlotNotFound(slot.to_string()))?;
        let accepted = buffer.append(FrameRecord::new(timestamp, frame));
        if !accepted {
            trace!(slot, timestamp, "Dropped out-of-order frame");
        }
        Ok(accepted)
    }

    /// Newest record of a slot, `None` if empty or unknown
    pub fn latest(&self, slot: &str) -> Option<FrameRecord> {
        self.buffers.lock().get(slot).and_then(|b| b.latest())
    }

    /// Find a pair of records whose timestamps differ by at most `tolerance`
    ///
    /// Takes the newest record of `slot_a` and the record of `slot_b` closest
    /// to it. On a match both buffers are left untouched. On a miss each slot
    /// drops everything older than its own compared record, so stale frames
    /// can never match again while both newest candidates survive.
    pub fn synchronized_pair(
        &self,
        slot_a: &str,
        slot_b: &str,
        tolerance: f64,
    ) -> Option<(FrameRecord, FrameRecord)> {
        let mut buffers = self.buffers.lock();

        let a = buffers.get(slot_a)?.latest()?;
        let b = buffers.get(slot_b)?.closest_to(a.timestamp)?.clone();

        let diff = (a.timestamp - b.timestamp).abs();
        if diff <= tolerance {
            return Some((a, b));
        }

        let pruned_a = buffers
            .get_mut(slot_a)
            .map(|buf| buf.prune_before(a.timestamp))
            .unwrap_or(0);
        let pruned_b = buffers
            .get_mut(slot_b)
            .map(|buf| buf.prune_before(b.timestamp))
            .unwrap_or(0);

        trace!(
            slot_a,
            slot_b,
            ts_a = a.timestamp,
            ts_b = b.timestamp,
            diff,
            pruned_a,
            pruned_b,
            "No synchronized pair"
        );
        None
    }

    pub fn clear(&self, slot: &str) {
        if let Some(buffer) = self.buffers.lock().get_mut(slot) {
            buffer.clear();
        }
    }

    pub fn clear_all(&self) {
        for buffer in self.buffers.lock().values_mut() {
            buffer.clear();
        }
    }

    pub fn len(&self, slot: &str) -> usize {
        self.buffers.lock().get(slot).map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, slot: &str) -> bool {
        self.len(slot) == 0
    }

    pub fn stats(&self, slot: &str) -> Option<BufferStats> {
        self.buffers.lock().get(slot).map(|b| b.stats())
    }

    /// Timestamps currently retained by a slot, oldest first
    pub fn timestamps(&self, slot: &str) -> Vec<f64> {
        self.buffers
            .lock()
            .get(slot)
            .map(|b| b.timestamps())
            .unwrap_or_default()
    }
}
