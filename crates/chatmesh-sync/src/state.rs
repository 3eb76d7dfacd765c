//! Single-flight cycle state.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use chatmesh_core::{EntityId, EntityKind};

/// Shared state of the node's sync cycles.
///
/// `in_progress` is the single-flight flag. Each acquisition bumps a
/// generation so a delayed release from an earlier pass cannot free a
/// later one.
#[derive(Debug, Default)]
pub struct CycleState {
    in_progress: AtomicBool,
    generation: AtomicU64,
    retries: AtomicU32,
    last_cycle_ms: AtomicI64,
    changes: AtomicBool,
    comparisons: Mutex<HashSet<(EntityKind, EntityId)>>,
    pending: AtomicUsize,
}

impl CycleState {
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Single-flight
    // ─────────────────────────────────────────────────────────────────────────

    /// Take the flag. Returns the new generation, or `None` if held.
    pub fn try_acquire(&self) -> Option<u64> {
        self.in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| self.generation.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Release the flag unconditionally.
    pub fn release(&self) {
        self.in_progress.store(false, Ordering::Release);
    }

    /// Release the flag only if it is still held by `generation`.
    pub fn release_generation(&self, generation: u64) -> bool {
        if self.generation.load(Ordering::Acquire) == generation {
            self.release();
            true
        } else {
            false
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Bookkeeping
    // ─────────────────────────────────────────────────────────────────────────

    pub fn mark_started(&self, now: i64) {
        self.last_cycle_ms.store(now, Ordering::Release);
    }

    pub fn last_cycle_ms(&self) -> i64 {
        self.last_cycle_ms.load(Ordering::Acquire)
    }

    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::Acquire)
    }

    /// Count one restart. Returns the new count.
    pub fn bump_retries(&self) -> u32 {
        self.retries.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn reset_retries(&self) {
        self.retries.store(0, Ordering::Release);
    }

    pub fn flag_changes(&self) {
        self.changes.store(true, Ordering::Release);
    }

    pub fn has_changes(&self) -> bool {
        self.changes.load(Ordering::Acquire)
    }

    /// Clear the changes flag, returning what it was.
    pub fn take_changes(&self) -> bool {
        self.changes.swap(false, Ordering::AcqRel)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Content comparisons
    // ─────────────────────────────────────────────────────────────────────────

    /// Start comparing one entity. `false` if that comparison is already
    /// running.
    pub fn begin_comparison(&self, kind: EntityKind, id: EntityId) -> bool {
        let inserted = self
            .comparisons
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((kind, id));
        if inserted {
            self.pending.fetch_add(1, Ordering::AcqRel);
        }
        inserted
    }

    pub fn end_comparison(&self, kind: EntityKind, id: EntityId) {
        self.comparisons
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(kind, id));
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
    }

    pub fn pending_comparisons(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}
