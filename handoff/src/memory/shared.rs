//! Shared memory region aliased by the coordinator and the worker.
//!
//! Every slot is an `AtomicU64` holding the bit pattern of an `f64`, so racing
//! accesses from both sides are memory-safe. They are still unsynchronized:
//! loads and stores use `Relaxed` ordering and a read-modify-write is a load
//! followed by a store, so two sides updating the same slot can lose updates.
//! Callers that need more must agree on an external protocol, or take the
//! advisory lock (`SharedRegion::lock`) on both sides.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use super::BufferError;

/// Identity of a shared region, stable across every handle to it. Used to
/// correlate log events from both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(uuid::Uuid);

impl RegionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for RegionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RegionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether the worker takes the region's advisory lock while mutating it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Mutate without any lock. This is the reference contract.
    #[default]
    Unsynchronized,
    /// Hold `SharedRegion::lock` for the duration of the mutation.
    Locked,
}

impl FromStr for SyncPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unsynchronized" | "none" => Ok(Self::Unsynchronized),
            "locked" | "lock" => Ok(Self::Locked),
            other => Err(format!(
                "invalid sync policy '{other}', expected 'unsynchronized' or 'locked'"
            )),
        }
    }
}

struct RegionInner {
    id: RegionId,
    slots: Box<[AtomicU64]>,
    lock: Mutex<()>,
}

/// Handle to a fixed-size block of `f64` slots.
///
/// Cloning the handle does not copy the storage; the storage is freed when the
/// last handle on either side is dropped.
#[derive(Clone)]
pub struct SharedRegion {
    inner: Arc<RegionInner>,
}

impl SharedRegion {
    /// Allocate a zeroed region of `len` slots.
    pub fn new(len: usize) -> Self {
        let slots = (0..len).map(|_| AtomicU64::new(0f64.to_bits())).collect();
        Self {
            inner: Arc::new(RegionInner {
                id: RegionId::new(),
                slots,
                lock: Mutex::new(()),
            }),
        }
    }

    /// Allocate a region sized for `values` and fill it.
    pub fn from_slice(values: &[f64]) -> Self {
        let region = Self::new(values.len());
        for (slot, value) in region.inner.slots.iter().zip(values) {
            slot.store(value.to_bits(), Ordering::Relaxed);
        }
        region
    }

    pub fn id(&self) -> RegionId {
        self.inner.id
    }

    pub fn len(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.slots.is_empty()
    }

    pub fn byte_len(&self) -> usize {
        self.len() * super::SLOT_BYTES
    }

    /// Number of live handles, across both sides of the channel.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// True when both handles resolve to the same storage.
    pub fn same_region(&self, other: &SharedRegion) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn load(&self, index: usize) -> Result<f64, BufferError> {
        let slot = self.slot(index)?;
        Ok(f64::from_bits(slot.load(Ordering::Relaxed)))
    }

    pub fn store(&self, index: usize, value: f64) -> Result<(), BufferError> {
        let slot = self.slot(index)?;
        slot.store(value.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    /// Read every slot. Not atomic as a whole: a concurrent writer may be
    /// observed half-way through.
    pub fn snapshot(&self) -> Vec<f64> {
        self.inner
            .slots
            .iter()
            .map(|slot| f64::from_bits(slot.load(Ordering::Relaxed)))
            .collect()
    }

    /// Apply `f` in place to the first `length` slots, clamped to the region size.
    ///
    /// Each slot is a separate load and store. Returns the number of slots touched.
    pub fn update_prefix(&self, length: usize, f: impl Fn(f64) -> f64) -> usize {
        let count = length.min(self.len());
        for slot in &self.inner.slots[..count] {
            let current = f64::from_bits(slot.load(Ordering::Relaxed));
            slot.store(f(current).to_bits(), Ordering::Relaxed);
        }
        count
    }

    /// Take the advisory lock.
    ///
    /// The lock only excludes other `lock()` callers. Plain loads and stores
    /// through other handles are not blocked.
    pub fn lock(&self) -> RegionGuard<'_> {
        let guard = self
            .inner
            .lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        RegionGuard {
            region: self,
            _guard: guard,
        }
    }

    fn slot(&self, index: usize) -> Result<&AtomicU64, BufferError> {
        self.inner.slots.get(index).ok_or(BufferError::OutOfBounds {
            index,
            len: self.len(),
        })
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("id", &self.inner.id)
            .field("len", &self.len())
            .field("handles", &self.handle_count())
            .finish()
    }
}

/// Advisory lock held over a region.
pub struct RegionGuard<'a> {
    region: &'a SharedRegion,
    _guard: MutexGuard<'a, ()>,
}

impl std::ops::Deref for RegionGuard<'_> {
    type Target = SharedRegion;

    fn deref(&self) -> &Self::Target {
        self.region
    }
}
