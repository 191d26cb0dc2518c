//! The handle table: the single source of truth for native ownership.
//!
//! Each live handle owns one slot, and each slot retains one [`HostRef`].
//! Duplicating a handle takes a new slot pointing at the same host object,
//! so closing one handle never disturbs another.
//!
//! Slots live in independently locked shards. A handle's low 32 bits hold
//! `(local_index << shard_bits | shard) + 1` and its high 32 bits hold the
//! slot generation, which is bumped on every close so a stale handle is
//! rejected even after its slot has been reused.

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::trace;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::ffi::Handle;
use crate::host::{HostRef, HostResult, PinnedBuffer};

const GENERATION_SHIFT: u32 = 32;
const LOW_MASK: u64 = 0xffff_ffff;

thread_local! {
    static SHARD_HINT: Cell<Option<usize>> = const { Cell::new(None) };
}

static NEXT_SHARD_HINT: AtomicUsize = AtomicUsize::new(0);

/// Shard the calling thread starts its allocations from.
fn shard_hint() -> usize {
    SHARD_HINT.with(|hint| match hint.get() {
        Some(h) => h,
        None => {
            let h = NEXT_SHARD_HINT.fetch_add(1, Ordering::Relaxed);
            hint.set(Some(h));
            h
        }
    })
}

/// Result of closing a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closed {
    /// The handle was released and its slot recycled.
    Released,
    /// The handle is an interned singleton; nothing was released.
    Permanent,
}

struct Entry {
    target: HostRef,
    pin: Option<PinnedBuffer>,
    permanent: bool,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

#[derive(Default)]
struct Shard {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

/// Handle table with generation-checked slots.
pub struct HandleTable {
    shards: Box<[RwLock<Shard>]>,
    shard_bits: u32,
    shard_capacity: usize,
    capacity: usize,
    live: AtomicUsize,
}

impl HandleTable {
    /// Create a table holding at most `capacity` live handles across `shards`
    /// shards. `shards` must be a power of two no larger than 64.
    pub fn new(capacity: usize, shards: usize) -> Result<Self> {
        if capacity == 0 || !shards.is_power_of_two() || shards > 64 {
            return Err(Error::InvalidArgument(format!(
                "bad handle table geometry: capacity {capacity}, shards {shards}"
            )));
        }
        let shard_bits = shards.trailing_zeros();
        let max_local = (1usize << (32 - shard_bits)) - 1;
        let shard_capacity = capacity.div_ceil(shards).min(max_local);
        Ok(Self {
            shards: (0..shards).map(|_| RwLock::new(Shard::default())).collect(),
            shard_bits,
            shard_capacity,
            capacity: capacity.min(shard_capacity * shards),
            live: AtomicUsize::new(0),
        })
    }

    /// Maximum number of live handles.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live handles, permanent ones included.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Number of live handles referring to `target`.
    pub fn live_handles_for(&self, target: &HostRef) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .read()
                    .slots
                    .iter()
                    .filter(|s| s.entry.as_ref().is_some_and(|e| e.target.ptr_eq(target)))
                    .count()
            })
            .sum()
    }

    /// Expose `target` to native code under a fresh handle owned by the caller.
    pub fn allocate(&self, target: HostRef) -> Result<Handle> {
        self.insert(target, false)
    }

    /// Intern `target` under a handle that is never released.
    pub(crate) fn allocate_permanent(&self, target: HostRef) -> Result<Handle> {
        self.insert(target, true)
    }

    /// A second, independently closable handle to the same host object.
    ///
    /// Duplicating a permanent handle returns it unchanged.
    pub fn duplicate(&self, handle: Handle) -> Result<Handle> {
        let (target, permanent) = self.with_entry(handle, |e| (e.target.clone(), e.permanent))?;
        if permanent {
            return Ok(handle);
        }
        self.insert(target, false)
    }

    /// The host object behind `handle`.
    pub fn resolve(&self, handle: Handle) -> Result<HostRef> {
        self.with_entry(handle, |e| e.target.clone())
    }

    /// Release one handle.
    ///
    /// Closing an unknown or already closed handle fails with a handle error
    /// and changes nothing. Closing a permanent handle is a no-op.
    pub fn close(&self, handle: Handle) -> Result<Closed> {
        let (shard, local, generation) = self.decode(handle)?;
        let released = {
            let mut guard = self.shards[shard].write();
            let slot = guard
                .slots
                .get_mut(local as usize)
                .ok_or(Error::ForeignHandle(handle.to_raw()))?;
            if slot.generation != generation {
                return Err(Error::StaleHandle(handle.to_raw()));
            }
            match &slot.entry {
                None => return Err(Error::StaleHandle(handle.to_raw())),
                Some(e) if e.permanent => return Ok(Closed::Permanent),
                Some(_) => {}
            }
            let entry = slot.entry.take();
            slot.generation = slot.generation.wrapping_add(1);
            guard.free.push(local);
            entry
        };
        self.live.fetch_sub(1, Ordering::AcqRel);
        trace!("closed handle {:#x}", handle.to_raw());
        // The host reference and any pin are dropped outside the shard lock.
        drop(released);
        Ok(Closed::Released)
    }

    /// Pin a raw buffer view of the handle's target for as long as the
    /// handle stays open, and return its start.
    ///
    /// A handle keeps at most one pin; later calls return the same pointer.
    pub fn pin_with<F>(&self, handle: Handle, pin: F) -> Result<*const u8>
    where
        F: FnOnce(&HostRef) -> HostResult<PinnedBuffer>,
    {
        let existing = self.with_entry(handle, |e| {
            (e.target.clone(), e.pin.as_ref().map(|p| p.as_ptr()))
        })?;
        if let (_, Some(ptr)) = existing {
            return Ok(ptr);
        }
        let buffer = pin(&existing.0)?;
        let (shard, local, generation) = self.decode(handle)?;
        let mut guard = self.shards[shard].write();
        let entry = guard
            .slots
            .get_mut(local as usize)
            .filter(|s| s.generation == generation)
            .and_then(|s| s.entry.as_mut())
            .ok_or(Error::StaleHandle(handle.to_raw()))?;
        // Another thread may have pinned the same handle meanwhile.
        let pinned = entry.pin.get_or_insert(buffer);
        Ok(pinned.as_ptr())
    }

    fn insert(&self, target: HostRef, permanent: bool) -> Result<Handle> {
        let reserved = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            });
        if reserved.is_err() {
            return Err(Error::HandleTableFull {
                capacity: self.capacity,
            });
        }

        let entry = Entry {
            target,
            pin: None,
            permanent,
        };
        let start = shard_hint();
        let count = self.shards.len();
        let mut entry = Some(entry);
        for step in 0..count {
            let shard_idx = (start + step) & (count - 1);
            let mut shard = self.shards[shard_idx].write();
            let local = match shard.free.pop() {
                Some(local) => local,
                None if shard.slots.len() < self.shard_capacity => {
                    shard.slots.push(Slot {
                        generation: 1,
                        entry: None,
                    });
                    (shard.slots.len() - 1) as u32
                }
                None => continue,
            };
            let slot = &mut shard.slots[local as usize];
            slot.entry = entry.take();
            let handle = self.encode(shard_idx, local, slot.generation);
            trace!("allocated handle {:#x}", handle.to_raw());
            return Ok(handle);
        }

        // The reservation guarantees a free slot somewhere; only reachable if
        // the geometry was clamped.
        self.live.fetch_sub(1, Ordering::AcqRel);
        Err(Error::HandleTableFull {
            capacity: self.capacity,
        })
    }

    fn with_entry<T>(&self, handle: Handle, f: impl FnOnce(&Entry) -> T) -> Result<T> {
        let (shard, local, generation) = self.decode(handle)?;
        let guard = self.shards[shard].read();
        let slot = guard
            .slots
            .get(local as usize)
            .ok_or(Error::ForeignHandle(handle.to_raw()))?;
        match &slot.entry {
            Some(entry) if slot.generation == generation => Ok(f(entry)),
            _ => Err(Error::StaleHandle(handle.to_raw())),
        }
    }

    fn encode(&self, shard: usize, local: u32, generation: u32) -> Handle {
        let index = ((local as u64) << self.shard_bits) | shard as u64;
        Handle::from_raw(((generation as u64) << GENERATION_SHIFT) | (index + 1))
    }

    fn decode(&self, handle: Handle) -> Result<(usize, u32, u32)> {
        if !handle.is_valid() {
            return Err(Error::InvalidHandle);
        }
        let bits = handle.to_raw();
        let low = bits & LOW_MASK;
        if low == 0 {
            return Err(Error::ForeignHandle(bits));
        }
        let index = low - 1;
        let shard = (index & ((1u64 << self.shard_bits) - 1)) as usize;
        let local = (index >> self.shard_bits) as u32;
        let generation = (bits >> GENERATION_SHIFT) as u32;
        Ok((shard, local, generation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(n: i32) -> HostRef {
        HostRef::new(n)
    }

    #[test]
    fn test_resolve_after_close_fails_even_when_slot_reused() {
        let table = HandleTable::new(8, 1).unwrap();
        let h1 = table.allocate(obj(1)).unwrap();
        table.close(h1).unwrap();
        let h2 = table.allocate(obj(2)).unwrap();
        assert_ne!(h1, h2);
        assert_eq!(h1.to_raw() & LOW_MASK, h2.to_raw() & LOW_MASK);
        assert!(matches!(table.resolve(h1), Err(Error::StaleHandle(_))));
        assert_eq!(table.resolve(h2).unwrap().downcast_ref::<i32>(), Some(&2));
    }

    #[test]
    fn test_double_close_is_rejected() {
        let table = HandleTable::new(8, 2).unwrap();
        let h = table.allocate(obj(1)).unwrap();
        assert_eq!(table.close(h).unwrap(), Closed::Released);
        assert!(table.close(h).unwrap_err().is_handle_error());
        assert_eq!(table.live_count(), 0);
    }

    #[test]
    fn test_null_and_foreign_handles() {
        let table = HandleTable::new(8, 1).unwrap();
        assert!(matches!(table.resolve(Handle::NULL), Err(Error::InvalidHandle)));
        let bogus = Handle::from_raw((1 << 32) | 500);
        assert!(matches!(table.resolve(bogus), Err(Error::ForeignHandle(_))));
    }

    #[test]
    fn test_exhaustion_is_recoverable() {
        let table = HandleTable::new(2, 1).unwrap();
        let a = table.allocate(obj(1)).unwrap();
        let _b = table.allocate(obj(2)).unwrap();
        assert!(table.allocate(obj(3)).unwrap_err().is_exhausted());
        table.close(a).unwrap();
        assert!(table.allocate(obj(3)).is_ok());
    }

    #[test]
    fn test_permanent_handles_survive_close() {
        let table = HandleTable::new(4, 1).unwrap();
        let target = obj(7);
        let h = table.allocate_permanent(target.clone()).unwrap();
        assert_eq!(table.close(h).unwrap(), Closed::Permanent);
        assert_eq!(table.duplicate(h).unwrap(), h);
        assert!(table.resolve(h).unwrap().ptr_eq(&target));
    }

    #[test]
    fn test_duplicate_outlives_original() {
        let table = HandleTable::new(4, 4).unwrap();
        let target = obj(9);
        let weak = target.downgrade();
        let h1 = table.allocate(target).unwrap();
        let h2 = table.duplicate(h1).unwrap();
        assert_eq!(table.live_handles_for(&table.resolve(h1).unwrap()), 2);
        table.close(h1).unwrap();
        assert!(weak.is_retained());
        assert_eq!(table.resolve(h2).unwrap().downcast_ref::<i32>(), Some(&9));
        table.close(h2).unwrap();
        assert!(!weak.is_retained());
    }
}
