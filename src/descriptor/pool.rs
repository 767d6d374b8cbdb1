use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::MutexGuard;
use tracing::{debug, trace};
use crate::error::{ErrorCode, Pt2PtResult};

/// Reference to a pooled descriptor that stays valid only as long as the descriptor is not
///  released: every release bumps the slot's generation, turning outstanding handles (including
///  tokens echoed back by a peer in acknowledgements) into stale ones.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct DescriptorHandle {
    index: u32,
    generation: u32,
}

impl Debug for DescriptorHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

impl DescriptorHandle {
    /// representation for sending the handle across the wire
    pub fn to_token(&self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    pub fn from_token(token: u64) -> DescriptorHandle {
        DescriptorHandle {
            index: token as u32,
            generation: (token >> 32) as u32,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OwnershipState {
    Free,
    /// handed out by the pool, the owner is still building the descriptor
    Reserved,
    /// live: referenced by a request and / or a queue
    Attached,
    /// the application released the request, but the descriptor is still in flight and will be
    ///  released by whoever completes it
    PendingFree,
}

pub struct Slot<T> {
    index: u32,
    generation: u32,
    state: OwnershipState,
    pub desc: T,
}

impl<T> Slot<T> {
    pub fn handle(&self) -> DescriptorHandle {
        DescriptorHandle {
            index: self.index,
            generation: self.generation,
        }
    }

    pub fn state(&self) -> OwnershipState {
        self.state
    }
}

pub type SlotGuard<'a, T> = MutexGuard<'a, Slot<T>>;

/// Fixed-capacity arena of descriptors. Acquiring never blocks: an exhausted pool is signalled
///  by an error code.
///
/// Each slot's mutex doubles as the per-descriptor lock. The free list has a lock of its own
///  which is never held while waiting for a slot.
pub struct DescriptorPool<T> {
    name: &'static str,
    slots: Vec<tokio::sync::Mutex<Slot<T>>>,
    free_list: Mutex<Vec<u32>>,
    num_pending_free: AtomicUsize,
}

impl<T: Default> DescriptorPool<T> {
    pub fn new(name: &'static str, capacity: usize) -> DescriptorPool<T> {
        let capacity: u32 = capacity.try_into()
            .unwrap_or(u32::MAX);

        let slots = (0..capacity)
            .map(|index| tokio::sync::Mutex::new(Slot {
                index,
                generation: 0,
                state: OwnershipState::Free,
                desc: T::default(),
            }))
            .collect();

        DescriptorPool {
            name,
            slots,
            // popped from the back, so lower indices are handed out first
            free_list: Mutex::new((0..capacity).rev().collect()),
            num_pending_free: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn num_free(&self) -> usize {
        self.free_list.lock().unwrap().len()
    }

    /// Takes a descriptor out of the pool, returning it locked and in `Reserved` state.
    pub async fn acquire(&self) -> Pt2PtResult<SlotGuard<'_, T>> {
        let (index, ready) = {
            let mut free_list = self.free_list.lock().unwrap();
            // a releaser pushes the index while it still holds the slot, so skip slots that are
            //  locked right now
            let ready = (0..free_list.len()).rev()
                .find_map(|pos| self.slots[free_list[pos] as usize].try_lock().ok().map(|slot| (pos, slot)));
            match ready {
                Some((pos, slot)) => (Some(free_list.remove(pos)), Some(slot)),
                None => (free_list.pop(), None),
            }
        };

        let Some(index) = index else {
            return if self.num_pending_free.load(Ordering::Acquire) > 0 {
                debug!("{} pool exhausted, waiting for released descriptors to drain", self.name);
                Err(ErrorCode::TempOutOfResource)
            }
            else {
                debug!("{} pool exhausted", self.name);
                Err(ErrorCode::OutOfResource)
            };
        };

        let mut slot = match ready {
            Some(slot) => slot,
            None => self.slots[index as usize].lock().await,
        };
        debug_assert_eq!(slot.state, OwnershipState::Free);
        slot.state = OwnershipState::Reserved;
        trace!("acquired {} descriptor {:?}", self.name, slot.handle());
        Ok(slot)
    }

    /// Locks the descriptor behind a handle, failing for stale handles
    pub async fn lock(&self, handle: DescriptorHandle) -> Pt2PtResult<SlotGuard<'_, T>> {
        let Some(slot) = self.slots.get(handle.index as usize) else {
            return Err(ErrorCode::BadParam);
        };

        let slot = slot.lock().await;
        if slot.generation != handle.generation || slot.state == OwnershipState::Free {
            trace!("stale {} handle {:?}", self.name, handle);
            return Err(ErrorCode::BadParam);
        }
        Ok(slot)
    }

    pub fn attach(&self, slot: &mut Slot<T>) {
        debug_assert_eq!(slot.state, OwnershipState::Reserved);
        slot.state = OwnershipState::Attached;
    }

    pub fn mark_pending_free(&self, slot: &mut Slot<T>) {
        if slot.state != OwnershipState::PendingFree {
            slot.state = OwnershipState::PendingFree;
            self.num_pending_free.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Returns a descriptor to the pool. Its handle and all copies of it become stale.
    pub fn release(&self, slot: &mut Slot<T>) {
        match slot.state {
            OwnershipState::Free => {
                debug!("{} descriptor {:?} released twice - ignoring", self.name, slot.handle());
                return;
            }
            OwnershipState::PendingFree => {
                self.num_pending_free.fetch_sub(1, Ordering::AcqRel);
            }
            OwnershipState::Reserved | OwnershipState::Attached => {}
        }

        trace!("releasing {} descriptor {:?}", self.name, slot.handle());
        slot.state = OwnershipState::Free;
        slot.generation = slot.generation.wrapping_add(1);
        slot.desc = T::default();
        self.free_list.lock().unwrap().push(slot.index);
    }
}
