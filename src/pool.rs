use crate::error::{ProxyError, ProxyResult};

/// A slot is either live or threaded onto the free-list, never both.
enum Slot<T> {
    Vacant { next: Option<usize> },
    Occupied(T),
}

/// Fixed-capacity object pool.
///
/// A contiguous slab of slots with a free-list threaded through the vacant
/// ones. Allocation and release are O(1); the backing store never grows.
/// Objects are addressed by slot index, so a session can carry its own index
/// and release itself on teardown.
///
/// Each pool instance is owned by one worker; there is no cross-thread
/// sharing.
pub struct Pool<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<usize>,
    free: usize,
}

impl<T> Pool<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for i in 0..capacity {
            let next = if i + 1 < capacity { Some(i + 1) } else { None };
            slots.push(Slot::Vacant { next });
        }
        Self {
            slots,
            free_head: if capacity > 0 { Some(0) } else { None },
            free: capacity,
        }
    }

    /// Place `value` into a free slot and return its index, or
    /// `PoolExhausted` when the free-list is empty.
    pub fn alloc(&mut self, value: T) -> ProxyResult<usize> {
        let idx = self.free_head.ok_or(ProxyError::PoolExhausted)?;
        let slot = std::mem::replace(&mut self.slots[idx], Slot::Occupied(value));
        match slot {
            Slot::Vacant { next } => self.free_head = next,
            Slot::Occupied(_) => unreachable!("free-list pointed at an occupied slot"),
        }
        self.free -= 1;
        Ok(idx)
    }

    /// Return the slot to the free-list, yielding the object it held.
    ///
    /// Releasing a vacant slot is a logic error and panics.
    pub fn release(&mut self, idx: usize) -> T {
        let slot = std::mem::replace(
            &mut self.slots[idx],
            Slot::Vacant {
                next: self.free_head,
            },
        );
        match slot {
            Slot::Occupied(value) => {
                self.free_head = Some(idx);
                self.free += 1;
                value
            }
            Slot::Vacant { .. } => panic!("release of vacant pool slot {idx}"),
        }
    }

    pub fn get(&self, idx: usize) -> Option<&T> {
        match self.slots.get(idx) {
            Some(Slot::Occupied(value)) => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut T> {
        match self.slots.get_mut(idx) {
            Some(Slot::Occupied(value)) => Some(value),
            _ => None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_count(&self) -> usize {
        self.free
    }

    pub fn is_exhausted(&self) -> bool {
        self.free == 0
    }
}
