use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// RAII guard for one execution slot.
///
/// Hold it for the whole lifetime of a task execution; dropping it returns
/// the slot to the pool, including on panic.
pub struct SlotPermit {
    #[allow(dead_code)]
    permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for SlotPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPermit").finish()
    }
}

/// Fixed-size pool of execution slots.
///
/// The scheduler takes a slot with [`Self::try_acquire`] *before* claiming a
/// task, so a claimed task always has somewhere to run.  Acquisition never
/// waits.
#[derive(Debug, Clone)]
pub struct SlotPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl SlotPool {
    /// A pool of `capacity` slots.  Zero is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Take a free slot, or `None` if all are in use.
    pub fn try_acquire(&self) -> Option<SlotPermit> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| SlotPermit { permit })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permits_are_bounded_and_released_on_drop() {
        let pool = SlotPool::new(2);

        let p1 = pool.try_acquire().expect("first slot");
        let p2 = pool.try_acquire().expect("second slot");
        assert!(pool.try_acquire().is_none(), "third slot should be denied");
        assert_eq!(pool.in_use(), 2);

        drop(p1);
        let _p3 = pool.try_acquire().expect("slot after release");
        drop(p2);
        assert_eq!(pool.in_use(), 1);
    }

    #[test]
    fn zero_capacity_means_one() {
        let pool = SlotPool::new(0);
        assert_eq!(pool.capacity(), 1);
        assert!(pool.try_acquire().is_some());
    }
}
