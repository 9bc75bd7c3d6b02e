//! Message and FIFO queues
//!
//! A queue is a fixed-capacity array of slots threaded onto two
//! singly-linked index lists (free and used), guarded by two counting
//! semaphores: `push_semaphore` counts free slots and `pop_semaphore`
//! counts used ones. Every successful push consumes from `push_semaphore`
//! and posts `pop_semaphore`; every successful pop the reverse.
//!
//! The interrupt mask is held over the list manipulation only; the
//! semaphore waits happen outside it.
use core::{fmt, marker::PhantomData};

use crate::{
    error::{
        PopQueueError, PopQueueTimeoutError, PushQueueError, PushQueueTimeoutError,
        TryPopQueueError, TryPushQueueError,
    },
    klock, semaphore,
    semaphore::SemaphoreCb,
    state, task,
    time::{TickDuration, TickPoint},
    timeout, Id, KernelTraits, PortThreading, System,
};

pub(crate) type QueueId = Id;

/// The ordering discipline of a queue's used list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDiscipline {
    /// Messages are popped in insertion order.
    Fifo,
    /// Messages are popped in descending priority order, FIFO within one
    /// priority.
    Priority,
}

impl<Traits: KernelTraits> System<Traits> {
    #[inline]
    fn queue_cb(this: QueueId) -> &'static QueueCb<Traits> {
        &Traits::queue_cb_pool()[this.get() - 1]
    }
}

/// Represents a single message/FIFO queue in a system.
pub struct Queue<Traits: KernelTraits> {
    id: QueueId,
    _phantom: PhantomData<Traits>,
}

impl<Traits: KernelTraits> Clone for Queue<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: KernelTraits> Copy for Queue<Traits> {}

impl<Traits: KernelTraits> fmt::Debug for Queue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Queue").field(&self.id).finish()
    }
}

impl<Traits: KernelTraits> Queue<Traits> {
    /// Construct a `Queue` from a raw object ID.
    pub const fn from_id(id: QueueId) -> Self {
        Self {
            id,
            _phantom: PhantomData,
        }
    }

    #[inline]
    fn cb(self) -> &'static QueueCb<Traits> {
        System::<Traits>::queue_cb(self.id)
    }

    /// Get the number of slots in the queue.
    pub fn capacity(self) -> usize {
        self.cb().slots.len()
    }

    /// Push a message, blocking while the queue is full.
    pub fn push(self, priority: u8, value: usize) -> Result<(), PushQueueError> {
        let queue_cb = self.cb();
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        let mut lock = semaphore::wait_one(&queue_cb.push_semaphore, lock)?;
        insert_message(queue_cb, lock.borrow_mut(), priority, value);
        let lock = semaphore::signal_internal(&queue_cb.pop_semaphore, lock);
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Push a message without blocking.
    pub fn try_push(self, priority: u8, value: usize) -> Result<(), TryPushQueueError> {
        let queue_cb = self.cb();
        let lock = klock::lock_cpu::<Traits>()?;

        let mut lock = semaphore::poll_one(&queue_cb.push_semaphore, lock)?;
        insert_message(queue_cb, lock.borrow_mut(), priority, value);
        let lock = semaphore::signal_internal(&queue_cb.pop_semaphore, lock);
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Push a message, giving up at the specified time point.
    pub fn push_until(
        self,
        priority: u8,
        value: usize,
        deadline: TickPoint,
    ) -> Result<(), PushQueueTimeoutError> {
        let queue_cb = self.cb();
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        let mut lock = semaphore::wait_one_timeout(&queue_cb.push_semaphore, lock, deadline)?;
        insert_message(queue_cb, lock.borrow_mut(), priority, value);
        let lock = semaphore::signal_internal(&queue_cb.pop_semaphore, lock);
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Push a message, giving up after the specified duration (rounded up
    /// by one tick).
    pub fn push_for(
        self,
        priority: u8,
        value: usize,
        duration: TickDuration,
    ) -> Result<(), PushQueueTimeoutError> {
        let queue_cb = self.cb();
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        let deadline = timeout::deadline_after::<Traits>(lock.borrow_mut(), duration);

        let mut lock = semaphore::wait_one_timeout(&queue_cb.push_semaphore, lock, deadline)?;
        insert_message(queue_cb, lock.borrow_mut(), priority, value);
        let lock = semaphore::signal_internal(&queue_cb.pop_semaphore, lock);
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Pop the frontmost message per the queue discipline, blocking while
    /// the queue is empty. Returns `(priority, value)`.
    pub fn pop(self) -> Result<(u8, usize), PopQueueError> {
        let queue_cb = self.cb();
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        let mut lock = semaphore::wait_one(&queue_cb.pop_semaphore, lock)?;
        let message = remove_message(queue_cb, lock.borrow_mut());
        let lock = semaphore::signal_internal(&queue_cb.push_semaphore, lock);
        task::unlock_cpu_and_check_preemption(lock);
        Ok(message)
    }

    /// Pop a message without blocking.
    pub fn try_pop(self) -> Result<(u8, usize), TryPopQueueError> {
        let queue_cb = self.cb();
        let lock = klock::lock_cpu::<Traits>()?;

        let mut lock = semaphore::poll_one(&queue_cb.pop_semaphore, lock)?;
        let message = remove_message(queue_cb, lock.borrow_mut());
        let lock = semaphore::signal_internal(&queue_cb.push_semaphore, lock);
        task::unlock_cpu_and_check_preemption(lock);
        Ok(message)
    }

    /// Pop a message, giving up at the specified time point.
    pub fn pop_until(self, deadline: TickPoint) -> Result<(u8, usize), PopQueueTimeoutError> {
        let queue_cb = self.cb();
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        let mut lock = semaphore::wait_one_timeout(&queue_cb.pop_semaphore, lock, deadline)?;
        let message = remove_message(queue_cb, lock.borrow_mut());
        let lock = semaphore::signal_internal(&queue_cb.push_semaphore, lock);
        task::unlock_cpu_and_check_preemption(lock);
        Ok(message)
    }

    /// Pop a message, giving up after the specified duration (rounded up by
    /// one tick).
    pub fn pop_for(self, duration: TickDuration) -> Result<(u8, usize), PopQueueTimeoutError> {
        let queue_cb = self.cb();
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        let deadline = timeout::deadline_after::<Traits>(lock.borrow_mut(), duration);

        let mut lock = semaphore::wait_one_timeout(&queue_cb.pop_semaphore, lock, deadline)?;
        let message = remove_message(queue_cb, lock.borrow_mut());
        let lock = semaphore::signal_internal(&queue_cb.push_semaphore, lock);
        task::unlock_cpu_and_check_preemption(lock);
        Ok(message)
    }
}

/// A single message slot of a [`QueueCb`].
pub struct QueueSlotCb<Traits: PortThreading> {
    /// The next slot in whichever index list this slot is currently on.
    next: klock::CpuLockCell<Traits, Option<usize>>,
    priority: klock::CpuLockCell<Traits, u8>,
    value: klock::CpuLockCell<Traits, usize>,
}

impl<Traits: PortThreading> QueueSlotCb<Traits> {
    pub const fn new() -> Self {
        Self {
            next: klock::CpuLockCell::new(None),
            priority: klock::CpuLockCell::new(0),
            value: klock::CpuLockCell::new(0),
        }
    }
}

/// *Queue control block* - the state data of a message/FIFO queue.
pub struct QueueCb<Traits: PortThreading> {
    pub(crate) slots: &'static [QueueSlotCb<Traits>],

    pub(crate) discipline: QueueDiscipline,

    /// Head of the list of unoccupied slots.
    free_head: klock::CpuLockCell<Traits, Option<usize>>,

    /// Head and tail of the list of occupied slots, ordered per
    /// `discipline`.
    used_head: klock::CpuLockCell<Traits, Option<usize>>,
    used_tail: klock::CpuLockCell<Traits, Option<usize>>,

    /// Counts occupied slots. Initial value 0.
    pub(crate) pop_semaphore: SemaphoreCb<Traits>,

    /// Counts free slots. Initial value = capacity.
    pub(crate) push_semaphore: SemaphoreCb<Traits>,
}

impl<Traits: PortThreading> QueueCb<Traits> {
    /// Construct a `QueueCb`. Used by the configuration macro.
    ///
    /// The free list is threaded through the slots by
    /// [`init_queue`](crate::queue::init_queue) during boot.
    pub const fn new(slots: &'static [QueueSlotCb<Traits>], discipline: QueueDiscipline) -> Self {
        Self {
            slots,
            discipline,
            free_head: klock::CpuLockCell::new(None),
            used_head: klock::CpuLockCell::new(None),
            used_tail: klock::CpuLockCell::new(None),
            pop_semaphore: SemaphoreCb::new(0, slots.len()),
            push_semaphore: SemaphoreCb::new(slots.len(), slots.len()),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for QueueCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("QueueCb")
            .field("self", &(self as *const _))
            .field("capacity", &self.slots.len())
            .field("discipline", &self.discipline)
            .finish()
    }
}

/// Thread the free list through the slot array at boot time.
pub(crate) fn init_queue<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    queue_cb: &'static QueueCb<Traits>,
) {
    let mut next = None;
    for (i, slot) in queue_cb.slots.iter().enumerate().rev() {
        slot.next.replace(&mut *lock, next);
        next = Some(i);
    }
    queue_cb.free_head.replace(&mut *lock, next);
}

/// Take a slot from the free list and insert it into the used list per the
/// queue discipline. The caller must have consumed one `push_semaphore`
/// permit, which guarantees a free slot exists.
fn insert_message<Traits: KernelTraits>(
    queue_cb: &'static QueueCb<Traits>,
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    priority: u8,
    value: usize,
) {
    let slots = queue_cb.slots;

    // Take a slot from the free list
    let slot_index = queue_cb.free_head.get(&*lock).unwrap();
    let next_free = slots[slot_index].next.get(&*lock);
    queue_cb.free_head.replace(&mut *lock, next_free);

    slots[slot_index].priority.replace(&mut *lock, priority);
    slots[slot_index].value.replace(&mut *lock, value);
    slots[slot_index].next.replace(&mut *lock, None);

    // Find the slot after which the message is inserted: the tail for the
    // FIFO discipline, the last slot with the same or higher priority for
    // the priority discipline.
    let insert_after = match queue_cb.discipline {
        QueueDiscipline::Fifo => queue_cb.used_tail.get(&*lock),
        QueueDiscipline::Priority => {
            let mut prev = None;
            let mut cursor = queue_cb.used_head.get(&*lock);
            while let Some(i) = cursor {
                if slots[i].priority.get(&*lock) < priority {
                    break;
                }
                prev = Some(i);
                cursor = slots[i].next.get(&*lock);
            }
            prev
        }
    };

    match insert_after {
        Some(prev) => {
            let next = slots[prev].next.get(&*lock);
            slots[slot_index].next.replace(&mut *lock, next);
            slots[prev].next.replace(&mut *lock, Some(slot_index));
            if next.is_none() {
                queue_cb.used_tail.replace(&mut *lock, Some(slot_index));
            }
        }
        None => {
            let old_head = queue_cb.used_head.replace(&mut *lock, Some(slot_index));
            slots[slot_index].next.replace(&mut *lock, old_head);
            if old_head.is_none() {
                queue_cb.used_tail.replace(&mut *lock, Some(slot_index));
            }
        }
    }
}

/// Remove the frontmost message from the used list and return the slot to
/// the free list. The caller must have consumed one `pop_semaphore` permit,
/// which guarantees a message exists.
fn remove_message<Traits: KernelTraits>(
    queue_cb: &'static QueueCb<Traits>,
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) -> (u8, usize) {
    let slots = queue_cb.slots;

    let slot_index = queue_cb.used_head.get(&*lock).unwrap();
    let next = slots[slot_index].next.get(&*lock);
    queue_cb.used_head.replace(&mut *lock, next);
    if next.is_none() {
        queue_cb.used_tail.replace(&mut *lock, None);
    }

    let message = (
        slots[slot_index].priority.get(&*lock),
        slots[slot_index].value.get(&*lock),
    );

    // Return the slot to the free list
    let free_head = queue_cb.free_head.replace(&mut *lock, Some(slot_index));
    slots[slot_index].next.replace(&mut *lock, free_head);

    message
}
