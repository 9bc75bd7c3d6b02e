//! Semaphores
use core::{fmt, marker::PhantomData};

use crate::{
    error::{
        GetSemaphoreError, PollSemaphoreError, SignalSemaphoreError, WaitSemaphoreError,
        WaitSemaphoreTimeoutError,
    },
    klock, state, task,
    time::{TickDuration, TickPoint},
    timeout,
    wait::{QueueOrder, WaitPayload, WaitQueue},
    Id, KernelTraits, PortThreading, System,
};

pub(crate) type SemaphoreId = Id;

/// Unsigned integer type representing the number of permits held by a
/// semaphore.
pub type SemaphoreValue = usize;

impl<Traits: KernelTraits> System<Traits> {
    #[inline]
    fn semaphore_cb(this: SemaphoreId) -> &'static SemaphoreCb<Traits> {
        &Traits::semaphore_cb_pool()[this.get() - 1]
    }
}

/// Represents a single semaphore in a system.
pub struct Semaphore<Traits: KernelTraits> {
    id: SemaphoreId,
    _phantom: PhantomData<Traits>,
}

impl<Traits: KernelTraits> Clone for Semaphore<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: KernelTraits> Copy for Semaphore<Traits> {}

impl<Traits: KernelTraits> fmt::Debug for Semaphore<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Semaphore").field(&self.id).finish()
    }
}

impl<Traits: KernelTraits> Semaphore<Traits> {
    /// Construct a `Semaphore` from a raw object ID.
    pub const fn from_id(id: SemaphoreId) -> Self {
        Self {
            id,
            _phantom: PhantomData,
        }
    }

    #[inline]
    fn cb(self) -> &'static SemaphoreCb<Traits> {
        System::<Traits>::semaphore_cb(self.id)
    }

    /// Release a permit: wake the highest-priority waiter, or increment the
    /// value.
    pub fn post(self) -> Result<(), SignalSemaphoreError> {
        let lock = klock::lock_cpu::<Traits>()?;
        signal(self.cb(), lock)
    }

    /// Acquire a permit, blocking until one becomes available.
    pub fn wait(self) -> Result<(), WaitSemaphoreError> {
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        wait_one(self.cb(), lock).map(drop)
    }

    /// Acquire a permit without blocking.
    pub fn try_wait(self) -> Result<(), PollSemaphoreError> {
        let lock = klock::lock_cpu::<Traits>()?;
        poll_one(self.cb(), lock).map(drop)
    }

    /// Acquire a permit, giving up at the specified time point.
    pub fn wait_until(self, deadline: TickPoint) -> Result<(), WaitSemaphoreTimeoutError> {
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        wait_one_timeout(self.cb(), lock, deadline).map(drop)
    }

    /// Acquire a permit, giving up after the specified duration (rounded up
    /// by one tick).
    pub fn wait_for(self, duration: TickDuration) -> Result<(), WaitSemaphoreTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        let deadline = timeout::deadline_after::<Traits>(lock.borrow_mut(), duration);
        wait_one_timeout(self.cb(), lock, deadline).map(drop)
    }

    /// Get the current value of the semaphore.
    pub fn value(self) -> Result<SemaphoreValue, GetSemaphoreError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.cb().value.get(&*lock))
    }
}

/// *Semaphore control block* - the state data of a semaphore.
pub struct SemaphoreCb<Traits: PortThreading> {
    pub(crate) value: klock::CpuLockCell<Traits, SemaphoreValue>,
    pub(crate) max_value: SemaphoreValue,

    pub(crate) wait_queue: WaitQueue<Traits>,
}

impl<Traits: PortThreading> SemaphoreCb<Traits> {
    /// Construct a `SemaphoreCb`. Used by the configuration macro.
    ///
    /// Use [`SemaphoreValue::MAX`] as `max_value` for an effectively
    /// unbounded semaphore.
    pub const fn new(initial: SemaphoreValue, max_value: SemaphoreValue) -> Self {
        Self {
            value: klock::CpuLockCell::new(initial),
            max_value,
            wait_queue: WaitQueue::new(QueueOrder::TaskPriority),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for SemaphoreCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SemaphoreCb")
            .field("self", &(self as *const _))
            .field("value", &self.value)
            .field("max_value", &self.max_value)
            .field("wait_queue", &self.wait_queue)
            .finish()
    }
}

/// Check if the current state of a semaphore, `value`, satisfies the wait
/// condition.
///
/// If `value` satisfies the wait condition, this function updates `value`
/// and returns `true`. Otherwise, it returns `false`.
#[inline]
fn poll_core(value: &mut SemaphoreValue) -> bool {
    if *value > 0 {
        *value -= 1;
        true
    } else {
        false
    }
}

/// Acquire one permit without blocking. Returns the still-held CPU Lock
/// guard on success so that compound primitives (the message queue) can
/// continue atomically.
#[inline]
pub(crate) fn poll_one<Traits: KernelTraits>(
    semaphore_cb: &'static SemaphoreCb<Traits>,
    mut lock: klock::CpuLockGuard<Traits>,
) -> Result<klock::CpuLockGuard<Traits>, PollSemaphoreError> {
    if poll_core(semaphore_cb.value.write(&mut *lock)) {
        Ok(lock)
    } else {
        Err(PollSemaphoreError::Busy)
    }
}

/// Acquire one permit, blocking as needed. Returns the still-held CPU Lock
/// guard on success so that compound primitives (the message queue) can
/// continue atomically.
#[inline]
pub(crate) fn wait_one<Traits: KernelTraits>(
    semaphore_cb: &'static SemaphoreCb<Traits>,
    mut lock: klock::CpuLockGuard<Traits>,
) -> Result<klock::CpuLockGuard<Traits>, WaitSemaphoreError> {
    if poll_core(semaphore_cb.value.write(&mut *lock)) {
        Ok(lock)
    } else {
        // The current state does not satisfy the wait condition. In this
        // case, start waiting. The wake-upper is responsible for using
        // `poll_core` to complete the effect of the wait operation.
        semaphore_cb
            .wait_queue
            .wait(lock.borrow_mut(), WaitPayload::Semaphore)?;

        Ok(lock)
    }
}

/// [`wait_one`] with a deadline.
#[inline]
pub(crate) fn wait_one_timeout<Traits: KernelTraits>(
    semaphore_cb: &'static SemaphoreCb<Traits>,
    mut lock: klock::CpuLockGuard<Traits>,
    deadline: TickPoint,
) -> Result<klock::CpuLockGuard<Traits>, WaitSemaphoreTimeoutError> {
    if poll_core(semaphore_cb.value.write(&mut *lock)) {
        Ok(lock)
    } else {
        semaphore_cb
            .wait_queue
            .wait_timeout(lock.borrow_mut(), WaitPayload::Semaphore, deadline)?;

        Ok(lock)
    }
}

/// Release one permit. If a task is waiting, it's woken up and the value is
/// left unchanged: the permit is handed over directly.
#[inline]
fn signal<Traits: KernelTraits>(
    semaphore_cb: &'static SemaphoreCb<Traits>,
    mut lock: klock::CpuLockGuard<Traits>,
) -> Result<(), SignalSemaphoreError> {
    if semaphore_cb.wait_queue.wake_up_one(lock.borrow_mut()) {
        // We just woke up a task; give the permit to that task
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    } else {
        let value = semaphore_cb.value.get(&*lock);
        if value >= semaphore_cb.max_value {
            return Err(SignalSemaphoreError::Overflow);
        }
        semaphore_cb.value.replace(&mut *lock, value + 1);
        Ok(())
    }
}

/// [`signal`] for the message queue's internal semaphores, which are sized
/// so that a post can never overflow. Returns the still-held CPU Lock
/// guard.
#[inline]
pub(crate) fn signal_internal<Traits: KernelTraits>(
    semaphore_cb: &'static SemaphoreCb<Traits>,
    mut lock: klock::CpuLockGuard<Traits>,
) -> klock::CpuLockGuard<Traits> {
    if !semaphore_cb.wait_queue.wake_up_one(lock.borrow_mut()) {
        let value = semaphore_cb.value.get(&*lock);
        debug_assert!(value < semaphore_cb.max_value);
        semaphore_cb.value.replace(&mut *lock, value + 1);
    }
    lock
}
