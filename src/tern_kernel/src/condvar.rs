//! Condition variables
use core::{fmt, marker::PhantomData};

use crate::{
    error::{
        NotifyConditionVariableError, WaitConditionVariableError,
        WaitConditionVariableTimeoutError,
    },
    klock, mutex, state, task,
    time::{TickDuration, TickPoint},
    timeout,
    wait::{QueueOrder, WaitPayload, WaitQueue},
    Id, KernelTraits, PortThreading, System,
};

pub(crate) type ConditionVariableId = Id;

impl<Traits: KernelTraits> System<Traits> {
    #[inline]
    fn condvar_cb(this: ConditionVariableId) -> &'static ConditionVariableCb<Traits> {
        &Traits::condvar_cb_pool()[this.get() - 1]
    }
}

/// Represents a single condition variable in a system.
pub struct ConditionVariable<Traits: KernelTraits> {
    id: ConditionVariableId,
    _phantom: PhantomData<Traits>,
}

impl<Traits: KernelTraits> Clone for ConditionVariable<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: KernelTraits> Copy for ConditionVariable<Traits> {}

impl<Traits: KernelTraits> fmt::Debug for ConditionVariable<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("ConditionVariable").field(&self.id).finish()
    }
}

impl<Traits: KernelTraits> ConditionVariable<Traits> {
    /// Construct a `ConditionVariable` from a raw object ID.
    pub const fn from_id(id: ConditionVariableId) -> Self {
        Self {
            id,
            _phantom: PhantomData,
        }
    }

    #[inline]
    fn cb(self) -> &'static ConditionVariableCb<Traits> {
        System::<Traits>::condvar_cb(self.id)
    }

    /// Atomically release `mutex` and block on the condition variable.
    /// The mutex is reacquired before this method returns, whatever the
    /// outcome of the wait.
    ///
    /// The calling task must own `mutex`.
    pub fn wait(self, mutex: mutex::Mutex<Traits>) -> Result<(), WaitConditionVariableError> {
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        wait_condvar(self.cb(), mutex.cb(), lock, None).map_err(|e| match e {
            WaitConditionVariableTimeoutError::BadContext => WaitConditionVariableError::BadContext,
            WaitConditionVariableTimeoutError::NotOwner => WaitConditionVariableError::NotOwner,
            WaitConditionVariableTimeoutError::BadParam => WaitConditionVariableError::BadParam,
            WaitConditionVariableTimeoutError::Interrupted => {
                WaitConditionVariableError::Interrupted
            }
            WaitConditionVariableTimeoutError::Timeout => {
                unreachable!("got timeout result for a non-timeout wait")
            }
        })
    }

    /// [`Self::wait`] with a deadline. The `Timeout` outcome is reported
    /// only after the mutex has been reacquired.
    pub fn wait_until(
        self,
        mutex: mutex::Mutex<Traits>,
        deadline: TickPoint,
    ) -> Result<(), WaitConditionVariableTimeoutError> {
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        wait_condvar(self.cb(), mutex.cb(), lock, Some(deadline))
    }

    /// [`Self::wait`] with a timeout relative to now (rounded up by one
    /// tick).
    pub fn wait_for(
        self,
        mutex: mutex::Mutex<Traits>,
        duration: TickDuration,
    ) -> Result<(), WaitConditionVariableTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        let deadline = timeout::deadline_after::<Traits>(lock.borrow_mut(), duration);
        wait_condvar(self.cb(), mutex.cb(), lock, Some(deadline))
    }

    /// Wake up the longest-waiting task of the highest priority, if any.
    /// The condition variable never touches the associated mutex; the woken
    /// task reacquires it on its own.
    pub fn notify_one(self) -> Result<(), NotifyConditionVariableError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.cb().wait_queue.wake_up_one(lock.borrow_mut());
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Wake up all waiting tasks.
    pub fn notify_all(self) -> Result<(), NotifyConditionVariableError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.cb().wait_queue.wake_up_all(lock.borrow_mut());
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }
}

/// *Condition variable control block* - the state data of a condition
/// variable.
pub struct ConditionVariableCb<Traits: PortThreading> {
    pub(crate) wait_queue: WaitQueue<Traits>,
}

impl<Traits: PortThreading> ConditionVariableCb<Traits> {
    /// Construct a `ConditionVariableCb`. Used by the configuration macro.
    pub const fn new() -> Self {
        Self {
            wait_queue: WaitQueue::new(QueueOrder::TaskPriority),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for ConditionVariableCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConditionVariableCb")
            .field("self", &(self as *const _))
            .finish()
    }
}

/// The core portion of the wait operations.
///
/// The mutex release and the insertion into the condition variable's wait
/// queue happen under one continuous critical section, which is what makes
/// the release-and-block step atomic with respect to notifiers.
fn wait_condvar<Traits: KernelTraits>(
    condvar_cb: &'static ConditionVariableCb<Traits>,
    mutex_cb: &'static mutex::MutexCb<Traits>,
    mut lock: klock::CpuLockGuard<Traits>,
    deadline: Option<TickPoint>,
) -> Result<(), WaitConditionVariableTimeoutError> {
    let running_task = Traits::state().running_task(lock.borrow_mut()).unwrap();

    let owner = mutex_cb.owning_task.get(&*lock);
    if owner.map(|t| t as *const _) != Some(running_task as *const _) {
        return Err(WaitConditionVariableTimeoutError::NotOwner);
    }

    if mutex_cb.recursion_count.get(&*lock) > 1 {
        // A recursively-locked mutex can't be fully released here
        return Err(WaitConditionVariableTimeoutError::BadParam);
    }

    mutex::release_for_condvar(lock.borrow_mut(), mutex_cb, running_task);

    let result = if let Some(deadline) = deadline {
        condvar_cb
            .wait_queue
            .wait_timeout(lock.borrow_mut(), WaitPayload::ConditionVariable, deadline)
    } else {
        condvar_cb
            .wait_queue
            .wait(lock.borrow_mut(), WaitPayload::ConditionVariable)
            .map_err(crate::error::WaitTimeoutError::from)
    };

    // Reacquire the mutex unconditionally, even when the wait timed out or
    // was interrupted.
    mutex::reacquire_for_condvar(lock.borrow_mut(), mutex_cb, running_task);

    drop(lock);

    result.map_err(Into::into)
}
