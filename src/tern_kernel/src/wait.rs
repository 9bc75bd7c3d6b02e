//! Wait queues and the one blocking mechanism every primitive is built on.
//!
//! A blocking operation constructs a [`Wait`] object *on the blocked task's
//! own stack*, inserts it into the primitive's [`WaitQueue`], and yields the
//! processor. Whoever wakes the task reports a [`WakeReason`], which the
//! primitive maps to its own result codes.
use core::{fmt, ops, ptr::NonNull};

use crate::{
    error::{expect_not_timeout, BadParamError, WaitError, WaitTimeoutError},
    klock::{CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    mutex, task,
    task::{TaskCb, TaskSt},
    time::TickPoint,
    timeout,
    utils::{
        intrusive_list::{self, ListAccessorCell, UnsafeStatic},
        Init,
    },
    KernelTraits, PortThreading,
};

// Type definitions and trait implementations for wait queues
// ---------------------------------------------------------------------------

/// The reason a blocked task was made runnable again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// The wait condition was satisfied or the wait was released normally
    /// (e.g., a semaphore was posted, a mutex was handed over).
    Unblocked,
    /// The timeout associated with the wait operation expired.
    Timeout,
    /// The wait was aborted by a delivered signal or by `Task::interrupt`.
    Signal,
}

impl Init for WakeReason {
    const INIT: Self = Self::Unblocked;
}

/// A reference to a [`Wait`].
struct WaitRef<Traits: PortThreading>(NonNull<Wait<Traits>>);

// Safety: `Wait` is `Send + Sync`
unsafe impl<Traits: PortThreading> Send for WaitRef<Traits> {}
unsafe impl<Traits: PortThreading> Sync for WaitRef<Traits> {}

impl<Traits: PortThreading> Clone for WaitRef<Traits> {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

impl<Traits: PortThreading> Copy for WaitRef<Traits> {}

impl<Traits: PortThreading> fmt::Debug for WaitRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("WaitRef").field(&self.0).finish()
    }
}

impl<Traits: PortThreading> PartialEq for WaitRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<Traits: PortThreading> Eq for WaitRef<Traits> {}

impl<Traits: PortThreading> ops::Index<WaitRef<Traits>> for UnsafeStatic {
    type Output = Wait<Traits>;

    #[inline]
    fn index(&self, index: WaitRef<Traits>) -> &Self::Output {
        // Safety: See `wait_queue_accessor`.
        unsafe { &*index.0.as_ptr() }
    }
}

/// Get a `ListAccessorCell` used to access a wait queue.
macro_rules! wait_queue_accessor {
    ($list:expr, $key:expr) => {
        ListAccessorCell::new(
            $list,
            // Safety: All elements are extant because we never drop a
            //     `Wait` while it's still in a wait queue.
            unsafe { UnsafeStatic::new() },
            |wait: &Wait<_>| &wait.link,
            $key,
        )
    };
}

// ---------------------------------------------------------------------------

/// *A wait object* describing *which task* is waiting on *what condition*.
///
/// # Lifetime
///
/// This object is constructed by `WaitQueue::wait` on a waiting task's
/// stack, and only survives until the method returns. This means that `Wait`
/// can expire only when the waiting task is not waiting anymore.
pub(crate) struct Wait<Traits: PortThreading> {
    /// The task that is waiting for something.
    task: &'static TaskCb<Traits>,

    /// Forms a linked list headed by `wait_queue.waits`.
    link: CpuLockCell<Traits, Option<intrusive_list::Link<WaitRef<Traits>>>>,

    /// The containing [`WaitQueue`].
    wait_queue: Option<&'static WaitQueue<Traits>>,

    payload: WaitPayload<Traits>,
}

/// Additional information included in a [`Wait`], specific to waitable
/// object types.
pub(crate) enum WaitPayload<Traits: PortThreading> {
    Semaphore,
    Mutex(&'static mutex::MutexCb<Traits>),
    ConditionVariable,
    Join,
    Sleep,
    Signal(crate::signal::SignalSet),
}

impl<Traits: PortThreading> Clone for WaitPayload<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: PortThreading> Copy for WaitPayload<Traits> {}

impl<Traits: PortThreading> WaitPayload<Traits> {
    /// Get a flag indicating whether a generated signal aborts this wait
    /// with [`WakeReason::Signal`].
    ///
    /// Mutex and condition-variable waits are not signal-interruptible;
    /// their callers have no reasonable way to roll back halfway.
    pub(crate) fn is_interruptible_by_signal(&self) -> bool {
        match self {
            Self::Semaphore | Self::Join | Self::Sleep => true,
            Self::Mutex(_) | Self::ConditionVariable | Self::Signal(_) => false,
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for WaitPayload<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Semaphore => f.write_str("Semaphore"),
            Self::Mutex(mutex) => write!(f, "Mutex({:p})", *mutex),
            Self::ConditionVariable => f.write_str("ConditionVariable"),
            Self::Join => f.write_str("Join"),
            Self::Sleep => f.write_str("Sleep"),
            Self::Signal(set) => f.debug_tuple("Signal").field(set).finish(),
        }
    }
}

/// A queue of wait objects ([`Wait`]) waiting on a particular waitable
/// object.
pub(crate) struct WaitQueue<Traits: PortThreading> {
    /// Wait objects waiting on the waitable object associated with this
    /// instance of `WaitQueue`. The waiting tasks (`Wait::task`) must be in
    /// the Waiting state.
    ///
    /// All elements of this linked list must be valid.
    waits: CpuLockCell<Traits, intrusive_list::ListHead<WaitRef<Traits>>>,

    order: QueueOrder,
}

impl<Traits: PortThreading> Init for WaitQueue<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        waits: Init::INIT,
        order: QueueOrder::TaskPriority,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueOrder {
    /// The wait queue is processed in a FIFO order.
    Fifo,
    /// The wait queue is processed in a task priority order. Tasks with the
    /// same priorities follow a FIFO order.
    TaskPriority,
}

/// The wait state of a task.
pub(crate) struct TaskWait<Traits: PortThreading> {
    /// The wait object describing the ongoing Waiting state of the task.
    /// Should be `None` iff the task is not in the Waiting state.
    ///
    /// The pointee must be valid.
    current_wait: CpuLockCell<Traits, Option<WaitRef<Traits>>>,

    /// Why the last wait operation ended. Set by a wake-upper.
    wake_reason: CpuLockCell<Traits, WakeReason>,
}

impl<Traits: PortThreading> Init for TaskWait<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        current_wait: Init::INIT,
        wake_reason: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for TaskWait<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskWait")
            .field("wake_reason", &self.wake_reason)
            .finish()
    }
}

/// Register a timeout object to wake `$task_cb` with [`WakeReason::Timeout`]
/// at `$deadline`. The timeout object remains valid throughout the current
/// lexical scope.
///
/// This macro is used inside a blocking operation with timeout.
macro_rules! setup_timeout_wait {
    ($lock:ident, $task_cb:expr, $deadline:expr) => {
        // Create a timeout object on the current stack.
        let timeout_object = core::pin::pin!(new_timeout_object_for_task(
            $lock.borrow_mut(),
            $task_cb,
            $deadline
        ));

        // Use `TimeoutGuard` to automatically unregister the timeout when
        // leaving the current lexical scope.
        let mut timeout_guard = timeout::TimeoutGuard {
            timeout: timeout_object.as_ref(),
            lock: $lock,
        };
        let mut $lock = timeout_guard.lock.borrow_mut();

        // Register the timeout object
        timeout::insert_timeout($lock.borrow_mut(), timeout_guard.timeout);
    };
}

impl<Traits: PortThreading> WaitQueue<Traits> {
    /// Construct a `WaitQueue`.
    pub(crate) const fn new(order: QueueOrder) -> Self {
        Self {
            waits: CpuLockCell::new(intrusive_list::ListHead::new()),
            order,
        }
    }
}

impl<Traits: KernelTraits> WaitQueue<Traits> {
    /// Insert a wait object pertaining to the currently running task to
    /// `self`, transitioning the task into the Waiting state.
    ///
    /// The current context must be waitable (this function doesn't check
    /// that). The caller should use `expect_waitable_context` to do that.
    pub(crate) fn wait(
        &'static self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        payload: WaitPayload<Traits>,
    ) -> Result<(), WaitError> {
        self.wait_inner(lock, payload, None).map_err(expect_not_timeout)
    }

    /// Insert a wait object pertaining to the currently running task to
    /// `self`, transitioning the task into the Waiting state. The operation
    /// will time out at `deadline`.
    ///
    /// The current context must be waitable (this function doesn't check
    /// that). The caller should use `expect_waitable_context` to do that.
    pub(crate) fn wait_timeout(
        &'static self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        payload: WaitPayload<Traits>,
        deadline: TickPoint,
    ) -> Result<(), WaitTimeoutError> {
        self.wait_inner(lock, payload, Some(deadline))
    }

    /// The core portion of `Self::wait` and `Self::wait_timeout`.
    fn wait_inner(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        payload: WaitPayload<Traits>,
        deadline: Option<TickPoint>,
    ) -> Result<(), WaitTimeoutError> {
        let task = Traits::state().running_task(lock.borrow_mut()).unwrap();
        let wait = Wait {
            task,
            link: CpuLockCell::new(None),
            wait_queue: Some(self),
            payload,
        };
        let wait_ref = WaitRef(NonNull::from(&wait));

        // Insert `wait_ref` into `self.waits`
        {
            let mut accessor = wait_queue_accessor!(&self.waits, lock.borrow_mut());
            let insert_at = match self.order {
                QueueOrder::Fifo => {
                    // FIFO order - insert at the back
                    None
                }
                QueueOrder::TaskPriority => {
                    let cur_task_pri = task.effective_priority.get(&**accessor.cell_key());
                    find_insertion_position_by_task_priority(cur_task_pri, &accessor)
                }
            };
            accessor.insert(wait_ref, insert_at);
        }

        // Set `task.current_wait`
        task.wait.current_wait.replace(&mut *lock, Some(wait_ref));

        if let Some(deadline) = deadline {
            // Arm a timeout that will wake us with `WakeReason::Timeout`
            setup_timeout_wait!(lock, task, deadline);

            // Transition the task into Waiting. This statement will complete
            // when the task is woken up.
            task::wait_until_woken_up(lock.borrow_mut());

            debug_assert!(wait.link.read(&*lock).is_none());
            debug_assert!(task.wait.current_wait.get(&*lock).is_none());

            wake_reason_to_result(task.wait.wake_reason.get(&*lock))
        } else {
            task::wait_until_woken_up(lock.borrow_mut());

            // `wait_ref` should have been removed from the wait queue by a
            // wake-upper
            debug_assert!(wait.link.read(&*lock).is_none());
            debug_assert!(task.wait.current_wait.get(&*lock).is_none());

            wake_reason_to_result(task.wait.wake_reason.get(&*lock))
        }
    }

    /// Reposition `wait` in the wait queue. This is necessary after changing
    /// the waiting task's priority.
    fn reorder_wait(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>, wait: &Wait<Traits>) {
        match self.order {
            QueueOrder::Fifo => return,
            QueueOrder::TaskPriority => {}
        }

        let wait_ref = WaitRef(NonNull::from(wait));
        let task = wait.task;
        debug_assert!(core::ptr::eq(wait.wait_queue.unwrap(), self));

        let mut accessor = wait_queue_accessor!(&self.waits, lock.borrow_mut());

        // Remove `wait_ref` first, then re-insert it at the updated position.
        accessor.remove(wait_ref);

        let cur_task_pri = task.effective_priority.get(&**accessor.cell_key());
        let insert_at = find_insertion_position_by_task_priority(cur_task_pri, &accessor);
        accessor.insert(wait_ref, insert_at);
    }

    /// Get the next waiting task to be woken up.
    pub(crate) fn first_waiting_task(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static TaskCb<Traits>> {
        let accessor = wait_queue_accessor!(&self.waits, lock.borrow_mut());
        accessor.front_data().map(|wait| wait.task)
    }

    /// Wake up up to one waiting task. Returns `true` if it has successfully
    /// woken up a task.
    ///
    /// This method may make a task Ready, but doesn't yield the processor.
    /// Call `unlock_cpu_and_check_preemption` as needed.
    pub(crate) fn wake_up_one(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        let wait_ref = {
            let mut accessor = wait_queue_accessor!(&self.waits, lock.borrow_mut());
            accessor.pop_front()
        };

        let Some(wait_ref) = wait_ref else {
            return false;
        };

        // Safety: `wait_ref` points to a valid `Wait` because `wait_ref` was
        // in `self.waits` at the beginning of this function call.
        let wait = unsafe { wait_ref.0.as_ref() };

        debug_assert!(core::ptr::eq(wait.wait_queue.unwrap(), self));

        complete_wait(lock.borrow_mut(), wait, WakeReason::Unblocked);

        true
    }

    /// Wake up all waiting tasks.
    ///
    /// This method may make tasks Ready, but doesn't yield the processor.
    /// Call `unlock_cpu_and_check_preemption` as needed.
    pub(crate) fn wake_up_all(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        while self.wake_up_one(lock.borrow_mut()) {}
    }
}

impl<Traits: KernelTraits> fmt::Debug for WaitQueue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WaitQueue").field("order", &self.order).finish()
    }
}

/// Convert the wake reason reported by a wake-upper to the result of a wait
/// operation.
#[inline]
fn wake_reason_to_result(reason: WakeReason) -> Result<(), WaitTimeoutError> {
    match reason {
        WakeReason::Unblocked => Ok(()),
        WakeReason::Timeout => Err(WaitTimeoutError::Timeout),
        WakeReason::Signal => Err(WaitTimeoutError::Interrupted),
    }
}

/// Find the insertion position for a wait object owned by a task whose
/// effective priority is `cur_task_pri`, keeping the queue sorted by
/// descending effective priority with FIFO ordering within a band.
fn find_insertion_position_by_task_priority<Traits: KernelTraits, MapLink>(
    cur_task_pri: u8,
    accessor: &ListAccessorCell<
        '_,
        &CpuLockCell<Traits, intrusive_list::ListHead<WaitRef<Traits>>>,
        UnsafeStatic,
        MapLink,
        CpuLockTokenRefMut<'_, Traits>,
    >,
) -> Option<WaitRef<Traits>>
where
    MapLink: Fn(&Wait<Traits>) -> &CpuLockCell<Traits, Option<intrusive_list::Link<WaitRef<Traits>>>>,
{
    let mut insert_at = None;
    let mut cursor = accessor.back();
    while let Some(next_cursor) = cursor {
        // Should the new wait object be inserted at this or an earlier
        // position?
        let next_cursor_task = accessor.pool()[next_cursor].task;
        let next_cursor_task_pri = next_cursor_task
            .effective_priority
            .get(&**accessor.cell_key());
        if next_cursor_task_pri < cur_task_pri {
            // If so, update `insert_at`. Continue searching because there
            // might be a viable position that is even earlier.
            insert_at = Some(next_cursor);
            cursor = accessor.prev(next_cursor);
        } else {
            break;
        }
    }
    insert_at
}

/// Access the specified task's current wait payload object in the supplied
/// closure.
///
/// The wait object might get deallocated when the task starts running. This
/// function allows access to the wait object while ensuring the reference to
/// the wait object doesn't escape from the scope.
pub(crate) fn with_current_wait_payload<Traits: KernelTraits, R>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    task_cb: &TaskCb<Traits>,
    f: impl FnOnce(Option<&WaitPayload<Traits>>) -> R,
) -> R {
    let wait_ref = task_cb.wait.current_wait.get(&*lock);

    // Safety: `wait_ref` must point to an existing `Wait`
    let wait = wait_ref.map(|r| &unsafe { &*r.0.as_ptr() }.payload);

    f(wait)
}

/// Reposition the given task's wait object within the wait queue. This is
/// necessary after changing the task's priority because wait queues are
/// sorted by task priority ([`QueueOrder::TaskPriority`]).
///
/// This function does nothing if the task is currently not in the Waiting
/// state or the wait object is not associated with any wait queue.
pub(crate) fn reorder_wait_of_task<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    task_cb: &TaskCb<Traits>,
) {
    let Some(wait_ref) = task_cb.wait.current_wait.get(&*lock) else {
        return;
    };

    // Safety: `wait_ref` must point to an existing `Wait`
    let wait = unsafe { &*wait_ref.0.as_ptr() };

    if let Some(wait_queue) = wait.wait_queue {
        wait_queue.reorder_wait(lock, wait);
    }
}

/// Create a wait object pertaining to the currently running task but not
/// pertaining to any wait queue. Transition the task into the Waiting state.
///
/// The only way to end such a wait operation is to call [`interrupt_task`].
///
/// The current context must be waitable (this function doesn't check that).
/// The caller should use `expect_waitable_context` to do that.
pub(crate) fn wait_no_queue<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    payload: WaitPayload<Traits>,
) -> Result<(), WaitError> {
    wait_no_queue_inner(lock, payload, None).map_err(expect_not_timeout)
}

/// Create a wait object pertaining to the currently running task but not
/// pertaining to any wait queue. Transition the task into the Waiting state.
/// The operation will time out at `deadline`.
///
/// The only way to end such a wait operation is to call [`interrupt_task`]
/// or to wait until it times out.
///
/// The current context must be waitable (this function doesn't check that).
/// The caller should use `expect_waitable_context` to do that.
pub(crate) fn wait_no_queue_timeout<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    payload: WaitPayload<Traits>,
    deadline: TickPoint,
) -> Result<(), WaitTimeoutError> {
    wait_no_queue_inner(lock, payload, Some(deadline))
}

/// The core portion of [`wait_no_queue`] and [`wait_no_queue_timeout`].
fn wait_no_queue_inner<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    payload: WaitPayload<Traits>,
    deadline: Option<TickPoint>,
) -> Result<(), WaitTimeoutError> {
    let task = Traits::state().running_task(lock.borrow_mut()).unwrap();
    let wait = Wait {
        task,
        link: CpuLockCell::new(None),
        wait_queue: None,
        payload,
    };
    let wait_ref = WaitRef(NonNull::from(&wait));

    debug_assert!(wait.link.read(&*lock).is_none());

    // Set `task.current_wait`
    task.wait.current_wait.replace(&mut *lock, Some(wait_ref));

    if let Some(deadline) = deadline {
        // Arm a timeout that will wake us with `WakeReason::Timeout`
        setup_timeout_wait!(lock, task, deadline);

        task::wait_until_woken_up(lock.borrow_mut());

        debug_assert!(task.wait.current_wait.get(&*lock).is_none());

        wake_reason_to_result(task.wait.wake_reason.get(&*lock))
    } else {
        // Transition the task into Waiting. This statement will complete
        // when the task is woken up.
        task::wait_until_woken_up(lock.borrow_mut());

        // `wait_ref` should have been removed from `current_wait` by a
        // wake-upper
        debug_assert!(task.wait.current_wait.get(&*lock).is_none());

        wake_reason_to_result(task.wait.wake_reason.get(&*lock))
    }
}

/// Deassociate the specified wait object from its waiting task
/// (`wait.task`) and wake up the task.
///
/// Panics if `wait` is not associated (anymore) with its waiting task.
///
/// This function doesn't remove `wait` from `WaitQueue::waits`.
///
/// This function may make a task Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` as needed.
fn complete_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    wait: &Wait<Traits>,
    reason: WakeReason,
) {
    let task_cb = wait.task;

    // Clear `TaskWait::current_wait`
    assert_eq!(
        task_cb.wait.current_wait.get(&*lock),
        Some(WaitRef(NonNull::from(wait)))
    );
    task_cb.wait.current_wait.replace(&mut *lock, None);

    // Record the wake reason
    task_cb.wait.wake_reason.replace(&mut *lock, reason);

    assert_eq!(task_cb.st.get(&*lock), TaskSt::Waiting);

    // Make the task Ready
    //
    // Safety: The task is in the Waiting state, meaning the task state is
    // valid and ready to resume from the point where it was previously
    // interrupted. A proper clean up for exiting the Waiting state is
    // already done as well.
    unsafe { task::make_ready(lock, task_cb) };
}

/// Interrupt any ongoing wait operation on the task, waking it with the
/// given reason.
///
/// This function may make the task Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` as needed.
///
/// Returns `Err(BadParam)` if the task is not in the Waiting state.
pub(crate) fn interrupt_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
    reason: WakeReason,
) -> Result<(), BadParamError> {
    match task_cb.st.get(&*lock) {
        TaskSt::Waiting => {
            // Interrupt the ongoing wait operation. The task is in the
            // Waiting state, so `current_wait` must be `Some(_)`.
            let wait_ref = task_cb.wait.current_wait.get(&*lock).unwrap();

            // Safety: `wait_ref` must point to an existing `Wait`
            let wait = unsafe { wait_ref.0.as_ref() };

            // Remove `wait` from the wait queue it belongs to
            if let Some(wait_queue) = wait.wait_queue {
                let mut accessor = wait_queue_accessor!(&wait_queue.waits, lock.borrow_mut());
                accessor.remove(wait_ref);
            }

            // An aborted mutex wait must fix up the priority-inheritance
            // state it established when the wait began.
            if reason != WakeReason::Unblocked {
                if let WaitPayload::Mutex(mutex_cb) = wait.payload {
                    mutex::on_mutex_wait_aborted(lock.borrow_mut(), mutex_cb, task_cb);
                }
            }

            // Wake up the task
            complete_wait(lock.borrow_mut(), wait, reason);

            Ok(())
        }
        _ => Err(BadParamError::BadParam),
    }
}

/// Construct a [`timeout::Timeout`] that will wake the specified task with
/// [`WakeReason::Timeout`] at `deadline`.
fn new_timeout_object_for_task<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
    deadline: TickPoint,
) -> timeout::Timeout<Traits> {
    // Construct a `Timeout`, supplying our callback function
    let param = task_cb as *const _ as usize;
    let timeout_object = timeout::Timeout::new(interrupt_task_by_timeout, param);

    /// The callback function
    fn interrupt_task_by_timeout<Traits: KernelTraits>(
        param: usize,
        mut lock: CpuLockGuard<Traits>,
    ) -> CpuLockGuard<Traits> {
        // Safety: We are just converting `param` back to the original form
        let task_cb = unsafe { &*(param as *const TaskCb<Traits>) };

        // Interrupt the task. If the task has already been unblocked, we
        // don't care.
        match interrupt_task(lock.borrow_mut(), task_cb, WakeReason::Timeout) {
            Ok(()) | Err(BadParamError::BadParam) => {}
        }

        lock
    }

    // Configure the `Timeout` to expire at `deadline`
    timeout_object.set_expiration_at(lock, deadline);

    timeout_object
}
