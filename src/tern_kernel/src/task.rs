//! Tasks
use core::{fmt, marker::PhantomData};

use crate::{
    error::{
        ActivateTaskError, ExitTaskError, GenerateSignalError, GetCurrentTaskError,
        GetTaskPriorityError, GetTaskStateError, InterruptTaskError, JoinTaskError,
        PendingSignalsError, QueueSignalError, ResumeTaskError, SetTaskPolicyError,
        SetTaskPriorityError, SleepError, SuspendTaskError, WaitError, WaitTimeoutError,
        YieldError,
    },
    klock, mutex, signal,
    signal::SignalSet,
    stack::Stack,
    state, timeout,
    time::{TickDuration, TickPoint},
    utils::Init,
    wait,
    wait::{WaitPayload, WakeReason},
    Id, KernelTraits, PortThreading, System,
};

pub(crate) mod readyqueue;
use self::readyqueue::ScheduleDecision;

pub(crate) type TaskId = Id;

/// These associated functions implement the task-related portion of the
/// public API.
impl<Traits: KernelTraits> System<Traits> {
    /// Get the [`TaskCb`] for the specified raw ID.
    ///
    /// A dangling ID is a programmer error and trips the assertion built
    /// into the slice indexing.
    #[inline]
    fn task_cb(this: TaskId) -> &'static TaskCb<Traits> {
        &Traits::task_cb_pool()[this.get() - 1]
    }

    /// Get a handle to the currently running task.
    pub fn current_task() -> Result<Task<Traits>, GetCurrentTaskError> {
        if !Traits::is_task_context() {
            return Err(GetCurrentTaskError::BadContext);
        }

        let mut lock = klock::lock_cpu::<Traits>()?;
        let task_cb = Traits::state().running_task(lock.borrow_mut()).unwrap();

        // Calculate an `Id` from the task CB pointer
        let offset_bytes =
            task_cb as *const TaskCb<_> as usize - Traits::task_cb_pool().as_ptr() as usize;
        let offset = offset_bytes / core::mem::size_of::<TaskCb<Traits>>();

        // Safety: `offset + 1` is nonzero
        let id = unsafe { Id::new_unchecked(offset + 1) };
        Ok(Task::from_id(id))
    }

    /// Terminate the current task.
    ///
    /// # Safety
    ///
    /// All data on the task stack is invalidated without running
    /// destructors. The caller must ensure this does not lead to undefined
    /// behavior.
    pub unsafe fn exit_task() -> Result<core::convert::Infallible, ExitTaskError> {
        // Safety: forwarded to the caller
        unsafe { exit_current_task::<Traits>() }
    }

    /// Make the current task sleep for at least the specified duration.
    ///
    /// One tick is added to the duration so that the wait is never shorter
    /// than requested.
    pub fn sleep(duration: TickDuration) -> Result<(), SleepError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        let deadline = timeout::deadline_after::<Traits>(lock.borrow_mut(), duration);
        put_current_task_to_sleep(lock, deadline)
    }

    /// Make the current task sleep until the specified time point.
    pub fn sleep_until(deadline: TickPoint) -> Result<(), SleepError> {
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        put_current_task_to_sleep(lock, deadline)
    }

    /// Relinquish the processor, rotating the current task to the tail of
    /// its priority band.
    pub fn yield_now() -> Result<(), YieldError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_task_context::<Traits>()?;

        let running_task = Traits::state().running_task(lock.borrow_mut()).unwrap();
        debug_assert_eq!(running_task.st.get(&*lock), TaskSt::Running);

        // Move the task to the tail of its band in the ready queue. The
        // dispatcher will pick the front of the queue, which may well be
        // the same task if no sibling exists.
        //
        // Safety: The previous state is Running, so this is safe
        unsafe { make_ready(lock.borrow_mut(), running_task) };

        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Get the current time.
    pub fn time() -> Result<TickPoint, GetCurrentTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        Ok(timeout::now::<Traits>(lock.borrow_mut()))
    }

    /// Replace the set of signals the current task accepts.
    pub fn accept_signals(set: SignalSet) -> Result<(), crate::error::AcceptSignalsError> {
        signal::accept_signals::<Traits>(set)
    }

    /// Wait until one of the signals in `set` becomes pending, then clear
    /// and return the lowest-numbered one.
    pub fn wait_signals(set: SignalSet) -> Result<signal::SignalInfo, crate::error::WaitSignalsError> {
        signal::wait_signals::<Traits>(set)
    }

    /// [`Self::wait_signals`] with a deadline.
    pub fn wait_signals_until(
        set: SignalSet,
        deadline: TickPoint,
    ) -> Result<signal::SignalInfo, crate::error::WaitSignalsTimeoutError> {
        signal::wait_signals_until::<Traits>(set, Some(deadline))
    }

    /// [`Self::wait_signals`] with a timeout relative to now (rounded up by
    /// one tick).
    pub fn wait_signals_for(
        set: SignalSet,
        duration: TickDuration,
    ) -> Result<signal::SignalInfo, crate::error::WaitSignalsTimeoutError> {
        signal::wait_signals_for::<Traits>(set, duration)
    }
}

/// Represents a single task in a system.
pub struct Task<Traits: KernelTraits> {
    id: TaskId,
    _phantom: PhantomData<Traits>,
}

impl<Traits: KernelTraits> Clone for Task<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: KernelTraits> Copy for Task<Traits> {}

impl<Traits: KernelTraits> PartialEq for Task<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<Traits: KernelTraits> Eq for Task<Traits> {}

impl<Traits: KernelTraits> fmt::Debug for Task<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Task").field(&self.id).finish()
    }
}

impl<Traits: KernelTraits> Task<Traits> {
    /// Construct a `Task` from a raw object ID.
    ///
    /// Normally done by the configuration macro, which guarantees the ID
    /// refers to an existing task.
    pub const fn from_id(id: TaskId) -> Self {
        Self {
            id,
            _phantom: PhantomData,
        }
    }

    /// Get the raw object ID.
    pub const fn id(self) -> TaskId {
        self.id
    }

    #[inline]
    fn cb(self) -> &'static TaskCb<Traits> {
        System::<Traits>::task_cb(self.id)
    }

    /// Start the task: transition it from the `New` state to `Runnable`.
    pub fn start(self) -> Result<(), ActivateTaskError> {
        let lock = klock::lock_cpu::<Traits>()?;
        activate(lock, self.cb())
    }

    /// Wait until the task reaches the `Terminated` state.
    pub fn join(self) -> Result<(), JoinTaskError> {
        join_task(self.cb())
    }

    /// Abort the task's ongoing interruptible wait operation. The wait
    /// completes with the `Interrupted` error.
    pub fn interrupt(self) -> Result<(), InterruptTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let task_cb = self.cb();
        wait::interrupt_task(lock.borrow_mut(), task_cb, WakeReason::Signal)?;

        // The task is now awake, check dispatch
        unlock_cpu_and_check_preemption(lock);

        Ok(())
    }

    /// Suspend the task. Suspending the current task blocks until another
    /// task calls [`Self::resume`].
    pub fn suspend(self) -> Result<(), SuspendTaskError> {
        suspend_task(self.cb())
    }

    /// Resume the task from the `Suspended` state.
    pub fn resume(self) -> Result<(), ResumeTaskError> {
        resume_task(self.cb())
    }

    /// Change the task's base priority.
    ///
    /// With `always_behind == false` the task is reinserted at the head of
    /// its new priority band; with `true`, at the tail.
    pub fn set_priority(self, priority: u8, always_behind: bool) -> Result<(), SetTaskPriorityError> {
        let lock = klock::lock_cpu::<Traits>()?;
        set_task_base_priority(lock, self.cb(), priority, always_behind)
    }

    /// Get the task's base priority.
    pub fn priority(self) -> Result<u8, GetTaskPriorityError> {
        let lock = klock::lock_cpu::<Traits>()?;
        let task_cb = self.cb();

        if matches!(task_cb.st.get(&*lock), TaskSt::Dormant | TaskSt::Terminated) {
            Err(GetTaskPriorityError::BadParam)
        } else {
            Ok(task_cb.base_priority.get(&*lock))
        }
    }

    /// Get the task's effective priority.
    pub fn effective_priority(self) -> Result<u8, GetTaskPriorityError> {
        let lock = klock::lock_cpu::<Traits>()?;
        let task_cb = self.cb();

        if matches!(task_cb.st.get(&*lock), TaskSt::Dormant | TaskSt::Terminated) {
            Err(GetTaskPriorityError::BadParam)
        } else {
            Ok(task_cb.effective_priority.get(&*lock))
        }
    }

    /// Change the task's scheduling policy. The round-robin quantum is
    /// replenished as a side effect.
    pub fn set_scheduling_policy(self, policy: SchedulingPolicy) -> Result<(), SetTaskPolicyError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let task_cb = self.cb();

        if matches!(task_cb.st.get(&*lock), TaskSt::Dormant | TaskSt::Terminated) {
            return Err(SetTaskPolicyError::BadParam);
        }

        task_cb.policy.replace(&mut *lock, policy);
        task_cb
            .time_slice
            .replace(&mut *lock, Traits::ROUND_ROBIN_QUANTUM);
        Ok(())
    }

    /// Get the task's current state.
    pub fn state(self) -> Result<ThreadState, GetTaskStateError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let task_cb = self.cb();

        Ok(match task_cb.st.get(&*lock) {
            TaskSt::Dormant | TaskSt::PendingActivation => ThreadState::New,
            TaskSt::Ready | TaskSt::Running => ThreadState::Runnable,
            TaskSt::Suspended => ThreadState::Suspended,
            TaskSt::Terminated => ThreadState::Terminated,
            TaskSt::Waiting => {
                wait::with_current_wait_payload(lock.borrow_mut(), task_cb, |payload| {
                    match payload {
                        Some(WaitPayload::Semaphore) => ThreadState::BlockedOnSemaphore,
                        Some(WaitPayload::Mutex(_)) => ThreadState::BlockedOnMutex,
                        Some(WaitPayload::ConditionVariable) => {
                            ThreadState::BlockedOnConditionVariable
                        }
                        Some(WaitPayload::Join) => ThreadState::BlockedOnJoin,
                        Some(WaitPayload::Sleep) => ThreadState::Sleeping,
                        Some(WaitPayload::Signal(_)) => ThreadState::BlockedOnSignal,
                        None => unreachable!("waiting task has no wait object"),
                    }
                })
            }
        })
    }

    /// Generate a signal for the task.
    pub fn generate_signal(self, signo: u8) -> Result<(), GenerateSignalError> {
        signal::generate_signal::<Traits>(self.cb(), signo)
    }

    /// Generate a signal carrying a value for the task.
    pub fn queue_signal(self, signo: u8, value: usize) -> Result<(), QueueSignalError> {
        signal::queue_signal::<Traits>(self.cb(), signo, value)
    }

    /// Get the set of signals pending for the task.
    pub fn pending_signals(self) -> Result<SignalSet, PendingSignalsError> {
        signal::pending_signals::<Traits>(self.cb())
    }
}

bitflags::bitflags! {
    /// Static task properties selected at configuration time.
    pub struct TaskAttrFlags: u32 {
        /// Start the task automatically during boot.
        const AUTO_START = 1 << 0;
        /// Create the task with signal reception enabled.
        const RECEIVE_SIGNALS = 1 << 1;
    }
}

/// The scheduling policy of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingPolicy {
    /// The task runs until it blocks or is preempted by a higher-priority
    /// task.
    Fifo,
    /// As `Fifo`, but the task is additionally rotated to the tail of its
    /// priority band whenever it exhausts its round-robin quantum.
    RoundRobin,
}

/// The externally observable state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Constructed but not started yet.
    New,
    /// Ready to run or currently running.
    Runnable,
    /// Blocked in a sleep operation.
    Sleeping,
    BlockedOnSemaphore,
    BlockedOnMutex,
    BlockedOnConditionVariable,
    BlockedOnSignal,
    BlockedOnJoin,
    /// Suspended until explicitly resumed.
    Suspended,
    /// The task function returned.
    Terminated,
}

/// The static properties of a task.
pub struct TaskAttr {
    /// The entry point of the task.
    ///
    /// # Safety
    ///
    /// This is only meant to be used by a kernel port, as a task entry
    /// point, not by user code. Using this in other ways may cause an
    /// undefined behavior.
    pub entry_point: unsafe fn(usize),

    /// The parameter supplied for `entry_point`.
    pub entry_param: usize,

    /// The stack region assigned to the task.
    pub stack: Stack,

    /// The initial base priority of the task.
    pub priority: u8,

    /// The initial scheduling policy of the task.
    pub policy: SchedulingPolicy,

    pub flags: TaskAttrFlags,
}

impl fmt::Debug for TaskAttr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskAttr")
            .field("entry_point", &(self.entry_point as *const ()))
            .field("entry_param", &self.entry_param)
            .field("priority", &self.priority)
            .field("policy", &self.policy)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Task state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskSt {
    /// The task is in the New state: constructed but never started.
    Dormant,

    /// The task should be activated at startup. This will transition into
    /// `Ready` or `Running` before the first task is scheduled.
    PendingActivation,

    Ready,

    /// The task is in the Running state.
    Running,

    /// The task is in the Waiting state: it's blocked on a primitive,
    /// sleeping, or joining another task.
    Waiting,

    /// The task is suspended until explicitly resumed. Unlike `Waiting`, it
    /// has no wait object.
    Suspended,

    /// The task function returned.
    Terminated,
}

/// *Task control block* - the state data of a task.
#[repr(C)]
pub struct TaskCb<Traits: PortThreading> {
    /// Get a reference to `PortTaskState` in the task control block.
    ///
    /// This is guaranteed to be placed at the beginning of the struct so
    /// that assembly code can refer to this easily.
    pub port_task_state: Traits::PortTaskState,

    /// The static properties of the task.
    pub attr: TaskAttr,

    /// The task's base priority.
    pub(crate) base_priority: klock::CpuLockCell<Traits, u8>,

    /// The task's effective priority: the priority the task competes for
    /// the processor with. Calculated from `base_priority` and the locking
    /// protocols of the held mutexes; see
    /// [`mutex::evaluate_task_effective_priority`].
    pub(crate) effective_priority: klock::CpuLockCell<Traits, u8>,

    /// The task's scheduling policy.
    pub(crate) policy: klock::CpuLockCell<Traits, SchedulingPolicy>,

    /// The remaining round-robin quantum, in ticks. Only meaningful while
    /// `policy` is `RoundRobin`.
    pub(crate) time_slice: klock::CpuLockCell<Traits, u32>,

    pub(crate) st: klock::CpuLockCell<Traits, TaskSt>,

    /// Allows `TaskCb` to participate in the ready queue, which is a linked
    /// list headed by [`State::ready_queue`].
    ///
    /// [`State::ready_queue`]: crate::State
    pub(crate) ready_link:
        klock::CpuLockCell<Traits, Option<crate::utils::intrusive_list::StaticLink<TaskCb<Traits>>>>,

    /// The wait state of the task.
    pub(crate) wait: wait::TaskWait<Traits>,

    /// Tasks blocked in a join operation on this task. Woken in the
    /// termination hook.
    pub(crate) join_wait_queue: wait::WaitQueue<Traits>,

    /// The most recently locked PI/PP mutex. Forms a singly-linked list of
    /// all such mutexes currently held by the task through
    /// [`mutex::MutexCb::prev_mutex_held`].
    pub(crate) last_mutex_held: klock::CpuLockCell<Traits, Option<&'static mutex::MutexCb<Traits>>>,

    /// The priority-inheritance mutex this task is currently blocked on.
    /// Used to walk the chain for transitive priority boosting.
    pub(crate) waiting_on_mutex: klock::CpuLockCell<Traits, Option<&'static mutex::MutexCb<Traits>>>,

    /// The signal state of the task.
    pub(crate) signal: signal::SignalState<Traits>,
}

impl<Traits: KernelTraits> TaskCb<Traits> {
    /// Construct a `TaskCb`. Used by the configuration macro.
    pub const fn new(attr: TaskAttr) -> Self {
        Self {
            port_task_state: Traits::PORT_TASK_STATE_INIT,
            base_priority: klock::CpuLockCell::new(attr.priority),
            effective_priority: klock::CpuLockCell::new(attr.priority),
            policy: klock::CpuLockCell::new(attr.policy),
            time_slice: klock::CpuLockCell::new(Traits::ROUND_ROBIN_QUANTUM),
            st: klock::CpuLockCell::new(
                if attr.flags.bits() & TaskAttrFlags::AUTO_START.bits() != 0 {
                    TaskSt::PendingActivation
                } else {
                    TaskSt::Dormant
                },
            ),
            ready_link: klock::CpuLockCell::new(None),
            wait: wait::TaskWait::INIT,
            join_wait_queue: wait::WaitQueue::new(wait::QueueOrder::TaskPriority),
            last_mutex_held: klock::CpuLockCell::new(None),
            waiting_on_mutex: klock::CpuLockCell::new(None),
            signal: signal::SignalState::INIT,
            attr,
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for TaskCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("self", &(self as *const _))
            .field("attr", &self.attr)
            .field("base_priority", &self.base_priority)
            .field("effective_priority", &self.effective_priority)
            .field("policy", &self.policy)
            .field("time_slice", &self.time_slice)
            .field("st", &self.st)
            .field("wait", &self.wait)
            .finish()
    }
}

/// Implements `System::exit_task`.
unsafe fn exit_current_task<Traits: KernelTraits>(
) -> Result<core::convert::Infallible, ExitTaskError> {
    if !Traits::is_task_context() {
        return Err(ExitTaskError::BadContext);
    }

    // If CPU Lock is inactive, activate it.
    let mut lock = unsafe {
        if !Traits::is_cpu_lock_active() {
            Traits::enter_cpu_lock();
        }
        klock::assume_cpu_lock::<Traits>()
    };

    let running_task = Traits::state().running_task(lock.borrow_mut()).unwrap();

    // Release the mutexes held by the task, waking up their next waiters
    // (if any)
    mutex::abandon_held_mutexes(lock.borrow_mut(), running_task);
    debug_assert!(running_task.last_mutex_held.read(&*lock).is_none());

    // Transition the current task to Terminated
    assert_eq!(running_task.st.get(&*lock), TaskSt::Running);
    running_task.st.replace(&mut *lock, TaskSt::Terminated);

    // The termination hook: release every joiner
    running_task.join_wait_queue.wake_up_all(lock.borrow_mut());

    // Erase `running_task`
    Traits::state().running_task.replace(&mut *lock, None);

    core::mem::forget(lock);

    // Safety: (1) The user of `exit_task` acknowledges that all preexisting
    // data on the task stack will be invalidated and has promised that this
    // will not cause any UBs. (2) CPU Lock active
    unsafe {
        Traits::exit_and_dispatch(running_task);
    }
}

/// Initialize a task at boot time.
pub(crate) fn init_task<Traits: KernelTraits>(
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    if let TaskSt::PendingActivation = task_cb.st.read(&*lock) {
        // `PendingActivation` is equivalent to `Dormant` but serves as a
        // marker indicating tasks that should be activated by `init_task`.

        // Safety: CPU Lock active, the task is (essentially) in the Dormant
        // state
        unsafe { Traits::initialize_task_state(task_cb) };

        // Safety: The previous state is PendingActivation (which is
        // equivalent to Dormant) and we just initialized the task state, so
        // this is safe
        unsafe { make_ready(lock, task_cb) };
    }
}

/// Implements `Task::start`.
fn activate<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuard<Traits>,
    task_cb: &'static TaskCb<Traits>,
) -> Result<(), ActivateTaskError> {
    if task_cb.st.get(&*lock) != TaskSt::Dormant {
        return Err(ActivateTaskError::BadParam);
    }

    // Safety: CPU Lock active, the task is in the Dormant state
    unsafe { Traits::initialize_task_state(task_cb) };

    // Reset the task properties
    task_cb
        .base_priority
        .replace(&mut *lock, task_cb.attr.priority);
    task_cb
        .effective_priority
        .replace(&mut *lock, task_cb.attr.priority);
    task_cb.policy.replace(&mut *lock, task_cb.attr.policy);
    task_cb
        .time_slice
        .replace(&mut *lock, Traits::ROUND_ROBIN_QUANTUM);
    signal::reset(lock.borrow_mut(), task_cb);

    // Safety: The previous state is Dormant, and we just initialized the
    // task state, so this is safe
    unsafe { make_ready(lock.borrow_mut(), task_cb) };

    // If `task_cb` has a higher priority, perform a context switch.
    unlock_cpu_and_check_preemption(lock);

    Ok(())
}

/// Transition the task into the Ready state. This function doesn't do any
/// proper cleanup for a previous state. If the previous state is `Dormant`,
/// the caller must initialize the task state first by calling
/// `initialize_task_state`.
pub(crate) unsafe fn make_ready<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    // Make the task Ready
    task_cb.st.replace(&mut *lock, TaskSt::Ready);

    // Insert the task to the back of its priority band in the ready queue.
    Traits::state()
        .ready_queue
        .push_back_task(lock.borrow_mut(), task_cb);
}

/// Relinquish CPU Lock. After that, if there's a higher-priority task than
/// `running_task`, call `Port::yield_cpu`.
///
/// System services that transition a task into the Ready state should call
/// this before returning to the caller.
pub(crate) fn unlock_cpu_and_check_preemption<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuard<Traits>,
) {
    let prev_task_priority =
        if let Some(running_task) = Traits::state().running_task(lock.borrow_mut()) {
            if running_task.st.get(&*lock) == TaskSt::Running {
                Some(running_task.effective_priority.get(&*lock))
            } else {
                None
            }
        } else {
            None
        };

    let front_priority = Traits::state().ready_queue.front_priority(lock.borrow_mut());

    let has_preempting_task = match (front_priority, prev_task_priority) {
        (Some(front), Some(prev)) => front > prev,
        // The current task is blocked or gone; any ready task takes over
        (Some(_), None) => true,
        (None, _) => false,
    };

    // Relinquish CPU Lock
    drop(lock);

    if has_preempting_task {
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
    }
}

/// Implements `PortToKernel::choose_running_task`.
#[inline]
pub(crate) fn choose_next_running_task<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) {
    // The priority of `running_task`
    let prev_running_task = Traits::state().running_task(lock.borrow_mut());
    let prev_task_priority = if let Some(running_task) = prev_running_task {
        if running_task.st.get(&*lock) == TaskSt::Running {
            Some(running_task.effective_priority.get(&*lock))
        } else {
            // The task is blocked, suspended, or was moved into the ready
            // queue by a rotation; elect a new task to run
            None
        }
    } else {
        None
    };

    // Decide the next task to run
    let decision = Traits::state()
        .ready_queue
        .pop_front_task(lock.borrow_mut(), prev_task_priority);

    let next_running_task = match decision {
        ScheduleDecision::SwitchTo(task) => task,

        // There's no task willing to take over the current one, and the
        // current one can still run.
        ScheduleDecision::Keep => {
            return;
        }
    };

    if let Some(task) = next_running_task {
        // Transition `next_running_task` into the Running state
        task.st.replace(&mut *lock, TaskSt::Running);

        if ptr_from_option_ref(prev_running_task) == task as *const _ {
            // Skip the remaining steps if `task == prev_running_task`
            return;
        }
    }

    // `prev_running_task` now loses the control of the processor.
    if let Some(running_task) = prev_running_task {
        match running_task.st.get(&*lock) {
            TaskSt::Running => {
                // Transition `prev_running_task` into the Ready state.
                // Safety: The previous state is Running, so this is safe
                unsafe { make_ready(lock.borrow_mut(), running_task) };
            }
            TaskSt::Waiting | TaskSt::Ready | TaskSt::Suspended => {
                // `prev_running_task` already left the Running state.
            }
            TaskSt::Dormant | TaskSt::PendingActivation | TaskSt::Terminated => unreachable!(),
        }
    }

    Traits::state()
        .running_task
        .replace(&mut *lock, next_running_task);
}

#[inline]
fn ptr_from_option_ref<T>(x: Option<&T>) -> *const T {
    if let Some(x) = x {
        x
    } else {
        core::ptr::null()
    }
}

/// Transition the currently running task into the Waiting or Suspended
/// state (the caller has already updated `TaskCb::st`). Returns when the
/// task is woken up.
///
/// The current context must be waitable (this function doesn't check that).
pub(crate) fn wait_until_woken_up<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) {
    debug_assert_eq!(state::expect_waitable_context::<Traits>(), Ok(()));

    let running_task = Traits::state().running_task(lock.borrow_mut()).unwrap();
    debug_assert!(matches!(
        running_task.st.get(&*lock),
        TaskSt::Waiting | TaskSt::Suspended
    ));

    loop {
        // Temporarily release the CPU Lock before calling `yield_cpu`
        // Safety: (1) We don't access resources protected by CPU Lock.
        //         (2) We currently have CPU Lock.
        //         (3) We will re-acquire a CPU Lock before returning from
        //             this function.
        unsafe { Traits::leave_cpu_lock() };

        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };

        // Re-acquire a CPU Lock
        unsafe { Traits::enter_cpu_lock() };

        let st = running_task.st.get(&*lock);
        if st == TaskSt::Running {
            break;
        }

        debug_assert!(matches!(st, TaskSt::Waiting | TaskSt::Suspended));
    }
}

/// Implements `System::sleep` and `System::sleep_until`.
fn put_current_task_to_sleep<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuard<Traits>,
    deadline: TickPoint,
) -> Result<(), SleepError> {
    // Wait until woken up by the timeout
    match wait::wait_no_queue_timeout(lock.borrow_mut(), WaitPayload::Sleep, deadline) {
        Ok(()) => unreachable!("sleep completed without a wake reason"),
        Err(WaitTimeoutError::Interrupted) => Err(SleepError::Interrupted),
        Err(WaitTimeoutError::Timeout) => Ok(()),
    }
}

/// Implements `Task::join`.
fn join_task<Traits: KernelTraits>(task_cb: &'static TaskCb<Traits>) -> Result<(), JoinTaskError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    state::expect_waitable_context::<Traits>()?;

    let running_task = Traits::state().running_task(lock.borrow_mut()).unwrap();
    if core::ptr::eq(running_task, task_cb) {
        return Err(JoinTaskError::WouldDeadlock);
    }

    loop {
        match task_cb.st.get(&*lock) {
            TaskSt::Terminated => return Ok(()),
            TaskSt::Dormant => return Err(JoinTaskError::BadParam),
            _ => {}
        }

        // Block until the termination hook releases us. A delivered signal
        // merely wakes us up to retry, matching the original's `EINTR`
        // retry loop.
        match task_cb
            .join_wait_queue
            .wait(lock.borrow_mut(), WaitPayload::Join)
        {
            Ok(()) | Err(WaitError::Interrupted) => {}
        }
    }
}

/// Implements `Task::suspend`.
fn suspend_task<Traits: KernelTraits>(
    task_cb: &'static TaskCb<Traits>,
) -> Result<(), SuspendTaskError> {
    let mut lock = klock::lock_cpu::<Traits>()?;

    let running_task = Traits::state().running_task(lock.borrow_mut());

    if ptr_from_option_ref(running_task) == task_cb as *const _ {
        // Suspending the current task blocks
        state::expect_waitable_context::<Traits>()?;

        debug_assert_eq!(task_cb.st.get(&*lock), TaskSt::Running);
        task_cb.st.replace(&mut *lock, TaskSt::Suspended);

        wait_until_woken_up(lock.borrow_mut());
        Ok(())
    } else {
        match task_cb.st.get(&*lock) {
            TaskSt::Ready => {
                Traits::state()
                    .ready_queue
                    .remove_task(lock.borrow_mut(), task_cb);
                task_cb.st.replace(&mut *lock, TaskSt::Suspended);
                Ok(())
            }
            _ => Err(SuspendTaskError::BadParam),
        }
    }
}

/// Implements `Task::resume`.
fn resume_task<Traits: KernelTraits>(
    task_cb: &'static TaskCb<Traits>,
) -> Result<(), ResumeTaskError> {
    let mut lock = klock::lock_cpu::<Traits>()?;

    if task_cb.st.get(&*lock) != TaskSt::Suspended {
        return Err(ResumeTaskError::BadParam);
    }

    // Replenish the round-robin quantum, as for any other unblock
    task_cb
        .time_slice
        .replace(&mut *lock, Traits::ROUND_ROBIN_QUANTUM);

    // Safety: The previous state is Suspended; the task state is intact
    unsafe { make_ready(lock.borrow_mut(), task_cb) };

    unlock_cpu_and_check_preemption(lock);
    Ok(())
}

/// Charge the running task's round-robin quantum. Called once per tick.
///
/// When the quantum is exhausted and a task of the same (or higher)
/// effective priority is ready to run, the running task is rotated to the
/// tail of its priority band and the quantum is replenished.
pub(crate) fn consume_time_slice<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) {
    let Some(running_task) = Traits::state().running_task(lock.borrow_mut()) else {
        return;
    };

    if running_task.st.get(&*lock) != TaskSt::Running
        || running_task.policy.get(&*lock) != SchedulingPolicy::RoundRobin
    {
        return;
    }

    let remaining = {
        let time_slice = running_task.time_slice.write(&mut *lock);
        *time_slice = time_slice.saturating_sub(1);
        *time_slice
    };
    if remaining != 0 {
        return;
    }

    running_task
        .time_slice
        .replace(&mut *lock, Traits::ROUND_ROBIN_QUANTUM);

    let front_priority = Traits::state().ready_queue.front_priority(lock.borrow_mut());
    if let Some(front_priority) = front_priority {
        if front_priority >= running_task.effective_priority.get(&*lock) {
            // Rotate: the dispatch decision at the end of the tick handler
            // will pick the new front of the band.
            //
            // Safety: The previous state is Running, so this is safe
            unsafe { make_ready(lock.borrow_mut(), running_task) };
        }
    }
}

/// Implements `Task::set_priority`.
fn set_task_base_priority<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuard<Traits>,
    task_cb: &'static TaskCb<Traits>,
    base_priority: u8,
    always_behind: bool,
) -> Result<(), SetTaskPriorityError> {
    let st = task_cb.st.get(&*lock);

    if matches!(
        st,
        TaskSt::Dormant | TaskSt::PendingActivation | TaskSt::Terminated
    ) {
        return Err(SetTaskPriorityError::BadParam);
    }

    let old_base_priority = task_cb.base_priority.get(&*lock);

    if old_base_priority == base_priority {
        return Ok(());
    }

    // Fail with `BadParam` if the operation would violate the precondition
    // of the locking protocol used in any of the held or waited mutexes.
    // This check is only needed when raising the priority.
    if base_priority > old_base_priority {
        // Check the currently-waited mutex (if any).
        let waited_mutex = wait::with_current_wait_payload(lock.borrow_mut(), task_cb, |payload| {
            if let Some(&WaitPayload::Mutex(mutex_cb)) = payload {
                Some(mutex_cb)
            } else {
                None
            }
        });

        if let Some(waited_mutex) = waited_mutex {
            if !mutex::does_held_mutex_allow_new_task_base_priority(
                lock.borrow_mut(),
                waited_mutex,
                base_priority,
            ) {
                return Err(SetTaskPriorityError::BadParam);
            }
        }

        // Check the precondition for all currently-held mutexes
        if !mutex::do_held_mutexes_allow_new_task_base_priority(
            lock.borrow_mut(),
            task_cb,
            base_priority,
        ) {
            return Err(SetTaskPriorityError::BadParam);
        }
    }

    // Recalculate `effective_priority` according to the locking protocols
    // of the held mutexes
    let effective_priority =
        mutex::evaluate_task_effective_priority(lock.borrow_mut(), task_cb, base_priority);

    // Assign the new priority
    task_cb.base_priority.replace(&mut *lock, base_priority);
    let old_effective_priority = task_cb
        .effective_priority
        .replace(&mut *lock, effective_priority);

    if old_effective_priority == effective_priority {
        return Ok(());
    }

    match st {
        TaskSt::Ready => {
            // Move the task within the ready queue
            Traits::state()
                .ready_queue
                .reorder_task(lock.borrow_mut(), task_cb, !always_behind);
        }
        TaskSt::Running | TaskSt::Suspended => {}
        TaskSt::Waiting => {
            // Reposition the task in the wait queue it's in
            wait::reorder_wait_of_task(lock.borrow_mut(), task_cb);
        }
        TaskSt::Dormant | TaskSt::PendingActivation | TaskSt::Terminated => unreachable!(),
    }

    // If the task is blocked on a priority-inheritance mutex, the owner's
    // boost must follow the waiter's new priority.
    if let Some(waited_mutex) = task_cb.waiting_on_mutex.get(&*lock) {
        mutex::update_boost_of_owner(lock.borrow_mut(), waited_mutex);
    }

    if let TaskSt::Running | TaskSt::Ready = st {
        // - If `st == TaskSt::Running`, `task_cb` is the currently running
        //   task. If the priority was lowered, it could be preempted by
        //   a task in the Ready state.
        // - If `st == TaskSt::Ready` and the priority was raised, it could
        //   preempt the currently running task.
        unlock_cpu_and_check_preemption(lock);
    }

    Ok(())
}
