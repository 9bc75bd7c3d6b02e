//! A priority-based preemptive RTOS kernel for single-core
//! microcontrollers.
//!
//! The kernel is generic over a *kernel-trait type* implementing the port
//! traits ([`PortThreading`], [`PortTimer`]) and the configuration traits
//! ([`KernelCfg1`], [`KernelCfg2`]). All kernel objects live in `static`
//! control-block pools attached to the kernel-trait type by the
//! [`build_system!`] macro; the application refers to them through small
//! `Copy` handles ([`task::Task`], [`mutex::Mutex`], …).
//!
//! # Contexts
//!
//! Code runs in one of the following contexts:
//!
//! - **Task context** — inside a task. Blocking services are allowed here
//!   and nowhere else.
//! - **Interrupt context** — inside the tick handler or another interrupt
//!   handler, including timer callbacks.
//! - **Boot context** — inside [`PortToKernel::boot`] before the first task
//!   is dispatched.
//!
//! # CPU Lock
//!
//! Every kernel structure is protected by the *CPU Lock*, the single
//! kernel-wide critical section realized by the port as an interrupt mask.
//! Inside the kernel, holding the lock is represented by a token, and all
//! mutable kernel state lives in cells keyed on that token.
#![cfg_attr(not(test), no_std)]

pub mod condvar;
pub mod error;
mod cfg;
mod klock;
pub mod mutex;
pub mod queue;
pub mod semaphore;
pub mod signal;
pub mod stack;
mod state;
pub mod task;
pub mod time;
mod timeout;
pub mod timer;
pub mod utils;
mod wait;

pub use self::{
    condvar::{ConditionVariable, ConditionVariableCb},
    mutex::{Mutex, MutexCb, MutexKind, MutexProtocol},
    queue::{Queue, QueueCb, QueueDiscipline, QueueSlotCb},
    semaphore::{Semaphore, SemaphoreCb, SemaphoreValue},
    signal::{SignalInfo, SignalSet, MAX_QUEUED_SIGNALS, SIGNAL_COUNT},
    stack::{Stack, StackStorage, STACK_SENTINEL},
    task::{SchedulingPolicy, Task, TaskAttr, TaskAttrFlags, TaskCb, ThreadState},
    time::{TickDuration, TickPoint},
    timer::{Timer, TimerAttr, TimerCb},
    wait::WakeReason,
};

use crate::utils::Init;

/// Numeric identifier of a kernel object, an index into the object's
/// control-block pool plus one.
pub type Id = core::num::NonZeroUsize;

/// The interface the kernel consumes from the port for task management and
/// the critical section.
///
/// # Safety
///
/// The implementation must uphold the documented contract of every method;
/// the kernel's memory safety depends on it.
pub unsafe trait PortThreading: Sized + Send + Sync + 'static {
    /// The port-specific part of a task's execution state (e.g., the saved
    /// stack pointer, or a handle to a backing host thread).
    type PortTaskState: Send + Sync + 'static;

    /// The initial value of [`Self::PortTaskState`] for a task control
    /// block.
    const PORT_TASK_STATE_INIT: Self::PortTaskState;

    /// Transfer the control to the dispatcher, discarding the current
    /// (startup) context.
    ///
    /// Precondition: CPU Lock active, a boot context
    unsafe fn dispatch_first_task() -> !;

    /// Yield the processor: request the dispatcher to run
    /// `choose_running_task` and a context switch at the earliest
    /// opportunity.
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn yield_cpu();

    /// Destroy the state of the previously running task, which has already
    /// been removed from the scheduler's bookkeeping, and transfer the
    /// control to the dispatcher.
    ///
    /// Precondition: CPU Lock active, a task context
    unsafe fn exit_and_dispatch(task: &'static TaskCb<Self>) -> !;

    /// Enter the CPU Lock state.
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn enter_cpu_lock();

    /// Leave the CPU Lock state.
    ///
    /// Precondition: CPU Lock active
    unsafe fn leave_cpu_lock();

    /// Enter the CPU Lock state. Returns `false` without doing anything if
    /// it was already active.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Prepare the task for execution from scratch: construct the initial
    /// stack frame so that the task, when first dispatched, enters its
    /// entry point.
    ///
    /// Precondition: CPU Lock active, the task is dormant
    unsafe fn initialize_task_state(task: &'static TaskCb<Self>);

    fn is_cpu_lock_active() -> bool;

    fn is_task_context() -> bool;

    fn is_interrupt_context() -> bool;
}

/// The interface the kernel consumes from the port's tick source.
///
/// The port delivers one [`PortToKernel::timer_tick`] call per tick period
/// from a privileged interrupt context.
///
/// # Safety
///
/// See [`PortThreading`].
pub unsafe trait PortTimer: Sized + 'static {
    /// The tick frequency. Informational; the kernel measures everything in
    /// ticks.
    const TICK_RATE_HZ: u32;
}

/// The combined port trait. Automatically implemented for every type
/// implementing [`PortThreading`] and [`PortTimer`].
pub trait Port: PortThreading + PortTimer {}

impl<T: PortThreading + PortTimer> Port for T {}

/// Scalar kernel configuration.
///
/// # Safety
///
/// Implemented by [`build_system!`]; not meant to be implemented by hand.
pub unsafe trait KernelCfg1: Sized + Send + Sync + 'static {
    /// The round-robin quantum, in ticks.
    const ROUND_ROBIN_QUANTUM: u32 = 10;

    /// The number of recursive locks of a `Recursive` mutex allowed before
    /// `lock` fails with `ResourceLimit`.
    const MAX_RECURSIVE_LOCKS: u16 = u16::MAX;

    /// The bound on the length of a priority-inheritance boost chain.
    /// Exceeding it is an application bug.
    const MAX_BOOST_CHAIN_DEPTH: usize = 16;
}

/// Access to the kernel state and the control-block pools.
///
/// # Safety
///
/// Implemented by [`build_system!`]; not meant to be implemented by hand.
pub unsafe trait KernelCfg2: Port + KernelCfg1 {
    fn state() -> &'static State<Self>;

    fn task_cb_pool() -> &'static [TaskCb<Self>];
    fn semaphore_cb_pool() -> &'static [SemaphoreCb<Self>];
    fn mutex_cb_pool() -> &'static [MutexCb<Self>];
    fn condvar_cb_pool() -> &'static [ConditionVariableCb<Self>];
    fn queue_cb_pool() -> &'static [QueueCb<Self>];
    fn timer_cb_pool() -> &'static [TimerCb<Self>];
}

/// The umbrella trait for a fully-configured kernel-trait type.
/// Automatically implemented when the port and configuration traits are.
pub unsafe trait KernelTraits: Port + KernelCfg1 + KernelCfg2 + 'static {}

unsafe impl<T: Port + KernelCfg1 + KernelCfg2 + 'static> KernelTraits for T {}

/// The global mutable state of a kernel instance. Instantiated (once per
/// kernel-trait type) by [`build_system!`]; every access happens under the
/// CPU Lock.
pub struct State<Traits: PortThreading> {
    /// The currently running task, or `None` when the port is idle.
    pub(crate) running_task: klock::CpuLockCell<Traits, Option<&'static TaskCb<Traits>>>,

    /// The tasks in the Ready state, as a priority queue.
    pub(crate) ready_queue: task::readyqueue::ReadyQueue<Traits>,

    /// The tick clock and the armed timeouts.
    pub(crate) timeout: timeout::TimeoutGlobals<Traits>,
}

impl<Traits: PortThreading> Init for State<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        running_task: Init::INIT,
        ready_queue: Init::INIT,
        timeout: Init::INIT,
    };
}

impl<Traits: PortThreading> State<Traits> {
    pub const fn new() -> Self {
        Self::INIT
    }
}

impl<Traits: KernelTraits> State<Traits> {
    /// Get the currently running task.
    pub(crate) fn running_task(
        &self,
        lock: klock::CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static TaskCb<Traits>> {
        self.running_task.get(&*lock)
    }

    /// Expose the running task for the port's dispatcher.
    ///
    /// # Safety
    ///
    /// Must only be called with CPU Lock active or from the dispatcher
    /// while no kernel code is running.
    pub unsafe fn running_task_ptr(&self) -> Option<&'static TaskCb<Traits>> {
        // Safety: The caller guarantees exclusive access, which is what
        //         `CpuLockToken` certifies
        let token = unsafe { klock::assume_cpu_lock::<Traits>() };
        let running_task = self.running_task.get(&*token);
        core::mem::forget(token);
        running_task
    }
}

/// The type on which the kernel services are exposed as associated
/// functions, parameterized by the kernel-trait type.
pub struct System<Traits>(core::marker::PhantomData<Traits>);

/// The interface the kernel *provides* to the port.
pub trait PortToKernel {
    /// Initialize the kernel and transfer the control to the dispatcher.
    ///
    /// Precondition: CPU Lock active, a boot context
    unsafe fn boot() -> !;

    /// Determine the next task to run and update the kernel's
    /// running-task designation. The port then performs the actual context
    /// switch using the result.
    ///
    /// Precondition: CPU Lock active, an interrupt context
    unsafe fn choose_running_task();

    /// Process one tick: advance the tick clock, charge the round-robin
    /// quantum, and fire the expired timeouts.
    ///
    /// Precondition: CPU Lock **inactive**, an interrupt context
    unsafe fn timer_tick();
}

impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn boot() -> ! {
        // Safety: CPU Lock is active per this function's precondition
        let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };

        // Thread the message queues' free lists
        for queue_cb in Traits::queue_cb_pool() {
            queue::init_queue(lock.borrow_mut(), queue_cb);
        }

        // Bind the timer callbacks to their pool slots and arm the
        // auto-started timers
        for (i, timer_cb) in Traits::timer_cb_pool().iter().enumerate() {
            timer::init_timer(lock.borrow_mut(), timer_cb, i);
        }

        // Activate the auto-started tasks
        for task_cb in Traits::task_cb_pool() {
            task::init_task(lock.borrow_mut(), task_cb);
        }

        core::mem::forget(lock);

        // Safety: CPU Lock active, a boot context
        unsafe { Traits::dispatch_first_task() }
    }

    unsafe fn choose_running_task() {
        // Safety: CPU Lock is active per this function's precondition
        let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };

        task::choose_next_running_task(lock.borrow_mut());

        // The port retains the CPU Lock across this call
        core::mem::forget(lock);
    }

    unsafe fn timer_tick() {
        timeout::handle_tick::<Traits>();
    }
}
