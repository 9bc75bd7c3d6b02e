//! Simulation environment for running the `tern` kernel on a hosted
//! environment.
//!
//! Tasks are backed by worker threads of a [user-mode scheduling
//! group](ums); exactly one worker runs at any moment. A host timer thread
//! delivers the periodic tick by pending a simulated interrupt line, and a
//! compute-bound task is preempted with a remote park, so the simulated
//! kernel is genuinely preemptive.
//!
//! Not supported on non-Unix hosts: the remote park operation relies on
//! POSIX signals.
use std::{
    cell::Cell,
    sync::{mpsc, OnceLock},
    time::Duration,
};

use spin::Mutex as SpinMutex;
use tern_kernel::{KernelTraits, PortThreading, PortToKernel, System, TaskCb};

mod sched;
mod threading;
pub mod ums;

pub use self::sched::{BadIntLineError, InterruptNum, InterruptPriority};

/// Used by `use_port!`
#[doc(hidden)]
pub use tern_kernel;

/// The number of interrupt lines. The valid range of interrupt numbers is
/// defined as `0..NUM_INTERRUPT_LINES`.
pub const NUM_INTERRUPT_LINES: usize = 16;

/// The (software) interrupt line used for dispatching.
pub const INTERRUPT_LINE_DISPATCH: InterruptNum = 15;

/// The interrupt priority for [`INTERRUPT_LINE_DISPATCH`]. The dispatcher
/// must have the lowest priority of all interrupt handlers.
pub const INTERRUPT_PRIORITY_DISPATCH: InterruptPriority = 16384;

/// The (software) interrupt line used for timer interrupts.
pub const INTERRUPT_LINE_TIMER: InterruptNum = 14;

/// The interrupt priority for [`INTERRUPT_LINE_TIMER`].
pub const INTERRUPT_PRIORITY_TIMER: InterruptPriority = 16383;

/// The real-time duration of one kernel tick.
pub const TICK_PERIOD: Duration = Duration::from_millis(1);

/// Implemented on a kernel-trait type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
pub unsafe trait PortInstance:
    KernelTraits + PortThreading<PortTaskState = TaskState>
{
    fn port_state() -> &'static State;
}

/// The internal state of the port.
///
/// # Safety
///
/// For the safety information of this type's methods, see the
/// documentation of the corresponding trait methods of
/// [`tern_kernel::PortThreading`].
#[doc(hidden)]
pub struct State {
    thread_group: OnceLock<ums::ThreadGroup<sched::SchedState>>,
    timer_stop_send: SpinMutex<Option<mpsc::Sender<()>>>,
}

/// The port-specific state of a task: which host thread (if any) is
/// backing it.
#[derive(Debug)]
pub struct TaskState {
    /// The task's state in the task state machine.
    ///
    /// This field is expected to be accessed with CPU Lock or a scheduler
    /// lock, so `SpinMutex` is sufficient (no real mutexes are necessary).
    /// The runtime performance is not a concern in `tern_port_std`.
    tsm: SpinMutex<Tsm>,
}

/// Task state machine
///
/// These don't exactly align with the task states defined in the kernel.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Tsm {
    /// The task's context state is not initialized. The kernel has to call
    /// `initialize_task_state` first before choosing this task as the
    /// running task.
    Uninit,
    /// The task's context state is initialized but hasn't started running.
    Dormant,
    /// The task is currently running.
    Running(ums::ThreadId),
}

/// The role of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ThreadRole {
    Unknown,
    Boot,
    /// The backing thread for an interrupt context.
    Interrupt,
    /// The backing thread for a task.
    Task,
}

thread_local! {
    /// The current thread's role. It's automatically assigned after the
    /// creation of a thread managed by the port.
    pub(crate) static THREAD_ROLE: Cell<ThreadRole> = Cell::new(ThreadRole::Unknown);
}

impl TaskState {
    pub const fn new() -> Self {
        Self {
            tsm: SpinMutex::new(Tsm::Uninit),
        }
    }

    fn assert_current_thread(&self) {
        // `self` must represent the current thread
        let expected_thread_id = match &*self.tsm.lock() {
            Tsm::Running(thread_id) => *thread_id,
            _ => unreachable!(),
        };
        assert_eq!(ums::current_thread(), Some(expected_thread_id));
    }

    unsafe fn exit_and_dispatch<Traits: PortInstance>(&self, state: &'static State) -> ! {
        log::trace!("exit_and_dispatch({self:p}) enter");
        self.assert_current_thread();

        let mut lock = state.thread_group.get().unwrap().lock();

        // Dissociate this thread from the task.
        let thread_id = match std::mem::replace(&mut *self.tsm.lock(), Tsm::Uninit) {
            Tsm::Running(thread_id) => thread_id,
            _ => unreachable!(),
        };

        // Make sure this thread will run to completion. At this point, the
        // thread is already dissociated from the task, so the kernel will
        // never choose this task again. However, the underlying worker
        // thread is still alive and needs a chance to unwind itself.
        lock.scheduler().recycle_thread(thread_id);
        lock.scheduler().cpu_lock = false;
        drop(lock);

        // Invoke the dispatcher
        unsafe { state.yield_cpu::<Traits>() };

        log::trace!("exit_and_dispatch({self:p}) calling exit_thread");
        unsafe { ums::exit_thread() };
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::missing_safety_doc)]
impl State {
    pub const fn new() -> Self {
        Self {
            thread_group: OnceLock::new(),
            timer_stop_send: SpinMutex::new(None),
        }
    }

    fn thread_group(&self) -> &ums::ThreadGroup<sched::SchedState> {
        self.thread_group.get().unwrap()
    }

    /// Initialize the user-mode scheduling system and boot the kernel.
    ///
    /// Returns when the shutdown initiated by [`shutdown`] completes.
    pub fn port_boot<Traits: PortInstance>(&'static self) {
        // Create a UMS thread group.
        let (thread_group, join_handle) = ums::ThreadGroup::new(sched::SchedState::new());

        self.thread_group.set(thread_group).ok().unwrap();

        // Start the tick timer thread
        let (timer_stop_send, timer_stop_recv) = mpsc::channel();
        *self.timer_stop_send.lock() = Some(timer_stop_send);
        log::trace!("starting the timer thread");
        let timer_join_handle = std::thread::spawn(move || loop {
            match timer_stop_recv.recv_timeout(TICK_PERIOD) {
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    let _ = pend_interrupt_line::<Traits>(INTERRUPT_LINE_TIMER);
                }
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        });

        // Create the initial UMS worker thread, where the boot phase of
        // the kernel runs
        let mut lock = self.thread_group().lock();
        let thread_id = lock.spawn(|_| {
            THREAD_ROLE.with(|role| role.set(ThreadRole::Boot));

            // Safety: We are a port, so it's okay to call this
            unsafe {
                <Traits as PortToKernel>::boot();
            }
        });
        log::trace!("startup thread = {thread_id:?}");
        lock.scheduler().task_thread = Some(thread_id);
        lock.scheduler().recycle_thread(thread_id);

        // Configure the timer interrupt
        lock.scheduler()
            .update_line(INTERRUPT_LINE_TIMER, |line| {
                line.priority = INTERRUPT_PRIORITY_TIMER;
                line.enable = true;
                line.start = Some(Self::timer_handler::<Traits>);
            })
            .ok()
            .unwrap();

        lock.preempt();
        drop(lock);

        // Wait until the thread group shuts down
        let result = join_handle.join();

        // Stop the timer thread.
        log::trace!("stopping the timer thread");
        *self.timer_stop_send.lock() = None;
        timer_join_handle.join().unwrap();
        log::trace!("stopped the timer thread");

        // Propagate any panic that occurred in a worker thread
        if let Err(e) = result {
            std::panic::resume_unwind(e);
        }
    }

    pub unsafe fn dispatch_first_task<Traits: PortInstance>(&'static self) -> ! {
        log::trace!("dispatch_first_task");
        assert_eq!(expect_worker_thread(), ThreadRole::Boot);
        assert!(self.is_cpu_lock_active::<Traits>());

        let thread_group = self.thread_group();
        let mut lock = thread_group.lock();

        // Configure the dispatch line
        lock.scheduler()
            .update_line(INTERRUPT_LINE_DISPATCH, |line| {
                line.priority = INTERRUPT_PRIORITY_DISPATCH;
                line.enable = true;
                line.pended = true;
                line.start = Some(Self::dispatch_handler::<Traits>);
            })
            .ok()
            .unwrap();

        lock.scheduler().cpu_lock = false;

        // Start scheduling
        assert!(sched::check_preemption_by_interrupt(thread_group, &mut lock));
        drop(lock);

        // Safety: The contract of `dispatch_first_task` explicitly allows
        // discarding the current context.
        unsafe { ums::exit_thread() };
    }

    fn dispatch_handler<Traits: PortInstance>() {
        Traits::port_state().dispatch::<Traits>();
    }

    fn dispatch<Traits: PortInstance>(&'static self) {
        assert_eq!(expect_worker_thread(), ThreadRole::Interrupt);

        unsafe { self.enter_cpu_lock::<Traits>() };
        // Safety: CPU Lock active, an interrupt context
        unsafe { Traits::choose_running_task() };
        // Safety: CPU Lock active; no other kernel code can run until the
        //         interrupt handler completes
        let running_task = unsafe { Traits::state().running_task_ptr() };
        unsafe { self.leave_cpu_lock::<Traits>() };

        let mut lock = self.thread_group().lock();

        // Tell the scheduler which task to run next
        lock.scheduler().task_thread = if let Some(task) = running_task {
            log::trace!("dispatching task {task:p}");

            let mut tsm = task.port_task_state.tsm.lock();

            match &*tsm {
                Tsm::Dormant => {
                    // Spawn a UMS worker thread for this task
                    let thread = lock.spawn(move |_| {
                        THREAD_ROLE.with(|role| role.set(ThreadRole::Task));

                        log::debug!("task {task:p} is now running");

                        // Safety: The port can call the task entry point
                        unsafe {
                            (task.attr.entry_point)(task.attr.entry_param);
                        }

                        // Safety: The task stack (a host thread) holds
                        // nothing that is unsafe to discard
                        unsafe {
                            let _ = System::<Traits>::exit_task();
                        }
                        unreachable!();
                    });

                    log::trace!("spawned thread {thread:?} for the task {task:p}");

                    *tsm = Tsm::Running(thread);
                    Some(thread)
                }
                Tsm::Running(thread_id) => Some(*thread_id),
                Tsm::Uninit => unreachable!(),
            }
        } else {
            None
        };
    }

    pub unsafe fn yield_cpu<Traits: PortInstance>(&'static self) {
        log::trace!("yield_cpu");
        expect_worker_thread();
        assert!(!self.is_cpu_lock_active::<Traits>());

        self.pend_interrupt_line_inner::<Traits>(INTERRUPT_LINE_DISPATCH)
            .unwrap();
    }

    pub unsafe fn exit_and_dispatch<Traits: PortInstance>(
        &'static self,
        task: &'static TaskCb<Traits>,
    ) -> ! {
        log::trace!("exit_and_dispatch");
        assert_eq!(expect_worker_thread(), ThreadRole::Task);
        assert!(self.is_cpu_lock_active::<Traits>());

        unsafe {
            task.port_task_state.exit_and_dispatch::<Traits>(self);
        }
    }

    pub unsafe fn enter_cpu_lock<Traits: PortInstance>(&self) {
        log::trace!("enter_cpu_lock");
        expect_worker_thread();

        let mut lock = self.thread_group().lock();
        assert!(!lock.scheduler().cpu_lock);
        lock.scheduler().cpu_lock = true;
    }

    pub unsafe fn leave_cpu_lock<Traits: PortInstance>(&'static self) {
        log::trace!("leave_cpu_lock");
        expect_worker_thread();

        let thread_group = self.thread_group();
        let mut lock = thread_group.lock();
        assert!(lock.scheduler().cpu_lock);
        lock.scheduler().cpu_lock = false;

        if sched::check_preemption_by_interrupt(thread_group, &mut lock) {
            drop(lock);
            ums::yield_now();
        }
    }

    pub unsafe fn try_enter_cpu_lock<Traits: PortInstance>(&self) -> bool {
        expect_worker_thread();

        let mut lock = self.thread_group().lock();
        let sched_state = lock.scheduler();
        if sched_state.cpu_lock {
            false
        } else {
            sched_state.cpu_lock = true;
            true
        }
    }

    pub unsafe fn initialize_task_state<Traits: PortInstance>(
        &self,
        task: &'static TaskCb<Traits>,
    ) {
        log::trace!("initialize_task_state {task:p}");
        expect_worker_thread();
        assert!(self.is_cpu_lock_active::<Traits>());

        let pts = &task.port_task_state;
        let mut tsm = pts.tsm.lock();
        match &*tsm {
            Tsm::Dormant => {}
            Tsm::Running(_) => {
                todo!("terminating a running task is not implemented");
            }
            Tsm::Uninit => {
                *tsm = Tsm::Dormant;
            }
        }
    }

    pub fn is_cpu_lock_active<Traits: PortInstance>(&self) -> bool {
        expect_worker_thread();

        (self.thread_group().lock()).scheduler().cpu_lock
    }

    pub fn is_task_context<Traits: PortInstance>(&self) -> bool {
        expect_worker_thread();

        THREAD_ROLE.with(|role| match role.get() {
            ThreadRole::Interrupt | ThreadRole::Boot => false,
            ThreadRole::Task => true,
            _ => panic!("`is_task_context` was called from an unknown thread"),
        })
    }

    pub fn is_interrupt_context<Traits: PortInstance>(&self) -> bool {
        expect_worker_thread();

        THREAD_ROLE.with(|role| match role.get() {
            ThreadRole::Task | ThreadRole::Boot => false,
            ThreadRole::Interrupt => true,
            _ => panic!("`is_interrupt_context` was called from an unknown thread"),
        })
    }

    /// Pend an interrupt line from a worker thread.
    fn pend_interrupt_line_inner<Traits: PortInstance>(
        &'static self,
        num: InterruptNum,
    ) -> Result<(), BadIntLineError> {
        log::trace!("pend_interrupt_line({num})");
        expect_worker_thread();

        let thread_group = self.thread_group();
        let mut lock = thread_group.lock();
        lock.scheduler().update_line(num, |line| line.pended = true)?;

        if sched::check_preemption_by_interrupt(thread_group, &mut lock) {
            drop(lock);
            ums::yield_now();
        }

        Ok(())
    }

    fn timer_handler<Traits: PortInstance>() {
        assert_eq!(expect_worker_thread(), ThreadRole::Interrupt);
        log::trace!("timer_handler");

        // Safety: CPU Lock inactive, an interrupt context
        unsafe { <Traits as PortToKernel>::timer_tick() };
    }
}

/// Assert that the current thread is a worker thread.
fn expect_worker_thread() -> ThreadRole {
    let role = THREAD_ROLE.with(|r| r.get());
    assert_ne!(role, ThreadRole::Unknown);
    role
}

/// Boot the kernel attached to `Traits` and run it until [`shutdown`] is
/// called. This is the entry point of a simulated system.
pub fn boot<Traits: PortInstance>() {
    Traits::port_state().port_boot::<Traits>();
}

/// Initiate the shutdown of the simulated system, ending the enclosing
/// [`boot`] call. Never returns; the calling task's backing thread is
/// parked forever.
pub fn shutdown<Traits: PortInstance>() -> ! {
    let state = Traits::port_state();

    // Stop the tick source first so that no new interrupt gets pended
    *state.timer_stop_send.lock() = None;

    let mut lock = state.thread_group().lock();

    // Disable every interrupt line and detach the current task so that the
    // scheduler goes quiescent
    for line in 0..NUM_INTERRUPT_LINES {
        lock.scheduler().update_line(line, |l| l.enable = false).unwrap();
    }
    lock.scheduler().task_thread = None;

    lock.shutdown();
    drop(lock);

    loop {
        ums::yield_now();
    }
}

/// Pend an interrupt line from an external (non-worker) thread.
///
/// It's illegal to call this function from a thread managed by the port
/// (i.e., you can't call it from a task or an interrupt handler).
pub fn pend_interrupt_line<Traits: PortInstance>(
    num: InterruptNum,
) -> Result<(), BadIntLineError> {
    log::trace!("external-pend_interrupt_line({num})");

    assert_eq!(
        THREAD_ROLE.with(|r| r.get()),
        ThreadRole::Unknown,
        "this function cannot be called from a port-managed thread"
    );

    let state = Traits::port_state();
    let thread_group = state.thread_group();
    let mut lock = thread_group.lock();
    lock.scheduler().update_line(num, |line| line.pended = true)?;

    if sched::check_preemption_by_interrupt(thread_group, &mut lock) {
        lock.preempt();
    }
    drop(lock);

    Ok(())
}

#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $SystemTraits:ident) => {
        $vis struct $SystemTraits;

        mod port_std_impl {
            use super::$SystemTraits;
            use $crate::tern_kernel::{PortThreading, PortTimer, TaskCb};
            use $crate::{PortInstance, State, TaskState};

            pub(super) static PORT_STATE: State = State::new();

            unsafe impl PortInstance for $SystemTraits {
                #[inline]
                fn port_state() -> &'static State {
                    &PORT_STATE
                }
            }

            // Assume `$SystemTraits: KernelTraits`
            unsafe impl PortThreading for $SystemTraits {
                type PortTaskState = TaskState;
                #[allow(clippy::declare_interior_mutable_const)]
                const PORT_TASK_STATE_INIT: Self::PortTaskState = TaskState::new();

                unsafe fn dispatch_first_task() -> ! {
                    unsafe { PORT_STATE.dispatch_first_task::<Self>() }
                }

                unsafe fn yield_cpu() {
                    unsafe { PORT_STATE.yield_cpu::<Self>() }
                }

                unsafe fn exit_and_dispatch(task: &'static TaskCb<Self>) -> ! {
                    unsafe { PORT_STATE.exit_and_dispatch::<Self>(task) }
                }

                unsafe fn enter_cpu_lock() {
                    unsafe { PORT_STATE.enter_cpu_lock::<Self>() }
                }

                unsafe fn leave_cpu_lock() {
                    unsafe { PORT_STATE.leave_cpu_lock::<Self>() }
                }

                unsafe fn try_enter_cpu_lock() -> bool {
                    unsafe { PORT_STATE.try_enter_cpu_lock::<Self>() }
                }

                unsafe fn initialize_task_state(task: &'static TaskCb<Self>) {
                    unsafe { PORT_STATE.initialize_task_state::<Self>(task) }
                }

                fn is_cpu_lock_active() -> bool {
                    PORT_STATE.is_cpu_lock_active::<Self>()
                }

                fn is_task_context() -> bool {
                    PORT_STATE.is_task_context::<Self>()
                }

                fn is_interrupt_context() -> bool {
                    PORT_STATE.is_interrupt_context::<Self>()
                }
            }

            unsafe impl PortTimer for $SystemTraits {
                const TICK_RATE_HZ: u32 = 1000;
            }
        }
    };
}
