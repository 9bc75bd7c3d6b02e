//! The port scheduler: the state shared between the CPU Lock, the
//! simulated interrupt controller, and the task dispatcher.
//!
//! At most one worker thread of the UMS thread group runs at a time. The
//! scheduler picks, in this order: the interrupt-context thread (while an
//! interrupt is being serviced), a thread that must run to completion
//! (an exiting task), and finally the backing thread of the kernel's
//! current task.
use crate::ums;

/// Identifies an interrupt line. The valid range is
/// `0..`[`crate::NUM_INTERRUPT_LINES`].
pub type InterruptNum = usize;

/// A smaller value means a higher priority.
pub type InterruptPriority = i32;

/// The error type indicating an out-of-range [`InterruptNum`].
#[derive(Debug, Clone, Copy)]
pub struct BadIntLineError;

#[derive(Debug, Clone, Copy)]
pub(crate) struct IntLine {
    pub priority: InterruptPriority,
    pub enable: bool,
    pub pended: bool,
    pub start: Option<fn()>,
}

impl IntLine {
    const fn new() -> Self {
        Self {
            priority: InterruptPriority::MAX,
            enable: false,
            pended: false,
            start: None,
        }
    }
}

/// The scheduler state of a simulated kernel instance.
pub(crate) struct SchedState {
    /// The simulated interrupt-mask state ("CPU Lock" of the kernel).
    /// While `true`, no interrupt line is serviced.
    pub cpu_lock: bool,

    /// The backing worker thread of the kernel's current task, if any.
    pub task_thread: Option<ums::ThreadId>,

    /// The worker thread dedicated to running interrupt handlers, lazily
    /// spawned. While `int_thread_active` is set, it outprioritizes every
    /// other thread.
    pub int_thread: Option<ums::ThreadId>,
    pub int_thread_active: bool,

    /// Threads that must run to completion (e.g., exiting tasks) before
    /// the current task is resumed.
    recycled_threads: Vec<ums::ThreadId>,

    int_lines: Vec<IntLine>,
}

impl std::fmt::Debug for SchedState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SchedState")
            .field("cpu_lock", &self.cpu_lock)
            .field("task_thread", &self.task_thread)
            .field("int_thread", &self.int_thread)
            .field("int_thread_active", &self.int_thread_active)
            .field("recycled_threads", &self.recycled_threads)
            .finish()
    }
}

impl SchedState {
    pub(crate) fn new() -> Self {
        Self {
            // The kernel boots with the CPU Lock active
            cpu_lock: true,
            task_thread: None,
            int_thread: None,
            int_thread_active: false,
            recycled_threads: Vec::new(),
            int_lines: vec![IntLine::new(); crate::NUM_INTERRUPT_LINES],
        }
    }

    /// Make sure the specified thread will run to completion, taking
    /// precedence over the current task.
    pub(crate) fn recycle_thread(&mut self, thread_id: ums::ThreadId) {
        self.recycled_threads.push(thread_id);
    }

    /// Update the configuration of an interrupt line.
    pub(crate) fn update_line(
        &mut self,
        num: InterruptNum,
        update: impl FnOnce(&mut IntLine),
    ) -> Result<(), BadIntLineError> {
        let line = self.int_lines.get_mut(num).ok_or(BadIntLineError)?;
        update(line);
        Ok(())
    }

    pub(crate) fn is_line_pended(&self, num: InterruptNum) -> Result<bool, BadIntLineError> {
        self.int_lines.get(num).map(|l| l.pended).ok_or(BadIntLineError)
    }

    /// Get a flag indicating whether a pended and enabled interrupt line
    /// is awaiting service.
    fn has_deliverable_interrupt(&self) -> bool {
        self.int_lines
            .iter()
            .any(|line| line.pended && line.enable && line.start.is_some())
    }

    /// Take the highest-priority pended interrupt line, clearing its pend
    /// flag. Returns its handler.
    ///
    /// Called by the interrupt-context thread. Returns `None` while the
    /// CPU Lock is active.
    pub(crate) fn take_pended_interrupt(&mut self) -> Option<fn()> {
        if self.cpu_lock {
            return None;
        }

        let line = self
            .int_lines
            .iter_mut()
            .filter(|line| line.pended && line.enable && line.start.is_some())
            .min_by_key(|line| line.priority)?;

        line.pended = false;
        line.start
    }
}

impl ums::Scheduler for SchedState {
    fn choose_next_thread(&mut self) -> Option<ums::ThreadId> {
        if self.int_thread_active {
            // An interrupt is being serviced
            self.int_thread
        } else if let Some(&thread_id) = self.recycled_threads.last() {
            Some(thread_id)
        } else {
            self.task_thread
        }
    }

    fn thread_exited(&mut self, thread_id: ums::ThreadId) {
        self.recycled_threads.retain(|&t| t != thread_id);
        if self.task_thread == Some(thread_id) {
            self.task_thread = None;
        }
        if self.int_thread == Some(thread_id) {
            self.int_thread = None;
            self.int_thread_active = false;
        }
    }
}

/// Check whether an interrupt should be serviced now, and if so, make the
/// interrupt-context thread runnable (spawning it on first use).
///
/// Returns `true` if the caller should yield the processor (a worker
/// thread) or preempt the thread group (an external thread).
pub(crate) fn check_preemption_by_interrupt(
    thread_group: &ums::ThreadGroup<SchedState>,
    lock: &mut ums::ThreadGroupLockGuard<'_, SchedState>,
) -> bool {
    let sched = lock.scheduler();

    if sched.cpu_lock || sched.int_thread_active {
        // Interrupts are masked, or one is already being serviced
        return false;
    }

    if !sched.has_deliverable_interrupt() {
        return false;
    }

    if sched.int_thread.is_none() {
        let group = thread_group.clone();
        let thread_id = lock.spawn(move |_| interrupt_thread_body(group));
        lock.scheduler().int_thread = Some(thread_id);
    }

    lock.scheduler().int_thread_active = true;
    true
}

/// The main loop of the interrupt-context thread: service pended interrupt
/// lines in priority order, then go dormant until reactivated by
/// [`check_preemption_by_interrupt`].
fn interrupt_thread_body(group: ums::ThreadGroup<SchedState>) {
    crate::THREAD_ROLE.with(|role| role.set(crate::ThreadRole::Interrupt));

    loop {
        let handler = {
            let mut lock = group.lock();
            match lock.scheduler().take_pended_interrupt() {
                Some(handler) => handler,
                None => {
                    // Nothing to service; hand the processor back
                    lock.scheduler().int_thread_active = false;
                    drop(lock);
                    ums::yield_now();
                    continue;
                }
            }
        };

        log::trace!("entering an interrupt handler");
        handler();
        log::trace!("left an interrupt handler");
    }
}
