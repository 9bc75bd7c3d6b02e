//! Per-task signals
//!
//! Each task created with signal reception owns a pending-signal bitset, an
//! accept mask, and a bounded FIFO of queued `(signo, value)` pairs. A
//! generated signal either completes a matching signal wait on the target
//! task, aborts the target's interruptible wait with the `Interrupted`
//! error, or simply stays pending.
use core::fmt;

use arrayvec::ArrayVec;

use crate::{
    error::{
        AcceptSignalsError, GenerateSignalError, PendingSignalsError, QueueSignalError,
        WaitSignalsError, WaitSignalsTimeoutError, WaitTimeoutError,
    },
    klock, state,
    task::{TaskAttrFlags, TaskCb, TaskSt},
    time::{TickDuration, TickPoint},
    timeout, wait,
    wait::{WaitPayload, WakeReason},
    utils::Init,
    KernelTraits, PortThreading,
};

/// The number of distinct signal numbers (`0..SIGNAL_COUNT`).
pub const SIGNAL_COUNT: u8 = 32;

/// The capacity of the per-task queued-signal buffer.
///
/// This is a build-time configuration of the kernel; queueing a signal to a
/// task whose buffer is full fails with `ResourceLimit`.
pub const MAX_QUEUED_SIGNALS: usize = 8;

/// A set of signal numbers.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalSet(u32);

impl SignalSet {
    /// The empty set.
    pub const EMPTY: Self = Self(0);

    /// The set containing every signal number.
    pub const ALL: Self = Self(u32::MAX);

    /// Construct a set containing the single signal `signo`.
    ///
    /// `signo` must be less than [`SIGNAL_COUNT`].
    #[inline]
    pub const fn with(signo: u8) -> Self {
        Self(1 << signo)
    }

    #[inline]
    pub const fn contains(self, signo: u8) -> bool {
        signo < SIGNAL_COUNT && self.0 & (1 << signo) != 0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[inline]
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    #[inline]
    pub fn add(&mut self, signo: u8) {
        debug_assert!(signo < SIGNAL_COUNT);
        self.0 |= 1 << signo;
    }

    #[inline]
    pub fn remove(&mut self, signo: u8) {
        self.0 &= !(1 << signo);
    }

    /// Get the lowest signal number contained in the set.
    #[inline]
    pub const fn lowest(self) -> Option<u8> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as u8)
        }
    }
}

impl Init for SignalSet {
    const INIT: Self = Self::EMPTY;
}

impl fmt::Debug for SignalSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut list = f.debug_set();
        let mut bits = self.0;
        while bits != 0 {
            let signo = bits.trailing_zeros();
            list.entry(&signo);
            bits &= bits - 1;
        }
        list.finish()
    }
}

/// A signal delivered by a signal wait: the signal number and, if the
/// signal was queued with [`Task::queue_signal`], the oldest associated
/// value.
///
/// [`Task::queue_signal`]: crate::task::Task::queue_signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalInfo {
    pub signo: u8,
    pub value: Option<usize>,
}

#[derive(Clone, Copy)]
struct QueuedSignal {
    signo: u8,
    value: usize,
}

/// The signal state embedded in every task control block.
pub(crate) struct SignalState<Traits: PortThreading> {
    /// The set of signals the task has asked to receive. Signals outside
    /// this set are discarded on generation.
    accept: klock::CpuLockCell<Traits, SignalSet>,

    /// The set of signals awaiting delivery.
    pending: klock::CpuLockCell<Traits, SignalSet>,

    /// The bounded FIFO of queued signal values.
    queued: klock::CpuLockCell<Traits, ArrayVec<QueuedSignal, MAX_QUEUED_SIGNALS>>,
}

impl<Traits: PortThreading> SignalState<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    pub(crate) const INIT: Self = Self {
        accept: klock::CpuLockCell::new(SignalSet::EMPTY),
        pending: klock::CpuLockCell::new(SignalSet::EMPTY),
        queued: klock::CpuLockCell::new(ArrayVec::new_const()),
    };
}

/// Reset the task's signal state. Done when the task is (re)started.
pub(crate) fn reset<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    task_cb.signal.accept.replace(&mut *lock, SignalSet::EMPTY);
    task_cb.signal.pending.replace(&mut *lock, SignalSet::EMPTY);
    task_cb.signal.queued.write(&mut *lock).clear();
}

#[inline]
fn check_receiver<Traits: KernelTraits>(task_cb: &TaskCb<Traits>) -> bool {
    task_cb.attr.flags.contains(TaskAttrFlags::RECEIVE_SIGNALS)
}

/// Implements `Task::generate_signal`.
pub(crate) fn generate_signal<Traits: KernelTraits>(
    task_cb: &'static TaskCb<Traits>,
    signo: u8,
) -> Result<(), GenerateSignalError> {
    if !check_receiver(task_cb) {
        return Err(GenerateSignalError::NotSupported);
    }
    if signo >= SIGNAL_COUNT {
        return Err(GenerateSignalError::BadParam);
    }

    let mut lock = klock::lock_cpu::<Traits>()?;

    if !task_cb.signal.accept.get(&*lock).contains(signo) {
        // Non-accepted signals are discarded on generation
        return Ok(());
    }

    let pending = task_cb.signal.pending.write(&mut *lock);
    pending.add(signo);

    deliver(lock, task_cb);
    Ok(())
}

/// Implements `Task::queue_signal`.
pub(crate) fn queue_signal<Traits: KernelTraits>(
    task_cb: &'static TaskCb<Traits>,
    signo: u8,
    value: usize,
) -> Result<(), QueueSignalError> {
    if !check_receiver(task_cb) {
        return Err(QueueSignalError::NotSupported);
    }
    if signo >= SIGNAL_COUNT {
        return Err(QueueSignalError::BadParam);
    }

    let mut lock = klock::lock_cpu::<Traits>()?;

    if !task_cb.signal.accept.get(&*lock).contains(signo) {
        return Ok(());
    }

    {
        let queued = task_cb.signal.queued.write(&mut *lock);
        if queued.is_full() {
            return Err(QueueSignalError::ResourceLimit);
        }
        queued.push(QueuedSignal { signo, value });
    }

    let pending = task_cb.signal.pending.write(&mut *lock);
    pending.add(signo);

    deliver(lock, task_cb);
    Ok(())
}

/// A signal just became pending for `task_cb`: wake a matching signal wait,
/// or abort an interruptible wait.
fn deliver<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuard<Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    if task_cb.st.get(&*lock) != TaskSt::Waiting {
        return;
    }

    let pending = task_cb.signal.pending.get(&*lock);

    enum Disposition {
        None,
        CompleteSignalWait,
        AbortWait,
    }

    let disposition = wait::with_current_wait_payload(lock.borrow_mut(), task_cb, |payload| {
        match payload {
            Some(&WaitPayload::Signal(waited_set))
                if !waited_set.intersection(pending).is_empty() =>
            {
                Disposition::CompleteSignalWait
            }
            Some(payload) if payload.is_interruptible_by_signal() => Disposition::AbortWait,
            _ => Disposition::None,
        }
    });

    match disposition {
        Disposition::None => {}
        Disposition::CompleteSignalWait => {
            // The signal wait is completed; the waiter picks the signal out
            // of the pending set by itself.
            wait::interrupt_task(lock.borrow_mut(), task_cb, WakeReason::Signal).unwrap();
            crate::task::unlock_cpu_and_check_preemption(lock);
        }
        Disposition::AbortWait => {
            wait::interrupt_task(lock.borrow_mut(), task_cb, WakeReason::Signal).unwrap();
            crate::task::unlock_cpu_and_check_preemption(lock);
        }
    }
}

/// Implements `System::accept_signals`.
pub(crate) fn accept_signals<Traits: KernelTraits>(set: SignalSet) -> Result<(), AcceptSignalsError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    state::expect_task_context::<Traits>()?;

    let task_cb = Traits::state().running_task(lock.borrow_mut()).unwrap();
    if !check_receiver(task_cb) {
        return Err(AcceptSignalsError::NotSupported);
    }

    task_cb.signal.accept.replace(&mut *lock, set);
    Ok(())
}

/// Implements `Task::pending_signals`.
pub(crate) fn pending_signals<Traits: KernelTraits>(
    task_cb: &'static TaskCb<Traits>,
) -> Result<SignalSet, PendingSignalsError> {
    if !check_receiver(task_cb) {
        return Err(PendingSignalsError::NotSupported);
    }
    let lock = klock::lock_cpu::<Traits>()?;
    Ok(task_cb.signal.pending.get(&*lock))
}

/// Clear the lowest pending signal in `set` and pop the oldest queued value
/// for it.
fn take_lowest_pending<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
    set: SignalSet,
) -> Option<SignalInfo> {
    let signo = task_cb
        .signal
        .pending
        .get(&*lock)
        .intersection(set)
        .lowest()?;

    let (value, more_queued) = {
        let queued = task_cb.signal.queued.write(&mut *lock);
        let value = queued
            .iter()
            .position(|entry| entry.signo == signo)
            .map(|pos| queued.remove(pos).value);
        let more_queued = queued.iter().any(|entry| entry.signo == signo);
        (value, more_queued)
    };

    // The pending bit stays set while queued values for the signal remain,
    // so each queued value is observed by exactly one wait.
    let pending = task_cb.signal.pending.write(&mut *lock);
    pending.remove(signo);
    if more_queued {
        pending.add(signo);
    }

    Some(SignalInfo { signo, value })
}

/// Implements `System::wait_signals`.
pub(crate) fn wait_signals<Traits: KernelTraits>(
    set: SignalSet,
) -> Result<SignalInfo, WaitSignalsError> {
    match wait_signals_until::<Traits>(set, None) {
        Ok(info) => Ok(info),
        Err(WaitSignalsTimeoutError::BadContext) => Err(WaitSignalsError::BadContext),
        Err(WaitSignalsTimeoutError::NotSupported) => Err(WaitSignalsError::NotSupported),
        Err(WaitSignalsTimeoutError::Interrupted) => Err(WaitSignalsError::Interrupted),
        Err(WaitSignalsTimeoutError::Timeout) => {
            unreachable!("got timeout result for a non-timeout wait")
        }
    }
}

/// Implements `System::wait_signals_for`.
pub(crate) fn wait_signals_for<Traits: KernelTraits>(
    set: SignalSet,
    duration: TickDuration,
) -> Result<SignalInfo, WaitSignalsTimeoutError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let deadline = timeout::deadline_after::<Traits>(lock.borrow_mut(), duration);
    drop(lock);
    wait_signals_until::<Traits>(set, Some(deadline))
}

/// Implements `System::wait_signals_until`.
pub(crate) fn wait_signals_until<Traits: KernelTraits>(
    set: SignalSet,
    deadline: Option<TickPoint>,
) -> Result<SignalInfo, WaitSignalsTimeoutError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    state::expect_waitable_context::<Traits>()?;

    let task_cb = Traits::state().running_task(lock.borrow_mut()).unwrap();
    if !check_receiver(task_cb) {
        return Err(WaitSignalsTimeoutError::NotSupported);
    }

    loop {
        if let Some(info) = take_lowest_pending(lock.borrow_mut(), task_cb, set) {
            return Ok(info);
        }

        let result = if let Some(deadline) = deadline {
            wait::wait_no_queue_timeout(lock.borrow_mut(), WaitPayload::Signal(set), deadline)
        } else {
            wait::wait_no_queue(lock.borrow_mut(), WaitPayload::Signal(set))
                .map_err(WaitTimeoutError::from)
        };

        match result {
            // A spurious wake; re-check the pending set
            Ok(()) => {}
            Err(WaitTimeoutError::Interrupted) => {
                // Either a matching signal arrived (the generator wakes us
                // with the `Signal` reason) or the wait was externally
                // interrupted; the pending set tells the two apart.
                if task_cb
                    .signal
                    .pending
                    .get(&*lock)
                    .intersection(set)
                    .is_empty()
                {
                    return Err(WaitSignalsTimeoutError::Interrupted);
                }
            }
            Err(WaitTimeoutError::Timeout) => return Err(WaitSignalsTimeoutError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_set_basic() {
        let mut set = SignalSet::EMPTY;
        assert!(set.is_empty());
        assert_eq!(set.lowest(), None);

        set.add(5);
        set.add(2);
        set.add(31);
        assert!(set.contains(2) && set.contains(5) && set.contains(31));
        assert!(!set.contains(3));
        assert_eq!(set.lowest(), Some(2));

        set.remove(2);
        assert_eq!(set.lowest(), Some(5));

        assert!(SignalSet::ALL.contains(0));
        assert!(!SignalSet::EMPTY.contains(64));
    }

    #[test]
    fn signal_set_ops() {
        let a = SignalSet::with(1).union(SignalSet::with(3));
        let b = SignalSet::with(3).union(SignalSet::with(4));
        assert_eq!(a.intersection(b), SignalSet::with(3));
        assert!(a.intersection(SignalSet::with(4)).is_empty());
    }
}
