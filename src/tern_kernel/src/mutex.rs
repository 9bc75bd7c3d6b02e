//! Mutexes
//!
//! A mutex combines a *kind* (`Normal`, `ErrorChecking`, `Recursive`) with a
//! *locking protocol* (`None`, `PriorityInheritance`, `PriorityProtect`).
//! The protocol governs how owning the mutex affects the owner's effective
//! priority:
//!
//! - `PriorityProtect` boosts the owner to the mutex's fixed priority
//!   ceiling for the duration of ownership.
//! - `PriorityInheritance` boosts the owner to the highest effective
//!   priority of any waiter, transitively along the chain of owners blocked
//!   on further PI mutexes.
use core::{fmt, marker::PhantomData};

use crate::{
    error::{
        LockMutexError, LockMutexPrecheckError, LockMutexTimeoutError, QueryMutexError,
        TryLockMutexError, UnlockMutexError, WaitError,
    },
    klock, state, task,
    task::{TaskCb, TaskSt},
    time::{TickDuration, TickPoint},
    timeout,
    wait::{WaitPayload, WaitQueue},
    Id, KernelTraits, PortThreading, System,
};

pub(crate) type MutexId = Id;

/// The locking protocol of a mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexProtocol {
    /// Owning the mutex does not affect the owner's priority.
    None,
    /// The owner inherits the highest effective priority of the waiters.
    PriorityInheritance,
    /// The owner runs at the mutex's priority ceiling (Immediate Ceiling
    /// Priority Protocol).
    PriorityProtect,
}

/// The kind of a mutex, determining the relock and unlock checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexKind {
    Normal,
    /// Relocking and unlocking by a non-owner are detected and reported.
    ErrorChecking,
    /// The mutex counts recursive locks by the owner.
    Recursive,
}

impl<Traits: KernelTraits> System<Traits> {
    #[inline]
    fn mutex_cb(this: MutexId) -> &'static MutexCb<Traits> {
        &Traits::mutex_cb_pool()[this.get() - 1]
    }
}

/// Represents a single mutex in a system.
pub struct Mutex<Traits: KernelTraits> {
    id: MutexId,
    _phantom: PhantomData<Traits>,
}

impl<Traits: KernelTraits> Clone for Mutex<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: KernelTraits> Copy for Mutex<Traits> {}

impl<Traits: KernelTraits> fmt::Debug for Mutex<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Mutex").field(&self.id).finish()
    }
}

impl<Traits: KernelTraits> Mutex<Traits> {
    /// Construct a `Mutex` from a raw object ID.
    pub const fn from_id(id: MutexId) -> Self {
        Self {
            id,
            _phantom: PhantomData,
        }
    }

    #[inline]
    pub(crate) fn cb(self) -> &'static MutexCb<Traits> {
        System::<Traits>::mutex_cb(self.id)
    }

    /// Lock the mutex, blocking until it's available.
    pub fn lock(self) -> Result<(), LockMutexError> {
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        lock_mutex(self.cb(), lock)
    }

    /// Attempt to lock the mutex without blocking.
    pub fn try_lock(self) -> Result<(), TryLockMutexError> {
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_task_context::<Traits>()?;
        try_lock_mutex(self.cb(), lock)
    }

    /// Lock the mutex, giving up at the specified time point.
    pub fn lock_until(self, deadline: TickPoint) -> Result<(), LockMutexTimeoutError> {
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        lock_mutex_timeout(self.cb(), lock, deadline)
    }

    /// Lock the mutex, giving up after the specified duration (rounded up
    /// by one tick).
    pub fn lock_for(self, duration: TickDuration) -> Result<(), LockMutexTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        let deadline = timeout::deadline_after::<Traits>(lock.borrow_mut(), duration);
        lock_mutex_timeout(self.cb(), lock, deadline)
    }

    /// Unlock the mutex.
    pub fn unlock(self) -> Result<(), UnlockMutexError> {
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        unlock_mutex(self.cb(), lock)
    }

    /// Get a flag indicating whether the mutex is currently locked.
    pub fn is_locked(self) -> Result<bool, QueryMutexError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.cb().owning_task.get(&*lock).is_some())
    }
}

/// *Mutex control block* - the state data of a mutex.
pub struct MutexCb<Traits: PortThreading> {
    pub(crate) protocol: MutexProtocol,

    pub(crate) kind: MutexKind,

    /// The priority ceiling. Only meaningful when `protocol` is
    /// `PriorityProtect`.
    pub(crate) ceiling: u8,

    /// The number of lock operations performed by the owner, minus the
    /// number of unlock operations. Zero iff the mutex is unowned.
    pub(crate) recursion_count: klock::CpuLockCell<Traits, u16>,

    pub(crate) wait_queue: WaitQueue<Traits>,

    /// The next element in the singly-linked list headed by
    /// `TaskCb::last_mutex_held`, containing all mutexes currently held by
    /// the owner.
    pub(crate) prev_mutex_held: klock::CpuLockCell<Traits, Option<&'static Self>>,

    /// The task that currently owns the mutex lock.
    pub(crate) owning_task: klock::CpuLockCell<Traits, Option<&'static TaskCb<Traits>>>,
}

impl<Traits: PortThreading> MutexCb<Traits> {
    /// Construct a `MutexCb`. Used by the configuration macro.
    pub const fn new(kind: MutexKind, protocol: MutexProtocol, ceiling: u8) -> Self {
        Self {
            protocol,
            kind,
            ceiling,
            recursion_count: klock::CpuLockCell::new(0),
            wait_queue: WaitQueue::new(crate::wait::QueueOrder::TaskPriority),
            prev_mutex_held: klock::CpuLockCell::new(None),
            owning_task: klock::CpuLockCell::new(None),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for MutexCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MutexCb")
            .field("self", &(self as *const _))
            .field("protocol", &self.protocol)
            .field("kind", &self.kind)
            .field("ceiling", &self.ceiling)
            .field("recursion_count", &self.recursion_count)
            .finish()
    }
}

/// Get the priority contribution of the mutex to its owner.
///
/// - `PriorityInheritance`: the effective priority of the highest-priority
///   waiter, or 0 if no task is waiting.
/// - `PriorityProtect`: the priority ceiling.
/// - `None`: 0.
fn boosted_priority_of<Traits: KernelTraits>(
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) -> u8 {
    match mutex_cb.protocol {
        MutexProtocol::None => 0,
        MutexProtocol::PriorityProtect => mutex_cb.ceiling,
        MutexProtocol::PriorityInheritance => {
            let mut lock = lock;
            mutex_cb
                .wait_queue
                .first_waiting_task(lock.borrow_mut())
                .map(|waiter| waiter.effective_priority.get(&*lock))
                .unwrap_or(0)
        }
    }
}

/// Reevaluate the task's effective priority and return the result.
/// (This function doesn't update [`TaskCb::effective_priority`].)
/// The base priority is assumed to be `base_priority`.
pub(crate) fn evaluate_task_effective_priority<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
    base_priority: u8,
) -> u8 {
    let mut effective_priority = base_priority;
    let mut maybe_mutex_cb = task_cb.last_mutex_held.get(&*lock);

    while let Some(mutex_cb) = maybe_mutex_cb {
        effective_priority =
            effective_priority.max(boosted_priority_of(lock.borrow_mut(), mutex_cb));
        maybe_mutex_cb = mutex_cb.prev_mutex_held.get(&*lock);
    }

    effective_priority
}

/// Recompute the effective priority of `task_cb` and propagate the change
/// along the chain `task → waited-on PI mutex → owner → …`.
///
/// `extra_waiter_priority`, if given, is treated as the priority of an
/// incoming waiter that is not yet on any wait queue of `task_cb`'s held
/// mutexes.
///
/// The walk is bounded by `Traits::MAX_BOOST_CHAIN_DEPTH`; a longer chain is
/// an application bug, not a kernel failure.
pub(crate) fn update_boosted_priority<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
    extra_waiter_priority: Option<u8>,
) {
    let mut cur = task_cb;
    let mut extra = extra_waiter_priority;

    for _ in 0..Traits::MAX_BOOST_CHAIN_DEPTH {
        let base_priority = cur.base_priority.get(&*lock);
        let mut new_priority =
            evaluate_task_effective_priority(lock.borrow_mut(), cur, base_priority);
        if let Some(extra) = extra {
            new_priority = new_priority.max(extra);
        }

        let old_priority = cur.effective_priority.get(&*lock);
        if new_priority == old_priority {
            return;
        }
        cur.effective_priority.replace(&mut *lock, new_priority);

        // Reposition the task in whatever priority-ordered structure it's
        // in. Per the default reinsertion rule, the task lands at the head
        // of its new band.
        match cur.st.get(&*lock) {
            TaskSt::Ready => {
                Traits::state()
                    .ready_queue
                    .reorder_task(lock.borrow_mut(), cur, true);
            }
            TaskSt::Waiting => {
                crate::wait::reorder_wait_of_task(lock.borrow_mut(), cur);
            }
            _ => {}
        }

        // If `cur` is itself blocked on a PI mutex, the priority change is
        // visible in that mutex's wait queue and must flow into its owner.
        let Some(next_mutex) = cur.waiting_on_mutex.get(&*lock) else {
            return;
        };
        let Some(owner) = next_mutex.owning_task.get(&*lock) else {
            return;
        };
        extra = None;
        cur = owner;
    }

    debug_assert!(false, "priority boost chain exceeded the depth bound");
}

/// Recompute the boost of the owner of `mutex_cb` after its wait queue
/// changed.
pub(crate) fn update_boost_of_owner<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) {
    if mutex_cb.protocol != MutexProtocol::PriorityInheritance {
        return;
    }
    if let Some(owner) = mutex_cb.owning_task.get(&*lock) {
        update_boosted_priority(lock.borrow_mut(), owner, None);
    }
}

/// Called by the wait machinery when a mutex wait is aborted (timeout,
/// signal, `Task::interrupt`) rather than completed by a lock transfer.
/// Rolls back the priority-inheritance state established when the wait
/// began.
pub(crate) fn on_mutex_wait_aborted<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    task_cb.waiting_on_mutex.replace(&mut *lock, None);

    // The aborted waiter has already left the wait queue; the owner's boost
    // may fall.
    update_boost_of_owner(lock.borrow_mut(), mutex_cb);
}

/// Check if the specified mutex, which is currently held or waited on by a
/// task, is compatible with the new task base priority according to the
/// mutex's locking protocol.
///
/// The check is only needed when raising the priority.
#[inline]
pub(crate) fn does_held_mutex_allow_new_task_base_priority<Traits: KernelTraits>(
    _lock: klock::CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
    new_base_priority: u8,
) -> bool {
    if mutex_cb.protocol == MutexProtocol::PriorityProtect
        && new_base_priority > mutex_cb.ceiling
    {
        return false;
    }

    true
}

/// Check if the task's held mutexes are all compatible with the new task
/// base priority according to the mutexes' locking protocols.
///
/// The check is only needed when raising the priority.
#[inline]
pub(crate) fn do_held_mutexes_allow_new_task_base_priority<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
    new_base_priority: u8,
) -> bool {
    let mut maybe_mutex_cb = task_cb.last_mutex_held.get(&*lock);
    while let Some(mutex_cb) = maybe_mutex_cb {
        if !does_held_mutex_allow_new_task_base_priority(
            lock.borrow_mut(),
            mutex_cb,
            new_base_priority,
        ) {
            return false;
        }

        maybe_mutex_cb = mutex_cb.prev_mutex_held.get(&*lock);
    }
    true
}

/// The outcome of [`precheck_mutex`] when no error was detected.
enum Precheck {
    /// The mutex was successfully (re)locked during the precheck.
    Acquired,
    /// The mutex is unowned; the caller should complete the acquisition
    /// with [`lock_core`].
    Unowned,
    /// The mutex is owned by another task.
    Contended,
}

/// Check the error conditions covered by [`LockMutexPrecheckError`] and
/// handle a relock by the current owner.
///
///  - `WouldDeadlock`: the current task already owns a `Normal` or
///    `ErrorChecking` mutex. (For the `Normal` kind the original documents
///    an actual deadlock; reporting it is this kernel's documented choice.)
///  - `ResourceLimit`: the recursion count of a `Recursive` mutex would
///    exceed the configured maximum.
///  - `BadParam`: the mutex uses the priority-protect protocol and the
///    current task's effective priority is higher than the ceiling.
///
/// These checks run before any priority-inheritance bookkeeping, so no
/// boost update is observable on an error return.
fn precheck_mutex<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
    running_task: &'static TaskCb<Traits>,
) -> Result<Precheck, LockMutexPrecheckError> {
    let owner = mutex_cb.owning_task.get(&*lock);

    if ptr_from_option_ref(owner) == running_task as *const _ {
        return match mutex_cb.kind {
            MutexKind::Recursive => {
                let count = mutex_cb.recursion_count.get(&*lock);
                if count >= Traits::MAX_RECURSIVE_LOCKS {
                    Err(LockMutexPrecheckError::ResourceLimit)
                } else {
                    mutex_cb.recursion_count.replace(&mut *lock, count + 1);
                    Ok(Precheck::Acquired)
                }
            }
            MutexKind::Normal | MutexKind::ErrorChecking => {
                Err(LockMutexPrecheckError::WouldDeadlock)
            }
        };
    }

    if mutex_cb.protocol == MutexProtocol::PriorityProtect
        && running_task.effective_priority.get(&*lock) > mutex_cb.ceiling
    {
        return Err(LockMutexPrecheckError::BadParam);
    }

    if owner.is_none() {
        Ok(Precheck::Unowned)
    } else {
        Ok(Precheck::Contended)
    }
}

/// Give the ownership of the mutex to `task_cb`.
///
/// The task must be in the Running state (an uncontended acquisition) or
/// the Ready state (a lock transfer to a just-woken waiter).
fn lock_core<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    debug_assert!(matches!(
        task_cb.st.get(&*lock),
        TaskSt::Running | TaskSt::Ready
    ));
    debug_assert!(mutex_cb.owning_task.get(&*lock).is_none());

    mutex_cb.owning_task.replace(&mut *lock, Some(task_cb));
    mutex_cb.recursion_count.replace(&mut *lock, 1);

    // Push `mutex_cb` to the list of the mutexes held by the task.
    let prev_mutex_held = task_cb.last_mutex_held.replace(&mut *lock, Some(mutex_cb));
    mutex_cb.prev_mutex_held.replace(&mut *lock, prev_mutex_held);

    if mutex_cb.protocol == MutexProtocol::PriorityInheritance {
        // The wait (if any) completed by acquiring the lock
        task_cb.waiting_on_mutex.replace(&mut *lock, None);
    }

    if mutex_cb.protocol != MutexProtocol::None {
        update_boosted_priority(lock.borrow_mut(), task_cb, None);
    }
}

/// The priority-inheritance bookkeeping performed right before blocking on
/// a contended PI mutex: register the dependency edge and raise the owner's
/// effective priority to cover the incoming waiter.
fn priority_inheritance_before_block<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
    running_task: &'static TaskCb<Traits>,
) {
    running_task
        .waiting_on_mutex
        .replace(&mut *lock, Some(mutex_cb));

    let waiter_priority = running_task.effective_priority.get(&*lock);
    if let Some(owner) = mutex_cb.owning_task.get(&*lock) {
        // The calling task is not yet on the wait queue, which is why its
        // effective priority is passed explicitly.
        update_boosted_priority(lock.borrow_mut(), owner, Some(waiter_priority));
    }
}

fn lock_mutex<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    mut lock: klock::CpuLockGuard<Traits>,
) -> Result<(), LockMutexError> {
    let running_task = Traits::state().running_task(lock.borrow_mut()).unwrap();

    match precheck_mutex(lock.borrow_mut(), mutex_cb, running_task)? {
        Precheck::Acquired => return Ok(()),
        Precheck::Unowned => {
            lock_core(lock.borrow_mut(), mutex_cb, running_task);
            return Ok(());
        }
        Precheck::Contended => {}
    }

    if mutex_cb.protocol == MutexProtocol::PriorityInheritance {
        priority_inheritance_before_block(lock.borrow_mut(), mutex_cb, running_task);
    }

    // Block until the lock is handed over to us. The wake-upper performs
    // the ownership transfer, so a normal wake means we own the mutex.
    mutex_cb
        .wait_queue
        .wait(lock.borrow_mut(), WaitPayload::Mutex(mutex_cb))?;

    debug_assert!(core::ptr::eq(
        ptr_from_option_ref(mutex_cb.owning_task.get(&*lock)),
        running_task
    ));

    Ok(())
}

fn try_lock_mutex<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    mut lock: klock::CpuLockGuard<Traits>,
) -> Result<(), TryLockMutexError> {
    let running_task = Traits::state().running_task(lock.borrow_mut()).unwrap();

    match precheck_mutex(lock.borrow_mut(), mutex_cb, running_task)? {
        Precheck::Acquired => Ok(()),
        Precheck::Unowned => {
            lock_core(lock.borrow_mut(), mutex_cb, running_task);
            Ok(())
        }
        Precheck::Contended => Err(TryLockMutexError::Busy),
    }
}

fn lock_mutex_timeout<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    mut lock: klock::CpuLockGuard<Traits>,
    deadline: TickPoint,
) -> Result<(), LockMutexTimeoutError> {
    let running_task = Traits::state().running_task(lock.borrow_mut()).unwrap();

    match precheck_mutex(lock.borrow_mut(), mutex_cb, running_task)? {
        Precheck::Acquired => return Ok(()),
        Precheck::Unowned => {
            lock_core(lock.borrow_mut(), mutex_cb, running_task);
            return Ok(());
        }
        Precheck::Contended => {}
    }

    if mutex_cb.protocol == MutexProtocol::PriorityInheritance {
        priority_inheritance_before_block(lock.borrow_mut(), mutex_cb, running_task);
    }

    mutex_cb
        .wait_queue
        .wait_timeout(lock.borrow_mut(), WaitPayload::Mutex(mutex_cb), deadline)?;

    Ok(())
}

fn unlock_mutex<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    mut lock: klock::CpuLockGuard<Traits>,
) -> Result<(), UnlockMutexError> {
    let running_task = Traits::state().running_task(lock.borrow_mut()).unwrap();

    if ptr_from_option_ref(mutex_cb.owning_task.get(&*lock)) != running_task as *const _ {
        // The current task does not currently own the mutex
        return Err(UnlockMutexError::NotOwner);
    }

    if mutex_cb.kind == MutexKind::Recursive {
        let count = mutex_cb.recursion_count.get(&*lock);
        if count > 1 {
            mutex_cb.recursion_count.replace(&mut *lock, count - 1);
            return Ok(());
        }
    }

    release_mutex(lock.borrow_mut(), mutex_cb, running_task);

    // The ownership transfer might have woken a higher-priority task, and
    // releasing a protocol mutex might have lowered our own priority.
    task::unlock_cpu_and_check_preemption(lock);

    Ok(())
}

/// Release the mutex held by `old_owner`: transfer the ownership to the
/// highest-priority waiter, or mark the mutex unowned. Recomputes the old
/// owner's effective priority.
///
/// This function may make a task Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` (or something similar) as needed.
pub(crate) fn release_mutex<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
    old_owner: &'static TaskCb<Traits>,
) {
    // Remove `mutex_cb` from the list of the mutexes held by the task
    unlink_mutex_from_owner(lock.borrow_mut(), mutex_cb, old_owner);

    transfer_or_clear(lock.borrow_mut(), mutex_cb);

    if mutex_cb.protocol != MutexProtocol::None {
        // Lower the old owner's effective priority. This may cause
        // preemption.
        update_boosted_priority(lock.borrow_mut(), old_owner, None);
    }
}

/// Hand the mutex over to the next waiter, or mark it unowned.
fn transfer_or_clear<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) {
    mutex_cb.owning_task.replace(&mut *lock, None);
    mutex_cb.recursion_count.replace(&mut *lock, 0);

    if let Some(next_task) = mutex_cb.wait_queue.first_waiting_task(lock.borrow_mut()) {
        // Wake up the next waiter first so that its own wait object leaves
        // the queue before the new owner's boost is evaluated.
        assert!(mutex_cb.wait_queue.wake_up_one(lock.borrow_mut()));

        // Give the ownership of the mutex to `next_task`
        lock_core(lock.borrow_mut(), mutex_cb, next_task);
    }
}

/// Remove `mutex_cb` from the singly-linked list of mutexes held by `task_cb`.
fn unlink_mutex_from_owner<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    let mut prev: Option<&'static MutexCb<Traits>> = None;
    let mut cur = task_cb.last_mutex_held.get(&*lock);

    while let Some(m) = cur {
        if core::ptr::eq(m, mutex_cb) {
            let next = m.prev_mutex_held.get(&*lock);
            match prev {
                None => {
                    task_cb.last_mutex_held.replace(&mut *lock, next);
                }
                Some(p) => {
                    p.prev_mutex_held.replace(&mut *lock, next);
                }
            }
            m.prev_mutex_held.replace(&mut *lock, None);
            return;
        }
        prev = Some(m);
        cur = m.prev_mutex_held.get(&*lock);
    }

    unreachable!("mutex is not on the owner's held list");
}

/// Release all mutexes held by the task, waking up the next waiters of the
/// mutexes (if any). Called when the task terminates.
///
/// This function doesn't restore the task's effective priority; the task is
/// on its way out.
///
/// This function may make a task Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` (or something similar) as needed.
pub(crate) fn abandon_held_mutexes<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    let mut maybe_mutex_cb = task_cb.last_mutex_held.replace(&mut *lock, None);
    while let Some(mutex_cb) = maybe_mutex_cb {
        maybe_mutex_cb = mutex_cb.prev_mutex_held.replace(&mut *lock, None);
        transfer_or_clear(lock.borrow_mut(), mutex_cb);
    }
}

/// Release the mutex on behalf of a condition-variable wait. Identical to
/// an unlock except that the ownership checks are the caller's business and
/// no dispatch happens yet (the caller is about to block anyway).
pub(crate) fn release_for_condvar<Traits: KernelTraits>(
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
    old_owner: &'static TaskCb<Traits>,
) {
    release_mutex(lock, mutex_cb, old_owner);
}

/// Reacquire the mutex after a condition-variable wait. The wait loops
/// until the lock is obtained; an interrupting signal merely retries, so
/// the caller always owns the mutex on return.
pub(crate) fn reacquire_for_condvar<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
    running_task: &'static TaskCb<Traits>,
) {
    loop {
        if mutex_cb.owning_task.get(&*lock).is_none() {
            lock_core(lock.borrow_mut(), mutex_cb, running_task);
            return;
        }

        if mutex_cb.protocol == MutexProtocol::PriorityInheritance {
            priority_inheritance_before_block(lock.borrow_mut(), mutex_cb, running_task);
        }

        match mutex_cb
            .wait_queue
            .wait(lock.borrow_mut(), WaitPayload::Mutex(mutex_cb))
        {
            Ok(()) => return,
            Err(WaitError::Interrupted) => {}
        }
    }
}

#[inline]
fn ptr_from_option_ref<T>(x: Option<&T>) -> *const T {
    if let Some(x) = x {
        x
    } else {
        core::ptr::null()
    }
}
