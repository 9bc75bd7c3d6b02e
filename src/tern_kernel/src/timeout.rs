//! The tick clock and timed events.
//!
//! The port calls [`timer_tick`](crate::PortToKernel::timer_tick) once per
//! tick. Each call advances the 64-bit tick counter, charges the running
//! task's round-robin quantum, and processes every [`Timeout`] whose
//! deadline has been reached, in deadline order (FIFO for equal deadlines).
//!
//! A `Timeout` is registered by [`insert_timeout`] and must stay in the same
//! memory location until it's unregistered, which happens in one of the
//! following ways:
//!
//!  - On expiration, right before its callback function is called.
//!  - [`remove_timeout`] can unregister a `Timeout` at any time. There is a
//!    RAII guard type [`TimeoutGuard`] that does this automatically.
use core::{fmt, marker::PhantomPinned, ops, pin::Pin, ptr::NonNull};

use crate::{
    klock::{lock_cpu, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    task,
    time::{TickDuration, TickPoint},
    utils::{
        intrusive_list::{self, ListAccessorCell, UnsafeStatic},
        Init,
    },
    KernelTraits, PortThreading,
};

/// A kernel-global state for timed event management.
pub(crate) struct TimeoutGlobals<Traits: PortThreading> {
    /// The number of ticks elapsed since the scheduler was started.
    /// Incremented by [`handle_tick`], and nothing else.
    tick_count: CpuLockCell<Traits, u64>,

    /// The timeouts that are currently armed, sorted by arrival time in
    /// ascending order, FIFO for equal arrival times.
    ///
    /// All elements of this linked list must be valid.
    active_list: CpuLockCell<Traits, intrusive_list::ListHead<TimeoutRef<Traits>>>,
}

impl<Traits: PortThreading> Init for TimeoutGlobals<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        tick_count: Init::INIT,
        active_list: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for TimeoutGlobals<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimeoutGlobals")
            .field("tick_count", &self.tick_count)
            .finish()
    }
}

/// An internal utility to access `TimeoutGlobals`.
pub(crate) trait KernelTimeoutGlobalsExt: KernelTraits {
    fn g_timeout() -> &'static TimeoutGlobals<Self>;
}

impl<T: KernelTraits> KernelTimeoutGlobalsExt for T {
    /// Shortcut for `&Self::state().timeout`.
    #[inline(always)]
    fn g_timeout() -> &'static TimeoutGlobals<Self> {
        &Self::state().timeout
    }
}

// Timeouts
// ---------------------------------------------------------------------------

/// Timeout callback function.
///
/// The callback function is called with CPU Lock active and an interrupt
/// context when the associated [`Timeout`] expires.
///
/// The callback function may wake up tasks. When it does that, it doesn't
/// have to call `unlock_cpu_and_check_preemption` or `yield_cpu` - it's
/// automatically taken care of.
pub(crate) type TimeoutFn<Traits> = fn(usize, CpuLockGuard<Traits>) -> CpuLockGuard<Traits>;

/// A timed event.
///
/// `Timeout` is a `!Unpin` type. Once registered by [`insert_timeout`], the
/// `Timeout` must stay in the same memory location until it's unregistered.
/// Dropping a registered `Timeout` is detected and escalated to a panic.
pub(crate) struct Timeout<Traits: PortThreading> {
    /// The arrival time of the timeout.
    at: CpuLockCell<Traits, TickPoint>,

    /// Forms a linked list headed by [`TimeoutGlobals::active_list`].
    link: CpuLockCell<Traits, Option<intrusive_list::Link<TimeoutRef<Traits>>>>,

    /// Callback function.
    callback: TimeoutFn<Traits>,

    /// Parameter given to the callback function.
    callback_param: CpuLockCell<Traits, usize>,

    /// Un-implement `Unpin`.
    _pin: PhantomPinned,
}

impl<Traits: PortThreading> Drop for Timeout<Traits> {
    #[inline]
    fn drop(&mut self) {
        if self.link.get_mut().is_some() {
            // The timeout is still in the active list. Dropping `self` now
            // would cause use-after-free. The owner of `Timeout` is
            // responsible for ensuring this does not happen.
            panic!("timeout is still linked");
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for Timeout<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Timeout")
            .field("at", &self.at)
            .field("callback", &(self.callback as *const ()))
            .finish()
    }
}

impl<Traits: PortThreading> Timeout<Traits> {
    /// Construct a `Timeout`.
    ///
    /// The arrival time is initialized to the scheduler start time; set it
    /// with [`Self::set_expiration_at`] or [`Self::set_expiration_after`]
    /// before registering the timeout.
    pub(crate) const fn new(callback: TimeoutFn<Traits>, callback_param: usize) -> Self {
        Self {
            at: CpuLockCell::new(TickPoint::ORIGIN),
            link: CpuLockCell::new(None),
            callback,
            callback_param: CpuLockCell::new(callback_param),
            _pin: PhantomPinned,
        }
    }

    /// Get a flag indicating whether the `Timeout` is currently registered.
    pub(crate) fn is_linked(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.link.read(&*lock).is_some()
    }

    /// Replace the callback parameter.
    pub(crate) fn set_callback_param(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, param: usize) {
        self.callback_param.replace(&mut *lock, param);
    }

    /// Set the arrival time to an absolute time point.
    pub(crate) fn set_expiration_at(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, at: TickPoint) {
        self.at.replace(&mut *lock, at);
    }

    /// Advance the arrival time by the specified duration.
    ///
    /// Intended to be used by periodic events before re-registering the
    /// `Timeout`.
    pub(crate) fn adjust_expiration(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        duration: TickDuration,
    ) {
        let at = self.at.write(&mut *lock);
        *at += duration;
    }
}

impl<Traits: KernelTraits> Timeout<Traits> {
    /// Set the arrival time to the current time plus `duration`, rounded up
    /// by one tick so that the represented delay is never shorter than
    /// `duration`.
    pub(crate) fn set_expiration_after(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        duration: TickDuration,
    ) {
        let at = deadline_after::<Traits>(lock.borrow_mut(), duration);
        self.at.replace(&mut *lock, at);
    }
}

/// A reference to a [`Timeout`].
pub(crate) struct TimeoutRef<Traits: PortThreading>(NonNull<Timeout<Traits>>);

// Safety: `Timeout` is `Send + Sync`
unsafe impl<Traits: PortThreading> Send for TimeoutRef<Traits> {}
unsafe impl<Traits: PortThreading> Sync for TimeoutRef<Traits> {}

impl<Traits: PortThreading> Clone for TimeoutRef<Traits> {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

impl<Traits: PortThreading> Copy for TimeoutRef<Traits> {}

impl<Traits: PortThreading> fmt::Debug for TimeoutRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("TimeoutRef").field(&self.0).finish()
    }
}

impl<Traits: PortThreading> PartialEq for TimeoutRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<Traits: PortThreading> Eq for TimeoutRef<Traits> {}

impl<Traits: PortThreading> ops::Index<TimeoutRef<Traits>> for UnsafeStatic {
    type Output = Timeout<Traits>;

    #[inline]
    fn index(&self, index: TimeoutRef<Traits>) -> &Self::Output {
        // Safety: See `timeout_list_accessor`.
        unsafe { &*index.0.as_ptr() }
    }
}

/// Get a `ListAccessorCell` used to access the active timeout list.
macro_rules! timeout_list_accessor {
    ($list:expr, $key:expr) => {
        ListAccessorCell::new(
            $list,
            // Safety: All elements are extant because a `Timeout` is
            //     unregistered before it can be dropped.
            unsafe { UnsafeStatic::new() },
            |timeout: &Timeout<_>| &timeout.link,
            $key,
        )
    };
}

// Global time management
// ---------------------------------------------------------------------------

/// Get the current time.
pub(crate) fn now<Traits: KernelTraits>(lock: CpuLockTokenRefMut<'_, Traits>) -> TickPoint {
    TickPoint::from_ticks(Traits::g_timeout().tick_count.get(&*lock))
}

/// Compute the deadline for an operation that must not complete earlier
/// than `duration` from now. One tick is added to compensate for the
/// in-progress tick period ("at least this long" - round up, not down).
pub(crate) fn deadline_after<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    duration: TickDuration,
) -> TickPoint {
    now::<Traits>(lock) + duration + TickDuration::from_ticks(1)
}

/// Implements [`PortToKernel::timer_tick`].
///
/// Precondition: CPU Lock inactive, an interrupt context
///
/// [`PortToKernel::timer_tick`]: crate::PortToKernel::timer_tick
pub(crate) fn handle_tick<Traits: KernelTraits>() {
    // The precondition includes CPU Lock being inactive, so this `unwrap`
    // should succeed
    let mut lock = lock_cpu::<Traits>().unwrap();

    let g_timeout = Traits::g_timeout();

    // Advance the tick clock
    let current_time = {
        let tick_count = g_timeout.tick_count.write(&mut *lock);
        *tick_count += 1;
        TickPoint::from_ticks(*tick_count)
    };

    // Charge the running task's round-robin quantum
    task::consume_time_slice(lock.borrow_mut());

    // Process expired timeouts.
    //
    // For each iteration, check the front element (representing the
    // earliest timeout). Exit from the loop if it hasn't arrived yet.
    loop {
        let front = {
            let accessor = timeout_list_accessor!(&g_timeout.active_list, lock.borrow_mut());
            match accessor.front_data() {
                Some(timeout) if timeout.at.get(&**accessor.cell_key()) <= current_time => {
                    accessor.front()
                }
                _ => None,
            }
        };

        let Some(timeout_ref) = front else { break };

        // Safety: `timeout_ref` is in the active list, so the pointee is
        // valid
        let timeout = unsafe { &*timeout_ref.0.as_ptr() };

        // Capture the callback before unregistering; the callback is
        // entitled to re-register or invalidate the `Timeout`.
        let callback = timeout.callback;
        let callback_param = timeout.callback_param.get(&*lock);

        {
            let mut accessor = timeout_list_accessor!(&g_timeout.active_list, lock.borrow_mut());
            accessor.remove(timeout_ref);
        }

        // Call the callback function.
        lock = callback(callback_param, lock);
    }

    // Callback functions might have woken up some tasks, and the quantum
    // charge might have rotated the running task. Check for dispatch and
    // release CPU Lock.
    task::unlock_cpu_and_check_preemption(lock);
}

// Timeout management
// ---------------------------------------------------------------------------

/// Register the specified timeout.
pub(crate) fn insert_timeout<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timeout: Pin<&Timeout<Traits>>,
) {
    // For each `Timeout`, there can be only one list entry pointing to that
    // `Timeout`. If we let two entries reside in the list, removing the
    // first one would falsely flag the `Timeout` as "not registered".
    assert!(
        timeout.link.read(&*lock).is_none(),
        "timeout is already registered",
    );

    let at = timeout.at.get(&*lock);
    let timeout_ref = TimeoutRef(NonNull::from(&*timeout));

    // Insert a reference to `timeout` into the active list.
    //
    // `Timeout` is `!Unpin` and `Timeout::drop` ensures it's not dropped
    // while it's still in the list, so `*timeout` will never be invalidated
    // while being referenced by the list.
    let mut accessor = timeout_list_accessor!(&Traits::g_timeout().active_list, lock.borrow_mut());

    // Find the insertion position: ascending arrival time, FIFO for equal
    // arrival times.
    let mut insert_at = None;
    let mut cursor = accessor.back();
    while let Some(next_cursor) = cursor {
        let next_cursor_at = accessor.pool()[next_cursor].at.get(&**accessor.cell_key());
        if next_cursor_at > at {
            insert_at = Some(next_cursor);
            cursor = accessor.prev(next_cursor);
        } else {
            break;
        }
    }

    accessor.insert(timeout_ref, insert_at);
}

/// Unregister the specified `Timeout`. Does nothing if it's not registered.
pub(crate) fn remove_timeout<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timeout: &Timeout<Traits>,
) {
    if timeout.link.read(&*lock).is_none() {
        return;
    }

    let timeout_ref = TimeoutRef(NonNull::from(timeout));
    let mut accessor = timeout_list_accessor!(&Traits::g_timeout().active_list, lock.borrow_mut());
    accessor.remove(timeout_ref);
}

/// RAII guard that automatically unregisters `Timeout` when dropped.
pub(crate) struct TimeoutGuard<'a, 'b, Traits: KernelTraits> {
    pub(crate) timeout: Pin<&'a Timeout<Traits>>,
    pub(crate) lock: CpuLockTokenRefMut<'b, Traits>,
}

impl<Traits: KernelTraits> Drop for TimeoutGuard<'_, '_, Traits> {
    #[inline]
    fn drop(&mut self) {
        remove_timeout(self.lock.borrow_mut(), &self.timeout);
    }
}
