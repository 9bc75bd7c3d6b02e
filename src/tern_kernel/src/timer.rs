//! Software timers
use core::{fmt, marker::PhantomData};

use crate::{
    error::{StartTimerError, StopTimerError},
    klock::{assume_cpu_lock, lock_cpu, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    time::{TickDuration, TickPoint},
    timeout,
    utils::pin::static_pin,
    Id, KernelTraits, PortThreading, System,
};

pub(crate) type TimerId = Id;

impl<Traits: KernelTraits> System<Traits> {
    #[inline]
    fn timer_cb(this: TimerId) -> &'static TimerCb<Traits> {
        &Traits::timer_cb_pool()[this.get() - 1]
    }
}

/// Represents a single software timer in a system.
pub struct Timer<Traits: KernelTraits> {
    id: TimerId,
    _phantom: PhantomData<Traits>,
}

impl<Traits: KernelTraits> Clone for Timer<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: KernelTraits> Copy for Timer<Traits> {}

impl<Traits: KernelTraits> fmt::Debug for Timer<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Timer").field(&self.id).finish()
    }
}

impl<Traits: KernelTraits> Timer<Traits> {
    /// Construct a `Timer` from a raw object ID.
    pub const fn from_id(id: TimerId) -> Self {
        Self {
            id,
            _phantom: PhantomData,
        }
    }

    #[inline]
    fn cb(self) -> &'static TimerCb<Traits> {
        System::<Traits>::timer_cb(self.id)
    }

    /// Arm the timer to fire after `delay` (rounded up by one tick), and
    /// then every `period` thereafter. A zero `period` makes the timer
    /// one-shot.
    ///
    /// Re-arming an armed timer replaces the pending expiration.
    pub fn start(self, delay: TickDuration, period: TickDuration) -> Result<(), StartTimerError> {
        let mut lock = lock_cpu::<Traits>()?;
        start_timer(lock.borrow_mut(), self.cb(), delay, period);
        Ok(())
    }

    /// Arm the timer to fire at the absolute time point `at`, and then
    /// every `period` thereafter. Unlike [`Self::start`], no rounding is
    /// applied.
    pub fn start_at(self, at: TickPoint, period: TickDuration) -> Result<(), StartTimerError> {
        let mut lock = lock_cpu::<Traits>()?;
        let timer_cb = self.cb();

        if timer_cb.timeout.is_linked(lock.borrow_mut()) {
            timeout::remove_timeout(lock.borrow_mut(), &timer_cb.timeout);
        }

        timer_cb.period.replace(&mut *lock, period);
        timer_cb.timeout.set_expiration_at(lock.borrow_mut(), at);
        timeout::insert_timeout(lock.borrow_mut(), static_pin(&timer_cb.timeout));
        timer_cb.active.replace(&mut *lock, true);
        Ok(())
    }

    /// Disarm the timer. Pending expirations are discarded; the callback is
    /// not invoked anymore.
    pub fn stop(self) -> Result<(), StopTimerError> {
        let mut lock = lock_cpu::<Traits>()?;
        stop_timer(lock.borrow_mut(), self.cb());
        Ok(())
    }

    /// Get a flag indicating whether the timer is currently armed.
    pub fn is_active(self) -> Result<bool, StopTimerError> {
        let lock = lock_cpu::<Traits>()?;
        Ok(self.cb().active.get(&*lock))
    }
}

/// The static properties of a timer.
pub struct TimerAttr {
    /// The callback of the timer.
    ///
    /// The callback runs in the tick-handler context and must not block.
    pub entry_point: fn(usize),

    /// The parameter supplied for `entry_point`.
    pub entry_param: usize,

    /// The initial delay. `Some(_)` makes the timer armed at boot.
    pub init_delay: Option<TickDuration>,

    /// The initial period.
    pub init_period: TickDuration,
}

impl fmt::Debug for TimerAttr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimerAttr")
            .field("entry_point", &(self.entry_point as *const ()))
            .field("entry_param", &self.entry_param)
            .field("init_delay", &self.init_delay)
            .field("init_period", &self.init_period)
            .finish()
    }
}

/// *Timer control block* - the state data of a timer.
pub struct TimerCb<Traits: PortThreading> {
    /// The static properties of the timer.
    pub(crate) attr: TimerAttr,

    /// The timed event backing the timer. Linked iff the timer is armed.
    ///
    /// The callback parameter is the index of this timer in the timer CB
    /// pool, assigned by [`init_timer`] during boot.
    pub(crate) timeout: timeout::Timeout<Traits>,

    /// `true` iff the timer is armed.
    pub(crate) active: CpuLockCell<Traits, bool>,

    /// The rearm interval. Zero for a one-shot timer.
    pub(crate) period: CpuLockCell<Traits, TickDuration>,
}

impl<Traits: KernelTraits> TimerCb<Traits> {
    /// Construct a `TimerCb`. Used by the configuration macro.
    pub const fn new(attr: TimerAttr) -> Self {
        Self {
            attr,
            timeout: timeout::Timeout::new(timer_timeout_handler::<Traits>, 0),
            active: CpuLockCell::new(false),
            period: CpuLockCell::new(TickDuration::ZERO),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for TimerCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimerCb")
            .field("self", &(self as *const _))
            .field("attr", &self.attr)
            .field("active", &self.active)
            .field("period", &self.period)
            .finish()
    }
}

/// Initialize a timer at boot time: bind the timeout callback parameter to
/// the pool index and arm the timer if configured to start automatically.
pub(crate) fn init_timer<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timer_cb: &'static TimerCb<Traits>,
    index: usize,
) {
    timer_cb.timeout.set_callback_param(lock.borrow_mut(), index);

    if let Some(delay) = timer_cb.attr.init_delay {
        start_timer(
            lock.borrow_mut(),
            timer_cb,
            delay,
            timer_cb.attr.init_period,
        );
    }
}

/// The core portion of [`Timer::start`].
fn start_timer<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timer_cb: &'static TimerCb<Traits>,
    delay: TickDuration,
    period: TickDuration,
) {
    // Re-arming replaces the pending expiration
    if timer_cb.timeout.is_linked(lock.borrow_mut()) {
        timeout::remove_timeout(lock.borrow_mut(), &timer_cb.timeout);
    }

    timer_cb.period.replace(&mut *lock, period);

    timer_cb
        .timeout
        .set_expiration_after(lock.borrow_mut(), delay);
    timeout::insert_timeout(lock.borrow_mut(), static_pin(&timer_cb.timeout));

    timer_cb.active.replace(&mut *lock, true);
}

/// The core portion of [`Timer::stop`].
fn stop_timer<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timer_cb: &'static TimerCb<Traits>,
) {
    if timer_cb.timeout.is_linked(lock.borrow_mut()) {
        timeout::remove_timeout(lock.borrow_mut(), &timer_cb.timeout);
    }

    timer_cb.active.replace(&mut *lock, false);
}

/// The timeout callback function for a timer. This function is registered
/// as the callback function when constructing [`TimerCb::timeout`].
///
/// `i` is an index into the timer CB pool.
fn timer_timeout_handler<Traits: KernelTraits>(
    i: usize,
    mut lock: CpuLockGuard<Traits>,
) -> CpuLockGuard<Traits> {
    let timer_cb = &Traits::timer_cb_pool()[i];

    debug_assert!(!timer_cb.timeout.is_linked(lock.borrow_mut()));
    debug_assert!(timer_cb.active.get(&*lock));

    // Schedule the next expiration
    let period = timer_cb.period.get(&*lock);
    if period.is_zero() {
        // One-shot: the timer goes dormant
        timer_cb.active.replace(&mut *lock, false);
    } else {
        timer_cb
            .timeout
            .adjust_expiration(lock.borrow_mut(), period);
        timeout::insert_timeout(lock.borrow_mut(), static_pin(&timer_cb.timeout));
    }

    // Release CPU Lock before calling the application-provided callback
    // function
    drop(lock);

    let TimerAttr {
        entry_point,
        entry_param,
        ..
    } = timer_cb.attr;
    entry_point(entry_param);

    // Re-acquire CPU Lock
    lock_cpu().unwrap_or_else(|_| unsafe { assume_cpu_lock() })
}
