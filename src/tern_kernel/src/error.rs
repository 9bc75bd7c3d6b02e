//! Error codes returned by the kernel services.
use core::{fmt, mem::transmute};

/// The macro to define [`ResultCode`].
macro_rules! define_result_code {
    (
        $( #[$meta:meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident = $vd:expr
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta] )*
                $vname = $vd
            ),*
        }

        impl ResultCode {
            /// Get the short name of the result code.
            ///
            /// # Examples
            ///
            /// ```
            /// use tern_kernel::error::ResultCode;
            /// assert_eq!(ResultCode::Timeout.as_str(), "Timeout");
            /// ```
            pub fn as_str(self) -> &'static str {
                match self {
                    $(
                        Self::$vname => stringify!($vname),
                    )*
                }
            }

            fn fmt(self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl fmt::Debug for ResultCode {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                (*self).fmt(f)
            }
        }
    };
}

define_result_code! {
    /// All result codes (including success) that the kernel services can
    /// return.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[repr(i8)]
    pub enum ResultCode {
        /// The operation was successful. No additional information is
        /// available.
        Success = 0,
        /// The operation is not supported (e.g., signal delivery to a task
        /// created without signal reception).
        NotSupported = -9,
        /// A parameter is invalid in a way that is not covered by any other
        /// error codes: a bad state transition, an out-of-range signal
        /// number, a priority-protect ceiling violation.
        BadParam = -17,
        /// The current context disallows the operation (e.g., a blocking
        /// service called from an interrupt handler or with the CPU Lock
        /// active).
        BadContext = -25,
        /// The caller does not own the resource.
        NotOwner = -29,
        /// Resource deadlock would occur (relocking an error-checking mutex,
        /// joining the calling task itself).
        WouldDeadlock = -30,
        /// A non-blocking operation could not complete immediately.
        Busy = -33,
        /// A bounded resource is exhausted: the recursive lock count or the
        /// queued-signal buffer.
        ResourceLimit = -43,
        /// A semaphore was signaled past its maximum value.
        Overflow = -45,
        /// The wait operation was interrupted by a delivered signal or by
        /// [`Task::interrupt`].
        ///
        /// [`Task::interrupt`]: crate::task::Task::interrupt
        Interrupted = -49,
        /// The operation timed out.
        Timeout = -50,
    }
}

impl ResultCode {
    /// Get a flag indicating whether the code represents a failure.
    ///
    /// Failure codes have negative values.
    #[inline]
    pub fn is_err(self) -> bool {
        (self as i8) < 0
    }

    /// Get a flag indicating whether the code represents a success.
    ///
    /// Success codes have non-negative values.
    #[inline]
    pub fn is_ok(self) -> bool {
        !self.is_err()
    }
}

macro_rules! define_error {
    (
        mod $mod_name:ident {}
        $( #[$meta:meta] )*
        $vis:vis enum $name:ident $(: $($subty:ident),* $(,)*)? {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        ///
        /// See [`ResultCode`] for all result codes and generic descriptions.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i8)]
        $vis enum $name {
            $(
                $( #[$vmeta] )*
                // Use the same discriminants as `ResultCode` for cost-free
                // conversion
                $vname = ResultCode::$vname as i8
            ),*
        }

        impl fmt::Debug for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl From<Result<(), $name>> for ResultCode {
            #[inline]
            fn from(x: Result<(), $name>) -> Self {
                match x {
                    Ok(()) => Self::Success,
                    Err(e) => Self::from(e),
                }
            }
        }

        impl From<$name> for ResultCode {
            #[inline]
            fn from(x: $name) -> Self {
                // Safety: `ResultCode` and `$name` have the same
                //         representation type, and the representation of
                //         `ResultCode` is a superset of `x`.
                unsafe { transmute(x) }
            }
        }

        #[cfg(test)]
        mod $mod_name {
            use super::*;

            #[test]
            fn to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from($name::$vname),
                    );
                )*
            }
        }

        $($(
            $subty!(impl From<_> for $name);
        )*)?

        #[allow(unused_macros)]
        macro_rules! $name {
            (impl From<_> for $dest_ty:ty) => {
                impl From<$name> for $dest_ty {
                    #[inline]
                    fn from(x: $name) -> Self {
                        match x {
                            $(
                                $name::$vname => Self::$vname,
                            )*
                        }
                    }
                }
            };
        }
    };
}

define_error! {
    mod bad_context_error {}
    /// Error type for a blocking service invoked in an unsuitable context.
    pub(crate) enum BadContextError {
        BadContext,
    }
}

define_error! {
    mod bad_param_error {}
    /// Error type for an operation on an object in an unsuitable state.
    pub(crate) enum BadParamError {
        BadParam,
    }
}

define_error! {
    mod wait_error {}
    /// Error type for a non-timed wait operation.
    pub enum WaitError {
        Interrupted,
    }
}

define_error! {
    mod wait_timeout_error {}
    /// Error type for a timed wait operation.
    pub enum WaitTimeoutError: WaitError {
        Interrupted,
        Timeout,
    }
}

/// Convert `self` to `WaitError`, panicking if `self == Self::Timeout`.
#[inline]
pub(crate) fn expect_not_timeout(e: WaitTimeoutError) -> WaitError {
    match e {
        WaitTimeoutError::Interrupted => WaitError::Interrupted,
        WaitTimeoutError::Timeout => {
            unreachable!("got timeout result for a non-timeout wait")
        }
    }
}

define_error! {
    mod activate_task_error {}
    /// Error type for [`Task::start`](crate::task::Task::start).
    pub enum ActivateTaskError: BadContextError {
        BadContext,
        /// The task is not in the `New` state.
        BadParam,
    }
}

define_error! {
    mod exit_task_error {}
    /// Error type for [`System::exit_task`](crate::System::exit_task).
    pub enum ExitTaskError: BadContextError {
        BadContext,
    }
}

define_error! {
    mod get_current_task_error {}
    /// Error type for [`System::current_task`](crate::System::current_task).
    pub enum GetCurrentTaskError: BadContextError {
        BadContext,
    }
}

define_error! {
    mod get_task_state_error {}
    /// Error type for [`Task::state`](crate::task::Task::state).
    pub enum GetTaskStateError: BadContextError {
        BadContext,
    }
}

define_error! {
    mod join_task_error {}
    /// Error type for [`Task::join`](crate::task::Task::join).
    pub enum JoinTaskError: BadContextError {
        BadContext,
        /// The task was never started.
        BadParam,
        /// The calling task attempted to join itself.
        WouldDeadlock,
    }
}

define_error! {
    mod interrupt_task_error {}
    /// Error type for [`Task::interrupt`](crate::task::Task::interrupt).
    pub enum InterruptTaskError: BadContextError, BadParamError {
        BadContext,
        /// The task is not waiting.
        BadParam,
    }
}

define_error! {
    mod suspend_task_error {}
    /// Error type for [`Task::suspend`](crate::task::Task::suspend).
    pub enum SuspendTaskError: BadContextError {
        BadContext,
        /// The task is not runnable.
        BadParam,
    }
}

define_error! {
    mod resume_task_error {}
    /// Error type for [`Task::resume`](crate::task::Task::resume).
    pub enum ResumeTaskError: BadContextError {
        BadContext,
        /// The task is not suspended.
        BadParam,
    }
}

define_error! {
    mod sleep_error {}
    /// Error type for [`System::sleep`](crate::System::sleep).
    pub enum SleepError: BadContextError {
        BadContext,
        Interrupted,
    }
}

define_error! {
    mod yield_error {}
    /// Error type for [`System::yield_now`](crate::System::yield_now).
    pub enum YieldError: BadContextError {
        BadContext,
    }
}

define_error! {
    mod set_task_priority_error {}
    /// Error type for [`Task::set_priority`](crate::task::Task::set_priority).
    pub enum SetTaskPriorityError: BadContextError {
        BadContext,
        /// The task is dormant or terminated, or the new priority violates
        /// the precondition of a locking protocol in use.
        BadParam,
    }
}

define_error! {
    mod get_task_priority_error {}
    /// Error type for [`Task::priority`](crate::task::Task::priority).
    pub enum GetTaskPriorityError: BadContextError {
        BadContext,
        /// The task is dormant or terminated.
        BadParam,
    }
}

define_error! {
    mod set_task_policy_error {}
    /// Error type for
    /// [`Task::set_scheduling_policy`](crate::task::Task::set_scheduling_policy).
    pub enum SetTaskPolicyError: BadContextError {
        BadContext,
        /// The task is dormant or terminated.
        BadParam,
    }
}

define_error! {
    mod signal_semaphore_error {}
    /// Error type for [`Semaphore::post`](crate::semaphore::Semaphore::post).
    pub enum SignalSemaphoreError: BadContextError {
        BadContext,
        /// The semaphore value is already at the maximum.
        Overflow,
    }
}

define_error! {
    mod wait_semaphore_error {}
    /// Error type for [`Semaphore::wait`](crate::semaphore::Semaphore::wait).
    pub enum WaitSemaphoreError: BadContextError, WaitError {
        BadContext,
        Interrupted,
    }
}

define_error! {
    mod wait_semaphore_timeout_error {}
    /// Error type for
    /// [`Semaphore::wait_until`](crate::semaphore::Semaphore::wait_until).
    pub enum WaitSemaphoreTimeoutError: BadContextError, WaitTimeoutError, WaitSemaphoreError {
        BadContext,
        Interrupted,
        Timeout,
    }
}

define_error! {
    mod poll_semaphore_error {}
    /// Error type for
    /// [`Semaphore::try_wait`](crate::semaphore::Semaphore::try_wait).
    pub enum PollSemaphoreError: BadContextError {
        BadContext,
        Busy,
    }
}

define_error! {
    mod get_semaphore_error {}
    /// Error type for [`Semaphore::value`](crate::semaphore::Semaphore::value).
    pub enum GetSemaphoreError: BadContextError {
        BadContext,
    }
}

define_error! {
    mod lock_mutex_precheck_error {}
    /// Some of the error codes shared by [`TryLockMutexError`],
    /// [`LockMutexError`], and [`LockMutexTimeoutError`]. Used internally by
    /// the mutex implementation.
    pub(crate) enum LockMutexPrecheckError {
        BadParam,
        WouldDeadlock,
        ResourceLimit,
    }
}

define_error! {
    mod lock_mutex_error {}
    /// Error type for [`Mutex::lock`](crate::mutex::Mutex::lock).
    pub enum LockMutexError: BadContextError, WaitError, LockMutexPrecheckError {
        BadContext,
        /// The mutex uses the priority-protect protocol and the calling
        /// task's priority is higher than the mutex's priority ceiling.
        BadParam,
        /// The mutex is error-checking or normal and is already locked by
        /// the calling task.
        WouldDeadlock,
        /// The maximum number of recursive locks has been reached.
        ResourceLimit,
        Interrupted,
    }
}

define_error! {
    mod try_lock_mutex_error {}
    /// Error type for [`Mutex::try_lock`](crate::mutex::Mutex::try_lock).
    pub enum TryLockMutexError: BadContextError, LockMutexPrecheckError {
        BadContext,
        BadParam,
        WouldDeadlock,
        ResourceLimit,
        /// The mutex is locked by another task.
        Busy,
    }
}

define_error! {
    mod lock_mutex_timeout_error {}
    /// Error type for
    /// [`Mutex::lock_until`](crate::mutex::Mutex::lock_until).
    pub enum LockMutexTimeoutError:
        BadContextError, WaitTimeoutError, LockMutexError, LockMutexPrecheckError
    {
        BadContext,
        BadParam,
        WouldDeadlock,
        ResourceLimit,
        Interrupted,
        Timeout,
    }
}

define_error! {
    mod unlock_mutex_error {}
    /// Error type for [`Mutex::unlock`](crate::mutex::Mutex::unlock).
    pub enum UnlockMutexError: BadContextError {
        BadContext,
        /// The mutex is not locked by the calling task.
        NotOwner,
    }
}

define_error! {
    mod query_mutex_error {}
    /// Error type for [`Mutex::is_locked`](crate::mutex::Mutex::is_locked).
    pub enum QueryMutexError: BadContextError {
        BadContext,
    }
}

define_error! {
    mod wait_condition_variable_error {}
    /// Error type for
    /// [`ConditionVariable::wait`](crate::condvar::ConditionVariable::wait).
    pub enum WaitConditionVariableError: BadContextError, WaitError {
        BadContext,
        /// The mutex is not locked by the calling task.
        NotOwner,
        /// The mutex is locked recursively.
        BadParam,
        Interrupted,
    }
}

define_error! {
    mod wait_condition_variable_timeout_error {}
    /// Error type for
    /// [`ConditionVariable::wait_until`](crate::condvar::ConditionVariable::wait_until).
    pub enum WaitConditionVariableTimeoutError:
        BadContextError, WaitTimeoutError, WaitConditionVariableError
    {
        BadContext,
        NotOwner,
        BadParam,
        Interrupted,
        Timeout,
    }
}

define_error! {
    mod notify_condition_variable_error {}
    /// Error type for
    /// [`ConditionVariable::notify_one`](crate::condvar::ConditionVariable::notify_one).
    pub enum NotifyConditionVariableError: BadContextError {
        BadContext,
    }
}

define_error! {
    mod push_queue_error {}
    /// Error type for [`Queue::push`](crate::queue::Queue::push).
    pub enum PushQueueError: BadContextError, WaitSemaphoreError {
        BadContext,
        Interrupted,
    }
}

define_error! {
    mod try_push_queue_error {}
    /// Error type for [`Queue::try_push`](crate::queue::Queue::try_push).
    pub enum TryPushQueueError: BadContextError, PollSemaphoreError {
        BadContext,
        Busy,
    }
}

define_error! {
    mod push_queue_timeout_error {}
    /// Error type for [`Queue::push_until`](crate::queue::Queue::push_until).
    pub enum PushQueueTimeoutError: BadContextError, WaitSemaphoreTimeoutError {
        BadContext,
        Interrupted,
        Timeout,
    }
}

define_error! {
    mod pop_queue_error {}
    /// Error type for [`Queue::pop`](crate::queue::Queue::pop).
    pub enum PopQueueError: BadContextError, WaitSemaphoreError {
        BadContext,
        Interrupted,
    }
}

define_error! {
    mod try_pop_queue_error {}
    /// Error type for [`Queue::try_pop`](crate::queue::Queue::try_pop).
    pub enum TryPopQueueError: BadContextError, PollSemaphoreError {
        BadContext,
        Busy,
    }
}

define_error! {
    mod pop_queue_timeout_error {}
    /// Error type for [`Queue::pop_until`](crate::queue::Queue::pop_until).
    pub enum PopQueueTimeoutError: BadContextError, WaitSemaphoreTimeoutError {
        BadContext,
        Interrupted,
        Timeout,
    }
}

define_error! {
    mod generate_signal_error {}
    /// Error type for
    /// [`Task::generate_signal`](crate::task::Task::generate_signal).
    pub enum GenerateSignalError: BadContextError {
        BadContext,
        /// The signal number is out of range.
        BadParam,
        /// The task was created without signal reception.
        NotSupported,
    }
}

define_error! {
    mod queue_signal_error {}
    /// Error type for
    /// [`Task::queue_signal`](crate::task::Task::queue_signal).
    pub enum QueueSignalError: BadContextError, GenerateSignalError {
        BadContext,
        BadParam,
        NotSupported,
        /// The queued-signal buffer is full.
        ResourceLimit,
    }
}

define_error! {
    mod accept_signals_error {}
    /// Error type for
    /// [`System::accept_signals`](crate::System::accept_signals).
    pub enum AcceptSignalsError: BadContextError {
        BadContext,
        NotSupported,
    }
}

define_error! {
    mod pending_signals_error {}
    /// Error type for
    /// [`Task::pending_signals`](crate::task::Task::pending_signals).
    pub enum PendingSignalsError: BadContextError {
        BadContext,
        NotSupported,
    }
}

define_error! {
    mod wait_signals_error {}
    /// Error type for [`System::wait_signals`](crate::System::wait_signals).
    pub enum WaitSignalsError: BadContextError, WaitError {
        BadContext,
        NotSupported,
        Interrupted,
    }
}

define_error! {
    mod wait_signals_timeout_error {}
    /// Error type for
    /// [`System::wait_signals_until`](crate::System::wait_signals_until).
    pub enum WaitSignalsTimeoutError: BadContextError, WaitTimeoutError, WaitSignalsError {
        BadContext,
        NotSupported,
        Interrupted,
        Timeout,
    }
}

define_error! {
    mod start_timer_error {}
    /// Error type for [`Timer::start`](crate::timer::Timer::start).
    pub enum StartTimerError: BadContextError {
        BadContext,
    }
}

define_error! {
    mod stop_timer_error {}
    /// Error type for [`Timer::stop`](crate::timer::Timer::stop).
    pub enum StopTimerError: BadContextError {
        BadContext,
    }
}
