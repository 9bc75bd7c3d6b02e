//! Static configuration mechanism for the kernel.
//!
//! [`build_system!`] attaches a configuration to a kernel-trait type: it
//! instantiates the static control-block pools, implements [`KernelCfg1`]
//! and [`KernelCfg2`], and defines a typed handle constant for every
//! declared kernel object.
//!
//! [`KernelCfg1`]: crate::KernelCfg1
//! [`KernelCfg2`]: crate::KernelCfg2

/// Count the identifiers given as arguments.
#[doc(hidden)]
#[macro_export]
macro_rules! __count {
    () => { 0usize };
    ($head:ident $($rest:ident)*) => { 1usize + $crate::__count!($($rest)*) };
}

/// Define a handle constant for each named object, with sequentially
/// assigned IDs.
#[doc(hidden)]
#[macro_export]
macro_rules! __define_handles {
    ($Traits:ty, $Handle:ident, $index:expr,) => {};
    ($Traits:ty, $Handle:ident, $index:expr, $name:ident $($rest:ident)*) => {
        pub const $name: $crate::$Handle<$Traits> = $crate::$Handle::from_id(
            match ::core::num::NonZeroUsize::new($index + 1) {
                ::core::option::Option::Some(id) => id,
                ::core::option::Option::None => ::core::unreachable!(),
            },
        );
        $crate::__define_handles!($Traits, $Handle, $index + 1usize, $($rest)*);
    };
}

/// Attach a configuration to a kernel-trait type.
///
/// The macro defines, at the invocation scope, one handle constant per
/// declared object (e.g., `const PRODUCER: Task<SystemTraits>`), the static
/// control-block pools, and the [`KernelCfg1`]/[`KernelCfg2`]
/// implementations for the kernel-trait type. Only one system may be built
/// per module.
///
/// [`KernelCfg1`]: crate::KernelCfg1
/// [`KernelCfg2`]: crate::KernelCfg2
///
/// # Example
///
/// ```ignore
/// use tern_kernel::{SchedulingPolicy, TickDuration};
///
/// tern_port_std::use_port!(unsafe struct SystemTraits);
///
/// fn producer_body(_: usize) { /* … */ }
/// fn consumer_body(_: usize) { /* … */ }
///
/// tern_kernel::build_system! {
///     impl KernelSystem for SystemTraits {
///         round_robin_quantum: 10,
///         max_recursive_locks: 255,
///         tasks: {
///             PRODUCER = {
///                 entry: producer_body, param: 0, priority: 3,
///                 stack_size: 4096, policy: Fifo, flags: AUTO_START,
///             },
///             CONSUMER = {
///                 entry: consumer_body, param: 0, priority: 2,
///                 stack_size: 4096, policy: Fifo, flags:,
///             },
///         },
///         semaphores: {
///             ITEMS = { initial: 0, max: usize::MAX },
///         },
///         mutexes: {
///             LOCK = { kind: Normal, protocol: PriorityInheritance, ceiling: 0 },
///         },
///         condvars: { ITEMS_AVAILABLE },
///         queues: {
///             MAILBOX = { capacity: 4, discipline: Priority },
///         },
///         timers: {},
///     }
/// }
/// ```
#[macro_export]
macro_rules! build_system {
    (
        $( #[$meta:meta] )*
        impl KernelSystem for $Traits:ty {
            round_robin_quantum: $quantum:expr,
            max_recursive_locks: $recursive_max:expr,
            tasks: {
                $( $task_name:ident = {
                    entry: $entry:path, param: $param:expr, priority: $task_priority:expr,
                    stack_size: $stack_size:expr, policy: $policy:ident,
                    flags: $( $flag:ident )|*,
                } ),* $(,)?
            },
            semaphores: {
                $( $sem_name:ident = { initial: $sem_init:expr, max: $sem_max:expr } ),* $(,)?
            },
            mutexes: {
                $( $mtx_name:ident = {
                    kind: $mtx_kind:ident, protocol: $mtx_protocol:ident, ceiling: $ceiling:expr
                } ),* $(,)?
            },
            condvars: { $( $cv_name:ident ),* $(,)? },
            queues: {
                $( $queue_name:ident = { capacity: $capacity:expr, discipline: $discipline:ident } ),* $(,)?
            },
            timers: {
                $( $timer_name:ident = {
                    callback: $timer_cb:path, param: $timer_param:expr,
                    delay: $timer_delay:expr, period: $timer_period:expr
                } ),* $(,)?
            } $(,)?
        }
    ) => {
        static __TERN_TASK_CB_POOL:
            [$crate::TaskCb<$Traits>; { $crate::__count!($($task_name)*) }] = [
            $(
                $crate::TaskCb::new($crate::TaskAttr {
                    entry_point: $entry,
                    entry_param: $param,
                    stack: {
                        static STORAGE: $crate::StackStorage<{ $stack_size }> =
                            $crate::StackStorage::new();
                        $crate::Stack::new(STORAGE.as_ptr(), $stack_size, 0)
                    },
                    priority: $task_priority,
                    policy: $crate::SchedulingPolicy::$policy,
                    flags: $crate::TaskAttrFlags::from_bits_truncate(
                        0 $( | $crate::TaskAttrFlags::$flag.bits() )*
                    ),
                }),
            )*
        ];

        static __TERN_SEMAPHORE_CB_POOL:
            [$crate::SemaphoreCb<$Traits>; { $crate::__count!($($sem_name)*) }] = [
            $(
                $crate::SemaphoreCb::new($sem_init, $sem_max),
            )*
        ];

        static __TERN_MUTEX_CB_POOL:
            [$crate::MutexCb<$Traits>; { $crate::__count!($($mtx_name)*) }] = [
            $(
                $crate::MutexCb::new(
                    $crate::MutexKind::$mtx_kind,
                    $crate::MutexProtocol::$mtx_protocol,
                    $ceiling,
                ),
            )*
        ];

        static __TERN_CONDVAR_CB_POOL:
            [$crate::ConditionVariableCb<$Traits>; { $crate::__count!($($cv_name)*) }] = [
            $(
                {
                    // Bind the repetition variable without emitting anything
                    let _ = stringify!($cv_name);
                    $crate::ConditionVariableCb::new()
                },
            )*
        ];

        static __TERN_QUEUE_CB_POOL:
            [$crate::QueueCb<$Traits>; { $crate::__count!($($queue_name)*) }] = [
            $(
                $crate::QueueCb::new(
                    {
                        static SLOTS: [$crate::QueueSlotCb<$Traits>; { $capacity }] =
                            [const { $crate::QueueSlotCb::new() }; $capacity];
                        &SLOTS
                    },
                    $crate::QueueDiscipline::$discipline,
                ),
            )*
        ];

        static __TERN_TIMER_CB_POOL:
            [$crate::TimerCb<$Traits>; { $crate::__count!($($timer_name)*) }] = [
            $(
                $crate::TimerCb::new($crate::TimerAttr {
                    entry_point: $timer_cb,
                    entry_param: $timer_param,
                    init_delay: $timer_delay,
                    init_period: $timer_period,
                }),
            )*
        ];

        $( #[$meta] )*
        // Safety: The control-block pools and the kernel state defined
        // above are well-formed and private to this kernel instance.
        unsafe impl $crate::KernelCfg1 for $Traits {
            const ROUND_ROBIN_QUANTUM: u32 = $quantum;
            const MAX_RECURSIVE_LOCKS: u16 = $recursive_max;
        }

        // Safety: Ditto.
        unsafe impl $crate::KernelCfg2 for $Traits {
            fn state() -> &'static $crate::State<Self> {
                static STATE: $crate::State<$Traits> = $crate::State::new();
                &STATE
            }

            fn task_cb_pool() -> &'static [$crate::TaskCb<Self>] {
                &__TERN_TASK_CB_POOL
            }

            fn semaphore_cb_pool() -> &'static [$crate::SemaphoreCb<Self>] {
                &__TERN_SEMAPHORE_CB_POOL
            }

            fn mutex_cb_pool() -> &'static [$crate::MutexCb<Self>] {
                &__TERN_MUTEX_CB_POOL
            }

            fn condvar_cb_pool() -> &'static [$crate::ConditionVariableCb<Self>] {
                &__TERN_CONDVAR_CB_POOL
            }

            fn queue_cb_pool() -> &'static [$crate::QueueCb<Self>] {
                &__TERN_QUEUE_CB_POOL
            }

            fn timer_cb_pool() -> &'static [$crate::TimerCb<Self>] {
                &__TERN_TIMER_CB_POOL
            }
        }

        $crate::__define_handles!($Traits, Task, 0usize, $($task_name)*);
        $crate::__define_handles!($Traits, Semaphore, 0usize, $($sem_name)*);
        $crate::__define_handles!($Traits, Mutex, 0usize, $($mtx_name)*);
        $crate::__define_handles!($Traits, ConditionVariable, 0usize, $($cv_name)*);
        $crate::__define_handles!($Traits, Queue, 0usize, $($queue_name)*);
        $crate::__define_handles!($Traits, Timer, 0usize, $($timer_name)*);
    };
}
