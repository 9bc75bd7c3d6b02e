//! Property tests of the scheduler invariants and the supplemental
//! features, run against the simulated kernel.
//!
//! See `kernel_tests.rs` for the structure of a test module.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// FIFO within a priority band: of two equal-priority tasks, the one made
/// runnable first runs first.
mod fifo_within_band {
    use super::*;

    tern_port_std::use_port!(unsafe struct SystemTraits);

    static ORDER: AtomicUsize = AtomicUsize::new(0);
    static FIRST_RAN: AtomicUsize = AtomicUsize::new(0);
    static SECOND_RAN: AtomicUsize = AtomicUsize::new(0);

    fn starter_body(_: usize) {
        // Both tasks become runnable while we (priority 5) outrank them
        TASK_A.start().unwrap();
        TASK_B.start().unwrap();

        TASK_A.join().unwrap();
        TASK_B.join().unwrap();

        let a = FIRST_RAN.load(Ordering::SeqCst);
        let b = SECOND_RAN.load(Ordering::SeqCst);
        assert!(a != 0 && b != 0);
        assert!(a < b, "A (seq {a}) should run before B (seq {b})");

        tern_port_std::shutdown::<SystemTraits>();
    }

    fn a_body(_: usize) {
        FIRST_RAN.store(ORDER.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
    }

    fn b_body(_: usize) {
        SECOND_RAN.store(ORDER.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
    }

    tern_kernel::build_system! {
        impl KernelSystem for SystemTraits {
            round_robin_quantum: 10,
            max_recursive_locks: 255,
            tasks: {
                STARTER = {
                    entry: starter_body, param: 0, priority: 5, stack_size: 4096,
                    policy: Fifo, flags: AUTO_START,
                },
                TASK_A = {
                    entry: a_body, param: 0, priority: 2, stack_size: 4096,
                    policy: Fifo, flags:,
                },
                TASK_B = {
                    entry: b_body, param: 0, priority: 2, stack_size: 4096,
                    policy: Fifo, flags:,
                },
            },
            semaphores: {},
            mutexes: {},
            condvars: {},
            queues: {},
            timers: {},
        }
    }

    #[test]
    fn run() {
        init_logger();
        tern_port_std::boot::<SystemTraits>();
    }
}

/// Round-robin fairness: two compute-bound round-robin tasks of equal
/// priority both make progress.
mod round_robin_fairness {
    use super::*;

    tern_port_std::use_port!(unsafe struct SystemTraits);

    static STOP: AtomicBool = AtomicBool::new(false);
    static COUNT_A: AtomicUsize = AtomicUsize::new(0);
    static COUNT_B: AtomicUsize = AtomicUsize::new(0);

    fn spin_body(param: usize) {
        let counter = if param == 0 { &COUNT_A } else { &COUNT_B };
        while !STOP.load(Ordering::SeqCst) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn supervisor_body(_: usize) {
        use tern_kernel::{System, TickDuration};

        TASK_A.start().unwrap();
        TASK_B.start().unwrap();

        // Let the spinners share the processor for a while
        System::<SystemTraits>::sleep(TickDuration::from_ticks(40)).unwrap();
        STOP.store(true, Ordering::SeqCst);

        TASK_A.join().unwrap();
        TASK_B.join().unwrap();

        let a = COUNT_A.load(Ordering::Relaxed);
        let b = COUNT_B.load(Ordering::Relaxed);
        assert!(a > 0, "task A was starved");
        assert!(b > 0, "task B was starved");

        tern_port_std::shutdown::<SystemTraits>();
    }

    tern_kernel::build_system! {
        impl KernelSystem for SystemTraits {
            round_robin_quantum: 4,
            max_recursive_locks: 255,
            tasks: {
                SUPERVISOR = {
                    entry: supervisor_body, param: 0, priority: 5, stack_size: 4096,
                    policy: Fifo, flags: AUTO_START,
                },
                TASK_A = {
                    entry: spin_body, param: 0, priority: 2, stack_size: 4096,
                    policy: RoundRobin, flags:,
                },
                TASK_B = {
                    entry: spin_body, param: 1, priority: 2, stack_size: 4096,
                    policy: RoundRobin, flags:,
                },
            },
            semaphores: {},
            mutexes: {},
            condvars: {},
            queues: {},
            timers: {},
        }
    }

    #[test]
    fn run() {
        init_logger();
        tern_port_std::boot::<SystemTraits>();
    }
}

/// Priority protect: the owner runs at the ceiling, and a too-privileged
/// task is refused the lock.
mod priority_protect {
    use super::*;
    use tern_kernel::{error::LockMutexError, System};

    tern_port_std::use_port!(unsafe struct SystemTraits);

    type Sys = System<SystemTraits>;

    static LOW_DONE: AtomicBool = AtomicBool::new(false);

    fn low_body(_: usize) {
        let me = Sys::current_task().unwrap();
        assert_eq!(me.effective_priority().unwrap(), 3);

        MTX.lock().unwrap();
        assert_eq!(me.effective_priority().unwrap(), 5);
        assert_eq!(me.priority().unwrap(), 3);
        MTX.unlock().unwrap();

        assert_eq!(me.effective_priority().unwrap(), 3);
        LOW_DONE.store(true, Ordering::SeqCst);
    }

    fn high_body(_: usize) {
        // Locking a mutex whose ceiling is below our priority is refused
        assert_eq!(MTX.lock(), Err(LockMutexError::BadParam));

        LOW.start().unwrap();
        LOW.join().unwrap();
        assert!(LOW_DONE.load(Ordering::SeqCst));

        tern_port_std::shutdown::<SystemTraits>();
    }

    tern_kernel::build_system! {
        impl KernelSystem for SystemTraits {
            round_robin_quantum: 10,
            max_recursive_locks: 255,
            tasks: {
                HIGH = {
                    entry: high_body, param: 0, priority: 6, stack_size: 4096,
                    policy: Fifo, flags: AUTO_START,
                },
                LOW = {
                    entry: low_body, param: 0, priority: 3, stack_size: 4096,
                    policy: Fifo, flags:,
                },
            },
            semaphores: {},
            mutexes: {
                MTX = { kind: Normal, protocol: PriorityProtect, ceiling: 5 },
            },
            condvars: {},
            queues: {},
            timers: {},
        }
    }

    #[test]
    fn run() {
        init_logger();
        tern_port_std::boot::<SystemTraits>();
    }
}

/// Tick monotonicity and the sleep lower bound.
mod time_properties {
    use super::*;
    use tern_kernel::{System, TickDuration};

    tern_port_std::use_port!(unsafe struct SystemTraits);

    type Sys = System<SystemTraits>;

    fn main_body(_: usize) {
        // Monotonicity
        let mut last = Sys::time().unwrap();
        for _ in 0..50 {
            let now = Sys::time().unwrap();
            assert!(now >= last);
            last = now;
        }

        // Sleep lower bound: `sleep(d)` returns at `start + d + 1` or later
        for &d in &[0u64, 1, 3, 7] {
            let start = Sys::time().unwrap();
            Sys::sleep(TickDuration::from_ticks(d)).unwrap();
            let elapsed = (Sys::time().unwrap() - start).as_ticks();
            assert!(elapsed >= d + 1, "slept {elapsed} ticks, wanted > {d}");
        }

        tern_port_std::shutdown::<SystemTraits>();
    }

    tern_kernel::build_system! {
        impl KernelSystem for SystemTraits {
            round_robin_quantum: 10,
            max_recursive_locks: 255,
            tasks: {
                MAIN = {
                    entry: main_body, param: 0, priority: 1, stack_size: 4096,
                    policy: Fifo, flags: AUTO_START,
                },
            },
            semaphores: {},
            mutexes: {},
            condvars: {},
            queues: {},
            timers: {},
        }
    }

    #[test]
    fn run() {
        init_logger();
        tern_port_std::boot::<SystemTraits>();
    }
}

/// Semaphore round trip: a post immediately satisfies a wait, and the
/// value is conserved across balanced sequences.
mod semaphore_roundtrip {
    use super::*;

    tern_port_std::use_port!(unsafe struct SystemTraits);

    fn main_body(_: usize) {
        assert_eq!(SEM.value(), Ok(2));

        SEM.post().unwrap();
        assert_eq!(SEM.value(), Ok(3));
        SEM.wait().unwrap();
        assert_eq!(SEM.value(), Ok(2));

        for _ in 0..10 {
            SEM.wait().unwrap();
            SEM.post().unwrap();
        }
        assert_eq!(SEM.value(), Ok(2));

        // The maximum value is enforced
        SEM.post().unwrap();
        SEM.post().unwrap();
        assert_eq!(
            SEM.post(),
            Err(tern_kernel::error::SignalSemaphoreError::Overflow)
        );

        tern_port_std::shutdown::<SystemTraits>();
    }

    tern_kernel::build_system! {
        impl KernelSystem for SystemTraits {
            round_robin_quantum: 10,
            max_recursive_locks: 255,
            tasks: {
                MAIN = {
                    entry: main_body, param: 0, priority: 1, stack_size: 4096,
                    policy: Fifo, flags: AUTO_START,
                },
            },
            semaphores: {
                SEM = { initial: 2, max: 4 },
            },
            mutexes: {},
            condvars: {},
            queues: {},
            timers: {},
        }
    }

    #[test]
    fn run() {
        init_logger();
        tern_port_std::boot::<SystemTraits>();
    }
}

/// Join ordering: `join` returns only after the target reaches
/// `Terminated`; a self-join is refused.
mod join_ordering {
    use super::*;
    use tern_kernel::{error::JoinTaskError, System, ThreadState, TickDuration};

    tern_port_std::use_port!(unsafe struct SystemTraits);

    type Sys = System<SystemTraits>;

    static WORKER_DONE: AtomicBool = AtomicBool::new(false);

    fn worker_body(_: usize) {
        Sys::sleep(TickDuration::from_ticks(3)).unwrap();
        WORKER_DONE.store(true, Ordering::SeqCst);
    }

    fn main_body(_: usize) {
        assert_eq!(
            Sys::current_task().unwrap().join(),
            Err(JoinTaskError::WouldDeadlock)
        );
        // Joining a never-started task is refused
        assert_eq!(WORKER.join(), Err(JoinTaskError::BadParam));

        WORKER.start().unwrap();
        WORKER.join().unwrap();

        assert!(WORKER_DONE.load(Ordering::SeqCst));
        assert_eq!(WORKER.state().unwrap(), ThreadState::Terminated);

        // A second join of a terminated task returns immediately
        WORKER.join().unwrap();

        tern_port_std::shutdown::<SystemTraits>();
    }

    tern_kernel::build_system! {
        impl KernelSystem for SystemTraits {
            round_robin_quantum: 10,
            max_recursive_locks: 255,
            tasks: {
                MAIN = {
                    entry: main_body, param: 0, priority: 2, stack_size: 4096,
                    policy: Fifo, flags: AUTO_START,
                },
                WORKER = {
                    entry: worker_body, param: 0, priority: 3, stack_size: 4096,
                    policy: Fifo, flags:,
                },
            },
            semaphores: {},
            mutexes: {},
            condvars: {},
            queues: {},
            timers: {},
        }
    }

    #[test]
    fn run() {
        init_logger();
        tern_port_std::boot::<SystemTraits>();
    }
}

/// Suspend and resume, including the error paths.
mod suspend_resume {
    use super::*;
    use tern_kernel::{error::ResumeTaskError, System, ThreadState, TickDuration};

    tern_port_std::use_port!(unsafe struct SystemTraits);

    type Sys = System<SystemTraits>;

    static WORKER_PROGRESS: AtomicUsize = AtomicUsize::new(0);

    fn worker_body(_: usize) {
        WORKER_PROGRESS.fetch_add(1, Ordering::SeqCst);

        // Self-suspend; the controller resumes us
        Sys::current_task().unwrap().suspend().unwrap();

        WORKER_PROGRESS.fetch_add(1, Ordering::SeqCst);
    }

    fn main_body(_: usize) {
        // Resuming a task that is not suspended is refused
        assert_eq!(WORKER.resume(), Err(ResumeTaskError::BadParam));

        WORKER.start().unwrap();

        // The worker (lower priority) hasn't run yet; suspend it while
        // it's Ready
        WORKER.suspend().unwrap();
        assert_eq!(WORKER.state().unwrap(), ThreadState::Suspended);
        Sys::sleep(TickDuration::from_ticks(2)).unwrap();
        assert_eq!(WORKER_PROGRESS.load(Ordering::SeqCst), 0);

        // Let it run up to the self-suspend
        WORKER.resume().unwrap();
        Sys::sleep(TickDuration::from_ticks(2)).unwrap();
        assert_eq!(WORKER_PROGRESS.load(Ordering::SeqCst), 1);
        assert_eq!(WORKER.state().unwrap(), ThreadState::Suspended);

        WORKER.resume().unwrap();
        WORKER.join().unwrap();
        assert_eq!(WORKER_PROGRESS.load(Ordering::SeqCst), 2);

        tern_port_std::shutdown::<SystemTraits>();
    }

    tern_kernel::build_system! {
        impl KernelSystem for SystemTraits {
            round_robin_quantum: 10,
            max_recursive_locks: 255,
            tasks: {
                MAIN = {
                    entry: main_body, param: 0, priority: 4, stack_size: 4096,
                    policy: Fifo, flags: AUTO_START,
                },
                WORKER = {
                    entry: worker_body, param: 0, priority: 2, stack_size: 4096,
                    policy: Fifo, flags:,
                },
            },
            semaphores: {},
            mutexes: {},
            condvars: {},
            queues: {},
            timers: {},
        }
    }

    #[test]
    fn run() {
        init_logger();
        tern_port_std::boot::<SystemTraits>();
    }
}

/// `set_priority`: both reinsertion behaviors, selected by the
/// `always_behind` flag.
mod set_priority_reinsertion {
    use super::*;
    use tern_kernel::{System, TickDuration};

    tern_port_std::use_port!(unsafe struct SystemTraits);

    type Sys = System<SystemTraits>;

    static ORDER: AtomicUsize = AtomicUsize::new(0);
    static X_RAN: AtomicUsize = AtomicUsize::new(0);
    static Y_RAN: AtomicUsize = AtomicUsize::new(0);

    fn x_body(_: usize) {
        X_RAN.store(ORDER.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
    }

    fn y_body(_: usize) {
        Y_RAN.store(ORDER.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
    }

    fn main_body(_: usize) {
        // Y enters priority band 3 first; X joins the band afterwards by a
        // priority change with `always_behind == false`, which puts it at
        // the *head* of the band.
        TASK_Y.start().unwrap();
        TASK_X.start().unwrap();
        TASK_X.set_priority(3, false).unwrap();

        Sys::sleep(TickDuration::from_ticks(3)).unwrap();

        let x = X_RAN.load(Ordering::SeqCst);
        let y = Y_RAN.load(Ordering::SeqCst);
        assert!(x != 0 && y != 0);
        assert!(x < y, "X (seq {x}) was reinserted at the band head and should run first");

        tern_port_std::shutdown::<SystemTraits>();
    }

    tern_kernel::build_system! {
        impl KernelSystem for SystemTraits {
            round_robin_quantum: 10,
            max_recursive_locks: 255,
            tasks: {
                MAIN = {
                    entry: main_body, param: 0, priority: 5, stack_size: 4096,
                    policy: Fifo, flags: AUTO_START,
                },
                TASK_X = {
                    entry: x_body, param: 0, priority: 2, stack_size: 4096,
                    policy: Fifo, flags:,
                },
                TASK_Y = {
                    entry: y_body, param: 0, priority: 3, stack_size: 4096,
                    policy: Fifo, flags:,
                },
            },
            semaphores: {},
            mutexes: {},
            condvars: {},
            queues: {},
            timers: {},
        }
    }

    #[test]
    fn run() {
        init_logger();
        tern_port_std::boot::<SystemTraits>();
    }
}

/// The tail-insertion variant of the previous test.
mod set_priority_always_behind {
    use super::*;
    use tern_kernel::{System, TickDuration};

    tern_port_std::use_port!(unsafe struct SystemTraits);

    type Sys = System<SystemTraits>;

    static ORDER: AtomicUsize = AtomicUsize::new(0);
    static X_RAN: AtomicUsize = AtomicUsize::new(0);
    static Y_RAN: AtomicUsize = AtomicUsize::new(0);

    fn x_body(_: usize) {
        X_RAN.store(ORDER.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
    }

    fn y_body(_: usize) {
        Y_RAN.store(ORDER.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
    }

    fn main_body(_: usize) {
        TASK_Y.start().unwrap();
        TASK_X.start().unwrap();
        TASK_X.set_priority(3, true).unwrap();

        Sys::sleep(TickDuration::from_ticks(3)).unwrap();

        let x = X_RAN.load(Ordering::SeqCst);
        let y = Y_RAN.load(Ordering::SeqCst);
        assert!(x != 0 && y != 0);
        assert!(y < x, "X (seq {x}) was reinserted at the band tail and should run last");

        tern_port_std::shutdown::<SystemTraits>();
    }

    tern_kernel::build_system! {
        impl KernelSystem for SystemTraits {
            round_robin_quantum: 10,
            max_recursive_locks: 255,
            tasks: {
                MAIN = {
                    entry: main_body, param: 0, priority: 5, stack_size: 4096,
                    policy: Fifo, flags: AUTO_START,
                },
                TASK_X = {
                    entry: x_body, param: 0, priority: 2, stack_size: 4096,
                    policy: Fifo, flags:,
                },
                TASK_Y = {
                    entry: y_body, param: 0, priority: 3, stack_size: 4096,
                    policy: Fifo, flags:,
                },
            },
            semaphores: {},
            mutexes: {},
            condvars: {},
            queues: {},
            timers: {},
        }
    }

    #[test]
    fn run() {
        init_logger();
        tern_port_std::boot::<SystemTraits>();
    }
}

/// `Task::interrupt` aborts an interruptible wait with `Interrupted`.
mod interrupt_wait {
    use super::*;
    use tern_kernel::{error::SleepError, System, TickDuration};

    tern_port_std::use_port!(unsafe struct SystemTraits);

    type Sys = System<SystemTraits>;

    static SLEEPER_RESULT: AtomicUsize = AtomicUsize::new(0);

    fn sleeper_body(_: usize) {
        let started = Sys::time().unwrap();
        match Sys::sleep(TickDuration::from_ticks(1000)) {
            Err(SleepError::Interrupted) => {
                // Interrupted long before the deadline
                assert!((Sys::time().unwrap() - started).as_ticks() < 500);
                SLEEPER_RESULT.store(1, Ordering::SeqCst);
            }
            other => panic!("unexpected sleep result: {other:?}"),
        }
    }

    fn main_body(_: usize) {
        SLEEPER.start().unwrap();
        Sys::sleep(TickDuration::from_ticks(2)).unwrap();

        SLEEPER.interrupt().unwrap();
        SLEEPER.join().unwrap();
        assert_eq!(SLEEPER_RESULT.load(Ordering::SeqCst), 1);

        // The task is not waiting anymore
        assert_eq!(
            SLEEPER.interrupt(),
            Err(tern_kernel::error::InterruptTaskError::BadParam)
        );

        tern_port_std::shutdown::<SystemTraits>();
    }

    tern_kernel::build_system! {
        impl KernelSystem for SystemTraits {
            round_robin_quantum: 10,
            max_recursive_locks: 255,
            tasks: {
                MAIN = {
                    entry: main_body, param: 0, priority: 2, stack_size: 4096,
                    policy: Fifo, flags: AUTO_START,
                },
                SLEEPER = {
                    entry: sleeper_body, param: 0, priority: 3, stack_size: 4096,
                    policy: Fifo, flags:,
                },
            },
            semaphores: {},
            mutexes: {},
            condvars: {},
            queues: {},
            timers: {},
        }
    }

    #[test]
    fn run() {
        init_logger();
        tern_port_std::boot::<SystemTraits>();
    }
}

/// Signal generation, queueing, masking, and the wait operations.
mod signals {
    use super::*;
    use tern_kernel::{
        error::{WaitSemaphoreError, WaitSignalsTimeoutError},
        SignalSet, System, TickDuration,
    };

    tern_port_std::use_port!(unsafe struct SystemTraits);

    type Sys = System<SystemTraits>;

    static PHASE: AtomicUsize = AtomicUsize::new(0);

    fn receiver_body(_: usize) {
        Sys::accept_signals(SignalSet::with(3).union(SignalSet::with(5))).unwrap();
        PHASE.store(1, Ordering::SeqCst);

        // Plain signal
        let info = Sys::wait_signals(SignalSet::with(5)).unwrap();
        assert_eq!((info.signo, info.value), (5, None));

        // Queued signal carries a value
        let info = Sys::wait_signals(SignalSet::with(3)).unwrap();
        assert_eq!((info.signo, info.value), (3, Some(42)));

        // Timed wait expires
        assert_eq!(
            Sys::wait_signals_for(SignalSet::with(5), TickDuration::from_ticks(3)),
            Err(WaitSignalsTimeoutError::Timeout)
        );
        PHASE.store(2, Ordering::SeqCst);

        // A signal delivery aborts a semaphore wait
        assert_eq!(SEM.wait(), Err(WaitSemaphoreError::Interrupted));
        PHASE.store(3, Ordering::SeqCst);
    }

    fn main_body(_: usize) {
        RECEIVER.start().unwrap();
        while PHASE.load(Ordering::SeqCst) < 1 {
            Sys::sleep(TickDuration::from_ticks(1)).unwrap();
        }
        Sys::sleep(TickDuration::from_ticks(2)).unwrap();

        // A non-accepted signal is discarded
        RECEIVER.generate_signal(7).unwrap();

        RECEIVER.generate_signal(5).unwrap();
        RECEIVER.queue_signal(3, 42).unwrap();

        while PHASE.load(Ordering::SeqCst) < 2 {
            Sys::sleep(TickDuration::from_ticks(1)).unwrap();
        }

        // Give the receiver time to block on the semaphore, then abort the
        // wait with a signal
        Sys::sleep(TickDuration::from_ticks(3)).unwrap();
        RECEIVER.generate_signal(3).unwrap();

        RECEIVER.join().unwrap();
        assert_eq!(PHASE.load(Ordering::SeqCst), 3);

        // This task was created without signal reception
        assert_eq!(
            Sys::current_task().unwrap().generate_signal(3),
            Err(tern_kernel::error::GenerateSignalError::NotSupported)
        );

        tern_port_std::shutdown::<SystemTraits>();
    }

    tern_kernel::build_system! {
        impl KernelSystem for SystemTraits {
            round_robin_quantum: 10,
            max_recursive_locks: 255,
            tasks: {
                MAIN = {
                    entry: main_body, param: 0, priority: 2, stack_size: 4096,
                    policy: Fifo, flags: AUTO_START,
                },
                RECEIVER = {
                    entry: receiver_body, param: 0, priority: 3, stack_size: 4096,
                    policy: Fifo, flags: RECEIVE_SIGNALS,
                },
            },
            semaphores: {
                SEM = { initial: 0, max: usize::MAX },
            },
            mutexes: {},
            condvars: {},
            queues: {},
            timers: {},
        }
    }

    #[test]
    fn run() {
        init_logger();
        tern_port_std::boot::<SystemTraits>();
    }
}

/// The queued-signal buffer enforces its exact bound.
mod signal_queue_bound {
    use super::*;
    use tern_kernel::{error::QueueSignalError, SignalSet, System, MAX_QUEUED_SIGNALS};

    tern_port_std::use_port!(unsafe struct SystemTraits);

    type Sys = System<SystemTraits>;

    static READY: AtomicBool = AtomicBool::new(false);

    fn receiver_body(_: usize) {
        Sys::accept_signals(SignalSet::with(1)).unwrap();
        READY.store(true, Ordering::SeqCst);

        // Stay alive (suspended) while the sender probes the bound
        Sys::current_task().unwrap().suspend().unwrap();

        // Drain one queued value per wait
        for i in 0..MAX_QUEUED_SIGNALS {
            let info = Sys::wait_signals(SignalSet::with(1)).unwrap();
            assert_eq!(info.signo, 1);
            assert_eq!(info.value, Some(i));
        }
    }

    fn main_body(_: usize) {
        use tern_kernel::TickDuration;

        RECEIVER.start().unwrap();
        while !READY.load(Ordering::SeqCst) {
            Sys::sleep(TickDuration::from_ticks(1)).unwrap();
        }
        Sys::sleep(TickDuration::from_ticks(2)).unwrap();

        for i in 0..MAX_QUEUED_SIGNALS {
            RECEIVER.queue_signal(1, i).unwrap();
        }
        assert_eq!(
            RECEIVER.queue_signal(1, 99),
            Err(QueueSignalError::ResourceLimit)
        );

        RECEIVER.resume().unwrap();
        RECEIVER.join().unwrap();

        tern_port_std::shutdown::<SystemTraits>();
    }

    tern_kernel::build_system! {
        impl KernelSystem for SystemTraits {
            round_robin_quantum: 10,
            max_recursive_locks: 255,
            tasks: {
                MAIN = {
                    entry: main_body, param: 0, priority: 2, stack_size: 4096,
                    policy: Fifo, flags: AUTO_START,
                },
                RECEIVER = {
                    entry: receiver_body, param: 0, priority: 3, stack_size: 4096,
                    policy: Fifo, flags: RECEIVE_SIGNALS,
                },
            },
            semaphores: {},
            mutexes: {},
            condvars: {},
            queues: {},
            timers: {},
        }
    }

    #[test]
    fn run() {
        init_logger();
        tern_port_std::boot::<SystemTraits>();
    }
}

/// Mutex kinds: error checking, and the documented treatment of a
/// `Normal` self-relock.
mod mutex_kinds {
    use super::*;
    use tern_kernel::error::{LockMutexError, TryLockMutexError, UnlockMutexError};

    tern_port_std::use_port!(unsafe struct SystemTraits);

    fn helper_body(_: usize) {
        // Unlocking a mutex owned by another task is refused
        assert_eq!(EC_MTX.unlock(), Err(UnlockMutexError::NotOwner));
    }

    fn main_body(_: usize) {
        // Error-checking: a relock by the owner is reported
        EC_MTX.lock().unwrap();
        assert_eq!(EC_MTX.lock(), Err(LockMutexError::WouldDeadlock));
        assert_eq!(EC_MTX.try_lock(), Err(TryLockMutexError::WouldDeadlock));

        HELPER.start().unwrap();
        HELPER.join().unwrap();

        EC_MTX.unlock().unwrap();

        // A `Normal` self-relock reports the deadlock instead of hanging
        NORMAL_MTX.lock().unwrap();
        assert_eq!(NORMAL_MTX.lock(), Err(LockMutexError::WouldDeadlock));
        NORMAL_MTX.unlock().unwrap();

        tern_port_std::shutdown::<SystemTraits>();
    }

    tern_kernel::build_system! {
        impl KernelSystem for SystemTraits {
            round_robin_quantum: 10,
            max_recursive_locks: 255,
            tasks: {
                MAIN = {
                    entry: main_body, param: 0, priority: 2, stack_size: 4096,
                    policy: Fifo, flags: AUTO_START,
                },
                HELPER = {
                    entry: helper_body, param: 0, priority: 3, stack_size: 4096,
                    policy: Fifo, flags:,
                },
            },
            semaphores: {},
            mutexes: {
                EC_MTX = { kind: ErrorChecking, protocol: None, ceiling: 0 },
                NORMAL_MTX = { kind: Normal, protocol: None, ceiling: 0 },
            },
            condvars: {},
            queues: {},
            timers: {},
        }
    }

    #[test]
    fn run() {
        init_logger();
        tern_port_std::boot::<SystemTraits>();
    }
}

/// The priority-ordered queue discipline: higher-priority messages are
/// popped first, FIFO within one priority.
mod priority_queue_discipline {
    use super::*;

    tern_port_std::use_port!(unsafe struct SystemTraits);

    fn main_body(_: usize) {
        Q.push(1, 100).unwrap();
        Q.push(3, 300).unwrap();
        Q.push(2, 200).unwrap();
        Q.push(3, 301).unwrap();

        assert_eq!(Q.pop(), Ok((3, 300)));
        assert_eq!(Q.pop(), Ok((3, 301)));
        assert_eq!(Q.pop(), Ok((2, 200)));
        assert_eq!(Q.pop(), Ok((1, 100)));

        tern_port_std::shutdown::<SystemTraits>();
    }

    tern_kernel::build_system! {
        impl KernelSystem for SystemTraits {
            round_robin_quantum: 10,
            max_recursive_locks: 255,
            tasks: {
                MAIN = {
                    entry: main_body, param: 0, priority: 1, stack_size: 4096,
                    policy: Fifo, flags: AUTO_START,
                },
            },
            semaphores: {},
            mutexes: {},
            condvars: {},
            queues: {
                Q = { capacity: 8, discipline: Priority },
            },
            timers: {},
        }
    }

    #[test]
    fn run() {
        init_logger();
        tern_port_std::boot::<SystemTraits>();
    }
}
