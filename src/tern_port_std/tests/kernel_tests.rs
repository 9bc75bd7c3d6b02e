//! The scenario test suite, run against the simulated kernel.
//!
//! Every test module is a self-contained kernel instance: `use_port!`
//! binds a fresh kernel-trait type to the port and `build_system!` declares
//! the tasks and synchronization objects. The first auto-started task
//! drives the scenario and calls `tern_port_std::shutdown` on success;
//! assertion failures panic inside a worker thread and propagate out of
//! `tern_port_std::boot`.
//!
//! Tests communicate through atomics only. A `std` mutex shared between
//! tasks could be held by a preempted (parked) worker thread, which would
//! wedge the whole simulation.
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// An event-ordering recorder: each `mark` draws the next sequence number.
struct SeqRecorder {
    seq: AtomicUsize,
}

impl SeqRecorder {
    const fn new() -> Self {
        Self {
            seq: AtomicUsize::new(0),
        }
    }

    fn mark(&self, slot: &AtomicUsize) {
        slot.store(self.seq.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
    }
}

/// S1: Priority inversion is bounded by priority inheritance.
///
/// `L` (low) takes a PI mutex and sleeps inside the critical section while
/// `M` (medium) spins and `H` (high) blocks on the mutex. `H` must run
/// right after `L` releases; `M` finishes only after both.
mod s1_priority_inversion {
    use super::*;
    use tern_kernel::{TickDuration, System};

    tern_port_std::use_port!(unsafe struct SystemTraits);

    type Sys = System<SystemTraits>;

    static SEQ: SeqRecorder = SeqRecorder::new();
    static H_GOT_LOCK: AtomicUsize = AtomicUsize::new(0);
    static M_FINISHED: AtomicUsize = AtomicUsize::new(0);
    static H_DONE: AtomicBool = AtomicBool::new(false);

    fn l_body(_: usize) {
        MTX.lock().unwrap();

        // While we hold the mutex: release the higher-priority tasks. `H`
        // immediately preempts us and blocks on the mutex, boosting us
        // over `M`.
        TASK_H.start().unwrap();
        assert_eq!(TASK_H.state().unwrap(), tern_kernel::ThreadState::BlockedOnMutex);
        TASK_M.start().unwrap();

        // Priority inheritance: the waiter's priority carries over to us
        assert_eq!(Sys::current_task().unwrap().effective_priority().unwrap(), 3);

        // The inversion window: we are blocked, `M` is compute-bound, `H`
        // wants the mutex
        Sys::sleep(TickDuration::from_ticks(1)).unwrap();

        MTX.unlock().unwrap();

        TASK_H.join().unwrap();
        TASK_M.join().unwrap();

        // `H` must have completed the critical section before `M` got to
        // finish its busy loop
        let h = H_GOT_LOCK.load(Ordering::SeqCst);
        let m = M_FINISHED.load(Ordering::SeqCst);
        assert!(h != 0 && m != 0);
        assert!(h < m, "H (seq {h}) should run before M (seq {m})");

        // The boost is gone
        assert_eq!(Sys::current_task().unwrap().effective_priority().unwrap(), 1);

        tern_port_std::shutdown::<SystemTraits>();
    }

    fn m_body(_: usize) {
        // Busy-wait until `H` completes; only the tick preemption can stop
        // this loop
        while !H_DONE.load(Ordering::SeqCst) {
            std::hint::spin_loop();
        }
        SEQ.mark(&M_FINISHED);
    }

    fn h_body(_: usize) {
        MTX.lock().unwrap();
        SEQ.mark(&H_GOT_LOCK);
        MTX.unlock().unwrap();
        H_DONE.store(true, Ordering::SeqCst);
    }

    tern_kernel::build_system! {
        impl KernelSystem for SystemTraits {
            round_robin_quantum: 10,
            max_recursive_locks: 255,
            tasks: {
                TASK_L = {
                    entry: l_body, param: 0, priority: 1, stack_size: 4096,
                    policy: Fifo, flags: AUTO_START,
                },
                TASK_M = {
                    entry: m_body, param: 0, priority: 2, stack_size: 4096,
                    policy: Fifo, flags:,
                },
                TASK_H = {
                    entry: h_body, param: 0, priority: 3, stack_size: 4096,
                    policy: Fifo, flags:,
                },
            },
            semaphores: {},
            mutexes: {
                MTX = { kind: Normal, protocol: PriorityInheritance, ceiling: 0 },
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

/// S2: A recursive mutex saturates at the configured lock count, and
/// surplus unlocks are rejected.
mod s2_recursive_mutex {
    use super::*;
    use tern_kernel::error::{LockMutexError, UnlockMutexError};

    tern_port_std::use_port!(unsafe struct SystemTraits);

    fn main_body(_: usize) {
        assert_eq!(MTX.lock(), Ok(()));
        assert_eq!(MTX.lock(), Ok(()));
        assert_eq!(MTX.lock(), Ok(()));
        assert_eq!(MTX.lock(), Err(LockMutexError::ResourceLimit));

        assert_eq!(MTX.unlock(), Ok(()));
        assert_eq!(MTX.unlock(), Ok(()));
        assert_eq!(MTX.unlock(), Ok(()));
        assert_eq!(MTX.unlock(), Err(UnlockMutexError::NotOwner));

        tern_port_std::shutdown::<SystemTraits>();
    }

    tern_kernel::build_system! {
        impl KernelSystem for SystemTraits {
            round_robin_quantum: 10,
            max_recursive_locks: 3,
            tasks: {
                MAIN = {
                    entry: main_body, param: 0, priority: 1, stack_size: 4096,
                    policy: Fifo, flags: AUTO_START,
                },
            },
            semaphores: {},
            mutexes: {
                MTX = { kind: Recursive, protocol: None, ceiling: 0 },
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

/// S3: A timed semaphore wait expires no earlier than requested.
mod s3_semaphore_timeout {
    use super::*;
    use tern_kernel::{error::WaitSemaphoreTimeoutError, System, TickDuration};

    tern_port_std::use_port!(unsafe struct SystemTraits);

    type Sys = System<SystemTraits>;

    fn main_body(_: usize) {
        let start = Sys::time().unwrap();

        assert_eq!(
            SEM.wait_for(TickDuration::from_ticks(10)),
            Err(WaitSemaphoreTimeoutError::Timeout)
        );

        let elapsed = Sys::time().unwrap() - start;
        assert!(
            elapsed.as_ticks() >= 10,
            "woke up too early: {elapsed:?}"
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

/// S4: A mutex + condition variable pair transports 100 messages in FIFO
/// order without deadlocking.
mod s4_condvar {
    use super::*;

    tern_port_std::use_port!(unsafe struct SystemTraits);

    const COUNT: usize = 100;
    const RING_LEN: usize = 8;

    // A ring buffer guarded by `MTX`; the atomics are plain shared memory
    static RING: [AtomicUsize; RING_LEN] = {
        const SLOT: AtomicUsize = AtomicUsize::new(0);
        [SLOT; RING_LEN]
    };
    static HEAD: AtomicUsize = AtomicUsize::new(0);
    static LEN: AtomicUsize = AtomicUsize::new(0);

    fn producer_body(_: usize) {
        for i in 0..COUNT {
            MTX.lock().unwrap();
            while LEN.load(Ordering::SeqCst) == RING_LEN {
                NONFULL.wait(MTX).unwrap();
            }
            let head = HEAD.load(Ordering::SeqCst);
            let len = LEN.load(Ordering::SeqCst);
            RING[(head + len) % RING_LEN].store(i, Ordering::SeqCst);
            LEN.store(len + 1, Ordering::SeqCst);
            NONEMPTY.notify_one().unwrap();
            MTX.unlock().unwrap();
        }
    }

    fn consumer_body(_: usize) {
        for expected in 0..COUNT {
            MTX.lock().unwrap();
            while LEN.load(Ordering::SeqCst) == 0 {
                NONEMPTY.wait(MTX).unwrap();
            }
            let head = HEAD.load(Ordering::SeqCst);
            let value = RING[head].load(Ordering::SeqCst);
            HEAD.store((head + 1) % RING_LEN, Ordering::SeqCst);
            LEN.store(LEN.load(Ordering::SeqCst) - 1, Ordering::SeqCst);
            NONFULL.notify_one().unwrap();
            MTX.unlock().unwrap();

            assert_eq!(value, expected, "messages out of order");
        }

        PRODUCER.join().unwrap();
        tern_port_std::shutdown::<SystemTraits>();
    }

    tern_kernel::build_system! {
        impl KernelSystem for SystemTraits {
            round_robin_quantum: 10,
            max_recursive_locks: 255,
            tasks: {
                PRODUCER = {
                    entry: producer_body, param: 0, priority: 2, stack_size: 4096,
                    policy: Fifo, flags: AUTO_START,
                },
                CONSUMER = {
                    entry: consumer_body, param: 0, priority: 1, stack_size: 4096,
                    policy: Fifo, flags: AUTO_START,
                },
            },
            semaphores: {},
            mutexes: {
                MTX = { kind: Normal, protocol: None, ceiling: 0 },
            },
            condvars: { NONEMPTY, NONFULL },
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

/// S5: `try_push` on a full queue fails with `Busy` and recovers after a
/// pop.
mod s5_queue_overflow {
    use super::*;
    use tern_kernel::error::TryPushQueueError;

    tern_port_std::use_port!(unsafe struct SystemTraits);

    fn main_body(_: usize) {
        assert_eq!(Q.capacity(), 4);

        assert_eq!(Q.try_push(0, 10), Ok(()));
        assert_eq!(Q.try_push(0, 11), Ok(()));
        assert_eq!(Q.try_push(0, 12), Ok(()));
        assert_eq!(Q.try_push(0, 13), Ok(()));
        assert_eq!(Q.try_push(0, 14), Err(TryPushQueueError::Busy));

        assert_eq!(Q.pop(), Ok((0, 10)));
        assert_eq!(Q.try_push(0, 14), Ok(()));

        // FIFO discipline
        assert_eq!(Q.try_pop(), Ok((0, 11)));
        assert_eq!(Q.try_pop(), Ok((0, 12)));
        assert_eq!(Q.try_pop(), Ok((0, 13)));
        assert_eq!(Q.try_pop(), Ok((0, 14)));

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
                Q = { capacity: 4, discipline: Fifo },
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

/// S6: A periodic timer fires with the one-tick round-up, and stopping it
/// prevents further invocations.
mod s6_software_timer {
    use super::*;
    use tern_kernel::{System, TickDuration};

    tern_port_std::use_port!(unsafe struct SystemTraits);

    type Sys = System<SystemTraits>;

    static FIRE_COUNT: AtomicUsize = AtomicUsize::new(0);
    static FIRE_TICKS: [AtomicU64; 8] = {
        const SLOT: AtomicU64 = AtomicU64::new(0);
        [SLOT; 8]
    };

    fn timer_callback(_: usize) {
        let i = FIRE_COUNT.fetch_add(1, Ordering::SeqCst);
        if let Some(slot) = FIRE_TICKS.get(i) {
            slot.store(Sys::time().unwrap().as_ticks(), Ordering::SeqCst);
        }
    }

    fn main_body(_: usize) {
        let t0 = Sys::time().unwrap().as_ticks();
        TMR.start(TickDuration::from_ticks(5), TickDuration::from_ticks(5))
            .unwrap();

        // Wait out three firings (expected at t0+6, t0+11, t0+16, give or
        // take the tick boundary the arming straddled)
        while FIRE_COUNT.load(Ordering::SeqCst) < 3 {
            Sys::sleep(TickDuration::from_ticks(1)).unwrap();
        }
        TMR.stop().unwrap();

        let fired = FIRE_COUNT.load(Ordering::SeqCst);

        let first = FIRE_TICKS[0].load(Ordering::SeqCst);
        assert!(
            first >= t0 + 6 && first <= t0 + 7,
            "first expiry at {first}, armed at {t0}"
        );
        // Subsequent periods are exact: the timer is re-armed relative to
        // its own deadline, not to the callback execution time
        for i in 1..3 {
            let prev = FIRE_TICKS[i - 1].load(Ordering::SeqCst);
            let cur = FIRE_TICKS[i].load(Ordering::SeqCst);
            assert_eq!(cur, prev + 5, "period drifted at firing {i}");
        }

        // A stopped timer must not fire anymore
        Sys::sleep(TickDuration::from_ticks(12)).unwrap();
        assert_eq!(FIRE_COUNT.load(Ordering::SeqCst), fired);

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
            timers: {
                TMR = { callback: timer_callback, param: 0, delay: None, period: TickDuration::ZERO },
            },
        }
    }

    #[test]
    fn run() {
        init_logger();
        tern_port_std::boot::<SystemTraits>();
    }
}
