//! Utterly inefficient cross-platform preemptive user-mode scheduling
//!
//! A [`ThreadGroup`] is a dynamic set of worker threads of which at most
//! one runs at any moment, chosen by a client-supplied [`Scheduler`]. The
//! remaining workers are parked. Preemption is implemented by remotely
//! parking the running worker ([`crate::threading::Thread::park`]).
use slab::Slab;
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{mpsc, Arc, OnceLock},
    thread::Result,
};

use crate::threading;

type SlabPtr = usize;

/// Represents a dynamic set of threads that can be scheduled for execution
/// by `Sched: `[`Scheduler`].
#[derive(Debug)]
pub struct ThreadGroup<Sched: ?Sized> {
    state: Arc<threading::Mutex<State<Sched>>>,
}

impl<Sched: ?Sized> Clone for ThreadGroup<Sched> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

/// Object that can be used to join on a [`ThreadGroup`].
#[derive(Debug)]
pub struct ThreadGroupJoinHandle {
    result_recv: mpsc::Receiver<Result<()>>,
}

/// RAII guard returned by [`ThreadGroup::lock`].
pub struct ThreadGroupLockGuard<'a, Sched: ?Sized> {
    state_ref: &'a Arc<threading::Mutex<State<Sched>>>,
    guard: threading::MutexGuard<'a, State<Sched>>,
}

/// Identifies a thread in [`ThreadGroup`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct ThreadId(SlabPtr);

/// Encapsulates the state of a client-supplied user-mode scheduler.
pub trait Scheduler: Send + 'static {
    /// Choose the next thread to run.
    ///
    /// It's an error to return an already-exited thread. The client is
    /// responsible for tracking the lifetime of spawned threads.
    fn choose_next_thread(&mut self) -> Option<ThreadId>;

    /// Called when a thread exits.
    fn thread_exited(&mut self, thread_id: ThreadId) {
        let _ = thread_id;
    }
}

#[derive(Debug)]
struct State<Sched: ?Sized> {
    threads: Slab<WorkerThread>,
    num_threads: usize,
    cur_thread_id: Option<ThreadId>,
    shut_down: bool,
    result_send: mpsc::Sender<Result<()>>,
    sched: Sched,
}

#[derive(Debug)]
struct WorkerThread {
    join_handle: Option<threading::JoinHandle<()>>,
}

thread_local! {
    static TLB: OnceLock<ThreadLocalBlock> = OnceLock::new();
}

struct ThreadLocalBlock {
    /// The current thread ID.
    thread_id: ThreadId,
    /// The thread group the current worker thread belongs to.
    state: Arc<threading::Mutex<State<dyn Scheduler>>>,
}

/// The panic payload used by [`exit_thread`] to unwind off a worker
/// thread's stack.
struct ExitThread;

/// Suppress the default panic message for the unwind initiated by
/// [`exit_thread`]; it's not an error.
fn install_panic_hook() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let default_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if !info.payload().is::<ExitThread>() {
                default_hook(info);
            }
        }));
    });
}

impl<Sched: Scheduler> ThreadGroup<Sched> {
    /// Construct a new `ThreadGroup` and the corresponding
    /// [`ThreadGroupJoinHandle`].
    pub fn new(sched: Sched) -> (Self, ThreadGroupJoinHandle) {
        install_panic_hook();

        let (send, recv) = mpsc::channel();

        let state = Arc::new(threading::Mutex::new(State {
            threads: Slab::new(),
            num_threads: 0,
            cur_thread_id: None,
            shut_down: false,
            result_send: send,
            sched,
        }));

        (Self { state }, ThreadGroupJoinHandle { result_recv: recv })
    }
}

impl ThreadGroupJoinHandle {
    /// Wait for the thread group to shut down.
    pub fn join(self) -> Result<()> {
        self.result_recv.recv().unwrap()
    }
}

impl<Sched: Scheduler + ?Sized> ThreadGroup<Sched> {
    /// Acquire a lock on the thread group's state.
    pub fn lock(&self) -> ThreadGroupLockGuard<'_, Sched> {
        ThreadGroupLockGuard {
            state_ref: &self.state,
            guard: self.state.lock().unwrap(),
        }
    }
}

impl<'a, Sched: Scheduler> ThreadGroupLockGuard<'a, Sched> {
    /// Start a worker thread.
    ///
    /// This does not automatically schedule the spawned thread. You should
    /// store the obtained `ThreadId` in the contained `Sched:
    /// `[`Scheduler`] and have it chosen by [`Scheduler::choose_next_thread`]
    /// for the thread to actually run.
    ///
    /// The following functions are available for use inside a worker
    /// thread. You should use them instead of the same-named methods
    /// defined in other places.
    ///
    ///  - [`exit_thread`]
    ///  - [`yield_now`]
    ///
    pub fn spawn(&mut self, f: impl FnOnce(ThreadId) + Send + 'static) -> ThreadId {
        if self.guard.shut_down {
            panic!("thread group has already been shut down");
        }

        let state = Arc::clone(self.state_ref);

        // Allocate a `ThreadId`
        let ptr: SlabPtr = self.guard.threads.insert(WorkerThread { join_handle: None });
        let thread_id = ThreadId(ptr);
        self.guard.num_threads += 1;

        let join_handle = threading::spawn(move || {
            let state2 = Arc::clone(&state);
            TLB.with(|cell| {
                cell.set(ThreadLocalBlock { thread_id, state })
                    .ok()
                    .unwrap()
            });

            // Block the spawned thread until scheduled to run
            threading::park();

            // Call the thread entry point
            let result = match catch_unwind(AssertUnwindSafe(move || {
                f(thread_id);
            })) {
                // `exit_thread` works by unwinding with a private payload
                Err(x) if x.is::<ExitThread>() => Ok(()),
                x => x,
            };

            finalize_thread(state2, thread_id, result);
        });

        // Save the `JoinHandle` representing the spawned thread
        self.guard.threads[ptr].join_handle = Some(join_handle);

        log::trace!("created {thread_id:?}");

        thread_id
    }

    /// Preempt the thread group to let the scheduler decide the next
    /// thread to run.
    ///
    /// Calling this method from a worker thread is not allowed.
    pub fn preempt(&mut self) {
        assert!(
            TLB.with(|cell| cell.get().is_none()),
            "this method cannot be called from a worker thread"
        );

        // Preempt the current thread
        let guard = &mut *self.guard;
        log::trace!("preempting {:?}", guard.cur_thread_id);
        if let Some(thread_id) = guard.cur_thread_id {
            let join_handle = guard.threads[thread_id.0].join_handle.as_ref().unwrap();
            join_handle.thread().park();
        }

        guard.unpark_next_thread();
    }

    /// Shut down the thread group.
    ///
    /// [`ThreadGroupJoinHandle::join`] unblocks immediately, returning
    /// `Ok(())`. The remaining worker threads stay parked; there is no
    /// safe way to terminate them, and a simulated system can't be
    /// restarted within the same process anyway.
    pub fn shutdown(&mut self) {
        if self.guard.shut_down {
            return;
        }
        log::trace!("shutting down");
        self.guard.shut_down = true;

        // Ignore if the receiver has already hung up
        let _ = self.guard.result_send.send(Ok(()));
    }
}

impl<'a, Sched: Scheduler + ?Sized> ThreadGroupLockGuard<'a, Sched> {
    /// Get a mutable reference to the contained `Sched: `[`Scheduler`].
    pub fn scheduler(&mut self) -> &mut Sched {
        &mut self.guard.sched
    }
}

impl<Sched: Scheduler> State<Sched> {
    fn unpark_next_thread(&mut self) {
        (self as &mut State<dyn Scheduler>).unpark_next_thread();
    }
}

impl State<dyn Scheduler> {
    /// Find the next thread to run and unpark that thread.
    fn unpark_next_thread(&mut self) {
        if self.shut_down {
            // Leave every worker parked
            self.cur_thread_id = None;
            return;
        }

        self.cur_thread_id = self.sched.choose_next_thread();
        log::trace!("scheduling {:?}", self.cur_thread_id);
        if let Some(thread_id) = self.cur_thread_id {
            let join_handle = self.threads[thread_id.0].join_handle.as_ref().unwrap();
            join_handle.thread().unpark();
        }
    }
}

/// Voluntarily yield the processor to let the scheduler decide the next
/// thread to run.
///
/// Panics if the current thread is not a worker thread of some
/// [`ThreadGroup`].
pub fn yield_now() {
    let thread_group: Arc<threading::Mutex<State<dyn Scheduler>>> = TLB
        .with(|cell| cell.get().map(|tlb| Arc::clone(&tlb.state)))
        .expect("current thread does not belong to a thread group");

    {
        let mut state_guard = thread_group.lock().unwrap();
        log::trace!("{:?} yielded the processor", state_guard.cur_thread_id);
        state_guard.unpark_next_thread();
    }

    // Block the thread until scheduled to run. This might end immediately
    // if the current thread is the next thread to run.
    threading::park();
}

/// Terminate the current worker thread by unwinding off its stack.
///
/// Panics if the current thread is not a worker thread of some
/// [`ThreadGroup`].
///
/// # Safety
///
/// It comes with all the unsafety of terminating a thread, such as that it
/// could unpin pinned local variables.
pub unsafe fn exit_thread() -> ! {
    TLB.with(|cell| {
        cell.get()
            .expect("current thread does not belong to a thread group")
            .thread_id
    });

    std::panic::panic_any(ExitThread);
}

/// Mark the specified thread as exited.
fn finalize_thread(
    thread_group: Arc<threading::Mutex<State<dyn Scheduler>>>,
    thread_id: ThreadId,
    result: Result<()>,
) {
    log::trace!("{thread_id:?} exited with result {result:?}");

    // Delete the current thread
    let mut state_guard = thread_group.lock().unwrap();
    state_guard.sched.thread_exited(thread_id);
    state_guard.threads.remove(thread_id.0);
    state_guard.num_threads -= 1;

    if let Err(e) = result {
        // Send the panic payload to the thread group's owner. Leave other
        // threads hanging because there's no way to terminate them
        // safely. This should be at least sufficient for running tests.
        let _ = state_guard.result_send.send(Err(e));
        return;
    }

    // Invoke the scheduler
    state_guard.unpark_next_thread();
}

/// Get the current worker thread.
pub fn current_thread() -> Option<ThreadId> {
    TLB.with(|cell| cell.get().map(|tlb| tlb.thread_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    /// A round-robin scheduler for the tests.
    struct RoundRobinSched {
        runnable: VecDeque<ThreadId>,
    }

    impl Scheduler for RoundRobinSched {
        fn choose_next_thread(&mut self) -> Option<ThreadId> {
            if let Some(thread_id) = self.runnable.pop_front() {
                self.runnable.push_back(thread_id);
                Some(thread_id)
            } else {
                None
            }
        }

        fn thread_exited(&mut self, thread_id: ThreadId) {
            self.runnable.retain(|&t| t != thread_id);
        }
    }

    #[test]
    fn threads_run_one_at_a_time() {
        static ACTIVE: AtomicUsize = AtomicUsize::new(0);
        static ITERS: AtomicUsize = AtomicUsize::new(0);

        let (group, join_handle) = ThreadGroup::new(RoundRobinSched {
            runnable: VecDeque::new(),
        });

        let mut lock = group.lock();
        for _ in 0..3 {
            let thread_id = lock.spawn(|_| {
                for _ in 0..100 {
                    assert_eq!(ACTIVE.fetch_add(1, Ordering::SeqCst), 0);
                    ACTIVE.fetch_sub(1, Ordering::SeqCst);
                    ITERS.fetch_add(1, Ordering::SeqCst);
                    yield_now();
                }
                unsafe { exit_thread() };
            });
            lock.scheduler().runnable.push_back(thread_id);
        }
        lock.preempt();
        drop(lock);

        while ITERS.load(Ordering::SeqCst) != 300 {
            std::thread::sleep(Duration::from_millis(10));
        }

        group.lock().shutdown();
        join_handle.join().unwrap();
    }
}
