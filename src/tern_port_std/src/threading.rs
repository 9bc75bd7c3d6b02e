//! Threading library similar to `std::thread` but supporting the remote
//! park operation ([`Thread::park`]), which is what lets the simulated
//! kernel preempt a compute-bound task at an arbitrary point.
//!
//! A park token is a byte sent over a per-thread socket pair; `park`
//! blocks in `recv` until a token arrives. A remote park raises `SIGUSR1`
//! on the target thread, whose signal handler then parks in place.
use std::{
    cell::Cell,
    mem::MaybeUninit,
    os::raw::c_int,
    ptr::null_mut,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Once,
    },
    thread,
};

/// [`std::sync::Mutex`] wrapper that tracks lock ownership in a
/// thread-local flag.
///
/// A worker thread is never remote-parked while holding the scheduler
/// lock - every remote park is issued by a thread that itself holds the
/// lock. The flag guards that invariant: should the signal nevertheless
/// arrive inside a critical section, the park is deferred to the unlock.
#[derive(Debug)]
pub struct Mutex<T: ?Sized>(std::sync::Mutex<T>);

pub struct MutexGuard<'a, T: ?Sized>(Option<std::sync::MutexGuard<'a, T>>);

thread_local! {
    static HOLDS_SCHED_LOCK: Cell<bool> = Cell::new(false);
}

impl<T> Mutex<T> {
    pub fn new(x: T) -> Self {
        Self(std::sync::Mutex::new(x))
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> Result<MutexGuard<'_, T>, ()> {
        let inner = self.0.lock().unwrap();
        HOLDS_SCHED_LOCK.with(|flag| flag.set(true));
        Ok(MutexGuard(Some(inner)))
    }
}

impl<T: ?Sized> std::ops::Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.0.as_ref().unwrap()
    }
}

impl<T: ?Sized> std::ops::DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.0.as_mut().unwrap()
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        HOLDS_SCHED_LOCK.with(|flag| flag.set(false));
        self.0 = None;

        // Honor a remote park deferred while the lock was held
        consume_deferred_parks();
    }
}

/// [`std::thread::JoinHandle`] with extra functionalities.
#[derive(Debug)]
pub struct JoinHandle<T> {
    _std_handle: thread::JoinHandle<T>,
    thread: Thread,
}

impl<T> JoinHandle<T> {
    pub fn thread(&self) -> &Thread {
        &self.thread
    }
}

/// Spawn a new thread.
pub fn spawn(f: impl FnOnce() + Send + 'static) -> JoinHandle<()> {
    let parent_thread = thread::current();

    let data = Arc::new(ThreadData::new());
    let data2 = Arc::clone(&data);

    let std_handle = thread::spawn(move || {
        // Publish `data2` for the signal handler. The thread-local is
        // fully initialized before the parent learns this thread's
        // identity, hence before any signal can target it.
        THREAD_DATA.with(|cell| cell.set(Arc::into_raw(data2)));

        parent_thread.unpark();
        drop(parent_thread);

        f();

        // Release the `Arc` reference published above
        let ptr = THREAD_DATA.with(|cell| cell.replace(null_mut()));
        if !ptr.is_null() {
            unsafe { drop(Arc::from_raw(ptr)) };
        }
    });

    let thread = Thread {
        data,
    };

    // Wait until the just-spawned thread configures its own `THREAD_DATA`.
    thread::park();

    JoinHandle {
        _std_handle: std_handle,
        thread,
    }
}

thread_local! {
    /// The current thread's `ThreadData`, readable from the signal
    /// handler. Eagerly initialized in `spawn`.
    static THREAD_DATA: Cell<*const ThreadData> = Cell::new(null_mut());
}

/// [`std::thread::Thread`] with extra functionalities.
#[derive(Debug, Clone)]
pub struct Thread {
    data: Arc<ThreadData>,
}

#[derive(Debug)]
struct ThreadData {
    park_sock: [c_int; 2],
    park_count: AtomicUsize,
    pthread_id: libc::pthread_t,
}

// Safety: `pthread_t` is a thread identifier, freely shareable
unsafe impl Send for ThreadData {}
unsafe impl Sync for ThreadData {}

impl ThreadData {
    fn new() -> Self {
        let park_sock = unsafe {
            let mut park_sock = MaybeUninit::<[c_int; 2]>::uninit();
            ok_or_errno(libc::socketpair(
                libc::PF_LOCAL,
                libc::SOCK_STREAM,
                0,
                park_sock.as_mut_ptr() as _,
            ))
            .unwrap();
            park_sock.assume_init()
        };

        Self {
            park_sock,
            park_count: AtomicUsize::new(0),
            pthread_id: unsafe { libc::pthread_self() },
        }
    }

    /// Get the FD to read a park token.
    fn park_sock_token_source(&self) -> c_int {
        self.park_sock[0]
    }

    /// Get the FD to write a park token.
    fn park_sock_token_sink(&self) -> c_int {
        self.park_sock[1]
    }
}

impl Drop for ThreadData {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.park_sock[0]);
            libc::close(self.park_sock[1]);
        }
    }
}

/// Block the current thread until a park token becomes available.
pub fn park() {
    let data_ptr = THREAD_DATA.with(|cell| cell.get());
    assert!(
        !data_ptr.is_null(),
        "this thread wasn't started by `threading::spawn`"
    );
    // Safety: The pointee is kept alive by the thread-local reference
    park_inner(unsafe { &*data_ptr });
}

fn park_inner(data: &ThreadData) {
    loop {
        // Take the token (blocking)
        match isize_ok_or_errno(unsafe {
            libc::recv(
                data.park_sock_token_source(),
                (&mut 0u8) as *mut _ as _,
                1,
                0,
            )
        }) {
            Ok(1) => {}
            Ok(0) | Err(errno::Errno(libc::EAGAIN)) => {
                // A spurious wakeup. Try again.
                continue;
            }
            Err(errno::Errno(libc::EINTR)) => {
                // Interrupted while waiting. Try again.
                continue;
            }
            Ok(i) => panic!("unexpected return value: {i}"),
            Err(e) => panic!("failed to evict park token: {e}"),
        }

        break;
    }
}

/// Honor the remote parks deferred while the scheduler lock was held.
fn consume_deferred_parks() {
    let data_ptr = THREAD_DATA.with(|cell| cell.get());
    if data_ptr.is_null() {
        return;
    }
    // Safety: The pointee is kept alive by the thread-local reference
    let data = unsafe { &*data_ptr };
    while data.park_count.load(Ordering::Relaxed) != 0 {
        data.park_count.fetch_sub(1, Ordering::Relaxed);
        park_inner(data);
    }
}

impl Thread {
    /// Make a new park token available for the thread.
    ///
    /// Unlike [`std::thread::Thread::unpark`], **a thread can have
    /// multiple tokens**. Each call to `park` will consume one token.
    pub fn unpark(&self) {
        let data = &self.data;

        // Make a token available
        isize_ok_or_errno(unsafe {
            libc::send(data.park_sock_token_sink(), &0u8 as *const _ as _, 1, 0)
        })
        .unwrap();
    }

    /// Force the thread to park.
    ///
    /// The effect is equivalent to calling `park` on the target thread.
    /// However, this method can be called from any thread ("remote park").
    ///
    /// The result is unspecified if the thread has already exited.
    pub fn park(&self) {
        // Make sure the signal handler is registered
        static SIGNAL_HANDLER_ONCE: Once = Once::new();
        SIGNAL_HANDLER_ONCE.call_once(register_remote_park_signal_handler);

        self.data.park_count.fetch_add(1, Ordering::Relaxed);

        // Raise `SIGNAL_REMOTE_PARK`. This forces the target thread to
        // execute `remote_park_signal_handler`.
        ok_or_errno(unsafe { libc::pthread_kill(self.data.pthread_id, SIGNAL_REMOTE_PARK) })
            .unwrap();

        // Wait until the park takes effect
        while self.data.park_count.load(Ordering::Relaxed) != 0 {
            std::thread::yield_now();
        }
    }
}

const SIGNAL_REMOTE_PARK: c_int = libc::SIGUSR1;

/// Register the signal handler for `SIGNAL_REMOTE_PARK`.
#[cold]
fn register_remote_park_signal_handler() {
    ok_or_errno(unsafe {
        libc::sigaction(
            SIGNAL_REMOTE_PARK,
            &libc::sigaction {
                sa_sigaction: remote_park_signal_handler as libc::sighandler_t,
                // `SA_SIGINFO`: The handler uses the three-parameter
                // signature.
                sa_flags: libc::SA_SIGINFO,
                ..std::mem::zeroed()
            },
            null_mut(),
        )
    })
    .unwrap();

    /// The signal handler for `SIGNAL_REMOTE_PARK`.
    extern "C" fn remote_park_signal_handler(
        _signo: c_int,
        _: *mut libc::siginfo_t,
        _: *mut libc::c_void,
    ) {
        // Inside a critical section the park is deferred to the unlock
        // path (`MutexGuard::drop`).
        if HOLDS_SCHED_LOCK.with(|flag| flag.get()) {
            return;
        }

        let current_ptr = THREAD_DATA.with(|cell| cell.get());
        assert!(!current_ptr.is_null());
        let current = unsafe { &*current_ptr };

        while current.park_count.load(Ordering::Relaxed) != 0 {
            current.park_count.fetch_sub(1, Ordering::Relaxed);

            // Park the current thread
            park_inner(current);
        }
    }
}

fn isize_ok_or_errno(x: isize) -> Result<isize, errno::Errno> {
    if x >= 0 {
        Ok(x)
    } else {
        Err(errno::errno())
    }
}

fn ok_or_errno(x: c_int) -> Result<c_int, errno::Errno> {
    if x >= 0 {
        Ok(x)
    } else {
        Err(errno::errno())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::mpsc, time::Duration};

    #[test]
    fn unpark_before_park() {
        let (send, recv) = mpsc::channel();
        let jh = spawn(move || {
            park();
            send.send(()).unwrap();
        });

        jh.thread().unpark();
        recv.recv_timeout(Duration::from_secs(10)).unwrap();
    }

    #[test]
    fn remote_park_stops_a_spinning_thread() {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);

        let jh = spawn(|| loop {
            COUNTER.fetch_add(1, Ordering::Relaxed);
        });

        // Let the thread start spinning
        while COUNTER.load(Ordering::Relaxed) == 0 {
            std::thread::yield_now();
        }

        jh.thread().park();

        // The thread should not make progress anymore
        let frozen = COUNTER.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(COUNTER.load(Ordering::Relaxed), frozen);

        // Resume and observe progress
        jh.thread().unpark();
        let resumed = COUNTER.load(Ordering::Relaxed);
        while COUNTER.load(Ordering::Relaxed) == resumed {
            std::thread::yield_now();
        }

        // Leave the thread spinning; the process exit will clean it up
        jh.thread().park();
    }
}
