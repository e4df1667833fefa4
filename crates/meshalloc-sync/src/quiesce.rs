//! Mutator thread registry and stop-the-world pauses.
//!
//! Every thread that may touch heap objects while a mesh runs must be
//! registered before it executes user code, either by being started through
//! [`spawn`] / [`create_thread`] or by holding a [`Registration`]. A pause
//! sends [`QUIESCE_SIGNAL`] to each registered thread; the handler parks the
//! thread on an epoch counter until the [`QuiescentGuard`] is dropped.
//!
//! Registration and deregistration take the registry lock, and the guard holds
//! that lock for the whole pause, so a thread can neither join nor leave the
//! registry while the world is stopped.

use core::{
  cell::Cell,
  ffi::c_void,
  marker::PhantomData,
  sync::atomic::{
    AtomicUsize,
    Ordering,
  },
};
use std::{
  thread::{
    self,
    JoinHandle,
  },
  time::{
    Duration,
    Instant,
  },
};

use spin::{
  Mutex,
  MutexGuard,
};

use crate::lazy::LazyLock;

pub const QUIESCE_SIGNAL: libc::c_int = libc::SIGUSR2;

/// How long [`stop_the_world`] waits for every target to park.
pub const PARK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuiesceError {
  HandlerInstall(i32),
  Signal(i32),
  Timeout { parked: usize, expected: usize },
}

pub type QuiesceResult<T> = Result<T, QuiesceError>;

/// Native thread entry point, as taken by `pthread_create`.
pub type StartRoutine = extern "C" fn(*mut c_void) -> *mut c_void;

#[derive(Clone, Copy)]
struct ThreadHandle(libc::pthread_t);

unsafe impl Send for ThreadHandle {}

impl ThreadHandle {
  fn current() -> Self {
    Self(unsafe { libc::pthread_self() })
  }

  fn is(&self, other: &ThreadHandle) -> bool {
    unsafe { libc::pthread_equal(self.0, other.0) != 0 }
  }
}

static THREADS: Mutex<Vec<ThreadHandle>> = Mutex::new(Vec::new());
// Odd while a pause is in progress.
static EPOCH: AtomicUsize = AtomicUsize::new(0);
static PARKED: AtomicUsize = AtomicUsize::new(0);
static HANDLER: LazyLock<QuiesceResult<()>> = LazyLock::new(install_handler);

/// Per-thread registry membership. Its destructor runs on every thread exit,
/// `pthread_exit` included, and drops the thread from the registry.
struct Membership {
  registered: Cell<bool>,
}

impl Drop for Membership {
  fn drop(&mut self) {
    if self.registered.replace(false) {
      deregister();
    }
  }
}

thread_local! {
  static MEMBERSHIP: Membership = const {
    Membership {
      registered: Cell::new(false),
    }
  };
}

fn last_errno() -> i32 {
  std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

// Runs in signal context: atomics and sched_yield only.
extern "C" fn park(_signal: libc::c_int) {
  let epoch = EPOCH.load(Ordering::Acquire);
  if epoch % 2 == 0 {
    // Delivered after its pause was abandoned.
    return;
  }
  PARKED.fetch_add(1, Ordering::AcqRel);
  while EPOCH.load(Ordering::Acquire) == epoch {
    unsafe { libc::sched_yield() };
  }
}

fn install_handler() -> QuiesceResult<()> {
  unsafe {
    let mut action: libc::sigaction = core::mem::zeroed();
    action.sa_sigaction = park as extern "C" fn(libc::c_int) as libc::sighandler_t;
    action.sa_flags = libc::SA_RESTART;
    libc::sigemptyset(&mut action.sa_mask);
    if libc::sigaction(QUIESCE_SIGNAL, &action, core::ptr::null_mut()) != 0 {
      return Err(QuiesceError::HandlerInstall(last_errno()));
    }
  }
  tracing::debug!(signal = QUIESCE_SIGNAL, "installed quiescence handler");
  Ok(())
}

fn ensure_handler() -> QuiesceResult<()> {
  (*HANDLER).clone()
}

/// Adds the calling thread to the registry. `false` if it already was a
/// member or is past its thread-local teardown.
fn register() -> QuiesceResult<bool> {
  ensure_handler()?;
  let added = MEMBERSHIP
    .try_with(|m| {
      if m.registered.get() {
        return false;
      }
      THREADS.lock().push(ThreadHandle::current());
      m.registered.set(true);
      true
    })
    .unwrap_or(false);
  Ok(added)
}

fn deregister() {
  let me = ThreadHandle::current();
  THREADS.lock().retain(|t| !t.is(&me));
}

/// Proof that the current thread is in the registry. Dropping it removes the
/// thread again.
pub struct Registration {
  _not_send: PhantomData<*const ()>,
}

impl Registration {
  /// Registers the calling thread. Returns `None` if it is already
  /// registered; the existing membership stays responsible for leaving.
  pub fn current() -> QuiesceResult<Option<Registration>> {
    Ok(register()?.then_some(Registration {
      _not_send: PhantomData,
    }))
  }
}

impl Drop for Registration {
  fn drop(&mut self) {
    let _ = MEMBERSHIP.try_with(|m| {
      if m.registered.replace(false) {
        deregister();
      }
    });
  }
}

pub fn is_registered() -> bool {
  MEMBERSHIP.try_with(|m| m.registered.get()).unwrap_or(false)
}

pub fn registered_count() -> usize {
  THREADS.lock().len()
}

/// `std::thread::spawn` for mutator threads: the new thread is registered
/// before `f` runs and deregistered when it returns or unwinds.
///
/// # Panics
///
/// The spawned thread panics if the quiescence handler cannot be installed.
pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
  F: FnOnce() -> T + Send + 'static,
  T: Send + 'static,
{
  thread::spawn(move || {
    let _registration = match Registration::current() {
      Ok(registration) => registration,
      Err(err) => panic!("failed to register mutator thread: {err:?}"),
    };
    f()
  })
}

struct Trampoline {
  start: StartRoutine,
  arg: *mut c_void,
}

// No locals with destructors: `start` may leave through `pthread_exit`.
extern "C" fn trampoline(raw: *mut c_void) -> *mut c_void {
  let Trampoline { start, arg } = *unsafe { Box::from_raw(raw as *mut Trampoline) };
  // The handler was installed by `create_thread`, so this cannot fail.
  let _ = register();
  start(arg)
}

/// Drop-in for `pthread_create` that registers the new thread with the
/// registry before `start` runs. The thread leaves the registry when it
/// exits, whether `start` returns or calls `pthread_exit`.
///
/// Returns `0` on success or an errno value, like `pthread_create`.
///
/// # Safety
///
/// Same contract as `pthread_create`: `thread` must be valid for writes and
/// `attr` null or a valid initialized attribute object.
pub unsafe extern "C" fn create_thread(
  thread: *mut libc::pthread_t,
  attr: *const libc::pthread_attr_t,
  start: StartRoutine,
  arg: *mut c_void,
) -> libc::c_int {
  if let Err(err) = ensure_handler() {
    tracing::warn!(?err, "refusing to create thread without quiescence handler");
    return libc::EAGAIN;
  }

  let payload = Box::into_raw(Box::new(Trampoline { start, arg })) as *mut c_void;
  let ret = unsafe { libc::pthread_create(thread, attr, trampoline, payload) };
  if ret != 0 {
    drop(unsafe { Box::from_raw(payload as *mut Trampoline) });
  }
  ret
}

/// A stop-the-world pause. Every registered thread other than the caller is
/// parked inside the signal handler until this guard is dropped.
///
/// Writes made while the guard is held are published to the parked threads
/// by the release/acquire pair on the epoch counter.
pub struct QuiescentGuard {
  _threads: MutexGuard<'static, Vec<ThreadHandle>>,
  parked: usize,
}

impl QuiescentGuard {
  pub fn parked(&self) -> usize {
    self.parked
  }
}

impl Drop for QuiescentGuard {
  fn drop(&mut self) {
    EPOCH.fetch_add(1, Ordering::Release);
  }
}

fn wait_parked(expected: usize, deadline: Instant) -> bool {
  while PARKED.load(Ordering::Acquire) < expected {
    if Instant::now() >= deadline {
      return false;
    }
    core::hint::spin_loop();
    thread::yield_now();
  }
  true
}

/// Parks every registered thread except the caller and returns once all of
/// them are inside the handler. Does not allocate.
pub fn stop_the_world() -> QuiesceResult<QuiescentGuard> {
  stop_the_world_within(PARK_TIMEOUT)
}

/// [`stop_the_world`] with an explicit bound on the wait. A target that has
/// not parked by then (it blocks the signal, say) abandons the pause: the
/// threads already parked are released and `Timeout` is returned.
pub fn stop_the_world_within(timeout: Duration) -> QuiesceResult<QuiescentGuard> {
  ensure_handler()?;

  let threads = THREADS.lock();
  let me = ThreadHandle::current();
  PARKED.store(0, Ordering::Release);
  EPOCH.fetch_add(1, Ordering::AcqRel);

  let mut signalled = 0;
  for target in threads.iter().filter(|t| !t.is(&me)) {
    let ret = unsafe { libc::pthread_kill(target.0, QUIESCE_SIGNAL) };
    if ret != 0 {
      EPOCH.fetch_add(1, Ordering::Release);
      return Err(QuiesceError::Signal(ret));
    }
    signalled += 1;
  }

  if !wait_parked(signalled, Instant::now() + timeout) {
    let parked = PARKED.load(Ordering::Acquire);
    EPOCH.fetch_add(1, Ordering::Release);
    return Err(QuiesceError::Timeout {
      parked,
      expected: signalled,
    });
  }

  Ok(QuiescentGuard {
    _threads: threads,
    parked: signalled,
  })
}
