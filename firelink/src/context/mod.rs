//! The execution context: two worker pools fed by a platform completion
//! source.
//!
//! ```text
//!  OS ──► harvester thread ──► I/O pool (fixups) ──► user pool (handlers)
//! ```
//!
//! The harvester blocks on the completion source (epoll on Linux, an I/O
//! completion port on Windows) and forwards each completion to the I/O
//! pool. I/O pool jobs are short and never block; they hand finished
//! operations to the user pool, where handlers are free to block.

mod pool;
mod registration;

#[cfg(epoll)]
mod epoll;
#[cfg(epoll)]
mod store;
#[cfg(iocp)]
mod iocp;

#[cfg(not(any(epoll, iocp)))]
compile_error!("firelink supports Linux (epoll) and Windows (IOCP) only");

use std::{
  io,
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  thread::{self, JoinHandle},
  time::Duration,
};

use log::{debug, error, warn};

use crate::config::IoCoreConfig;
use crate::error::{ErrorCode, Result};
use crate::op::Operation;
use crate::sync::Mutex;
use crate::types::NativeHandle;

pub(crate) use pool::{Job, Rejected, ThreadPool};
pub use registration::IoRegistration;

#[cfg(epoll)]
pub(crate) type Sys = epoll::Epoll;
#[cfg(iocp)]
pub(crate) type Sys = iocp::Iocp;

pub(crate) type Pending = <Sys as Backend>::Pending;
pub(crate) type OpState = <Sys as Backend>::OpState;

/// Platform completion source. Exactly one implementation is compiled in.
pub(crate) trait Backend: Send + Sync + Sized + 'static {
  /// Per-handle state kept inside [`IoRegistration`].
  type Pending: Default + Send + Sync;
  /// Per-operation linkage kept at the start of [`Operation`].
  type OpState: Default;

  fn open() -> io::Result<Self>;

  fn associate(&self, handle: NativeHandle) -> io::Result<Arc<IoRegistration>>;

  fn dissociate(&self, registration: &IoRegistration);

  /// Issues the non-blocking call for `op`.
  fn submit(&self, op: Box<Operation>) -> Result<()>;

  /// Forces every pending operation on the handle to complete.
  fn cancel(registration: &IoRegistration);

  /// Kind-specific work done on the I/O pool before the handler is queued.
  fn fixup(op: &mut Operation) -> Result<()>;

  /// Waits for completions and forwards them to `io_pool`.
  fn poll(
    this: &Arc<Self>,
    io_pool: &ThreadPool,
    timeout: Option<Duration>,
  ) -> io::Result<()>;

  /// Interrupts a blocked [`Backend::poll`].
  fn wake(&self) -> io::Result<()>;
}

pub(crate) fn fixup(op: &mut Operation) -> Result<()> {
  Sys::fixup(op)
}

pub(crate) fn cancel(registration: &IoRegistration) {
  Sys::cancel(registration)
}

/// How far initialization got. Teardown unwinds from here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Rollback {
  None,
  Subsystem,
  IoPool,
  UserPool,
  Harvester,
}

struct Harvester {
  stop: Arc<AtomicBool>,
  handle: JoinHandle<()>,
}

struct Inner {
  rollback: Rollback,
  backend: Option<Arc<Sys>>,
  io_pool: Option<Arc<ThreadPool>>,
  user_pool: Option<Arc<ThreadPool>>,
  harvester: Option<Harvester>,
}

/// Owns the I/O pool, the user pool and the platform completion source.
///
/// Sockets keep only a weak reference to the context; the application decides
/// how long it lives. Dropping the last `Arc` releases it.
///
/// ```rust,no_run
/// use firelink::{IoCore, IoCoreConfig};
///
/// let core = IoCore::create(IoCoreConfig::with_threads(2, 2))?;
/// core.post_user_work(|| println!("hello from the user pool"))?;
/// core.release()?;
/// # Ok::<(), firelink::ErrorCode>(())
/// ```
pub struct IoCore {
  config: IoCoreConfig,
  inner: Mutex<Inner>,
}

impl Inner {
  const fn empty() -> Self {
    Self {
      rollback: Rollback::None,
      backend: None,
      io_pool: None,
      user_pool: None,
      harvester: None,
    }
  }
}

impl IoCore {
  /// An uninitialized context. Call [`IoCore::initialize`] before use.
  pub fn new(config: IoCoreConfig) -> Arc<Self> {
    Arc::new(Self { config, inner: Mutex::new(Inner::empty()) })
  }

  /// Builds and initializes a context. Nothing is left behind on failure.
  pub fn create(config: IoCoreConfig) -> Result<Arc<Self>> {
    config.validate()?;
    let core = Self::new(config);
    core.initialize()?;
    Ok(core)
  }

  pub fn config(&self) -> &IoCoreConfig {
    &self.config
  }

  pub fn is_initialized(&self) -> bool {
    self.inner.lock().rollback >= Rollback::UserPool
  }

  /// Brings up the completion source, then the I/O pool, then the user pool,
  /// then starts harvesting. A failing step unwinds the ones before it.
  pub fn initialize(&self) -> Result<()> {
    let mut inner = self.inner.lock();
    if inner.rollback != Rollback::None {
      return Ok(());
    }
    self.config.validate()?;

    if let Err(err) = self.bring_up(&mut inner) {
      let code = ErrorCode::from(err);
      error!("io core: initialization failed: {code}");
      let partial = std::mem::replace(&mut *inner, Inner::empty());
      let _ = unwind(partial, self.config.drain_timeout);
      return Err(code);
    }

    debug!(
      "io core: initialized (io {}..{}, user {}..{})",
      self.config.io_pool_min_threads,
      self.config.io_pool_max_threads,
      self.config.user_pool_min_threads,
      self.config.user_pool_max_threads
    );
    Ok(())
  }

  fn bring_up(&self, inner: &mut Inner) -> io::Result<()> {
    inner.backend = Some(Arc::new(Sys::open()?));
    inner.rollback = Rollback::Subsystem;

    inner.io_pool = Some(Arc::new(ThreadPool::new(
      "firelink-io",
      self.config.io_pool_min_threads,
      self.config.io_pool_max_threads,
    )?));
    inner.rollback = Rollback::IoPool;

    inner.user_pool = Some(Arc::new(ThreadPool::new(
      "firelink-user",
      self.config.user_pool_min_threads,
      self.config.user_pool_max_threads,
    )?));
    inner.rollback = Rollback::UserPool;

    start_harvester(inner)
  }

  /// Stops harvesting, drains the user pool, then the I/O pool, then closes
  /// the completion source. Each drain waits at most
  /// [`IoCoreConfig::drain_timeout`]. Every step runs even if an earlier one
  /// failed; the first error is returned.
  pub fn release(&self) -> Result<()> {
    let parts = {
      let mut inner = self.inner.lock();
      if inner.rollback == Rollback::None {
        return Ok(());
      }
      std::mem::replace(&mut *inner, Inner::empty())
    };
    // Unlocked while draining: handlers still running may post more work,
    // which is now refused instead of deadlocking on the lock.
    let result = unwind(parts, self.config.drain_timeout);
    debug!("io core: released");
    result
  }

  /// Starts harvesting completions. Already running after `initialize`, so
  /// this only matters after [`IoCore::stop`].
  pub fn run(&self) -> Result<()> {
    let mut inner = self.inner.lock();
    match inner.rollback {
      Rollback::Harvester => Ok(()),
      Rollback::UserPool => start_harvester(&mut inner).map_err(Into::into),
      _ => Err(ErrorCode::NotInitialized),
    }
  }

  /// Stops harvesting. Pending operations stay registered and complete once
  /// [`IoCore::run`] is called again.
  pub fn stop(&self) -> Result<()> {
    let mut inner = self.inner.lock();
    match inner.rollback {
      Rollback::Harvester => stop_harvester(&mut inner).map_err(Into::into),
      Rollback::UserPool => Ok(()),
      _ => Err(ErrorCode::NotInitialized),
    }
  }

  pub fn post_io_work<F>(&self, work: F) -> Result<()>
  where
    F: FnOnce() + Send + 'static,
  {
    self.submit_io(Box::new(work)).map_err(|_| ErrorCode::NotInitialized)
  }

  pub fn post_user_work<F>(&self, work: F) -> Result<()>
  where
    F: FnOnce() + Send + 'static,
  {
    self.submit_user(Box::new(work)).map_err(|_| ErrorCode::NotInitialized)
  }

  /// Routes future completions for `handle` to this context.
  pub fn associate_handle(
    &self,
    handle: NativeHandle,
  ) -> Result<Arc<IoRegistration>> {
    Ok(self.backend()?.associate(handle)?)
  }

  pub(crate) fn submit_io(&self, job: Job) -> std::result::Result<(), Rejected> {
    let pool = self.inner.lock().io_pool.clone();
    match pool {
      Some(pool) => pool.submit(job),
      None => Err(Rejected(job)),
    }
  }

  pub(crate) fn submit_user(
    &self,
    job: Job,
  ) -> std::result::Result<(), Rejected> {
    let pool = self.inner.lock().user_pool.clone();
    match pool {
      Some(pool) => pool.submit(job),
      None => Err(Rejected(job)),
    }
  }

  pub(crate) fn backend(&self) -> Result<Arc<Sys>> {
    self.inner.lock().backend.clone().ok_or(ErrorCode::NotInitialized)
  }
}

impl Drop for IoCore {
  fn drop(&mut self) {
    if let Err(code) = self.release() {
      warn!("io core: release on drop failed: {code}");
    }
  }
}

fn start_harvester(inner: &mut Inner) -> io::Result<()> {
  let (Some(backend), Some(io_pool)) =
    (inner.backend.clone(), inner.io_pool.clone())
  else {
    return Err(io::Error::other("completion source is not open"));
  };

  let stop = Arc::new(AtomicBool::new(false));
  let flag = Arc::clone(&stop);
  let handle = thread::Builder::new()
    .name("firelink-harvester".into())
    .spawn(move || harvest(backend, io_pool, flag))?;

  inner.harvester = Some(Harvester { stop, handle });
  inner.rollback = Rollback::Harvester;
  Ok(())
}

fn stop_harvester(inner: &mut Inner) -> io::Result<()> {
  inner.rollback = Rollback::UserPool;
  let Some(harvester) = inner.harvester.take() else {
    return Ok(());
  };

  harvester.stop.store(true, Ordering::Release);
  if let Some(backend) = &inner.backend {
    backend.wake()?;
  }
  if harvester.handle.join().is_err() {
    return Err(io::Error::other("completion harvester panicked"));
  }
  Ok(())
}

fn harvest(backend: Arc<Sys>, io_pool: Arc<ThreadPool>, stop: Arc<AtomicBool>) {
  debug!("harvester: started");
  while !stop.load(Ordering::Acquire) {
    match Sys::poll(&backend, &io_pool, None) {
      Ok(()) => {}
      Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
      Err(err) => {
        error!("harvester: polling failed: {err}");
        break;
      }
    }
  }
  debug!("harvester: stopped");
}

/// Tears down whatever `rollback` says was built, newest first.
fn unwind(mut inner: Inner, drain_timeout: Duration) -> Result<()> {
  let mut first_error: Option<ErrorCode> = None;
  let mut record = |code: ErrorCode| {
    warn!("io core: teardown step failed: {code}");
    first_error.get_or_insert(code);
  };

  if inner.rollback >= Rollback::Harvester {
    if let Err(err) = stop_harvester(&mut inner) {
      record(err.into());
    }
  }

  if inner.rollback >= Rollback::UserPool {
    if let Some(pool) = inner.user_pool.take() {
      if !pool.shutdown(drain_timeout) {
        record(ErrorCode::TimedOut);
      }
    }
    inner.rollback = Rollback::IoPool;
  }

  if inner.rollback >= Rollback::IoPool {
    if let Some(pool) = inner.io_pool.take() {
      if !pool.shutdown(drain_timeout) {
        record(ErrorCode::TimedOut);
      }
    }
    inner.rollback = Rollback::Subsystem;
  }

  if inner.rollback >= Rollback::Subsystem {
    // Sockets may still hold the completion source for deregistration;
    // it closes when the last of them lets go.
    inner.backend = None;
    inner.rollback = Rollback::None;
  }

  match first_error {
    Some(code) => Err(code),
    None => Ok(()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::mpsc;

  #[test]
  fn create_rejects_invalid_config() {
    let config = IoCoreConfig { io_pool_max_threads: 0, ..Default::default() };
    assert_eq!(IoCore::create(config).err(), Some(ErrorCode::InvalidArgument));
  }

  #[test]
  fn lifecycle_round_trip() {
    let core = IoCore::new(IoCoreConfig::default());
    assert!(!core.is_initialized());
    assert_eq!(core.post_io_work(|| {}), Err(ErrorCode::NotInitialized));

    core.initialize().unwrap();
    assert!(core.is_initialized());
    core.initialize().unwrap();

    core.release().unwrap();
    assert!(!core.is_initialized());
    assert_eq!(core.post_user_work(|| {}), Err(ErrorCode::NotInitialized));
    core.release().unwrap();

    core.initialize().unwrap();
    assert!(core.is_initialized());
  }

  #[test]
  fn posts_to_named_pools() {
    let core = IoCore::create(IoCoreConfig::default()).unwrap();
    let (tx, rx) = mpsc::channel();

    let io_tx = tx.clone();
    core
      .post_io_work(move || {
        io_tx.send(thread::current().name().map(str::to_owned)).unwrap();
      })
      .unwrap();
    core
      .post_user_work(move || {
        tx.send(thread::current().name().map(str::to_owned)).unwrap();
      })
      .unwrap();

    let mut names: Vec<String> = (0..2)
      .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap())
      .collect();
    names.sort();
    assert!(names[0].starts_with("firelink-io-"));
    assert!(names[1].starts_with("firelink-user-"));
  }

  #[test]
  fn rejected_work_is_dropped() {
    let core = IoCore::create(IoCoreConfig::default()).unwrap();
    core.release().unwrap();

    let marker = Arc::new(());
    let held = Arc::clone(&marker);
    let result = core.post_user_work(move || drop(held));

    assert_eq!(result, Err(ErrorCode::NotInitialized));
    assert_eq!(Arc::strong_count(&marker), 1);
  }

  #[test]
  fn run_and_stop_toggle_harvesting() {
    let core = IoCore::create(IoCoreConfig::default()).unwrap();
    core.run().unwrap();
    core.stop().unwrap();
    core.stop().unwrap();
    core.run().unwrap();
    core.release().unwrap();
    assert_eq!(core.run(), Err(ErrorCode::NotInitialized));
  }

  #[test]
  fn release_waits_for_user_work() {
    let core = IoCore::create(IoCoreConfig::default()).unwrap();
    let (tx, rx) = mpsc::channel();

    core
      .post_user_work(move || {
        thread::sleep(Duration::from_millis(100));
        tx.send(()).unwrap();
      })
      .unwrap();

    core.release().unwrap();
    assert!(rx.try_recv().is_ok(), "release returned before work drained");
  }
}
