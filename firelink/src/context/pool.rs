//! Elastic worker pool used for both the I/O pool and the user pool.
//!
//! `min` workers are spawned up front. When a job is queued while every
//! worker is busy, one more worker is spawned as long as fewer than `max`
//! are alive. Surplus workers retire after sitting idle for
//! [`IDLE_RETIRE`].

use std::{
  io,
  panic::{self, AssertUnwindSafe},
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
  thread::{self, JoinHandle},
  time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, error, warn};

use crate::sync::{Condvar, Mutex};

pub(crate) type Job = Box<dyn FnOnce() + Send>;

/// Hands a job back when the pool no longer accepts work.
pub(crate) struct Rejected(pub Job);

const IDLE_RETIRE: Duration = Duration::from_secs(10);

#[derive(Default)]
struct Counts {
  live: usize,
  idle: usize,
  /// Submitted but not yet picked up by a worker.
  queued: usize,
}

struct Shared {
  name: &'static str,
  rx: Receiver<Job>,
  min: usize,
  max: usize,
  idle_retire: Duration,
  counts: Mutex<Counts>,
  /// Signalled whenever a worker exits.
  exited: Condvar,
  next_id: AtomicUsize,
}

pub(crate) struct ThreadPool {
  shared: Arc<Shared>,
  tx: Mutex<Option<Sender<Job>>>,
  workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
  pub fn new(name: &'static str, min: usize, max: usize) -> io::Result<Self> {
    Self::with_idle_retire(name, min, max, IDLE_RETIRE)
  }

  fn with_idle_retire(
    name: &'static str,
    min: usize,
    max: usize,
    idle_retire: Duration,
  ) -> io::Result<Self> {
    let (tx, rx) = crossbeam_channel::unbounded();
    let pool = Self {
      shared: Arc::new(Shared {
        name,
        rx,
        min,
        max,
        idle_retire,
        counts: Mutex::new(Counts::default()),
        exited: Condvar::new(),
        next_id: AtomicUsize::new(0),
      }),
      tx: Mutex::new(Some(tx)),
      workers: Mutex::new(Vec::with_capacity(max)),
    };

    for _ in 0..min {
      pool.spawn_worker()?;
    }

    debug!("{name}: started with {min}..{max} workers");
    Ok(pool)
  }

  /// Queues `job`. Fails only after [`ThreadPool::shutdown`].
  pub fn submit(&self, job: Job) -> Result<(), Rejected> {
    let grow = {
      let tx = self.tx.lock();
      let Some(sender) = tx.as_ref() else {
        return Err(Rejected(job));
      };

      let grow = {
        let mut counts = self.shared.counts.lock();
        counts.queued += 1;
        counts.queued > counts.idle && counts.live < self.shared.max
      };

      if let Err(err) = sender.send(job) {
        self.shared.counts.lock().queued -= 1;
        return Err(Rejected(err.into_inner()));
      }
      grow
    };

    if grow {
      if let Err(err) = self.spawn_worker() {
        // Queued work still runs on the existing workers.
        warn!("{}: failed to grow pool: {err}", self.shared.name);
      }
    }
    Ok(())
  }

  fn spawn_worker(&self) -> io::Result<()> {
    {
      let mut counts = self.shared.counts.lock();
      if counts.live >= self.shared.max {
        return Ok(());
      }
      counts.live += 1;
      counts.idle += 1;
    }

    let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
    let shared = Arc::clone(&self.shared);
    let spawned = thread::Builder::new()
      .name(format!("{}-{}", self.shared.name, id))
      .spawn(move || worker_loop(shared));

    match spawned {
      Ok(handle) => {
        let mut workers = self.workers.lock();
        workers.retain(|handle| !handle.is_finished());
        workers.push(handle);
        Ok(())
      }
      Err(err) => {
        let mut counts = self.shared.counts.lock();
        counts.live -= 1;
        counts.idle -= 1;
        Err(err)
      }
    }
  }

  /// Stops accepting work, lets queued jobs finish and waits up to `timeout`
  /// for workers to exit. Returns `false` if some were still busy when the
  /// timeout hit; those threads are detached.
  ///
  /// Safe to call from one of the pool's own workers: that worker is not
  /// waited for.
  pub fn shutdown(&self, timeout: Duration) -> bool {
    let Some(sender) = self.tx.lock().take() else {
      return true;
    };
    drop(sender);

    let current = thread::current().id();
    let workers = std::mem::take(&mut *self.workers.lock());
    let on_pool_thread = workers
      .iter()
      .any(|handle| handle.thread().id() == current && !handle.is_finished());
    let floor = usize::from(on_pool_thread);

    let deadline = Instant::now() + timeout;
    let mut drained = true;
    let mut counts = self.shared.counts.lock();
    while counts.live > floor {
      let remaining = deadline.saturating_duration_since(Instant::now());
      if remaining.is_zero() {
        drained = false;
        break;
      }
      let (guard, _) = self.shared.exited.wait_timeout(counts, remaining);
      counts = guard;
    }
    let still_busy = counts.live - floor.min(counts.live);
    drop(counts);

    for handle in workers {
      if handle.thread().id() != current && handle.is_finished() {
        let _ = handle.join();
      }
    }

    if drained {
      debug!("{}: drained", self.shared.name);
    } else {
      warn!(
        "{}: {} worker(s) still busy after {:?}, detaching",
        self.shared.name, still_busy, timeout
      );
    }
    drained
  }

  #[cfg(test)]
  fn is_shut_down(&self) -> bool {
    self.tx.lock().is_none()
  }

  #[cfg(test)]
  fn live(&self) -> usize {
    self.shared.counts.lock().live
  }
}

impl Drop for ThreadPool {
  fn drop(&mut self) {
    // Disconnects the channel; workers exit once the queue is empty.
    self.tx.lock().take();
  }
}

fn worker_loop(shared: Arc<Shared>) {
  loop {
    match shared.rx.recv_timeout(shared.idle_retire) {
      Ok(job) => {
        {
          let mut counts = shared.counts.lock();
          counts.queued -= 1;
          counts.idle -= 1;
        }
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
          error!("{}: job panicked", shared.name);
        }
        shared.counts.lock().idle += 1;
      }
      Err(RecvTimeoutError::Timeout) => {
        // Decided and counted out under one lock, so idle workers timing
        // out together never retire below `min`.
        let mut counts = shared.counts.lock();
        if counts.live > shared.min {
          retire(&shared, &mut counts);
          return;
        }
      }
      Err(RecvTimeoutError::Disconnected) => break,
    }
  }

  let mut counts = shared.counts.lock();
  retire(&shared, &mut counts);
}

fn retire(shared: &Shared, counts: &mut Counts) {
  counts.live -= 1;
  counts.idle -= 1;
  shared.exited.notify_all();
}
