use std::time::{Duration, Instant};

use crate::context::Pending;
use crate::sync::{Condvar, Mutex};
use crate::types::NativeHandle;

/// Per-handle completion routing.
///
/// Created by [`IoCore::associate_handle`](crate::IoCore::associate_handle).
/// Tracks how many operations on the handle have been submitted but not yet
/// handed to the user pool, so `close()` can wait for them.
pub struct IoRegistration {
  handle: NativeHandle,
  token: u64,
  outstanding: Mutex<usize>,
  drained: Condvar,
  pub(crate) pending: Pending,
}

impl IoRegistration {
  pub(crate) fn new(handle: NativeHandle, token: u64) -> Self {
    Self {
      handle,
      token,
      outstanding: Mutex::new(0),
      drained: Condvar::new(),
      pending: Pending::default(),
    }
  }

  pub fn handle(&self) -> NativeHandle {
    self.handle
  }

  /// Key the completion source reports events under.
  pub fn token(&self) -> u64 {
    self.token
  }

  pub fn outstanding(&self) -> usize {
    *self.outstanding.lock()
  }

  /// Expect one more completion.
  pub(crate) fn start_io(&self) {
    *self.outstanding.lock() += 1;
  }

  /// The expected completion will never arrive.
  pub(crate) fn cancel_io(&self) {
    self.finish_io();
  }

  /// A completion was handed off.
  pub(crate) fn finish_io(&self) {
    let mut outstanding = self.outstanding.lock();
    debug_assert!(*outstanding > 0, "completion without a matching start");
    *outstanding = outstanding.saturating_sub(1);
    if *outstanding == 0 {
      self.drained.notify_all();
    }
  }

  /// Blocks until every outstanding completion has been handed off or
  /// `timeout` elapses. Returns `false` on timeout.
  pub(crate) fn wait_for_callbacks(&self, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut outstanding = self.outstanding.lock();
    while *outstanding > 0 {
      let remaining = deadline.saturating_duration_since(Instant::now());
      if remaining.is_zero() {
        return false;
      }
      let (guard, _) = self.drained.wait_timeout(outstanding, remaining);
      outstanding = guard;
    }
    true
  }
}
