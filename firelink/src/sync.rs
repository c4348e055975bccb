//! Locks that wrap both `parking_lot` and `std::sync`.
//!
//! - Uses `parking_lot` when the `parking_lot` feature is enabled
//! - Falls back to `std::sync` when the feature is disabled
//! - Removes poisoning: a panicking user handler must not wedge the pools

use std::time::Duration;

#[cfg(feature = "parking_lot")]
pub use parking_lot::{Mutex, MutexGuard};

#[cfg(not(feature = "parking_lot"))]
pub use self::std_sync::*;

/// Condition variable paired with [`Mutex`].
///
/// Waits consume and return the guard so the same call shape works for both
/// lock implementations.
#[derive(Default)]
pub struct Condvar {
  #[cfg(feature = "parking_lot")]
  inner: parking_lot::Condvar,
  #[cfg(not(feature = "parking_lot"))]
  inner: std::sync::Condvar,
}

impl Condvar {
  pub const fn new() -> Self {
    Self {
      #[cfg(feature = "parking_lot")]
      inner: parking_lot::Condvar::new(),
      #[cfg(not(feature = "parking_lot"))]
      inner: std::sync::Condvar::new(),
    }
  }

  pub fn notify_all(&self) {
    self.inner.notify_all();
  }

  /// Returns the guard and whether the wait timed out.
  #[cfg(feature = "parking_lot")]
  pub fn wait_timeout<'a, T>(
    &self,
    mut guard: MutexGuard<'a, T>,
    timeout: Duration,
  ) -> (MutexGuard<'a, T>, bool) {
    let result = self.inner.wait_for(&mut guard, timeout);
    (guard, result.timed_out())
  }

  /// Returns the guard and whether the wait timed out.
  #[cfg(not(feature = "parking_lot"))]
  pub fn wait_timeout<'a, T>(
    &self,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
  ) -> (MutexGuard<'a, T>, bool) {
    let (inner, result) = self
      .inner
      .wait_timeout(guard.inner, timeout)
      .unwrap_or_else(|e| e.into_inner());
    (MutexGuard { inner }, result.timed_out())
  }
}

#[cfg(not(feature = "parking_lot"))]
mod std_sync {
  use std::sync as std_sync;

  /// A mutual exclusion primitive that wraps `std::sync::Mutex`.
  ///
  /// Unlike `std::sync::Mutex`, this does not support poisoning.
  #[derive(Default)]
  pub struct Mutex<T: ?Sized> {
    inner: std_sync::Mutex<T>,
  }

  impl<T> Mutex<T> {
    #[inline]
    pub const fn new(value: T) -> Self {
      Self { inner: std_sync::Mutex::new(value) }
    }
  }

  impl<T: ?Sized> Mutex<T> {
    /// Acquires the mutex. Never fails: poisoning is ignored.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T> {
      MutexGuard { inner: self.inner.lock().unwrap_or_else(|e| e.into_inner()) }
    }
  }

  /// When this structure is dropped the lock is released.
  pub struct MutexGuard<'a, T: ?Sized> {
    pub(super) inner: std_sync::MutexGuard<'a, T>,
  }

  impl<T: ?Sized> std::ops::Deref for MutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
      &self.inner
    }
  }

  impl<T: ?Sized> std::ops::DerefMut for MutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
      &mut self.inner
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::thread;

  #[test]
  fn lock_survives_a_panicking_holder() {
    let mutex = Arc::new(Mutex::new(5));
    let clone = Arc::clone(&mutex);

    let _ = thread::spawn(move || {
      let _guard = clone.lock();
      panic!("poison attempt");
    })
    .join();

    assert_eq!(*mutex.lock(), 5);
  }

  #[test]
  fn wait_timeout_reports_timeout() {
    let mutex = Mutex::new(());
    let cond = Condvar::new();

    let guard = mutex.lock();
    let (_guard, timed_out) = cond.wait_timeout(guard, Duration::from_millis(10));
    assert!(timed_out);
  }

  #[test]
  fn notify_wakes_waiter() {
    let pair = Arc::new((Mutex::new(false), Condvar::new()));
    let pair2 = Arc::clone(&pair);

    let handle = thread::spawn(move || {
      let (lock, cond) = &*pair2;
      *lock.lock() = true;
      cond.notify_all();
    });

    let (lock, cond) = &*pair;
    let mut ready = lock.lock();
    while !*ready {
      let (guard, timed_out) = cond.wait_timeout(ready, Duration::from_secs(5));
      ready = guard;
      assert!(!timed_out, "notify never arrived");
    }
    handle.join().unwrap();
  }
}
