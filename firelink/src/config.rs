use std::time::Duration;

use crate::error::{ErrorCode, Result};

/// Thread bounds for the two pools owned by an [`IoCore`](crate::IoCore).
///
/// The I/O pool only harvests completions and performs short fixups; the
/// user pool runs completion handlers and may block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoCoreConfig {
  pub io_pool_min_threads: usize,
  pub io_pool_max_threads: usize,
  pub user_pool_min_threads: usize,
  pub user_pool_max_threads: usize,
  /// Upper bound on how long `release()` waits for each pool to drain.
  pub drain_timeout: Duration,
}

impl Default for IoCoreConfig {
  fn default() -> Self {
    Self {
      io_pool_min_threads: 1,
      io_pool_max_threads: 2,
      user_pool_min_threads: 1,
      user_pool_max_threads: 4,
      drain_timeout: Duration::from_millis(5000),
    }
  }
}

impl IoCoreConfig {
  /// Same bounds for both pools.
  pub fn with_threads(min: usize, max: usize) -> Self {
    Self {
      io_pool_min_threads: min,
      io_pool_max_threads: max,
      user_pool_min_threads: min,
      user_pool_max_threads: max,
      ..Self::default()
    }
  }

  pub fn validate(&self) -> Result<()> {
    let pools = [
      (self.io_pool_min_threads, self.io_pool_max_threads),
      (self.user_pool_min_threads, self.user_pool_max_threads),
    ];
    for (min, max) in pools {
      if min == 0 || max == 0 || min > max {
        return Err(ErrorCode::InvalidArgument);
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_is_valid() {
    assert_eq!(IoCoreConfig::default().validate(), Ok(()));
    assert_eq!(IoCoreConfig::with_threads(2, 2).validate(), Ok(()));
  }

  #[test]
  fn rejects_zero_and_inverted_bounds() {
    let zero = IoCoreConfig { io_pool_min_threads: 0, ..Default::default() };
    assert_eq!(zero.validate(), Err(ErrorCode::InvalidArgument));

    let inverted = IoCoreConfig {
      user_pool_min_threads: 3,
      user_pool_max_threads: 1,
      ..Default::default()
    };
    assert_eq!(inverted.validate(), Err(ErrorCode::InvalidArgument));
  }
}
