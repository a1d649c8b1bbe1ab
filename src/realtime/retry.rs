// Copyright (C) 2024 The kiwoom Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::time::Duration;

use rand::thread_rng;
use rand::Rng as _;


/// The delay between reconnect attempts used by default.
const DEFAULT_DELAY: Duration = Duration::from_secs(5);


/// A policy describing how a realtime session retries establishing a
/// lost connection.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
  /// The maximum number of attempts, if any.
  max_attempts: Option<u32>,
  /// The delay before the first attempt.
  initial_delay: Duration,
  /// The upper bound on the delay between attempts.
  max_delay: Duration,
  /// Whether delays double with every attempt.
  exponential: bool,
  /// Whether to randomize delays.
  jitter: bool,
}

impl RetryPolicy {
  /// Create a policy retrying indefinitely after a fixed `delay`.
  pub fn fixed(delay: Duration) -> Self {
    Self {
      max_attempts: None,
      initial_delay: delay,
      max_delay: delay,
      exponential: false,
      jitter: false,
    }
  }

  /// Create a policy retrying indefinitely, starting out with
  /// `initial` and doubling the delay with each attempt up to `max`.
  pub fn exponential(initial: Duration, max: Duration) -> Self {
    Self {
      max_attempts: None,
      initial_delay: initial,
      max_delay: max.max(initial),
      exponential: true,
      jitter: false,
    }
  }

  /// Give up after `attempts` unsuccessful attempts.
  pub fn with_max_attempts(mut self, attempts: u32) -> Self {
    self.max_attempts = Some(attempts);
    self
  }

  /// Enable or disable randomization of delays.
  ///
  /// With jitter enabled each delay is scaled by a random factor
  /// between one half and one.
  pub fn with_jitter(mut self, jitter: bool) -> Self {
    self.jitter = jitter;
    self
  }

  /// Retrieve the delay before the given attempt, counted starting at
  /// one, or `None` if no more attempts should be made.
  pub fn delay(&self, attempt: u32) -> Option<Duration> {
    if attempt == 0 {
      return Some(Duration::ZERO)
    }

    if let Some(max_attempts) = self.max_attempts {
      if attempt > max_attempts {
        return None
      }
    }

    let delay = if self.exponential {
      let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
      self
        .initial_delay
        .checked_mul(factor)
        .unwrap_or(self.max_delay)
        .min(self.max_delay)
    } else {
      self.initial_delay
    };

    let delay = if self.jitter {
      delay.mul_f64(thread_rng().gen_range(0.5..=1.0))
    } else {
      delay
    };
    Some(delay)
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::fixed(DEFAULT_DELAY)
  }
}
