//! Bounded polling for UI readiness.

use std::thread;
use std::time::{Duration, Instant};

use super::ActuationError;

/// Default bound for every UI wait.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default pause between two readiness checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Polls `check` until it yields a value or the timeout elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Waiter {
    timeout: Duration,
    poll_interval: Duration,
}

impl Default for Waiter {
    fn default() -> Self {
        Self::new(DEFAULT_WAIT_TIMEOUT)
    }
}

impl Waiter {
    /// Creates a waiter with the default poll interval.
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Overrides the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// The wait bound.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs `check` until it returns `Ok(Some(_))`.
    ///
    /// `Ok(None)` means "not ready yet" and is retried. An error that is
    /// fatal to the session aborts the wait immediately; any other error is
    /// treated as "not ready" and only reported if the wait times out
    /// without a later success.
    ///
    /// # Errors
    ///
    /// Returns [`ActuationError::Timeout`] naming `target` once the bound
    /// elapses, or the first session-fatal error.
    pub fn until<T, F>(&self, target: &str, mut check: F) -> Result<T, ActuationError>
    where
        F: FnMut() -> Result<Option<T>, ActuationError>,
    {
        let started = Instant::now();
        loop {
            match check() {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {},
                Err(error) if error.is_session_fatal() => return Err(error),
                Err(error) => {
                    tracing::trace!(target_element = target, %error, "not ready yet");
                },
            }

            let elapsed = started.elapsed();
            if elapsed >= self.timeout {
                tracing::warn!(target_element = target, "timeout waiting for element");
                return Err(ActuationError::timeout(target, elapsed));
            }
            thread::sleep(self.poll_interval.min(self.timeout - elapsed));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    fn quick(timeout_ms: u64) -> Waiter {
        Waiter::new(Duration::from_millis(timeout_ms)).with_poll_interval(Duration::from_millis(5))
    }

    #[test]
    fn test_returns_first_ready_value() {
        let calls = Cell::new(0);
        let value = quick(1_000)
            .until("#ready", || {
                calls.set(calls.get() + 1);
                Ok((calls.get() >= 3).then_some(calls.get()))
            })
            .unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn test_never_ready_times_out_within_bound() {
        let started = Instant::now();
        let err = quick(50)
            .until::<(), _>("#never", || Ok(None))
            .unwrap_err();

        assert!(matches!(err, ActuationError::Timeout { ref target, .. } if target == "#never"));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_transient_errors_are_retried() {
        let calls = Cell::new(0);
        let value = quick(1_000)
            .until("#flaky", || {
                calls.set(calls.get() + 1);
                if calls.get() < 2 {
                    Err(ActuationError::no_such_element("#flaky"))
                } else {
                    Ok(Some("ok"))
                }
            })
            .unwrap();
        assert_eq!(value, "ok");
    }

    #[test]
    fn test_session_fatal_error_aborts_wait() {
        let calls = Cell::new(0);
        let err = quick(1_000)
            .until::<(), _>("#gone", || {
                calls.set(calls.get() + 1);
                Err(ActuationError::SessionLost {
                    reason: "invalid session id".into(),
                })
            })
            .unwrap_err();
        assert!(matches!(err, ActuationError::SessionLost { .. }));
        assert_eq!(calls.get(), 1);
    }
}
