use std::result::Result as StdResult;
use std::thread::sleep;
use std::time::{Duration, Instant};

use log::warn;
use rand::Rng;
use thiserror::Error;

use crate::error::{DriverError, Result};

// imports for docs
#[allow(unused)]
use crate::session::Session;

/// Decides whether, and after which pause, failed work is attempted again.
///
/// Used by [`Session::execute_read()`]/[`Session::execute_write()`] and
/// `TransactionBuilder::run_with_retry()`.
/// [`ExponentialBackoff`] is the stock implementation.
pub trait RetryPolicy {
    type Error;

    fn execute<R>(&self, work: impl FnMut() -> Result<R>) -> StdResult<R, Self::Error>;
}

/// Retry with exponentially growing, jittered pauses until a total retry
/// window is exhausted.
///
/// With the defaults, the pauses are 1s, 2s, 4s, ... each multiplied by a
/// random factor in `0.8..=1.2`, and the policy gives up once more than 30
/// seconds have passed since the end of the first attempt.
///
/// Only errors for which [`DriverError::is_retryable()`] holds are retried;
/// everything else is returned as [`RetryError::DriverError`] immediately.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_retry_time: Duration,
    factor: f64,
    jitter: f64,
}

impl ExponentialBackoff {
    /// Same as [`ExponentialBackoff::default()`].
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// The total retry window (*default*: 30 seconds).
    #[inline]
    pub fn with_max_retry_time(self, max_retry_time: Duration) -> Self {
        Self {
            max_retry_time,
            ..self
        }
    }

    /// The pause before the first retry (*default*: 1 second).
    #[inline]
    pub fn with_initial_retry_delay(self, initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            ..self
        }
    }

    /// The factor by which the pause grows per attempt (*default*: 2.0).
    #[inline]
    pub fn with_retry_delay_multiplier(self, factor: f64) -> Self {
        Self { factor, ..self }
    }

    /// The relative jitter applied to every pause (*default*: 0.2, i.e.,
    /// ±20%). Must be in `0.0..1.0`.
    #[inline]
    pub fn with_retry_delay_jitter(self, jitter: f64) -> Self {
        Self { jitter, ..self }
    }

    fn max_retries(&self) -> usize {
        /*
        init * min_jitter * (factor^0 + factor^1 + ... + factor^x)
          = init * min_jitter * (factor^(x+1) - 1) / (factor - 1)  <=  max_time
        solved for x, conservatively dropping the -1 terms
         */
        assert!(self.initial_delay > Duration::ZERO);
        assert!(self.max_retry_time > Duration::ZERO);
        let max_time = self.max_retry_time.as_secs_f64();
        let init = self.initial_delay.as_secs_f64();
        let min_jitter = self.factor * self.jitter;
        ((1.0 + max_time / (init * min_jitter)).log(self.factor) - 1.0).ceil() as usize
    }
}

impl Default for ExponentialBackoff {
    #[inline]
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_retry_time: Duration::from_secs(30),
            factor: 2.0,
            jitter: 0.2,
        }
    }
}

/// Returned by [`ExponentialBackoff`]: the work failed non-retryably, or the
/// retry window closed.
#[derive(Error, Debug)]
pub enum RetryError {
    /// The work failed with a non-retryable driver error.
    #[error("non-retryable error occurred: {0}")]
    DriverError(#[from] DriverError),
    /// The retry window closed.
    #[error("{0}")]
    Timeout(#[from] RetryTimeoutError),
}

/// The retry window closed; all errors encountered along the way are
/// collected in [`RetryTimeoutError::errors`].
#[derive(Error, Debug)]
#[error("timeout occurred while retrying; last error: {}", .errors.last().expect("constructed with at least one error"))]
pub struct RetryTimeoutError {
    pub errors: Vec<DriverError>,
}

impl From<RetryTimeoutError> for Vec<DriverError> {
    fn from(value: RetryTimeoutError) -> Self {
        value.errors
    }
}

impl RetryPolicy for &ExponentialBackoff {
    type Error = RetryError;

    fn execute<R>(&self, mut work: impl FnMut() -> Result<R>) -> StdResult<R, Self::Error> {
        assert!(self.jitter >= 0.0);
        assert!(self.jitter < 1.0);
        let mut time_start = None;
        let mut errors = None;
        let mut current_delay = self.initial_delay.as_secs_f64();
        let mut rng = rand::thread_rng();
        loop {
            let res = work();
            if time_start.is_none() {
                time_start = Some(Instant::now());
            }
            let err = match res {
                Err(e) if e.is_retryable() => e,
                _ => return res.map_err(Into::into),
            };
            errors
                .get_or_insert_with(|| Vec::with_capacity(self.max_retries()))
                .push(err);
            let time_elapsed = time_start.expect("set above").elapsed();
            if time_elapsed > self.max_retry_time {
                return Err(RetryTimeoutError {
                    errors: errors.expect("at least one error pushed above"),
                }
                .into());
            }
            let jitter_factor = 1.0 + rng.gen_range(-self.jitter..=self.jitter);
            let jittered_delay = current_delay * jitter_factor;
            warn!(
                "transaction failed and will be retried in {:.4} seconds: {}",
                jittered_delay,
                errors
                    .as_ref()
                    .and_then(|errors| errors.last())
                    .expect("at least one error pushed above")
            );
            sleep(Duration::try_from_secs_f64(jittered_delay).unwrap_or(Duration::MAX));
            current_delay *= self.factor;
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    type Error = <&'static ExponentialBackoff as RetryPolicy>::Error;

    fn execute<R>(&self, work: impl FnMut() -> Result<R>) -> StdResult<R, Self::Error> {
        (&self).execute(work)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServerError;

    fn retryable_error() -> DriverError {
        DriverError::disconnect("server gone")
    }

    fn non_retryable_error() -> DriverError {
        ServerError::new("Neo.ClientError.Statement.SyntaxError".into(), "nope".into()).into()
    }

    fn tight_policy() -> ExponentialBackoff {
        ExponentialBackoff::new()
            .with_initial_retry_delay(Duration::from_millis(1))
            .with_max_retry_time(Duration::from_millis(50))
    }

    #[test]
    fn returns_first_success() {
        let mut count = 0;
        let res: StdResult<i32, _> = tight_policy().execute(|| {
            count += 1;
            Ok(42)
        });
        assert_eq!(res.unwrap(), 42);
        assert_eq!(count, 1);
    }

    #[test]
    fn does_not_retry_non_retryable_errors() {
        let mut count = 0;
        let res: StdResult<(), _> = tight_policy().execute(|| {
            count += 1;
            Err(non_retryable_error())
        });
        assert!(matches!(res, Err(RetryError::DriverError(_))));
        assert_eq!(count, 1);
    }

    #[test]
    fn retries_until_window_closes() {
        let start = Instant::now();
        let mut count = 0;
        let res: StdResult<(), _> = tight_policy().execute(|| {
            count += 1;
            Err(retryable_error())
        });
        let Err(RetryError::Timeout(timeout)) = res else {
            panic!("expected retry timeout");
        };
        assert!(count > 1);
        assert_eq!(timeout.errors.len(), count);
        // the loop gives up once the window is exceeded; it never sleeps
        // longer than one (jittered) delay past the window
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn recovers_when_work_starts_succeeding() {
        let mut count = 0;
        let res: StdResult<i32, _> = tight_policy().execute(|| {
            count += 1;
            if count < 3 {
                Err(retryable_error())
            } else {
                Ok(count)
            }
        });
        assert_eq!(res.unwrap(), 3);
    }
}
