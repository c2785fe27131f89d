// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Quick-and-dirty polling within a fixed attempt budget
//!
//! The backing primitive for the task poller and the disk readiness
//! gate.  The sleep is cooperative (`tokio::time::sleep`), so a pipeline
//! waiting on a slow remote operation never occupies a worker thread and
//! unrelated pipelines keep making progress.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Result of one check of a polled condition
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CondCheckError<E> {
    /// The condition has not been reached yet; sleep and check again.
    NotYet,
    /// The condition can never be reached; give up immediately.
    Failed(E),
}

impl<E> From<E> for CondCheckError<E> {
    fn from(e: E) -> Self {
        CondCheckError::Failed(e)
    }
}

/// Terminal failure of [`wait_for_condition`]
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum PollError<E: Display> {
    #[error("poll condition failed permanently: {0}")]
    PermanentError(E),
    #[error("poll exhausted {attempts} attempts ({interval:?} apart)")]
    TimedOut { attempts: u32, interval: Duration },
}

/// Check `cond` up to `max_attempts` times, sleeping `interval` after
/// each unsettled check
///
/// Returns the condition's value as soon as it settles, fails
/// permanently as soon as the condition does, and otherwise returns
/// [`PollError::TimedOut`] after exactly `max_attempts * interval` of
/// elapsed wait.
pub async fn wait_for_condition<T, E, Func, Fut>(
    mut cond: Func,
    interval: &Duration,
    max_attempts: u32,
) -> Result<T, PollError<E>>
where
    E: Display,
    Func: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CondCheckError<E>>>,
{
    for _ in 0..max_attempts {
        match cond().await {
            Ok(value) => return Ok(value),
            Err(CondCheckError::Failed(e)) => {
                return Err(PollError::PermanentError(e))
            }
            Err(CondCheckError::NotYet) => {
                tokio::time::sleep(*interval).await
            }
        }
    }
    Err(PollError::TimedOut { attempts: max_attempts, interval: *interval })
}

#[cfg(test)]
mod test {
    use super::wait_for_condition;
    use super::CondCheckError;
    use super::PollError;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_settles_after_several_attempts() {
        let interval = Duration::from_millis(100);
        let checks = AtomicU32::new(0);
        let result = wait_for_condition::<_, String, _, _>(
            || async {
                if checks.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(CondCheckError::NotYet)
                } else {
                    Ok(42)
                }
            },
            &interval,
            10,
        )
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(checks.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_short_circuits() {
        let start = Instant::now();
        let result = wait_for_condition::<(), _, _, _>(
            || async { Err(CondCheckError::Failed("broken")) },
            &Duration::from_secs(5),
            120,
        )
        .await;
        assert_eq!(result, Err(PollError::PermanentError("broken")));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_elapses_exactly_attempts_times_interval() {
        let interval = Duration::from_secs(5);
        let max_attempts = 120;
        let start = Instant::now();
        let result = wait_for_condition::<(), String, _, _>(
            || async { Err(CondCheckError::NotYet) },
            &interval,
            max_attempts,
        )
        .await;
        assert_eq!(
            result,
            Err(PollError::TimedOut { attempts: max_attempts, interval })
        );
        assert_eq!(start.elapsed(), interval * max_attempts);
    }
}
