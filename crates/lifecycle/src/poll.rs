//! Bounded polling with exponential backoff and cancellation.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::PollPolicy;
use crate::tree::ResourcePath;

/// Result of one poll attempt.
pub(crate) enum Step<T> {
    Done(T),
    /// Not there yet; poll again after the next interval.
    Continue,
    /// Terminal failure with a detail message.
    Fail(String),
}

/// How a bounded wait ended.
#[derive(Debug)]
pub(crate) enum PollOutcome<T> {
    Done(T),
    Failed(String),
    TimedOut { attempts: u32 },
    Cancelled,
}

/// Longest wait any deadline is allowed to describe.
const MAX_WAIT: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Absolute deadline `timeout` from now. Budgets beyond [`MAX_WAIT`] are
/// clamped instead of overflowing the clock.
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    Instant::now() + timeout.min(MAX_WAIT)
}

/// Resolves when `cancel` fires, never when there is no token.
async fn cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending::<()>().await,
    }
}

/// Run `check` until it finishes, the policy's timeout or attempt budget is
/// spent, or `cancel` fires.
///
/// The deadline is absolute: a hung `check` and the final sleep are both cut
/// at `policy.timeout` after the first attempt started.
pub(crate) async fn poll_until<T, F, Fut>(
    policy: &PollPolicy,
    cancel: Option<&CancellationToken>,
    resource: &ResourcePath,
    mut check: F,
) -> PollOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Step<T>>,
{
    let deadline = deadline_after(policy.timeout);
    let mut interval = policy.initial_interval;
    let mut attempts = 0u32;

    loop {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return PollOutcome::Cancelled;
        }
        attempts += 1;

        let step = tokio::select! {
            step = tokio::time::timeout_at(deadline, check()) => step,
            () = cancelled(cancel) => return PollOutcome::Cancelled,
        };
        match step {
            Err(_) => return PollOutcome::TimedOut { attempts },
            Ok(Step::Done(value)) => {
                debug!(resource = %resource, attempts, "Poll finished");
                return PollOutcome::Done(value);
            }
            Ok(Step::Fail(detail)) => return PollOutcome::Failed(detail),
            Ok(Step::Continue) => {}
        }

        if policy.max_attempts.is_some_and(|max| attempts >= max) {
            return PollOutcome::TimedOut { attempts };
        }
        let now = Instant::now();
        if now >= deadline {
            return PollOutcome::TimedOut { attempts };
        }

        let wait = interval.min(deadline - now);
        debug!(
            resource = %resource,
            attempt = attempts,
            delay_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
            "Not ready, polling again"
        );
        tokio::select! {
            () = tokio::time::sleep(wait) => {}
            () = cancelled(cancel) => return PollOutcome::Cancelled,
        }
        interval = policy.next_interval(interval);
    }
}
