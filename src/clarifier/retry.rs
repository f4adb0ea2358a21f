//! Bounded retry
//!
//! `Pending → Retrying(n) → {Succeeded, Exhausted}`. The policy is kept apart
//! from the model call so it can be exercised with any attempt closure.

use std::future::Future;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Pending,
    /// Number of attempts already made
    Retrying(u32),
    Succeeded,
    Exhausted,
}

impl AttemptState {
    /// Next state after an attempt. `attempts` counts the one just made.
    pub fn advance(self, accepted: bool, attempts: u32, max_attempts: u32) -> Self {
        match self {
            AttemptState::Succeeded | AttemptState::Exhausted => self,
            _ if accepted => AttemptState::Succeeded,
            _ if attempts >= max_attempts => AttemptState::Exhausted,
            _ => AttemptState::Retrying(attempts),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptState::Succeeded | AttemptState::Exhausted)
    }
}

/// Verdict of a single attempt
#[derive(Debug)]
pub enum AttemptOutcome<T> {
    Accept(T),
    Reject(String),
}

#[derive(Debug)]
pub enum RetryOutcome<T> {
    Succeeded { value: T, attempts: u32 },
    Exhausted { attempts: u32, failures: Vec<String> },
}

impl<T> RetryOutcome<T> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Succeeded { attempts, .. } | RetryOutcome::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Run `attempt` until it is accepted or `max_attempts` is reached.
/// The closure receives the 1-based attempt number.
pub async fn run_bounded<T, F, Fut>(max_attempts: u32, stage: &str, mut attempt: F) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = AttemptOutcome<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut state = AttemptState::Pending;
    let mut attempts = 0;
    let mut failures = Vec::new();

    while !state.is_terminal() {
        attempts += 1;

        match attempt(attempts).await {
            AttemptOutcome::Accept(value) => {
                debug!(stage, attempt = attempts, "Attempt accepted");
                return RetryOutcome::Succeeded { value, attempts };
            }
            AttemptOutcome::Reject(reason) => {
                warn!(stage, attempt = attempts, max_attempts, reason = %reason, "Attempt rejected");
                failures.push(reason);
                state = state.advance(false, attempts, max_attempts);
            }
        }
    }

    RetryOutcome::Exhausted { attempts, failures }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let state = AttemptState::Pending;
        let state = state.advance(false, 1, 3);
        assert_eq!(state, AttemptState::Retrying(1));
        let state = state.advance(false, 2, 3);
        assert_eq!(state, AttemptState::Retrying(2));
        assert_eq!(state.advance(false, 3, 3), AttemptState::Exhausted);
        assert_eq!(state.advance(true, 3, 3), AttemptState::Succeeded);
        assert_eq!(AttemptState::Exhausted.advance(true, 4, 3), AttemptState::Exhausted);
    }

    #[tokio::test]
    async fn test_exhausts_after_max_attempts() {
        let mut seen = Vec::new();
        let outcome: RetryOutcome<()> = run_bounded(3, "test", |n| {
            seen.push(n);
            async move { AttemptOutcome::Reject(format!("bad {}", n)) }
        })
        .await;

        assert_eq!(seen, vec![1, 2, 3]);
        match outcome {
            RetryOutcome::Exhausted { attempts, failures } => {
                assert_eq!(attempts, 3);
                assert_eq!(failures, vec!["bad 1", "bad 2", "bad 3"]);
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stops_at_first_accept() {
        let outcome = run_bounded(3, "test", |n| async move {
            if n == 2 {
                AttemptOutcome::Accept("ok")
            } else {
                AttemptOutcome::Reject("nope".to_string())
            }
        })
        .await;

        assert!(matches!(outcome, RetryOutcome::Succeeded { value: "ok", attempts: 2 }));
    }

    #[tokio::test]
    async fn test_zero_max_still_attempts_once() {
        let outcome: RetryOutcome<()> =
            run_bounded(0, "test", |_| async { AttemptOutcome::Reject("x".to_string()) }).await;
        assert_eq!(outcome.attempts(), 1);
    }
}
