use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use super::clock::Clock;
use super::ledger::Metrics;

/// Error-message fragments meaning the input itself is too big for the collaborator
pub const SATURATION_MARKERS: &[&str] = &[
    "too large",
    "context length",
    "context_length",
    "context window",
    "maximum context",
    "token limit",
    "reduce the length",
    "payload too large",
];

/// Failures that retrying the same input in the same run will not fix
#[derive(Debug, Clone, PartialEq)]
pub enum PermanentFailure {
    /// The collaborator refused the input as oversized
    InputTooLarge(String),

    /// The collaborator answered but the answer is unusable
    MalformedOutput(String),

    /// A definitive negative verdict, e.g. a quality gate saying no
    Rejected { reason: String, metrics: Metrics },
}

impl PermanentFailure {
    pub fn reason(&self) -> &str {
        match self {
            PermanentFailure::InputTooLarge(reason)
            | PermanentFailure::MalformedOutput(reason)
            | PermanentFailure::Rejected { reason, .. } => reason,
        }
    }
}

/// Classified result of one collaborator call
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Success(T),
    TransientFailure(String),
    PermanentFailure(PermanentFailure),
}

impl<T> Outcome<T> {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Outcome::PermanentFailure(PermanentFailure::MalformedOutput(reason.into()))
    }

    pub fn rejected(reason: impl Into<String>, metrics: Metrics) -> Self {
        Outcome::PermanentFailure(PermanentFailure::Rejected {
            reason: reason.into(),
            metrics,
        })
    }

    /// Classify a collaborator error by its message
    pub fn from_error(error: &anyhow::Error) -> Self {
        let message = format!("{:#}", error);
        if is_saturation(&message) {
            Outcome::PermanentFailure(PermanentFailure::InputTooLarge(message))
        } else {
            Outcome::TransientFailure(message)
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// Map the payload, keeping failures as they are
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Success(value) => Outcome::Success(f(value)),
            Outcome::TransientFailure(reason) => Outcome::TransientFailure(reason),
            Outcome::PermanentFailure(failure) => Outcome::PermanentFailure(failure),
        }
    }
}

impl<T> From<anyhow::Result<T>> for Outcome<T> {
    fn from(result: anyhow::Result<T>) -> Self {
        match result {
            Ok(value) => Outcome::Success(value),
            Err(e) => Outcome::from_error(&e),
        }
    }
}

/// Whether an error message carries a known saturation marker
pub fn is_saturation(message: &str) -> bool {
    let lower = message.to_lowercase();
    SATURATION_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// How a stage reacts to transient failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Sleep `backoff` and retry the same item until it succeeds or fails permanently
    BlockUntilResolved {
        #[serde(with = "seconds")]
        backoff: Duration,
    },

    /// Record the failure and move on; the next run retries the item
    SingleAttempt,
}

/// Result of invoking a collaborator through the adapter
#[derive(Debug)]
pub struct Invocation<T> {
    pub outcome: Outcome<T>,
    pub attempts: u32,
}

/// Invokes one collaborator call under a retry policy
pub struct CallAdapter<'a> {
    policy: RetryPolicy,
    clock: &'a dyn Clock,
}

impl<'a> CallAdapter<'a> {
    pub fn new(policy: RetryPolicy, clock: &'a dyn Clock) -> Self {
        Self { policy, clock }
    }

    pub async fn invoke<T, F, Fut>(&self, item_id: &str, mut call: F) -> Invocation<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Outcome<T>>,
    {
        let mut attempts = 0;

        loop {
            attempts += 1;
            let outcome = call().await;

            match (&outcome, self.policy) {
                (Outcome::TransientFailure(reason), RetryPolicy::BlockUntilResolved { backoff }) => {
                    tracing::warn!(
                        "{}: attempt {} failed ({}), retrying in {}s",
                        item_id,
                        attempts,
                        reason,
                        backoff.as_secs_f64()
                    );
                    self.clock.sleep(backoff).await;
                }
                _ => return Invocation { outcome, attempts },
            }
        }
    }
}

mod seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
