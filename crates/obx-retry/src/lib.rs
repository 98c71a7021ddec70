//! Retry policy engine: turns a handler's outcome and a record's attempt
//! count into a delay-and-retry, fall-through-to-fallback, or
//! permanent-failure decision.

use std::time::Duration;

use obx_schemas::HandlerOutcome;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff shape between successive retry attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    Linear { base_ms: u64, increment_ms: u64 },
    Exponential { base_ms: u64, multiplier: f64, max_ms: u64 },
}

impl Backoff {
    /// Base delay for the given 1-indexed attempt, before jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ms = match self {
            Backoff::Fixed { delay_ms } => *delay_ms,
            Backoff::Linear { base_ms, increment_ms } => {
                base_ms.saturating_add(increment_ms.saturating_mul(attempt.saturating_sub(1) as u64))
            }
            Backoff::Exponential { base_ms, multiplier, max_ms } => {
                let raw = (*base_ms as f64) * multiplier.powi(attempt.saturating_sub(1) as i32);
                (raw as u64).min(*max_ms)
            }
        };
        Duration::from_millis(ms)
    }
}

/// How much random jitter to apply on top of the computed base delay.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Jitter {
    /// No randomization.
    None,
    /// Delay is uniformly sampled from `[0, base]`.
    Full,
    /// Delay is `base/2 + uniform(0, base/2)`.
    Equal,
}

impl Jitter {
    pub fn apply(&self, base: Duration) -> Duration {
        self.apply_with(base, &mut rand::thread_rng())
    }

    fn apply_with(&self, base: Duration, rng: &mut impl Rng) -> Duration {
        match self {
            Jitter::None => base,
            Jitter::Full => Duration::from_millis(rng.gen_range(0..=base.as_millis() as u64)),
            Jitter::Equal => {
                let half = base.as_millis() as u64 / 2;
                Duration::from_millis(half + rng.gen_range(0..=half.max(1)))
            }
        }
    }
}

/// Tags a non-retryable and retryable error apart from the handler's own
/// `HandlerOutcome` classification. A handler marks its error Retryable or
/// NonRetryable up front; the classifier lets operators additionally
/// override that per named error kind (e.g. "a `Retryable` timeout should
/// still not retry once we've seen three of them"), matching the
/// retryOn/noRetryOn allow-list pattern operators configure per handler.
pub trait ErrorClassifier: Send + Sync {
    /// Returns a short kind tag for the error, or `None` if this
    /// classifier has no opinion (falls through to the handler's own
    /// Retryable/NonRetryable classification).
    fn classify(&self, err: &anyhow::Error) -> Option<String>;
}

/// Wraps a handler's error with an explicit named kind so it can be
/// matched against `retry_on`/`no_retry_on` without every handler
/// implementing its own classifier. A handler that wants its error kind
/// respected by the allow/deny lists constructs its `HandlerOutcome`
/// around one of these instead of a bare `anyhow!(...)`.
#[derive(Debug)]
pub struct ClassifiedError {
    kind: String,
    source: anyhow::Error,
}

impl ClassifiedError {
    pub fn new(kind: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self { kind: kind.into(), source: source.into() }
    }
}

impl std::fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for ClassifiedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.source()
    }
}

/// The classifier wired in by default: it has no opinion on an error
/// unless the handler tagged it with [`ClassifiedError`] somewhere in
/// its source chain, in which case it returns the declared kind.
/// `retry.includeExceptions`/`excludeExceptions` are inert against
/// untagged errors, same as passing no classifier at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultErrorClassifier;

impl ErrorClassifier for DefaultErrorClassifier {
    fn classify(&self, err: &anyhow::Error) -> Option<String> {
        err.chain().find_map(|cause| cause.downcast_ref::<ClassifiedError>()).map(|c| c.kind.clone())
    }
}

/// The decision the retry policy engine hands back to the dispatch
/// pipeline after a handler invocation fails.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Schedule another attempt after `delay`.
    Retry { delay: Duration },
    /// Retries are exhausted or disallowed; proceed to the fallback
    /// handler. `increment_failure_count` is false when the error was
    /// non-retryable from the start — it never occupied a retry slot.
    Fallback { increment_failure_count: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub jitter: Jitter,
    /// If non-empty, only these error kinds are retried; anything else
    /// falls straight through to the fallback stage.
    #[serde(default)]
    pub retry_on: Vec<String>,
    /// Error kinds that are never retried regardless of `retry_on` or
    /// remaining attempts.
    #[serde(default)]
    pub no_retry_on: Vec<String>,
}

impl RetryPolicy {
    /// Decide what to do after `outcome` on `attempt` (1-indexed, the
    /// attempt that just ran), optionally consulting `classifier` for a
    /// named error kind.
    pub fn decide(
        &self,
        outcome: &HandlerOutcome,
        attempt: u32,
        classifier: Option<&dyn ErrorClassifier>,
    ) -> RetryDecision {
        let err = match outcome {
            HandlerOutcome::Success => {
                unreachable!("decide() is only called after a failing outcome")
            }
            HandlerOutcome::NonRetryable(_) => {
                return RetryDecision::Fallback { increment_failure_count: false };
            }
            HandlerOutcome::Retryable(e) => e,
        };

        let kind = classifier.and_then(|c| c.classify(err));

        if let Some(kind) = &kind {
            if self.no_retry_on.iter().any(|k| k == kind) {
                return RetryDecision::Fallback { increment_failure_count: false };
            }
            if !self.retry_on.is_empty() && !self.retry_on.iter().any(|k| k == kind) {
                return RetryDecision::Fallback { increment_failure_count: false };
            }
        }

        if attempt >= self.max_attempts {
            return RetryDecision::Fallback { increment_failure_count: true };
        }

        let base = self.backoff.delay_for_attempt(attempt + 1);
        let delay = self.jitter.apply(base);
        RetryDecision::Retry { delay }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn policy(max_attempts: u32, backoff: Backoff) -> RetryPolicy {
        RetryPolicy { max_attempts, backoff, jitter: Jitter::None, retry_on: vec![], no_retry_on: vec![] }
    }

    #[test]
    fn fixed_backoff_delay_is_constant() {
        let b = Backoff::Fixed { delay_ms: 500 };
        assert_eq!(b.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(b.delay_for_attempt(5), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_grows_by_increment() {
        let b = Backoff::Linear { base_ms: 100, increment_ms: 50 };
        assert_eq!(b.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(b.delay_for_attempt(2), Duration::from_millis(150));
        assert_eq!(b.delay_for_attempt(3), Duration::from_millis(200));
    }

    #[test]
    fn exponential_backoff_caps_at_max() {
        let b = Backoff::Exponential { base_ms: 1000, multiplier: 2.0, max_ms: 5000 };
        assert_eq!(b.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(b.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(b.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(b.delay_for_attempt(4), Duration::from_millis(5000));
        assert_eq!(b.delay_for_attempt(10), Duration::from_millis(5000));
    }

    #[test]
    fn jitter_full_stays_within_bounds() {
        let base = Duration::from_millis(1000);
        let mut rng = rand::rngs::mock::StepRng::new(0, 1);
        let d = Jitter::Full.apply_with(base, &mut rng);
        assert!(d <= base);
    }

    #[test]
    fn non_retryable_outcome_always_falls_through_without_incrementing() {
        let p = policy(5, Backoff::Fixed { delay_ms: 10 });
        let outcome = HandlerOutcome::NonRetryable(anyhow!("bad payload"));
        let decision = p.decide(&outcome, 1, None);
        assert_eq!(decision, RetryDecision::Fallback { increment_failure_count: false });
    }

    #[test]
    fn retryable_outcome_retries_until_max_attempts() {
        let p = policy(3, Backoff::Fixed { delay_ms: 10 });
        let outcome = HandlerOutcome::Retryable(anyhow!("timeout"));
        assert!(matches!(p.decide(&outcome, 1, None), RetryDecision::Retry { .. }));
        assert!(matches!(p.decide(&outcome, 2, None), RetryDecision::Retry { .. }));
        assert_eq!(
            p.decide(&outcome, 3, None),
            RetryDecision::Fallback { increment_failure_count: true }
        );
    }

    #[test]
    fn empty_retry_on_and_no_retry_on_means_retry_everything() {
        let p = policy(5, Backoff::Fixed { delay_ms: 10 });
        let outcome = HandlerOutcome::Retryable(anyhow!("anything"));
        assert!(matches!(p.decide(&outcome, 1, None), RetryDecision::Retry { .. }));
    }

    struct TagClassifier(&'static str);
    impl ErrorClassifier for TagClassifier {
        fn classify(&self, _err: &anyhow::Error) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    #[test]
    fn no_retry_on_overrides_retryable_outcome() {
        let mut p = policy(5, Backoff::Fixed { delay_ms: 10 });
        p.no_retry_on = vec!["constraint_violation".to_string()];
        let outcome = HandlerOutcome::Retryable(anyhow!("fk violation"));
        let classifier = TagClassifier("constraint_violation");
        assert_eq!(
            p.decide(&outcome, 1, Some(&classifier)),
            RetryDecision::Fallback { increment_failure_count: false }
        );
    }

    #[test]
    fn default_classifier_reads_the_kind_off_a_classified_error() {
        let classifier = DefaultErrorClassifier;
        let err = anyhow::Error::new(ClassifiedError::new("rate_limit", anyhow!("429")));
        assert_eq!(classifier.classify(&err), Some("rate_limit".to_string()));
    }

    #[test]
    fn default_classifier_has_no_opinion_on_an_untagged_error() {
        let classifier = DefaultErrorClassifier;
        let err = anyhow!("plain failure");
        assert_eq!(classifier.classify(&err), None);
    }

    #[test]
    fn retry_on_allowlist_excludes_unlisted_kinds() {
        let mut p = policy(5, Backoff::Fixed { delay_ms: 10 });
        p.retry_on = vec!["timeout".to_string()];
        let outcome = HandlerOutcome::Retryable(anyhow!("rate limited"));
        let classifier = TagClassifier("rate_limit");
        assert_eq!(
            p.decide(&outcome, 1, Some(&classifier)),
            RetryDecision::Fallback { increment_failure_count: false }
        );
    }
}
