//! Dispatch Pipeline (C8): routes a claimed record, invokes its handler,
//! and resolves the outcome through the retry policy engine into a
//! retry / fallback / permanent-failure transition written back to
//! storage.

use std::sync::Arc;

use chrono::Utc;
use obx_handlers::HandlerRegistry;
use obx_retry::{ErrorClassifier, RetryDecision, RetryPolicy};
use obx_routing::RoutingTable;
use obx_schemas::{DispatcherError, FailureContext, HandlerOutcome, Metadata, Record};
use sqlx::PgPool;

pub struct Pipeline {
    pub pool: PgPool,
    pub handlers: Arc<HandlerRegistry>,
    pub routing: Arc<RoutingTable>,
    pub default_retry_policy: RetryPolicy,
    pub classifier: Option<Arc<dyn ErrorClassifier>>,
    /// Deletion of completed records happens inside `mark_completed` rather
    /// than a separate sweeper.
    pub delete_on_complete: bool,
}

impl Pipeline {
    /// Processes one already-claimed record to completion (one terminal
    /// transition: COMPLETED, RETRY_SCHEDULED, or FAILED). Returns the
    /// transition that was recorded, for the caller to log/trace.
    #[tracing::instrument(skip(self, record), fields(record_id = %record.id, key = %record.key))]
    pub async fn process(&self, record: Record) -> Result<Transition, DispatcherError> {
        let routed = self.routing.route_or_identity(&record);

        if !routed.dispatch {
            obx_db::mark_completed(&self.pool, record.id, self.delete_on_complete).await?;
            return Ok(Transition::Completed);
        }

        let metadata = Metadata {
            record_id: record.id,
            key: routed.key.clone(),
            payload_type: routed.target.clone(),
            attempt: record.attempt,
            context: record.context.clone(),
        };

        // Primary stage: the at-most-one typed handler, then every
        // registered generic handler, invoked in order. Any handler raising
        // a non-success outcome short-circuits the chain.
        let chain = self.handlers.resolve_chain(&routed.target);
        let outcome = if chain.is_empty() {
            HandlerOutcome::NonRetryable(anyhow::anyhow!(
                "no handler registered for target {:?}",
                routed.target
            ))
        } else {
            let mut outcome = HandlerOutcome::Success;
            for handler in &chain {
                outcome = handler.handle(routed.payload.clone(), metadata.clone()).await;
                if !outcome.is_success() {
                    break;
                }
            }
            outcome
        };

        if outcome.is_success() {
            obx_db::mark_completed(&self.pool, record.id, self.delete_on_complete).await?;
            return Ok(Transition::Completed);
        }

        let decision = self.default_retry_policy.decide(&outcome, record.attempt, self.classifier.as_deref());
        let err_string = match &outcome {
            HandlerOutcome::Retryable(e) | HandlerOutcome::NonRetryable(e) => e.to_string(),
            HandlerOutcome::Success => unreachable!(),
        };

        match decision {
            RetryDecision::Retry { delay } => {
                let available_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                obx_db::schedule_retry(&self.pool, record.id, available_at, &err_string).await?;
                Ok(Transition::RetryScheduled { delay })
            }
            RetryDecision::Fallback { increment_failure_count } => {
                if let Some(fallback) = self.handlers.resolve_fallback(&routed.target) {
                    let failure = FailureContext {
                        record_id: record.id,
                        key: routed.key.clone(),
                        payload_type: routed.target.clone(),
                        attempt: record.attempt,
                        failure_count: record.failure_count + increment_failure_count as i32,
                        last_error: err_string.clone(),
                        context: record.context.clone(),
                    };
                    match fallback.handle_failure(routed.payload.clone(), failure).await {
                        // A fallback that returns normally recovers the
                        // record: it completes rather than failing.
                        Ok(()) => {
                            obx_db::mark_completed(&self.pool, record.id, self.delete_on_complete).await?;
                            return Ok(Transition::Completed);
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "fallback handler itself failed, record moves to FAILED");
                        }
                    }
                }
                obx_db::mark_failed_permanent(&self.pool, record.id, &err_string, increment_failure_count).await?;
                Ok(Transition::Failed)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Completed,
    RetryScheduled { delay: std::time::Duration },
    Failed,
}
