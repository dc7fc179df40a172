//! Target queue and report executor
//!
//! Owns the target lifecycle: pending -> processing -> completed | failed,
//! never backward. Claims are exclusive; execution fans a target out over
//! a set of accounts with randomized courtesy delays and an explicit
//! retry policy per attempt.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::data::{Database, ReportLog, Target};
use crate::error::AppError;
use crate::platform::PlatformClient;
use crate::service::accounts::AccountPool;
use crate::service::logs::{LogSink, NewReportLog};

/// Explicit retry policy for one report attempt
///
/// Retryable errors (transport, platform rejection) are retried with
/// exponential backoff up to `max_retries`; everything else is terminal
/// for the attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-based), doubling each
    /// time and clamped at the cap.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.cap)
    }
}

/// Outcome of one target execution
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub target_id: String,
    /// True if at least one account's report was accepted
    pub completed: bool,
    pub logs: Vec<ReportLog>,
}

/// Aggregate outcome of a batch run; always partial-friendly.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchResult {
    pub processed: usize,
    pub completed: usize,
    pub requeued: usize,
    pub failed: usize,
    /// Targets whose claim was lost to a concurrent execution
    pub skipped: usize,
}

/// Report executor over the target queue
#[derive(Clone)]
pub struct ReportExecutor {
    db: Arc<Database>,
    client: Arc<PlatformClient>,
    pool: Arc<AccountPool>,
    sink: Arc<LogSink>,
    retry_policy: RetryPolicy,
    /// Target-level re-queues before the target is marked failed
    max_target_retries: u32,
    /// Concurrent in-flight targets during a batch
    max_concurrency: usize,
}

impl ReportExecutor {
    /// Create a new executor
    pub fn new(
        db: Arc<Database>,
        client: Arc<PlatformClient>,
        pool: Arc<AccountPool>,
        sink: Arc<LogSink>,
        retry_policy: RetryPolicy,
        max_target_retries: u32,
        max_concurrency: usize,
    ) -> Self {
        Self {
            db,
            client,
            pool,
            sink,
            retry_policy,
            max_target_retries,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Execute one target against the given accounts.
    ///
    /// Claims the target exclusively; a lost claim returns
    /// `ClaimConflict` and changes nothing. One ReportLog row is written
    /// per attempt regardless of outcome. Cancellation is honored
    /// between accounts, never mid-request.
    ///
    /// # Errors
    /// `AllAccountsExhausted` once every account failed and the target's
    /// retry budget is spent; the target is marked failed first.
    pub async fn execute_report(
        &self,
        target_id: &str,
        account_ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, AppError> {
        // 1. Exclusive claim
        if !self.db.claim_target(target_id).await? {
            return Err(AppError::ClaimConflict(target_id.to_string()));
        }

        let target = self
            .db
            .get_target(target_id)
            .await?
            .ok_or(AppError::NotFound)?;

        let settings = self.db.load_runtime_settings().await?;
        let (min_delay, max_delay) = settings.delay_window();

        tracing::info!(
            target_id,
            kind = %target.kind,
            identifier = %target.identifier,
            accounts = account_ids.len(),
            "Executing report"
        );

        // 2. Fan over accounts, cancellable between them
        let mut logs = Vec::new();
        let mut any_success = false;
        let mut cancelled = false;

        for account_id in account_ids {
            if cancel.is_cancelled() {
                cancelled = true;
                tracing::info!(target_id, "Report execution cancelled between accounts");
                break;
            }

            let (attempt_logs, success) = self
                .attempt_with_account(&target, account_id, min_delay, max_delay)
                .await?;
            logs.extend(attempt_logs);
            any_success |= success;
        }

        // 3. Resolve the target's state
        if any_success {
            self.db.complete_target(target_id).await?;
            crate::metrics::TARGETS_COMPLETED_TOTAL
                .with_label_values(&["completed"])
                .inc();
            return Ok(ExecutionOutcome {
                target_id: target_id.to_string(),
                completed: true,
                logs,
            });
        }

        if cancelled {
            // Stopped early: back to the queue without spending retry budget.
            self.db.unclaim_target(target_id).await?;
            return Ok(ExecutionOutcome {
                target_id: target_id.to_string(),
                completed: false,
                logs,
            });
        }

        if target.retry_count + 1 < i64::from(self.max_target_retries) {
            // Retries remaining: back to the queue.
            self.db.release_target_for_retry(target_id).await?;
            return Ok(ExecutionOutcome {
                target_id: target_id.to_string(),
                completed: false,
                logs,
            });
        }

        self.db.mark_target_failed(target_id).await?;
        crate::metrics::TARGETS_COMPLETED_TOTAL
            .with_label_values(&["failed"])
            .inc();
        tracing::warn!(target_id, "Target failed: all accounts exhausted");
        Err(AppError::AllAccountsExhausted(target_id.to_string()))
    }

    /// Process pending queue entries.
    ///
    /// Targets run concurrently up to the executor's cap; each one is
    /// claimed exclusively, so a parallel batch or direct dispatch can
    /// never double-process. Returns partial results, never all-or-nothing.
    pub async fn execute_batch(
        &self,
        limit: i64,
        cancel: &CancellationToken,
    ) -> Result<BatchResult, AppError> {
        let target_ids = self.db.list_pending_target_ids(limit.max(1)).await?;

        let accounts = self.pool.active_accounts(None).await?;
        let account_ids: Vec<String> = accounts
            .iter()
            .filter(|account| account.is_usable())
            .map(|account| account.id.clone())
            .collect();

        if account_ids.is_empty() {
            tracing::warn!("Batch execution skipped: no usable accounts");
            return Err(AppError::AllAccountsExhausted("batch".to_string()));
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks = Vec::new();

        for target_id in target_ids {
            if cancel.is_cancelled() {
                tracing::info!("Batch execution cancelled between targets");
                break;
            }

            let semaphore = semaphore.clone();
            let executor = self.clone();
            let account_ids = account_ids.clone();
            let cancel = cancel.clone();

            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                executor
                    .execute_report(&target_id, &account_ids, &cancel)
                    .await
            }));
        }

        // Collect partial results
        let mut result = BatchResult::default();
        for task in tasks {
            let Ok(outcome) = task.await else {
                result.failed += 1;
                continue;
            };

            match outcome {
                Ok(outcome) if outcome.completed => {
                    result.processed += 1;
                    result.completed += 1;
                }
                Ok(_) => {
                    result.processed += 1;
                    result.requeued += 1;
                }
                Err(AppError::ClaimConflict(_)) => {
                    result.skipped += 1;
                }
                Err(AppError::AllAccountsExhausted(_)) => {
                    result.processed += 1;
                    result.failed += 1;
                }
                Err(error) => {
                    result.processed += 1;
                    result.failed += 1;
                    tracing::error!(%error, "Batch target execution failed");
                }
            }
        }

        tracing::info!(
            processed = result.processed,
            completed = result.completed,
            requeued = result.requeued,
            failed = result.failed,
            skipped = result.skipped,
            "Batch execution finished"
        );

        Ok(result)
    }

    /// Run all attempts for one (target, account) pair.
    ///
    /// Returns the recorded logs and whether any attempt succeeded.
    async fn attempt_with_account(
        &self,
        target: &Target,
        account_id: &str,
        min_delay: f64,
        max_delay: f64,
    ) -> Result<(Vec<ReportLog>, bool), AppError> {
        let action = format!("report_{}", target.kind);
        let mut logs = Vec::new();

        let Some(account) = self.db.get_account(account_id).await? else {
            tracing::warn!(account_id, "Skipping unknown account id");
            return Ok((logs, false));
        };

        if !account.is_usable() {
            let log = self
                .sink
                .record(NewReportLog {
                    target_id: target.id.clone(),
                    account_id: account.id.clone(),
                    action: action.clone(),
                    request_payload: None,
                    response_payload: None,
                    success: false,
                    error_message: Some("account is invalid or inactive".to_string()),
                })
                .await?;
            logs.push(log);
            crate::metrics::REPORT_ATTEMPTS_TOTAL
                .with_label_values(&[target.kind.as_str(), "skipped"])
                .inc();
            return Ok((logs, false));
        }

        // Courtesy delay before touching the platform
        let delay = sample_delay(min_delay, max_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let request_payload = serde_json::json!({
            "kind": target.kind,
            "identifier": target.identifier,
            "context_id": target.context_id,
            "reason": target.reason_code,
            "detail": target.reason_detail,
        })
        .to_string();

        let mut attempt = 0u32;
        loop {
            let outcome = match self.client.submit_report(&account, target).await {
                Ok(response) => response
                    .ensure_success(&account.id)
                    .map(|_| response.clone()),
                Err(error) => Err(error),
            };

            match outcome {
                Ok(response) => {
                    let log = self
                        .sink
                        .record(NewReportLog {
                            target_id: target.id.clone(),
                            account_id: account.id.clone(),
                            action: action.clone(),
                            request_payload: Some(request_payload.clone()),
                            response_payload: serde_json::to_string(&response).ok(),
                            success: true,
                            error_message: None,
                        })
                        .await?;
                    logs.push(log);
                    crate::metrics::REPORT_ATTEMPTS_TOTAL
                        .with_label_values(&[target.kind.as_str(), "success"])
                        .inc();
                    self.pool.mark_success(&account.id).await;
                    return Ok((logs, true));
                }
                Err(error) => {
                    let log = self
                        .sink
                        .record(NewReportLog {
                            target_id: target.id.clone(),
                            account_id: account.id.clone(),
                            action: action.clone(),
                            request_payload: Some(request_payload.clone()),
                            response_payload: None,
                            success: false,
                            error_message: Some(error.to_string()),
                        })
                        .await?;
                    logs.push(log);
                    crate::metrics::REPORT_ATTEMPTS_TOTAL
                        .with_label_values(&[target.kind.as_str(), error.kind()])
                        .inc();

                    if let AppError::AccountInvalid { .. } = &error {
                        self.pool.mark_failure(&account.id, error.kind()).await?;
                        return Ok((logs, false));
                    }

                    if error.is_retryable() && attempt < self.retry_policy.max_retries {
                        let backoff = self.retry_policy.backoff_delay(attempt);
                        tracing::debug!(
                            target_id = %target.id,
                            account_id = %account.id,
                            attempt,
                            backoff_ms = backoff.as_millis() as u64,
                            %error,
                            "Report attempt failed, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                        continue;
                    }

                    tracing::warn!(
                        target_id = %target.id,
                        account_id = %account.id,
                        %error,
                        "Report attempt failed terminally"
                    );
                    return Ok((logs, false));
                }
            }
        }
    }
}

/// Random delay inside the configured courtesy window.
fn sample_delay(min_delay: f64, max_delay: f64) -> Duration {
    if max_delay <= 0.0 {
        return Duration::ZERO;
    }
    let seconds = if (max_delay - min_delay).abs() < f64::EPSILON {
        min_delay
    } else {
        rand::thread_rng().gen_range(min_delay..=max_delay)
    };
    Duration::from_secs_f64(seconds.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            cap: Duration::from_millis(3_000),
        };

        assert_eq!(policy.backoff_delay(0), Duration::from_millis(500));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(1_000));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(2_000));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(3_000));
        assert_eq!(policy.backoff_delay(10), Duration::from_millis(3_000));
    }

    #[test]
    fn sample_delay_respects_window() {
        for _ in 0..32 {
            let delay = sample_delay(1.0, 2.0);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_secs(2));
        }

        assert_eq!(sample_delay(0.0, 0.0), Duration::ZERO);
    }
}
