//! Scheduler coordinator
//!
//! Fires persisted scheduled tasks on cron or interval specs. The
//! coordinator only sequences: every handler is a call into an existing
//! service. Auto-reply tasks invoke the engine's shared poll cycle, never
//! a reimplementation of it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use croner::Cron;
use tokio_util::sync::CancellationToken;

use crate::data::{Database, EntityId, ScheduledTask, TaskType};
use crate::error::AppError;
use crate::service::accounts::AccountPool;
use crate::service::autoreply::AutoReplyEngine;
use crate::service::logs::LogSink;

/// How often the coordinator scans for due tasks.
const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Compute a task's next firing time after `now`.
///
/// Cron expressions win over interval seconds when both are present.
/// Returns `None` for tasks with no usable trigger spec.
pub fn compute_next_run(
    task: &ScheduledTask,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, AppError> {
    if let Some(expr) = task.cron_expr.as_deref() {
        let cron = Cron::new(expr)
            .parse()
            .map_err(|e| AppError::Validation(format!("invalid cron expression {:?}: {}", expr, e)))?;
        let next = cron
            .find_next_occurrence(&now, false)
            .map_err(|e| AppError::Validation(format!("no next occurrence for {:?}: {}", expr, e)))?;
        return Ok(Some(next));
    }

    if let Some(seconds) = task.interval_seconds {
        if seconds <= 0 {
            return Err(AppError::Validation(
                "interval_seconds must be positive".to_string(),
            ));
        }
        return Ok(Some(now + chrono::Duration::seconds(seconds)));
    }

    Ok(None)
}

/// Coordinator firing persisted tasks against the service layer
pub struct SchedulerCoordinator {
    db: Arc<Database>,
    engine: Arc<AutoReplyEngine>,
    pool: Arc<AccountPool>,
    sink: Arc<LogSink>,
}

impl SchedulerCoordinator {
    /// Create a new coordinator
    pub fn new(
        db: Arc<Database>,
        engine: Arc<AutoReplyEngine>,
        pool: Arc<AccountPool>,
        sink: Arc<LogSink>,
    ) -> Self {
        Self {
            db,
            engine,
            pool,
            sink,
        }
    }

    /// Seed one disabled row per known task type if missing.
    ///
    /// Keeps first-run setups from having to hand-insert rows before the
    /// admin API can toggle them. Existing rows are never touched.
    pub async fn ensure_default_tasks(&self) -> Result<(), AppError> {
        let defaults = [
            (TaskType::AutoReplyPoll, Some(60i64)),
            (TaskType::LogCleanup, Some(3_600)),
            (TaskType::AccountCheck, Some(1_800)),
        ];

        for (task_type, interval_seconds) in defaults {
            if self.db.task_type_exists(task_type.as_str()).await? {
                continue;
            }

            let now = Utc::now();
            let task = ScheduledTask {
                id: EntityId::new().0,
                task_type: task_type.as_str().to_string(),
                cron_expr: None,
                interval_seconds,
                is_active: false,
                last_run_at: None,
                next_run_at: None,
                config: None,
                created_at: now,
                updated_at: now,
            };
            self.db.insert_scheduled_task(&task).await?;
            tracing::info!(task_type = task_type.as_str(), "Seeded default scheduled task");
        }

        Ok(())
    }

    /// Run the tick loop until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        // Consume the immediate first tick so startup work settles first.
        interval.tick().await;

        tracing::info!("Scheduler coordinator started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            if let Err(error) = self.fire_due_tasks(&cancel).await {
                tracing::error!(%error, "Scheduler tick failed");
            }
        }
        tracing::info!("Scheduler coordinator stopped");
    }

    /// Fire every enabled task whose next_run_at is due.
    ///
    /// Reschedules before dispatching, so a slow handler cannot make the
    /// same row fire twice in back-to-back ticks.
    pub async fn fire_due_tasks(&self, cancel: &CancellationToken) -> Result<usize, AppError> {
        let now = Utc::now();
        let due = self.db.list_due_tasks(now).await?;
        let mut fired = 0usize;

        for task in due {
            if cancel.is_cancelled() {
                break;
            }

            let next_run_at = match compute_next_run(&task, now) {
                Ok(next) => next,
                Err(error) => {
                    tracing::error!(
                        task_id = %task.id,
                        task_type = %task.task_type,
                        %error,
                        "Task has an unusable trigger spec, disabling"
                    );
                    self.db.set_task_active(&task.id, false).await?;
                    continue;
                }
            };

            self.db.update_task_run(&task.id, now, next_run_at).await?;

            if let Err(error) = self.dispatch(&task, cancel).await {
                tracing::error!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    %error,
                    "Scheduled task handler failed"
                );
            }
            fired += 1;
        }

        Ok(fired)
    }

    /// Invoke the handler for one task type.
    async fn dispatch(&self, task: &ScheduledTask, cancel: &CancellationToken) -> Result<(), AppError> {
        match TaskType::parse(&task.task_type) {
            Some(TaskType::AutoReplyPoll) => {
                // The one shared poll-cycle implementation.
                self.engine.run_poll_cycle("scheduler", cancel).await?;
                Ok(())
            }
            Some(TaskType::LogCleanup) => {
                let settings = self.db.load_runtime_settings().await?;
                if settings.auto_clean_logs {
                    self.sink.prune(settings.log_retention_days).await?;
                } else {
                    tracing::debug!("Log cleanup fired but auto_clean_logs is off");
                }
                Ok(())
            }
            Some(TaskType::AccountCheck) => {
                let accounts = self.pool.active_accounts(None).await?;
                for account in &accounts {
                    if cancel.is_cancelled() {
                        break;
                    }
                    if let Err(error) = self.pool.validate(account).await {
                        tracing::warn!(
                            account_id = %account.id,
                            %error,
                            "Scheduled account check failed"
                        );
                    }
                }
                Ok(())
            }
            None => {
                tracing::warn!(task_type = %task.task_type, "Unknown scheduled task type");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{PlatformClient, RequestSigner};
    use crate::service::autoreply::AutoReplyEngine;
    use chrono::TimeZone;

    fn task_with(cron_expr: Option<&str>, interval_seconds: Option<i64>) -> ScheduledTask {
        let now = Utc::now();
        ScheduledTask {
            id: EntityId::new().0,
            task_type: "auto_reply_poll".to_string(),
            cron_expr: cron_expr.map(str::to_string),
            interval_seconds,
            is_active: true,
            last_run_at: None,
            next_run_at: None,
            config: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn interval_tasks_schedule_relative_to_now() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let next = compute_next_run(&task_with(None, Some(300)), now)
            .unwrap()
            .unwrap();
        assert_eq!(next, now + chrono::Duration::seconds(300));
    }

    #[test]
    fn cron_tasks_schedule_to_the_next_occurrence() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap();
        let next = compute_next_run(&task_with(Some("0 3 * * *"), None), now)
            .unwrap()
            .unwrap();

        assert!(next > now);
        assert_eq!(next.format("%H:%M").to_string(), "03:00");
    }

    #[test]
    fn cron_wins_over_interval_when_both_are_set() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap();
        let next = compute_next_run(&task_with(Some("0 3 * * *"), Some(60)), now)
            .unwrap()
            .unwrap();
        assert_ne!(next, now + chrono::Duration::seconds(60));
    }

    #[test]
    fn tasks_without_trigger_spec_have_no_next_run() {
        let now = Utc::now();
        assert!(compute_next_run(&task_with(None, None), now)
            .unwrap()
            .is_none());
    }

    #[test]
    fn invalid_specs_are_rejected() {
        let now = Utc::now();
        assert!(compute_next_run(&task_with(Some("not a cron"), None), now).is_err());
        assert!(compute_next_run(&task_with(None, Some(0)), now).is_err());
    }

    async fn test_coordinator() -> (tempfile::TempDir, Arc<Database>, Arc<SchedulerCoordinator>) {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Arc::new(
            Database::connect(&dir.path().join("test.db")).await.unwrap(),
        );

        let http_client = Arc::new(reqwest::Client::new());
        let signer = Arc::new(RequestSigner::new(
            http_client.clone(),
            "http://127.0.0.1:1",
            Duration::from_secs(60),
        ));
        let client = Arc::new(PlatformClient::new(
            http_client,
            "http://127.0.0.1:1",
            signer,
            "test-agent".to_string(),
        ));
        let pool = Arc::new(AccountPool::new(db.clone(), client.clone(), 3));
        let sink = Arc::new(LogSink::new(db.clone()));
        let engine = Arc::new(AutoReplyEngine::new(
            db.clone(),
            client,
            pool.clone(),
            sink.clone(),
        ));

        let coordinator = Arc::new(SchedulerCoordinator::new(db.clone(), engine, pool, sink));
        (dir, db, coordinator)
    }

    #[tokio::test]
    async fn ensure_default_tasks_is_idempotent() {
        let (_dir, db, coordinator) = test_coordinator().await;

        coordinator.ensure_default_tasks().await.unwrap();
        coordinator.ensure_default_tasks().await.unwrap();

        // One disabled row per known type, none due.
        assert!(db.task_type_exists("auto_reply_poll").await.unwrap());
        assert!(db.task_type_exists("log_cleanup").await.unwrap());
        assert!(db.task_type_exists("account_check").await.unwrap());
        assert!(db.list_due_tasks(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn firing_reschedules_and_stamps_last_run() {
        let (_dir, db, coordinator) = test_coordinator().await;

        // No accounts exist, so the poll handler short-circuits
        // without touching the network.
        let task = task_with(None, Some(120));
        db.insert_scheduled_task(&task).await.unwrap();

        let cancel = CancellationToken::new();
        let fired = coordinator.fire_due_tasks(&cancel).await.unwrap();
        assert_eq!(fired, 1);

        let stored = db.get_scheduled_task(&task.id).await.unwrap().unwrap();
        assert!(stored.last_run_at.is_some());
        let next = stored.next_run_at.unwrap();
        assert!(next > Utc::now());

        // Not due again until the interval elapses.
        assert_eq!(coordinator.fire_due_tasks(&cancel).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unusable_specs_disable_the_task() {
        let (_dir, db, coordinator) = test_coordinator().await;

        let task = task_with(Some("definitely not cron"), None);
        db.insert_scheduled_task(&task).await.unwrap();

        let cancel = CancellationToken::new();
        let fired = coordinator.fire_due_tasks(&cancel).await.unwrap();
        assert_eq!(fired, 0);

        let stored = db.get_scheduled_task(&task.id).await.unwrap().unwrap();
        assert!(!stored.is_active);
    }
}
