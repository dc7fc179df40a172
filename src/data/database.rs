//! SQLite database operations
//!
//! All database access goes through this module.
//! Persisted rows are the single source of truth: no component keeps
//! authoritative in-memory state that outlives one operation.

use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite, SqlitePool};
use std::path::Path;

use super::models::*;
use crate::error::AppError;

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Arguments
    /// * `path` - Path to SQLite database file
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        // Create connection string
        let connection_string = format!("sqlite:{}?mode=rwc", path.display());

        // Create connection pool
        let pool = SqlitePool::connect(&connection_string).await?;

        // Run migrations
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    /// List active accounts, optionally restricted to a group tag.
    ///
    /// Ordered by id, so the pool is walked in creation order.
    pub async fn list_active_accounts(
        &self,
        group_tag: Option<&str>,
    ) -> Result<Vec<Account>, AppError> {
        let accounts = match group_tag {
            Some(tag) => {
                sqlx::query_as::<_, Account>(
                    "SELECT * FROM accounts WHERE is_active = 1 AND group_tag = ? ORDER BY id ASC",
                )
                .bind(tag)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Account>(
                    "SELECT * FROM accounts WHERE is_active = 1 ORDER BY id ASC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(accounts)
    }

    /// Get an account by id
    pub async fn get_account(&self, id: &str) -> Result<Option<Account>, AppError> {
        let account = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(account)
    }

    /// Insert a new account
    pub async fn insert_account(&self, account: &Account) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO accounts
                (id, label, session_token, csrf_token, user_agent, device_id,
                 group_tag, is_active, status, last_check_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&account.id)
        .bind(&account.label)
        .bind(&account.session_token)
        .bind(&account.csrf_token)
        .bind(&account.user_agent)
        .bind(&account.device_id)
        .bind(&account.group_tag)
        .bind(account.is_active)
        .bind(&account.status)
        .bind(account.last_check_at)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record the outcome of a validity probe.
    pub async fn update_account_check(
        &self,
        id: &str,
        status: AccountStatus,
        checked_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE accounts SET status = ?, last_check_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(checked_at)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Set an account's validity status without touching last_check_at.
    pub async fn set_account_status(&self, id: &str, status: AccountStatus) -> Result<(), AppError> {
        sqlx::query("UPDATE accounts SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // =========================================================================
    // Targets
    // =========================================================================

    /// Insert a new moderation target
    pub async fn insert_target(&self, target: &Target) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO targets
                (id, kind, identifier, context_id, reason_code, reason_detail,
                 status, retry_count, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&target.id)
        .bind(&target.kind)
        .bind(&target.identifier)
        .bind(target.context_id)
        .bind(target.reason_code)
        .bind(&target.reason_detail)
        .bind(&target.status)
        .bind(target.retry_count)
        .bind(target.created_at)
        .bind(target.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a target by id
    pub async fn get_target(&self, id: &str) -> Result<Option<Target>, AppError> {
        let target = sqlx::query_as::<_, Target>("SELECT * FROM targets WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(target)
    }

    /// List pending target ids in creation order, up to `limit`.
    pub async fn list_pending_target_ids(&self, limit: i64) -> Result<Vec<String>, AppError> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT id FROM targets WHERE status = 'pending' ORDER BY id ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    /// Exclusively claim a pending target for processing.
    ///
    /// The guarded UPDATE is the claim: at most one caller observes an
    /// affected row, every concurrent claim on the same target is a no-op.
    pub async fn claim_target(&self, id: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE targets SET status = 'processing', updated_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Transition a processing target to completed.
    pub async fn complete_target(&self, id: &str) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE targets SET status = 'completed', updated_at = ?
             WHERE id = ? AND status = 'processing'",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Return a failed execution to the queue with an incremented retry count.
    pub async fn release_target_for_retry(&self, id: &str) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE targets SET status = 'pending', retry_count = retry_count + 1, updated_at = ?
             WHERE id = ? AND status = 'processing'",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Return a claimed target to pending without consuming retry budget.
    ///
    /// Used when an execution is cancelled before finishing its accounts.
    pub async fn unclaim_target(&self, id: &str) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE targets SET status = 'pending', updated_at = ?
             WHERE id = ? AND status = 'processing'",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Terminal failure: retries exhausted.
    pub async fn mark_target_failed(&self, id: &str) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE targets SET status = 'failed', retry_count = retry_count + 1, updated_at = ?
             WHERE id = ? AND status = 'processing'",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // =========================================================================
    // Report Logs
    // =========================================================================

    /// Append one execution record. Rows are never updated.
    pub async fn insert_report_log(&self, log: &ReportLog) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO report_logs
                (id, target_id, account_id, action, request_payload,
                 response_payload, success, error_message, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&log.id)
        .bind(&log.target_id)
        .bind(&log.account_id)
        .bind(&log.action)
        .bind(&log.request_payload)
        .bind(&log.response_payload)
        .bind(log.success)
        .bind(&log.error_message)
        .bind(log.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// List all attempts recorded for one target, oldest first.
    pub async fn list_report_logs_for_target(
        &self,
        target_id: &str,
    ) -> Result<Vec<ReportLog>, AppError> {
        let logs = sqlx::query_as::<_, ReportLog>(
            "SELECT * FROM report_logs WHERE target_id = ? ORDER BY id ASC",
        )
        .bind(target_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(logs)
    }

    /// Delete report logs older than the cutoff. Returns rows removed.
    pub async fn prune_report_logs(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM report_logs WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    // =========================================================================
    // Auto-reply rules
    // =========================================================================

    /// Active rules in matching order: priority descending, creation
    /// order for ties.
    pub async fn list_active_rules(&self) -> Result<Vec<AutoReplyRule>, AppError> {
        let rules = sqlx::query_as::<_, AutoReplyRule>(
            "SELECT * FROM auto_reply_rules WHERE is_active = 1 ORDER BY priority DESC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rules)
    }

    /// Insert a new reply rule
    pub async fn insert_rule(&self, rule: &AutoReplyRule) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO auto_reply_rules
                (id, keyword, response, priority, is_active, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&rule.id)
        .bind(&rule.keyword)
        .bind(&rule.response)
        .bind(rule.priority)
        .bind(rule.is_active)
        .bind(rule.created_at)
        .bind(rule.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // =========================================================================
    // Auto-reply dedup cursors
    // =========================================================================

    /// Last processed message timestamp for one conversation (0 if none).
    pub async fn get_reply_cursor(
        &self,
        account_id: &str,
        talker_id: i64,
    ) -> Result<i64, AppError> {
        let cursor = sqlx::query_scalar::<_, i64>(
            "SELECT last_msg_ts FROM auto_reply_state
             WHERE account_id = ? AND talker_id = ?",
        )
        .bind(account_id)
        .bind(talker_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(cursor.unwrap_or(0))
    }

    /// Advance a conversation cursor.
    ///
    /// Monotonic by construction: the conditional upsert ignores any
    /// timestamp at or below the stored one, so the cursor never regresses
    /// even under overlapping cycles.
    pub async fn advance_reply_cursor(
        &self,
        account_id: &str,
        talker_id: i64,
        msg_ts: i64,
    ) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO auto_reply_state (account_id, talker_id, last_msg_ts, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (account_id, talker_id) DO UPDATE
                SET last_msg_ts = excluded.last_msg_ts,
                    updated_at = excluded.updated_at
              WHERE excluded.last_msg_ts > auto_reply_state.last_msg_ts",
        )
        .bind(account_id)
        .bind(talker_id)
        .bind(msg_ts)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // =========================================================================
    // Scheduled tasks
    // =========================================================================

    /// Insert a new scheduled task
    pub async fn insert_scheduled_task(&self, task: &ScheduledTask) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO scheduled_tasks
                (id, task_type, cron_expr, interval_seconds, is_active,
                 last_run_at, next_run_at, config, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(&task.task_type)
        .bind(&task.cron_expr)
        .bind(task.interval_seconds)
        .bind(task.is_active)
        .bind(task.last_run_at)
        .bind(task.next_run_at)
        .bind(&task.config)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// List all scheduled tasks in creation order.
    pub async fn list_scheduled_tasks(&self) -> Result<Vec<ScheduledTask>, AppError> {
        let tasks =
            sqlx::query_as::<_, ScheduledTask>("SELECT * FROM scheduled_tasks ORDER BY id ASC")
                .fetch_all(&self.pool)
                .await?;

        Ok(tasks)
    }

    /// Get a scheduled task by id
    pub async fn get_scheduled_task(&self, id: &str) -> Result<Option<ScheduledTask>, AppError> {
        let task = sqlx::query_as::<_, ScheduledTask>("SELECT * FROM scheduled_tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(task)
    }

    /// Whether any task of the given type exists.
    pub async fn task_type_exists(&self, task_type: &str) -> Result<bool, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM scheduled_tasks WHERE task_type = ?",
        )
        .bind(task_type)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    /// Enabled tasks due at `now` (or never scheduled yet).
    pub async fn list_due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>, AppError> {
        let tasks = sqlx::query_as::<_, ScheduledTask>(
            "SELECT * FROM scheduled_tasks
             WHERE is_active = 1 AND (next_run_at IS NULL OR next_run_at <= ?)
             ORDER BY id ASC",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(tasks)
    }

    /// Record a firing: stamp last_run_at, recompute next_run_at.
    pub async fn update_task_run(
        &self,
        id: &str,
        last_run_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE scheduled_tasks
             SET last_run_at = ?, next_run_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(last_run_at)
        .bind(next_run_at)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Enable or disable a task.
    ///
    /// Disabling clears next_run_at so a re-enable reschedules from now.
    pub async fn set_task_active(&self, id: &str, active: bool) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE scheduled_tasks
             SET is_active = ?,
                 next_run_at = CASE WHEN ? THEN next_run_at ELSE NULL END,
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(active)
        .bind(active)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // =========================================================================
    // Settings
    // =========================================================================

    /// Read one runtime setting
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>, AppError> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(value)
    }

    /// Upsert one runtime setting
    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Read every stored setting as raw key/value pairs.
    pub async fn list_settings(&self) -> Result<Vec<(String, String)>, AppError> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT key, value FROM settings ORDER BY key ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
