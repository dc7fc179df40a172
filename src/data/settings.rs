//! Runtime-tunable settings
//!
//! Options operators can change without a restart live in the `settings`
//! key-value table. The engine reads a typed snapshot at the start of each
//! cycle; changes take effect on the next cycle, never mid-cycle.

use serde::Serialize;

use super::database::Database;
use crate::error::AppError;

/// Typed snapshot of the `settings` table.
///
/// Missing or unparseable values fall back to the defaults below, so a
/// half-populated table never stalls a cycle.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeSettings {
    /// Lower bound of the per-account courtesy delay, in seconds
    pub min_delay: f64,
    /// Upper bound of the per-account courtesy delay, in seconds
    pub max_delay: f64,
    /// Sleep between standalone auto-reply cycles
    pub autoreply_poll_interval_seconds: u64,
    /// Floor for the poll interval, protecting the platform from
    /// overeager configurations
    pub autoreply_poll_min_interval_seconds: u64,
    /// Accounts polled per cycle; 0 means unlimited
    pub autoreply_account_batch_size: usize,
    /// Conversation sessions fetched per account; 0 means unlimited
    pub autoreply_session_batch_size: usize,
    /// Whether the log-cleanup task actually deletes anything
    pub auto_clean_logs: bool,
    /// Age bound used by log cleanup
    pub log_retention_days: i64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            min_delay: 2.0,
            max_delay: 8.0,
            autoreply_poll_interval_seconds: 60,
            autoreply_poll_min_interval_seconds: 15,
            autoreply_account_batch_size: 0,
            autoreply_session_batch_size: 20,
            auto_clean_logs: false,
            log_retention_days: 30,
        }
    }
}

impl RuntimeSettings {
    /// Effective poll interval with the configured floor applied.
    pub fn effective_poll_interval_seconds(&self) -> u64 {
        self.autoreply_poll_interval_seconds
            .max(self.autoreply_poll_min_interval_seconds)
            .max(1)
    }

    /// Delay window, normalized so min never exceeds max.
    pub fn delay_window(&self) -> (f64, f64) {
        let min = self.min_delay.max(0.0);
        let max = self.max_delay.max(min);
        (min, max)
    }
}

fn parse_or_default<T: std::str::FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn parse_bool(raw: Option<String>, default: bool) -> bool {
    match raw.as_deref().map(str::trim) {
        Some("1") | Some("true") | Some("yes") | Some("on") => true,
        Some("0") | Some("false") | Some("no") | Some("off") => false,
        _ => default,
    }
}

impl Database {
    /// Load the runtime settings snapshot.
    ///
    /// Called at the start of every poll cycle and batch execution.
    pub async fn load_runtime_settings(&self) -> Result<RuntimeSettings, AppError> {
        let defaults = RuntimeSettings::default();

        let settings = RuntimeSettings {
            min_delay: parse_or_default(self.get_setting("min_delay").await?, defaults.min_delay),
            max_delay: parse_or_default(self.get_setting("max_delay").await?, defaults.max_delay),
            autoreply_poll_interval_seconds: parse_or_default(
                self.get_setting("autoreply_poll_interval_seconds").await?,
                defaults.autoreply_poll_interval_seconds,
            ),
            autoreply_poll_min_interval_seconds: parse_or_default(
                self.get_setting("autoreply_poll_min_interval_seconds")
                    .await?,
                defaults.autoreply_poll_min_interval_seconds,
            ),
            autoreply_account_batch_size: parse_or_default(
                self.get_setting("autoreply_account_batch_size").await?,
                defaults.autoreply_account_batch_size,
            ),
            autoreply_session_batch_size: parse_or_default(
                self.get_setting("autoreply_session_batch_size").await?,
                defaults.autoreply_session_batch_size,
            ),
            auto_clean_logs: parse_bool(
                self.get_setting("auto_clean_logs").await?,
                defaults.auto_clean_logs,
            ),
            log_retention_days: parse_or_default(
                self.get_setting("log_retention_days").await?,
                defaults.log_retention_days,
            ),
        };

        Ok(settings)
    }
}
