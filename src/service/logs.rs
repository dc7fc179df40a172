//! Execution log sink
//!
//! Persists report/reply execution records and fans them out to live
//! observers. Persistence is authoritative; the live stream is
//! best-effort and never blocks or fails an execution.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::data::{Database, EntityId, ReportLog};
use crate::error::AppError;

const LOG_CHANNEL_CAPACITY: usize = 256;

/// Structured event mirrored to live observers for every recorded attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub target_id: String,
    pub account_id: String,
    pub action: String,
    pub success: bool,
    pub error: Option<String>,
}

impl From<&ReportLog> for LogEvent {
    fn from(log: &ReportLog) -> Self {
        Self {
            target_id: log.target_id.clone(),
            account_id: log.account_id.clone(),
            action: log.action.clone(),
            success: log.success,
            error: log.error_message.clone(),
        }
    }
}

/// Input for one execution record; the sink assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct NewReportLog {
    pub target_id: String,
    pub account_id: String,
    pub action: String,
    pub request_payload: Option<String>,
    pub response_payload: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
}

/// Log sink shared by the executor and the auto-reply engine
pub struct LogSink {
    db: Arc<Database>,
    events: broadcast::Sender<LogEvent>,
}

impl LogSink {
    /// Create a new log sink
    pub fn new(db: Arc<Database>) -> Self {
        let (events, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        Self { db, events }
    }

    /// Persist one execution record and mirror it to observers.
    ///
    /// The broadcast send is fire-and-forget: with no subscribers (or a
    /// lagging one) the event is simply dropped.
    pub async fn record(&self, entry: NewReportLog) -> Result<ReportLog, AppError> {
        let log = ReportLog {
            id: EntityId::new().0,
            target_id: entry.target_id,
            account_id: entry.account_id,
            action: entry.action,
            request_payload: entry.request_payload,
            response_payload: entry.response_payload,
            success: entry.success,
            error_message: entry.error_message,
            created_at: chrono::Utc::now(),
        };

        self.db.insert_report_log(&log).await?;

        let _ = self.events.send(LogEvent::from(&log));

        Ok(log)
    }

    /// Subscribe to the live event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.events.subscribe()
    }

    /// Delete records older than the retention bound. Returns rows removed.
    pub async fn prune(&self, retention_days: i64) -> Result<u64, AppError> {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(retention_days.max(0));
        let removed = self.db.prune_report_logs(cutoff).await?;

        if removed > 0 {
            tracing::info!(removed, retention_days, "Pruned old report logs");
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_sink() -> (tempfile::TempDir, Arc<Database>, LogSink) {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Arc::new(
            Database::connect(&dir.path().join("test.db")).await.unwrap(),
        );
        let sink = LogSink::new(db.clone());
        (dir, db, sink)
    }

    fn sample_entry() -> NewReportLog {
        NewReportLog {
            target_id: "t1".to_string(),
            account_id: "a1".to_string(),
            action: "report_video".to_string(),
            request_payload: Some("{\"id\":\"BV1\"}".to_string()),
            response_payload: None,
            success: true,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn record_persists_and_broadcasts() {
        let (_dir, db, sink) = test_sink().await;
        let mut events = sink.subscribe();

        sink.record(sample_entry()).await.unwrap();

        let logs = db.list_report_logs_for_target("t1").await.unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].success);

        let event = events.recv().await.unwrap();
        assert_eq!(event.target_id, "t1");
        assert_eq!(event.action, "report_video");
    }

    #[tokio::test]
    async fn record_succeeds_without_subscribers() {
        let (_dir, db, sink) = test_sink().await;

        // No subscriber exists; the broadcast result is ignored.
        sink.record(sample_entry()).await.unwrap();

        let logs = db.list_report_logs_for_target("t1").await.unwrap();
        assert_eq!(logs.len(), 1);
    }
}
