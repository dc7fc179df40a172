//! Service layer
//!
//! Business logic: account pool health, the target queue and report
//! executor, the shared auto-reply poll cycle, the scheduler, and the
//! execution log sink.

pub mod accounts;
pub mod autoreply;
pub mod logs;
pub mod reports;
pub mod scheduler;

pub use accounts::AccountPool;
pub use autoreply::{AutoReplyEngine, AutoReplyService};
pub use logs::{LogEvent, LogSink, NewReportLog};
pub use reports::{BatchResult, ExecutionOutcome, ReportExecutor, RetryPolicy};
pub use scheduler::SchedulerCoordinator;
