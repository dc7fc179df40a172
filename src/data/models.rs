//! Data models
//!
//! Rust structs representing database entities.
//! All models use ULID for IDs and chrono for timestamps, so
//! lexicographic id order is creation order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Create from existing string
    pub fn from_string(s: String) -> Self {
        Self(s)
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Account
// =============================================================================

/// One authenticated platform account in the pool
///
/// Credentials are opaque to everything but the platform client.
/// Deactivation and deletion are external admin actions; the core only
/// ever mutates `status` and `last_check_at`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub id: String,
    /// Human-readable label for operators
    pub label: String,
    /// Platform session cookie value
    pub session_token: String,
    /// CSRF token paired with the session
    pub csrf_token: String,
    pub user_agent: String,
    /// Device fingerprint sent alongside requests
    pub device_id: String,
    /// Optional pool partition tag
    pub group_tag: Option<String>,
    pub is_active: bool,
    /// Validity: unknown, valid, invalid, expiring
    pub status: String,
    pub last_check_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Account validity as observed by probes and signed requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStatus {
    Unknown,
    Valid,
    Invalid,
    Expiring,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Expiring => "expiring",
        }
    }
}

impl Account {
    /// Whether the executor may use this account at all.
    ///
    /// Expiring accounts stay usable; only a confirmed invalid
    /// status takes an account out of rotation.
    pub fn is_usable(&self) -> bool {
        self.is_active && self.status != AccountStatus::Invalid.as_str()
    }
}

// =============================================================================
// Target
// =============================================================================

/// A single moderation job
///
/// Lifecycle (owned by the report executor, never backward):
/// pending -> processing -> completed | failed
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Target {
    pub id: String,
    /// What is being reported: video, comment, user
    pub kind: String,
    /// Opaque platform identifier (e.g. a video id or user id)
    pub identifier: String,
    /// Numeric context (e.g. the video a comment belongs to)
    pub context_id: Option<i64>,
    /// Platform reason code
    pub reason_code: i64,
    /// Free-form reason text
    pub reason_detail: Option<String>,
    /// pending, processing, completed, failed
    pub status: String,
    pub retry_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Kind of content a target points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Video,
    Comment,
    User,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Comment => "comment",
            Self::User => "user",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "video" => Some(Self::Video),
            "comment" => Some(Self::Comment),
            "user" => Some(Self::User),
            _ => None,
        }
    }
}

/// Target queue state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TargetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

// =============================================================================
// Report Log
// =============================================================================

/// Immutable record of one report attempt
///
/// Written once per attempt regardless of outcome, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ReportLog {
    pub id: String,
    pub target_id: String,
    pub account_id: String,
    /// Action label (e.g. "report_video")
    pub action: String,
    /// Serialized request parameters
    pub request_payload: Option<String>,
    /// Serialized platform response
    pub response_payload: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Auto-reply
// =============================================================================

/// Keyword-triggered reply rule
///
/// A NULL keyword marks the default rule used when nothing else matches.
/// Read-only to the poll cycle; CRUD happens through the admin API.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AutoReplyRule {
    pub id: String,
    pub keyword: Option<String>,
    pub response: String,
    pub priority: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Dedup cursor for one (account, talker) conversation
///
/// `last_msg_ts` is monotonically non-decreasing; the engine never
/// replies to a message at or below the stored cursor.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AutoReplyState {
    pub account_id: String,
    pub talker_id: i64,
    pub last_msg_ts: i64,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Scheduled Task
// =============================================================================

/// A periodic job owned by the scheduler
///
/// Either `cron_expr` or `interval_seconds` must be set;
/// `next_run_at` is recomputed after each firing.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScheduledTask {
    pub id: String,
    /// auto_reply_poll, log_cleanup, account_check
    pub task_type: String,
    pub cron_expr: Option<String>,
    pub interval_seconds: Option<i64>,
    pub is_active: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    /// Opaque per-task JSON config
    pub config: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Known scheduled task types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    AutoReplyPoll,
    LogCleanup,
    AccountCheck,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutoReplyPoll => "auto_reply_poll",
            Self::LogCleanup => "log_cleanup",
            Self::AccountCheck => "account_check",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "auto_reply_poll" => Some(Self::AutoReplyPoll),
            "log_cleanup" => Some(Self::LogCleanup),
            "account_check" => Some(Self::AccountCheck),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_ids_are_unique_fixed_width_ulids() {
        let first = EntityId::new();
        let second = EntityId::new();
        assert_eq!(first.0.len(), 26);
        assert_ne!(first, second);
    }

    #[test]
    fn invalid_accounts_are_not_usable() {
        let mut account = Account {
            id: EntityId::new().0,
            label: "main".to_string(),
            session_token: "token".to_string(),
            csrf_token: "csrf".to_string(),
            user_agent: "UA".to_string(),
            device_id: "device".to_string(),
            group_tag: None,
            is_active: true,
            status: AccountStatus::Valid.as_str().to_string(),
            last_check_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(account.is_usable());

        account.status = AccountStatus::Invalid.as_str().to_string();
        assert!(!account.is_usable());

        account.status = AccountStatus::Expiring.as_str().to_string();
        assert!(account.is_usable());

        account.is_active = false;
        assert!(!account.is_usable());
    }

    #[test]
    fn target_kind_round_trips_known_values() {
        for kind in [TargetKind::Video, TargetKind::Comment, TargetKind::User] {
            assert_eq!(TargetKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(TargetKind::parse("playlist"), None);
    }
}
