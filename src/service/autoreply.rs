//! Auto-reply engine
//!
//! One shared poll cycle: fetch conversation sessions per account, match
//! unseen messages against reply rules, send replies, advance the dedup
//! cursor. Both activation paths (the standalone toggle below and the
//! scheduler) call [`AutoReplyEngine::run_poll_cycle`]; the matching and
//! dedup logic exists exactly once.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::data::{Account, AutoReplyRule, Database, RuntimeSettings};
use crate::error::AppError;
use crate::platform::PlatformClient;
use crate::service::accounts::AccountPool;
use crate::service::logs::{LogSink, NewReportLog};

/// Reply used when no rule matches and no default rule exists.
const BUILTIN_REPLY: &str =
    "Thanks for your message. This inbox is handled automatically; an operator will follow up.";

/// Pick the reply rule for a message.
///
/// `rules` must already be ordered by priority descending with creation
/// order breaking ties (the database query guarantees this). The first
/// keyword rule whose keyword occurs in the text wins; otherwise the
/// NULL-keyword default rule, if any.
pub fn match_rule<'a>(rules: &'a [AutoReplyRule], text: &str) -> Option<&'a AutoReplyRule> {
    rules
        .iter()
        .find(|rule| {
            rule.keyword
                .as_deref()
                .is_some_and(|keyword| !keyword.is_empty() && text.contains(keyword))
        })
        .or_else(|| rules.iter().find(|rule| rule.keyword.is_none()))
}

/// Per-account mutual exclusion between overlapping poll cycles.
///
/// Two triggers may fire concurrently; an account claimed by one cycle is
/// skipped by the other instead of being polled twice.
struct PollGuard {
    in_flight: Mutex<HashSet<String>>,
}

impl PollGuard {
    fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    async fn try_claim(&self, account_id: &str) -> bool {
        let mut in_flight = self.in_flight.lock().await;
        in_flight.insert(account_id.to_string())
    }

    async fn release(&self, account_id: &str) {
        let mut in_flight = self.in_flight.lock().await;
        in_flight.remove(account_id);
    }
}

/// Summary of one poll cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollReport {
    pub accounts_polled: usize,
    /// Accounts skipped because another cycle held them
    pub accounts_skipped: usize,
    pub sessions_scanned: usize,
    pub replies_sent: usize,
    pub reply_failures: usize,
}

/// The shared auto-reply poll cycle
pub struct AutoReplyEngine {
    db: Arc<Database>,
    client: Arc<PlatformClient>,
    pool: Arc<AccountPool>,
    sink: Arc<LogSink>,
    guard: PollGuard,
}

impl AutoReplyEngine {
    /// Create a new engine
    pub fn new(
        db: Arc<Database>,
        client: Arc<PlatformClient>,
        pool: Arc<AccountPool>,
        sink: Arc<LogSink>,
    ) -> Self {
        Self {
            db,
            client,
            pool,
            sink,
            guard: PollGuard::new(),
        }
    }

    /// Run one full poll cycle.
    ///
    /// Settings are snapshotted at cycle start; changes apply to the next
    /// cycle. Cancellation is honored between accounts. Idempotent when
    /// nothing new arrived: the dedup cursor guarantees zero sends.
    pub async fn run_poll_cycle(
        &self,
        trigger: &str,
        cancel: &CancellationToken,
    ) -> Result<PollReport, AppError> {
        crate::metrics::AUTOREPLY_CYCLES_TOTAL
            .with_label_values(&[trigger])
            .inc();

        // 1. Snapshot settings and rules for the whole cycle
        let settings = self.db.load_runtime_settings().await?;
        let rules = self.db.list_active_rules().await?;

        // 2. Select accounts
        let mut accounts: Vec<Account> = self
            .pool
            .active_accounts(None)
            .await?
            .into_iter()
            .filter(Account::is_usable)
            .collect();
        if settings.autoreply_account_batch_size > 0 {
            accounts.truncate(settings.autoreply_account_batch_size);
        }

        if accounts.is_empty() {
            tracing::warn!(trigger, "Poll cycle found no usable accounts");
            return Ok(PollReport::default());
        }

        // 3. Poll each account under the per-account guard
        let mut report = PollReport::default();
        for account in &accounts {
            if cancel.is_cancelled() {
                tracing::info!(trigger, "Poll cycle cancelled between accounts");
                break;
            }

            if !self.guard.try_claim(&account.id).await {
                report.accounts_skipped += 1;
                tracing::debug!(
                    account_id = %account.id,
                    "Account already held by another poll cycle, skipping"
                );
                continue;
            }

            let outcome = self.poll_account(account, &rules, &settings).await;
            self.guard.release(&account.id).await;

            match outcome {
                Ok((sessions, sent, failed)) => {
                    report.accounts_polled += 1;
                    report.sessions_scanned += sessions;
                    report.replies_sent += sent;
                    report.reply_failures += failed;
                }
                Err(error) => {
                    report.reply_failures += 1;
                    tracing::warn!(
                        account_id = %account.id,
                        %error,
                        "Account poll failed, continuing with others"
                    );
                }
            }
        }

        tracing::info!(
            trigger,
            accounts_polled = report.accounts_polled,
            accounts_skipped = report.accounts_skipped,
            sessions_scanned = report.sessions_scanned,
            replies_sent = report.replies_sent,
            reply_failures = report.reply_failures,
            "Poll cycle finished"
        );

        Ok(report)
    }

    /// Poll one account: sessions -> unseen messages -> replies.
    ///
    /// Returns (sessions scanned, replies sent, reply failures).
    async fn poll_account(
        &self,
        account: &Account,
        rules: &[AutoReplyRule],
        settings: &RuntimeSettings,
    ) -> Result<(usize, usize, usize), AppError> {
        let sessions = self
            .client
            .recent_sessions(account, settings.autoreply_session_batch_size)
            .await?;

        let mut sent = 0usize;
        let mut failed = 0usize;

        for session in &sessions {
            let stored_cursor = self
                .db
                .get_reply_cursor(&account.id, session.talker_id)
                .await?;
            if session.last_msg_ts <= stored_cursor {
                // Nothing new in this conversation.
                continue;
            }

            let mut messages = self
                .client
                .messages_since(account, session.talker_id, stored_cursor)
                .await?;
            messages.sort_by_key(|message| message.msg_ts);

            let mut cursor = stored_cursor;
            for message in &messages {
                if message.from_self || message.msg_ts <= cursor {
                    continue;
                }

                let response = match match_rule(rules, &message.content) {
                    Some(rule) => rule.response.as_str(),
                    None => BUILTIN_REPLY,
                };

                match self.send_reply(account, session.talker_id, response).await {
                    Ok(()) => {
                        // Advance only after the reply went out; the
                        // conditional upsert keeps the cursor monotonic.
                        self.db
                            .advance_reply_cursor(&account.id, session.talker_id, message.msg_ts)
                            .await?;
                        cursor = message.msg_ts;
                        sent += 1;
                    }
                    Err(error) => {
                        failed += 1;
                        if let AppError::AccountInvalid { .. } = &error {
                            self.pool.mark_failure(&account.id, error.kind()).await?;
                            return Ok((sessions.len(), sent, failed));
                        }
                        tracing::warn!(
                            account_id = %account.id,
                            talker_id = session.talker_id,
                            %error,
                            "Reply failed; leaving cursor for a retry next cycle"
                        );
                        // Keep the failed message unseen for the next cycle.
                        break;
                    }
                }
            }
        }

        Ok((sessions.len(), sent, failed))
    }

    async fn send_reply(
        &self,
        account: &Account,
        talker_id: i64,
        content: &str,
    ) -> Result<(), AppError> {
        let result = match self.client.send_reply(account, talker_id, content).await {
            Ok(response) => response.ensure_success(&account.id),
            Err(error) => Err(error),
        };

        let (success, error_message) = match &result {
            Ok(()) => (true, None),
            Err(error) => (false, Some(error.to_string())),
        };

        self.sink
            .record(NewReportLog {
                target_id: format!("talker:{}", talker_id),
                account_id: account.id.clone(),
                action: "auto_reply".to_string(),
                request_payload: Some(
                    serde_json::json!({ "talker_id": talker_id, "content": content }).to_string(),
                ),
                response_payload: None,
                success,
                error_message,
            })
            .await?;

        crate::metrics::AUTOREPLY_REPLIES_TOTAL
            .with_label_values(&[if success { "success" } else { "error" }])
            .inc();

        result
    }
}

/// Standalone auto-reply toggle
///
/// One of the two activation paths. Enabling spawns a loop that runs the
/// shared poll cycle and sleeps the configured interval between cycles;
/// disabling cancels it between units of work. Completely independent of
/// the scheduler's task state.
pub struct AutoReplyService {
    db: Arc<Database>,
    engine: Arc<AutoReplyEngine>,
    running: Mutex<Option<CancellationToken>>,
}

impl AutoReplyService {
    /// Create a new toggle service
    pub fn new(db: Arc<Database>, engine: Arc<AutoReplyEngine>) -> Self {
        Self {
            db,
            engine,
            running: Mutex::new(None),
        }
    }

    /// Whether the standalone loop is currently enabled.
    pub async fn is_enabled(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Enable the standalone loop. Idempotent.
    pub async fn enable(&self) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        *running = Some(cancel.clone());

        let db = self.db.clone();
        let engine = self.engine.clone();
        tokio::spawn(async move {
            tracing::info!("Standalone auto-reply loop started");
            loop {
                if cancel.is_cancelled() {
                    break;
                }

                if let Err(error) = engine.run_poll_cycle("standalone", &cancel).await {
                    tracing::error!(%error, "Standalone poll cycle failed");
                }

                // Interval is re-read every cycle so setting changes
                // apply without toggling.
                let interval = match db.load_runtime_settings().await {
                    Ok(settings) => settings.effective_poll_interval_seconds(),
                    Err(error) => {
                        tracing::error!(%error, "Failed to load poll interval, using default");
                        RuntimeSettings::default().effective_poll_interval_seconds()
                    }
                };

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(interval)) => {}
                }
            }
            tracing::info!("Standalone auto-reply loop stopped");
        });
    }

    /// Disable the standalone loop. Idempotent.
    pub async fn disable(&self) {
        let mut running = self.running.lock().await;
        if let Some(cancel) = running.take() {
            cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::EntityId;
    use chrono::Utc;

    fn rule(keyword: Option<&str>, response: &str, priority: i64) -> AutoReplyRule {
        AutoReplyRule {
            id: EntityId::new().0,
            keyword: keyword.map(str::to_string),
            response: response.to_string(),
            priority,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn first_matching_keyword_rule_wins() {
        // Matching order as the database delivers it:
        // priority DESC, creation order for ties.
        let rules = vec![
            rule(Some("spam"), "earliest high priority", 5),
            rule(Some("spam"), "later high priority", 5),
            rule(None, "default", 0),
        ];

        let matched = match_rule(&rules, "please stop the spam").unwrap();
        assert_eq!(matched.response, "earliest high priority");
    }

    #[test]
    fn falls_back_to_default_rule() {
        let rules = vec![
            rule(Some("refund"), "refund info", 5),
            rule(None, "default", 0),
        ];

        let matched = match_rule(&rules, "hello there").unwrap();
        assert_eq!(matched.response, "default");
    }

    #[test]
    fn no_match_without_default_rule() {
        let rules = vec![rule(Some("refund"), "refund info", 5)];
        assert!(match_rule(&rules, "hello there").is_none());
    }

    #[test]
    fn empty_keyword_never_matches() {
        let rules = vec![rule(Some(""), "broken rule", 9), rule(None, "default", 0)];
        let matched = match_rule(&rules, "anything").unwrap();
        assert_eq!(matched.response, "default");
    }

    #[tokio::test]
    async fn poll_guard_claims_are_exclusive() {
        let guard = PollGuard::new();

        assert!(guard.try_claim("acct").await);
        assert!(!guard.try_claim("acct").await);
        assert!(guard.try_claim("other").await);

        guard.release("acct").await;
        assert!(guard.try_claim("acct").await);
    }
}
