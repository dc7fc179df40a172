//! Account pool
//!
//! Selects eligible accounts for execution and tracks their health.
//! Persisted account status is the source of truth; the consecutive
//! failure tally is process-scoped bookkeeping that only exists to decide
//! when to demote.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::data::{Account, AccountStatus, Database};
use crate::error::AppError;
use crate::platform::PlatformClient;

/// Account pool with failure-based demotion
pub struct AccountPool {
    db: Arc<Database>,
    client: Arc<PlatformClient>,
    /// Consecutive failures per account id. Reset on any success.
    failure_tally: RwLock<HashMap<String, u32>>,
    /// Consecutive failures that demote an account to invalid
    failure_threshold: u32,
}

impl AccountPool {
    /// Create a new account pool
    pub fn new(db: Arc<Database>, client: Arc<PlatformClient>, failure_threshold: u32) -> Self {
        Self {
            db,
            client,
            failure_tally: RwLock::new(HashMap::new()),
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Active accounts in creation order, optionally filtered by group tag.
    pub async fn active_accounts(
        &self,
        group_tag: Option<&str>,
    ) -> Result<Vec<Account>, AppError> {
        let accounts = self.db.list_active_accounts(group_tag).await?;
        crate::metrics::ACCOUNTS_ACTIVE.set(accounts.len() as i64);
        Ok(accounts)
    }

    /// Probe one account's credentials and persist the observed status.
    pub async fn validate(&self, account: &Account) -> Result<AccountStatus, AppError> {
        let probe = self.client.probe_account(account).await?;

        self.db
            .update_account_check(&account.id, probe.status, chrono::Utc::now())
            .await?;

        match probe.status {
            AccountStatus::Valid | AccountStatus::Expiring => {
                self.mark_success(&account.id).await;
            }
            AccountStatus::Invalid => {
                tracing::warn!(account_id = %account.id, "Account probe came back invalid");
            }
            AccountStatus::Unknown => {}
        }

        tracing::debug!(
            account_id = %account.id,
            status = probe.status.as_str(),
            "Account validated"
        );

        Ok(probe.status)
    }

    /// Record a failed signed request against an account.
    ///
    /// After `failure_threshold` consecutive failures the persisted
    /// status is demoted to invalid and the tally cleared.
    pub async fn mark_failure(&self, account_id: &str, reason: &str) -> Result<(), AppError> {
        let failures = {
            let mut tally = self.failure_tally.write().await;
            let entry = tally.entry(account_id.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };

        tracing::debug!(account_id, failures, reason, "Account failure recorded");

        if failures >= self.failure_threshold {
            self.db
                .set_account_status(account_id, AccountStatus::Invalid)
                .await?;
            {
                let mut tally = self.failure_tally.write().await;
                tally.remove(account_id);
            }
            crate::metrics::ACCOUNTS_DEMOTED_TOTAL
                .with_label_values(&["consecutive_failures"])
                .inc();
            tracing::warn!(
                account_id,
                failures,
                reason,
                "Account demoted to invalid after consecutive failures"
            );
        }

        Ok(())
    }

    /// Record a successful signed request, clearing the failure tally.
    pub async fn mark_success(&self, account_id: &str) {
        let mut tally = self.failure_tally.write().await;
        tally.remove(account_id);
    }

    /// Current consecutive-failure count for an account.
    pub async fn failure_count(&self, account_id: &str) -> u32 {
        let tally = self.failure_tally.read().await;
        tally.get(account_id).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::EntityId;
    use crate::platform::RequestSigner;
    use std::time::Duration;

    async fn test_pool(threshold: u32) -> (tempfile::TempDir, Arc<Database>, AccountPool) {
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

        let pool = AccountPool::new(db.clone(), client, threshold);
        (dir, db, pool)
    }

    fn sample_account(label: &str, group_tag: Option<&str>) -> Account {
        Account {
            id: EntityId::new().0,
            label: label.to_string(),
            session_token: "token".to_string(),
            csrf_token: "csrf".to_string(),
            user_agent: "UA".to_string(),
            device_id: "device".to_string(),
            group_tag: group_tag.map(str::to_string),
            is_active: true,
            status: AccountStatus::Valid.as_str().to_string(),
            last_check_at: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn active_accounts_filters_by_group_tag() {
        let (_dir, db, pool) = test_pool(3).await;

        db.insert_account(&sample_account("first", Some("blue")))
            .await
            .unwrap();
        db.insert_account(&sample_account("second", Some("green")))
            .await
            .unwrap();
        let mut inactive = sample_account("third", Some("blue"));
        inactive.is_active = false;
        db.insert_account(&inactive).await.unwrap();

        let blue = pool.active_accounts(Some("blue")).await.unwrap();
        assert_eq!(blue.len(), 1);
        assert_eq!(blue[0].label, "first");

        let all = pool.active_accounts(None).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn repeated_failures_demote_account() {
        let (_dir, db, pool) = test_pool(3).await;

        let account = sample_account("main", None);
        db.insert_account(&account).await.unwrap();

        pool.mark_failure(&account.id, "timeout").await.unwrap();
        pool.mark_failure(&account.id, "timeout").await.unwrap();
        assert_eq!(pool.failure_count(&account.id).await, 2);

        let stored = db.get_account(&account.id).await.unwrap().unwrap();
        assert_eq!(stored.status, "valid");

        pool.mark_failure(&account.id, "timeout").await.unwrap();

        let stored = db.get_account(&account.id).await.unwrap().unwrap();
        assert_eq!(stored.status, "invalid");
        // Tally resets once the demotion is persisted.
        assert_eq!(pool.failure_count(&account.id).await, 0);
    }

    #[tokio::test]
    async fn success_resets_failure_tally() {
        let (_dir, db, pool) = test_pool(3).await;

        let account = sample_account("main", None);
        db.insert_account(&account).await.unwrap();

        pool.mark_failure(&account.id, "timeout").await.unwrap();
        pool.mark_failure(&account.id, "timeout").await.unwrap();
        pool.mark_success(&account.id).await;
        assert_eq!(pool.failure_count(&account.id).await, 0);

        // The streak starts over; two more failures do not demote.
        pool.mark_failure(&account.id, "timeout").await.unwrap();
        pool.mark_failure(&account.id, "timeout").await.unwrap();
        let stored = db.get_account(&account.id).await.unwrap().unwrap();
        assert_eq!(stored.status, "valid");
    }
}
