//! Platform HTTP client
//!
//! Thin transport wrapper over the remote platform's API: attaches an
//! account's session cookie, device fingerprint and CSRF token, signs the
//! query through [`RequestSigner`](super::signer::RequestSigner), and
//! parses the `{code, message, data}` response envelope.
//!
//! The client never interprets business outcomes beyond the envelope;
//! queue/state decisions stay in the service layer.

use std::sync::Arc;
use std::time::Instant;

use reqwest::header;
use serde::Deserialize;

use super::signer::RequestSigner;
use crate::data::{Account, AccountStatus, Target, TargetKind};
use crate::error::AppError;

/// Envelope codes the platform uses for dead credentials.
const AUTH_FAILURE_CODES: [i64; 2] = [-101, -111];

/// Envelope wrapper every platform endpoint responds with
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ApiResponse {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl ApiResponse {
    /// Map a non-zero envelope code to the error taxonomy.
    ///
    /// Auth codes become `AccountInvalid` (skip the account), everything
    /// else `RemoteRejected` (bounded retry).
    pub fn ensure_success(&self, account_id: &str) -> Result<(), AppError> {
        if self.code == 0 {
            return Ok(());
        }

        if AUTH_FAILURE_CODES.contains(&self.code) {
            return Err(AppError::AccountInvalid {
                account_id: account_id.to_string(),
                reason: format!("code {}: {}", self.code, self.message),
            });
        }

        Err(AppError::RemoteRejected {
            code: self.code,
            message: self.message.clone(),
        })
    }
}

/// One conversation session as listed by the platform
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSummary {
    pub talker_id: i64,
    pub last_msg_ts: i64,
    #[serde(default)]
    pub unread_count: i64,
}

#[derive(Debug, Deserialize)]
struct SessionPage {
    #[serde(default)]
    sessions: Vec<SessionSummary>,
}

/// One incoming private message
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    pub talker_id: i64,
    pub msg_ts: i64,
    #[serde(default)]
    pub from_self: bool,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct MessagePage {
    #[serde(default)]
    messages: Vec<IncomingMessage>,
}

/// Outcome of an account validity probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountProbe {
    pub status: AccountStatus,
}

/// Signed HTTP client for the remote platform
pub struct PlatformClient {
    http_client: Arc<reqwest::Client>,
    base_url: String,
    signer: Arc<RequestSigner>,
    default_user_agent: String,
}

impl PlatformClient {
    /// Create a new platform client
    pub fn new(
        http_client: Arc<reqwest::Client>,
        base_url: &str,
        signer: Arc<RequestSigner>,
        default_user_agent: String,
    ) -> Self {
        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            signer,
            default_user_agent,
        }
    }

    fn cookie_for(account: &Account) -> String {
        format!(
            "session_token={}; device_id={}",
            account.session_token, account.device_id
        )
    }

    fn user_agent_for<'a>(&'a self, account: &'a Account) -> &'a str {
        if account.user_agent.is_empty() {
            &self.default_user_agent
        } else {
            &account.user_agent
        }
    }

    /// Issue a signed GET with the account's credentials attached.
    pub async fn signed_get(
        &self,
        account: &Account,
        path: &str,
        params: Vec<(String, String)>,
    ) -> Result<ApiResponse, AppError> {
        let signed = self.signer.sign(&params).await?;
        let url = format!("{}{}", self.base_url, path);

        let request = self
            .http_client
            .get(&url)
            .header(header::COOKIE, Self::cookie_for(account))
            .header(header::USER_AGENT, self.user_agent_for(account))
            .query(&signed);

        self.dispatch(path, request).await
    }

    /// Issue a signed POST; the signed parameter set is sent as a form
    /// body, with the account's CSRF token merged in before signing.
    pub async fn signed_post_form(
        &self,
        account: &Account,
        path: &str,
        mut params: Vec<(String, String)>,
    ) -> Result<ApiResponse, AppError> {
        params.push(("csrf".to_string(), account.csrf_token.clone()));
        let signed = self.signer.sign(&params).await?;
        let url = format!("{}{}", self.base_url, path);

        let request = self
            .http_client
            .post(&url)
            .header(header::COOKIE, Self::cookie_for(account))
            .header(header::USER_AGENT, self.user_agent_for(account))
            .form(&signed);

        self.dispatch(path, request).await
    }

    async fn dispatch(
        &self,
        endpoint: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<ApiResponse, AppError> {
        let started = Instant::now();
        let result = request.send().await;

        crate::metrics::PLATFORM_REQUEST_DURATION_SECONDS
            .with_label_values(&[endpoint])
            .observe(started.elapsed().as_secs_f64());

        let response = match result {
            Ok(response) => response,
            Err(error) => {
                crate::metrics::PLATFORM_REQUESTS_TOTAL
                    .with_label_values(&[endpoint, "transport_error"])
                    .inc();
                return Err(AppError::Transport(error));
            }
        };

        let status = response.status();
        crate::metrics::PLATFORM_REQUESTS_TOTAL
            .with_label_values(&[endpoint, status.as_str()])
            .inc();

        if !status.is_success() {
            return Err(AppError::RemoteRejected {
                code: status.as_u16() as i64,
                message: format!("HTTP {}", status),
            });
        }

        let envelope: ApiResponse = response.json().await?;
        Ok(envelope)
    }

    // =========================================================================
    // Domain calls
    // =========================================================================

    /// Lightweight authenticated probe of an account's credentials.
    ///
    /// Auth rejections are a probe *result* (invalid), not an error;
    /// only transport/signing problems surface as `Err`.
    pub async fn probe_account(&self, account: &Account) -> Result<AccountProbe, AppError> {
        let response = self
            .signed_get(account, "/api/credential/verify", Vec::new())
            .await?;

        if AUTH_FAILURE_CODES.contains(&response.code) {
            return Ok(AccountProbe {
                status: AccountStatus::Invalid,
            });
        }

        if response.code != 0 {
            return Err(AppError::RemoteRejected {
                code: response.code,
                message: response.message,
            });
        }

        let expiring = response
            .data
            .as_ref()
            .and_then(|data| data.get("expiring"))
            .and_then(|value| value.as_bool())
            .unwrap_or(false);

        Ok(AccountProbe {
            status: if expiring {
                AccountStatus::Expiring
            } else {
                AccountStatus::Valid
            },
        })
    }

    /// Submit one moderation report for a target through one account.
    ///
    /// Returns the raw envelope; the executor decides retry/terminal.
    pub async fn submit_report(
        &self,
        account: &Account,
        target: &Target,
    ) -> Result<ApiResponse, AppError> {
        let kind = TargetKind::parse(&target.kind).ok_or_else(|| {
            AppError::Validation(format!("unknown target kind: {}", target.kind))
        })?;

        let path = match kind {
            TargetKind::Video => "/api/report/video",
            TargetKind::Comment => "/api/report/comment",
            TargetKind::User => "/api/report/user",
        };

        let mut params = vec![
            ("id".to_string(), target.identifier.clone()),
            ("reason".to_string(), target.reason_code.to_string()),
        ];
        if let Some(context_id) = target.context_id {
            params.push(("context_id".to_string(), context_id.to_string()));
        }
        if let Some(detail) = &target.reason_detail {
            if !detail.is_empty() {
                params.push(("detail".to_string(), detail.clone()));
            }
        }

        self.signed_post_form(account, path, params).await
    }

    /// Fetch an account's most recent conversation sessions.
    ///
    /// `limit` of 0 means no cap.
    pub async fn recent_sessions(
        &self,
        account: &Account,
        limit: usize,
    ) -> Result<Vec<SessionSummary>, AppError> {
        let mut params = Vec::new();
        if limit > 0 {
            params.push(("limit".to_string(), limit.to_string()));
        }

        let response = self
            .signed_get(account, "/api/message/sessions", params)
            .await?;
        response.ensure_success(&account.id)?;

        let page: SessionPage = match response.data {
            Some(data) => serde_json::from_value(data)
                .map_err(|e| AppError::Validation(format!("malformed session page: {}", e)))?,
            None => SessionPage { sessions: Vec::new() },
        };

        Ok(page.sessions)
    }

    /// Fetch messages in one conversation newer than `since_ts`.
    pub async fn messages_since(
        &self,
        account: &Account,
        talker_id: i64,
        since_ts: i64,
    ) -> Result<Vec<IncomingMessage>, AppError> {
        let params = vec![
            ("talker_id".to_string(), talker_id.to_string()),
            ("since".to_string(), since_ts.to_string()),
        ];

        let response = self
            .signed_get(account, "/api/message/history", params)
            .await?;
        response.ensure_success(&account.id)?;

        let page: MessagePage = match response.data {
            Some(data) => serde_json::from_value(data)
                .map_err(|e| AppError::Validation(format!("malformed message page: {}", e)))?,
            None => MessagePage { messages: Vec::new() },
        };

        Ok(page.messages)
    }

    /// Send one auto-reply into a conversation.
    pub async fn send_reply(
        &self,
        account: &Account,
        talker_id: i64,
        content: &str,
    ) -> Result<ApiResponse, AppError> {
        let params = vec![
            ("talker_id".to_string(), talker_id.to_string()),
            ("content".to_string(), content.to_string()),
        ];

        self.signed_post_form(account, "/api/message/send", params)
            .await
    }
}
