//! Common test utilities for E2E tests

use modpatrol::data::{Account, AccountStatus, EntityId, Target, TargetKind, TargetStatus};
use modpatrol::{AppState, config};
use tempfile::TempDir;
use tokio::net::TcpListener;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Raw signing keys served by the mocked platform.
pub const PRIMARY_KEY: &str = "7cd084941338484aae1ad9425b84077c";
pub const SECONDARY_KEY: &str = "4932caff0ff746eab6f01bf08b70ac45";

/// Test server instance wired against a mocked platform
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub platform: MockServer,
    pub client: reqwest::Client,
    pub _temp_dir: TempDir,
}

impl TestServer {
    /// Create a new test server instance
    ///
    /// Mocks the platform's signing-key endpoint, zeroes the courtesy
    /// delays, and binds the HTTP surface on a random port.
    pub async fn new() -> Self {
        let platform = MockServer::start().await;

        // Signing keys are always available in tests.
        Mock::given(method("GET"))
            .and(path("/api/credential/keys"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 0,
                "message": "0",
                "data": {
                    "primary_url": format!("https://cdn.example.com/{}.png", PRIMARY_KEY),
                    "secondary_url": format!("https://cdn.example.com/{}.png", SECONDARY_KEY),
                }
            })))
            .mount(&platform)
            .await;

        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        // Create test configuration
        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0, // Let OS assign port
            },
            database: config::DatabaseConfig { path: db_path },
            platform: config::PlatformConfig {
                base_url: platform.uri(),
                signing_key_ttl_seconds: 3600,
                request_timeout_seconds: 5,
                default_user_agent: "ModPatrol-Test/0.1".to_string(),
            },
            executor: config::ExecutorConfig {
                account_failure_threshold: 3,
                // One attempt per account keeps log-row counts predictable.
                max_attempt_retries: 0,
                max_target_retries: 2,
                backoff_base_ms: 1,
                backoff_cap_ms: 10,
                max_concurrency: 4,
            },
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        // Initialize app state
        let state = AppState::new(config).await.unwrap();

        // Courtesy delays would only slow the suite down.
        state.db.set_setting("min_delay", "0").await.unwrap();
        state.db.set_setting("max_delay", "0").await.unwrap();

        // Create HTTP client
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let addr_str = format!("http://{}", addr);

        // Build router and spawn server in background
        let app = modpatrol::build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: addr_str,
            state,
            platform,
            client,
            _temp_dir: temp_dir,
        }
    }

    /// Full URL for a server path
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Insert a usable account and return it.
    pub async fn seed_account(&self, label: &str) -> Account {
        let now = chrono::Utc::now();
        let account = Account {
            id: EntityId::new().0,
            label: label.to_string(),
            session_token: format!("session-{}", label),
            csrf_token: format!("csrf-{}", label),
            user_agent: "ModPatrol-Test/0.1".to_string(),
            device_id: format!("device-{}", label),
            group_tag: None,
            is_active: true,
            status: AccountStatus::Valid.as_str().to_string(),
            last_check_at: None,
            created_at: now,
            updated_at: now,
        };
        self.state.db.insert_account(&account).await.unwrap();
        account
    }

    /// Insert a pending video target and return it.
    pub async fn seed_video_target(&self, identifier: &str) -> Target {
        let now = chrono::Utc::now();
        let target = Target {
            id: EntityId::new().0,
            kind: TargetKind::Video.as_str().to_string(),
            identifier: identifier.to_string(),
            context_id: None,
            reason_code: 2,
            reason_detail: Some("spam".to_string()),
            status: TargetStatus::Pending.as_str().to_string(),
            retry_count: 0,
            created_at: now,
            updated_at: now,
        };
        self.state.db.insert_target(&target).await.unwrap();
        target
    }
}

/// A platform envelope with the given code.
pub fn envelope(code: i64, message: &str) -> serde_json::Value {
    serde_json::json!({ "code": code, "message": message, "data": null })
}
