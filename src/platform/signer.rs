//! Signed-query request signing
//!
//! The platform only accepts requests whose query string carries a
//! timestamp (`wts`) and a keyed MD5 digest (`w_rid`). The digest key is
//! not served directly: two raw keys rotate on the platform side and the
//! effective "mixin key" is derived from their concatenation through a
//! fixed byte permutation.
//!
//! Signing itself is pure and deterministic; only the raw-key fetch does
//! I/O. Raw keys are cached with an expiry and refreshed lazily.

use std::sync::Arc;
use std::time::{Duration, Instant};

use md5::{Digest, Md5};
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::error::AppError;

/// Byte positions picked from the concatenated raw keys, in output order.
/// Only the first 32 picks survive the truncation below.
const MIXIN_KEY_TABLE: [usize; 64] = [
    46, 47, 18, 2, 53, 8, 23, 32, 15, 50, 10, 31, 58, 3, 45, 35, 27, 43, 5, 49, 33, 9, 42, 19, 29,
    28, 14, 39, 12, 38, 41, 13, 37, 48, 7, 16, 24, 55, 40, 61, 26, 17, 0, 1, 60, 51, 30, 4, 22,
    25, 54, 21, 56, 59, 6, 63, 57, 62, 11, 36, 20, 34, 44, 52,
];

const MIXIN_KEY_LEN: usize = 32;

/// Characters the platform strips from parameter values before hashing.
const FILTERED_VALUE_CHARS: [char; 5] = ['!', '\'', '(', ')', '*'];

/// Derive the mixin key from the two raw keys.
pub fn derive_mixin_key(primary: &str, secondary: &str) -> String {
    let concat: Vec<char> = primary.chars().chain(secondary.chars()).collect();
    MIXIN_KEY_TABLE
        .iter()
        .filter_map(|&index| concat.get(index))
        .take(MIXIN_KEY_LEN)
        .collect()
}

/// Sign a parameter set with an explicit timestamp.
///
/// Deterministic: identical params, mixin key and timestamp always yield
/// the identical signed set. Returns the parameters in canonical order
/// with `wts` merged in and `w_rid` appended.
pub fn sign_params(
    params: &[(String, String)],
    mixin_key: &str,
    timestamp: i64,
) -> Vec<(String, String)> {
    // 1. Sanitize values and add the timestamp
    let mut sorted: Vec<(String, String)> = params
        .iter()
        .map(|(key, value)| {
            let cleaned: String = value
                .chars()
                .filter(|c| !FILTERED_VALUE_CHARS.contains(c))
                .collect();
            (key.clone(), cleaned)
        })
        .collect();
    sorted.push(("wts".to_string(), timestamp.to_string()));

    // 2. Sort by key lexicographically
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    // 3. URL-encode and concatenate as key=value&...
    let canonical = sorted
        .iter()
        .map(|(key, value)| {
            format!(
                "{}={}",
                urlencoding::encode(key),
                urlencoding::encode(value)
            )
        })
        .collect::<Vec<_>>()
        .join("&");

    // 4. Append the mixin key and hash
    let digest = Md5::digest(format!("{}{}", canonical, mixin_key).as_bytes());
    let mut signature = String::with_capacity(MIXIN_KEY_LEN);
    for byte in digest {
        signature.push_str(&format!("{:02x}", byte));
    }

    sorted.push(("w_rid".to_string(), signature));
    sorted
}

/// Raw signing keys as served by the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawKeys {
    pub primary: String,
    pub secondary: String,
}

#[derive(Debug, Deserialize)]
struct KeyEnvelope {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<KeyData>,
}

#[derive(Debug, Deserialize)]
struct KeyData {
    primary_url: String,
    secondary_url: String,
}

/// The raw keys are the filename stems of two served URLs.
fn key_stem(url: &str) -> Option<&str> {
    url.rsplit('/').next()?.split('.').next()
}

#[derive(Debug, Clone)]
struct CachedMixinKey {
    mixin_key: String,
    fetched_at: Instant,
}

impl CachedMixinKey {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

/// Request signer with a cached, periodically refreshed mixin key
///
/// Process-scoped: one instance lives in `AppState` and is shared by the
/// report executor and the auto-reply engine.
pub struct RequestSigner {
    http_client: Arc<reqwest::Client>,
    key_endpoint: String,
    ttl: Duration,
    cache: RwLock<Option<CachedMixinKey>>,
}

impl RequestSigner {
    /// Create a new signer
    ///
    /// # Arguments
    /// * `http_client` - Shared HTTP client
    /// * `base_url` - Platform API base URL
    /// * `ttl` - How long fetched keys stay fresh
    pub fn new(http_client: Arc<reqwest::Client>, base_url: &str, ttl: Duration) -> Self {
        Self {
            http_client,
            key_endpoint: format!("{}/api/credential/keys", base_url.trim_end_matches('/')),
            ttl,
            cache: RwLock::new(None),
        }
    }

    /// Sign a parameter set with the current mixin key and wall clock.
    ///
    /// # Errors
    /// `KeyUnavailable` if no fresh key is cached and a refresh fails;
    /// the caller must not send the request in that case.
    pub async fn sign(&self, params: &[(String, String)]) -> Result<Vec<(String, String)>, AppError> {
        let mixin_key = self.mixin_key().await?;
        Ok(sign_params(params, &mixin_key, chrono::Utc::now().timestamp()))
    }

    /// Current mixin key, refreshing the raw keys if the cache is stale.
    pub async fn mixin_key(&self) -> Result<String, AppError> {
        // Fast path: fresh cache under the read lock
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.is_fresh(self.ttl) {
                    return Ok(cached.mixin_key.clone());
                }
                tracing::debug!("Signing key cache expired");
            }
        }

        // Slow path: refresh under the write lock
        let mut cache = self.cache.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some(cached) = cache.as_ref() {
            if cached.is_fresh(self.ttl) {
                return Ok(cached.mixin_key.clone());
            }
        }

        match self.fetch_raw_keys().await {
            Ok(raw) => {
                let mixin_key = derive_mixin_key(&raw.primary, &raw.secondary);
                crate::metrics::SIGNING_KEY_REFRESHES_TOTAL
                    .with_label_values(&["success"])
                    .inc();
                tracing::info!("Signing keys refreshed");
                *cache = Some(CachedMixinKey {
                    mixin_key: mixin_key.clone(),
                    fetched_at: Instant::now(),
                });
                Ok(mixin_key)
            }
            Err(error) => {
                crate::metrics::SIGNING_KEY_REFRESHES_TOTAL
                    .with_label_values(&["error"])
                    .inc();
                tracing::warn!(%error, "Signing key refresh failed");
                Err(error)
            }
        }
    }

    /// Drop the cached key so the next signing attempt refreshes.
    pub async fn invalidate(&self) {
        let mut cache = self.cache.write().await;
        *cache = None;
        tracing::debug!("Signing key cache invalidated");
    }

    async fn fetch_raw_keys(&self) -> Result<RawKeys, AppError> {
        let response = self
            .http_client
            .get(&self.key_endpoint)
            .send()
            .await
            .map_err(|e| AppError::KeyUnavailable(format!("key fetch failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::KeyUnavailable(format!(
                "key endpoint returned HTTP {}",
                response.status()
            )));
        }

        let envelope: KeyEnvelope = response
            .json()
            .await
            .map_err(|e| AppError::KeyUnavailable(format!("malformed key response: {}", e)))?;

        if envelope.code != 0 {
            return Err(AppError::KeyUnavailable(format!(
                "key endpoint rejected request: code {}: {}",
                envelope.code, envelope.message
            )));
        }

        let data = envelope
            .data
            .ok_or_else(|| AppError::KeyUnavailable("key response missing data".to_string()))?;

        let primary = key_stem(&data.primary_url)
            .ok_or_else(|| AppError::KeyUnavailable("unusable primary key URL".to_string()))?;
        let secondary = key_stem(&data.secondary_url)
            .ok_or_else(|| AppError::KeyUnavailable("unusable secondary key URL".to_string()))?;

        Ok(RawKeys {
            primary: primary.to_string(),
            secondary: secondary.to_string(),
        })
    }
}
