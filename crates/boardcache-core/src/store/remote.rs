//! Remote blob cache
//!
//! Objects live at `<bucket>/<key>.db`. Every backend failure (network, auth,
//! missing object, disabled backend) is reported to the caller as a miss on
//! `get` and swallowed with a warning on `put`.

use crate::config::RemoteConfig;
use crate::error::CoreError;
use crate::models::CacheKey;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use thiserror::Error;
use tracing::{debug, warn};

/// Best-effort key/value store for whole database files
#[async_trait]
pub trait RemoteStore: Send + Sync {
    fn backend_tag(&self) -> &'static str;

    /// False for a store that never holds anything
    fn is_enabled(&self) -> bool {
        true
    }

    /// Bytes stored under `key`; any failure is a miss
    async fn get(&self, key: &CacheKey) -> Option<Vec<u8>>;

    /// Store `bytes` under `key`, replacing any existing object; failures are logged
    async fn put(&self, key: &CacheKey, bytes: Vec<u8>);
}

/// Remote store used when no backend is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledRemoteStore;

#[async_trait]
impl RemoteStore for DisabledRemoteStore {
    fn backend_tag(&self) -> &'static str {
        "disabled"
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn get(&self, _key: &CacheKey) -> Option<Vec<u8>> {
        None
    }

    async fn put(&self, _key: &CacheKey, _bytes: Vec<u8>) {}
}

#[derive(Debug, Error)]
enum RemoteError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

/// Supabase Storage REST backend
pub struct SupabaseStore {
    client: reqwest::Client,
    base_url: String,
    bucket: String,
}

impl SupabaseStore {
    pub fn new(config: &RemoteConfig) -> Result<Self, CoreError> {
        let invalid = |message: String| CoreError::InvalidConfig { message };

        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.service_key))
            .map_err(|_| invalid("service key is not a valid header value".to_string()))?;
        let apikey = HeaderValue::from_str(&config.service_key)
            .map_err(|_| invalid("service key is not a valid header value".to_string()))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert("apikey", apikey);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|e| invalid(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            bucket: config.bucket.clone(),
        })
    }

    fn object_url(&self, key: &CacheKey) -> String {
        format!(
            "{}/storage/v1/object/{}/{}",
            self.base_url,
            self.bucket,
            key.file_name()
        )
    }

    async fn download(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, RemoteError> {
        let response = self.client.get(self.object_url(key)).send().await?;
        let status = response.status();
        // Storage answers 400 for a missing object in some deployments
        if status == StatusCode::NOT_FOUND || status == StatusCode::BAD_REQUEST {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Status { status, body });
        }
        Ok(Some(response.bytes().await?.to_vec()))
    }

    async fn upload(&self, key: &CacheKey, bytes: Vec<u8>) -> Result<(), RemoteError> {
        let response = self
            .client
            .post(self.object_url(key))
            .header(CONTENT_TYPE, "application/octet-stream")
            .header("x-upsert", "true")
            .body(bytes)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Status { status, body });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for SupabaseStore {
    fn backend_tag(&self) -> &'static str {
        "supabase"
    }

    async fn get(&self, key: &CacheKey) -> Option<Vec<u8>> {
        match self.download(key).await {
            Ok(Some(bytes)) => {
                debug!(board = %key, bytes = bytes.len(), "Remote cache hit");
                Some(bytes)
            }
            Ok(None) => {
                debug!(board = %key, "Remote cache miss");
                None
            }
            Err(e) => {
                warn!(board = %key, error = %e, "Remote cache download failed, treating as miss");
                None
            }
        }
    }

    async fn put(&self, key: &CacheKey, bytes: Vec<u8>) {
        let len = bytes.len();
        match self.upload(key, bytes).await {
            Ok(()) => debug!(board = %key, bytes = len, "Remote cache updated"),
            Err(e) => warn!(board = %key, error = %e, "Remote cache upload failed"),
        }
    }
}

/// In-process remote store for tests and local runs
#[derive(Debug, Default)]
pub struct MemoryRemoteStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    gets: AtomicUsize,
    puts: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object without counting it as a put
    pub fn insert(&self, key: &CacheKey, bytes: Vec<u8>) {
        self.objects.lock().insert(key.as_str().to_string(), bytes);
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.objects.lock().contains_key(key.as_str())
    }

    pub fn object(&self, key: &CacheKey) -> Option<Vec<u8>> {
        self.objects.lock().get(key.as_str()).cloned()
    }

    /// Make every subsequent call behave like an unreachable backend
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    fn backend_tag(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &CacheKey) -> Option<Vec<u8>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            warn!(board = %key, "Remote cache download failed, treating as miss");
            return None;
        }
        self.objects.lock().get(key.as_str()).cloned()
    }

    async fn put(&self, key: &CacheKey, bytes: Vec<u8>) {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            warn!(board = %key, "Remote cache upload failed");
            return;
        }
        self.objects.lock().insert(key.as_str().to_string(), bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(board: &str) -> CacheKey {
        CacheKey::parse(board).unwrap()
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip_and_counters() {
        let store = MemoryRemoteStore::new();
        assert!(store.get(&key("aurora")).await.is_none());

        store.put(&key("aurora"), b"db".to_vec()).await;
        assert_eq!(store.get(&key("Aurora")).await, Some(b"db".to_vec()));
        assert_eq!(store.get_count(), 2);
        assert_eq!(store.put_count(), 1);
    }

    #[tokio::test]
    async fn test_failing_store_reports_miss() {
        let store = MemoryRemoteStore::new();
        store.insert(&key("kilter"), b"db".to_vec());
        store.set_failing(true);

        assert!(store.get(&key("kilter")).await.is_none());
        store.put(&key("kilter"), b"other".to_vec()).await;
        assert_eq!(store.object(&key("kilter")), Some(b"db".to_vec()));
    }

    #[tokio::test]
    async fn test_disabled_store_is_always_miss() {
        let store = DisabledRemoteStore;
        store.put(&key("aurora"), b"db".to_vec()).await;
        assert!(store.get(&key("aurora")).await.is_none());
        assert!(!store.is_enabled());
    }

    #[test]
    fn test_supabase_object_url() {
        let config = RemoteConfig::new("https://example.supabase.co/", "service-key");
        let store = SupabaseStore::new(&config).unwrap();
        assert_eq!(
            store.object_url(&key("Kilter")),
            "https://example.supabase.co/storage/v1/object/board-dbs/kilter.db"
        );
        assert_eq!(store.backend_tag(), "supabase");
    }

    /// Local stand-in for the Storage API: `missing.db` is 404, `locked.db` is 401,
    /// anything else is served when the `apikey` header matches. Uploads are refused.
    async fn storage_stub() -> String {
        use axum::extract::Path;
        use axum::response::{IntoResponse, Response};
        use axum::routing::get;

        async fn object(Path(file): Path<String>, headers: HeaderMap) -> Response {
            let authorized = headers
                .get("apikey")
                .is_some_and(|v| v.as_bytes() == b"service-key");
            match file.as_str() {
                "missing.db" => (StatusCode::NOT_FOUND, "Object not found").into_response(),
                "locked.db" => (StatusCode::UNAUTHORIZED, "invalid signature").into_response(),
                _ if authorized => b"SQLite format 3".to_vec().into_response(),
                _ => StatusCode::FORBIDDEN.into_response(),
            }
        }

        let app = axum::Router::new().route(
            "/storage/v1/object/board-dbs/{file}",
            get(object).post(|| async { (StatusCode::UNAUTHORIZED, "invalid signature") }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_supabase_status_handling() {
        let url = storage_stub().await;
        let store = SupabaseStore::new(&RemoteConfig::new(url, "service-key")).unwrap();

        assert!(store.get(&key("missing")).await.is_none());
        assert!(store.get(&key("locked")).await.is_none());
        assert_eq!(
            store.get(&key("aurora")).await,
            Some(b"SQLite format 3".to_vec())
        );

        match store.download(&key("locked")).await {
            Err(RemoteError::Status { status, body }) => {
                assert_eq!(status, StatusCode::UNAUTHORIZED);
                assert_eq!(body, "invalid signature");
            }
            other => panic!("expected status error, got {:?}", other),
        }
        assert!(matches!(store.download(&key("missing")).await, Ok(None)));

        assert!(matches!(
            store.upload(&key("aurora"), b"db".to_vec()).await,
            Err(RemoteError::Status { status, .. }) if status == StatusCode::UNAUTHORIZED
        ));
        // Swallowed on the trait surface
        store.put(&key("aurora"), b"db".to_vec()).await;
    }

    #[tokio::test]
    async fn test_unreachable_supabase_is_miss() {
        let mut config = RemoteConfig::new("http://127.0.0.1:9", "service-key");
        config.timeout = std::time::Duration::from_secs(2);
        let store = SupabaseStore::new(&config).unwrap();

        assert!(store.get(&key("aurora")).await.is_none());
        store.put(&key("aurora"), b"db".to_vec()).await;
    }
}
