//! Database orchestrator
//!
//! `ensure` returns a local database path for a board that satisfies a
//! capability tier, trying in order:
//!
//! 1. the local cache (evicting a stale file that lacks relations)
//! 2. the remote cache (skipped for per-user tiers)
//! 3. a fresh build through the acquisition runner, validated before install
//!
//! Calls for the same board are serialized; different boards run in parallel.
//!
//! `ensure_images` runs the same lookup for the `layouts` tier and then
//! downloads board images next to it unless some are already cached.

use crate::acquisition::{
    BoardlibRunner, BuildOutcome, BuildRequest, Diagnostic, ImagesRequest, Runner,
};
use crate::cancel::CancelToken;
use crate::capability::{self, CapabilityTier};
use crate::config::CacheConfig;
use crate::error::CoreError;
use crate::models::{
    BoardDatabase, BoardImages, CacheKey, CacheStatus, Credentials, DatabaseSource,
    ImageCacheState,
};
use crate::schema;
use crate::store::local::remove_database_files;
use crate::store::{DisabledRemoteStore, FsLocalStore, LocalStore, RemoteStore, SupabaseStore};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

pub struct DatabaseOrchestrator {
    config: CacheConfig,
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    runner: Arc<dyn Runner>,
    /// One async mutex per board, held for the whole of `ensure`
    inflight: DashMap<CacheKey, Arc<Mutex<()>>>,
}

impl DatabaseOrchestrator {
    pub fn new(
        config: CacheConfig,
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        runner: Arc<dyn Runner>,
    ) -> Self {
        Self {
            config,
            local,
            remote,
            runner,
            inflight: DashMap::new(),
        }
    }

    /// Wire the filesystem store, the configured remote backend and the boardlib runner
    pub fn from_config(config: CacheConfig) -> Result<Self, CoreError> {
        config.validate()?;

        let local: Arc<dyn LocalStore> = Arc::new(FsLocalStore::new(config.cache_root.clone()));
        let remote: Arc<dyn RemoteStore> = match &config.remote {
            Some(remote) => Arc::new(SupabaseStore::new(remote)?),
            None => Arc::new(DisabledRemoteStore),
        };
        let runner: Arc<dyn Runner> = Arc::new(BoardlibRunner::new(config.runner.clone()));

        info!(
            cache_root = %config.cache_root.display(),
            remote = remote.backend_tag(),
            "Database orchestrator ready"
        );

        Ok(Self::new(config, local, remote, runner))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn cache_root(&self) -> &Path {
        self.local.root()
    }

    pub fn remote_enabled(&self) -> bool {
        self.remote.is_enabled()
    }

    /// Return a database for `board` that satisfies `tier`, building it if needed
    pub async fn ensure(
        &self,
        board: &str,
        tier: CapabilityTier,
        credentials: &Credentials,
    ) -> Result<BoardDatabase, CoreError> {
        self.ensure_with_cancel(board, tier, credentials, &CancelToken::new())
            .await
    }

    /// Like [`ensure`](Self::ensure), aborting the build when `cancel` fires
    #[instrument(skip_all, fields(board = %board, tier = %tier))]
    pub async fn ensure_with_cancel(
        &self,
        board: &str,
        tier: CapabilityTier,
        credentials: &Credentials,
        cancel: &CancelToken,
    ) -> Result<BoardDatabase, CoreError> {
        let key = CacheKey::parse(board)?;
        let lock = self.board_lock(&key);
        let _guard = lock.lock().await;

        self.ensure_locked(&key, tier, credentials, cancel).await
    }

    /// Make sure images for `board` are on disk, downloading them if none are
    ///
    /// The board lock is held across both the database lookup and the download.
    #[instrument(skip_all, fields(board = %board))]
    pub async fn ensure_images(
        &self,
        board: &str,
        credentials: &Credentials,
        cancel: &CancelToken,
    ) -> Result<BoardImages, CoreError> {
        let key = CacheKey::parse(board)?;
        let lock = self.board_lock(&key);
        let _guard = lock.lock().await;

        let tier = CapabilityTier::Layouts;
        let database = self.ensure_locked(&key, tier, credentials, cancel).await?;

        let root = self.config.images_root(&key);
        std::fs::create_dir_all(&root)
            .map_err(|e| CoreError::store_io(&root, "create images directory", e))?;

        let existing = list_images(&root);
        if !existing.is_empty() {
            debug!(board = %key, count = existing.len(), "Images already cached");
            return Ok(board_images(key, root, ImageCacheState::Cached, existing));
        }

        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled {
                board: key.to_string(),
                tier,
            });
        }

        info!(board = %key, root = %root.display(), "Fetching board images");
        let request = ImagesRequest {
            key: &key,
            database: &database.path,
            output_dir: &root,
        };
        match self.runner.fetch_images(&request, cancel).await {
            BuildOutcome::Success(_) => {}
            BuildOutcome::Failure { reason, diagnostic } => {
                warn!(board = %key, reason = %reason, exit_code = ?diagnostic.exit_code, "Image download failed");
                return Err(CoreError::Acquisition {
                    board: key.to_string(),
                    tier,
                    reason: format!("image download {}", reason),
                    diagnostic,
                });
            }
            BuildOutcome::Cancelled => {
                info!(board = %key, "Image download cancelled");
                return Err(CoreError::Cancelled {
                    board: key.to_string(),
                    tier,
                });
            }
        }

        let fetched = list_images(&root);
        info!(board = %key, count = fetched.len(), "Board images fetched");
        Ok(board_images(key, root, ImageCacheState::Fetched, fetched))
    }

    fn board_lock(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        Arc::clone(
            self.inflight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Steps of `ensure` after the board lock is taken
    async fn ensure_locked(
        &self,
        key: &CacheKey,
        tier: CapabilityTier,
        credentials: &Credentials,
        cancel: &CancelToken,
    ) -> Result<BoardDatabase, CoreError> {
        if let Some(database) = self.local_hit(&key, tier)? {
            return Ok(database);
        }

        let shareable = !tier.is_per_user() && self.remote.is_enabled();
        if shareable {
            if let Some(database) = self.remote_hit(&key, tier).await? {
                return Ok(database);
            }
        }

        if self.config.requires_auth(&key) {
            if let Some(missing) = credentials.missing_field() {
                warn!(board = %key, tier = %tier, missing, "Credentials required, refusing to build");
                return Err(CoreError::Precondition {
                    board: key.to_string(),
                    tier,
                    missing,
                });
            }
        }

        let database = self.build(&key, tier, credentials, cancel).await?;

        if shareable {
            self.write_back(&key, &database.path).await;
        }

        Ok(database)
    }

    fn local_hit(
        &self,
        key: &CacheKey,
        tier: CapabilityTier,
    ) -> Result<Option<BoardDatabase>, CoreError> {
        let Some(path) = self.local.get(key) else {
            debug!(board = %key, "Local cache miss");
            return Ok(None);
        };

        let inspection = schema::inspect(&path, tier);
        if inspection.satisfied() {
            debug!(board = %key, tier = %tier, path = %path.display(), "Local cache hit");
            return Ok(Some(BoardDatabase {
                board: key.clone(),
                path,
                tier,
                relations: inspection.relations,
                source: DatabaseSource::Local,
            }));
        }

        warn!(
            board = %key,
            tier = %tier,
            missing = ?inspection.missing,
            readable = inspection.readable,
            "Cached database does not satisfy tier, evicting"
        );
        self.local.evict(key)?;
        Ok(None)
    }

    async fn remote_hit(
        &self,
        key: &CacheKey,
        tier: CapabilityTier,
    ) -> Result<Option<BoardDatabase>, CoreError> {
        let Some(bytes) = self.remote.get(key).await else {
            return Ok(None);
        };

        let path = self.local.install_bytes(key, &bytes)?;
        let inspection = schema::inspect(&path, tier);
        if inspection.satisfied() {
            info!(board = %key, tier = %tier, bytes = bytes.len(), "Restored database from remote cache");
            return Ok(Some(BoardDatabase {
                board: key.clone(),
                path,
                tier,
                relations: inspection.relations,
                source: DatabaseSource::Remote,
            }));
        }

        warn!(
            board = %key,
            tier = %tier,
            missing = ?inspection.missing,
            "Remote database does not satisfy tier, discarding"
        );
        self.local.evict(key)?;
        Ok(None)
    }

    async fn build(
        &self,
        key: &CacheKey,
        tier: CapabilityTier,
        credentials: &Credentials,
        cancel: &CancelToken,
    ) -> Result<BoardDatabase, CoreError> {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled {
                board: key.to_string(),
                tier,
            });
        }

        let staging = self.local.prepare_staging(key)?;
        info!(board = %key, tier = %tier, "Building database");

        let request = BuildRequest {
            key,
            credentials,
            output: &staging,
        };
        let diagnostic = match self.runner.build(&request, cancel).await {
            BuildOutcome::Success(diagnostic) => diagnostic,
            BuildOutcome::Failure { reason, diagnostic } => {
                remove_database_files(&staging)?;
                warn!(board = %key, tier = %tier, reason = %reason, exit_code = ?diagnostic.exit_code, "Acquisition failed");
                return Err(CoreError::Acquisition {
                    board: key.to_string(),
                    tier,
                    reason,
                    diagnostic,
                });
            }
            BuildOutcome::Cancelled => {
                remove_database_files(&staging)?;
                info!(board = %key, tier = %tier, "Build cancelled");
                return Err(CoreError::Cancelled {
                    board: key.to_string(),
                    tier,
                });
            }
        };

        if !staging.is_file() {
            warn!(board = %key, tier = %tier, "Acquisition tool exited cleanly without writing a database");
            return Err(CoreError::Acquisition {
                board: key.to_string(),
                tier,
                reason: "tool reported success but produced no database file".to_string(),
                diagnostic,
            });
        }

        let inspection = schema::inspect(&staging, tier);
        if !inspection.satisfied() {
            remove_database_files(&staging)?;
            warn!(
                board = %key,
                tier = %tier,
                missing = ?inspection.missing,
                "Built database does not satisfy tier"
            );
            return Err(incapable(key, tier, inspection.missing, diagnostic));
        }

        let path = self.local.put(key, &staging)?;
        info!(board = %key, tier = %tier, path = %path.display(), "Database built and cached");

        Ok(BoardDatabase {
            board: key.clone(),
            path,
            tier,
            relations: inspection.relations,
            source: DatabaseSource::Built,
        })
    }

    async fn write_back(&self, key: &CacheKey, path: &Path) {
        match tokio::fs::read(path).await {
            Ok(bytes) => self.remote.put(key, bytes).await,
            Err(e) => {
                warn!(board = %key, path = %path.display(), error = %e, "Could not read database for remote write-back")
            }
        }
    }

    /// Describe the local slot for `board` without building
    pub fn status(&self, board: &str) -> Result<CacheStatus, CoreError> {
        let key = CacheKey::parse(board)?;
        let path = self.local.path_for(&key);

        let metadata = match std::fs::metadata(&path) {
            Ok(metadata) if metadata.is_file() => Some(metadata),
            _ => None,
        };

        let (readable, relations) = match &metadata {
            Some(_) => match schema::relations_present(&path) {
                Ok(relations) => (true, relations),
                Err(e) => {
                    debug!(board = %key, error = %e, "Cached database unreadable");
                    (false, BTreeSet::new())
                }
            },
            None => (false, BTreeSet::new()),
        };

        Ok(CacheStatus {
            board: key,
            satisfied_tiers: capability::satisfied_tiers(&relations),
            cached: metadata.is_some(),
            readable,
            relations,
            size_bytes: metadata.as_ref().map(|m| m.len()),
            modified_at: metadata
                .as_ref()
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from),
            path,
        })
    }

    /// Drop the cached database for `board`, waiting for any build in progress
    pub async fn evict(&self, board: &str) -> Result<(), CoreError> {
        let key = CacheKey::parse(board)?;
        let lock = self.board_lock(&key);
        let _guard = lock.lock().await;

        self.local.evict(&key)?;
        info!(board = %key, "Evicted cached database");
        Ok(())
    }

    /// Remove every locally cached database
    pub fn clear(&self) -> Result<usize, CoreError> {
        let removed = self.local.clear()?;
        info!(removed, "Cleared local cache");
        Ok(removed)
    }
}

/// Image files under `root`, sorted, as paths relative to it
fn list_images(root: &Path) -> Vec<PathBuf> {
    let mut images: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .filter_map(|e| e.path().strip_prefix(root).ok().map(Path::to_path_buf))
        .collect();
    images.sort();
    images
}

fn board_images(
    board: CacheKey,
    root: PathBuf,
    status: ImageCacheState,
    images: Vec<PathBuf>,
) -> BoardImages {
    BoardImages {
        board,
        status,
        image_count: images.len(),
        sample: images
            .first()
            .map(|p| p.to_string_lossy().into_owned())
            .into_iter()
            .collect(),
        root,
    }
}

fn incapable(
    key: &CacheKey,
    tier: CapabilityTier,
    missing: Vec<&'static str>,
    diagnostic: Diagnostic,
) -> CoreError {
    CoreError::IncapableResult {
        board: key.to_string(),
        tier,
        missing: missing.into_iter().map(str::to_string).collect(),
        diagnostic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRemoteStore;
    use async_trait::async_trait;
    use rusqlite::Connection;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Writes a SQLite file with `tables` and counts invocations
    struct TableRunner {
        tables: Vec<&'static str>,
        calls: AtomicUsize,
        image_calls: AtomicUsize,
    }

    impl TableRunner {
        fn new(tables: &[&'static str]) -> Self {
            Self {
                tables: tables.to_vec(),
                calls: AtomicUsize::new(0),
                image_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Runner for TableRunner {
        async fn build(&self, request: &BuildRequest<'_>, _cancel: &CancelToken) -> BuildOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let conn = Connection::open(request.output).unwrap();
            for table in &self.tables {
                conn.execute_batch(&format!("CREATE TABLE {table} (id INTEGER PRIMARY KEY);"))
                    .unwrap();
            }
            BuildOutcome::Success(Diagnostic::default())
        }

        async fn fetch_images(
            &self,
            request: &ImagesRequest<'_>,
            _cancel: &CancelToken,
        ) -> BuildOutcome {
            self.image_calls.fetch_add(1, Ordering::SeqCst);
            assert!(request.database.is_file());
            let sets = request.output_dir.join("product_sizes_layouts_sets");
            std::fs::create_dir_all(&sets).unwrap();
            std::fs::write(sets.join("original.png"), b"png").unwrap();
            std::fs::write(sets.join("notes.txt"), b"not an image").unwrap();
            BuildOutcome::Success(Diagnostic::default())
        }
    }

    fn orchestrator(
        root: &Path,
        runner: Arc<TableRunner>,
        remote: Arc<MemoryRemoteStore>,
    ) -> DatabaseOrchestrator {
        let config = CacheConfig::default()
            .with_cache_root(root)
            .with_data_dir(root.join("data"));
        DatabaseOrchestrator::new(
            config,
            Arc::new(FsLocalStore::new(root)),
            remote,
            runner,
        )
    }

    #[tokio::test]
    async fn test_build_then_local_hit() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(TableRunner::new(&["climbs", "product_sizes_layouts_sets"]));
        let remote = Arc::new(MemoryRemoteStore::new());
        let orchestrator = orchestrator(dir.path(), runner.clone(), remote.clone());

        let first = orchestrator
            .ensure("Aurora", CapabilityTier::Catalog, &Credentials::anonymous())
            .await
            .unwrap();
        assert_eq!(first.source, DatabaseSource::Built);
        assert_eq!(first.path, dir.path().join("aurora.db"));
        assert!(!dir.path().join("aurora.db.partial").exists());
        assert!(remote.contains(&first.board));

        let second = orchestrator
            .ensure("aurora", CapabilityTier::Catalog, &Credentials::anonymous())
            .await
            .unwrap();
        assert_eq!(second.source, DatabaseSource::Local);
        assert_eq!(second.path, first.path);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_logbook_never_touches_remote() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(TableRunner::new(&["climbs", "ascents", "bids"]));
        let remote = Arc::new(MemoryRemoteStore::new());
        let orchestrator = orchestrator(dir.path(), runner, remote.clone());

        orchestrator
            .ensure(
                "kilter",
                CapabilityTier::Logbook,
                &Credentials::new("climber", "secret"),
            )
            .await
            .unwrap();

        assert_eq!(remote.get_count(), 0);
        assert_eq!(remote.put_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_board_rejected_before_any_work() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(TableRunner::new(&["climbs"]));
        let orchestrator = orchestrator(dir.path(), runner.clone(), Arc::new(MemoryRemoteStore::new()));

        let err = orchestrator
            .ensure("../aurora", CapabilityTier::Catalog, &Credentials::anonymous())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidBoard { .. }));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_status_reports_satisfied_tiers() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(TableRunner::new(&[
            "climbs",
            "holes",
            "placements",
            "product_sizes_layouts_sets",
        ]));
        let orchestrator = orchestrator(dir.path(), runner, Arc::new(MemoryRemoteStore::new()));

        let empty = orchestrator.status("decoy").unwrap();
        assert!(!empty.cached);
        assert!(empty.satisfied_tiers.is_empty());

        orchestrator
            .ensure("decoy", CapabilityTier::Geometry, &Credentials::anonymous())
            .await
            .unwrap();

        let status = orchestrator.status("decoy").unwrap();
        assert!(status.cached);
        assert!(status.readable);
        assert_eq!(
            status.satisfied_tiers,
            vec![CapabilityTier::Catalog, CapabilityTier::Geometry]
        );
        assert!(status.size_bytes.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_evict_and_clear() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(TableRunner::new(&["climbs", "product_sizes_layouts_sets"]));
        let orchestrator = orchestrator(dir.path(), runner.clone(), Arc::new(MemoryRemoteStore::new()));

        orchestrator
            .ensure("aurora", CapabilityTier::Catalog, &Credentials::anonymous())
            .await
            .unwrap();
        orchestrator.evict("aurora").await.unwrap();
        assert!(!orchestrator.status("aurora").unwrap().cached);

        // Write-back from the first build restores it without a rebuild
        let restored = orchestrator
            .ensure("aurora", CapabilityTier::Catalog, &Credentials::anonymous())
            .await
            .unwrap();
        assert_eq!(restored.source, DatabaseSource::Remote);
        assert_eq!(orchestrator.clear().unwrap(), 1);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ensure_images_fetches_then_reuses() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(TableRunner::new(&["layouts", "product_sizes_layouts_sets"]));
        let orchestrator = orchestrator(dir.path(), runner.clone(), Arc::new(MemoryRemoteStore::new()));
        let cancel = CancelToken::new();

        let first = orchestrator
            .ensure_images("Aurora", &Credentials::anonymous(), &cancel)
            .await
            .unwrap();
        assert_eq!(first.status, ImageCacheState::Fetched);
        assert_eq!(first.image_count, 1);
        assert_eq!(first.root, dir.path().join("data/boards/aurora/images"));
        assert_eq!(
            first.sample,
            vec![Path::new("product_sizes_layouts_sets")
                .join("original.png")
                .to_string_lossy()
                .into_owned()]
        );

        let second = orchestrator
            .ensure_images("aurora", &Credentials::anonymous(), &cancel)
            .await
            .unwrap();
        assert_eq!(second.status, ImageCacheState::Cached);
        assert_eq!(second.image_count, 1);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(runner.image_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ensure_images_needs_layouts_tier() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(TableRunner::new(&["climbs", "product_sizes_layouts_sets"]));
        let orchestrator = orchestrator(dir.path(), runner.clone(), Arc::new(MemoryRemoteStore::new()));

        let err = orchestrator
            .ensure_images("aurora", &Credentials::anonymous(), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::IncapableResult { tier: CapabilityTier::Layouts, .. }
        ));
        assert_eq!(runner.image_calls.load(Ordering::SeqCst), 0);
    }
}
