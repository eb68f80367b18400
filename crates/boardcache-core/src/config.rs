//! Cache configuration
//!
//! Everything the orchestrator and its backends need is held here and injected
//! at construction; nothing is read from globals after startup.

use crate::error::CoreError;
use crate::models::CacheKey;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Boards whose origin refuses database downloads without a login
pub const DEFAULT_AUTH_REQUIRED_BOARDS: &[&str] = &["kilter", "tension"];

/// Default local cache root
pub const DEFAULT_CACHE_DIR: &str = "server/board_dbs";

/// Default root for non-database board assets
pub const DEFAULT_DATA_DIR: &str = "data";

/// Default remote bucket for database blobs
pub const DEFAULT_BUCKET: &str = "board-dbs";

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Dev,
    Prod,
}

impl FromStr for Environment {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "dev" | "development" | "test" => Ok(Environment::Dev),
            "prod" | "production" => Ok(Environment::Prod),
            other => Err(CoreError::InvalidConfig {
                message: format!("unknown ENV value: {other}"),
            }),
        }
    }
}

/// Supabase Storage settings for the remote cache
#[derive(Clone)]
pub struct RemoteConfig {
    /// Project URL, e.g. `https://xyz.supabase.co`
    pub url: String,
    /// Service-role key (sent as bearer token and `apikey`)
    pub service_key: String,
    pub bucket: String,
    pub timeout: Duration,
}

impl RemoteConfig {
    pub fn new(url: impl Into<String>, service_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            service_key: service_key.into(),
            bucket: DEFAULT_BUCKET.to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("url", &self.url)
            .field("service_key", &"<redacted>")
            .field("bucket", &self.bucket)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// How the acquisition tool is launched
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Interpreter or executable to spawn
    pub program: PathBuf,
    /// Arguments placed before `database <board> <output>`
    pub leading_args: Vec<String>,
    /// Upper bound on one build
    pub timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("python3"),
            leading_args: vec!["-m".to_string(), "boardlib".to_string()],
            timeout: Duration::from_secs(60),
        }
    }
}

/// Configuration for the database orchestrator
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub environment: Environment,

    /// Directory holding one `<board>.db` per board
    pub cache_root: PathBuf,

    /// Root for downloaded board images (`<data_dir>/boards/<board>/images`)
    pub data_dir: PathBuf,

    /// Boards that must never be built without full credentials
    pub auth_required_boards: BTreeSet<String>,

    /// Remote cache; `None` disables it
    pub remote: Option<RemoteConfig>,

    pub runner: RunnerConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Dev,
            cache_root: PathBuf::from(DEFAULT_CACHE_DIR),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            auth_required_boards: DEFAULT_AUTH_REQUIRED_BOARDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            remote: None,
            runner: RunnerConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Build from process environment variables
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source
    ///
    /// Fails fast in `prod` when the remote cache credentials are missing.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(env) = get("ENV") {
            config.environment = env.parse()?;
        }

        if let Some(data_dir) = get("DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
            config.cache_root = config.data_dir.join("board_dbs");
        }
        if let Some(dir) = get("BOARDCACHE_CACHE_DIR") {
            config.cache_root = PathBuf::from(dir);
        }

        if let Some(boards) = get("BOARDCACHE_AUTH_BOARDS") {
            config.auth_required_boards = boards
                .split(',')
                .map(|b| b.trim().to_ascii_lowercase())
                .filter(|b| !b.is_empty())
                .collect();
        }

        if let Some(program) = get("BOARDCACHE_PYTHON") {
            config.runner.program = PathBuf::from(program);
        }

        if let Some(secs) = get("BOARDCACHE_BUILD_TIMEOUT_SECS") {
            let secs: u64 = secs.trim().parse().map_err(|_| CoreError::InvalidConfig {
                message: format!("BOARDCACHE_BUILD_TIMEOUT_SECS is not a number: {secs}"),
            })?;
            config.runner.timeout = Duration::from_secs(secs);
        }

        let url = get("PUBLIC_SUPABASE_URL");
        let key = get("SUPABASE_SERVICE_ROLE_KEY");

        if config.environment == Environment::Prod {
            let mut missing = Vec::new();
            if url.is_none() {
                missing.push("PUBLIC_SUPABASE_URL");
            }
            if key.is_none() {
                missing.push("SUPABASE_SERVICE_ROLE_KEY");
            }
            if !missing.is_empty() {
                return Err(CoreError::InvalidConfig {
                    message: format!("Missing required env vars: {}", missing.join(", ")),
                });
            }
        }

        if let (Some(url), Some(key)) = (url, key) {
            let mut remote = RemoteConfig::new(url, key);
            if let Some(bucket) = get("BOARDCACHE_BUCKET") {
                remote = remote.with_bucket(bucket);
            }
            config.remote = Some(remote);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_cache_root(mut self, cache_root: impl Into<PathBuf>) -> Self {
        self.cache_root = cache_root.into();
        self
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn with_auth_required_boards<I, S>(mut self, boards: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.auth_required_boards = boards
            .into_iter()
            .map(|b| b.as_ref().trim().to_ascii_lowercase())
            .collect();
        self
    }

    pub fn with_remote(mut self, remote: Option<RemoteConfig>) -> Self {
        self.remote = remote;
        self
    }

    pub fn with_runner(mut self, runner: RunnerConfig) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    pub fn requires_auth(&self, key: &CacheKey) -> bool {
        self.auth_required_boards.contains(key.as_str())
    }

    /// Directory the image download for `key` writes into
    pub fn images_root(&self, key: &CacheKey) -> PathBuf {
        self.data_dir.join("boards").join(key.as_str()).join("images")
    }

    /// Check invariants that hold regardless of where the values came from
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.cache_root.as_os_str().is_empty() {
            return Err(CoreError::InvalidConfig {
                message: "cache root is empty".to_string(),
            });
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(CoreError::InvalidConfig {
                message: "data directory is empty".to_string(),
            });
        }
        if self.runner.timeout.is_zero() {
            return Err(CoreError::InvalidConfig {
                message: "build timeout must be greater than zero".to_string(),
            });
        }
        if let Some(remote) = &self.remote {
            if !remote.url.starts_with("http://") && !remote.url.starts_with("https://") {
                return Err(CoreError::InvalidConfig {
                    message: format!("remote URL must be http(s): {}", remote.url),
                });
            }
            if remote.bucket.trim().is_empty() {
                return Err(CoreError::InvalidConfig {
                    message: "remote bucket is empty".to_string(),
                });
            }
        }
        if self.environment == Environment::Prod && self.remote.is_none() {
            return Err(CoreError::InvalidConfig {
                message: "remote cache is required in prod".to_string(),
            });
        }
        Ok(())
    }
}
