//! Board identity, credentials, and validated database handles

use crate::capability::{self, CapabilityTier};
use crate::error::CoreError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

/// Normalized board identifier addressing both the local and remote stores
///
/// There is no per-tier key: one file per board, whatever tier built it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Trim and lower-case a board id, rejecting anything unsafe as a file name
    pub fn parse(board: &str) -> Result<Self, CoreError> {
        let key = board.trim().to_ascii_lowercase();

        if key.is_empty() {
            return Err(CoreError::InvalidBoard {
                board: board.to_string(),
                reason: "board identifier is empty".to_string(),
            });
        }

        if key.contains("..")
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(CoreError::InvalidBoard {
                board: board.to_string(),
                reason: "only letters, digits, '-', '_' and '.' are allowed".to_string(),
            });
        }

        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name used in both stores (`<key>.db`)
    pub fn file_name(&self) -> String {
        format!("{}.db", self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Optional origin credentials
///
/// Empty strings are treated as absent. The password never appears in `Debug`.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    username: Option<String>,
    password: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::from_parts(Some(username.into()), Some(password.into()))
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn from_parts(username: Option<String>, password: Option<String>) -> Self {
        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        Self {
            username: non_empty(username),
            password: non_empty(password),
        }
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn is_complete(&self) -> bool {
        self.missing_field().is_none()
    }

    /// First missing field, for precondition errors
    pub fn missing_field(&self) -> Option<&'static str> {
        match (&self.username, &self.password) {
            (None, None) => Some("username and password"),
            (None, Some(_)) => Some("username"),
            (Some(_), None) => Some("password"),
            (Some(_), Some(_)) => None,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Where a returned database came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseSource {
    Local,
    Remote,
    Built,
}

/// A database file validated for a tier
#[derive(Debug, Clone, Serialize)]
pub struct BoardDatabase {
    pub board: CacheKey,
    pub path: PathBuf,
    pub tier: CapabilityTier,
    pub relations: BTreeSet<String>,
    pub source: DatabaseSource,
}

impl BoardDatabase {
    pub fn satisfied_tiers(&self) -> Vec<CapabilityTier> {
        capability::satisfied_tiers(&self.relations)
    }
}

/// Snapshot of the local slot for a board, without building anything
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub board: CacheKey,
    pub path: PathBuf,
    pub cached: bool,
    pub readable: bool,
    pub relations: BTreeSet<String>,
    pub satisfied_tiers: Vec<CapabilityTier>,
    pub size_bytes: Option<u64>,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Whether board images were already on disk or just downloaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageCacheState {
    Cached,
    Fetched,
}

/// Image files cached for a board
#[derive(Debug, Clone, Serialize)]
pub struct BoardImages {
    pub board: CacheKey,
    pub root: PathBuf,
    pub status: ImageCacheState,
    pub image_count: usize,
    /// Paths relative to `root`, at most one
    pub sample: Vec<String>,
}
