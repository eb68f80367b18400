//! boardcache-core - Core library for boardcache
//!
//! Capability-validated board database cache: tier rules, schema inspection,
//! local and remote stores, the acquisition runner, and the orchestrator that
//! decides between them.

pub mod acquisition;
pub mod cancel;
pub mod capability;
pub mod catalog;
pub mod config;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod schema;
pub mod store;

pub use acquisition::{
    BoardlibRunner, BuildOutcome, BuildRequest, Diagnostic, ImagesRequest, Runner,
};
pub use cancel::CancelToken;
pub use capability::CapabilityTier;
pub use config::{CacheConfig, Environment, RemoteConfig, RunnerConfig};
pub use error::CoreError;
pub use models::{
    BoardDatabase, BoardImages, CacheKey, CacheStatus, Credentials, DatabaseSource, ImageCacheState,
};
pub use orchestrator::DatabaseOrchestrator;
pub use store::{DisabledRemoteStore, FsLocalStore, LocalStore, MemoryRemoteStore, RemoteStore, SupabaseStore};
