//! Cache stores addressed by board key
//!
//! The local store is authoritative and its failures are fatal. The remote
//! store is an optimization: it reports misses, never errors.

pub mod local;
pub mod remote;

pub use local::{FsLocalStore, LocalStore};
pub use remote::{DisabledRemoteStore, MemoryRemoteStore, RemoteStore, SupabaseStore};
