//! Data models for boardcache

pub mod board;

pub use board::{
    BoardDatabase, BoardImages, CacheKey, CacheStatus, Credentials, DatabaseSource, ImageCacheState,
};
