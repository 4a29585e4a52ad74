// Storage engine layout, bottom up:
// 1. BlockStorage splits a stream into fixed-size blocks
// 2. RecordStorage chains blocks into variable-length records and keeps
//    reclaimed blocks in a free list (record 0)
// 3. Tree is an ordered index whose nodes are held by a NodeManager,
//    either in memory or serialized into records
//
// Everything is single-writer. Nothing is durable until
// `NodeManager::save_changes` (or `BlockStorage::flush`) returns.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod storage;

#[cfg(test)]
mod simulation;

pub use config::{ConfigError, EngineConfig};
