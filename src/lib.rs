// shardstore - distributed, sharded, replicated key-value store

// Core cluster subsystems: ring, shards, store, consensus, replication, auth
pub mod cluster;

// Process configuration
pub mod config;

// Service container wiring the cluster components for the RPC layer
pub mod app_state;

// Common utilities
pub mod error;

// Re-exports for convenience
pub use error::{AppError, AppResult};
