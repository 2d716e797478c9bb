//! Persistence adapter for foresight
//!
//! This module provides the storage layer using SQLite with:
//! - Schema migrations
//! - Retry with exponential backoff for durable writes
//! - Repository pattern for queries

pub mod repo;
pub mod retry;
pub mod schema;

pub use repo::{Database, StoredModel, TableCounts, TrimResult};
pub use retry::RetryPolicy;
