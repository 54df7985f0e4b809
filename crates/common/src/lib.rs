//! Shared building blocks for the Courier notification pipeline.

pub mod cipher;
pub mod config;
pub mod db;
pub mod error;
pub mod redis_pool;
pub mod types;
