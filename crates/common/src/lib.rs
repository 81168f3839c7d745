//! Shared building blocks for the Hookline webhook delivery services.

pub mod config;
pub mod db;
pub mod error;
pub mod redis_pool;
pub mod sanitize;
pub mod types;
