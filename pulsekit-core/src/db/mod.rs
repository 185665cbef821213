//! Database layer for pulsekit
//!
//! This module provides the storage layer using SQLite with:
//! - Schema migrations for the page store and the worker store
//! - A key-value repository backing the namespaced local store

pub mod repo;
pub mod schema;

pub use repo::Database;
