//! `Keyward` Core Library
//!
//! Shared functionality for `Keyward` components:
//! - Configuration resolution and hierarchy
//! - `SQLite` pool helpers and the `define_database!` macro
//! - Millisecond clock helpers
//! - Tracing initialisation

pub mod config;
pub mod db;
pub mod error;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
