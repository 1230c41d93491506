//! # trade-foundation
//!
//! Foundation layer for the trade task manager:
//! - Error: shared error type and `Result` alias
//! - Config: `TaskConfig` (file + environment)
//! - Storage: `JsonStore` for config files and task snapshots

pub mod config;
pub mod error;
pub mod storage;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// Config
// ============================================================================
pub use config::{TaskConfig, TASK_CONFIG_FILE};

// ============================================================================
// Storage
// ============================================================================
pub use storage::JsonStore;
