//! Storage
//!
//! - `json`: pretty-printed JSON documents in a flat directory

mod json;

pub use json::JsonStore;
