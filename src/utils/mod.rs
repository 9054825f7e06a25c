// src/utils/mod.rs
//! Configuration and error types shared by every component

pub mod config;
pub mod errors;

pub use config::ToolkitConfig;
pub use errors::{Result, ToolkitError};
