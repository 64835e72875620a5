//! Chaun Core Library
//!
//! This crate provides shared types, errors, and configuration for the Chaun
//! offline cache worker.

pub mod config;
pub mod error;
pub mod types;

pub use config::{AppConfig, CacheConfig, FirebaseConfig, PageConfig, PushConfig};
pub use error::{CoreError, CoreResult};
pub use types::{AssetManifest, InstallPolicy};
