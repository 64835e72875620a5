//! # Chaun Service Worker
//!
//! Offline asset cache for the Chaun fitness client.
//!
//! ## Features
//!
//! - **Install**: pre-cache the character asset manifest
//! - **Activate**: drop every cache store but the current version
//! - **Fetch**: cache-first GET with network fallback and write-back
//! - **Registration**: installing / waiting / active workers per scope
//! - **Clients**: page sessions claimed by the active worker
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer
//!     │
//!     ├── ServiceWorkerRegistration (per scope)
//!     │       ├── installing ─┐
//!     │       ├── waiting     ├── ServiceWorker ── CacheWorker
//!     │       └── active ─────┘                      │
//!     └── Clients                                    ├── on_install
//!                                                    ├── on_activate
//! CacheBackend (memory / disk)                       └── on_fetch
//!     └── Cache "app-cache-<version>"
//!             └── (method, url) → CacheEntry
//! ```

use thiserror::Error;

pub mod cache;
pub mod container;
pub mod disk;
pub mod handlers;
pub mod registration;
pub mod worker;

pub use cache::{Cache, CacheBackend, CacheEntry, MemoryCacheStorage, RequestKey};
pub use container::{RegistrationOptions, Registered, ServiceWorkerContainer, ServiceWorkerEvent};
pub use disk::DiskCacheStorage;
pub use handlers::{
    on_activate, on_fetch, on_install, ActivateReport, FailedAsset, FetchFilter, FetchOutcome,
    InstallReport,
};
pub use registration::{
    Client, Clients, ServiceWorker, ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState,
};
pub use worker::CacheWorker;

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Security error: {0}")]
    SecurityError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Quota exceeded: {needed} bytes needed, {quota} allowed")]
    QuotaExceeded { needed: usize, quota: usize },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<std::io::Error> for ServiceWorkerError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<chaun_net::NetError> for ServiceWorkerError {
    fn from(e: chaun_net::NetError) -> Self {
        Self::NetworkError(e.to_string())
    }
}

/// Result type alias for service worker operations.
pub type SwResult<T> = Result<T, ServiceWorkerError>;
