//! # Chaun Net
//!
//! Network access for the Chaun offline cache worker.
//!
//! ## Design Goals
//!
//! 1. **Async HTTP**: Non-blocking requests through `reqwest`
//! 2. **Pluggable fetch**: Handlers depend on the [`Fetcher`] trait, not on a client
//! 3. **Single-read bodies**: A [`Response`] body is consumed once; copies are explicit

use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;

mod loader;
mod request;
mod response;

pub use loader::{LoaderConfig, ResourceLoader};
pub use request::{Request, RequestId};
pub use response::Response;

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Body of {url} exceeds {limit} bytes")]
    BodyTooLarge { url: String, limit: usize },

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Anything that can turn a [`Request`] into a [`Response`].
///
/// Non-2xx statuses are responses, not errors.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>>;
}
