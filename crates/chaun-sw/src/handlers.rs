//! Lifecycle handlers: install, activate, fetch.
//!
//! Each handler takes its collaborators and configuration explicitly, so
//! it can be driven without a registration or a browser.

use std::collections::HashSet;

use chaun_core::{AssetManifest, InstallPolicy};
use chaun_net::{Fetcher, Request, Response};
use futures::future::join_all;
use http::Method;
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::cache::{CacheBackend, CacheEntry, RequestKey};
use crate::{ServiceWorkerError, SwResult};

// ==================== Fetch Filter ====================

/// Decides which intercepted requests may touch the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchFilter {
    excluded_schemes: Vec<String>,
}

impl FetchFilter {
    pub fn new<S: Into<String>>(excluded_schemes: impl IntoIterator<Item = S>) -> Self {
        Self {
            excluded_schemes: excluded_schemes
                .into_iter()
                .map(|s| s.into().trim_end_matches(':').to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn is_excluded_scheme(&self, url: &Url) -> bool {
        self.excluded_schemes.iter().any(|s| s == url.scheme())
    }

    /// GET on a non-excluded scheme.
    pub fn is_cacheable(&self, request: &Request) -> bool {
        !self.is_excluded_scheme(&request.url) && request.method == Method::GET
    }
}

impl Default for FetchFilter {
    fn default() -> Self {
        Self::new(["chrome-extension"])
    }
}

// ==================== Reports ====================

/// What the fetch handler decided for one request.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Not intercepted; the default network path applies.
    Passthrough,
    /// Answered by the worker, from cache or network.
    Respond(Response),
    /// Match-or-fetch failed; the page sees a network error.
    NetworkError(String),
}

impl FetchOutcome {
    pub fn is_passthrough(&self) -> bool {
        matches!(self, FetchOutcome::Passthrough)
    }

    pub fn into_response(self) -> Option<Response> {
        match self {
            FetchOutcome::Respond(response) => Some(response),
            _ => None,
        }
    }
}

/// A manifest entry that could not be pre-cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedAsset {
    pub url: String,
    pub reason: String,
}

/// Result of an install pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    pub store: String,
    pub cached: Vec<String>,
    pub failed: Vec<FailedAsset>,
}

impl InstallReport {
    /// Every manifest entry made it into the store.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    fn fail(&mut self, url: &Url, reason: impl Into<String>) {
        self.failed.push(FailedAsset {
            url: url.to_string(),
            reason: reason.into(),
        });
    }
}

/// Result of an activation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActivateReport {
    pub kept: String,
    pub deleted: Vec<String>,
}

// ==================== Install ====================

/// Pre-cache every manifest URL into `store_name`.
///
/// Never fails: open, fetch and write errors are logged and reported.
pub async fn on_install(
    caches: &dyn CacheBackend,
    fetcher: &dyn Fetcher,
    manifest: &AssetManifest,
    store_name: &str,
    policy: InstallPolicy,
) -> InstallReport {
    let mut report = InstallReport {
        store: store_name.to_string(),
        ..Default::default()
    };

    let mut seen = HashSet::new();
    let urls: Vec<&Url> = manifest.iter().filter(|u| seen.insert(u.as_str())).collect();

    if let Err(e) = caches.open(store_name).await {
        error!(store = store_name, error = %e, "Failed to cache during install");
        for url in urls {
            report.fail(url, e.to_string());
        }
        return report;
    }
    info!(store = store_name, assets = urls.len(), "Opened cache and caching files");

    let fetched = join_all(urls.iter().map(|url| fetch_asset(fetcher, url))).await;

    let mut staged = Vec::with_capacity(urls.len());
    for (url, result) in urls.iter().zip(fetched) {
        let key = RequestKey::get(url);
        let entry = result.and_then(|response| {
            CacheEntry::from_response(&key, response).map_err(|e| e.to_string())
        });
        match entry {
            Ok(entry) => staged.push((*url, key, entry)),
            Err(reason) => {
                error!(store = store_name, url = %url, %reason, "Failed to cache during install");
                report.fail(url, reason);
            }
        }
    }

    if policy == InstallPolicy::Atomic && !report.failed.is_empty() {
        for (url, _, _) in &staged {
            report.fail(url, "install aborted: another manifest entry failed");
        }
        return report;
    }

    let (urls, batch): (Vec<&Url>, Vec<(RequestKey, CacheEntry)>) = staged
        .into_iter()
        .map(|(url, key, entry)| (url, (key, entry)))
        .unzip();
    // Best effort may still keep some assets if the batch is refused.
    let fallback = (policy == InstallPolicy::BestEffort).then(|| batch.clone());

    match caches.put_all(store_name, batch).await {
        Ok(()) => {
            debug!(store = store_name, assets = urls.len(), "Assets pre-cached");
            report.cached.extend(urls.iter().map(|url| url.to_string()));
        }
        Err(e) => match fallback {
            None => {
                error!(store = store_name, error = %e, "Failed to cache during install");
                for url in urls {
                    report.fail(url, e.to_string());
                }
            }
            Some(entries) => {
                warn!(store = store_name, error = %e, "Batch write refused, storing assets one by one");
                for (url, (key, entry)) in urls.into_iter().zip(entries) {
                    match caches.put(store_name, key, entry).await {
                        Ok(()) => report.cached.push(url.to_string()),
                        Err(e) => {
                            error!(store = store_name, url = %url, error = %e, "Failed to cache during install");
                            report.fail(url, e.to_string());
                        }
                    }
                }
            }
        },
    }

    info!(
        store = store_name,
        cached = report.cached.len(),
        failed = report.failed.len(),
        "Install finished"
    );
    report
}

async fn fetch_asset(fetcher: &dyn Fetcher, url: &Url) -> Result<Response, String> {
    let response = fetcher
        .fetch(Request::get(url.clone()))
        .await
        .map_err(|e| e.to_string())?;
    if !response.ok() {
        return Err(format!("unexpected status {}", response.status));
    }
    Ok(response)
}

async fn store_response(
    caches: &dyn CacheBackend,
    store_name: &str,
    key: RequestKey,
    response: Response,
) -> SwResult<()> {
    let entry = CacheEntry::from_response(&key, response)?;
    caches.put(store_name, key, entry).await
}

// ==================== Activate ====================

/// Delete every cache store except `current_store`.
pub async fn on_activate(caches: &dyn CacheBackend, current_store: &str) -> ActivateReport {
    let mut report = ActivateReport {
        kept: current_store.to_string(),
        deleted: Vec::new(),
    };

    let names = match caches.keys().await {
        Ok(names) => names,
        Err(e) => {
            error!(error = %e, "Failed to list caches during activate");
            return report;
        }
    };

    for name in names.into_iter().filter(|n| n != current_store) {
        match caches.delete(&name).await {
            Ok(true) => {
                info!(cache = %name, "Old cache deleted");
                report.deleted.push(name);
            }
            Ok(false) => {}
            Err(e) => error!(cache = %name, error = %e, "Failed to delete old cache"),
        }
    }

    report
}

// ==================== Fetch ====================

/// Cache-first handling of one intercepted request.
pub async fn on_fetch(
    caches: &dyn CacheBackend,
    fetcher: &dyn Fetcher,
    filter: &FetchFilter,
    store_name: &str,
    request: Request,
) -> FetchOutcome {
    if !filter.is_cacheable(&request) {
        trace!(url = %request.url, method = %request.method, "Request not intercepted");
        return FetchOutcome::Passthrough;
    }

    let url = request.url.clone();
    match match_or_fetch(caches, fetcher, store_name, request).await {
        Ok(response) => FetchOutcome::Respond(response),
        Err(e) => {
            error!(url = %url, error = %e, "Error during cache match or fetch");
            FetchOutcome::NetworkError(e.to_string())
        }
    }
}

async fn match_or_fetch(
    caches: &dyn CacheBackend,
    fetcher: &dyn Fetcher,
    store_name: &str,
    request: Request,
) -> Result<Response, ServiceWorkerError> {
    let key = RequestKey::from_request(&request);

    if let Some(entry) = caches.match_request(store_name, &key).await? {
        debug!(url = %key.url, "Serving cached file");
        return entry.to_response();
    }

    let response = fetcher.fetch(request).await?;

    // The caller keeps the original; the store consumes the copy.
    let copy = response.duplicate();
    if let Err(e) = store_response(caches, store_name, key.clone(), copy).await {
        warn!(url = %key.url, error = %e, "Failed to cache the network response");
    }

    Ok(response)
}
