//! The cache worker: lifecycle handlers bound to one configuration.

use std::fmt;
use std::sync::Arc;

use chaun_core::{AssetManifest, CacheConfig, InstallPolicy};
use chaun_net::{Fetcher, Request};

use crate::cache::CacheBackend;
use crate::handlers::{
    on_activate, on_fetch, on_install, ActivateReport, FetchFilter, FetchOutcome, InstallReport,
};

/// Lifecycle handlers plus the store, manifest and backends they act on.
pub struct CacheWorker {
    store_name: String,
    manifest: AssetManifest,
    install_policy: InstallPolicy,
    filter: FetchFilter,
    skip_waiting: bool,
    claim_clients: bool,
    caches: Arc<dyn CacheBackend>,
    fetcher: Arc<dyn Fetcher>,
}

impl CacheWorker {
    pub fn new(config: &CacheConfig, caches: Arc<dyn CacheBackend>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            store_name: config.store_name(),
            manifest: config.manifest.clone(),
            install_policy: config.install_policy,
            filter: FetchFilter::new(config.excluded_schemes.iter().cloned()),
            skip_waiting: config.skip_waiting,
            claim_clients: config.claim_clients,
            caches,
            fetcher,
        }
    }

    /// Current version-qualified store name.
    pub fn store_name(&self) -> &str {
        &self.store_name
    }

    pub fn manifest(&self) -> &AssetManifest {
        &self.manifest
    }

    pub fn skip_waiting(&self) -> bool {
        self.skip_waiting
    }

    pub fn claim_clients(&self) -> bool {
        self.claim_clients
    }

    pub fn caches(&self) -> &Arc<dyn CacheBackend> {
        &self.caches
    }

    /// Install event.
    pub async fn install(&self) -> InstallReport {
        on_install(
            self.caches.as_ref(),
            self.fetcher.as_ref(),
            &self.manifest,
            &self.store_name,
            self.install_policy,
        )
        .await
    }

    /// Activate event.
    pub async fn activate(&self) -> ActivateReport {
        on_activate(self.caches.as_ref(), &self.store_name).await
    }

    /// Fetch event.
    pub async fn fetch(&self, request: Request) -> FetchOutcome {
        on_fetch(
            self.caches.as_ref(),
            self.fetcher.as_ref(),
            &self.filter,
            &self.store_name,
            request,
        )
        .await
    }
}

impl fmt::Debug for CacheWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheWorker")
            .field("store_name", &self.store_name)
            .field("manifest", &self.manifest.len())
            .field("install_policy", &self.install_policy)
            .field("skip_waiting", &self.skip_waiting)
            .field("claim_clients", &self.claim_clients)
            .finish_non_exhaustive()
    }
}
