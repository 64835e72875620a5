//! Subcommand implementations.

use std::error::Error;
use std::path::Path;
use std::sync::Arc;

use chaun_core::AppConfig;
use chaun_net::{LoaderConfig, Request, ResourceLoader};
use chaun_page::{bootstrap, HeadlessPush, MemorySessionStore, RegistrationOutcome};
use chaun_sw::{
    ActivateReport, CacheBackend, CacheWorker, DiskCacheStorage, FetchOutcome, InstallReport,
    ServiceWorkerContainer,
};
use http::Method;
use serde::Serialize;
use tracing::debug;

type CmdResult<T> = Result<T, Box<dyn Error>>;

/// Shared state for one CLI invocation.
pub struct Context {
    config: AppConfig,
    storage: Arc<DiskCacheStorage>,
    loader: Arc<ResourceLoader>,
    worker: Arc<CacheWorker>,
}

#[derive(Debug, Serialize)]
pub struct FetchSummary {
    pub url: String,
    pub method: String,
    /// cache, network or passthrough
    pub source: &'static str,
    pub status: u16,
    pub content_type: Option<String>,
    pub bytes: usize,
}

#[derive(Debug, Serialize)]
pub struct StoreSummary {
    pub name: String,
    pub entries: usize,
    pub current: bool,
}

#[derive(Debug, Serialize)]
pub struct ClientSummary {
    pub id: String,
    pub url: String,
    pub controlled: bool,
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub registered: bool,
    pub scope: Option<String>,
    pub error: Option<String>,
    pub install: Option<InstallReport>,
    pub activate: Option<ActivateReport>,
    pub push: String,
    pub clients: Vec<ClientSummary>,
}

impl Context {
    pub async fn new(config: AppConfig) -> CmdResult<Self> {
        let storage = Arc::new(DiskCacheStorage::open(&config.cache.cache_dir).await?);
        let loader = Arc::new(ResourceLoader::new(LoaderConfig {
            default_timeout: config.cache.request_timeout(),
            max_body_bytes: config.cache.max_entry_bytes,
            ..LoaderConfig::default()
        })?);
        let worker = Arc::new(CacheWorker::new(
            &config.cache,
            storage.clone(),
            loader.clone(),
        ));

        Ok(Self {
            config,
            storage,
            loader,
            worker,
        })
    }

    pub async fn install(&self) -> InstallReport {
        self.worker.install().await
    }

    pub async fn activate(&self) -> ActivateReport {
        self.worker.activate().await
    }

    pub async fn fetch(&self, method: &str, url: &str, output: Option<&Path>) -> CmdResult<FetchSummary> {
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())?;
        let request = Request::parse(method.clone(), url)?;

        let (source, response) = match self.worker.fetch(request.clone()).await {
            FetchOutcome::Respond(response) if response.from_cache => ("cache", response),
            FetchOutcome::Respond(response) => ("network", response),
            // Not intercepted: the request goes straight to the network.
            FetchOutcome::Passthrough => ("passthrough", self.loader.load(request).await?),
            FetchOutcome::NetworkError(message) => return Err(message.into()),
        };

        let status = response.status.as_u16();
        let content_type = response.content_type().map(|m| m.to_string());
        let url = response.url.to_string();
        let body = response.into_bytes();

        if let Some(path) = output {
            tokio::fs::write(path, &body).await?;
            debug!(path = %path.display(), bytes = body.len(), "Response body written");
        }

        Ok(FetchSummary {
            url,
            method: method.to_string(),
            source,
            status,
            content_type,
            bytes: body.len(),
        })
    }

    pub async fn caches(&self) -> CmdResult<Vec<StoreSummary>> {
        let current = self.worker.store_name();
        let mut stores = Vec::new();
        for name in self.storage.keys().await? {
            let entries = self.storage.entry_count(&name).await?;
            stores.push(StoreSummary {
                current: name == current,
                name,
                entries,
            });
        }
        Ok(stores)
    }

    /// Page-load sequence against a fresh container.
    pub async fn run(&self, clients: &[String]) -> CmdResult<RunSummary> {
        let (container, mut events) = ServiceWorkerContainer::new();
        let session = MemorySessionStore::new();

        let report = bootstrap(
            Some(&container),
            &self.config,
            Arc::clone(&self.worker),
            &HeadlessPush,
            &session,
        )
        .await;

        let mut summary = RunSummary {
            registered: report.registration.is_registered(),
            scope: None,
            error: None,
            install: None,
            activate: None,
            push: format!("{:?}", report.push),
            clients: Vec::new(),
        };
        match report.registration {
            RegistrationOutcome::Registered(registered) => {
                summary.scope = Some(registered.scope);
                summary.install = registered.install;
                summary.activate = registered.activate;
            }
            RegistrationOutcome::Failed(e) => summary.error = Some(e),
            RegistrationOutcome::Unsupported => {}
        }

        for url in clients {
            let id = container.open_client(url).await?;
            let controlled = container.controller(&id).await.is_some();
            summary.clients.push(ClientSummary {
                id,
                url: url.clone(),
                controlled,
            });
        }

        while let Ok(event) = events.try_recv() {
            debug!(?event, "Lifecycle event");
        }

        Ok(summary)
    }
}
