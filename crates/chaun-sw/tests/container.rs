//! Registration, activation and client control through the container.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chaun_core::{AssetManifest, CacheConfig};
use chaun_net::{Fetcher, NetError, Request, Response};
use chaun_sw::{
    CacheBackend, CacheWorker, FetchOutcome, MemoryCacheStorage, RegistrationOptions,
    ServiceWorkerContainer, ServiceWorkerError, ServiceWorkerEvent, ServiceWorkerState,
};
use futures::future::BoxFuture;
use http::{HeaderMap, StatusCode};
use url::Url;

const SCRIPT: &str = "https://chaun.example.com/firebase-messaging-sw.js";
const SCOPE: &str = "https://chaun.example.com/";
const ASSET: &str = "https://c106-chaun.s3.ap-northeast-2.amazonaws.com/character_animation/B5entry.glb";

/// Answers every request with 200 and the request URL as body.
#[derive(Default)]
struct EchoNetwork {
    calls: AtomicUsize,
}

impl Fetcher for EchoNetwork {
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let body = Bytes::from(request.url.to_string());
            Ok(Response::new(request.id, request.url, StatusCode::OK, HeaderMap::new(), body))
        })
    }
}

struct Harness {
    caches: Arc<MemoryCacheStorage>,
    network: Arc<EchoNetwork>,
}

impl Harness {
    fn new() -> Self {
        Self {
            caches: Arc::new(MemoryCacheStorage::new()),
            network: Arc::new(EchoNetwork::default()),
        }
    }

    fn worker(&self, version: &str, skip_waiting: bool) -> Arc<CacheWorker> {
        let config = CacheConfig {
            version: version.to_string(),
            manifest: AssetManifest::parse([ASSET]).unwrap(),
            skip_waiting,
            ..CacheConfig::default()
        };
        Arc::new(CacheWorker::new(&config, self.caches.clone(), self.network.clone()))
    }
}

fn get(u: &str) -> Request {
    Request::get(Url::parse(u).unwrap())
}

#[tokio::test]
async fn first_registration_installs_activates_and_claims() {
    let harness = Harness::new();
    let (container, mut events) = ServiceWorkerContainer::new();

    // Opened before registration: uncontrolled until claimed.
    let client = container.open_client("https://chaun.example.com/home").await.unwrap();
    assert!(container.handle_fetch(&client, get(ASSET)).await.is_passthrough());
    assert_eq!(harness.network.calls.load(Ordering::SeqCst), 0);

    let registered = container
        .register(SCRIPT, RegistrationOptions::default(), harness.worker("v1", true))
        .await
        .unwrap();

    assert_eq!(registered.scope, SCOPE);
    assert!(registered.install.unwrap().is_complete());
    assert_eq!(registered.activate.unwrap().kept, "app-cache-v1");
    assert_eq!(container.active_state(SCOPE).await, Some(ServiceWorkerState::Activated));
    assert!(container.controller(&client).await.is_some());

    // Pre-cached during install: no further network traffic.
    let outcome = container.handle_fetch(&client, get(ASSET)).await;
    assert!(outcome.into_response().unwrap().from_cache);
    assert_eq!(harness.network.calls.load(Ordering::SeqCst), 1);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(ServiceWorkerEvent::UpdateFound { .. })));
    assert!(seen.iter().any(|e| matches!(e, ServiceWorkerEvent::ControllerChange { client_id, .. } if *client_id == client)));
    assert!(seen.iter().any(|e| matches!(
        e,
        ServiceWorkerEvent::StateChange { new_state: ServiceWorkerState::Activated, .. }
    )));
}

#[tokio::test]
async fn same_script_registers_once() {
    let harness = Harness::new();
    let (container, _events) = ServiceWorkerContainer::new();

    container
        .register(SCRIPT, RegistrationOptions::default(), harness.worker("v1", true))
        .await
        .unwrap();
    let again = container
        .register(SCRIPT, RegistrationOptions::default(), harness.worker("v1", true))
        .await
        .unwrap();

    assert!(again.install.is_none());
    assert!(again.activate.is_none());
    assert_eq!(harness.network.calls.load(Ordering::SeqCst), 1);
    assert_eq!(container.get_registrations().await, vec![SCOPE.to_string()]);
}

#[tokio::test]
async fn new_version_waits_without_skip_waiting() {
    let harness = Harness::new();
    let (container, _events) = ServiceWorkerContainer::new();

    container
        .register(SCRIPT, RegistrationOptions::default(), harness.worker("v1", true))
        .await
        .unwrap();
    let client = container.open_client("https://chaun.example.com/records").await.unwrap();
    let first = container.controller(&client).await.unwrap();

    let updated = container
        .register(
            "https://chaun.example.com/firebase-messaging-sw.js?v=2",
            RegistrationOptions::default(),
            harness.worker("v2", false),
        )
        .await
        .unwrap();
    assert!(updated.install.is_some());
    assert!(updated.activate.is_none());
    // Both stores coexist while the new worker waits.
    assert_eq!(harness.caches.keys().await.unwrap(), vec!["app-cache-v1", "app-cache-v2"]);
    assert_eq!(container.controller(&client).await, Some(first));

    let report = container.activate(SCOPE).await.unwrap();
    assert_eq!(report.deleted, vec!["app-cache-v1"]);
    assert_eq!(harness.caches.keys().await.unwrap(), vec!["app-cache-v2"]);

    let second = container.controller(&client).await.unwrap();
    assert_ne!(second, first);
}

#[tokio::test]
async fn activate_without_waiting_worker_is_state_error() {
    let harness = Harness::new();
    let (container, _events) = ServiceWorkerContainer::new();

    assert!(matches!(
        container.activate(SCOPE).await,
        Err(ServiceWorkerError::NotFound(_))
    ));

    container
        .register(SCRIPT, RegistrationOptions::default(), harness.worker("v1", true))
        .await
        .unwrap();
    assert!(matches!(
        container.activate(SCOPE).await,
        Err(ServiceWorkerError::StateError(_))
    ));
}

#[tokio::test]
async fn scope_outside_script_directory_is_rejected() {
    let harness = Harness::new();
    let (container, _events) = ServiceWorkerContainer::new();

    let result = container
        .register(
            "https://chaun.example.com/static/sw.js",
            RegistrationOptions {
                scope: Some("/".to_string()),
            },
            harness.worker("v1", true),
        )
        .await;

    assert!(matches!(result, Err(ServiceWorkerError::SecurityError(_))));
    assert!(container.get_registrations().await.is_empty());
}

#[tokio::test]
async fn clients_outside_scope_stay_uncontrolled() {
    let harness = Harness::new();
    let (container, _events) = ServiceWorkerContainer::new();

    container
        .register(
            "https://chaun.example.com/app/sw.js",
            RegistrationOptions::default(),
            harness.worker("v1", true),
        )
        .await
        .unwrap();

    let inside = container.open_client("https://chaun.example.com/app/quest").await.unwrap();
    let outside = container.open_client("https://chaun.example.com/login").await.unwrap();

    assert!(container.controller(&inside).await.is_some());
    assert!(container.controller(&outside).await.is_none());
    assert_eq!(
        container.get_registration("https://chaun.example.com/app/quest").await,
        Some("https://chaun.example.com/app/".to_string())
    );
    assert!(container.get_registration("https://chaun.example.com/login").await.is_none());
}

#[tokio::test]
async fn unregister_releases_clients() {
    let harness = Harness::new();
    let (container, _events) = ServiceWorkerContainer::new();

    container
        .register(SCRIPT, RegistrationOptions::default(), harness.worker("v1", true))
        .await
        .unwrap();
    let client = container.open_client("https://chaun.example.com/").await.unwrap();
    assert!(container.controller(&client).await.is_some());

    assert!(container.unregister(SCOPE).await.unwrap());
    assert!(!container.unregister(SCOPE).await.unwrap());
    assert!(container.controller(&client).await.is_none());
    assert!(matches!(
        container.handle_fetch(&client, get(ASSET)).await,
        FetchOutcome::Passthrough
    ));
}
