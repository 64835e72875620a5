//! Per-origin registry of worker registrations and the pages they control.

use std::sync::Arc;

use chaun_net::Request;
use hashbrown::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::handlers::{ActivateReport, FetchOutcome, InstallReport};
use crate::registration::{
    Clients, ServiceWorker, ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState,
};
use crate::worker::CacheWorker;
use crate::{ServiceWorkerError, SwResult};

/// Extra inputs to [`ServiceWorkerContainer::register`].
#[derive(Debug, Clone, Default)]
pub struct RegistrationOptions {
    /// Scope, absolute or relative to the script URL.
    pub scope: Option<String>,
}

/// Lifecycle notifications, delivered in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    StateChange {
        registration_scope: String,
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// A new worker started installing.
    UpdateFound { registration_scope: String },
    /// A page got a new controller.
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
}

/// Outcome of [`ServiceWorkerContainer::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registered {
    pub scope: String,
    /// Install report, `None` when the script was already registered.
    pub install: Option<InstallReport>,
    /// Activation report, `None` while the worker is still waiting.
    pub activate: Option<ActivateReport>,
}

/// Registrations keyed by scope string, plus every open page.
pub struct ServiceWorkerContainer {
    registrations: Arc<RwLock<HashMap<String, ServiceWorkerRegistration>>>,
    clients: Arc<RwLock<Clients>>,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerContainer {
    /// The receiver yields every [`ServiceWorkerEvent`] this container emits.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                registrations: Arc::new(RwLock::new(HashMap::new())),
                clients: Arc::new(RwLock::new(Clients::new())),
                event_tx,
            },
            event_rx,
        )
    }

    /// Register `handler` under `script_url`, then install and (maybe) activate it.
    ///
    /// Registering the same script URL again is a no-op.
    pub async fn register(
        &self,
        script_url: &str,
        options: RegistrationOptions,
        handler: Arc<CacheWorker>,
    ) -> SwResult<Registered> {
        let script_url = Url::parse(script_url)
            .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?;
        let scope = resolve_scope(&script_url, options.scope.as_deref())?;
        let scope_str = scope.to_string();

        let worker = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .entry(scope_str.clone())
                .or_insert_with(|| ServiceWorkerRegistration::new(scope.clone()));

            if registration
                .newest()
                .is_some_and(|w| w.script_url == script_url)
            {
                debug!(scope = %scope_str, script = %script_url, "Script already registered");
                return Ok(Registered {
                    scope: scope_str,
                    install: None,
                    activate: None,
                });
            }

            registration.update(script_url, handler)
        };

        self.emit(ServiceWorkerEvent::UpdateFound {
            registration_scope: scope_str.clone(),
        });
        self.emit_state(&scope_str, &worker);

        // Install holds the lifecycle step open until every asset settled.
        let install = worker.handler().install().await;

        let should_activate = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(&scope_str)
                .ok_or_else(|| ServiceWorkerError::NotFound(scope_str.clone()))?;

            if !registration.install_complete(worker.id) {
                warn!(scope = %scope_str, "Install superseded by a newer registration");
                return Ok(Registered {
                    scope: scope_str,
                    install: Some(install),
                    activate: None,
                });
            }
            self.emit(ServiceWorkerEvent::StateChange {
                registration_scope: scope_str.clone(),
                worker_id: worker.id,
                new_state: ServiceWorkerState::Installed,
            });

            worker.handler().skip_waiting() || registration.active.is_none()
        };

        let activate = if should_activate {
            Some(self.activate(&scope_str).await?)
        } else {
            info!(scope = %scope_str, "Worker installed and waiting");
            None
        };

        Ok(Registered {
            scope: scope_str,
            install: Some(install),
            activate,
        })
    }

    /// Activate the waiting worker of `scope`.
    pub async fn activate(&self, scope: &str) -> SwResult<ActivateReport> {
        let (worker, replaced, scope_url) = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(scope)
                .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;
            let (worker, replaced) = registration.begin_activation().ok_or_else(|| {
                ServiceWorkerError::StateError(format!("no waiting worker for {}", scope))
            })?;
            (worker, replaced, registration.scope.clone())
        };

        if let Some(ref old) = replaced {
            self.emit_state(scope, old);
        }
        self.emit_state(scope, &worker);

        let report = worker.handler().activate().await;

        {
            let mut registrations = self.registrations.write().await;
            if let Some(registration) = registrations.get_mut(scope) {
                if registration.finish_activation(worker.id) {
                    self.emit(ServiceWorkerEvent::StateChange {
                        registration_scope: scope.to_string(),
                        worker_id: worker.id,
                        new_state: ServiceWorkerState::Activated,
                    });
                }
            }
        }

        let mut clients = self.clients.write().await;
        let mut changed = match replaced {
            Some(old) => clients.transfer(old.id, worker.id),
            None => Vec::new(),
        };
        if worker.handler().claim_clients() {
            changed.extend(clients.claim(&scope_url, worker.id));
        }
        for client_id in changed {
            self.emit(ServiceWorkerEvent::ControllerChange {
                client_id,
                worker_id: worker.id,
            });
        }

        info!(scope, store = worker.handler().store_name(), "Worker activated");
        Ok(report)
    }

    /// Open a page session; it is controlled right away if an active worker covers it.
    pub async fn open_client(&self, url: &str) -> SwResult<String> {
        let url = Url::parse(url).map_err(|e| ServiceWorkerError::StateError(e.to_string()))?;
        let controller = {
            let registrations = self.registrations.read().await;
            longest_scope(&registrations, &url)
                .and_then(|r| r.active_worker())
                .map(|w| w.id)
        };
        Ok(self.clients.write().await.open(url, controller).id)
    }

    pub async fn controller(&self, client_id: &str) -> Option<ServiceWorkerId> {
        self.clients
            .read()
            .await
            .get(client_id)
            .and_then(|c| c.controller)
    }

    /// Route a request issued by `client_id` to its controlling worker.
    pub async fn handle_fetch(&self, client_id: &str, request: Request) -> FetchOutcome {
        let Some(controller) = self.controller(client_id).await else {
            return FetchOutcome::Passthrough;
        };

        let handler = {
            let registrations = self.registrations.read().await;
            registrations
                .values()
                .filter_map(|r| r.active_worker())
                .find(|w| w.id == controller && w.is_active())
                .map(|w| Arc::clone(w.handler()))
        };

        match handler {
            Some(handler) => handler.fetch(request).await,
            None => FetchOutcome::Passthrough,
        }
    }

    /// Scope of the registration whose scope is the longest prefix of `url`.
    pub async fn get_registration(&self, url: &str) -> Option<String> {
        let url = Url::parse(url).ok()?;
        let registrations = self.registrations.read().await;
        longest_scope(&registrations, &url).map(|r| r.scope.to_string())
    }

    /// Registered scopes, sorted.
    pub async fn get_registrations(&self) -> Vec<String> {
        let mut scopes: Vec<String> = self.registrations.read().await.keys().cloned().collect();
        scopes.sort();
        scopes
    }

    /// State of the active worker for `scope`.
    pub async fn active_state(&self, scope: &str) -> Option<ServiceWorkerState> {
        self.registrations
            .read()
            .await
            .get(scope)
            .and_then(|r| r.active_worker())
            .map(|w| w.state)
    }

    /// Drop the registration for `scope`; its pages lose their controller.
    ///
    /// `Ok(false)` when nothing was registered there.
    pub async fn unregister(&self, scope: &str) -> SwResult<bool> {
        let removed = self.registrations.write().await.remove(scope);
        let Some(mut registration) = removed else {
            return Ok(false);
        };

        if let Some(active) = registration.active_worker() {
            self.clients.write().await.release(active.id);
        }
        registration.unregister();
        info!(scope, "Registration removed");
        Ok(true)
    }

    fn emit_state(&self, scope: &str, worker: &ServiceWorker) {
        self.emit(ServiceWorkerEvent::StateChange {
            registration_scope: scope.to_string(),
            worker_id: worker.id,
            new_state: worker.state,
        });
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl Default for ServiceWorkerContainer {
    fn default() -> Self {
        Self::new().0
    }
}

/// Default scope is the script's directory. An explicit scope must be
/// same-origin and must not reach above that directory.
fn resolve_scope(script_url: &Url, scope: Option<&str>) -> SwResult<Url> {
    if !matches!(script_url.scheme(), "http" | "https") {
        return Err(ServiceWorkerError::SecurityError(format!(
            "unsupported script scheme '{}'",
            script_url.scheme()
        )));
    }

    let mut script_dir = script_url.clone();
    script_dir.set_query(None);
    script_dir.set_fragment(None);
    let dir = script_url
        .path()
        .rsplit_once('/')
        .map(|(p, _)| format!("{}/", p))
        .unwrap_or_else(|| "/".to_string());
    script_dir.set_path(&dir);

    let scope = match scope {
        Some(s) => script_url
            .join(s)
            .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?,
        None => return Ok(script_dir),
    };

    if scope.origin() != script_url.origin() {
        return Err(ServiceWorkerError::SecurityError(format!(
            "scope {} is not same-origin with {}",
            scope, script_url
        )));
    }
    if !scope.path().starts_with(script_dir.path()) {
        return Err(ServiceWorkerError::SecurityError(format!(
            "scope {} is above the script location {}",
            scope, script_dir
        )));
    }
    Ok(scope)
}

fn longest_scope<'a>(
    registrations: &'a HashMap<String, ServiceWorkerRegistration>,
    url: &Url,
) -> Option<&'a ServiceWorkerRegistration> {
    registrations
        .iter()
        .filter(|(scope, _)| url.as_str().starts_with(scope.as_str()))
        .max_by_key(|(scope, _)| scope.len())
        .map(|(_, registration)| registration)
}
