//! Workers, registrations and controlled clients.
//!
//! A registration owns at most three worker slots: one installing, one
//! waiting and one active. Workers move forward through those slots and
//! become [`ServiceWorkerState::Redundant`] when displaced.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::worker::CacheWorker;

static NEXT_WORKER: AtomicU64 = AtomicU64::new(1);
static NEXT_CLIENT: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn next() -> Self {
        Self(NEXT_WORKER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Lifecycle position of one worker version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    #[default]
    Parsed,
    Installing,
    /// Precache done; parked until nothing else is active or it skips waiting.
    Installed,
    Activating,
    Activated,
    Redundant,
}

impl ServiceWorkerState {
    /// Displaced or unregistered workers never run handlers again.
    pub fn is_terminal(self) -> bool {
        self == Self::Redundant
    }
}

/// One version of the worker script bound to the handlers it runs.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    pub id: ServiceWorkerId,
    pub script_url: Url,
    pub state: ServiceWorkerState,
    /// When `state` was last entered.
    pub since: Instant,
    handler: Arc<CacheWorker>,
}

impl ServiceWorker {
    pub fn new(script_url: Url, handler: Arc<CacheWorker>) -> Self {
        Self {
            id: ServiceWorkerId::next(),
            script_url,
            state: ServiceWorkerState::default(),
            since: Instant::now(),
            handler,
        }
    }

    pub fn transition(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.since = Instant::now();
    }

    fn retire(&mut self) {
        self.transition(ServiceWorkerState::Redundant);
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, ServiceWorkerState::Activated)
    }

    pub fn is_redundant(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn handler(&self) -> &Arc<CacheWorker> {
        &self.handler
    }
}

/// Worker slots for one scope.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    pub scope: Url,
    pub installing: Option<ServiceWorker>,
    pub waiting: Option<ServiceWorker>,
    pub active: Option<ServiceWorker>,
    /// Last time a new script version was started.
    pub updated_at: Option<Instant>,
}

impl ServiceWorkerRegistration {
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
            updated_at: None,
        }
    }

    pub fn active_worker(&self) -> Option<&ServiceWorker> {
        self.active.as_ref()
    }

    /// Most recently started worker, whatever its state.
    pub fn newest(&self) -> Option<&ServiceWorker> {
        [&self.installing, &self.waiting, &self.active]
            .into_iter()
            .find_map(Option::as_ref)
    }

    /// Put a fresh worker for `script_url` into the installing slot.
    ///
    /// An install still in flight loses its slot and is retired.
    pub fn update(&mut self, script_url: Url, handler: Arc<CacheWorker>) -> ServiceWorker {
        let mut fresh = ServiceWorker::new(script_url, handler);
        fresh.transition(ServiceWorkerState::Installing);
        if let Some(mut stale) = self.installing.replace(fresh.clone()) {
            stale.retire();
        }
        self.updated_at = Some(Instant::now());
        fresh
    }

    /// Move `id` from installing to waiting.
    ///
    /// Returns `false` when `id` was superseded while its install ran.
    pub fn install_complete(&mut self, id: ServiceWorkerId) -> bool {
        let Some(mut installed) = self.installing.take_if(|w| w.id == id) else {
            return false;
        };
        installed.transition(ServiceWorkerState::Installed);
        if let Some(mut displaced) = self.waiting.replace(installed) {
            displaced.retire();
        }
        true
    }

    /// Move the waiting worker into the active slot as `Activating`.
    ///
    /// Yields the promoted worker plus the retired previous one.
    pub fn begin_activation(&mut self) -> Option<(ServiceWorker, Option<ServiceWorker>)> {
        let mut promoted = self.waiting.take()?;
        promoted.transition(ServiceWorkerState::Activating);
        let retired = self.active.replace(promoted.clone()).map(|mut old| {
            old.retire();
            old
        });
        Some((promoted, retired))
    }

    /// Settle the active worker once its activate handler returned.
    pub fn finish_activation(&mut self, id: ServiceWorkerId) -> bool {
        match self.active.as_mut().filter(|w| w.id == id) {
            Some(worker) => {
                worker.transition(ServiceWorkerState::Activated);
                true
            }
            None => false,
        }
    }

    pub fn unregister(&mut self) {
        for slot in [&mut self.installing, &mut self.waiting, &mut self.active] {
            if let Some(mut worker) = slot.take() {
                worker.retire();
            }
        }
    }
}

/// A page session that may be controlled by a worker.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: String,
    pub url: Url,
    pub controller: Option<ServiceWorkerId>,
}

/// Every open page session, keyed by client id.
#[derive(Debug, Default)]
pub struct Clients {
    by_id: HashMap<String, Client>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, url: Url, controller: Option<ServiceWorkerId>) -> Client {
        let id = format!("client-{}", NEXT_CLIENT.fetch_add(1, Ordering::Relaxed));
        let client = Client { id, url, controller };
        self.by_id.insert(client.id.clone(), client.clone());
        client
    }

    pub fn get(&self, id: &str) -> Option<&Client> {
        self.by_id.get(id)
    }

    pub fn match_all(&self) -> Vec<&Client> {
        self.by_id.values().collect()
    }

    /// Point every client under `scope` at `worker`.
    ///
    /// Returns the sorted ids whose controller actually changed.
    pub fn claim(&mut self, scope: &Url, worker: ServiceWorkerId) -> Vec<String> {
        self.reassign(worker, |c| {
            c.url.as_str().starts_with(scope.as_str()) && c.controller != Some(worker)
        })
    }

    /// Move clients controlled by `from` over to `to`.
    pub fn transfer(&mut self, from: ServiceWorkerId, to: ServiceWorkerId) -> Vec<String> {
        self.reassign(to, |c| c.controller == Some(from))
    }

    pub fn release(&mut self, worker: ServiceWorkerId) {
        self.by_id
            .values_mut()
            .filter(|c| c.controller == Some(worker))
            .for_each(|c| c.controller = None);
    }

    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.by_id.remove(id)
    }

    fn reassign(&mut self, to: ServiceWorkerId, pick: impl Fn(&Client) -> bool) -> Vec<String> {
        let mut changed: Vec<String> = self
            .by_id
            .values_mut()
            .filter(|c| pick(c))
            .map(|c| {
                c.controller = Some(to);
                c.id.clone()
            })
            .collect();
        changed.sort();
        changed
    }
}
