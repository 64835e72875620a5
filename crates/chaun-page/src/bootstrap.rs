//! Page-load bootstrap: register the worker, then run the push step.

use std::sync::Arc;

use chaun_common::{retry_when, with_timeout, RetryConfig};
use chaun_core::{AppConfig, PageConfig, PushConfig};
use chaun_sw::{CacheWorker, Registered, RegistrationOptions, ServiceWorkerContainer};
use tracing::{error, info, warn};

use crate::push::{DeviceToken, NotificationPermission, PushError, PushMessaging};
use crate::session::SessionStore;

/// How worker registration ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// No worker container on this host.
    Unsupported,
    Registered(Registered),
    /// Logged and swallowed.
    Failed(String),
}

impl RegistrationOutcome {
    pub fn is_registered(&self) -> bool {
        matches!(self, RegistrationOutcome::Registered(_))
    }
}

/// How the push step ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Push disabled in configuration.
    Disabled,
    /// Registration did not succeed, so push never ran.
    Skipped,
    /// A token from earlier in the session was reused without prompting.
    Reused(DeviceToken),
    /// A new token was issued and stored in the session.
    Issued(DeviceToken),
    /// Permission granted but the backend issued no token.
    NoToken,
    Denied,
    /// Prompt dismissed or not answered in time.
    Dismissed,
    /// Token exchange failed after every attempt.
    Failed(String),
}

/// Everything one page load did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapReport {
    pub registration: RegistrationOutcome,
    pub push: PushOutcome,
}

/// Run the page-load sequence.
///
/// `container` is `None` on hosts without worker support. Nothing here
/// fails: every error ends up logged and reported.
pub async fn bootstrap(
    container: Option<&ServiceWorkerContainer>,
    config: &AppConfig,
    handler: Arc<CacheWorker>,
    push: &dyn PushMessaging,
    session: &dyn SessionStore,
) -> BootstrapReport {
    let registration = register_worker(container, &config.page, handler).await;

    let push = if !config.push.enabled {
        PushOutcome::Disabled
    } else if !registration.is_registered() {
        PushOutcome::Skipped
    } else {
        run_push_step(&config.push, push, session).await
    };

    BootstrapReport { registration, push }
}

/// Register the worker script configured in `page`.
pub async fn register_worker(
    container: Option<&ServiceWorkerContainer>,
    page: &PageConfig,
    handler: Arc<CacheWorker>,
) -> RegistrationOutcome {
    let Some(container) = container else {
        warn!("Service Worker not supported");
        return RegistrationOutcome::Unsupported;
    };

    let script_url = match page.script_url() {
        Ok(url) => url,
        Err(e) => {
            error!(origin = %page.origin, script = %page.script_path, error = %e, "Service Worker registration failed");
            return RegistrationOutcome::Failed(e.to_string());
        }
    };

    info!(script = %script_url, "Registering service worker");
    match container
        .register(script_url.as_str(), RegistrationOptions::default(), handler)
        .await
    {
        Ok(registered) => {
            info!(scope = %registered.scope, "ServiceWorker registration successful");
            RegistrationOutcome::Registered(registered)
        }
        Err(e) => {
            error!(script = %script_url, error = %e, "Service Worker registration failed");
            RegistrationOutcome::Failed(e.to_string())
        }
    }
}

/// Permission prompt and token exchange.
pub async fn run_push_step(
    config: &PushConfig,
    push: &dyn PushMessaging,
    session: &dyn SessionStore,
) -> PushOutcome {
    if let Some(token) = session.get(&config.session_key) {
        info!(key = %config.session_key, "Existing device token found in session");
        return PushOutcome::Reused(DeviceToken::new(token));
    }

    let permission = match with_timeout(config.prompt_timeout(), || push.request_permission()).await {
        Ok(permission) => permission,
        Err(e) => {
            info!(error = %e, "Notification permission prompt unanswered");
            NotificationPermission::Default
        }
    };

    match permission {
        NotificationPermission::Denied => {
            info!("Notification permission denied");
            return PushOutcome::Denied;
        }
        NotificationPermission::Default => {
            info!("Notification permission dismissed");
            return PushOutcome::Dismissed;
        }
        NotificationPermission::Granted => {
            info!(project = %config.firebase.project_id, "Notification permission granted");
        }
    }

    let retry = RetryConfig::attempts(config.token_attempts);
    let transient = |e: &PushError| matches!(e, PushError::Backend(_));
    match retry_when(&retry, transient, || push.get_token(&config.vapid_key)).await {
        Ok(Some(token)) => {
            session.set(&config.session_key, token.as_str().to_string());
            info!(token = ?token, "Device token issued");
            PushOutcome::Issued(token)
        }
        Ok(None) => {
            warn!("Unable to get a device token");
            PushOutcome::NoToken
        }
        Err(e) => {
            error!(attempts = retry.max_attempts, error = %e, "Device token exchange failed");
            PushOutcome::Failed(e.to_string())
        }
    }
}
