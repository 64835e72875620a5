//! Push messaging: permission, device token and inbound messages.
//!
//! The messaging backend is a seam. The page only needs three things from
//! it: a permission prompt, a token exchange keyed by the VAPID public key,
//! and a stream of inbound messages delivered to [`MessageRouter`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Errors from the push backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PushError {
    #[error("Push backend error: {0}")]
    Backend(String),

    #[error("Push messaging not supported: {0}")]
    Unsupported(String),

    #[error("Invalid push payload: {0}")]
    InvalidPayload(String),
}

/// Answer to a notification permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationPermission {
    Granted,
    Denied,
    /// The prompt was dismissed or never answered.
    Default,
}

/// Opaque credential identifying this browser instance to the push backend.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceToken(String);

impl DeviceToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Tokens are credentials; keep them out of logs.
impl fmt::Debug for DeviceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.0.chars().take(6).collect();
        write!(f, "DeviceToken({}…)", prefix)
    }
}

/// Notification part of an inbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

/// Inbound push message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub collapse_key: Option<String>,
    #[serde(default)]
    pub notification: Option<NotificationPayload>,
    /// Application-defined payload.
    #[serde(default)]
    pub data: HashMap<String, String>,
}

impl PushMessage {
    pub fn from_json(payload: &str) -> Result<Self, PushError> {
        serde_json::from_str(payload).map_err(|e| PushError::InvalidPayload(e.to_string()))
    }
}

/// Push messaging backend.
pub trait PushMessaging: Send + Sync {
    /// Ask the user for notification permission.
    fn request_permission(&self) -> BoxFuture<'_, NotificationPermission>;

    /// Exchange the VAPID public key for a device token.
    ///
    /// `Ok(None)` means the backend answered but issued no token.
    fn get_token<'a>(
        &'a self,
        vapid_key: &'a str,
    ) -> BoxFuture<'a, Result<Option<DeviceToken>, PushError>>;
}

/// Backend for hosts without a permission UI: every prompt is dismissed.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadlessPush;

impl PushMessaging for HeadlessPush {
    fn request_permission(&self) -> BoxFuture<'_, NotificationPermission> {
        Box::pin(async { NotificationPermission::Default })
    }

    fn get_token<'a>(
        &'a self,
        _vapid_key: &'a str,
    ) -> BoxFuture<'a, Result<Option<DeviceToken>, PushError>> {
        Box::pin(async { Err(PushError::Unsupported("no push backend".into())) })
    }
}

// ==================== Message Router ====================

/// Handle returned by [`MessageRouter::on_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&PushMessage) + Send + Sync>;

/// Fans inbound messages out to registered listeners.
#[derive(Default)]
pub struct MessageRouter {
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_message<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&PushMessage) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(l, _)| *l != id);
        listeners.len() != before
    }

    /// Deliver a message to every listener. Returns how many were called.
    pub fn dispatch(&self, message: &PushMessage) -> usize {
        // Snapshot so listeners may register or remove listeners themselves.
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        info!(
            from = message.from.as_deref().unwrap_or("-"),
            message_id = message.message_id.as_deref().unwrap_or("-"),
            listeners = listeners.len(),
            "Message received"
        );
        for listener in &listeners {
            listener(message);
        }
        listeners.len()
    }

    /// Parse a raw payload and dispatch it.
    pub fn dispatch_json(&self, payload: &str) -> Result<usize, PushError> {
        let message = PushMessage::from_json(payload)?;
        debug!(keys = message.data.len(), "Parsed push payload");
        Ok(self.dispatch(&message))
    }
}

impl fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self
            .listeners
            .read()
            .map(|l| l.len())
            .unwrap_or_default();
        f.debug_struct("MessageRouter").field("listeners", &count).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_parse_message() {
        let message = PushMessage::from_json(
            r#"{
                "from": "642150988562",
                "messageId": "m-1",
                "notification": { "title": "Quest", "body": "Daily quest ready" },
                "data": { "questId": "17" }
            }"#,
        )
        .unwrap();

        assert_eq!(message.from.as_deref(), Some("642150988562"));
        assert_eq!(message.notification.unwrap().title.as_deref(), Some("Quest"));
        assert_eq!(message.data.get("questId").map(String::as_str), Some("17"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            PushMessage::from_json("not json"),
            Err(PushError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_router_dispatch_and_remove() {
        let router = MessageRouter::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        let id = router.on_message(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        router.on_message(|_| {});

        assert_eq!(router.dispatch_json(r#"{"data":{}}"#).unwrap(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(router.remove(id));
        assert!(!router.remove(id));
        assert_eq!(router.dispatch(&PushMessage::default()), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_token_debug_is_redacted() {
        let token = DeviceToken::new("fMEGz1x2y3-secret");
        assert_eq!(format!("{:?}", token), "DeviceToken(fMEGz1…)");
    }

    #[test]
    fn test_permission_serde() {
        let json = serde_json::to_string(&NotificationPermission::Default).unwrap();
        assert_eq!(json, "\"default\"");
    }
}
