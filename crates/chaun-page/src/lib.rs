//! # Chaun Page
//!
//! What the page does on load: register the offline cache worker and, when
//! push is enabled, obtain a device token for the session.
//!
//! ```text
//! page load
//!   ├─ container? ── no ──> warn, stop
//!   ├─ register(script_url) ── err ──> log, stop
//!   └─ push enabled?
//!        ├─ token in session ──> reuse
//!        └─ prompt ─┬─ granted ──> get_token (retried) ──> session
//!                   └─ denied / dismissed / timeout ──> no-op
//! ```

pub mod bootstrap;
pub mod push;
pub mod session;

pub use bootstrap::{
    bootstrap, register_worker, run_push_step, BootstrapReport, PushOutcome, RegistrationOutcome,
};
pub use push::{
    DeviceToken, HeadlessPush, ListenerId, MessageRouter, NotificationPayload,
    NotificationPermission, PushError, PushMessage, PushMessaging,
};
pub use session::{MemorySessionStore, SessionStore};
