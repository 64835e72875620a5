//! Worker configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::{CoreError, CoreResult};
use crate::types::{AssetManifest, InstallPolicy};

/// Environment variable carrying the deploy-time cache version.
pub const CACHE_VERSION_ENV: &str = "CHAUN_CACHE_VERSION";

/// Environment variable overriding the on-disk cache location.
pub const CACHE_DIR_ENV: &str = "CHAUN_CACHE_DIR";

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Offline cache settings
    pub cache: CacheConfig,

    /// Page bootstrap settings
    pub page: PageConfig,

    /// Push notification settings
    pub push: PushConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Store name prefix
    pub prefix: String,

    /// Store version, bumped on every deploy that changes cached assets
    pub version: String,

    /// Assets fetched at install time
    pub manifest: AssetManifest,

    /// Partial pre-cache handling
    pub install_policy: InstallPolicy,

    /// Activate right after install instead of waiting for old clients
    pub skip_waiting: bool,

    /// Take control of open pages right after activation
    pub claim_clients: bool,

    /// URL schemes never read from or written to the cache
    pub excluded_schemes: Vec<String>,

    /// Per-request network timeout in seconds
    pub request_timeout_secs: Option<u64>,

    /// Largest response body fetched for caching
    pub max_entry_bytes: Option<usize>,

    /// Directory holding the persistent cache stores
    pub cache_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageConfig {
    /// Origin the page is served from
    pub origin: String,

    /// Path of the worker script, relative to the origin
    pub script_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    /// Run the permission/token step on page load
    pub enabled: bool,

    /// Messaging backend registration
    pub firebase: FirebaseConfig,

    /// Public key credential used for the token exchange
    pub vapid_key: String,

    /// Seconds before an unanswered permission prompt counts as dismissed
    pub prompt_timeout_secs: u64,

    /// Token exchange attempts per page load
    pub token_attempts: u32,

    /// Session storage key for the device token
    pub session_key: String,
}

/// Messaging backend registration object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FirebaseConfig {
    pub api_key: String,
    pub auth_domain: String,
    pub project_id: String,
    pub storage_bucket: String,
    pub messaging_sender_id: String,
    pub app_id: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            prefix: "app-cache".to_string(),
            version: "v1".to_string(),
            manifest: AssetManifest::default(),
            install_policy: InstallPolicy::BestEffort,
            skip_waiting: true,
            claim_clients: true,
            excluded_schemes: vec!["chrome-extension".to_string()],
            request_timeout_secs: None,
            max_entry_bytes: None,
            cache_dir: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("chaun"),
        }
    }
}

impl Default for PageConfig {
    fn default() -> Self {
        Self {
            origin: "http://localhost:3000/".to_string(),
            script_path: "/firebase-messaging-sw.js".to_string(),
        }
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            firebase: FirebaseConfig::default(),
            vapid_key: String::new(),
            prompt_timeout_secs: 60,
            token_attempts: 1,
            session_key: "fcmToken".to_string(),
        }
    }
}

impl CacheConfig {
    /// Version-qualified store name, e.g. `app-cache-v2`.
    pub fn store_name(&self) -> String {
        format!("{}-{}", self.prefix, self.version)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

impl PageConfig {
    /// Absolute URL of the worker script.
    pub fn script_url(&self) -> CoreResult<Url> {
        Ok(Url::parse(&self.origin)?.join(&self.script_path)?)
    }
}

impl PushConfig {
    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.prompt_timeout_secs)
    }
}

impl AppConfig {
    /// Load a JSON config file, then apply environment overrides and validate.
    pub fn load(path: &Path) -> CoreResult<Self> {
        debug!(path = %path.display(), "Loading configuration");
        let raw = std::fs::read_to_string(path)?;
        let mut config = Self::from_json(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(raw: &str) -> CoreResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Apply `CHAUN_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(version) = lookup(CACHE_VERSION_ENV).filter(|v| !v.is_empty()) {
            debug!(%version, "Cache version overridden");
            self.cache.version = version;
        }
        if let Some(dir) = lookup(CACHE_DIR_ENV).filter(|v| !v.is_empty()) {
            self.cache.cache_dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.cache.prefix.is_empty() {
            return Err(CoreError::config("cache.prefix must not be empty"));
        }
        if self.cache.version.is_empty() {
            return Err(CoreError::config("cache.version must not be empty"));
        }
        let store = self.cache.store_name();
        if !is_safe_store_name(&store) {
            return Err(CoreError::config(format!(
                "cache store name '{}' may only contain letters, digits, '-', '_' and '.'",
                store
            )));
        }
        self.page.script_url()?;
        if self.push.enabled && self.push.vapid_key.is_empty() {
            return Err(CoreError::config("push.vapid_key is required when push is enabled"));
        }
        Ok(())
    }
}

/// Store names double as file names for the on-disk backend.
pub fn is_safe_store_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_deployment() {
        let config = AppConfig::default();
        assert_eq!(config.cache.store_name(), "app-cache-v1");
        assert_eq!(config.cache.manifest.len(), 6);
        assert!(config.cache.skip_waiting);
        assert!(!config.push.enabled);
        assert_eq!(
            config.page.script_url().unwrap().as_str(),
            "http://localhost:3000/firebase-messaging-sw.js"
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            AppConfig::from_json(r#"{ "cache": { "version": "v7", "install_policy": "atomic" } }"#)
                .unwrap();
        assert_eq!(config.cache.store_name(), "app-cache-v7");
        assert_eq!(config.cache.install_policy, InstallPolicy::Atomic);
        assert_eq!(config.cache.excluded_schemes, vec!["chrome-extension"]);
    }

    #[test]
    fn test_firebase_camel_case() {
        let config = AppConfig::from_json(
            r#"{ "push": { "firebase": { "projectId": "demo", "messagingSenderId": "42" } } }"#,
        )
        .unwrap();
        assert_eq!(config.push.firebase.project_id, "demo");
        assert_eq!(config.push.firebase.messaging_sender_id, "42");
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> =
            [(CACHE_VERSION_ENV, "v2"), (CACHE_DIR_ENV, "/tmp/chaun")].into();
        let mut config = AppConfig::default();
        config.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.cache.store_name(), "app-cache-v2");
        assert_eq!(config.cache.cache_dir, PathBuf::from("/tmp/chaun"));
    }

    #[test]
    fn test_validate_rejects_bad_names() {
        let mut config = AppConfig::default();
        config.cache.version = "../v2".to_string();
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));

        let mut config = AppConfig::default();
        config.cache.version.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_push_requires_key() {
        let mut config = AppConfig::default();
        config.push.enabled = true;
        assert!(config.validate().is_err());
        config.push.vapid_key = "BHwp".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chaun.json");
        std::fs::write(&path, r#"{ "cache": { "prefix": "assets" } }"#).unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert!(config.cache.store_name().starts_with("assets-"));
    }

    #[test]
    fn test_safe_store_name() {
        assert!(is_safe_store_name("app-cache-v1"));
        assert!(!is_safe_store_name("app/cache"));
        assert!(!is_safe_store_name(".hidden"));
        assert!(!is_safe_store_name(""));
    }
}
