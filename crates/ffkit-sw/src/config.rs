//! Agent configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::version::{cache_prefix, VersionInfo};
use crate::ServiceWorkerError;

const DEFAULT_ORIGIN: &str = "http://localhost:3000/";

/// Agent configuration, injected at deploy time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Application name; buckets are named `<app_name>-v<version>`.
    pub app_name: String,

    /// Origin the agent serves. Requests elsewhere are not intercepted.
    pub origin: Url,

    /// Deployed version.
    pub version: String,

    /// Whether pages must force-reload on activation.
    pub is_critical: bool,

    /// Path prefix of the API namespace (network-only).
    pub api_prefix: String,

    /// Paths pre-cached on install, in order.
    pub precache: Vec<String>,

    /// Site shell document, the last-resort fallback.
    pub shell_page: String,

    /// Offline document served to failed navigations.
    pub offline_page: String,

    /// Upper bound on a single network attempt, in seconds. `None` waits for
    /// the transport to give up on its own.
    pub network_timeout_secs: Option<u64>,

    /// Defaults for rendered push notifications.
    pub notifications: NotificationDefaults,

    /// Background sync tags.
    pub sync: SyncTags,
}

/// Defaults for push notifications whose payload leaves a field out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationDefaults {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    /// Stable tag so a new push replaces the previous notification.
    pub tag: String,
    pub vibrate: Vec<u32>,
    pub require_interaction: bool,
    /// Page opened on click when the payload has no URL.
    pub url: String,
}

/// Tags recognised on background wake-ups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncTags {
    /// One-off sync fired when connectivity returns.
    pub retry: String,
    /// Periodic sync for update checks.
    pub update_check: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let build = VersionInfo::from_build();
        Self {
            app_name: "fin-feathers".to_string(),
            origin: Url::parse(DEFAULT_ORIGIN).expect("default origin is a valid URL"),
            version: build.version,
            is_critical: build.is_critical,
            api_prefix: "/api/".to_string(),
            precache: vec![
                "/".to_string(),
                "/index.html".to_string(),
                "/manifest.json".to_string(),
                "/offline.html".to_string(),
            ],
            shell_page: "/index.html".to_string(),
            offline_page: "/offline.html".to_string(),
            network_timeout_secs: Some(30),
            notifications: NotificationDefaults::default(),
            sync: SyncTags::default(),
        }
    }
}

impl Default for NotificationDefaults {
    fn default() -> Self {
        Self {
            title: "Fin & Feathers".to_string(),
            body: "New update available!".to_string(),
            icon: "/logo192.png".to_string(),
            badge: "/logo192.png".to_string(),
            tag: "fin-feathers-notification".to_string(),
            vibrate: vec![200, 100, 200],
            require_interaction: false,
            url: "/".to_string(),
        }
    }
}

impl Default for SyncTags {
    fn default() -> Self {
        Self {
            retry: "sync-posts".to_string(),
            update_check: "check-updates".to_string(),
        }
    }
}

impl AgentConfig {
    /// Create a configuration for `origin` at `version`, other fields default.
    pub fn new(origin: Url, version: impl Into<String>, is_critical: bool) -> Self {
        Self {
            origin,
            version: version.into(),
            is_critical,
            ..Default::default()
        }
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self, ServiceWorkerError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ServiceWorkerError::ConfigError(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ServiceWorkerError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            ServiceWorkerError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    /// Reject configurations the agent cannot run with.
    pub fn validate(&self) -> Result<(), ServiceWorkerError> {
        let invalid = |msg: String| Err(ServiceWorkerError::ConfigError(msg));

        if self.app_name.trim().is_empty() {
            return invalid("app_name must not be empty".to_string());
        }
        if self.version.trim().is_empty() {
            return invalid("version must not be empty".to_string());
        }
        if !matches!(self.origin.scheme(), "http" | "https") {
            return invalid(format!("origin must be http(s), got {}", self.origin));
        }
        if !self.api_prefix.starts_with('/') {
            return invalid(format!("api_prefix must start with '/', got {}", self.api_prefix));
        }
        for (field, page) in [("shell_page", &self.shell_page), ("offline_page", &self.offline_page)] {
            if !page.starts_with('/') {
                return invalid(format!("{} must be an absolute path, got {}", field, page));
            }
        }
        if self.network_timeout_secs == Some(0) {
            return invalid("network_timeout_secs must be positive".to_string());
        }
        Ok(())
    }

    /// The Version Registry values for this deployment.
    pub fn version_info(&self) -> VersionInfo {
        VersionInfo::new(self.version.clone(), self.is_critical)
    }

    /// Name of the current bucket.
    pub fn cache_name(&self) -> String {
        self.version_info().cache_name(&self.app_name)
    }

    /// Prefix shared by this app's buckets.
    pub fn cache_prefix(&self) -> String {
        cache_prefix(&self.app_name)
    }

    /// Per-attempt network timeout.
    pub fn network_timeout(&self) -> Option<Duration> {
        self.network_timeout_secs.map(Duration::from_secs)
    }

    /// Resolve a path or URL against the origin.
    pub fn resolve(&self, path: &str) -> Result<Url, ServiceWorkerError> {
        self.origin
            .join(path)
            .map_err(|e| ServiceWorkerError::ConfigError(format!("cannot resolve {}: {}", path, e)))
    }

    /// Whether `url` belongs to the served origin.
    pub fn is_same_origin(&self, url: &Url) -> bool {
        url.origin() == self.origin.origin()
    }

    /// Whether `url` falls under the API namespace.
    pub fn is_api(&self, url: &Url) -> bool {
        url.path().starts_with(&self.api_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.app_name, "fin-feathers");
        assert_eq!(config.precache.len(), 4);
        assert_eq!(config.notifications.tag, "fin-feathers-notification");
        assert_eq!(config.sync.retry, "sync-posts");
        assert_eq!(config.sync.update_check, "check-updates");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = AgentConfig::from_json(
            r#"{ "app_name": "app", "origin": "https://ff.test/", "version": "1.0.0" }"#,
        )
        .unwrap();
        assert_eq!(config.cache_name(), "app-v1.0.0");
        assert_eq!(config.cache_prefix(), "app-");
        assert_eq!(config.api_prefix, "/api/");
        assert_eq!(config.network_timeout(), Some(Duration::from_secs(30)));
        assert!(!config.is_critical);
        assert_eq!(config.origin.host_str(), Some("ff.test"));

        let written = serde_json::to_value(&config).unwrap();
        assert_eq!(written["origin"], "https://ff.test/");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AgentConfig::default();
        config.api_prefix = "api".to_string();
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.origin = Url::parse("ftp://ff.test/").unwrap();
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.shell_page = "index.html".to_string();
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.app_name = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(matches!(
            AgentConfig::from_json("{ not json"),
            Err(ServiceWorkerError::ConfigError(_))
        ));
    }

    #[test]
    fn test_origin_and_api_checks() {
        let config = AgentConfig::new(Url::parse("https://ff.test/").unwrap(), "1.0.0", false);
        let api = config.resolve("/api/contact").unwrap();
        let page = config.resolve("/menu").unwrap();
        let other = Url::parse("https://cdn.example.com/api/x").unwrap();

        assert!(config.is_same_origin(&api));
        assert!(config.is_api(&api));
        assert!(!config.is_api(&page));
        assert!(!config.is_same_origin(&other));
    }

    #[test]
    fn test_version_info_follows_config() {
        let config = AgentConfig::new(Url::parse("https://ff.test/").unwrap(), "2.1.0", true);
        assert_eq!(config.version_info(), VersionInfo::new("2.1.0", true));
    }
}
