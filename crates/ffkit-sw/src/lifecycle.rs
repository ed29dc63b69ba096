//! Install and activate phases.

use std::fmt;
use std::time::Instant;

use ffkit_net::{CacheMode, Request};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::context::AgentContext;
use crate::message::LifecycleNotification;
use crate::notifier::ClientNotifier;
use crate::ServiceWorkerError;

/// Lifecycle state of one agent instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Pre-caching the manifest.
    #[default]
    Installing,
    /// Installed, not yet in control.
    Waiting,
    /// Purging stale buckets and claiming pages.
    Activating,
    /// In control of pages.
    Active,
    /// Replaced by a newer version.
    Superseded,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Installing => "installing",
            Self::Waiting => "waiting",
            Self::Activating => "activating",
            Self::Active => "active",
            Self::Superseded => "superseded",
        };
        f.write_str(name)
    }
}

/// Result of the install phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    /// Bucket that was populated.
    pub bucket: String,
    /// Manifest paths now cached.
    pub cached: Vec<String>,
    /// Manifest paths that could not be fetched.
    pub failed: Vec<String>,
}

/// Result of the activate phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivateReport {
    /// Stale buckets removed.
    pub deleted: Vec<String>,
    /// Pages newly brought under control.
    pub claimed: usize,
    /// Pages told about the new version.
    pub notified: usize,
}

/// Drives one agent instance through install and activate.
pub struct LifecycleController {
    config: AgentConfig,
    state: RwLock<(LifecycleState, Instant)>,
}

impl LifecycleController {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            state: RwLock::new((LifecycleState::Installing, Instant::now())),
        }
    }

    /// Current state.
    pub async fn state(&self) -> LifecycleState {
        self.state.read().await.0
    }

    /// When the current state was entered.
    pub async fn state_changed_at(&self) -> Instant {
        self.state.read().await.1
    }

    async fn set_state(&self, next: LifecycleState) {
        let mut state = self.state.write().await;
        debug!(from = %state.0, to = %next, version = %self.config.version, "Lifecycle transition");
        *state = (next, Instant::now());
    }

    /// Notification announcing this version to pages.
    pub fn activation_notice(&self) -> LifecycleNotification {
        LifecycleNotification::SwUpdated {
            version: self.config.version.clone(),
            is_critical: self.config.is_critical,
        }
    }

    /// Pre-cache the manifest into this version's bucket, then ask to skip
    /// waiting.
    ///
    /// Individual pre-fetch failures are logged and do not fail the install.
    pub async fn install(&self, ctx: &AgentContext) -> Result<InstallReport, ServiceWorkerError> {
        let state = self.state().await;
        if state != LifecycleState::Installing {
            return Err(ServiceWorkerError::StateError(format!(
                "cannot install from {}",
                state
            )));
        }

        let bucket = self.config.cache_name();
        info!(version = %self.config.version, bucket = %bucket, "Installing");
        ctx.caches.open(&bucket).await?;

        let mut report = InstallReport {
            bucket: bucket.clone(),
            cached: Vec::new(),
            failed: Vec::new(),
        };

        for path in &self.config.precache {
            match self.precache_one(ctx, &bucket, path).await {
                Ok(()) => report.cached.push(path.clone()),
                Err(e) => {
                    warn!(path = %path, error = %e, "Pre-cache failed");
                    report.failed.push(path.clone());
                }
            }
        }

        self.set_state(LifecycleState::Waiting).await;

        if let Err(e) = ctx.registration.skip_waiting().await {
            warn!(error = %e, "Skip waiting request failed");
        }

        info!(
            cached = report.cached.len(),
            failed = report.failed.len(),
            "Install complete"
        );
        Ok(report)
    }

    async fn precache_one(
        &self,
        ctx: &AgentContext,
        bucket: &str,
        path: &str,
    ) -> Result<(), ServiceWorkerError> {
        let url = self.config.resolve(path)?;
        let request = Request::get(url).cache_mode(CacheMode::Reload);
        let response = ctx.fetch(&request, self.config.network_timeout()).await?;
        if !response.ok() {
            return Err(ServiceWorkerError::NetworkError(format!(
                "{} answered {}",
                request.url, response.status
            )));
        }
        ctx.caches.put(bucket, &request, response).await
    }

    /// Purge stale buckets, then claim pages and announce the version.
    ///
    /// Cleanup failures are logged; activation always completes.
    pub async fn activate(
        &self,
        ctx: &AgentContext,
        notifier: &ClientNotifier,
    ) -> Result<ActivateReport, ServiceWorkerError> {
        let state = self.state().await;
        if state != LifecycleState::Waiting {
            return Err(ServiceWorkerError::StateError(format!(
                "cannot activate from {}",
                state
            )));
        }

        self.set_state(LifecycleState::Activating).await;
        info!(version = %self.config.version, "Activating");

        let deleted = self.purge_stale(ctx).await;

        let claimed = match ctx.clients.claim().await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Claiming pages failed");
                0
            }
        };

        self.set_state(LifecycleState::Active).await;

        let notified = notifier.broadcast(ctx, self.activation_notice()).await;

        Ok(ActivateReport {
            deleted,
            claimed,
            notified,
        })
    }

    async fn purge_stale(&self, ctx: &AgentContext) -> Vec<String> {
        let current = self.config.cache_name();
        let prefix = self.config.cache_prefix();

        let names = match ctx.caches.keys().await {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "Listing buckets failed");
                return Vec::new();
            }
        };

        let mut deleted = Vec::new();
        for name in names {
            if !name.starts_with(&prefix) || name == current {
                continue;
            }
            info!(bucket = %name, "Deleting stale bucket");
            match ctx.caches.delete(&name).await {
                Ok(_) => deleted.push(name),
                Err(e) => warn!(bucket = %name, error = %e, "Deleting stale bucket failed"),
            }
        }
        deleted
    }

    /// Mark this instance as replaced by a newer version.
    pub async fn supersede(&self) {
        self.set_state(LifecycleState::Superseded).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(LifecycleState::Installing.to_string(), "installing");
        assert_eq!(LifecycleState::Superseded.to_string(), "superseded");
        assert_eq!(LifecycleState::default(), LifecycleState::Installing);
    }

    #[test]
    fn test_activation_notice_carries_version() {
        let config = AgentConfig::new(url::Url::parse("https://ff.test/").unwrap(), "2.0.0", true);
        let controller = LifecycleController::new(config);
        assert_eq!(
            controller.activation_notice(),
            LifecycleNotification::SwUpdated {
                version: "2.0.0".to_string(),
                is_critical: true
            }
        );
    }

    #[tokio::test]
    async fn test_supersede() {
        let controller = LifecycleController::new(AgentConfig::default());
        assert_eq!(controller.state().await, LifecycleState::Installing);
        controller.supersede().await;
        assert_eq!(controller.state().await, LifecycleState::Superseded);
    }
}
