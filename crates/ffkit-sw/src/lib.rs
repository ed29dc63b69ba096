//! # ffkit Service Worker
//!
//! The offline agent that sits between the Fin & Feathers pages and the
//! network.
//!
//! ## Features
//!
//! - **Lifecycle**: install pre-caches the site shell, activate purges stale
//!   buckets, claims pages and announces the new version
//! - **Fetch strategies**: bypass cross-origin, network-only for the API,
//!   network-first with a cache fallback for everything else
//! - **Client messaging**: `SKIP_WAITING`, `GET_VERSION`, `TRIGGER_SYNC` in,
//!   `SW_UPDATED`, `SYNC_POSTS`, `CHECK_UPDATES` out
//! - **Push**: renders notifications and routes clicks to an open page
//! - **Background sync**: wakes pages up to replay their own failed writes
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer (host)
//!     │
//!     ├── installing / waiting / active (Agent)
//!     │       └── DispatchTable: EventKind → handler
//!     │               ├── LifecycleController
//!     │               ├── StrategyRouter
//!     │               ├── ClientNotifier
//!     │               ├── PushGateway
//!     │               └── DeferredRetryTrigger
//!     │
//!     └── AgentContext
//!             ├── network (Fetch)
//!             ├── caches (CacheStorage) ── "<app>-v<version>" → RequestKey → CacheEntry
//!             ├── clients (Clients)
//!             └── registration (Registration)
//! ```

use ffkit_common::KitError;
use ffkit_net::NetError;
use thiserror::Error;

pub mod agent;
pub mod cache;
pub mod clients;
pub mod config;
pub mod context;
pub mod host;
pub mod lifecycle;
pub mod message;
pub mod notifier;
pub mod push;
pub mod router;
pub mod sync;
pub mod version;

pub use agent::{Agent, AgentEvent, DispatchTable, EventKind, EventOutcome, Handler};
pub use cache::{Cache, CacheEntry, CacheStorage, MemoryCacheStorage, RequestKey};
pub use clients::{
    Client, ClientEvent, ClientId, ClientMatchOptions, ClientRegistry, ClientType, Clients,
    PageHandle,
};
pub use config::{AgentConfig, NotificationDefaults, SyncTags};
pub use context::{AgentContext, PendingWork, Registration};
pub use host::{
    ContainerOptions, HostEvents, HostRegistration, RegistrationEvent, ServiceWorkerContainer,
    WorkerSlot,
};
pub use lifecycle::{ActivateReport, InstallReport, LifecycleController, LifecycleState};
pub use message::{ControlMessage, LifecycleNotification, MessageEvent, ReplyPort};
pub use notifier::ClientNotifier;
pub use push::{
    ClickOutcome, Notification, NotificationClickEvent, NotificationOptions, NotificationTarget,
    PushEvent, PushGateway, PushPayload,
};
pub use router::{FetchDisposition, ResponseSource, Strategy, StrategyRouter};
pub use sync::{DeferredRetryTrigger, SyncEvent};
pub use version::VersionInfo;

// ==================== Errors ====================

/// Errors that can occur in agent operations.
#[derive(Error, Debug, Clone)]
pub enum ServiceWorkerError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Offline and nothing cached for {0}")]
    OfflineUnavailable(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Client error: {0}")]
    ClientError(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<NetError> for ServiceWorkerError {
    fn from(e: NetError) -> Self {
        Self::NetworkError(e.to_string())
    }
}

impl From<KitError> for ServiceWorkerError {
    fn from(e: KitError) -> Self {
        match e {
            KitError::Timeout(_) => Self::NetworkError(e.to_string()),
            KitError::Config { .. } => Self::ConfigError(e.to_string()),
            KitError::NotFound(what) => Self::NotFound(what),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_timeout_maps_to_network_error() {
        let err: ServiceWorkerError = KitError::Timeout(Duration::from_secs(30)).into();
        assert!(matches!(err, ServiceWorkerError::NetworkError(_)));
    }

    #[test]
    fn test_net_error_maps_to_network_error() {
        let err: ServiceWorkerError = NetError::Offline("https://ff.test/".to_string()).into();
        assert!(err.to_string().contains("https://ff.test/"));
    }
}
