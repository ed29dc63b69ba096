//! In-process host: registration slots, pages and the platform services the
//! agent relies on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ffkit_common::OptionExt;
use ffkit_net::{Fetch, Request, Response};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::agent::{Agent, AgentEvent, EventOutcome};
use crate::cache::{CacheStorage, MemoryCacheStorage};
use crate::clients::{ClientEvent, ClientRegistry, PageHandle};
use crate::config::AgentConfig;
use crate::context::{AgentContext, Registration};
use crate::lifecycle::{ActivateReport, InstallReport};
use crate::message::MessageEvent;
use crate::push::{ClickOutcome, Notification, NotificationClickEvent, PushEvent};
use crate::router::{FetchDisposition, ResponseSource};
use crate::sync::SyncEvent;
use crate::ServiceWorkerError;

// ==================== Registration ====================

/// Calls the agent made on its registration.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistrationEvent {
    SkipWaiting,
    NotificationShown(Notification),
    NotificationClosed(String),
    SyncRegistered(String),
}

/// The host side of [`Registration`].
pub struct HostRegistration {
    skip_waiting: AtomicBool,
    background_sync: AtomicBool,
    notifications: RwLock<Vec<Notification>>,
    sync_tags: RwLock<Vec<String>>,
    event_tx: mpsc::UnboundedSender<RegistrationEvent>,
}

impl HostRegistration {
    /// Create a registration. `background_sync` controls whether sync
    /// registration is offered.
    pub fn new(background_sync: bool) -> (Self, mpsc::UnboundedReceiver<RegistrationEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                skip_waiting: AtomicBool::new(false),
                background_sync: AtomicBool::new(background_sync),
                notifications: RwLock::new(Vec::new()),
                sync_tags: RwLock::new(Vec::new()),
                event_tx,
            },
            event_rx,
        )
    }

    /// Consume a pending skip-waiting request.
    pub fn take_skip_waiting(&self) -> bool {
        self.skip_waiting.swap(false, Ordering::SeqCst)
    }

    pub fn set_background_sync(&self, supported: bool) {
        self.background_sync.store(supported, Ordering::SeqCst);
    }

    /// Notifications currently shown.
    pub async fn notifications(&self) -> Vec<Notification> {
        self.notifications.read().await.clone()
    }

    /// The shown notification with `tag`.
    pub async fn notification(&self, tag: &str) -> Option<Notification> {
        self.notifications
            .read()
            .await
            .iter()
            .find(|n| n.tag() == tag)
            .cloned()
    }

    /// Registered one-off sync tags not yet fired.
    pub async fn sync_tags(&self) -> Vec<String> {
        self.sync_tags.read().await.clone()
    }

    async fn consume_sync_tag(&self, tag: &str) -> bool {
        let mut tags = self.sync_tags.write().await;
        let before = tags.len();
        tags.retain(|t| t != tag);
        tags.len() != before
    }

    fn emit(&self, event: RegistrationEvent) {
        let _ = self.event_tx.send(event);
    }
}

#[async_trait]
impl Registration for HostRegistration {
    async fn skip_waiting(&self) -> Result<(), ServiceWorkerError> {
        self.skip_waiting.store(true, Ordering::SeqCst);
        self.emit(RegistrationEvent::SkipWaiting);
        Ok(())
    }

    async fn show_notification(&self, notification: Notification) -> Result<(), ServiceWorkerError> {
        let mut shown = self.notifications.write().await;
        shown.retain(|n| n.tag() != notification.tag());
        shown.push(notification.clone());
        self.emit(RegistrationEvent::NotificationShown(notification));
        Ok(())
    }

    async fn close_notification(&self, tag: &str) -> Result<(), ServiceWorkerError> {
        self.notifications.write().await.retain(|n| n.tag() != tag);
        self.emit(RegistrationEvent::NotificationClosed(tag.to_string()));
        Ok(())
    }

    fn supports_background_sync(&self) -> bool {
        self.background_sync.load(Ordering::SeqCst)
    }

    async fn register_sync(&self, tag: &str) -> Result<(), ServiceWorkerError> {
        if !self.supports_background_sync() {
            return Err(ServiceWorkerError::Unsupported(
                "background sync".to_string(),
            ));
        }
        let mut tags = self.sync_tags.write().await;
        if !tags.iter().any(|t| t == tag) {
            tags.push(tag.to_string());
        }
        self.emit(RegistrationEvent::SyncRegistered(tag.to_string()));
        Ok(())
    }
}

// ==================== Container ====================

/// Container options.
#[derive(Debug, Clone, Copy)]
pub struct ContainerOptions {
    /// Offer background sync to agents.
    pub background_sync: bool,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            background_sync: true,
        }
    }
}

/// Receivers for everything the host surfaces to its embedder.
#[derive(Debug)]
pub struct HostEvents {
    pub clients: mpsc::UnboundedReceiver<ClientEvent>,
    pub registration: mpsc::UnboundedReceiver<RegistrationEvent>,
}

/// Registration slot of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerSlot {
    Installing,
    Waiting,
    Active,
}

#[derive(Default)]
struct Slots {
    installing: Option<Arc<Agent>>,
    waiting: Option<Arc<Agent>>,
    active: Option<Arc<Agent>>,
}

/// Hosts the agents registered for one scope.
pub struct ServiceWorkerContainer {
    scope: Url,
    network: Arc<dyn Fetch>,
    caches: Arc<dyn CacheStorage>,
    clients: Arc<ClientRegistry>,
    registration: Arc<HostRegistration>,
    slots: RwLock<Slots>,
}

impl ServiceWorkerContainer {
    /// Create a container with in-memory cache storage.
    pub fn new(
        scope: Url,
        network: Arc<dyn Fetch>,
        options: ContainerOptions,
    ) -> (Self, HostEvents) {
        Self::with_storage(scope, network, Arc::new(MemoryCacheStorage::new()), options)
    }

    /// Create a container over the given cache storage.
    pub fn with_storage(
        scope: Url,
        network: Arc<dyn Fetch>,
        caches: Arc<dyn CacheStorage>,
        options: ContainerOptions,
    ) -> (Self, HostEvents) {
        let (clients, client_events) = ClientRegistry::new();
        let (registration, registration_events) = HostRegistration::new(options.background_sync);
        (
            Self {
                scope,
                network,
                caches,
                clients: Arc::new(clients),
                registration: Arc::new(registration),
                slots: RwLock::new(Slots::default()),
            },
            HostEvents {
                clients: client_events,
                registration: registration_events,
            },
        )
    }

    /// Handler context shared by every agent of this container.
    pub fn context(&self) -> AgentContext {
        AgentContext::new(
            self.network.clone(),
            self.caches.clone(),
            self.clients.clone(),
            self.registration.clone(),
        )
    }

    /// Install a new agent for `config`, then activate it if it asked to
    /// skip waiting or nothing is active yet.
    pub async fn register(&self, config: AgentConfig) -> Result<InstallReport, ServiceWorkerError> {
        if !config.is_same_origin(&self.scope) {
            return Err(ServiceWorkerError::ConfigError(format!(
                "origin {} does not serve scope {}",
                config.origin, self.scope
            )));
        }

        let agent = Arc::new(Agent::new(config, self.context())?);
        info!(scope = %self.scope, version = %agent.version().version, "Registering agent");
        self.slots.write().await.installing = Some(agent.clone());

        let installed = match agent.dispatch(AgentEvent::Install).await {
            Ok(EventOutcome::Installed(report)) => Ok(report),
            Ok(other) => Err(ServiceWorkerError::StateError(format!(
                "install produced {:?}",
                other
            ))),
            Err(e) => Err(e),
        };
        let report = match installed {
            Ok(report) => report,
            Err(e) => {
                self.slots.write().await.installing = None;
                agent.supersede().await;
                return Err(e);
            }
        };

        {
            let mut slots = self.slots.write().await;
            slots.installing = None;
            if let Some(previous) = slots.waiting.replace(agent) {
                previous.supersede().await;
            }
        }

        self.try_activate().await?;
        Ok(report)
    }

    /// Promote the waiting agent if it asked to skip waiting or nothing is
    /// active.
    pub async fn try_activate(&self) -> Result<Option<ActivateReport>, ServiceWorkerError> {
        let mut slots = self.slots.write().await;
        if slots.waiting.is_none() {
            return Ok(None);
        }
        if !self.registration.take_skip_waiting() && slots.active.is_some() {
            debug!("Waiting agent stays waiting");
            return Ok(None);
        }

        let Some(agent) = slots.waiting.take() else {
            return Ok(None);
        };

        // The outgoing agent's cache writes must land before the stale
        // buckets are purged.
        if let Some(previous) = slots.active.as_ref() {
            previous.supersede().await;
            let settled = previous.settle().await;
            debug!(version = %previous.version().version, settled, "Previous agent retired");
        }

        let report = match agent.dispatch(AgentEvent::Activate).await? {
            EventOutcome::Activated(report) => report,
            other => {
                return Err(ServiceWorkerError::StateError(format!(
                    "activate produced {:?}",
                    other
                )))
            }
        };
        slots.active = Some(agent);
        Ok(Some(report))
    }

    /// Open a page at `url`. It is controlled when an agent is active.
    pub async fn connect_page(&self, url: Url) -> PageHandle {
        let controlled = self.slots.read().await.active.is_some();
        self.clients.connect(url, controlled).await
    }

    /// Fetch through the active agent, or straight from the network when
    /// nothing is active or the agent declines.
    pub async fn fetch(
        &self,
        request: Request,
    ) -> Result<(ResponseSource, Response), ServiceWorkerError> {
        let Some(agent) = self.active().await else {
            let response = self.network.fetch(&request).await?;
            return Ok((ResponseSource::Platform, response));
        };

        match agent.dispatch(AgentEvent::Fetch(request.clone())).await? {
            EventOutcome::Fetch(FetchDisposition::Respond { response, source }) => {
                Ok((source, response))
            }
            EventOutcome::Fetch(FetchDisposition::Bypass) | EventOutcome::Unhandled => {
                let response = self.network.fetch(&request).await?;
                Ok((ResponseSource::Platform, response))
            }
            other => Err(ServiceWorkerError::StateError(format!(
                "fetch produced {:?}",
                other
            ))),
        }
    }

    /// Deliver a page message to the agent in `slot`.
    pub async fn post_message(
        &self,
        slot: WorkerSlot,
        event: MessageEvent,
    ) -> Result<EventOutcome, ServiceWorkerError> {
        let agent = self
            .agent(slot)
            .await
            .ok_or_not_found(format!("no {:?} agent", slot))?;
        let outcome = agent.dispatch(AgentEvent::Message(event)).await?;
        self.try_activate().await?;
        Ok(outcome)
    }

    /// Deliver a push to the active agent.
    pub async fn push(&self, event: PushEvent) -> Result<Option<Notification>, ServiceWorkerError> {
        match self.dispatch_active(AgentEvent::Push(event)).await? {
            EventOutcome::Notified(shown) => Ok(shown),
            _ => Ok(None),
        }
    }

    /// Click the shown notification with `tag`.
    pub async fn click_notification(&self, tag: &str) -> Result<ClickOutcome, ServiceWorkerError> {
        let notification = self
            .registration
            .notification(tag)
            .await
            .ok_or_not_found(format!("notification {}", tag))?;

        match self
            .dispatch_active(AgentEvent::NotificationClick(NotificationClickEvent::new(
                notification,
            )))
            .await?
        {
            EventOutcome::Clicked(outcome) => Ok(outcome),
            other => Err(ServiceWorkerError::StateError(format!(
                "click produced {:?}",
                other
            ))),
        }
    }

    /// Fire a one-off sync. Returns how many pages were notified, or `None`
    /// when the agent ignored the tag.
    pub async fn fire_sync(&self, tag: &str) -> Result<Option<usize>, ServiceWorkerError> {
        if !self.registration.consume_sync_tag(tag).await {
            debug!(tag, "Firing unregistered sync tag");
        }
        Ok(broadcast_count(
            self.dispatch_active(AgentEvent::Sync(SyncEvent::new(tag))).await?,
        ))
    }

    /// Fire a periodic sync.
    pub async fn fire_periodic_sync(&self, tag: &str) -> Result<Option<usize>, ServiceWorkerError> {
        Ok(broadcast_count(
            self.dispatch_active(AgentEvent::PeriodicSync(SyncEvent::new(tag)))
                .await?,
        ))
    }

    /// Wait for background work of the waiting and active agents.
    pub async fn settle(&self) -> usize {
        let agents: Vec<Arc<Agent>> = {
            let slots = self.slots.read().await;
            slots.waiting.iter().chain(slots.active.iter()).cloned().collect()
        };
        let mut settled = 0;
        for agent in agents {
            settled += agent.settle().await;
        }
        settled
    }

    async fn dispatch_active(&self, event: AgentEvent) -> Result<EventOutcome, ServiceWorkerError> {
        let agent = self.active().await.ok_or_else(|| {
            warn!(kind = ?event.kind(), "No active agent");
            ServiceWorkerError::StateError("no active agent".to_string())
        })?;
        agent.dispatch(event).await
    }

    /// The agent in `slot`.
    pub async fn agent(&self, slot: WorkerSlot) -> Option<Arc<Agent>> {
        let slots = self.slots.read().await;
        match slot {
            WorkerSlot::Installing => slots.installing.clone(),
            WorkerSlot::Waiting => slots.waiting.clone(),
            WorkerSlot::Active => slots.active.clone(),
        }
    }

    pub async fn active(&self) -> Option<Arc<Agent>> {
        self.agent(WorkerSlot::Active).await
    }

    pub async fn waiting(&self) -> Option<Arc<Agent>> {
        self.agent(WorkerSlot::Waiting).await
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn caches(&self) -> &Arc<dyn CacheStorage> {
        &self.caches
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    pub fn registration(&self) -> &Arc<HostRegistration> {
        &self.registration
    }
}

fn broadcast_count(outcome: EventOutcome) -> Option<usize> {
    match outcome {
        EventOutcome::Broadcast(count) => Some(count),
        _ => None,
    }
}
