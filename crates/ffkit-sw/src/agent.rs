//! The agent and its dispatch table.

use std::fmt;

use futures::future::{BoxFuture, FutureExt};
use hashbrown::HashMap;
use serde::Serialize;
use tracing::{debug, instrument};

use ffkit_net::Request;

use crate::config::AgentConfig;
use crate::context::{AgentContext, PendingWork};
use crate::lifecycle::{ActivateReport, InstallReport, LifecycleController, LifecycleState};
use crate::message::MessageEvent;
use crate::notifier::ClientNotifier;
use crate::push::{ClickOutcome, Notification, NotificationClickEvent, PushEvent, PushGateway};
use crate::router::{FetchDisposition, StrategyRouter};
use crate::sync::{DeferredRetryTrigger, SyncEvent};
use crate::version::VersionInfo;
use crate::ServiceWorkerError;

// ==================== Events ====================

/// An event delivered to the agent by its host.
#[derive(Debug)]
pub enum AgentEvent {
    Install,
    Activate,
    Fetch(Request),
    Message(MessageEvent),
    Push(PushEvent),
    NotificationClick(NotificationClickEvent),
    Sync(SyncEvent),
    PeriodicSync(SyncEvent),
}

/// Discriminant of [`AgentEvent`], the dispatch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Install,
    Activate,
    Fetch,
    Message,
    Push,
    NotificationClick,
    Sync,
    PeriodicSync,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::Install,
        EventKind::Activate,
        EventKind::Fetch,
        EventKind::Message,
        EventKind::Push,
        EventKind::NotificationClick,
        EventKind::Sync,
        EventKind::PeriodicSync,
    ];
}

impl AgentEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Install => EventKind::Install,
            Self::Activate => EventKind::Activate,
            Self::Fetch(_) => EventKind::Fetch,
            Self::Message(_) => EventKind::Message,
            Self::Push(_) => EventKind::Push,
            Self::NotificationClick(_) => EventKind::NotificationClick,
            Self::Sync(_) => EventKind::Sync,
            Self::PeriodicSync(_) => EventKind::PeriodicSync,
        }
    }
}

/// What handling an event produced.
#[derive(Debug)]
pub enum EventOutcome {
    Installed(InstallReport),
    Activated(ActivateReport),
    Fetch(FetchDisposition),
    /// The event was handled and has nothing to report.
    Completed,
    /// The notification shown for a push, if any.
    Notified(Option<Notification>),
    Clicked(ClickOutcome),
    /// Number of pages notified.
    Broadcast(usize),
    /// No handler, or the handler did not recognise the event.
    Unhandled,
}

// ==================== Dispatch ====================

/// An event handler.
pub type Handler =
    for<'a> fn(&'a Agent, AgentEvent) -> BoxFuture<'a, Result<EventOutcome, ServiceWorkerError>>;

/// Maps each event kind to its handler.
#[derive(Clone, Default)]
pub struct DispatchTable {
    handlers: HashMap<EventKind, Handler>,
}

impl DispatchTable {
    /// An empty table. Every event is unhandled.
    pub fn new() -> Self {
        Self::default()
    }

    /// The table with a handler for every event kind.
    pub fn standard() -> Self {
        let mut table = Self::new();
        table.register(EventKind::Install, on_install);
        table.register(EventKind::Activate, on_activate);
        table.register(EventKind::Fetch, on_fetch);
        table.register(EventKind::Message, on_message);
        table.register(EventKind::Push, on_push);
        table.register(EventKind::NotificationClick, on_notification_click);
        table.register(EventKind::Sync, on_sync);
        table.register(EventKind::PeriodicSync, on_periodic_sync);
        table
    }

    /// Install `handler` for `kind`, returning the one it replaced.
    pub fn register(&mut self, kind: EventKind, handler: Handler) -> Option<Handler> {
        self.handlers.insert(kind, handler)
    }

    /// Remove the handler for `kind`.
    pub fn remove(&mut self, kind: EventKind) -> Option<Handler> {
        self.handlers.remove(&kind)
    }

    pub fn get(&self, kind: EventKind) -> Option<Handler> {
        self.handlers.get(&kind).copied()
    }

    /// Kinds with a handler, in declaration order.
    pub fn kinds(&self) -> Vec<EventKind> {
        let mut kinds: Vec<EventKind> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTable")
            .field("kinds", &self.kinds())
            .finish()
    }
}

fn mismatch(expected: EventKind, event: &AgentEvent) -> ServiceWorkerError {
    ServiceWorkerError::StateError(format!(
        "{:?} handler received {:?} event",
        expected,
        event.kind()
    ))
}

fn on_install(
    agent: &Agent,
    event: AgentEvent,
) -> BoxFuture<'_, Result<EventOutcome, ServiceWorkerError>> {
    async move {
        if !matches!(event, AgentEvent::Install) {
            return Err(mismatch(EventKind::Install, &event));
        }
        let report = agent.lifecycle.install(&agent.ctx).await?;
        Ok(EventOutcome::Installed(report))
    }
    .boxed()
}

fn on_activate(
    agent: &Agent,
    event: AgentEvent,
) -> BoxFuture<'_, Result<EventOutcome, ServiceWorkerError>> {
    async move {
        if !matches!(event, AgentEvent::Activate) {
            return Err(mismatch(EventKind::Activate, &event));
        }
        let report = agent.lifecycle.activate(&agent.ctx, &agent.notifier).await?;
        Ok(EventOutcome::Activated(report))
    }
    .boxed()
}

fn on_fetch(
    agent: &Agent,
    event: AgentEvent,
) -> BoxFuture<'_, Result<EventOutcome, ServiceWorkerError>> {
    async move {
        let request = match event {
            AgentEvent::Fetch(request) => request,
            other => return Err(mismatch(EventKind::Fetch, &other)),
        };
        let disposition = agent
            .router
            .handle(&agent.ctx, &agent.pending, request)
            .await?;
        Ok(EventOutcome::Fetch(disposition))
    }
    .boxed()
}

fn on_message(
    agent: &Agent,
    event: AgentEvent,
) -> BoxFuture<'_, Result<EventOutcome, ServiceWorkerError>> {
    async move {
        let message = match event {
            AgentEvent::Message(message) => message,
            other => return Err(mismatch(EventKind::Message, &other)),
        };
        Ok(match agent.notifier.handle_message(&agent.ctx, message).await? {
            Some(_) => EventOutcome::Completed,
            None => EventOutcome::Unhandled,
        })
    }
    .boxed()
}

fn on_push(
    agent: &Agent,
    event: AgentEvent,
) -> BoxFuture<'_, Result<EventOutcome, ServiceWorkerError>> {
    async move {
        let push = match event {
            AgentEvent::Push(push) => push,
            other => return Err(mismatch(EventKind::Push, &other)),
        };
        let shown = agent.push.on_push(&agent.ctx, &push).await?;
        Ok(EventOutcome::Notified(shown))
    }
    .boxed()
}

fn on_notification_click(
    agent: &Agent,
    event: AgentEvent,
) -> BoxFuture<'_, Result<EventOutcome, ServiceWorkerError>> {
    async move {
        let click = match event {
            AgentEvent::NotificationClick(click) => click,
            other => return Err(mismatch(EventKind::NotificationClick, &other)),
        };
        let outcome = agent.push.on_notification_click(&agent.ctx, &click).await?;
        Ok(EventOutcome::Clicked(outcome))
    }
    .boxed()
}

fn on_sync(
    agent: &Agent,
    event: AgentEvent,
) -> BoxFuture<'_, Result<EventOutcome, ServiceWorkerError>> {
    async move {
        let sync = match event {
            AgentEvent::Sync(sync) => sync,
            other => return Err(mismatch(EventKind::Sync, &other)),
        };
        Ok(agent
            .sync
            .on_sync(&agent.ctx, &agent.notifier, &sync)
            .await
            .map_or(EventOutcome::Unhandled, EventOutcome::Broadcast))
    }
    .boxed()
}

fn on_periodic_sync(
    agent: &Agent,
    event: AgentEvent,
) -> BoxFuture<'_, Result<EventOutcome, ServiceWorkerError>> {
    async move {
        let sync = match event {
            AgentEvent::PeriodicSync(sync) => sync,
            other => return Err(mismatch(EventKind::PeriodicSync, &other)),
        };
        Ok(agent
            .sync
            .on_periodic_sync(&agent.ctx, &agent.notifier, &sync)
            .await
            .map_or(EventOutcome::Unhandled, EventOutcome::Broadcast))
    }
    .boxed()
}

// ==================== Agent ====================

/// One agent instance, bound to one deployed version.
pub struct Agent {
    config: AgentConfig,
    ctx: AgentContext,
    table: DispatchTable,
    pending: PendingWork,
    lifecycle: LifecycleController,
    router: StrategyRouter,
    notifier: ClientNotifier,
    push: PushGateway,
    sync: DeferredRetryTrigger,
}

impl Agent {
    /// Create an agent with the standard dispatch table.
    pub fn new(config: AgentConfig, ctx: AgentContext) -> Result<Self, ServiceWorkerError> {
        Self::with_table(config, ctx, DispatchTable::standard())
    }

    /// Create an agent with a custom dispatch table.
    pub fn with_table(
        config: AgentConfig,
        ctx: AgentContext,
        table: DispatchTable,
    ) -> Result<Self, ServiceWorkerError> {
        config.validate()?;
        Ok(Self {
            lifecycle: LifecycleController::new(config.clone()),
            router: StrategyRouter::new(config.clone()),
            notifier: ClientNotifier::new(&config),
            push: PushGateway::new(&config),
            sync: DeferredRetryTrigger::new(&config),
            pending: PendingWork::new(),
            config,
            ctx,
            table,
        })
    }

    /// Run the handler registered for the event's kind.
    #[instrument(skip_all, fields(version = %self.config.version, kind = ?event.kind()))]
    pub async fn dispatch(&self, event: AgentEvent) -> Result<EventOutcome, ServiceWorkerError> {
        match self.table.get(event.kind()) {
            Some(handler) => handler(self, event).await,
            None => {
                debug!("No handler registered");
                Ok(EventOutcome::Unhandled)
            }
        }
    }

    /// Wait for background work started by handlers. Returns how many tasks
    /// completed.
    pub async fn settle(&self) -> usize {
        self.pending.settle().await
    }

    /// Mark this agent as replaced. It stops starting background cache
    /// writes; writes already running finish on [`settle`](Self::settle).
    pub async fn supersede(&self) {
        self.pending.close();
        self.lifecycle.supersede().await;
    }

    pub async fn state(&self) -> LifecycleState {
        self.lifecycle.state().await
    }

    pub fn version(&self) -> VersionInfo {
        self.config.version_info()
    }

    /// Bucket this agent reads and writes.
    pub fn cache_name(&self) -> String {
        self.config.cache_name()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn context(&self) -> &AgentContext {
        &self.ctx
    }

    pub fn dispatch_table(&self) -> &DispatchTable {
        &self.table
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("version", &self.config.version)
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStorage;
    use crate::clients::ClientRegistry;
    use crate::host::HostRegistration;
    use ffkit_net::StaticNetwork;
    use std::sync::Arc;
    use url::Url;

    fn agent_with(table: DispatchTable) -> Agent {
        let (clients, _client_events) = ClientRegistry::new();
        let (registration, _registration_events) = HostRegistration::new(true);
        let ctx = AgentContext::new(
            Arc::new(StaticNetwork::new()),
            Arc::new(MemoryCacheStorage::new()),
            Arc::new(clients),
            Arc::new(registration),
        );
        let config = AgentConfig::new(Url::parse("https://ff.test/").unwrap(), "1.0.0", false);
        Agent::with_table(config, ctx, table).unwrap()
    }

    #[test]
    fn test_standard_table_covers_every_kind() {
        assert_eq!(DispatchTable::standard().kinds(), EventKind::ALL.to_vec());
    }

    #[test]
    fn test_event_kind() {
        assert_eq!(AgentEvent::Install.kind(), EventKind::Install);
        assert_eq!(
            AgentEvent::PeriodicSync(SyncEvent::new("check-updates")).kind(),
            EventKind::PeriodicSync
        );
    }

    #[tokio::test]
    async fn test_missing_handler_is_unhandled() {
        let agent = agent_with(DispatchTable::new());
        let outcome = agent.dispatch(AgentEvent::Install).await.unwrap();
        assert!(matches!(outcome, EventOutcome::Unhandled));
        assert_eq!(agent.state().await, LifecycleState::Installing);
    }

    #[tokio::test]
    async fn test_handler_rejects_wrong_event() {
        let mut table = DispatchTable::new();
        table.register(EventKind::Install, on_fetch);
        let agent = agent_with(table);

        let result = agent.dispatch(AgentEvent::Install).await;
        assert!(matches!(result, Err(ServiceWorkerError::StateError(_))));
    }

    #[tokio::test]
    async fn test_replaced_handler_is_used() {
        fn always_completed(
            _agent: &Agent,
            _event: AgentEvent,
        ) -> BoxFuture<'_, Result<EventOutcome, ServiceWorkerError>> {
            async { Ok(EventOutcome::Completed) }.boxed()
        }

        let mut table = DispatchTable::standard();
        assert!(table.register(EventKind::Push, always_completed).is_some());
        let agent = agent_with(table);

        let outcome = agent.dispatch(AgentEvent::Push(PushEvent::empty())).await.unwrap();
        assert!(matches!(outcome, EventOutcome::Completed));
    }

    #[tokio::test]
    async fn test_unknown_sync_tag_is_unhandled() {
        let agent = agent_with(DispatchTable::standard());
        let outcome = agent
            .dispatch(AgentEvent::Sync(SyncEvent::new("nope")))
            .await
            .unwrap();
        assert!(matches!(outcome, EventOutcome::Unhandled));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let (clients, _) = ClientRegistry::new();
        let (registration, _) = HostRegistration::new(true);
        let ctx = AgentContext::new(
            Arc::new(StaticNetwork::new()),
            Arc::new(MemoryCacheStorage::new()),
            Arc::new(clients),
            Arc::new(registration),
        );
        let mut config = AgentConfig::default();
        config.version = String::new();
        assert!(matches!(
            Agent::new(config, ctx),
            Err(ServiceWorkerError::ConfigError(_))
        ));
    }
}
