//! Control channel between pages and the agent.

use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::clients::{ClientId, ClientMatchOptions};
use crate::config::AgentConfig;
use crate::context::AgentContext;
use crate::message::{ControlMessage, LifecycleNotification, MessageEvent};
use crate::version::VersionInfo;
use crate::ServiceWorkerError;

/// Handles page commands and fans notifications out to pages.
#[derive(Debug, Clone)]
pub struct ClientNotifier {
    version: VersionInfo,
    retry_tag: String,
}

impl ClientNotifier {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            version: config.version_info(),
            retry_tag: config.sync.retry.clone(),
        }
    }

    /// Handle a page message. Returns the command it carried, or `None` when
    /// the message is not a command.
    pub async fn handle_message(
        &self,
        ctx: &AgentContext,
        event: MessageEvent,
    ) -> Result<Option<ControlMessage>, ServiceWorkerError> {
        let Some(command) = ControlMessage::parse(&event.data) else {
            debug!(data = %event.data, "Ignoring unrecognised message");
            return Ok(None);
        };

        match command {
            ControlMessage::SkipWaiting => {
                info!("Skip waiting requested");
                ctx.registration.skip_waiting().await?;
            }
            ControlMessage::GetVersion => {
                let reply = serde_json::to_value(&self.version).unwrap_or(JsonValue::Null);
                match event.ports.into_iter().next() {
                    Some(port) => port.post_message(reply)?,
                    None => warn!("GET_VERSION without a reply port"),
                }
            }
            ControlMessage::TriggerSync => {
                self.trigger_sync(ctx, event.source.as_ref()).await?;
            }
        }

        Ok(Some(command))
    }

    /// Register the deferred-retry task, or tell the page to retry itself
    /// when the platform cannot.
    async fn trigger_sync(
        &self,
        ctx: &AgentContext,
        source: Option<&ClientId>,
    ) -> Result<(), ServiceWorkerError> {
        if ctx.registration.supports_background_sync() {
            match ctx.registration.register_sync(&self.retry_tag).await {
                Ok(()) => {
                    debug!(tag = %self.retry_tag, "Background sync registered");
                    return Ok(());
                }
                Err(e) => warn!(error = %e, "Background sync registration failed"),
            }
        } else {
            debug!("Background sync unsupported, asking page to retry");
        }

        match source {
            Some(client) => self.notify(ctx, client, LifecycleNotification::SyncPosts).await,
            None => {
                self.broadcast(ctx, LifecycleNotification::SyncPosts).await;
                Ok(())
            }
        }
    }

    /// Send a notification to one page.
    pub async fn notify(
        &self,
        ctx: &AgentContext,
        client: &ClientId,
        notification: LifecycleNotification,
    ) -> Result<(), ServiceWorkerError> {
        ctx.clients.post_message(client, notification).await
    }

    /// Send a notification to every controlled page. Returns how many
    /// received it.
    pub async fn broadcast(&self, ctx: &AgentContext, notification: LifecycleNotification) -> usize {
        let clients = ctx.clients.match_all(ClientMatchOptions::default()).await;
        let mut delivered = 0;
        for client in &clients {
            match ctx.clients.post_message(&client.id, notification.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(client = %client.id, error = %e, "Failed to notify page"),
            }
        }
        debug!(?notification, delivered, total = clients.len(), "Broadcast");
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStorage;
    use crate::clients::ClientRegistry;
    use crate::host::HostRegistration;
    use crate::message::ReplyPort;
    use ffkit_net::StaticNetwork;
    use serde_json::json;
    use std::sync::Arc;
    use url::Url;

    struct Fixture {
        ctx: AgentContext,
        clients: Arc<ClientRegistry>,
        registration: Arc<HostRegistration>,
        notifier: ClientNotifier,
    }

    fn fixture(background_sync: bool) -> Fixture {
        let (clients, _) = ClientRegistry::new();
        let (registration, _) = HostRegistration::new(background_sync);
        let clients = Arc::new(clients);
        let registration = Arc::new(registration);
        let ctx = AgentContext::new(
            Arc::new(StaticNetwork::new()),
            Arc::new(MemoryCacheStorage::new()),
            clients.clone(),
            registration.clone(),
        );
        let config = AgentConfig::new(Url::parse("https://ff.test/").unwrap(), "2.1.0", true);
        Fixture {
            ctx,
            clients,
            registration,
            notifier: ClientNotifier::new(&config),
        }
    }

    fn page_url() -> Url {
        Url::parse("https://ff.test/").unwrap()
    }

    #[tokio::test]
    async fn test_get_version_replies_on_port() {
        let f = fixture(true);
        let (port, mut rx) = ReplyPort::channel();
        let event = MessageEvent::new(json!({ "type": "GET_VERSION" }), None).with_port(port);

        let handled = f.notifier.handle_message(&f.ctx, event).await.unwrap();
        assert_eq!(handled, Some(ControlMessage::GetVersion));
        assert_eq!(
            rx.try_recv().unwrap(),
            json!({ "version": "2.1.0", "isCritical": true })
        );
    }

    #[tokio::test]
    async fn test_skip_waiting_reaches_registration() {
        let f = fixture(true);
        let event = MessageEvent::new(json!({ "type": "SKIP_WAITING" }), None);
        f.notifier.handle_message(&f.ctx, event).await.unwrap();
        assert!(f.registration.take_skip_waiting());
    }

    #[tokio::test]
    async fn test_unknown_message_is_ignored() {
        let f = fixture(true);
        let event = MessageEvent::new(json!({ "type": "HELLO" }), None);
        assert_eq!(f.notifier.handle_message(&f.ctx, event).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_trigger_sync_registers_tag() {
        let f = fixture(true);
        let mut page = f.clients.connect(page_url(), true).await;
        let event = MessageEvent::new(
            json!({ "type": "TRIGGER_SYNC" }),
            Some(page.client_id.clone()),
        );

        f.notifier.handle_message(&f.ctx, event).await.unwrap();
        assert_eq!(f.registration.sync_tags().await, vec!["sync-posts"]);
        assert!(page.drain().is_empty());
    }

    #[tokio::test]
    async fn test_trigger_sync_without_support_tells_page() {
        let f = fixture(false);
        let mut page = f.clients.connect(page_url(), true).await;
        let mut other = f.clients.connect(page_url(), true).await;
        let event = MessageEvent::new(
            json!({ "type": "TRIGGER_SYNC" }),
            Some(page.client_id.clone()),
        );

        f.notifier.handle_message(&f.ctx, event).await.unwrap();
        assert!(f.registration.sync_tags().await.is_empty());
        assert_eq!(page.drain(), vec![LifecycleNotification::SyncPosts]);
        assert!(other.drain().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_controlled_pages() {
        let f = fixture(true);
        let mut a = f.clients.connect(page_url(), true).await;
        let mut b = f.clients.connect(page_url(), false).await;

        let delivered = f
            .notifier
            .broadcast(&f.ctx, LifecycleNotification::CheckUpdates)
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(a.drain(), vec![LifecycleNotification::CheckUpdates]);
        assert!(b.drain().is_empty());
    }
}
