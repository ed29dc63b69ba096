//! Open pages the agent can address.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace};
use url::Url;

use crate::message::LifecycleNotification;
use crate::ServiceWorkerError;

// ==================== Client ====================

/// Identifier of an open page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    fn new() -> Self {
        Self(format!("client-{}", uuid_simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    SharedWorker,
    All,
}

/// Visibility state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VisibilityState {
    Hidden,
    Visible,
}

/// A snapshot of an open page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: ClientId,
    pub url: Url,
    pub client_type: ClientType,
    pub visibility_state: VisibilityState,
    pub focused: bool,
    /// Whether the page is controlled by the active agent.
    pub controlled: bool,
}

/// Options for [`Clients::match_all`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientMatchOptions {
    pub include_uncontrolled: bool,
    pub client_type: ClientType,
}

impl ClientMatchOptions {
    /// Every window, controlled or not.
    pub fn all_windows() -> Self {
        Self {
            include_uncontrolled: true,
            client_type: ClientType::Window,
        }
    }

    fn accepts(&self, client: &Client) -> bool {
        if !self.include_uncontrolled && !client.controlled {
            return false;
        }
        match self.client_type {
            ClientType::All => true,
            t => client.client_type == t,
        }
    }
}

// ==================== Clients ====================

/// Access to open pages.
#[async_trait]
pub trait Clients: Send + Sync {
    /// Pages matching `options`, ordered by id.
    async fn match_all(&self, options: ClientMatchOptions) -> Vec<Client>;

    /// Deliver a notification to one page.
    async fn post_message(
        &self,
        id: &ClientId,
        notification: LifecycleNotification,
    ) -> Result<(), ServiceWorkerError>;

    /// Bring a window to the foreground.
    async fn focus(&self, id: &ClientId) -> Result<Client, ServiceWorkerError>;

    /// Open a new window at `url`.
    async fn open_window(&self, url: &Url) -> Result<Client, ServiceWorkerError>;

    /// Take control of every open page. Returns how many changed controller.
    async fn claim(&self) -> Result<usize, ServiceWorkerError>;
}

/// Events raised by the registry for the host.
#[derive(Debug)]
pub enum ClientEvent {
    /// The agent opened a window; the handle receives its notifications.
    Opened(PageHandle),
    /// A window was focused.
    Focused(ClientId),
    /// Pages were claimed.
    Claimed { count: usize },
}

/// The page side of a client: receives the agent's notifications.
#[derive(Debug)]
pub struct PageHandle {
    pub client_id: ClientId,
    pub url: Url,
    rx: mpsc::UnboundedReceiver<LifecycleNotification>,
}

impl PageHandle {
    /// Receive the next notification, waiting if none is queued.
    pub async fn recv(&mut self) -> Option<LifecycleNotification> {
        self.rx.recv().await
    }

    /// Receive a queued notification without waiting.
    pub fn try_recv(&mut self) -> Option<LifecycleNotification> {
        self.rx.try_recv().ok()
    }

    /// Drain every queued notification.
    pub fn drain(&mut self) -> Vec<LifecycleNotification> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

struct Page {
    client: Client,
    tx: mpsc::UnboundedSender<LifecycleNotification>,
}

/// In-memory registry of open pages.
pub struct ClientRegistry {
    pages: RwLock<HashMap<ClientId, Page>>,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
}

impl ClientRegistry {
    /// Create a new registry.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                pages: RwLock::new(HashMap::new()),
                event_tx,
            },
            event_rx,
        )
    }

    /// Register an open window at `url`.
    pub async fn connect(&self, url: Url, controlled: bool) -> PageHandle {
        let (client, tx, handle) = new_page(url, controlled, false);
        debug!(client = %client.id, url = %client.url, controlled, "Page connected");
        self.pages
            .write()
            .await
            .insert(client.id.clone(), Page { client, tx });
        handle
    }

    /// Remove a page. Returns its last snapshot.
    pub async fn disconnect(&self, id: &ClientId) -> Option<Client> {
        self.pages.write().await.remove(id).map(|page| page.client)
    }

    /// Get a page by id.
    pub async fn get(&self, id: &ClientId) -> Option<Client> {
        self.pages.read().await.get(id).map(|page| page.client.clone())
    }

    /// Number of open pages.
    pub async fn len(&self) -> usize {
        self.pages.read().await.len()
    }

    /// Whether no page is open.
    pub async fn is_empty(&self) -> bool {
        self.pages.read().await.is_empty()
    }
}

fn new_page(
    url: Url,
    controlled: bool,
    focused: bool,
) -> (
    Client,
    mpsc::UnboundedSender<LifecycleNotification>,
    PageHandle,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let client = Client {
        id: ClientId::new(),
        url: url.clone(),
        client_type: ClientType::Window,
        visibility_state: VisibilityState::Visible,
        focused,
        controlled,
    };
    let handle = PageHandle {
        client_id: client.id.clone(),
        url,
        rx,
    };
    (client, tx, handle)
}

#[async_trait]
impl Clients for ClientRegistry {
    async fn match_all(&self, options: ClientMatchOptions) -> Vec<Client> {
        let mut matched: Vec<Client> = self
            .pages
            .read()
            .await
            .values()
            .map(|page| &page.client)
            .filter(|client| options.accepts(client))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        matched
    }

    async fn post_message(
        &self,
        id: &ClientId,
        notification: LifecycleNotification,
    ) -> Result<(), ServiceWorkerError> {
        let mut pages = self.pages.write().await;
        let page = pages
            .get(id)
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("client {}", id)))?;

        trace!(client = %id, ?notification, "Posting to page");
        if page.tx.send(notification).is_err() {
            pages.remove(id);
            return Err(ServiceWorkerError::ClientError(format!(
                "client {} has gone away",
                id
            )));
        }
        Ok(())
    }

    async fn focus(&self, id: &ClientId) -> Result<Client, ServiceWorkerError> {
        let mut pages = self.pages.write().await;
        let client_type = pages
            .get(id)
            .map(|page| page.client.client_type)
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("client {}", id)))?;

        if client_type != ClientType::Window {
            return Err(ServiceWorkerError::StateError(
                "Can only focus window clients".to_string(),
            ));
        }

        let mut focused = None;
        for page in pages.values_mut() {
            page.client.focused = &page.client.id == id;
            if page.client.focused {
                page.client.visibility_state = VisibilityState::Visible;
                focused = Some(page.client.clone());
            }
        }

        let _ = self.event_tx.send(ClientEvent::Focused(id.clone()));
        focused.ok_or_else(|| ServiceWorkerError::NotFound(format!("client {}", id)))
    }

    async fn open_window(&self, url: &Url) -> Result<Client, ServiceWorkerError> {
        let (client, tx, handle) = new_page(url.clone(), true, true);

        let mut pages = self.pages.write().await;
        for page in pages.values_mut() {
            page.client.focused = false;
        }
        pages.insert(
            client.id.clone(),
            Page {
                client: client.clone(),
                tx,
            },
        );
        drop(pages);

        debug!(client = %client.id, url = %url, "Window opened");
        let _ = self.event_tx.send(ClientEvent::Opened(handle));
        Ok(client)
    }

    async fn claim(&self) -> Result<usize, ServiceWorkerError> {
        let mut count = 0;
        for page in self.pages.write().await.values_mut() {
            if !page.client.controlled {
                page.client.controlled = true;
                count += 1;
            }
        }
        let _ = self.event_tx.send(ClientEvent::Claimed { count });
        Ok(count)
    }
}

// ==================== Helpers ====================

/// Generate a simple UUID-like string.
fn uuid_simple() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!(
        "{:016x}-{:04x}",
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(path: &str) -> Url {
        Url::parse("https://ff.test").unwrap().join(path).unwrap()
    }

    #[tokio::test]
    async fn test_match_all_filters_uncontrolled() {
        let (registry, _events) = ClientRegistry::new();
        registry.connect(url("/"), true).await;
        registry.connect(url("/menu"), false).await;

        let controlled = registry.match_all(ClientMatchOptions::default()).await;
        assert_eq!(controlled.len(), 1);
        assert_eq!(controlled[0].url, url("/"));

        let all = registry.match_all(ClientMatchOptions::all_windows()).await;
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_post_message_reaches_page() {
        let (registry, _events) = ClientRegistry::new();
        let mut page = registry.connect(url("/"), true).await;

        registry
            .post_message(&page.client_id, LifecycleNotification::SyncPosts)
            .await
            .unwrap();

        assert_eq!(page.try_recv(), Some(LifecycleNotification::SyncPosts));
        assert_eq!(page.try_recv(), None);
    }

    #[tokio::test]
    async fn test_post_message_to_closed_page() {
        let (registry, _events) = ClientRegistry::new();
        let page = registry.connect(url("/"), true).await;
        let id = page.client_id.clone();
        drop(page);

        assert!(registry
            .post_message(&id, LifecycleNotification::SyncPosts)
            .await
            .is_err());
        assert!(registry.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_focus_moves_focus() {
        let (registry, mut events) = ClientRegistry::new();
        let a = registry.connect(url("/"), true).await;
        let b = registry.connect(url("/menu"), true).await;

        let focused = registry.focus(&b.client_id).await.unwrap();
        assert!(focused.focused);
        assert!(!registry.get(&a.client_id).await.unwrap().focused);
        assert!(matches!(events.try_recv(), Ok(ClientEvent::Focused(id)) if id == b.client_id));
    }

    #[tokio::test]
    async fn test_open_window_emits_handle() {
        let (registry, mut events) = ClientRegistry::new();
        let client = registry.open_window(&url("/menu")).await.unwrap();

        assert!(client.focused);
        assert!(client.controlled);
        match events.try_recv() {
            Ok(ClientEvent::Opened(handle)) => assert_eq!(handle.client_id, client.id),
            other => panic!("expected Opened, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_claim_counts_newly_controlled() {
        let (registry, _events) = ClientRegistry::new();
        registry.connect(url("/"), true).await;
        registry.connect(url("/menu"), false).await;
        registry.connect(url("/events"), false).await;

        assert_eq!(registry.claim().await.unwrap(), 2);
        assert_eq!(registry.match_all(ClientMatchOptions::default()).await.len(), 3);
        assert_eq!(registry.claim().await.unwrap(), 0);
    }
}
