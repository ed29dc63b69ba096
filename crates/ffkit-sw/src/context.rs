//! Capabilities handed to the agent by its host.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ffkit_common::with_optional_timeout;
use ffkit_net::{Fetch, Request, Response};
use tokio::task::JoinSet;
use tracing::{trace, warn};

use crate::cache::CacheStorage;
use crate::clients::Clients;
use crate::push::Notification;
use crate::ServiceWorkerError;

/// The agent's own registration, as exposed by the host.
#[async_trait]
pub trait Registration: Send + Sync {
    /// Ask the host to activate this agent without waiting.
    async fn skip_waiting(&self) -> Result<(), ServiceWorkerError>;

    /// Show a notification. A notification with the same tag replaces the
    /// previous one.
    async fn show_notification(&self, notification: Notification) -> Result<(), ServiceWorkerError>;

    /// Dismiss the notification with `tag`.
    async fn close_notification(&self, tag: &str) -> Result<(), ServiceWorkerError>;

    /// Whether the host can fire background sync events.
    fn supports_background_sync(&self) -> bool;

    /// Register a one-off sync fired when connectivity returns.
    async fn register_sync(&self, tag: &str) -> Result<(), ServiceWorkerError>;
}

/// Everything the agent can reach outside itself.
#[derive(Clone)]
pub struct AgentContext {
    pub network: Arc<dyn Fetch>,
    pub caches: Arc<dyn CacheStorage>,
    pub clients: Arc<dyn Clients>,
    pub registration: Arc<dyn Registration>,
}

impl AgentContext {
    pub fn new(
        network: Arc<dyn Fetch>,
        caches: Arc<dyn CacheStorage>,
        clients: Arc<dyn Clients>,
        registration: Arc<dyn Registration>,
    ) -> Self {
        Self {
            network,
            caches,
            clients,
            registration,
        }
    }

    /// Fetch from the network, giving up after `timeout`.
    pub async fn fetch(
        &self,
        request: &Request,
        timeout: Option<Duration>,
    ) -> Result<Response, ServiceWorkerError> {
        let response = with_optional_timeout(timeout, || self.network.fetch(request)).await??;
        Ok(response)
    }
}

/// Background work an event handler extended its lifetime with.
///
/// The agent must not be terminated while work is pending; [`settle`]
/// waits for all of it. Once [`close`]d, new work is refused.
///
/// The task set lock is never held across an await.
///
/// [`settle`]: PendingWork::settle
/// [`close`]: PendingWork::close
#[derive(Default)]
pub struct PendingWork {
    tasks: Mutex<JoinSet<()>>,
    closed: AtomicBool,
}

impl PendingWork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the agent alive until `work` finishes. Returns `false`, dropping
    /// `work` unstarted, when closed.
    pub fn wait_until<F>(&self, work: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            return false;
        }
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        // Reap finished tasks so the set does not grow without bound.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(work);
        true
    }

    /// Wait for every pending task, including tasks added while settling.
    /// Returns how many completed.
    pub async fn settle(&self) -> usize {
        let mut settled = 0;
        loop {
            let mut batch = {
                let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
                std::mem::take(&mut *tasks)
            };
            if batch.is_empty() {
                break;
            }
            while let Some(result) = batch.join_next().await {
                if let Err(e) = result {
                    warn!(error = %e, "Pending task failed");
                }
                settled += 1;
            }
        }
        trace!(settled, "Pending work settled");
        settled
    }

    /// Refuse new work. Work already started still runs.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of tasks not yet reaped.
    pub fn pending(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_settle_waits_for_work() {
        let pending = PendingWork::new();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let done = done.clone();
            assert!(pending.wait_until(async move {
                tokio::task::yield_now().await;
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }

        assert_eq!(pending.settle().await, 3);
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert_eq!(pending.pending(), 0);
    }

    #[tokio::test]
    async fn test_settle_survives_panicking_task() {
        let pending = PendingWork::new();
        pending.wait_until(async { panic!("boom") });
        pending.wait_until(async {});
        assert!(pending.settle().await >= 1);
        assert_eq!(pending.pending(), 0);
    }

    #[tokio::test]
    async fn test_wait_until_does_not_block_during_settle() {
        let pending = Arc::new(PendingWork::new());
        let (release, held) = oneshot::channel::<()>();
        pending.wait_until(async move {
            let _ = held.await;
        });

        let settling = tokio::spawn({
            let pending = pending.clone();
            async move { pending.settle().await }
        });
        tokio::task::yield_now().await;

        // Work can still be added while a settle is parked on a slow task.
        assert!(pending.wait_until(async {}));

        release.send(()).unwrap();
        assert_eq!(settling.await.unwrap(), 2);
        assert_eq!(pending.pending(), 0);
    }

    #[tokio::test]
    async fn test_closed_work_is_refused() {
        let pending = PendingWork::new();
        let ran = Arc::new(AtomicUsize::new(0));
        pending.close();

        let counter = ran.clone();
        assert!(!pending.wait_until(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(pending.settle().await, 0);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
