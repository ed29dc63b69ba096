//! Background sync wake-ups.
//!
//! The agent keeps no queue of failed writes. A wake-up only tells pages to
//! replay their own.

use tracing::{debug, info};

use crate::config::{AgentConfig, SyncTags};
use crate::context::AgentContext;
use crate::message::LifecycleNotification;
use crate::notifier::ClientNotifier;

/// A sync or periodic-sync wake-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEvent {
    pub tag: String,
}

impl SyncEvent {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

/// Turns wake-ups into page notifications.
#[derive(Debug, Clone)]
pub struct DeferredRetryTrigger {
    tags: SyncTags,
}

impl DeferredRetryTrigger {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            tags: config.sync.clone(),
        }
    }

    /// Connectivity returned. Returns how many pages were told to retry, or
    /// `None` for an unknown tag.
    pub async fn on_sync(
        &self,
        ctx: &AgentContext,
        notifier: &ClientNotifier,
        event: &SyncEvent,
    ) -> Option<usize> {
        if event.tag != self.tags.retry {
            debug!(tag = %event.tag, "Ignoring sync tag");
            return None;
        }
        info!(tag = %event.tag, "Asking pages to replay pending writes");
        Some(notifier.broadcast(ctx, LifecycleNotification::SyncPosts).await)
    }

    /// Scheduled wake-up. Returns how many pages were told to check for
    /// updates, or `None` for an unknown tag.
    pub async fn on_periodic_sync(
        &self,
        ctx: &AgentContext,
        notifier: &ClientNotifier,
        event: &SyncEvent,
    ) -> Option<usize> {
        if event.tag != self.tags.update_check {
            debug!(tag = %event.tag, "Ignoring periodic sync tag");
            return None;
        }
        info!(tag = %event.tag, "Asking pages to check for updates");
        Some(notifier.broadcast(ctx, LifecycleNotification::CheckUpdates).await)
    }
}
