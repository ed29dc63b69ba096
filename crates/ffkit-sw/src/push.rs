//! Push delivery and notification clicks.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, info, warn};
use url::Url;

use crate::clients::{ClientId, ClientMatchOptions};
use crate::config::{AgentConfig, NotificationDefaults};
use crate::context::AgentContext;
use crate::ServiceWorkerError;

/// Option keys the gateway owns; a payload cannot override them.
const RESERVED_OPTIONS: &[&str] = &["tag", "vibrate", "requireInteraction", "data"];

// ==================== Payloads ====================

/// JSON pushed by the notification service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushPayload {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub badge: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    /// Page to focus or open on click.
    #[serde(default)]
    pub url: Option<String>,
    /// Any other display options, passed through.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

/// Where a click on a notification leads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationTarget {
    pub url: String,
}

/// Display options of a rendered notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationOptions {
    pub body: String,
    pub icon: String,
    pub badge: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub tag: String,
    pub vibrate: Vec<u32>,
    pub require_interaction: bool,
    pub data: NotificationTarget,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

/// A notification as handed to the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub options: NotificationOptions,
}

impl Notification {
    /// Replacement tag.
    pub fn tag(&self) -> &str {
        &self.options.tag
    }

    /// Click target.
    pub fn target(&self) -> &NotificationTarget {
        &self.options.data
    }
}

// ==================== Events ====================

/// A push delivery.
#[derive(Debug, Clone, Default)]
pub struct PushEvent {
    pub data: Option<Bytes>,
}

impl PushEvent {
    /// Push with a raw body.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: Some(data.into()),
        }
    }

    /// Push carrying a JSON body.
    pub fn json(value: &JsonValue) -> Self {
        Self::new(value.to_string())
    }

    /// Push without a body.
    pub fn empty() -> Self {
        Self::default()
    }
}

/// A user click on a shown notification.
#[derive(Debug, Clone)]
pub struct NotificationClickEvent {
    pub notification: Notification,
    /// Action button pressed, if any.
    pub action: Option<String>,
}

impl NotificationClickEvent {
    pub fn new(notification: Notification) -> Self {
        Self {
            notification,
            action: None,
        }
    }
}

/// What a click did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
    /// An open page was already showing the target.
    Focused(ClientId),
    /// A new page was opened at the target.
    Opened(ClientId),
}

// ==================== Gateway ====================

/// Renders pushes and routes clicks.
#[derive(Debug, Clone)]
pub struct PushGateway {
    defaults: NotificationDefaults,
    origin: Url,
}

impl PushGateway {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            defaults: config.notifications.clone(),
            origin: config.origin.clone(),
        }
    }

    /// Render a push into a notification. Empty or malformed pushes yield
    /// `None`.
    pub fn build_notification(&self, event: &PushEvent) -> Option<Notification> {
        let data = event.data.as_ref()?;

        let payload: PushPayload = match serde_json::from_slice(data) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed push payload");
                return None;
            }
        };

        let defaults = &self.defaults;
        let or_default = |value: Option<String>, default: &str| {
            value
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let mut extra = payload.extra;
        extra.retain(|key, _| !RESERVED_OPTIONS.contains(&key.as_str()));

        Some(Notification {
            title: or_default(payload.title, &defaults.title),
            options: NotificationOptions {
                body: or_default(payload.body, &defaults.body),
                icon: or_default(payload.icon, &defaults.icon),
                badge: or_default(payload.badge, &defaults.badge),
                image: payload.image,
                tag: defaults.tag.clone(),
                vibrate: defaults.vibrate.clone(),
                require_interaction: defaults.require_interaction,
                data: NotificationTarget {
                    url: or_default(payload.url, &defaults.url),
                },
                extra,
            },
        })
    }

    /// Show the notification for a push. Returns what was shown.
    pub async fn on_push(
        &self,
        ctx: &AgentContext,
        event: &PushEvent,
    ) -> Result<Option<Notification>, ServiceWorkerError> {
        let Some(notification) = self.build_notification(event) else {
            debug!("Push without usable payload");
            return Ok(None);
        };

        info!(title = %notification.title, tag = notification.tag(), "Showing notification");
        ctx.registration
            .show_notification(notification.clone())
            .await?;
        Ok(Some(notification))
    }

    /// Close the clicked notification, then focus a page already at its
    /// target or open a new one.
    pub async fn on_notification_click(
        &self,
        ctx: &AgentContext,
        event: &NotificationClickEvent,
    ) -> Result<ClickOutcome, ServiceWorkerError> {
        let notification = &event.notification;
        if let Err(e) = ctx.registration.close_notification(notification.tag()).await {
            warn!(error = %e, tag = notification.tag(), "Failed to close notification");
        }

        let target = self
            .origin
            .join(&notification.target().url)
            .map_err(|e| {
                ServiceWorkerError::ClientError(format!(
                    "bad notification target {}: {}",
                    notification.target().url,
                    e
                ))
            })?;

        let windows = ctx.clients.match_all(ClientMatchOptions::all_windows()).await;
        if let Some(client) = windows.iter().find(|client| client.url == target) {
            debug!(client = %client.id, url = %target, "Focusing open page");
            let focused = ctx.clients.focus(&client.id).await?;
            return Ok(ClickOutcome::Focused(focused.id));
        }

        debug!(url = %target, "Opening page");
        let opened = ctx.clients.open_window(&target).await?;
        Ok(ClickOutcome::Opened(opened.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gateway() -> PushGateway {
        PushGateway::new(&AgentConfig::new(
            Url::parse("https://ff.test/").unwrap(),
            "1.0.0",
            false,
        ))
    }

    #[test]
    fn test_empty_push_is_ignored() {
        assert!(gateway().build_notification(&PushEvent::empty()).is_none());
    }

    #[test]
    fn test_malformed_push_is_ignored() {
        let gw = gateway();
        assert!(gw.build_notification(&PushEvent::new("not json")).is_none());
        assert!(gw.build_notification(&PushEvent::json(&json!([1, 2]))).is_none());
    }

    #[test]
    fn test_payload_fields_and_defaults() {
        let notification = gateway()
            .build_notification(&PushEvent::json(&json!({
                "title": "Special!",
                "url": "/menu",
                "image": "/img/fish.jpg",
            })))
            .unwrap();

        assert_eq!(notification.title, "Special!");
        assert_eq!(notification.options.body, "New update available!");
        assert_eq!(notification.options.icon, "/logo192.png");
        assert_eq!(notification.options.image.as_deref(), Some("/img/fish.jpg"));
        assert_eq!(notification.options.vibrate, vec![200, 100, 200]);
        assert_eq!(notification.tag(), "fin-feathers-notification");
        assert_eq!(notification.target().url, "/menu");
    }

    #[test]
    fn test_empty_strings_fall_back() {
        let notification = gateway()
            .build_notification(&PushEvent::json(&json!({ "title": "", "url": "" })))
            .unwrap();
        assert_eq!(notification.title, "Fin & Feathers");
        assert_eq!(notification.target().url, "/");
    }

    #[test]
    fn test_extra_options_pass_through_but_tag_is_stable() {
        let notification = gateway()
            .build_notification(&PushEvent::json(&json!({
                "silent": true,
                "tag": "mine",
            })))
            .unwrap();

        assert_eq!(notification.options.extra.get("silent"), Some(&json!(true)));
        assert!(!notification.options.extra.contains_key("tag"));
        assert_eq!(notification.tag(), "fin-feathers-notification");
    }

    #[test]
    fn test_options_serialize_like_the_platform() {
        let notification = gateway()
            .build_notification(&PushEvent::json(&json!({ "title": "Hi" })))
            .unwrap();
        let options = serde_json::to_value(&notification.options).unwrap();
        assert_eq!(options["requireInteraction"], json!(false));
        assert_eq!(options["data"], json!({ "url": "/" }));
        assert!(options.get("image").is_none());
    }
}
