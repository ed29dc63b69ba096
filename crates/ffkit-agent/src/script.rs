//! JSON-lines host commands.
//!
//! Each line of a script is one command, e.g.
//!
//! ```text
//! {"command": "open-page", "path": "/"}
//! {"command": "fetch", "path": "/menu.json"}
//! {"command": "message", "data": {"type": "GET_VERSION"}, "reply": true}
//! {"command": "push", "payload": {"title": "Special!", "url": "/menu"}}
//! {"command": "click"}
//! {"command": "sync", "tag": "sync-posts"}
//! ```
//!
//! Blank lines and lines starting with `#` are skipped.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use ffkit_net::{Fetch, Request, RequestMode};
use ffkit_sw::{
    AgentConfig, ClickOutcome, ClientEvent, ContainerOptions, EventOutcome, HostEvents,
    InstallReport, MessageEvent, PageHandle, PushEvent, ReplyPort, ServiceWorkerContainer,
    WorkerSlot,
};
use http::Method;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::debug;

/// One scripted host action.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum HostCommand {
    /// Fetch a path through the agent.
    Fetch {
        path: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default)]
        navigate: bool,
        #[serde(default)]
        body: Option<String>,
    },
    /// Post a message to the active agent, optionally from an open page.
    Message {
        data: JsonValue,
        #[serde(default)]
        page: Option<usize>,
        #[serde(default)]
        reply: bool,
    },
    /// Deliver a push. A missing payload is an empty push.
    Push {
        #[serde(default)]
        payload: Option<JsonValue>,
    },
    /// Click a shown notification, by default the one with the configured tag.
    Click {
        #[serde(default)]
        tag: Option<String>,
    },
    Sync {
        tag: String,
    },
    PeriodicSync {
        tag: String,
    },
    /// Open a page at `path`.
    OpenPage {
        path: String,
    },
}

fn default_method() -> String {
    "GET".to_string()
}

impl HostCommand {
    /// Parse one script line. Blank lines and comments are `None`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        let command = serde_json::from_str(line)
            .with_context(|| format!("invalid command: {}", line))?;
        Ok(Some(command))
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Fetch { .. } => "fetch",
            Self::Message { .. } => "message",
            Self::Push { .. } => "push",
            Self::Click { .. } => "click",
            Self::Sync { .. } => "sync",
            Self::PeriodicSync { .. } => "periodic-sync",
            Self::OpenPage { .. } => "open-page",
        }
    }
}

/// A registered agent plus the pages opened during the script.
pub struct Session {
    config: AgentConfig,
    container: ServiceWorkerContainer,
    events: HostEvents,
    pages: Vec<PageHandle>,
}

impl Session {
    /// Register an agent for `config` against `network`.
    pub async fn start(
        config: AgentConfig,
        network: Arc<dyn Fetch>,
    ) -> Result<(Self, InstallReport)> {
        let (container, events) = ServiceWorkerContainer::new(
            config.origin.clone(),
            network,
            ContainerOptions::default(),
        );
        let report = container
            .register(config.clone())
            .await
            .context("agent registration failed")?;

        Ok((
            Self {
                config,
                container,
                events,
                pages: Vec::new(),
            },
            report,
        ))
    }

    /// Run one command and describe what happened.
    ///
    /// Failures are reported in the result, not returned.
    pub async fn execute(&mut self, command: HostCommand) -> JsonValue {
        let name = command.name();
        debug!(command = name, "Executing");

        let outcome = self.run(command).await;
        self.container.settle().await;
        self.adopt_opened_pages();
        let notifications = self.drain_pages();

        let mut result = match outcome {
            Ok(JsonValue::Object(fields)) => {
                let mut result = json!({ "command": name, "ok": true });
                if let Some(map) = result.as_object_mut() {
                    map.extend(fields);
                }
                result
            }
            Ok(other) => json!({ "command": name, "ok": true, "result": other }),
            Err(e) => json!({ "command": name, "ok": false, "error": format!("{:#}", e) }),
        };
        if !notifications.is_empty() {
            result["notifications"] = JsonValue::Array(notifications);
        }
        result
    }

    async fn run(&mut self, command: HostCommand) -> Result<JsonValue> {
        match command {
            HostCommand::Fetch {
                path,
                method,
                navigate,
                body,
            } => {
                let url = self.config.resolve(&path)?;
                let method = Method::from_bytes(method.as_bytes())
                    .with_context(|| format!("invalid method {}", method))?;
                let mut request = Request::new(method, url);
                if navigate {
                    request.mode = RequestMode::Navigate;
                }
                request.body = body.map(Bytes::from);

                let (source, response) = self.container.fetch(request).await?;
                Ok(json!({
                    "source": source,
                    "status": response.status.as_u16(),
                    "content_type": response.content_type().map(|m| m.to_string()),
                    "bytes": response.body.len(),
                }))
            }

            HostCommand::Message { data, page, reply } => {
                let source = match page {
                    Some(index) => Some(
                        self.pages
                            .get(index)
                            .map(|p| p.client_id.clone())
                            .ok_or_else(|| anyhow!("no page {}", index))?,
                    ),
                    None => None,
                };

                let mut event = MessageEvent::new(data, source);
                let mut reply_rx = None;
                if reply {
                    let (port, rx) = ReplyPort::channel();
                    event = event.with_port(port);
                    reply_rx = Some(rx);
                }

                let outcome = self.container.post_message(WorkerSlot::Active, event).await?;
                let reply = reply_rx.and_then(|mut rx| rx.try_recv().ok());
                Ok(json!({
                    "handled": !matches!(outcome, EventOutcome::Unhandled),
                    "reply": reply,
                }))
            }

            HostCommand::Push { payload } => {
                let event = payload
                    .map(|p| PushEvent::json(&p))
                    .unwrap_or_else(PushEvent::empty);
                let shown = self.container.push(event).await?;
                Ok(json!({ "notification": shown }))
            }

            HostCommand::Click { tag } => {
                let tag = tag.unwrap_or_else(|| self.config.notifications.tag.clone());
                Ok(match self.container.click_notification(&tag).await? {
                    ClickOutcome::Focused(id) => json!({ "focused": id }),
                    ClickOutcome::Opened(id) => json!({ "opened": id }),
                })
            }

            HostCommand::Sync { tag } => {
                let notified = self.container.fire_sync(&tag).await?;
                Ok(json!({ "notified": notified }))
            }

            HostCommand::PeriodicSync { tag } => {
                let notified = self.container.fire_periodic_sync(&tag).await?;
                Ok(json!({ "notified": notified }))
            }

            HostCommand::OpenPage { path } => {
                let url = self.config.resolve(&path)?;
                let page = self.container.connect_page(url).await;
                let client = page.client_id.clone();
                self.pages.push(page);
                Ok(json!({ "page": self.pages.len() - 1, "client": client }))
            }
        }
    }

    /// Track windows the agent opened so their notifications are reported.
    fn adopt_opened_pages(&mut self) {
        while let Ok(event) = self.events.clients.try_recv() {
            if let ClientEvent::Opened(handle) = event {
                self.pages.push(handle);
            }
        }
    }

    fn drain_pages(&mut self) -> Vec<JsonValue> {
        let mut drained = Vec::new();
        for (index, page) in self.pages.iter_mut().enumerate() {
            for message in page.drain() {
                drained.push(json!({ "page": index, "message": message }));
            }
        }
        drained
    }

    /// Open pages, in the order they were opened.
    pub fn pages(&self) -> &[PageHandle] {
        &self.pages
    }
}
