//! Per-request strategy selection.
//!
//! ```text
//! cross-origin           → Bypass (platform fetches natively)
//! same-origin, API path  → NetworkOnly
//! same-origin, non-GET   → NetworkOnly
//! same-origin, GET       → NetworkFirst
//!                             ok   → respond, cache copy in background
//!                             fail → exact match → offline page (navigations) → shell page
//! ```

use std::sync::Arc;

use ffkit_net::{Request, Response, ResponseType};
use http::{Method, StatusCode};
use serde::Serialize;
use tracing::{debug, trace, warn};
use url::Url;

use crate::cache::RequestKey;
use crate::config::AgentConfig;
use crate::context::{AgentContext, PendingWork};
use crate::ServiceWorkerError;

/// How a request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Strategy {
    /// Not intercepted.
    Bypass,
    /// Network, failures propagate.
    NetworkOnly,
    /// Network, falling back to the bucket.
    NetworkFirst,
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    /// Live network response.
    Network,
    /// Exact cached match.
    Cache,
    /// Cached offline document.
    OfflinePage,
    /// Cached site shell.
    ShellPage,
    /// Fetched by the platform without interception.
    Platform,
}

/// Outcome of routing one request.
#[derive(Debug, Clone)]
pub enum FetchDisposition {
    /// The agent declined; the platform should fetch natively.
    Bypass,
    /// The agent answered.
    Respond {
        response: Response,
        source: ResponseSource,
    },
}

impl FetchDisposition {
    fn respond(response: Response, source: ResponseSource) -> Self {
        Self::Respond { response, source }
    }

    /// The response, if the agent answered.
    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::Bypass => None,
            Self::Respond { response, .. } => Some(response),
        }
    }

    /// Where the response came from, if the agent answered.
    pub fn source(&self) -> Option<ResponseSource> {
        match self {
            Self::Bypass => None,
            Self::Respond { source, .. } => Some(*source),
        }
    }
}

/// Chooses and runs a strategy for each intercepted request.
#[derive(Debug, Clone)]
pub struct StrategyRouter {
    config: AgentConfig,
    bucket: String,
}

impl StrategyRouter {
    pub fn new(config: AgentConfig) -> Self {
        let bucket = config.cache_name();
        Self { config, bucket }
    }

    /// Pick the strategy for `request`.
    pub fn classify(&self, request: &Request) -> Strategy {
        if !self.config.is_same_origin(&request.url) {
            Strategy::Bypass
        } else if self.config.is_api(&request.url) || request.method != Method::GET {
            Strategy::NetworkOnly
        } else {
            Strategy::NetworkFirst
        }
    }

    /// Route one request.
    ///
    /// The cache write after a successful network-first fetch runs on
    /// `pending` and is not awaited here.
    pub async fn handle(
        &self,
        ctx: &AgentContext,
        pending: &PendingWork,
        request: Request,
    ) -> Result<FetchDisposition, ServiceWorkerError> {
        let strategy = self.classify(&request);
        trace!(method = %request.method, url = %request.url, ?strategy, "Routing request");

        match strategy {
            Strategy::Bypass => Ok(FetchDisposition::Bypass),
            Strategy::NetworkOnly => self.network_only(ctx, &request).await,
            Strategy::NetworkFirst => self.network_first(ctx, pending, request).await,
        }
    }

    async fn network_only(
        &self,
        ctx: &AgentContext,
        request: &Request,
    ) -> Result<FetchDisposition, ServiceWorkerError> {
        match ctx.fetch(request, self.config.network_timeout()).await {
            Ok(response) => Ok(FetchDisposition::respond(response, ResponseSource::Network)),
            Err(e) => {
                if request.is_mutating() {
                    warn!(
                        method = %request.method,
                        url = %request.url,
                        error = %e,
                        "Write failed while offline; the page must retry it"
                    );
                } else {
                    debug!(url = %request.url, error = %e, "API request failed");
                }
                Err(e)
            }
        }
    }

    async fn network_first(
        &self,
        ctx: &AgentContext,
        pending: &PendingWork,
        request: Request,
    ) -> Result<FetchDisposition, ServiceWorkerError> {
        let error = match ctx.fetch(&request, self.config.network_timeout()).await {
            Ok(response) => {
                if is_cacheable(&response) {
                    self.store_in_background(ctx, pending, request, response.clone());
                }
                return Ok(FetchDisposition::respond(response, ResponseSource::Network));
            }
            Err(e) => e,
        };

        debug!(url = %request.url, error = %error, "Network failed, trying cache");
        self.fallback(ctx, &request).await
    }

    fn store_in_background(
        &self,
        ctx: &AgentContext,
        pending: &PendingWork,
        request: Request,
        response: Response,
    ) {
        let caches = Arc::clone(&ctx.caches);
        let bucket = self.bucket.clone();
        let url = request.url.clone();
        let started = pending.wait_until(async move {
            if let Err(e) = caches.put(&bucket, &request, response).await {
                warn!(url = %request.url, error = %e, "Caching response failed");
            }
        });
        if !started {
            debug!(%url, "Agent superseded, not caching response");
        }
    }

    async fn fallback(
        &self,
        ctx: &AgentContext,
        request: &Request,
    ) -> Result<FetchDisposition, ServiceWorkerError> {
        if let Some(hit) = self.lookup(ctx, &RequestKey::for_request(request)).await {
            return Ok(FetchDisposition::respond(hit, ResponseSource::Cache));
        }

        if request.is_navigation() {
            if let Some(page) = self.lookup_page(ctx, &self.config.offline_page).await {
                return Ok(FetchDisposition::respond(page, ResponseSource::OfflinePage));
            }
        } else {
            // Sub-resources also get the shell document on a cold miss.
            warn!(url = %request.url, "Serving the shell page for a sub-resource");
        }

        match self.lookup_page(ctx, &self.config.shell_page).await {
            Some(shell) => Ok(FetchDisposition::respond(shell, ResponseSource::ShellPage)),
            None => Err(ServiceWorkerError::OfflineUnavailable(request.url.to_string())),
        }
    }

    async fn lookup_page(&self, ctx: &AgentContext, path: &str) -> Option<Response> {
        let url: Url = self.config.resolve(path).ok()?;
        self.lookup(ctx, &RequestKey::get(&url)).await
    }

    async fn lookup(&self, ctx: &AgentContext, key: &RequestKey) -> Option<Response> {
        match ctx.caches.match_request(&self.bucket, key).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(url = %key.url, error = %e, "Cache lookup failed");
                None
            }
        }
    }
}

/// Only complete same-origin responses are stored.
fn is_cacheable(response: &Response) -> bool {
    response.status == StatusCode::OK && response.response_type == ResponseType::Basic
}
