//! In-memory network with canned responses.
//!
//! Serves a fixed table of responses keyed by method and URL and can be
//! switched offline, which makes every fetch fail at the transport layer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderValue, Method, StatusCode};
use tracing::trace;
use url::Url;

use crate::{Fetch, NetError, Request, Response};

/// A network that answers from a table.
///
/// URLs without a route answer `404 Not Found`.
#[derive(Debug, Default)]
pub struct StaticNetwork {
    routes: RwLock<HashMap<(Method, String), Response>>,
    offline: AtomicBool,
    log: RwLock<Vec<(Method, Url)>>,
}

impl StaticNetwork {
    /// Create an empty, online network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `response` for `method url`.
    pub fn route(&self, method: Method, url: &Url, response: Response) {
        if let Ok(mut routes) = self.routes.write() {
            routes.insert((method, url.as_str().to_string()), response);
        }
    }

    /// Serve a `200 OK` body for `GET url`.
    pub fn serve(&self, url: &Url, content_type: &'static str, body: impl Into<Bytes>) {
        let response = Response::new(url.clone(), StatusCode::OK, body).with_header(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static(content_type),
        );
        self.route(Method::GET, url, response);
    }

    /// Remove the route for `method url`.
    pub fn unroute(&self, method: &Method, url: &Url) {
        if let Ok(mut routes) = self.routes.write() {
            routes.remove(&(method.clone(), url.as_str().to_string()));
        }
    }

    /// Switch the transport on or off.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Whether the transport is off.
    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Requests seen so far, in arrival order.
    pub fn requests(&self) -> Vec<(Method, Url)> {
        self.log.read().map(|log| log.clone()).unwrap_or_default()
    }

    /// Number of requests seen for `url`.
    pub fn hits(&self, url: &Url) -> usize {
        self.requests().iter().filter(|(_, u)| u == url).count()
    }
}

#[async_trait]
impl Fetch for StaticNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        if let Ok(mut log) = self.log.write() {
            log.push((request.method.clone(), request.url.clone()));
        }

        if self.is_offline() {
            trace!(url = %request.url, "Static network offline");
            return Err(NetError::Offline(request.url.to_string()));
        }

        let key = (request.method.clone(), request.url.as_str().to_string());
        let found = self
            .routes
            .read()
            .ok()
            .and_then(|routes| routes.get(&key).cloned());

        Ok(found.unwrap_or_else(|| {
            Response::new(request.url.clone(), StatusCode::NOT_FOUND, Bytes::new())
        }))
    }
}
