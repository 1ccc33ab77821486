//! Canned-response [`HttpClient`] for tests and offline replays.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;

use crate::{FetchError, FetchedResponse, HttpClient};

#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Json(JsonValue),
    Text(String),
    Status(u16),
}

#[derive(Debug, Clone)]
struct Route {
    url_contains: String,
    query_contains: Option<(String, String)>,
    reply: ScriptedReply,
}

/// Serves the first route whose url fragment (and optional query pair) matches.
/// Unmatched requests answer 404.
#[derive(Debug, Clone, Default)]
pub struct ScriptedHttp {
    routes: Arc<Mutex<Vec<Route>>>,
    calls: Arc<AtomicUsize>,
    log: Arc<Mutex<Vec<String>>>,
}

impl ScriptedHttp {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn route(&self, url_contains: &str, reply: ScriptedReply) {
        self.routes.lock().await.push(Route {
            url_contains: url_contains.to_string(),
            query_contains: None,
            reply,
        });
    }

    pub async fn route_with_query(
        &self,
        url_contains: &str,
        key: &str,
        value: &str,
        reply: ScriptedReply,
    ) {
        self.routes.lock().await.push(Route {
            url_contains: url_contains.to_string(),
            query_contains: Some((key.to_string(), value.to_string())),
            reply,
        });
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requested urls in call order.
    pub async fn requested(&self) -> Vec<String> {
        self.log.lock().await.clone()
    }
}

#[async_trait]
impl HttpClient for ScriptedHttp {
    async fn get(
        &self,
        _source_id: &str,
        url: &str,
        query: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().await.push(url.to_string());

        let routes = self.routes.lock().await;
        let matched = routes.iter().find(|route| {
            url.contains(&route.url_contains)
                && route
                    .query_contains
                    .as_ref()
                    .map_or(true, |(k, v)| query.iter().any(|(qk, qv)| qk == k && qv == v))
        });

        let reply = matched
            .map(|route| route.reply.clone())
            .unwrap_or(ScriptedReply::Status(404));

        match reply {
            ScriptedReply::Json(value) => Ok(FetchedResponse {
                status: 200,
                final_url: url.to_string(),
                body: serde_json::to_vec(&value).map_err(|err| FetchError::Decode {
                    url: url.to_string(),
                    message: err.to_string(),
                })?,
            }),
            ScriptedReply::Text(text) => Ok(FetchedResponse {
                status: 200,
                final_url: url.to_string(),
                body: text.into_bytes(),
            }),
            ScriptedReply::Status(status) => Err(FetchError::HttpStatus {
                status,
                url: url.to_string(),
            }),
        }
    }
}
