//! In-memory backends for unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use crate::backend::client::{
    BackendFailure, BackendRequest, EntryMode, SearchBackend, WireEntry, WirePage,
};
use crate::backend::server::BackendServer;

type Handler =
    dyn Fn(&BackendServer, &BackendRequest) -> Result<Vec<WireEntry>, BackendFailure> + Send + Sync;

/// Serves the full result list produced by `handler`, paged by `_count`.
/// Page tokens are decimal offsets.
pub struct FakeBackend {
    handler: Box<Handler>,
    delays: HashMap<String, Duration>,
    calls: Mutex<Vec<(String, BackendRequest)>>,
}

impl FakeBackend {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&BackendServer, &BackendRequest) -> Result<Vec<WireEntry>, BackendFailure>
            + Send
            + Sync
            + 'static,
    {
        Self {
            handler: Box::new(handler),
            delays: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Each server returns its fixed list whatever the query.
    pub fn fixed(data: Vec<(&str, Vec<WireEntry>)>) -> Self {
        let data: HashMap<String, Vec<WireEntry>> =
            data.into_iter().map(|(id, entries)| (id.to_string(), entries)).collect();
        Self::new(move |server, _| Ok(data.get(&server.id).cloned().unwrap_or_default()))
    }

    pub fn failing(server_id: &str, failure: BackendFailure) -> Self {
        let failing = server_id.to_string();
        Self::new(move |server, _| {
            if server.id == failing {
                Err(failure.clone())
            } else {
                Ok(Vec::new())
            }
        })
    }

    pub fn with_delay(mut self, server_id: &str, delay: Duration) -> Self {
        self.delays.insert(server_id.to_string(), delay);
        self
    }

    pub fn calls(&self) -> Vec<(String, BackendRequest)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, server_id: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|(id, _)| id == server_id).count()
    }
}

#[async_trait]
impl SearchBackend for FakeBackend {
    async fn search(
        &self,
        server: &BackendServer,
        request: &BackendRequest,
    ) -> Result<WirePage, BackendFailure> {
        self.calls.lock().unwrap().push((server.id.clone(), request.clone()));
        if let Some(delay) = self.delays.get(&server.id) {
            tokio::time::sleep(*delay).await;
        }

        let all = (self.handler)(server, request)?;
        let offset = request
            .page_token
            .as_deref()
            .and_then(|t| t.parse::<usize>().ok())
            .unwrap_or(0)
            .min(all.len());
        let end = (offset + request.count).min(all.len());

        Ok(WirePage {
            entries: all[offset..end].to_vec(),
            next: (end < all.len()).then(|| end.to_string()),
            total: Some(all.len() as u64),
        })
    }
}

pub fn entry(resource_type: &str, id: &str, resource: Value) -> WireEntry {
    WireEntry {
        resource_type: resource_type.to_string(),
        id: id.to_string(),
        resource,
        mode: EntryMode::Match,
        sort: None,
    }
}

pub fn server(id: &str, priority: u32) -> Arc<BackendServer> {
    let url = Url::parse(&format!("http://{}.test/", id)).unwrap();
    Arc::new(BackendServer::new(id, url, priority))
}

/// Value of a wire parameter in a recorded request.
pub fn param<'a>(request: &'a BackendRequest, name: &str) -> Option<&'a str> {
    request
        .params
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}
