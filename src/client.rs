//! Typed HTTP client for the firewalla daemon REST API.

use anyhow::{bail, Context, Result};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::api::rest::{ActionOutcome, DaemonHealth, RenameRequest};
use crate::domain::actions::SearchResults;
use crate::domain::entities::EntityView;
use crate::domain::registry::RegistryEntry;
use crate::domain::snapshot::Snapshot;
use crate::msp::records::{Alarm, Flow};

pub struct DaemonClient {
    base_url: String,
    http: Client,
}

impl DaemonClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    /// `http://<daemon.http_addr>`
    pub fn for_addr(http_addr: &str) -> Result<Self> {
        Self::new(&format!("http://{}", http_addr))
    }

    pub async fn health(&self) -> Result<DaemonHealth> {
        self.get("/health").await
    }

    pub async fn snapshot(&self, entry: &str) -> Result<Snapshot> {
        self.get(&entry_path(entry, "snapshot")).await
    }

    pub async fn refresh(&self, entry: &str) -> Result<Snapshot> {
        self.send(Method::POST, &entry_path(entry, "refresh"), None::<&()>)
            .await
    }

    pub async fn entities(&self, entry: &str) -> Result<Vec<EntityView>> {
        self.get(&entry_path(entry, "entities")).await
    }

    pub async fn registry(&self, entry: &str) -> Result<Vec<RegistryEntry>> {
        self.get(&entry_path(entry, "registry")).await
    }

    pub async fn remove_device(&self, entry: &str, device: &str) -> Result<RegistryEntry> {
        let path = entry_path(entry, &format!("registry/{}", device));
        self.send(Method::DELETE, &path, None::<&()>).await
    }

    /// `action` is one of `pause`, `resume`, `toggle`.
    pub async fn rule(&self, entry: &str, rule: &str, action: &str) -> Result<ActionOutcome> {
        let path = entry_path(entry, &format!("rules/{}/{}", rule, action));
        self.send(Method::POST, &path, None::<&()>).await
    }

    pub async fn delete_alarm(&self, entry: &str, alarm: &str) -> Result<ActionOutcome> {
        let path = entry_path(entry, &format!("alarms/{}", alarm));
        self.send(Method::DELETE, &path, None::<&()>).await
    }

    pub async fn rename_device(
        &self,
        entry: &str,
        device: &str,
        name: &str,
    ) -> Result<ActionOutcome> {
        let path = entry_path(entry, &format!("devices/{}", device));
        let body = RenameRequest {
            name: name.to_string(),
        };
        self.send(Method::PATCH, &path, Some(&body)).await
    }

    pub async fn search_alarms(
        &self,
        entry: &str,
        query: &str,
        limit: Option<usize>,
    ) -> Result<SearchResults<Alarm>> {
        self.search(entry, "alarms", query, limit).await
    }

    pub async fn search_flows(
        &self,
        entry: &str,
        query: &str,
        limit: Option<usize>,
    ) -> Result<SearchResults<Flow>> {
        self.search(entry, "flows", query, limit).await
    }

    // ── Internal helpers ───────────────────────────────────

    async fn search<T: DeserializeOwned>(
        &self,
        entry: &str,
        kind: &str,
        query: &str,
        limit: Option<usize>,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, entry_path(entry, &format!("search/{}", kind)));
        let mut params = vec![("query", query.to_string())];
        if let Some(limit) = limit {
            params.push(("limit", limit.to_string()));
        }
        let resp = self
            .http
            .get(&url)
            .query(&params)
            .send()
            .await
            .with_context(|| format!("GET {}", url))?;
        decode(&url, resp).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(Method::GET, path, None::<&()>).await
    }

    async fn send<T: DeserializeOwned, B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.request(method.clone(), &url);
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req
            .send()
            .await
            .with_context(|| format!("{} {}", method, url))?;
        decode(&url, resp).await
    }
}

fn entry_path(entry: &str, rest: &str) -> String {
    format!("/api/v1/entries/{}/{}", entry, rest)
}

async fn decode<T: DeserializeOwned>(url: &str, resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        if body.is_empty() {
            bail!("{} returned {}", url, status);
        }
        bail!("{} returned {}: {}", url, status, body);
    }
    resp.json()
        .await
        .with_context(|| format!("parsing response from {}", url))
}
