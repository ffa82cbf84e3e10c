//! Typed HTTP client for the warden daemon REST API.

use anyhow::{bail, Context, Result};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;

use crate::api::rest::{AddWhitelistBody, LogsQuery, UpdateWhitelistBody};
use crate::config::ClientConfig;
use crate::domain::types::{Node, Resource, RestartLogEntry, SystemStatus, WhitelistEntry};

pub struct WardenClient {
    base_url: String,
    username: String,
    password: String,
    http: Client,
}

impl WardenClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            http,
        })
    }

    pub async fn health(&self) -> Result<serde_json::Value> {
        self.send(self.request(Method::GET, "/health")).await
    }

    pub async fn status(&self) -> Result<SystemStatus> {
        self.get("/api/status").await
    }

    pub async fn nodes(&self) -> Result<Vec<Node>> {
        self.get("/api/nodes").await
    }

    pub async fn resources(&self) -> Result<Vec<Resource>> {
        self.get("/api/resources").await
    }

    pub async fn whitelist(&self) -> Result<Vec<WhitelistEntry>> {
        self.get("/api/whitelist").await
    }

    pub async fn logs(&self, query: &LogsQuery) -> Result<Vec<RestartLogEntry>> {
        self.send(self.request(Method::GET, "/api/logs").query(query))
            .await
    }

    /// Restart a resource (`vmid`, optionally pinned to `node`).
    pub async fn restart_resource(
        &self,
        vmid: u32,
        node: Option<&str>,
        triggered_by: &str,
    ) -> Result<RestartLogEntry> {
        let mut req = self
            .request(Method::POST, &format!("/api/resources/{}/restart", vmid))
            .json(&json!({ "triggered_by": triggered_by }));
        if let Some(node) = node {
            req = req.query(&[("node", node)]);
        }
        self.send(req).await
    }

    pub async fn restart_node(&self, name: &str, triggered_by: &str) -> Result<RestartLogEntry> {
        self.post(
            &format!("/api/nodes/{}/restart", name),
            &json!({ "triggered_by": triggered_by }),
        )
        .await
    }

    pub async fn whitelist_add(&self, body: &AddWhitelistBody) -> Result<WhitelistEntry> {
        self.post("/api/whitelist", body).await
    }

    pub async fn whitelist_set(&self, id: i64, body: &UpdateWhitelistBody) -> Result<WhitelistEntry> {
        self.send(
            self.request(Method::PATCH, &format!("/api/whitelist/{}", id))
                .json(body),
        )
        .await
    }

    pub async fn whitelist_remove(&self, id: i64) -> Result<()> {
        let url = format!("{}/api/whitelist/{}", self.base_url, id);
        let resp = self
            .request(Method::DELETE, &format!("/api/whitelist/{}", id))
            .send()
            .await
            .with_context(|| format!("DELETE {}", url))?;
        check(resp).await.map(|_| ())
    }

    // ── Internal helpers ───────────────────────────────────

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .basic_auth(&self.username, Some(&self.password))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(self.request(Method::GET, path)).await
    }

    async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<T> {
        self.send(self.request(Method::POST, path).json(body)).await
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let req = req.build().context("building request")?;
        let label = format!("{} {}", req.method(), req.url());
        let resp = self
            .http
            .execute(req)
            .await
            .with_context(|| label.clone())?;
        check(resp)
            .await?
            .json()
            .await
            .with_context(|| format!("parsing response from {}", label))
    }
}

/// Turn a non-success response into an error carrying the daemon's message.
async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let url = resp.url().to_string();
    let message = resp
        .json::<serde_json::Value>()
        .await
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| status.to_string());
    bail!("{} returned {}: {}", url, status.as_u16(), message)
}
