//! JSON-over-HTTP request store.

use crate::error::{TaproomError, TaproomResult};
use crate::request::Request;
use crate::store::{RequestQuery, RequestStore, StatusUpdate, VersionResolver};
use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct LatestVersion {
    version: String,
}

/// Request store backed by a remote HTTP API.
#[derive(Clone)]
pub struct HttpRequestStore {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpRequestStore {
    /// # Arguments
    /// * `base_url` - API root, e.g. `http://localhost:2337`
    /// * `timeout` - Per-request timeout
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> TaproomResult<Self> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.base_url, path)
    }

    /// Map non-success responses onto error kinds.
    async fn check(response: Response) -> TaproomResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, body))
    }
}

fn status_error(status: StatusCode, body: String) -> TaproomError {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };
    if status == StatusCode::NOT_FOUND {
        TaproomError::NotFound(detail)
    } else if status.is_client_error() {
        TaproomError::Validation(detail)
    } else {
        TaproomError::Transport(detail)
    }
}

#[async_trait]
impl RequestStore for HttpRequestStore {
    async fn submit_request(&self, request: &Request) -> TaproomResult<Request> {
        debug!(command = %request.command, "Submitting request over HTTP");
        let response = self
            .http_client
            .post(self.url("requests"))
            .json(request)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn fetch_request(&self, id: &str) -> TaproomResult<Request> {
        let response = self
            .http_client
            .get(self.url(&format!("requests/{id}")))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn update_request_status(
        &self,
        id: &str,
        update: &StatusUpdate,
    ) -> TaproomResult<Request> {
        let response = self
            .http_client
            .patch(self.url(&format!("requests/{id}")))
            .json(update)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn list_requests(&self, query: &RequestQuery) -> TaproomResult<Vec<Request>> {
        let mut params: Vec<(&str, String)> =
            vec![("include_hidden", query.include_hidden.to_string())];
        if let Some(parent) = &query.parent {
            params.push(("parent", parent.clone()));
        }
        if let Some(status) = query.status {
            params.push(("status", status.to_string()));
        }
        let response = self
            .http_client
            .get(self.url("requests"))
            .query(&params)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }
}

#[async_trait]
impl VersionResolver for HttpRequestStore {
    async fn resolve_latest_version(
        &self,
        system: &str,
        namespace: &str,
    ) -> TaproomResult<Option<String>> {
        let response = self
            .http_client
            .get(self.url(&format!("systems/{namespace}/{system}/latest")))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let latest: LatestVersion = Self::check(response).await?.json().await?;
        Ok(Some(latest.version))
    }
}
