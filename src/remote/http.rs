//! REST client for the remote store

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{HealthProbe, RemoteApi, RemoteRecord};
use crate::cache::ResourceData;
use crate::config::RemoteConfig;
use crate::error::{classify_http_status, Result, SyncError};
use crate::queue::{ItemOrder, ResourceKind, ResourcePatch};

/// Body of a 409 answer
#[derive(Debug, Deserialize)]
struct ConflictBody {
    #[serde(default)]
    current: Option<RemoteRecord>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateBody<'a, P: Serialize> {
    base_version: u64,
    #[serde(flatten)]
    patch: &'a P,
}

#[derive(Serialize, Deserialize)]
struct ReorderBody {
    orders: Vec<ItemOrder>,
}

/// HTTP implementation of [`RemoteApi`] and [`HealthProbe`]
#[derive(Clone)]
pub struct HttpRemote {
    client: Client,
    base_url: String,
    health_path: String,
    probe_timeout: Duration,
}

impl HttpRemote {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            health_path: config.health_path.clone(),
            probe_timeout: config.probe_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn resource_path(kind: ResourceKind, id: &str) -> String {
        match kind {
            ResourceKind::List => format!("/lists/{}", urlencoding::encode(id)),
            ResourceKind::Item => format!("/items/{}", urlencoding::encode(id)),
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();

        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        tracing::debug!("Remote answered {}: {}", status, body);

        if status == StatusCode::CONFLICT {
            let current = serde_json::from_str::<ConflictBody>(&body)
                .ok()
                .and_then(|b| b.current)
                .map(Box::new);
            return Err(SyncError::VersionConflict { current });
        }

        Err(classify_http_status(status.as_u16(), body))
    }

    /// Read the whole body first so a dropped connection is told apart from bad JSON
    async fn json<T: DeserializeOwned>(response: Response) -> Result<T> {
        let body = response.bytes().await.map_err(map_transport_error)?;
        serde_json::from_slice(&body)
            .map_err(|e| SyncError::Internal(format!("unexpected response body: {}", e)))
    }
}

fn map_transport_error(e: reqwest::Error) -> SyncError {
    if e.is_timeout() {
        SyncError::Timeout
    } else if e.is_connect() {
        SyncError::Unreachable(e.to_string())
    } else if e.is_request() || e.is_body() || e.is_decode() {
        SyncError::Interrupted(e.to_string())
    } else {
        SyncError::Internal(format!("HTTP error: {}", e))
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn create(
        &self,
        kind: ResourceKind,
        parent_id: Option<&str>,
        data: &ResourceData,
    ) -> Result<RemoteRecord> {
        let request = match (kind, data) {
            (ResourceKind::List, ResourceData::List(fields)) => {
                self.client.post(self.url("/lists")).json(fields)
            }
            (ResourceKind::Item, ResourceData::Item(fields)) => {
                let list_id = parent_id.ok_or_else(|| {
                    SyncError::Internal("item create without a parent list".to_string())
                })?;
                let path = format!("/lists/{}/items", urlencoding::encode(list_id));
                self.client.post(self.url(&path)).json(fields)
            }
            _ => {
                return Err(SyncError::Internal(format!(
                    "{} create with mismatched data",
                    kind.as_str()
                )))
            }
        };

        Self::json(self.send(request).await?).await
    }

    async fn update(
        &self,
        kind: ResourceKind,
        id: &str,
        patch: &ResourcePatch,
        base_version: u64,
    ) -> Result<RemoteRecord> {
        let url = self.url(&Self::resource_path(kind, id));
        let request = match patch {
            ResourcePatch::List(patch) => self.client.put(url).json(&UpdateBody {
                base_version,
                patch,
            }),
            ResourcePatch::Item(patch) => self.client.put(url).json(&UpdateBody {
                base_version,
                patch,
            }),
        };

        Self::json(self.send(request).await?).await
    }

    async fn delete(&self, kind: ResourceKind, id: &str, base_version: u64) -> Result<()> {
        let url = self.url(&Self::resource_path(kind, id));
        let request = self
            .client
            .request(Method::DELETE, url)
            .query(&[("baseVersion", base_version)]);

        self.send(request).await?;
        Ok(())
    }

    async fn reorder(&self, list_id: &str, orders: &[ItemOrder]) -> Result<Vec<ItemOrder>> {
        let path = format!("/lists/{}/reorder", urlencoding::encode(list_id));
        let request = self.client.post(self.url(&path)).json(&ReorderBody {
            orders: orders.to_vec(),
        });

        let body: ReorderBody = Self::json(self.send(request).await?).await?;
        Ok(body.orders)
    }

    async fn fetch(&self, kind: ResourceKind, id: &str) -> Result<Option<RemoteRecord>> {
        let request = self.client.get(self.url(&Self::resource_path(kind, id)));

        match self.send(request).await {
            Ok(response) => Ok(Some(Self::json(response).await?)),
            Err(SyncError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl HealthProbe for HttpRemote {
    async fn probe(&self) -> bool {
        let request = self
            .client
            .get(self.url(&self.health_path))
            .timeout(self.probe_timeout);

        match request.send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!("Health probe failed: {}", e);
                false
            }
        }
    }
}
