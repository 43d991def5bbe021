//! PostgREST-style HTTP adapter for the hosted backend.

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde_json::{Map, Value};
use url::Url;

use super::RemoteStore;
use crate::error::{SyncError, SyncResult};
use crate::record::{Record, RecordId};
use crate::scope::{Filter, ResourceKind};

/// Remote store client speaking the backend's REST dialect.
#[derive(Clone)]
pub struct RestRemote {
  client: reqwest::Client,
  base: Url,
  api_key: String,
  access_token: Option<String>,
}

impl RestRemote {
  pub fn new(base_url: &str, api_key: impl Into<String>) -> SyncResult<Self> {
    let mut base = base_url.trim().to_string();
    if !base.ends_with('/') {
      base.push('/');
    }
    let base =
      Url::parse(&base).map_err(|e| SyncError::Config(format!("Invalid backend url '{}': {}", base_url, e)))?;

    let client = reqwest::Client::builder()
      .user_agent(concat!("tally/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| SyncError::Config(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self {
      client,
      base,
      api_key: api_key.into(),
      access_token: None,
    })
  }

  /// Authenticate requests as a signed-in user instead of the anonymous key.
  pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
    self.access_token = Some(token.into());
    self
  }

  fn table_url(&self, resource: ResourceKind) -> SyncResult<Url> {
    let path = format!("rest/v1/{}", resource.descriptor().table);
    self
      .base
      .join(&path)
      .map_err(|e| SyncError::Config(format!("Invalid table path {}: {}", path, e)))
  }

  pub(crate) fn query_url(
    &self,
    resource: ResourceKind,
    owner: &str,
    filter: Option<&Filter>,
  ) -> SyncResult<Url> {
    let descriptor = resource.descriptor();
    let mut url = self.table_url(resource)?;
    {
      let mut pairs = url.query_pairs_mut();
      pairs.append_pair("select", "*");
      pairs.append_pair(descriptor.owner_field, &format!("eq.{}", owner));
      if let Some(filter) = filter {
        for (field, value) in filter.iter() {
          pairs.append_pair(field, &format!("eq.{}", value));
        }
      }
      pairs.append_pair("order", &descriptor.order_clause());
    }
    Ok(url)
  }

  pub(crate) fn row_url(&self, resource: ResourceKind, owner: &str, id: &RecordId) -> SyncResult<Url> {
    let mut url = self.table_url(resource)?;
    url
      .query_pairs_mut()
      .append_pair("id", &format!("eq.{}", id))
      .append_pair(resource.descriptor().owner_field, &format!("eq.{}", owner));
    Ok(url)
  }

  fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
    let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);
    request
      .header("apikey", &self.api_key)
      .bearer_auth(bearer)
  }

  /// Send a request and decode the returned rows.
  async fn rows(&self, request: RequestBuilder) -> SyncResult<Vec<Record>> {
    let response = self.authorize(request).send().await?;
    let status = response.status();

    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(classify(status, &body));
    }

    if status == StatusCode::NO_CONTENT {
      return Ok(Vec::new());
    }

    let rows: Vec<Value> = response.json().await?;
    rows.into_iter().map(Record::from_row).collect()
  }
}

/// Map a failed HTTP status to the error taxonomy.
pub(crate) fn classify(status: StatusCode, body: &str) -> SyncError {
  let detail = if body.is_empty() {
    status.to_string()
  } else {
    format!("{}: {}", status, body)
  };

  match status {
    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::Transport(detail),
    s if s.is_server_error() => SyncError::Transport(detail),
    StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => SyncError::Transport(detail),
    _ => SyncError::Validation(detail),
  }
}

#[async_trait]
impl RemoteStore for RestRemote {
  async fn query(
    &self,
    resource: ResourceKind,
    owner: &str,
    filter: Option<&Filter>,
  ) -> SyncResult<Vec<Record>> {
    let url = self.query_url(resource, owner, filter)?;
    self.rows(self.client.get(url)).await
  }

  async fn insert(
    &self,
    resource: ResourceKind,
    _owner: &str,
    payload: Map<String, Value>,
  ) -> SyncResult<Record> {
    let url = self.table_url(resource)?;
    let request = self
      .client
      .post(url)
      .header("Prefer", "return=representation")
      .json(&payload);

    self
      .rows(request)
      .await?
      .into_iter()
      .next()
      .ok_or_else(|| SyncError::Validation("insert returned no row".to_string()))
  }

  async fn update(
    &self,
    resource: ResourceKind,
    owner: &str,
    id: &RecordId,
    patch: Map<String, Value>,
  ) -> SyncResult<Record> {
    let url = self.row_url(resource, owner, id)?;
    let request = self
      .client
      .patch(url)
      .header("Prefer", "return=representation")
      .json(&patch);

    self
      .rows(request)
      .await?
      .into_iter()
      .next()
      .ok_or_else(|| SyncError::NotFound(id.clone()))
  }

  async fn delete(&self, resource: ResourceKind, owner: &str, id: &RecordId) -> SyncResult<()> {
    let url = self.row_url(resource, owner, id)?;
    self.rows(self.client.delete(url)).await?;
    Ok(())
  }
}
