//! REST implementation of the remote store boundary.
//!
//! Targets a row-scoped HTTP backend: `POST /{table}` for inserts,
//! `PATCH`/`DELETE /{table}/{id}` for updates and deletes, every request
//! carrying the owning user so the backend can enforce row ownership.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Client, RequestBuilder, StatusCode};
use url::Url;

use super::{RemoteError, RemoteStore};
use crate::config::{Config, RemoteConfig};
use crate::queue::{Payload, Table};

pub struct RestRemote {
  client: Client,
  base: Url,
  user_id: String,
  token: Option<String>,
}

impl RestRemote {
  pub fn new(config: &RemoteConfig) -> Result<Self> {
    let mut base =
      Url::parse(&config.url).map_err(|e| eyre!("Invalid remote url {}: {}", config.url, e))?;

    // Url::join treats a path without a trailing slash as a file
    if !base.path().ends_with('/') {
      base.set_path(&format!("{}/", base.path()));
    }

    Ok(Self {
      client: Client::new(),
      base,
      user_id: config.user_id.clone(),
      token: Config::get_api_token().ok(),
    })
  }

  fn table_url(&self, table: Table) -> Result<Url, RemoteError> {
    self
      .base
      .join(table.as_str())
      .map_err(|e| RemoteError::Rejected(format!("invalid url for {}: {}", table, e)))
  }

  fn record_url(&self, table: Table, id: &str) -> Result<Url, RemoteError> {
    self
      .base
      .join(&format!("{}/{}", table.as_str(), id))
      .map_err(|e| RemoteError::Rejected(format!("invalid url for {}/{}: {}", table, id, e)))
  }

  fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
    match &self.token {
      Some(token) => request.bearer_auth(token),
      None => request,
    }
  }

  async fn send(&self, request: RequestBuilder) -> Result<(), RemoteError> {
    let response = request
      .send()
      .await
      .map_err(|e| RemoteError::Transient(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
      return Ok(());
    }

    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, &body))
  }
}

/// Map a non-success status to the failure taxonomy.
fn classify_status(status: StatusCode, body: &str) -> RemoteError {
  match status {
    StatusCode::CONFLICT => RemoteError::Conflict,
    StatusCode::NOT_FOUND => RemoteError::NotFound,
    StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
      RemoteError::Transient(format!("HTTP {}", status))
    }
    s if s.is_server_error() => RemoteError::Transient(format!("HTTP {}: {}", s, body)),
    s => RemoteError::Rejected(format!("HTTP {}: {}", s, body)),
  }
}

#[async_trait]
impl RemoteStore for RestRemote {
  async fn insert(&self, table: Table, payload: &Payload) -> Result<(), RemoteError> {
    let url = self.table_url(table)?;

    let mut body = payload.clone();
    body.insert("owner".to_string(), self.user_id.clone().into());

    self.send(self.authorize(self.client.post(url)).json(&body)).await
  }

  async fn update_by_id(
    &self,
    table: Table,
    id: &str,
    payload: &Payload,
  ) -> Result<(), RemoteError> {
    let url = self.record_url(table, id)?;

    self
      .send(
        self
          .authorize(self.client.patch(url))
          .query(&[("owner", self.user_id.as_str())])
          .json(payload),
      )
      .await
  }

  async fn delete_by_id(&self, table: Table, id: &str) -> Result<(), RemoteError> {
    let url = self.record_url(table, id)?;

    self
      .send(
        self
          .authorize(self.client.delete(url))
          .query(&[("owner", self.user_id.as_str())]),
      )
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_status_classification() {
    assert!(matches!(
      classify_status(StatusCode::CONFLICT, ""),
      RemoteError::Conflict
    ));
    assert!(matches!(
      classify_status(StatusCode::NOT_FOUND, ""),
      RemoteError::NotFound
    ));
    assert!(matches!(
      classify_status(StatusCode::INTERNAL_SERVER_ERROR, "boom"),
      RemoteError::Transient(_)
    ));
    assert!(matches!(
      classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
      RemoteError::Transient(_)
    ));
    assert!(matches!(
      classify_status(StatusCode::UNPROCESSABLE_ENTITY, "bad payload"),
      RemoteError::Rejected(_)
    ));
  }

  #[test]
  fn test_base_url_gets_trailing_slash() {
    let remote = RestRemote::new(&RemoteConfig {
      url: "https://api.example.com/v1".to_string(),
      user_id: "u-1".to_string(),
    })
    .unwrap();

    let url = remote.table_url(Table::Customers).unwrap();
    assert_eq!(url.as_str(), "https://api.example.com/v1/customers");

    let url = remote.record_url(Table::Quotes, "q-7").unwrap();
    assert_eq!(url.as_str(), "https://api.example.com/v1/quotes/q-7");
  }
}
