//! PostgREST + auth HTTP adapter for [`DataAccess`].
//!
//! Thin HTTP wrapper: query-string building and response parsing are pure
//! functions so they are tested without a live project.
//!
//! WIRE FORMAT
//! ===========
//! - `GET  {url}/rest/v1/{table}?select=*&col=eq.value&order=col.asc`
//! - `POST {url}/rest/v1/{table}` with `Prefer: return=representation`;
//!   the response is a one-element JSON array.
//! - `GET  {url}/auth/v1/user` with the user's bearer token.

use std::time::Duration;

use super::{DataAccess, Filter, Order, Row};
use crate::config::BackendConfig;
use crate::error::BackendError;
use crate::model::AuthUser;

// =============================================================================
// CLIENT
// =============================================================================

pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    anon_key: String,
    access_token: Option<String>,
}

impl RestClient {
    /// # Errors
    ///
    /// Returns [`BackendError::HttpClientBuild`] if the HTTP client fails to build.
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeouts.request_secs))
            .connect_timeout(Duration::from_secs(config.timeouts.connect_secs))
            .build()
            .map_err(|e| BackendError::HttpClientBuild(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.url.clone(),
            anon_key: config.anon_key.clone(),
            access_token: config.access_token.clone(),
        })
    }

    fn bearer(&self) -> &str {
        self.access_token.as_deref().unwrap_or(&self.anon_key)
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("apikey", &self.anon_key)
            .bearer_auth(self.bearer())
    }
}

async fn read_body(response: reqwest::Response) -> Result<(u16, String), BackendError> {
    let status = response.status().as_u16();
    let text = response
        .text()
        .await
        .map_err(|e| BackendError::Transport(e.to_string()))?;
    Ok((status, text))
}

#[async_trait::async_trait]
impl DataAccess for RestClient {
    async fn query(&self, table: &str, filter: &Filter, order: Option<&Order>) -> Result<Vec<Row>, BackendError> {
        let response = self
            .request(reqwest::Method::GET, table_url(&self.base_url, table))
            .query(&query_pairs(filter, order))
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let (status, text) = read_body(response).await?;
        if !(200..300).contains(&status) {
            return Err(BackendError::Status { status, body: text });
        }
        parse_rows(&text)
    }

    async fn insert(&self, table: &str, row: Row) -> Result<Row, BackendError> {
        let response = self
            .request(reqwest::Method::POST, table_url(&self.base_url, table))
            .header("Prefer", "return=representation")
            .json(&[serde_json::Value::Object(row)])
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let (status, text) = read_body(response).await?;
        if !(200..300).contains(&status) {
            return Err(BackendError::Status { status, body: text });
        }
        parse_rows(&text)?
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Decode("insert returned no rows".to_owned()))
    }

    async fn current_user(&self) -> Result<Option<AuthUser>, BackendError> {
        if self.access_token.is_none() {
            return Ok(None);
        }

        let url = format!("{}/auth/v1/user", self.base_url);
        let response = self
            .request(reqwest::Method::GET, url)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let (status, text) = read_body(response).await?;
        match status {
            200..=299 => parse_auth_user(&text).map(Some),
            401 | 403 => Ok(None),
            _ => Err(BackendError::Status { status, body: text }),
        }
    }
}

// =============================================================================
// REQUEST BUILDING
// =============================================================================

pub(crate) fn table_url(base_url: &str, table: &str) -> String {
    format!("{}/rest/v1/{table}", base_url.trim_end_matches('/'))
}

/// PostgREST query-string pairs; values are URL-encoded by the HTTP client.
pub(crate) fn query_pairs(filter: &Filter, order: Option<&Order>) -> Vec<(String, String)> {
    let mut pairs = vec![("select".to_owned(), "*".to_owned())];
    for (column, value) in filter.conditions() {
        pairs.push((column.clone(), format!("eq.{value}")));
    }
    if let Some(order) = order {
        let direction = if order.ascending { "asc" } else { "desc" };
        pairs.push(("order".to_owned(), format!("{}.{direction}", order.column)));
    }
    pairs
}

// =============================================================================
// PARSING
// =============================================================================

pub(crate) fn parse_rows(json: &str) -> Result<Vec<Row>, BackendError> {
    let value: serde_json::Value = serde_json::from_str(json).map_err(|e| BackendError::Decode(e.to_string()))?;
    match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                serde_json::Value::Object(row) => Ok(row),
                other => Err(BackendError::Decode(format!("expected row object, got {other}"))),
            })
            .collect(),
        serde_json::Value::Object(row) => Ok(vec![row]),
        other => Err(BackendError::Decode(format!("expected row array, got {other}"))),
    }
}

#[derive(serde::Deserialize)]
struct ApiUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    user_metadata: Option<ApiUserMetadata>,
}

#[derive(serde::Deserialize)]
struct ApiUserMetadata {
    #[serde(default)]
    full_name: Option<String>,
}

pub(crate) fn parse_auth_user(json: &str) -> Result<AuthUser, BackendError> {
    let api: ApiUser = serde_json::from_str(json).map_err(|e| BackendError::Decode(e.to_string()))?;
    Ok(AuthUser {
        id: api.id,
        email: api.email.filter(|e| !e.is_empty()),
        full_name: api.user_metadata.and_then(|m| m.full_name),
    })
}

#[cfg(test)]
#[path = "rest_test.rs"]
mod tests;
