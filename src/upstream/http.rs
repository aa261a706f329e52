//! HTTP implementation of the upstream contract.
//!
//! Talks to a replica-style REST API: organization-secret and user-id
//! headers, versioned endpoints, `{items: [...]}` agent listing, and a
//! per-agent chat completions endpoint.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::{
    AgentRecord, AgentReply, AgentSpec, UpstreamClient, UpstreamError, UpstreamResult, UserRecord,
};
use crate::config::UpstreamConfig;
use crate::error::ErrorKind;
use crate::rate_limit::parse_retry_after;

const ORG_SECRET_HEADER: &str = "x-organization-secret";
const USER_ID_HEADER: &str = "x-user-id";
const API_VERSION_HEADER: &str = "x-api-version";

/// Upstream client backed by reqwest.
pub struct HttpUpstream {
    client: Client,
    base_url: String,
}

#[derive(Serialize)]
struct CreateUserRequest<'a> {
    id: &'a str,
    name: &'a str,
}

#[derive(Deserialize)]
struct AgentsPage {
    #[serde(default)]
    items: Vec<AgentRecord>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    content: &'a str,
    source: &'a str,
    skip_chat_history: bool,
}

impl HttpUpstream {
    /// Build a client with the auth headers baked in.
    pub fn new(config: &UpstreamConfig) -> UpstreamResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ORG_SECRET_HEADER, header_value(&config.org_secret)?);
        headers.insert(USER_ID_HEADER, header_value(&config.user_id)?);
        headers.insert(API_VERSION_HEADER, header_value(&config.api_version)?);

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| UpstreamError::new(ErrorKind::Unknown, e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn header_value(value: &str) -> UpstreamResult<HeaderValue> {
    HeaderValue::from_str(value).map_err(|_| {
        UpstreamError::new(
            ErrorKind::Malformed,
            "configuration value contains characters not allowed in headers",
        )
    })
}

/// Turn a non-success response into a classified error.
async fn check(resp: Response) -> UpstreamResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let retry_after = parse_retry_after(
        resp.headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok()),
    );
    let body = resp.text().await.unwrap_or_default();
    Err(UpstreamError::from_status(status.as_u16(), body, retry_after))
}

fn transport_error(e: reqwest::Error) -> UpstreamError {
    let kind = if e.is_timeout() {
        ErrorKind::Timeout
    } else {
        ErrorKind::Network
    };
    UpstreamError::new(kind, e.to_string())
}

fn parse_error(e: reqwest::Error) -> UpstreamError {
    UpstreamError::new(ErrorKind::Unknown, format!("malformed response: {}", e))
}

#[async_trait::async_trait]
impl UpstreamClient for HttpUpstream {
    async fn get_user(&self, id: &str) -> UpstreamResult<Option<UserRecord>> {
        let resp = self
            .client
            .get(self.url(&format!("/v1/users/{}", id)))
            .send()
            .await
            .map_err(transport_error)?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = check(resp).await?;
        let user = resp.json::<UserRecord>().await.map_err(parse_error)?;
        Ok(Some(user))
    }

    async fn create_user(&self, id: &str, name: &str) -> UpstreamResult<UserRecord> {
        debug!(id, "creating upstream user");
        let resp = self
            .client
            .post(self.url("/v1/users"))
            .json(&CreateUserRequest { id, name })
            .send()
            .await
            .map_err(transport_error)?;

        let resp = check(resp).await?;
        resp.json::<UserRecord>().await.map_err(parse_error)
    }

    async fn list_agents(&self) -> UpstreamResult<Vec<AgentRecord>> {
        let resp = self
            .client
            .get(self.url("/v1/replicas"))
            .send()
            .await
            .map_err(transport_error)?;

        let resp = check(resp).await?;
        let page = resp.json::<AgentsPage>().await.map_err(parse_error)?;
        Ok(page.items)
    }

    async fn create_agent(&self, spec: &AgentSpec) -> UpstreamResult<AgentRecord> {
        debug!(slug = %spec.slug, "creating upstream agent");
        let resp = self
            .client
            .post(self.url("/v1/replicas"))
            .json(spec)
            .send()
            .await
            .map_err(transport_error)?;

        let resp = check(resp).await?;
        resp.json::<AgentRecord>().await.map_err(parse_error)
    }

    async fn chat(&self, agent: Uuid, content: &str) -> UpstreamResult<AgentReply> {
        let resp = self
            .client
            .post(self.url(&format!("/v1/replicas/{}/chat/completions", agent)))
            .json(&ChatRequest {
                content,
                source: "api",
                skip_chat_history: false,
            })
            .send()
            .await
            .map_err(transport_error)?;

        let resp = check(resp).await?;
        resp.json::<AgentReply>().await.map_err(parse_error)
    }
}
