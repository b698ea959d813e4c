//! HTTP side of a mimic session: create, end, reference video, socket address.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use crate::config::ServerConfig;
use crate::error::ApiError;

/// Opaque server handle for one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Accepts `"42"` as well as `42`.
impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Int(i64),
            Uint(u64),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => SessionId(s),
            Raw::Int(n) => SessionId(n.to_string()),
            Raw::Uint(n) => SessionId(n.to_string()),
        })
    }
}

/// Results view route for a finished session.
pub fn results_route(id: &SessionId) -> String {
    format!("/results/{}", id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOutcome {
    Ended,
    /// The socket path (or an earlier call) already closed it.
    AlreadyEnded,
}

#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn create_session(&self, challenge_id: &str) -> Result<SessionId, ApiError>;

    /// Idempotent; a session that is already closed is not an error.
    async fn end_session(&self, id: &SessionId) -> Result<EndOutcome, ApiError>;

    async fn fetch_reference_video(&self, challenge_id: &str) -> Result<Bytes, ApiError>;

    /// Socket address for a session, bearer token in the query string.
    fn socket_url(&self, id: &SessionId) -> Result<Url, ApiError>;
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    challenge_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    #[serde(alias = "id")]
    session_id: SessionId,
}

/// reqwest-backed implementation.
pub struct HttpSessionApi {
    client: Client,
    api_base: Url,
    ws_base: Url,
    token: String,
}

impl HttpSessionApi {
    pub fn new(config: &ServerConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            api_base: Url::parse(&config.api_base)?,
            ws_base: Url::parse(&config.ws_base())?,
            token: config.token.clone(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        with_segments(&self.api_base, segments)
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.token.is_empty() {
            req
        } else {
            req.bearer_auth(&self.token)
        }
    }
}

/// Appends escaped path segments, keeping any prefix already in `base`.
fn with_segments(base: &Url, segments: &[&str]) -> Result<Url, ApiError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

async fn error_for_status(resp: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ApiError::Status {
        status: status.as_u16(),
        body,
    })
}

/// 404 and 409 mean the session is already gone.
fn end_outcome(status: StatusCode) -> Option<EndOutcome> {
    if status.is_success() {
        Some(EndOutcome::Ended)
    } else if status == StatusCode::NOT_FOUND || status == StatusCode::CONFLICT {
        Some(EndOutcome::AlreadyEnded)
    } else {
        None
    }
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    async fn create_session(&self, challenge_id: &str) -> Result<SessionId, ApiError> {
        let url = self.endpoint(&["api", "mimic", "sessions"])?;
        let resp = self
            .authorized(self.client.post(url))
            .json(&CreateRequest { challenge_id })
            .send()
            .await?;
        let resp = error_for_status(resp).await?;
        let body: CreateResponse = resp
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        info!(session_id = %body.session_id, challenge_id, "session created");
        Ok(body.session_id)
    }

    async fn end_session(&self, id: &SessionId) -> Result<EndOutcome, ApiError> {
        let url = self.endpoint(&["api", "mimic", "sessions", id.as_str(), "end"])?;
        let resp = self.authorized(self.client.post(url)).send().await?;
        let status = resp.status();
        match end_outcome(status) {
            Some(outcome) => {
                debug!(session_id = %id, status = status.as_u16(), ?outcome, "end call returned");
                Ok(outcome)
            }
            None => {
                let body = resp.text().await.unwrap_or_default();
                Err(ApiError::Status {
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }

    async fn fetch_reference_video(&self, challenge_id: &str) -> Result<Bytes, ApiError> {
        let url = self.endpoint(&["api", "challenges", challenge_id, "video"])?;
        let resp = self.authorized(self.client.get(url)).send().await?;
        let resp = error_for_status(resp).await?;
        Ok(resp.bytes().await?)
    }

    fn socket_url(&self, id: &SessionId) -> Result<Url, ApiError> {
        let mut url = with_segments(&self.ws_base, &["ws", "mimic", id.as_str()])?;
        if !self.token.is_empty() {
            url.query_pairs_mut().append_pair("token", &self.token);
        }
        Ok(url)
    }
}
