//! Thin I/O against the upstream session endpoints: starting and continuing
//! conversations, sharing, and cloning shared conversations. Dynamic headers
//! (cookies, fingerprints) come from the embedding application; this module
//! only owns the URLs, payload shapes and response parsing.

use bytes::Bytes;
use error_stack::{Report, ResultExt};
use futures::{Stream, TryStreamExt};
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::instrument;

use crate::{
    rate_limit::{extract_rate_limit, request_kind_alias, RateLimitResult},
    Error,
};

/// Upstream conversation identity returned by a clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClonedConversation {
    pub conversation_id: String,
    pub last_response_id: String,
}

#[derive(Debug, Clone)]
pub struct SessionClient {
    client: reqwest::Client,
    base_url: String,
}

impl SessionClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { client, base_url }
    }

    /// Start a new upstream conversation. The payload is opaque to this
    /// crate; the response body is the NDJSON stream fed to the transformer.
    #[instrument(skip(self, headers, payload))]
    pub async fn start_conversation(
        &self,
        headers: HeaderMap,
        payload: &Value,
    ) -> Result<reqwest::Response, Report<Error>> {
        self.post_streaming("conversations/new", headers, payload)
            .await
    }

    /// Continue an existing upstream conversation from its last response.
    #[instrument(skip(self, headers, payload))]
    pub async fn continue_conversation(
        &self,
        conversation_id: &str,
        headers: HeaderMap,
        payload: &Value,
    ) -> Result<reqwest::Response, Report<Error>> {
        self.post_streaming(
            &format!("conversations/{conversation_id}/responses"),
            headers,
            payload,
        )
        .await
    }

    /// Create a share link for a response in a conversation. Returns the
    /// share link id.
    #[instrument(skip(self, headers))]
    pub async fn share_conversation(
        &self,
        conversation_id: &str,
        response_id: &str,
        headers: HeaderMap,
    ) -> Result<String, Report<Error>> {
        let response = self
            .client
            .post(self.url(&format!("conversations/{conversation_id}/share")))
            .headers(headers)
            .json(&json!({"responseId": response_id, "allowIndexing": true}))
            .send()
            .await
            .change_context(Error::SessionRequest)?;

        let body: ShareResponseBody = parse_json_body(check_status(response)?).await?;
        body.share_link_id
            .or(body.id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Report::new(Error::SessionResponse))
            .attach_printable("share response carried no link id")
    }

    /// Clone a shared conversation into the caller's account. The upstream
    /// cursor prefers the last assistant-sender response and falls back to
    /// the last response of any sender.
    #[instrument(skip(self, headers))]
    pub async fn clone_shared(
        &self,
        share_link_id: &str,
        headers: HeaderMap,
    ) -> Result<ClonedConversation, Report<Error>> {
        let response = self
            .client
            .post(self.url(&format!("share_links/{share_link_id}/clone")))
            .headers(headers)
            .json(&json!({}))
            .send()
            .await
            .change_context(Error::SessionRequest)?;

        let body: CloneResponseBody = parse_json_body(check_status(response)?).await?;

        let conversation_id = body
            .conversation
            .and_then(|c| c.conversation_id)
            .or(body.conversation_id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Report::new(Error::SessionResponse))
            .attach_printable("clone response carried no conversation id")?;

        let last_response_id = body
            .responses
            .iter()
            .rev()
            .find(|entry| entry.sender.eq_ignore_ascii_case("assistant"))
            .or_else(|| body.responses.last())
            .map(|entry| entry.response_id.clone())
            .unwrap_or_default();

        Ok(ClonedConversation {
            conversation_id,
            last_response_id,
        })
    }

    /// Query the upstream rate-limit surface for a model. Any failure is
    /// reported as an unknown limit, never an error.
    #[instrument(skip(self, headers))]
    pub async fn fetch_rate_limit(
        &self,
        model: &str,
        headers: HeaderMap,
        now_ms: i64,
    ) -> RateLimitResult {
        let kind = request_kind_alias(model);
        let response = self
            .client
            .post(self.url("rate-limits"))
            .headers(headers)
            .json(&json!({"requestKind": kind}))
            .send()
            .await;

        let response = match response {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                tracing::warn!(status = %response.status(), model, "rate-limit fetch failed");
                return RateLimitResult::unknown();
            }
            Err(err) => {
                tracing::warn!(?err, model, "rate-limit fetch failed");
                return RateLimitResult::unknown();
            }
        };

        match response.json::<Value>().await {
            Ok(payload) => extract_rate_limit(&payload, model, now_ms),
            Err(err) => {
                tracing::warn!(?err, model, "rate-limit response was not JSON");
                RateLimitResult::unknown()
            }
        }
    }

    async fn post_streaming(
        &self,
        path: &str,
        headers: HeaderMap,
        payload: &Value,
    ) -> Result<reqwest::Response, Report<Error>> {
        let response = self
            .client
            .post(self.url(path))
            .headers(headers)
            .json(payload)
            .send()
            .await
            .change_context(Error::SessionRequest)?;

        check_status(response)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

/// Adapt a response body into the byte stream the transformer consumes.
pub fn into_byte_stream(
    response: reqwest::Response,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send {
    response
        .bytes_stream()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response, Report<Error>> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(Report::new(Error::SessionRequest))
            .attach_printable_lazy(|| format!("upstream status {status}"))
    }
}

/// Parse a JSON response, with the failing path attached when the shape does
/// not match.
async fn parse_json_body<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, Report<Error>> {
    let text = response
        .text()
        .await
        .change_context(Error::SessionResponse)?;

    let jd = &mut serde_json::Deserializer::from_str(&text);
    serde_path_to_error::deserialize(jd)
        .change_context(Error::SessionResponse)
        .attach_printable_lazy(|| format!("body: {text}"))
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ShareResponseBody {
    #[serde(default)]
    share_link_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct CloneResponseBody {
    #[serde(default)]
    conversation: Option<CloneConversation>,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    responses: Vec<CloneResponseEntry>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct CloneConversation {
    #[serde(default)]
    conversation_id: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct CloneResponseEntry {
    #[serde(default)]
    response_id: String,
    #[serde(default)]
    sender: String,
}
