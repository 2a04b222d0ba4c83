//! Account-bootstrap flow: an ordered sequence of gRPC-Web calls that
//! provision an upstream account context. The step list and payloads are
//! owned by the caller; this module owns framing, response parsing and the
//! short-circuit on the first failed step.

use bytes::Bytes;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use serde::Serialize;
use tracing::instrument;

use crate::grpc_web::{encode_grpc_web_frame, parse_grpc_web_response};

pub const GRPC_WEB_CONTENT_TYPE: &str = "application/grpc-web+proto";

/// One call in the bootstrap sequence. The payload is an opaque,
/// already-encoded protobuf message.
#[derive(Debug, Clone)]
pub struct BootstrapCall {
    /// Step name reported in the outcome, e.g. `create-anon-user`.
    pub step: String,
    pub url: String,
    pub payload: Vec<u8>,
}

/// Outcome of one step.
#[derive(Debug, Clone, Serialize)]
pub struct BootstrapStep {
    pub step: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grpc_status: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of the whole flow: per-step records, plus the decoded messages of
/// the final successful step.
#[derive(Debug, Clone, Default)]
pub struct BootstrapOutcome {
    pub steps: Vec<BootstrapStep>,
    pub messages: Vec<Bytes>,
    pub ok: bool,
}

/// Run the bootstrap calls in order, stopping at the first step that fails.
/// Failures are data, not errors: the outcome always describes every step
/// that ran.
#[instrument(skip(client, calls, headers), fields(steps = calls.len()))]
pub async fn run_bootstrap(
    client: &reqwest::Client,
    calls: Vec<BootstrapCall>,
    headers: HeaderMap,
) -> BootstrapOutcome {
    let mut outcome = BootstrapOutcome::default();

    for call in calls {
        let step = run_step(client, &call, headers.clone()).await;
        let ok = step.record.ok;

        tracing::debug!(
            step = call.step,
            ok,
            status = step.record.status,
            grpc_status = step.record.grpc_status,
            "bootstrap step finished"
        );

        outcome.steps.push(step.record);
        if !ok {
            outcome.ok = false;
            return outcome;
        }
        outcome.messages = step.messages;
    }

    outcome.ok = true;
    outcome
}

struct StepResult {
    record: BootstrapStep,
    messages: Vec<Bytes>,
}

async fn run_step(client: &reqwest::Client, call: &BootstrapCall, headers: HeaderMap) -> StepResult {
    let failed = |status: Option<u16>, grpc_status: Option<i64>, error: String| StepResult {
        record: BootstrapStep {
            step: call.step.clone(),
            ok: false,
            status,
            grpc_status,
            error: Some(error),
        },
        messages: Vec::new(),
    };

    let response = client
        .post(&call.url)
        .headers(headers)
        .header(CONTENT_TYPE, GRPC_WEB_CONTENT_TYPE)
        .body(encode_grpc_web_frame(&call.payload))
        .send()
        .await;

    let response = match response {
        Ok(response) => response,
        Err(err) => return failed(None, None, err.to_string()),
    };

    let status = response.status();
    let response_headers = response.headers().clone();
    let content_type = response_headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let body = match response.bytes().await {
        Ok(body) => body,
        Err(err) => return failed(Some(status.as_u16()), None, err.to_string()),
    };

    if !status.is_success() {
        return failed(
            Some(status.as_u16()),
            None,
            format!("http status {status}"),
        );
    }

    let parsed =
        match parse_grpc_web_response(&body, Some(&response_headers), content_type.as_deref()) {
            Ok(parsed) => parsed,
            Err(err) => return failed(Some(status.as_u16()), None, err.to_string()),
        };

    if matches!(parsed.grpc_status, Some(code) if code != 0) {
        return failed(
            Some(status.as_u16()),
            parsed.grpc_status,
            parsed.grpc_message,
        );
    }

    StepResult {
        record: BootstrapStep {
            step: call.step.clone(),
            ok: true,
            status: Some(status.as_u16()),
            grpc_status: parsed.grpc_status,
            error: None,
        },
        messages: parsed.messages,
    }
}
