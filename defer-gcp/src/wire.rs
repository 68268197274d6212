//! JSON shapes and conventions shared by the Cloud Tasks and Cloud
//! Scheduler REST APIs.

use std::time::Duration;

use base64::Engine;
use defer_core::errors::TaskError;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use defer_core::task::{OAuthToken, OidcToken};

/// `10s`, `1.5s`: the protobuf `Duration` JSON form.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let nanos = duration.subsec_nanos();
    if nanos == 0 {
        return format!("{secs}s");
    }

    let mut fractional = format!("{nanos:09}");
    while fractional.ends_with('0') {
        fractional.pop();
    }
    format!("{secs}.{fractional}s")
}

pub fn parse_duration(raw: &str) -> Option<Duration> {
    let secs = raw.trim().strip_suffix('s')?;
    let (whole, fractional) = match secs.split_once('.') {
        Some((whole, fractional)) => (whole, fractional),
        None => (secs, ""),
    };
    let whole: u64 = whole.parse().ok()?;
    if fractional.len() > 9 || !fractional.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let nanos: u32 = if fractional.is_empty() {
        0
    } else {
        format!("{fractional:0<9}").parse().ok()?
    };
    Some(Duration::new(whole, nanos))
}

pub fn encode_body(body: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(body)
}

pub fn decode_body(body: &str) -> anyhow::Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(body)
        .map_err(|e| TaskError::validation(format!("body is not valid base64: {e}")).into_anyhow())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireOidcToken {
    pub service_account_email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
}

impl From<&OidcToken> for WireOidcToken {
    fn from(token: &OidcToken) -> Self {
        Self {
            service_account_email: token.service_account_email.clone(),
            audience: token.audience.clone(),
        }
    }
}

impl From<WireOidcToken> for OidcToken {
    fn from(token: WireOidcToken) -> Self {
        Self {
            service_account_email: token.service_account_email,
            audience: token.audience,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireOAuthToken {
    pub service_account_email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl From<&OAuthToken> for WireOAuthToken {
    fn from(token: &OAuthToken) -> Self {
        Self {
            service_account_email: token.service_account_email.clone(),
            scope: token.scope.clone(),
        }
    }
}

impl From<WireOAuthToken> for OAuthToken {
    fn from(token: WireOAuthToken) -> Self {
        Self {
            service_account_email: token.service_account_email,
            scope: token.scope,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GoogleErrorResponse {
    error: GoogleError,
}

#[derive(Debug, Deserialize)]
struct GoogleError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

/// The error half of a failed Google API response.
#[derive(Debug, thiserror::Error)]
pub enum GoogleApiError {
    #[error("{message} ({status})")]
    Status { message: String, status: String },
    #[error("{0}")]
    Message(String),
    #[error("{status} - {body}")]
    Unparsed { status: StatusCode, body: String },
}

impl GoogleApiError {
    pub fn decode(status: StatusCode, body: &str) -> Self {
        match serde_json::from_str::<GoogleErrorResponse>(body) {
            Ok(parsed) if !parsed.error.status.is_empty() => Self::Status {
                message: parsed.error.message,
                status: parsed.error.status,
            },
            Ok(parsed) => Self::Message(parsed.error.message),
            Err(_) => Self::Unparsed {
                status,
                body: body.to_string(),
            },
        }
    }
}

/// Map a failed API response onto the error taxonomy.
pub fn error_for_status(status: StatusCode, body: &str, context: &str) -> anyhow::Error {
    let api_error = GoogleApiError::decode(status, body);
    let message = format!("{context}: {api_error}");
    let error = match status {
        StatusCode::BAD_REQUEST => TaskError::validation(message),
        StatusCode::NOT_FOUND => TaskError::not_found(message),
        StatusCode::CONFLICT => TaskError::duplicate_task(message),
        _ => TaskError::queue_unavailable(message),
    };
    error
        .with_data(serde_json::json!({ "status": status.as_u16() }))
        .with_source(api_error.into())
        .into_anyhow()
}

/// Transport failures (DNS, connect, timeouts) are always transient.
pub fn transport_error(err: reqwest::Error, context: &str) -> anyhow::Error {
    TaskError::queue_unavailable(format!("{context}: {err}")).into_anyhow()
}
