use axum::http::header::RETRY_AFTER;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Per-category write tally returned to the tracker. The only artifact the
/// caller sees; it is never persisted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct BatchResult {
    pub analytics: u64,
    pub debug: u64,
    pub forms: u64,
    pub errors: u64,
}

impl BatchResult {
    pub fn total_written(&self) -> u64 {
        self.analytics + self.debug + self.forms
    }
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct IngestResponse {
    pub success: bool,
    pub processed: BatchResult,
    pub duration_ms: u64,
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("failed to decode request: {0}")]
    RequestDecodingError(String),
    #[error("failed to parse request: {0}")]
    RequestParsingError(#[from] serde_json::Error),
    #[error("payload exceeds the {0} byte limit")]
    PayloadTooLarge(usize),
    #[error("request holds no event")]
    EmptyBatch,

    #[error("request submitted without a site id")]
    MissingSiteId,
    #[error("site id is not a valid UUID")]
    InvalidSiteId,
    #[error("envelope site id does not match the authenticated site")]
    SiteIdMismatch,
    #[error("site is not registered")]
    UnknownSite,
    #[error("site is banned")]
    SiteBanned,
    #[error("request submitted without an API key")]
    MissingApiKey,
    #[error("API key does not match the site key")]
    ApiKeyMismatch,
    #[error("origin is not allowed for this site")]
    OriginNotAllowed,

    #[error("rate limited, retry after {retry_after}s")]
    RateLimited { limit: u64, retry_after: u64 },

    #[error("invalid value for field {0}")]
    ValidationError(&'static str),

    #[error("control plane lookup failed")]
    ControlPlaneUnavailable,

    #[error("transient store error, please retry")]
    RetryableSinkError,
    #[error("event row could not be written")]
    NonRetryableSinkError,
}

impl IngestError {
    /// Stable low-cardinality tag for metrics, independent of message wording.
    pub fn to_metric_tag(&self) -> &'static str {
        match self {
            IngestError::RequestDecodingError(_) => "decode_error",
            IngestError::RequestParsingError(_) => "parse_error",
            IngestError::PayloadTooLarge(_) => "payload_too_large",
            IngestError::EmptyBatch => "empty_batch",
            IngestError::MissingSiteId => "missing_site_id",
            IngestError::InvalidSiteId => "invalid_site_id",
            IngestError::SiteIdMismatch => "site_id_mismatch",
            IngestError::UnknownSite => "unknown_site",
            IngestError::SiteBanned => "site_banned",
            IngestError::MissingApiKey => "missing_api_key",
            IngestError::ApiKeyMismatch => "api_key_mismatch",
            IngestError::OriginNotAllowed => "origin_not_allowed",
            IngestError::RateLimited { .. } => "rate_limited",
            IngestError::ValidationError(_) => "validation_error",
            IngestError::ControlPlaneUnavailable => "control_plane_unavailable",
            IngestError::RetryableSinkError => "sink_retryable",
            IngestError::NonRetryableSinkError => "sink_non_retryable",
        }
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        match self {
            IngestError::RequestDecodingError(_)
            | IngestError::RequestParsingError(_)
            | IngestError::EmptyBatch
            | IngestError::MissingSiteId
            | IngestError::SiteIdMismatch
            | IngestError::ValidationError(_)
            | IngestError::NonRetryableSinkError => {
                (StatusCode::BAD_REQUEST, self.to_string()).into_response()
            }

            IngestError::InvalidSiteId
            | IngestError::UnknownSite
            | IngestError::SiteBanned
            | IngestError::MissingApiKey
            | IngestError::ApiKeyMismatch
            | IngestError::OriginNotAllowed => {
                (StatusCode::FORBIDDEN, self.to_string()).into_response()
            }

            IngestError::PayloadTooLarge(_) => {
                (StatusCode::PAYLOAD_TOO_LARGE, self.to_string()).into_response()
            }

            IngestError::RateLimited { limit, retry_after } => {
                let mut response =
                    (StatusCode::TOO_MANY_REQUESTS, self.to_string()).into_response();
                let headers = response.headers_mut();
                if let Ok(value) = retry_after.to_string().parse() {
                    headers.insert(RETRY_AFTER, value);
                }
                if let Ok(value) = limit.to_string().parse() {
                    headers.insert("X-RateLimit-Limit", value);
                }
                headers.insert(
                    "X-RateLimit-Remaining",
                    axum::http::HeaderValue::from_static("0"),
                );
                response
            }

            IngestError::ControlPlaneUnavailable | IngestError::RetryableSinkError => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string()).into_response()
            }
        }
    }
}

/// Success body shared by all ingestion endpoints.
pub fn success_response(processed: BatchResult, duration_ms: u64) -> Json<IngestResponse> {
    Json(IngestResponse {
        success: true,
        processed,
        duration_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_response_carries_backoff_headers() {
        let err = IngestError::RateLimited {
            limit: 600,
            retry_after: 42,
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "42");
        assert_eq!(response.headers().get("X-RateLimit-Limit").unwrap(), "600");
        assert_eq!(response.headers().get("X-RateLimit-Remaining").unwrap(), "0");
    }

    #[test]
    fn authorization_failures_are_forbidden() {
        for err in [
            IngestError::InvalidSiteId,
            IngestError::UnknownSite,
            IngestError::SiteBanned,
            IngestError::ApiKeyMismatch,
            IngestError::OriginNotAllowed,
        ] {
            assert_eq!(err.into_response().status(), StatusCode::FORBIDDEN);
        }
    }

    #[test]
    fn oversized_payload_is_413() {
        let response = IngestError::PayloadTooLarge(500 * 1024).into_response();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
