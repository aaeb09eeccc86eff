use std::time::Instant;

use axum::body::Body;
use axum::extract::{Query, Request, State};
use axum::http::header::{HeaderMap, HeaderValue, ORIGIN, VARY};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum_client_ip::InsecureClientIp;
use metrics::counter;
use serde::Deserialize;
use serde_json::json;
use tracing::instrument;
use uuid::Uuid;

use crate::api::{success_response, IngestError};
use crate::event::RowContext;
use crate::limiter::RateLimitDecision;
use crate::payload::{
    decode_bytes, parse_collect, parse_envelope, read_body, MAX_BATCH_PAYLOAD_SIZE,
    MAX_SINGLE_PAYLOAD_SIZE,
};
use crate::process::{normalize_batch, write_batch};
use crate::router;
use crate::site::ValidatedSite;

#[derive(Deserialize, Default)]
pub struct IngestQuery {
    pub site_id: Option<String>,
    pub session_id: Option<String>,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Site id travels in the query string or the X-Site-Id header so the
/// gatekeeper and rate limiter run before the body is ever buffered.
fn site_id_from(meta: &IngestQuery, headers: &HeaderMap) -> Result<String, IngestError> {
    meta.site_id
        .clone()
        .or_else(|| header_str(headers, "x-site-id").map(String::from))
        .ok_or(IngestError::MissingSiteId)
}

/// Cheapest checks first: id shape, then the volume ceilings, then the
/// trust chain. The limiter sits in front of the control-plane lookup so
/// site-enumeration probes are throttled like any other traffic instead of
/// each paying a fresh lookup. Nothing past this point runs for a rejected
/// request.
async fn authorize(
    state: &router::State,
    ip: &InsecureClientIp,
    meta: &IngestQuery,
    headers: &HeaderMap,
) -> Result<(ValidatedSite, RateLimitDecision), IngestError> {
    let site_id = site_id_from(meta, headers)?;
    let id = Uuid::parse_str(&site_id).map_err(|_| IngestError::InvalidSiteId)?;

    // Counter key from the parsed id, so spelling variants of one site
    // share a window
    let decision = state
        .limiter
        .check(&ip.0.to_string(), &id.to_string())
        .await
        .into_result()?;

    let origin = header_str(headers, ORIGIN.as_str());
    let api_key = header_str(headers, "x-api-key");
    let site = state.gatekeeper.verify(&site_id, origin, api_key).await?;

    Ok((site, decision))
}

/// Emits per-request CORS headers reflecting the validated origin. The
/// restrictive default is simply no CORS headers at all.
fn apply_response_headers(
    response: &mut Response,
    site: &ValidatedSite,
    decision: &RateLimitDecision,
) {
    let headers = response.headers_mut();
    if let Some(origin) = &site.allowed_origin {
        if let Ok(value) = HeaderValue::from_str(origin) {
            headers.insert("Access-Control-Allow-Origin", value);
            headers.insert(VARY, HeaderValue::from_static("Origin"));
        }
    }
    if let Ok(value) = decision.limit.to_string().parse() {
        headers.insert("X-RateLimit-Limit", value);
    }
    if let Ok(value) = decision.remaining.to_string().parse() {
        headers.insert("X-RateLimit-Remaining", value);
    }
}

/// POST /ingest/batch: mixed-category envelope, up to 2 MB compressed.
#[instrument(skip_all, fields(site_id, batch_size))]
pub async fn batch(
    state: State<router::State>,
    ip: InsecureClientIp,
    meta: Query<IngestQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, IngestError> {
    let start = Instant::now();
    let (site, decision) = authorize(&state, &ip, &meta, &headers).await?;

    let bytes = read_body(&headers, body, MAX_BATCH_PAYLOAD_SIZE).await?;
    let text = decode_bytes(bytes, MAX_BATCH_PAYLOAD_SIZE)?;
    let envelope = parse_envelope(&text)?;

    // The envelope may repeat the site id; it must then agree with the
    // authenticated one. Compared as UUID values, not strings, so casing
    // differences are not a mismatch.
    if let Some(envelope_site) = &envelope.site_id {
        if Uuid::parse_str(envelope_site).ok() != Some(site.id) {
            return Err(IngestError::SiteIdMismatch);
        }
    }

    let session_id = envelope
        .session_id
        .ok_or(IngestError::ValidationError("session_id"))?;

    let raw = envelope.batch;
    let total = raw.analytics.len() + raw.debug.len() + raw.forms.len();
    if total == 0 {
        return Err(IngestError::EmptyBatch);
    }
    tracing::Span::current().record("batch_size", total);
    counter!("ingest_events_received_total").increment(total as u64);

    let ctx = RowContext {
        site_id: site.id,
        session_id,
        visitor_id: envelope.visitor_id,
        received_at: state.timesource.current_millis(),
    };

    let normalized = normalize_batch(raw.analytics, raw.debug, raw.forms, &ctx);
    let processed = write_batch(state.sink.clone(), normalized).await;

    let mut response =
        success_response(processed, start.elapsed().as_millis() as u64).into_response();
    apply_response_headers(&mut response, &site, &decision);
    Ok(response)
}

/// POST /ingest/debug: single-category variant, 500 KB, up to 50 events.
/// Other categories in the envelope are ignored rather than errored.
#[instrument(skip_all, fields(site_id, batch_size))]
pub async fn debug(
    state: State<router::State>,
    ip: InsecureClientIp,
    meta: Query<IngestQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, IngestError> {
    let start = Instant::now();
    let (site, decision) = authorize(&state, &ip, &meta, &headers).await?;

    let bytes = read_body(&headers, body, MAX_SINGLE_PAYLOAD_SIZE).await?;
    let text = decode_bytes(bytes, MAX_SINGLE_PAYLOAD_SIZE)?;
    let envelope = parse_envelope(&text)?;

    if let Some(envelope_site) = &envelope.site_id {
        if Uuid::parse_str(envelope_site).ok() != Some(site.id) {
            return Err(IngestError::SiteIdMismatch);
        }
    }

    let session_id = envelope
        .session_id
        .ok_or(IngestError::ValidationError("session_id"))?;
    if envelope.batch.debug.is_empty() {
        return Err(IngestError::EmptyBatch);
    }
    tracing::Span::current().record("batch_size", envelope.batch.debug.len());
    counter!("ingest_events_received_total").increment(envelope.batch.debug.len() as u64);

    let ctx = RowContext {
        site_id: site.id,
        session_id,
        visitor_id: envelope.visitor_id,
        received_at: state.timesource.current_millis(),
    };

    let normalized = normalize_batch(vec![], envelope.batch.debug, vec![], &ctx);
    let processed = write_batch(state.sink.clone(), normalized).await;

    let mut response =
        success_response(processed, start.elapsed().as_millis() as u64).into_response();
    apply_response_headers(&mut response, &site, &decision);
    Ok(response)
}

/// POST /ingest/collect: legacy trackers send a bare array or a single
/// analytics event, no envelope and no category split.
#[instrument(skip_all, fields(site_id, batch_size))]
pub async fn collect(
    state: State<router::State>,
    ip: InsecureClientIp,
    meta: Query<IngestQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, IngestError> {
    let start = Instant::now();
    let (site, decision) = authorize(&state, &ip, &meta, &headers).await?;

    let bytes = read_body(&headers, body, MAX_SINGLE_PAYLOAD_SIZE).await?;
    let text = decode_bytes(bytes, MAX_SINGLE_PAYLOAD_SIZE)?;
    let events = parse_collect(&text)?;
    if events.is_empty() {
        return Err(IngestError::EmptyBatch);
    }
    tracing::Span::current().record("batch_size", events.len());
    counter!("ingest_events_received_total").increment(events.len() as u64);

    let ctx = RowContext {
        site_id: site.id,
        // Legacy trackers predate session tracking
        session_id: meta
            .session_id
            .clone()
            .unwrap_or_else(|| "legacy".to_string()),
        visitor_id: None,
        received_at: state.timesource.current_millis(),
    };

    let normalized = normalize_batch(events, vec![], vec![], &ctx);
    let processed = write_batch(state.sink.clone(), normalized).await;

    let mut response =
        success_response(processed, start.elapsed().as_millis() as u64).into_response();
    apply_response_headers(&mut response, &site, &decision);
    Ok(response)
}

/// A 429 is emitted before the origin is validated, so success-path CORS
/// never applies to it. Reflect the raw request origin on that status only:
/// the backoff headers are useless to a browser tracker it cannot read.
pub async fn reflect_backoff_origin(request: Request, next: Next) -> Response {
    let origin = request.headers().get(ORIGIN).cloned();
    let mut response = next.run(request).await;

    if response.status() == StatusCode::TOO_MANY_REQUESTS {
        if let Some(origin) = origin {
            let headers = response.headers_mut();
            headers.insert("Access-Control-Allow-Origin", origin);
            headers.insert(VARY, HeaderValue::from_static("Origin"));
        }
    }
    response
}

/// CORS preflight. Answered without authentication, rate limiting or any
/// store access; the POST that follows is where trust is established.
pub async fn preflight(headers: HeaderMap) -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let out = response.headers_mut();

    if let Some(origin) = headers.get(ORIGIN) {
        out.insert("Access-Control-Allow-Origin", origin.clone());
        out.insert(VARY, HeaderValue::from_static("Origin"));
    }
    out.insert(
        "Access-Control-Allow-Methods",
        HeaderValue::from_static("POST, OPTIONS"),
    );
    out.insert(
        "Access-Control-Allow-Headers",
        HeaderValue::from_static("Content-Type, Content-Encoding, X-Site-Id, X-Api-Key"),
    );
    out.insert(
        "Access-Control-Max-Age",
        HeaderValue::from_static("3600"),
    );
    response
}

/// GET /ingest/health: liveness plus which counter store the limiter is
/// running on, so operators can spot instances that lost Redis.
pub async fn health(state: State<router::State>) -> Response {
    Json(json!({
        "status": "ok",
        "rate_limiter": state.limiter.backend().as_str(),
        "timestamp": state.timesource.current_time(),
    }))
    .into_response()
}
