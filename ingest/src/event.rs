use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::api::IngestError;
use crate::scrub::{sanitize_url, scrub};
use crate::utils::uuid_v7;

/// Per-category fan-out caps. Oversized batches are truncated, not
/// rejected, so a misbehaving tracker degrades instead of erroring.
pub const MAX_ANALYTICS_EVENTS: usize = 100;
pub const MAX_DEBUG_EVENTS: usize = 50;
pub const MAX_FORM_EVENTS: usize = 20;

// Field ceilings. All defaulting and clamping lives here in the
// normalizer; nothing downstream re-checks ranges.
pub const MAX_TIME_SPENT_MS: u64 = 3_600_000; // one hour
pub const MAX_NETWORK_DURATION_MS: u64 = 300_000; // five minutes
pub const MAX_VIEWPORT_PX: u32 = 16_384;
pub const MAX_TEXT_LEN: usize = 2_000;
pub const MAX_STACK_LEN: usize = 8_000;
pub const MAX_URL_LEN: usize = 2_048;
pub const MAX_ID_LEN: usize = 128;
pub const MAX_EXPERIMENT_IDS: usize = 20;

// Client timestamps earlier than 2020 are clock garbage, as are ones more
// than a day ahead of the server clock.
const MIN_CLIENT_TIMESTAMP_MS: i64 = 1_577_836_800_000;
const MAX_CLOCK_SKEW_MS: i64 = 86_400_000;

/// Form field names that mark the whole event as sensitive. Matching events
/// are dropped before normalization and never reach the store or the logs.
static SENSITIVE_FIELD_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|passwd|pwd|secret|token|card|cvv|cvc|ssn|social|pin)").unwrap()
});

#[derive(Debug, Default, Deserialize)]
pub struct RawBatchEnvelope {
    pub site_id: Option<String>,
    pub session_id: Option<String>,
    pub visitor_id: Option<String>,
    #[serde(default)]
    pub batch: RawBatch,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawBatch {
    #[serde(default)]
    pub analytics: Vec<Value>,
    #[serde(default)]
    pub debug: Vec<Value>,
    #[serde(default)]
    pub forms: Vec<Value>,
}

/// Legacy /ingest/collect bodies: a bare array or a single analytics event.
#[derive(Deserialize)]
#[serde(untagged)]
pub enum RawCollectRequest {
    Array(Vec<Value>),
    One(Box<Value>),
}

impl RawCollectRequest {
    pub fn events(self) -> Vec<Value> {
        match self {
            RawCollectRequest::Array(events) => events,
            RawCollectRequest::One(event) => vec![*event],
        }
    }
}

// Raw event shapes. Unknown fields are dropped by serde so newer trackers
// keep working against this revision of the service.

#[derive(Debug, Default, Deserialize)]
struct RawAnalyticsEvent {
    event_type: Option<String>,
    timestamp: Option<i64>,
    page_url: Option<String>,
    page_title: Option<String>,
    referrer: Option<String>,
    viewport_width: Option<i64>,
    viewport_height: Option<i64>,
    x: Option<f64>,
    y: Option<f64>,
    scroll_depth: Option<f64>,
    experiment_ids: Option<Vec<String>>,
    variant_ids: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
enum RawDebugEvent {
    Console {
        level: Option<String>,
        message: Option<String>,
        stack: Option<String>,
        timestamp: Option<i64>,
    },
    Network {
        method: Option<String>,
        url: Option<String>,
        status: Option<i64>,
        duration_ms: Option<i64>,
        timestamp: Option<i64>,
    },
    WebVital {
        name: Option<String>,
        value: Option<f64>,
        rating: Option<String>,
        timestamp: Option<i64>,
    },
}

#[derive(Debug, Default, Deserialize)]
struct RawFormEvent {
    form_id: Option<String>,
    field_id: Option<String>,
    field_name: Option<String>,
    field_type: Option<String>,
    interaction: Option<String>,
    field_index: Option<i64>,
    time_spent_ms: Option<i64>,
    refill_count: Option<i64>,
    timestamp: Option<i64>,
}

/// Request-scoped identity stamped onto every normalized row.
#[derive(Clone, Debug)]
pub struct RowContext {
    pub site_id: Uuid,
    pub session_id: String,
    pub visitor_id: Option<String>,
    /// Server receive time in unix milliseconds, always distinct from the
    /// client-reported event timestamp.
    pub received_at: i64,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct AnalyticsRow {
    pub uuid: Uuid,
    pub site_id: Uuid,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visitor_id: Option<String>,
    pub event_type: String,
    pub timestamp: i64,
    pub received_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    pub viewport_width: u32,
    pub viewport_height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scroll_depth: Option<u8>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub experiment_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub variant_ids: Vec<String>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct DebugRow {
    pub uuid: Uuid,
    pub site_id: Uuid,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visitor_id: Option<String>,
    pub timestamp: i64,
    pub received_at: i64,
    #[serde(flatten)]
    pub detail: DebugDetail,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum DebugDetail {
    Console {
        level: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
    Network {
        method: String,
        url: String,
        status: u16,
        duration_ms: u64,
    },
    WebVital {
        name: String,
        value: f64,
        rating: String,
    },
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FormInteraction {
    Focus,
    Blur,
    Change,
    Submit,
    Abandon,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct FormRow {
    pub uuid: Uuid,
    pub site_id: Uuid,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visitor_id: Option<String>,
    pub timestamp: i64,
    pub received_at: i64,
    pub form_id: String,
    pub field_id: String,
    pub field_name: String,
    pub field_type: String,
    pub interaction: FormInteraction,
    pub field_index: u8,
    pub time_spent_ms: u64,
    pub refill_count: u8,
}

fn clamp_u32(value: Option<i64>, max: u32) -> u32 {
    value.unwrap_or(0).clamp(0, max as i64) as u32
}

fn clamp_coord(value: Option<f64>) -> Option<u32> {
    value.map(|v| {
        if v.is_finite() {
            v.clamp(0.0, MAX_VIEWPORT_PX as f64) as u32
        } else {
            0
        }
    })
}

/// Scrub then truncate on a char boundary. Truncation after scrubbing, so a
/// marker is never cut in half.
fn clean_text(value: &str, max: usize) -> String {
    let scrubbed = scrub(value);
    if scrubbed.chars().count() <= max {
        scrubbed
    } else {
        scrubbed.chars().take(max).collect()
    }
}

fn clean_url(value: &str) -> String {
    let sanitized = sanitize_url(value);
    clean_text(&sanitized, MAX_URL_LEN)
}

fn clean_ids(ids: Option<Vec<String>>) -> Vec<String> {
    ids.unwrap_or_default()
        .into_iter()
        .filter(|id| !id.is_empty())
        .map(|id| clean_text(&id, MAX_ID_LEN))
        .take(MAX_EXPERIMENT_IDS)
        .collect()
}

/// Client clocks are untrusted: out-of-range timestamps collapse to the
/// server receive time instead of poisoning session reconstruction.
fn normalize_timestamp(client_ms: Option<i64>, received_at: i64) -> i64 {
    match client_ms {
        Some(ts) if ts >= MIN_CLIENT_TIMESTAMP_MS && ts <= received_at + MAX_CLOCK_SKEW_MS => ts,
        _ => received_at,
    }
}

pub fn normalize_analytics(raw: Value, ctx: &RowContext) -> Result<AnalyticsRow, IngestError> {
    let event: RawAnalyticsEvent = serde_json::from_value(raw)?;

    let event_type = match event.event_type {
        Some(t) if !t.is_empty() => clean_text(&t, MAX_ID_LEN),
        _ => return Err(IngestError::ValidationError("event_type")),
    };

    Ok(AnalyticsRow {
        uuid: uuid_v7(),
        site_id: ctx.site_id,
        session_id: ctx.session_id.clone(),
        visitor_id: ctx.visitor_id.clone(),
        event_type,
        timestamp: normalize_timestamp(event.timestamp, ctx.received_at),
        received_at: ctx.received_at,
        page_url: event.page_url.as_deref().map(clean_url),
        page_title: event.page_title.map(|t| clean_text(&t, MAX_TEXT_LEN)),
        referrer: event.referrer.as_deref().map(clean_url),
        viewport_width: clamp_u32(event.viewport_width, MAX_VIEWPORT_PX),
        viewport_height: clamp_u32(event.viewport_height, MAX_VIEWPORT_PX),
        x: clamp_coord(event.x),
        y: clamp_coord(event.y),
        scroll_depth: event
            .scroll_depth
            .map(|d| if d.is_finite() { d.clamp(0.0, 100.0) as u8 } else { 0 }),
        experiment_ids: clean_ids(event.experiment_ids),
        variant_ids: clean_ids(event.variant_ids),
    })
}

const WEB_VITAL_NAMES: &[&str] = &["CLS", "LCP", "FCP", "INP", "TTFB", "FID"];
const WEB_VITAL_RATINGS: &[&str] = &["good", "needs-improvement", "poor"];
const CONSOLE_LEVELS: &[&str] = &["log", "info", "warn", "error"];

pub fn normalize_debug(raw: Value, ctx: &RowContext) -> Result<DebugRow, IngestError> {
    let event: RawDebugEvent = serde_json::from_value(raw)?;

    let (timestamp, detail) = match event {
        RawDebugEvent::Console {
            level,
            message,
            stack,
            timestamp,
        } => {
            let level = match level {
                Some(l) if CONSOLE_LEVELS.contains(&l.as_str()) => l,
                _ => "log".to_string(),
            };
            let message = match message {
                Some(m) if !m.is_empty() => clean_text(&m, MAX_TEXT_LEN),
                _ => return Err(IngestError::ValidationError("message")),
            };
            let detail = DebugDetail::Console {
                level,
                message,
                stack: stack.map(|s| clean_text(&s, MAX_STACK_LEN)),
            };
            (timestamp, detail)
        }
        RawDebugEvent::Network {
            method,
            url,
            status,
            duration_ms,
            timestamp,
        } => {
            let url = match url {
                Some(u) if !u.is_empty() => clean_url(&u),
                _ => return Err(IngestError::ValidationError("url")),
            };
            let detail = DebugDetail::Network {
                method: method
                    .map(|m| clean_text(&m.to_ascii_uppercase(), 16))
                    .unwrap_or_else(|| "GET".to_string()),
                url,
                status: status.unwrap_or(0).clamp(0, 599) as u16,
                duration_ms: duration_ms.unwrap_or(0).clamp(0, MAX_NETWORK_DURATION_MS as i64)
                    as u64,
            };
            (timestamp, detail)
        }
        RawDebugEvent::WebVital {
            name,
            value,
            rating,
            timestamp,
        } => {
            let name = match name {
                Some(n) if WEB_VITAL_NAMES.contains(&n.as_str()) => n,
                _ => return Err(IngestError::ValidationError("name")),
            };
            // No default-fill: a vital without a measurement is noise
            let value = match value {
                Some(v) if v.is_finite() && v >= 0.0 => v,
                _ => return Err(IngestError::ValidationError("value")),
            };
            let rating = match rating {
                Some(r) if WEB_VITAL_RATINGS.contains(&r.as_str()) => r,
                _ => "unknown".to_string(),
            };
            (timestamp, DebugDetail::WebVital { name, value, rating })
        }
    };

    Ok(DebugRow {
        uuid: uuid_v7(),
        site_id: ctx.site_id,
        session_id: ctx.session_id.clone(),
        visitor_id: ctx.visitor_id.clone(),
        timestamp: normalize_timestamp(timestamp, ctx.received_at),
        received_at: ctx.received_at,
        detail,
    })
}

/// Returns Ok(None) for sensitive fields: dropped wholesale, not an error,
/// and nothing about them may appear in logs or error messages.
pub fn normalize_form(raw: Value, ctx: &RowContext) -> Result<Option<FormRow>, IngestError> {
    let event: RawFormEvent = serde_json::from_value(raw)?;

    let field_type = event.field_type.unwrap_or_default();
    let field_name = event.field_name.unwrap_or_default();
    if field_type.eq_ignore_ascii_case("password") || SENSITIVE_FIELD_NAME.is_match(&field_name) {
        return Ok(None);
    }

    let interaction: FormInteraction = match event.interaction {
        Some(i) => serde_json::from_value(Value::String(i))
            .map_err(|_| IngestError::ValidationError("interaction"))?,
        None => return Err(IngestError::ValidationError("interaction")),
    };

    Ok(Some(FormRow {
        uuid: uuid_v7(),
        site_id: ctx.site_id,
        session_id: ctx.session_id.clone(),
        visitor_id: ctx.visitor_id.clone(),
        timestamp: normalize_timestamp(event.timestamp, ctx.received_at),
        received_at: ctx.received_at,
        form_id: clean_text(&event.form_id.unwrap_or_default(), MAX_ID_LEN),
        field_id: clean_text(&event.field_id.unwrap_or_default(), MAX_ID_LEN),
        field_name: clean_text(&field_name, MAX_ID_LEN),
        field_type: clean_text(&field_type, 32),
        interaction,
        field_index: event.field_index.unwrap_or(0).clamp(0, 255) as u8,
        time_spent_ms: event
            .time_spent_ms
            .unwrap_or(0)
            .clamp(0, MAX_TIME_SPENT_MS as i64) as u64,
        refill_count: event.refill_count.unwrap_or(0).clamp(0, 255) as u8,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> RowContext {
        RowContext {
            site_id: Uuid::parse_str("6f2b8a9e-0c1d-4e5f-8a7b-9c0d1e2f3a4b").unwrap(),
            session_id: "session-1".to_string(),
            visitor_id: Some("visitor-1".to_string()),
            received_at: 1_700_000_000_000,
        }
    }

    #[test]
    fn analytics_click_event_normalizes() {
        let raw = json!({
            "event_type": "click",
            "timestamp": 1_699_999_999_000i64,
            "page_url": "https://shop.example.com/cart?item=1",
            "viewport_width": 1920,
            "viewport_height": 1080,
            "x": 100.4,
            "y": -5.0,
            "experiment_ids": ["exp-1"],
            "variant_ids": ["b"],
            "some_future_field": {"ignored": true}
        });
        let row = normalize_analytics(raw, &ctx()).unwrap();
        assert_eq!(row.event_type, "click");
        assert_eq!(row.timestamp, 1_699_999_999_000);
        assert_eq!(row.received_at, 1_700_000_000_000);
        assert_eq!(row.x, Some(100));
        assert_eq!(row.y, Some(0)); // negative coordinate clamps to zero
        assert_eq!(row.experiment_ids, vec!["exp-1".to_string()]);
    }

    #[test]
    fn analytics_requires_event_type() {
        let err = normalize_analytics(json!({"timestamp": 1}), &ctx()).unwrap_err();
        assert!(matches!(err, IngestError::ValidationError("event_type")));
    }

    #[test]
    fn garbage_client_timestamp_falls_back_to_receive_time() {
        let raw = json!({"event_type": "pageview", "timestamp": 12345});
        let row = normalize_analytics(raw, &ctx()).unwrap();
        assert_eq!(row.timestamp, ctx().received_at);

        // Far-future clock also collapses
        let raw = json!({"event_type": "pageview", "timestamp": 9_999_999_999_999i64});
        let row = normalize_analytics(raw, &ctx()).unwrap();
        assert_eq!(row.timestamp, ctx().received_at);
    }

    #[test]
    fn analytics_page_url_is_sanitized() {
        let raw = json!({
            "event_type": "pageview",
            "page_url": "https://example.com/reset?token=abc123"
        });
        let row = normalize_analytics(raw, &ctx()).unwrap();
        assert!(!row.page_url.unwrap().contains("abc123"));
    }

    #[test]
    fn debug_union_parses_each_variant() {
        let console = json!({"event_type": "console", "level": "error", "message": "boom"});
        let network = json!({"event_type": "network", "method": "post", "url": "https://api.example.com", "status": 500, "duration_ms": 123});
        let vital = json!({"event_type": "web_vital", "name": "LCP", "value": 2.5, "rating": "good"});

        let row = normalize_debug(console, &ctx()).unwrap();
        assert!(matches!(row.detail, DebugDetail::Console { ref level, .. } if level == "error"));

        let row = normalize_debug(network, &ctx()).unwrap();
        assert!(
            matches!(row.detail, DebugDetail::Network { ref method, status, .. } if method == "POST" && status == 500)
        );

        let row = normalize_debug(vital, &ctx()).unwrap();
        assert!(matches!(row.detail, DebugDetail::WebVital { ref name, .. } if name == "LCP"));
    }

    #[test]
    fn web_vital_without_value_is_rejected() {
        let raw = json!({"event_type": "web_vital", "name": "LCP", "rating": "good"});
        let err = normalize_debug(raw, &ctx()).unwrap_err();
        assert!(matches!(err, IngestError::ValidationError("value")));
    }

    #[test]
    fn unknown_debug_discriminant_is_an_error() {
        let raw = json!({"event_type": "profiling", "data": 1});
        assert!(normalize_debug(raw, &ctx()).is_err());
    }

    #[test]
    fn console_message_is_scrubbed() {
        let raw = json!({
            "event_type": "console",
            "message": "login failed for bob@example.com"
        });
        let row = normalize_debug(raw, &ctx()).unwrap();
        match row.detail {
            DebugDetail::Console { message, .. } => {
                assert!(!message.contains("bob@example.com"));
                assert!(message.contains(crate::scrub::REDACTION_MARKER));
            }
            other => panic!("expected console detail, got {other:?}"),
        }
    }

    #[test]
    fn network_status_and_duration_clamp() {
        let raw = json!({
            "event_type": "network",
            "url": "https://api.example.com",
            "status": 12345,
            "duration_ms": 999_999_999
        });
        let row = normalize_debug(raw, &ctx()).unwrap();
        match row.detail {
            DebugDetail::Network {
                status,
                duration_ms,
                ..
            } => {
                assert_eq!(status, 599);
                assert_eq!(duration_ms, MAX_NETWORK_DURATION_MS);
            }
            other => panic!("expected network detail, got {other:?}"),
        }
    }

    #[test]
    fn password_fields_are_dropped_entirely() {
        let raw = json!({
            "field_name": "email",
            "field_type": "password",
            "interaction": "change"
        });
        assert!(normalize_form(raw, &ctx()).unwrap().is_none());

        let raw = json!({
            "field_name": "cc-card-number",
            "field_type": "text",
            "interaction": "change"
        });
        assert!(normalize_form(raw, &ctx()).unwrap().is_none());
    }

    #[test]
    fn form_counters_clamp_to_documented_ranges() {
        let raw = json!({
            "form_id": "checkout",
            "field_id": "qty",
            "field_name": "quantity",
            "field_type": "number",
            "interaction": "blur",
            "field_index": 9000,
            "time_spent_ms": 86_400_000,
            "refill_count": -3
        });
        let row = normalize_form(raw, &ctx()).unwrap().unwrap();
        assert_eq!(row.field_index, 255);
        assert_eq!(row.time_spent_ms, MAX_TIME_SPENT_MS);
        assert_eq!(row.refill_count, 0);
    }

    #[test]
    fn form_interaction_must_be_known() {
        let raw = json!({
            "field_name": "quantity",
            "interaction": "hover"
        });
        let err = normalize_form(raw, &ctx()).unwrap_err();
        assert!(matches!(err, IngestError::ValidationError("interaction")));
    }
}
