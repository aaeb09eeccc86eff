use std::io::prelude::*;

use axum::body::Body;
use axum::http::header::CONTENT_LENGTH;
use axum::http::HeaderMap;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::read::GzDecoder;
use futures::StreamExt;
use metrics::histogram;

use crate::api::IngestError;
use crate::event::{RawBatchEnvelope, RawCollectRequest};

/// Hard body ceilings, enforced before the whole body is buffered.
pub const MAX_SINGLE_PAYLOAD_SIZE: usize = 500 * 1024;
pub const MAX_BATCH_PAYLOAD_SIZE: usize = 2 * 1024 * 1024;

/// Decompressed output may legitimately exceed the wire size, but a
/// compliant tracker never comes close to this expansion factor.
const MAX_DECOMPRESSION_FACTOR: usize = 10;

static GZIP_MAGIC_NUMBERS: [u8; 3] = [0x1f, 0x8b, 8];

/// Buffers the request body up to `limit` bytes. A lying or absent
/// Content-Length does not help the caller: the declared size is checked
/// first, then the observed stream is bounded as it arrives.
pub async fn read_body(
    headers: &HeaderMap,
    body: Body,
    limit: usize,
) -> Result<Bytes, IngestError> {
    if let Some(declared) = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
    {
        if declared > limit {
            return Err(IngestError::PayloadTooLarge(limit));
        }
    }

    let mut stream = body.into_data_stream();
    let mut buf = BytesMut::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            IngestError::RequestDecodingError(format!("error reading request body: {e}"))
        })?;
        if buf.len() + chunk.len() > limit {
            return Err(IngestError::PayloadTooLarge(limit));
        }
        buf.put(chunk);
    }

    histogram!("ingest_payload_size_bytes").record(buf.len() as f64);
    Ok(buf.freeze())
}

/// Takes a body and tries to decompress and decode it to text. Trackers
/// send a Content-Encoding header, but enough requests arrive with the
/// header missing or wrong that we peek at the gzip magic bytes instead of
/// trusting it.
pub fn decode_bytes(bytes: Bytes, limit: usize) -> Result<String, IngestError> {
    tracing::debug!(len = bytes.len(), "decoding new request body");

    if bytes.starts_with(&GZIP_MAGIC_NUMBERS) {
        let bound = limit * MAX_DECOMPRESSION_FACTOR;
        let mut decoder = GzDecoder::new(bytes.reader()).take(bound as u64 + 1);
        let mut out = String::new();
        decoder.read_to_string(&mut out).map_err(|e| {
            tracing::error!("failed to decode gzip: {}", e);
            IngestError::RequestDecodingError(String::from("invalid gzip data"))
        })?;
        if out.len() > bound {
            return Err(IngestError::PayloadTooLarge(bound));
        }
        Ok(out)
    } else {
        String::from_utf8(bytes.into()).map_err(|e| {
            tracing::error!("failed to decode body: {}", e);
            IngestError::RequestDecodingError(String::from("invalid body encoding"))
        })
    }
}

pub fn parse_envelope(text: &str) -> Result<RawBatchEnvelope, IngestError> {
    Ok(serde_json::from_str::<RawBatchEnvelope>(text)?)
}

/// Legacy collect bodies: bare array or single analytics event object.
pub fn parse_collect(text: &str) -> Result<Vec<serde_json::Value>, IngestError> {
    Ok(serde_json::from_str::<RawCollectRequest>(text)?.events())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn gzip(data: &[u8]) -> Bytes {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        Bytes::from(encoder.finish().unwrap())
    }

    #[tokio::test]
    async fn declared_oversize_fails_before_buffering() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("600000"));
        let result = read_body(&headers, Body::from("tiny"), MAX_SINGLE_PAYLOAD_SIZE).await;
        assert!(matches!(result, Err(IngestError::PayloadTooLarge(_))));
    }

    #[tokio::test]
    async fn undeclared_oversize_fails_at_the_ceiling() {
        let body = Body::from(vec![b'x'; MAX_SINGLE_PAYLOAD_SIZE + 1]);
        let result = read_body(&HeaderMap::new(), body, MAX_SINGLE_PAYLOAD_SIZE).await;
        assert!(matches!(result, Err(IngestError::PayloadTooLarge(_))));
    }

    #[tokio::test]
    async fn body_within_limit_is_buffered() {
        let body = Body::from("hello world");
        let bytes = read_body(&HeaderMap::new(), body, 1024).await.unwrap();
        assert_eq!(bytes, Bytes::from("hello world"));
    }

    #[test]
    fn gzip_bodies_are_detected_by_magic_bytes() {
        let json = r#"{"site_id": "x", "batch": {}}"#;
        let decoded = decode_bytes(gzip(json.as_bytes()), MAX_BATCH_PAYLOAD_SIZE).unwrap();
        assert_eq!(decoded, json);
    }

    #[test]
    fn plain_utf8_passes_through() {
        let decoded = decode_bytes(Bytes::from("{}"), MAX_BATCH_PAYLOAD_SIZE).unwrap();
        assert_eq!(decoded, "{}");
    }

    #[test]
    fn truncated_gzip_is_a_decode_error() {
        let mut data = gzip(b"some payload").to_vec();
        data.truncate(data.len() - 4);
        let result = decode_bytes(Bytes::from(data), MAX_BATCH_PAYLOAD_SIZE);
        assert!(matches!(result, Err(IngestError::RequestDecodingError(_))));
    }

    #[test]
    fn decompression_bomb_is_bounded() {
        // 64 KiB of zeros compresses to well under the 1 KiB limit we pass
        let bomb = gzip(&vec![b'0'; 64 * 1024]);
        assert!(bomb.len() < 1024);
        let result = decode_bytes(bomb, 1024);
        assert!(matches!(result, Err(IngestError::PayloadTooLarge(_))));
    }

    #[test]
    fn envelope_parses_with_missing_optional_sections() {
        let envelope = parse_envelope(r#"{"site_id": "abc", "session_id": "s1", "batch": {"analytics": [{"event_type": "click"}]}}"#)
            .unwrap();
        assert_eq!(envelope.batch.analytics.len(), 1);
        assert!(envelope.batch.debug.is_empty());
        assert!(envelope.batch.forms.is_empty());
    }

    #[test]
    fn collect_accepts_bare_array_and_single_object() {
        assert_eq!(parse_collect(r#"[{"event_type": "click"}]"#).unwrap().len(), 1);
        assert_eq!(parse_collect(r#"{"event_type": "click"}"#).unwrap().len(), 1);
        assert!(parse_collect("not json").is_err());
    }
}
