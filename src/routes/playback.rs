//! Range-addressable playback of recorded sessions.

use std::io::SeekFrom;

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::warn;

use crate::recording::recording_path;
use crate::relay::registry::is_valid_key;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PlaybackQuery {
    #[serde(default)]
    pub master: String,
}

/// How a `Range` header applies to a body of known length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOutcome {
    /// No usable range; serve the whole body.
    Full,
    /// Inclusive byte range within the body.
    Partial { start: u64, end: u64 },
    /// Syntactically valid but outside the body.
    Unsatisfiable,
}

/// Resolve a `Range` header value against a body of `len` bytes.
///
/// Supports a single `bytes=a-b`, `bytes=a-`, or `bytes=-n` range. An end
/// past the body is clamped. Malformed or multi-range values fall back to
/// [`RangeOutcome::Full`].
pub fn parse_range(value: &str, len: u64) -> RangeOutcome {
    let Some(spec) = value.trim().strip_prefix("bytes=") else {
        return RangeOutcome::Full;
    };
    if spec.contains(',') {
        return RangeOutcome::Full;
    }
    let Some((first, last)) = spec.trim().split_once('-') else {
        return RangeOutcome::Full;
    };
    let (first, last) = (first.trim(), last.trim());

    if first.is_empty() {
        // Suffix range: the last n bytes.
        let Ok(n) = last.parse::<u64>() else {
            return RangeOutcome::Full;
        };
        if n == 0 || len == 0 {
            return RangeOutcome::Unsatisfiable;
        }
        return RangeOutcome::Partial {
            start: len.saturating_sub(n),
            end: len - 1,
        };
    }

    let Ok(start) = first.parse::<u64>() else {
        return RangeOutcome::Full;
    };
    let end = if last.is_empty() {
        None
    } else {
        match last.parse::<u64>() {
            Ok(end) if end >= start => Some(end),
            _ => return RangeOutcome::Full,
        }
    };
    if start >= len {
        return RangeOutcome::Unsatisfiable;
    }
    RangeOutcome::Partial {
        start,
        end: end.map_or(len - 1, |e| e.min(len - 1)),
    }
}

fn error(status: StatusCode, code: &str, message: &str) -> Response {
    (status, Json(json!({"error": message, "code": code}))).into_response()
}

/// `GET /file?master=<key>`: stream the recording for `key`.
///
/// With a `Range` header the response is `206 Partial Content` carrying
/// `Content-Range`; without one it is `200 OK` with the whole file. Both
/// carry `Accept-Ranges: bytes` and `Content-Type: video/<container>`.
pub async fn playback(
    State(state): State<AppState>,
    Query(query): Query<PlaybackQuery>,
    headers: HeaderMap,
) -> Response {
    if !is_valid_key(&query.master) {
        return error(StatusCode::BAD_REQUEST, "INVALID_KEY", "Missing or invalid master key");
    }

    let recording = &state.config.recording;
    let path = recording_path(&recording.dir_path(), &query.master, &recording.container);
    let mut file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return error(StatusCode::NOT_FOUND, "RECORDING_NOT_FOUND", "Recording not found");
        }
        Err(e) => {
            warn!(path = %path.display(), "cannot open recording: {e}");
            return error(StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR", &e.to_string());
        }
    };
    let len = match file.metadata().await {
        Ok(meta) => meta.len(),
        Err(e) => return error(StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR", &e.to_string()),
    };

    let content_type = HeaderValue::from_str(&format!("video/{}", recording.container))
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map_or(RangeOutcome::Full, |v| parse_range(v, len));

    match range {
        RangeOutcome::Full => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, content_type),
                (header::ACCEPT_RANGES, HeaderValue::from_static("bytes")),
                (header::CONTENT_LENGTH, HeaderValue::from(len)),
            ],
            Body::from_stream(ReaderStream::new(file)),
        )
            .into_response(),
        RangeOutcome::Partial { start, end } => {
            if let Err(e) = file.seek(SeekFrom::Start(start)).await {
                return error(StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR", &e.to_string());
            }
            let count = end - start + 1;
            let content_range = format!("bytes {start}-{end}/{len}");
            (
                StatusCode::PARTIAL_CONTENT,
                [
                    (header::CONTENT_TYPE, content_type),
                    (header::ACCEPT_RANGES, HeaderValue::from_static("bytes")),
                    (header::CONTENT_LENGTH, HeaderValue::from(count)),
                    (
                        header::CONTENT_RANGE,
                        HeaderValue::from_str(&content_range)
                            .unwrap_or_else(|_| HeaderValue::from_static("bytes */0")),
                    ),
                ],
                Body::from_stream(ReaderStream::new(file.take(count))),
            )
                .into_response()
        }
        RangeOutcome::Unsatisfiable => {
            let content_range = HeaderValue::from_str(&format!("bytes */{len}"))
                .unwrap_or_else(|_| HeaderValue::from_static("bytes */0"));
            (
                StatusCode::RANGE_NOT_SATISFIABLE,
                [(header::CONTENT_RANGE, content_range)],
                Json(json!({"error": "Range not satisfiable", "code": "RANGE_NOT_SATISFIABLE"})),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::{http::Request, routing::get, Router};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[test]
    fn test_parse_range_forms() {
        assert_eq!(parse_range("bytes=0-2", 10), RangeOutcome::Partial { start: 0, end: 2 });
        assert_eq!(parse_range("bytes=4-", 10), RangeOutcome::Partial { start: 4, end: 9 });
        assert_eq!(parse_range("bytes=-3", 10), RangeOutcome::Partial { start: 7, end: 9 });
        assert_eq!(parse_range("bytes=-30", 10), RangeOutcome::Partial { start: 0, end: 9 });
        assert_eq!(parse_range("bytes=5-100", 10), RangeOutcome::Partial { start: 5, end: 9 });
    }

    #[test]
    fn test_parse_range_rejects() {
        assert_eq!(parse_range("bytes=10-", 10), RangeOutcome::Unsatisfiable);
        assert_eq!(parse_range("bytes=-0", 10), RangeOutcome::Unsatisfiable);
        assert_eq!(parse_range("bytes=0-", 0), RangeOutcome::Unsatisfiable);
        assert_eq!(parse_range("bytes=5-2", 10), RangeOutcome::Full);
        assert_eq!(parse_range("bytes=0-1,4-5", 10), RangeOutcome::Full);
        assert_eq!(parse_range("items=0-1", 10), RangeOutcome::Full);
        assert_eq!(parse_range("bytes=x-y", 10), RangeOutcome::Full);
    }

    fn app(dir: &std::path::Path) -> Router {
        let mut config = Config::default();
        config.recording.dir = dir.display().to_string();
        Router::new()
            .route("/file", get(playback))
            .with_state(AppState::new(config))
    }

    async fn get_file(app: Router, uri: &str, range: Option<&str>) -> Response {
        let mut req = Request::builder().uri(uri);
        if let Some(r) = range {
            req = req.header(header::RANGE, r);
        }
        app.oneshot(req.body(Body::empty()).unwrap()).await.unwrap()
    }

    #[tokio::test]
    async fn test_range_request_returns_partial_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("master_room1.webm"), (0u8..10).collect::<Vec<_>>()).unwrap();

        let resp = get_file(app(dir.path()), "/file?master=room1", Some("bytes=0-2")).await;
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.headers()[header::CONTENT_RANGE], "bytes 0-2/10");
        assert_eq!(resp.headers()[header::ACCEPT_RANGES], "bytes");
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "3");
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "video/webm");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], &[0, 1, 2]);
    }

    #[tokio::test]
    async fn test_full_request_streams_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("master_room1.webm"), b"0123456789").unwrap();

        let resp = get_file(app(dir.path()), "/file?master=room1", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "10");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"0123456789");
    }

    #[tokio::test]
    async fn test_unsatisfiable_range() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("master_room1.webm"), b"0123456789").unwrap();

        let resp = get_file(app(dir.path()), "/file?master=room1", Some("bytes=20-")).await;
        assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(resp.headers()[header::CONTENT_RANGE], "bytes */10");
    }

    #[tokio::test]
    async fn test_unknown_and_invalid_keys() {
        let dir = tempfile::tempdir().unwrap();
        let resp = get_file(app(dir.path()), "/file?master=nope", None).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["code"], "RECORDING_NOT_FOUND");

        let resp = get_file(app(dir.path()), "/file?master=..%2Fetc", None).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let resp = get_file(app(dir.path()), "/file", None).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
