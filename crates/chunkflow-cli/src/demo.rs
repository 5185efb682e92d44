//! Routes served by `chunkflow serve`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chunkflow_body::{Request, Response};
use chunkflow_core::Separator;
use chunkflow_json::encode_values;
use chunkflow_server::Routes;
use futures_util::StreamExt;
use http::header::{CONTENT_TYPE, HeaderValue};
use http::{HeaderMap, StatusCode};
use serde::Serialize;

/// Largest `n` accepted by `/count`.
const MAX_COUNT: u64 = 1_000_000;

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub seq: u64,
    pub kind: &'static str,
    pub at_ms: u64,
}

impl Event {
    fn new(seq: u64, kind: &'static str) -> Self {
        let at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self { seq, kind, at_ms }
    }
}

fn json_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers
}

pub fn routes(interval: Duration, separator: Separator) -> Routes {
    Routes::new()
        .get("/events", move |_req| async move {
            let ticks = futures_util::stream::unfold(
                (tokio::time::interval(interval), 0u64),
                |(mut timer, seq)| async move {
                    timer.tick().await;
                    Some((Event::new(seq, "tick"), (timer, seq + 1)))
                },
            );
            let body = encode_values(ticks, separator);
            Ok(Response::streaming(StatusCode::OK, json_headers(), body))
        })
        .get("/count", move |req: Request| async move {
            let Some(n) = count_param(&req) else {
                return Ok(Response::new(
                    StatusCode::BAD_REQUEST,
                    HeaderMap::new(),
                    format!("expected ?n=<0..={MAX_COUNT}>"),
                ));
            };
            let events = futures_util::stream::iter(0..n).map(|seq| Event::new(seq, "count"));
            Ok(Response::streaming(StatusCode::OK, json_headers(), encode_values(events, separator)))
        })
        .post("/echo", |req: Request| async move {
            let mut headers = HeaderMap::new();
            if let Some(content_type) = req.headers().get(CONTENT_TYPE) {
                headers.insert(CONTENT_TYPE, content_type.clone());
            }
            Ok(Response::streaming(StatusCode::OK, headers, req.into_body_stream()))
        })
        .get("/healthz", |_req| async {
            Ok(Response::new(StatusCode::OK, HeaderMap::new(), "ok"))
        })
}

fn count_param(req: &Request) -> Option<u64> {
    let query = req.uri().query()?;
    let n = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("n="))?
        .parse()
        .ok()?;
    (n <= MAX_COUNT).then_some(n)
}
