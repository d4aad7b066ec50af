//! Streaming chat-completion requester.
//!
//! Issues a single logical request in streaming mode, honors server
//! throttling signals, and times per-token events on the response stream.
//! Failures never propagate out of `call`: the returned `RequestStats`
//! carries the last HTTP status and error instead.

use std::time::{Duration, Instant};

use futures_util::StreamExt;
use rand::Rng;
use reqwest::header::HeaderMap;
use reqwest::{Client, Response, StatusCode};
use thiserror::Error;

pub const REQUEST_ID_HEADER: &str = "apim-request-id";
pub const UTILIZATION_HEADER: &str = "azure-openai-deployment-utilization";
pub const RETRY_AFTER_MS_HEADER: &str = "retry-after-ms";
pub const RETRY_AFTER_HEADER: &str = "retry-after";
pub const TELEMETRY_USER_AGENT_HEADER: &str = "x-ms-useragent";
pub const USER_AGENT: &str = "aoai-benchmark";

/// Wall-clock budget for all retries of one logical request, across both
/// header-directed throttling sleeps and exponential backoff.
pub const MAX_RETRY_SECONDS: f64 = 5.0;

/// First rung of the exponential backoff ladder, in seconds.
const BACKOFF_BASE_SECONDS: f64 = 1.0;

/// Terminal failure of one logical request. Carries the HTTP status when
/// the server answered and the transport error when it did not.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("server returned status {status}")]
    Status { status: u16 },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl RequestError {
    /// The backoff policy retries transport errors and throttling; any
    /// other HTTP status is terminal.
    fn retryable(&self) -> bool {
        match self {
            Self::Status { status } => *status == 429,
            Self::Transport(_) => true,
        }
    }
}

/// Statistics collected for one attempted request, including retries.
#[derive(Debug)]
pub struct RequestStats {
    /// Set once, when the first attempt begins.
    pub request_start_time: Instant,
    /// Total POST attempts, throttling retries included.
    pub calls: u32,
    /// Last observed HTTP status; 0 if no response arrived.
    pub response_status_code: u16,
    /// When the final response headers arrived, for the successful call.
    pub response_time: Option<Instant>,
    /// When the first `data:` streaming line arrived.
    pub first_token_time: Option<Instant>,
    /// When the response stream closed.
    pub response_end_time: Option<Instant>,
    /// Prompt token count, set by the caller before aggregation.
    pub context_tokens: u64,
    /// Count of streamed `data:` lines; unset until the first arrives.
    pub generated_tokens: Option<u64>,
    /// Server-reported utilization percentage, if the header was present
    /// and well-formed.
    pub deployment_utilization: Option<f64>,
    pub last_exception: Option<RequestError>,
}

impl RequestStats {
    pub fn new() -> Self {
        Self {
            request_start_time: Instant::now(),
            calls: 0,
            response_status_code: 0,
            response_time: None,
            first_token_time: None,
            response_end_time: None,
            context_tokens: 0,
            generated_tokens: None,
            deployment_utilization: None,
            last_exception: None,
        }
    }
}

impl Default for RequestStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Makes streaming calls against one deployment URL and collects
/// per-request statistics.
pub struct Requester {
    api_key: String,
    url: String,
    backoff: bool,
}

impl Requester {
    pub fn new(api_key: String, url: String, backoff: bool) -> Self {
        Self {
            api_key,
            url,
            backoff,
        }
    }

    /// Makes one logical request with `body`, forcing streaming mode so
    /// token generation latency can be observed. Always returns populated
    /// stats; a terminal error lands in `last_exception`.
    pub async fn call(&self, client: &Client, mut body: serde_json::Value) -> RequestStats {
        let mut stats = RequestStats::new();
        if let Some(object) = body.as_object_mut() {
            object.insert("stream".to_string(), serde_json::Value::Bool(true));
        }
        if let Err(e) = self.call_with_backoff(client, &body, &mut stats).await {
            stats.last_exception = Some(e);
        }
        stats
    }

    /// Plain retry loop: full-jitter exponential delays, retries transport
    /// errors and final 429s, gives up on any other HTTP status, capped at
    /// `MAX_RETRY_SECONDS` of wall time. Inactive unless the run opted
    /// into exponential retry.
    async fn call_with_backoff(
        &self,
        client: &Client,
        body: &serde_json::Value,
        stats: &mut RequestStats,
    ) -> Result<(), RequestError> {
        let mut delay = BACKOFF_BASE_SECONDS;
        loop {
            let err = match self.attempt(client, body, stats).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            if !self.backoff || !err.retryable() {
                return Err(err);
            }
            let elapsed = stats.request_start_time.elapsed().as_secs_f64();
            if elapsed >= MAX_RETRY_SECONDS {
                return Err(err);
            }
            let jittered = rand::rng().random_range(0.0..delay);
            let sleep = jittered.min(MAX_RETRY_SECONDS - elapsed);
            tokio::time::sleep(Duration::from_secs_f64(sleep)).await;
            delay *= 2.0;
        }
    }

    async fn attempt(
        &self,
        client: &Client,
        body: &serde_json::Value,
        stats: &mut RequestStats,
    ) -> Result<(), RequestError> {
        let response = loop {
            stats.calls += 1;
            let response = client
                .post(&self.url)
                .header("api-key", &self.api_key)
                .header("Content-Type", "application/json")
                .header(TELEMETRY_USER_AGENT_HEADER, USER_AGENT)
                .json(body)
                .send()
                .await?;
            stats.response_status_code = response.status().as_u16();
            // Capture utilization in all cases, if found.
            if let Some(utilization) = parse_utilization(response.headers()) {
                stats.deployment_utilization = Some(utilization);
            }
            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                break response;
            }
            let wait = if self.backoff {
                parse_retry_after(response.headers())
            } else {
                None
            };
            let Some(wait) = wait else {
                break response;
            };
            // A sleep that crosses the retry budget is still honored once;
            // the elapsed check below then ends the loop.
            tokio::time::sleep(wait).await;
            if stats.request_start_time.elapsed().as_secs_f64() >= MAX_RETRY_SECONDS {
                break response;
            }
        };

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::TOO_MANY_REQUESTS {
            let request_id = response
                .headers()
                .get(REQUEST_ID_HEADER)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("");
            tracing::warn!("call failed: {REQUEST_ID_HEADER}={request_id} {status}");
        }
        if self.backoff && !status.is_success() {
            return Err(RequestError::Status {
                status: status.as_u16(),
            });
        }
        if status == StatusCode::OK {
            consume_stream(response, stats).await?;
        }
        Ok(())
    }
}

/// Reads the streaming body line by line. Every line beginning with
/// `data:` counts as one generated token; event payloads are ignored.
async fn consume_stream(
    response: Response,
    stats: &mut RequestStats,
) -> Result<(), RequestError> {
    stats.response_time = Some(Instant::now());
    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        buffer.extend_from_slice(&chunk);
        while let Some(newline) = buffer.iter().position(|&byte| byte == b'\n') {
            let line: Vec<u8> = buffer.drain(..=newline).collect();
            count_token_line(&line, stats);
        }
    }
    // An unterminated trailing line still counts.
    if !buffer.is_empty() {
        count_token_line(&buffer, stats);
    }
    stats.response_end_time = Some(Instant::now());
    Ok(())
}

fn count_token_line(line: &[u8], stats: &mut RequestStats) {
    if !line.starts_with(b"data:") {
        return;
    }
    if stats.first_token_time.is_none() {
        stats.first_token_time = Some(Instant::now());
    }
    *stats.generated_tokens.get_or_insert(0) += 1;
}

/// Parses the trailing-`%` utilization header. Malformed values are logged
/// at warning level and skipped.
fn parse_utilization(headers: &HeaderMap) -> Option<f64> {
    let value = headers.get(UTILIZATION_HEADER)?;
    let Ok(util_str) = value.to_str() else {
        tracing::warn!("invalid utilization header value: {UTILIZATION_HEADER} is not text");
        return None;
    };
    if util_str.is_empty() {
        tracing::warn!("got empty utilization header {UTILIZATION_HEADER}");
        return None;
    }
    let Some(raw) = util_str.strip_suffix('%') else {
        tracing::warn!("invalid utilization header value: {UTILIZATION_HEADER}={util_str}");
        return None;
    };
    match raw.parse::<f64>() {
        Ok(utilization) => Some(utilization),
        Err(e) => {
            tracing::warn!(
                "unable to parse utilization header value: {UTILIZATION_HEADER}={util_str}: {e}"
            );
            None
        }
    }
}

/// Server-directed throttling delay: `retry-after-ms` preferred, plain
/// `retry-after` seconds otherwise. A malformed value falls back to the
/// exponential backoff path.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    if let Some(value) = headers.get(RETRY_AFTER_MS_HEADER) {
        return match value.to_str().ok().and_then(|s| s.trim().parse::<f64>().ok()) {
            Some(ms) if ms >= 0.0 => Some(Duration::from_secs_f64(ms / 1000.0)),
            _ => {
                tracing::warn!(
                    "unable to parse retry-after header value: {RETRY_AFTER_MS_HEADER}={value:?}"
                );
                None
            }
        };
    }
    if let Some(value) = headers.get(RETRY_AFTER_HEADER) {
        return match value.to_str().ok().and_then(|s| s.trim().parse::<f64>().ok()) {
            Some(secs) if secs >= 0.0 => Some(Duration::from_secs_f64(secs)),
            _ => {
                tracing::warn!(
                    "unable to parse retry-after header value: {RETRY_AFTER_HEADER}={value:?}"
                );
                None
            }
        };
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers_with(name: &'static str, value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn utilization_parses_trailing_percent() {
        let headers = headers_with(UTILIZATION_HEADER, "11.2%");
        assert_eq!(parse_utilization(&headers), Some(11.2));
    }

    #[test]
    fn utilization_skips_empty_value() {
        let headers = headers_with(UTILIZATION_HEADER, "");
        assert_eq!(parse_utilization(&headers), None);
    }

    #[test]
    fn utilization_skips_missing_percent_suffix() {
        let headers = headers_with(UTILIZATION_HEADER, "11.2");
        assert_eq!(parse_utilization(&headers), None);
    }

    #[test]
    fn utilization_skips_non_numeric() {
        let headers = headers_with(UTILIZATION_HEADER, "lots%");
        assert_eq!(parse_utilization(&headers), None);
    }

    #[test]
    fn utilization_absent_header_is_none() {
        assert_eq!(parse_utilization(&HeaderMap::new()), None);
    }

    #[test]
    fn retry_after_prefers_milliseconds_header() {
        let mut headers = headers_with(RETRY_AFTER_MS_HEADER, "250");
        headers.insert(RETRY_AFTER_HEADER, HeaderValue::from_static("9"));
        assert_eq!(
            parse_retry_after(&headers),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn retry_after_seconds_is_converted() {
        let headers = headers_with(RETRY_AFTER_HEADER, "1.5");
        assert_eq!(
            parse_retry_after(&headers),
            Some(Duration::from_millis(1500))
        );
    }

    #[test]
    fn retry_after_malformed_falls_back() {
        let headers = headers_with(RETRY_AFTER_MS_HEADER, "soon");
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn status_retryability_follows_throttling() {
        assert!(RequestError::Status { status: 429 }.retryable());
        assert!(!RequestError::Status { status: 500 }.retryable());
        assert!(!RequestError::Status { status: 404 }.retryable());
    }

    #[test]
    fn data_lines_count_as_tokens() {
        let mut stats = RequestStats::new();
        count_token_line(b"data: {}\r\n", &mut stats);
        count_token_line(b"end: {}\r\n", &mut stats);
        count_token_line(b"data: [DONE]\n", &mut stats);
        assert_eq!(stats.generated_tokens, Some(2));
        assert!(stats.first_token_time.is_some());
    }

    #[test]
    fn non_data_lines_leave_tokens_unset() {
        let mut stats = RequestStats::new();
        count_token_line(b": keepalive\n", &mut stats);
        assert_eq!(stats.generated_tokens, None);
        assert!(stats.first_token_time.is_none());
    }
}
