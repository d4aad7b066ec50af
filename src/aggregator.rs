//! Sliding-window statistics aggregation.
//!
//! `StatsAggregator` is a passive object: producers call `aggregate` from
//! any task, and a periodic worker started with `start` emits one report
//! per tick and then slides the window. All series state lives under one
//! exclusive lock; window membership is defined by request start time.

use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::requester::RequestStats;

/// Ordered `(timestamp, value)` samples, appended at the back by
/// producers and trimmed from the front on slide.
#[derive(Default)]
struct Samples {
    samples: Vec<(Instant, f64)>,
}

impl Samples {
    fn append(&mut self, timestamp: Instant, value: f64) {
        self.samples.push((timestamp, value));
    }

    fn trim_oldest(&mut self, window_seconds: f64) {
        let now = Instant::now();
        let keep_from = self
            .samples
            .iter()
            .position(|(timestamp, _)| {
                now.duration_since(*timestamp).as_secs_f64() <= window_seconds
            })
            .unwrap_or(self.samples.len());
        self.samples.drain(..keep_from);
    }

    fn values(&self) -> Vec<f64> {
        self.samples.iter().map(|(_, value)| *value).collect()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }

    fn sum(&self) -> f64 {
        self.samples.iter().map(|(_, value)| value).sum()
    }
}

#[derive(Default)]
struct WindowState {
    started_at: Option<Instant>,
    total_requests_count: u64,
    total_failed_count: u64,
    requests_count: u64,
    failed_count: u64,
    throttled_count: u64,
    request_timestamps: Samples,
    request_latency: Samples,
    call_tries: Samples,
    response_latencies: Samples,
    first_token_latencies: Samples,
    token_latencies: Samples,
    context_tokens: Samples,
    generated_tokens: Samples,
    utilizations: Samples,
}

/// Where report lines go: stdout, plus an optional tee file.
pub struct ReportSink {
    tee: Option<std::fs::File>,
}

impl ReportSink {
    pub fn stdout() -> Self {
        Self { tee: None }
    }

    pub fn with_tee(path: &Path) -> std::io::Result<Self> {
        Ok(Self {
            tee: Some(std::fs::File::create(path)?),
        })
    }

    /// Writes and flushes one line. Sink failures must not fail the run;
    /// they are logged and dropped.
    pub fn write_line(&mut self, line: &str) {
        let mut out = std::io::stdout().lock();
        if writeln!(out, "{line}").and_then(|()| out.flush()).is_err() {
            tracing::warn!("failed writing report line to stdout");
        }
        if let Some(file) = &mut self.tee
            && writeln!(file, "{line}").and_then(|()| file.flush()).is_err()
        {
            tracing::warn!("failed writing report line to log file");
        }
    }
}

struct Inner {
    window: WindowState,
    sink: ReportSink,
}

/// Thread-safe request stats aggregator with periodic emission.
pub struct StatsAggregator {
    dump_duration: Duration,
    window_duration: f64,
    json_output: bool,
    terminate: CancellationToken,
    inner: Mutex<Inner>,
}

impl StatsAggregator {
    /// `dump_duration` is the emit cadence; `window_duration` the sliding
    /// window in seconds.
    pub fn new(
        dump_duration: Duration,
        window_duration: f64,
        json_output: bool,
        sink: ReportSink,
    ) -> Self {
        Self {
            dump_duration,
            window_duration,
            json_output,
            terminate: CancellationToken::new(),
            inner: Mutex::new(Inner {
                window: WindowState::default(),
                sink,
            }),
        }
    }

    /// Starts the periodic worker. Use `stop` to end it.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        self.lock().window.started_at = Some(Instant::now());
        let aggregator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = aggregator.terminate.cancelled() => break,
                    _ = tokio::time::sleep(aggregator.dump_duration) => aggregator.tick(),
                }
            }
        })
    }

    /// Idempotent; the worker exits at its next suspension point.
    pub fn stop(&self) {
        self.terminate.cancel();
    }

    /// Records one request within the sliding window. Safe to call from
    /// many producers concurrently; never panics out.
    pub fn aggregate(&self, stats: &RequestStats) {
        let mut inner = self.lock();
        let window = &mut inner.window;
        let start = stats.request_start_time;

        window.requests_count += 1;
        window.total_requests_count += 1;
        window.call_tries.append(start, f64::from(stats.calls));

        if stats.response_status_code != 200 {
            window.failed_count += 1;
            window.total_failed_count += 1;
            if stats.response_status_code == 429 {
                window.throttled_count += 1;
            }
        } else {
            match (
                stats.response_time,
                stats.first_token_time,
                stats.response_end_time,
                stats.generated_tokens,
            ) {
                (Some(response), Some(first_token), Some(end), Some(generated))
                    if generated > 0 =>
                {
                    let e2e = end.duration_since(start).as_secs_f64();
                    if e2e > self.window_duration {
                        tracing::warn!(
                            "request completed in {} seconds, while aggregation-window is {} \
                             seconds, consider increasing aggregation-window to at least 2x \
                             your typical request latency.",
                            round_to(e2e, 2),
                            round_to(self.window_duration, 2),
                        );
                    }
                    window.request_latency.append(start, e2e);
                    window.request_timestamps.append(start, 1.0);
                    window
                        .response_latencies
                        .append(start, response.duration_since(start).as_secs_f64());
                    window
                        .first_token_latencies
                        .append(start, first_token.duration_since(start).as_secs_f64());
                    window.token_latencies.append(
                        start,
                        end.duration_since(first_token).as_secs_f64() / generated as f64,
                    );
                    window.context_tokens.append(start, stats.context_tokens as f64);
                    window.generated_tokens.append(start, generated as f64);
                }
                _ => {
                    tracing::warn!(
                        "200 response missing timing fields, skipping latency samples"
                    );
                }
            }
        }

        if let Some(utilization) = stats.deployment_utilization {
            window.utilizations.append(start, utilization);
        }
    }

    /// Emits one report and slides the window. Called by the periodic
    /// worker every `dump_duration`.
    pub fn tick(&self) {
        let mut inner = self.lock();
        let line = self.render(&inner.window);
        inner.sink.write_line(&line);
        Self::slide_window(&mut inner.window, self.window_duration);
    }

    /// Formats the current window's report line without emitting it.
    pub fn render_report(&self) -> String {
        let inner = self.lock();
        self.render(&inner.window)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic inside the lock only abandons a report line; recover the
        // state rather than poisoning every later aggregate.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn render(&self, window: &WindowState) -> String {
        let run_seconds = window
            .started_at
            .map(|started| started.elapsed().as_secs_f64().round() as u64)
            .unwrap_or(0);
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();

        let e2e_avg = average(&window.request_latency.values());
        let e2e_95th = percentile(&window.request_latency.values(), 95.0);
        let ttft_avg = average(&window.first_token_latencies.values());
        let ttft_95th = percentile(&window.first_token_latencies.values(), 95.0);
        let tbt_avg = average(&window.token_latencies.values());
        let tbt_95th = percentile(&window.token_latencies.values(), 95.0);
        let util_avg = average(&window.utilizations.values());
        let util_95th = percentile(&window.utilizations.values(), 95.0);

        let rpm = (window.request_timestamps.len() > 0).then(|| {
            60.0 * window.request_timestamps.len() as f64 / self.window_duration
        });
        let context_tpm = (window.context_tokens.len() > 0)
            .then(|| (60.0 * window.context_tokens.sum() / self.window_duration).round() as u64);
        let gen_tpm = (window.generated_tokens.len() > 0)
            .then(|| (60.0 * window.generated_tokens.sum() / self.window_duration).round() as u64);
        let total_tpm = context_tpm.unwrap_or(0) + gen_tpm.unwrap_or(0);

        if self.json_output {
            let report = Report {
                run_seconds,
                timestamp,
                rpm: rounded_or_na(rpm, 1),
                requests: window.requests_count,
                failures: window.failed_count,
                throttled: window.throttled_count,
                tpm: TpmReport {
                    context: count_or_na(context_tpm),
                    generated: count_or_na(gen_tpm),
                    total: total_tpm,
                },
                e2e: Quantiles {
                    avg: rounded_or_na(e2e_avg, 3),
                    p95: rounded_or_na(e2e_95th, 3),
                },
                ttft: Quantiles {
                    avg: rounded_or_na(ttft_avg, 3),
                    p95: rounded_or_na(ttft_95th, 3),
                },
                tbt: Quantiles {
                    avg: rounded_or_na(tbt_avg, 3),
                    p95: rounded_or_na(tbt_95th, 3),
                },
                util: Quantiles {
                    avg: percent_or_na(util_avg),
                    p95: percent_or_na(util_95th),
                },
            };
            serde_json::to_string(&report).unwrap_or_else(|e| {
                tracing::warn!("failed to serialize report: {e}");
                String::new()
            })
        } else {
            format!(
                "{timestamp} rpm: {:<5} requests: {:<5} failures: {:<4} throttled: {:<4} \
                 tpm: {:<6} ttft_avg: {:<6} ttft_95th: {:<6} tbt_avg: {:<6} tbt_95th: {:<6} \
                 e2e_avg: {:<6} e2e_95th: {:<6} util_avg: {:<6} util_95th: {:<6}",
                display_rounded(rpm, 1),
                window.requests_count,
                window.failed_count,
                window.throttled_count,
                total_tpm,
                display_rounded(ttft_avg, 3),
                display_rounded(ttft_95th, 3),
                display_rounded(tbt_avg, 3),
                display_rounded(tbt_95th, 3),
                display_rounded(e2e_avg, 3),
                display_rounded(e2e_95th, 3),
                display_percent(util_avg),
                display_percent(util_95th),
            )
        }
    }

    fn slide_window(window: &mut WindowState, window_duration: f64) {
        window.call_tries.trim_oldest(window_duration);
        window.request_timestamps.trim_oldest(window_duration);
        window.request_latency.trim_oldest(window_duration);
        window.response_latencies.trim_oldest(window_duration);
        window.first_token_latencies.trim_oldest(window_duration);
        window.token_latencies.trim_oldest(window_duration);
        window.context_tokens.trim_oldest(window_duration);
        window.generated_tokens.trim_oldest(window_duration);
        window.utilizations.trim_oldest(window_duration);
    }
}

#[derive(Serialize)]
struct Report {
    run_seconds: u64,
    timestamp: String,
    rpm: Value,
    requests: u64,
    failures: u64,
    throttled: u64,
    tpm: TpmReport,
    e2e: Quantiles,
    ttft: Quantiles,
    tbt: Quantiles,
    util: Quantiles,
}

#[derive(Serialize)]
struct TpmReport {
    context: Value,
    #[serde(rename = "gen")]
    generated: Value,
    total: u64,
}

#[derive(Serialize)]
struct Quantiles {
    avg: Value,
    #[serde(rename = "95th")]
    p95: Value,
}

/// Mean; undefined below one sample.
fn average(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

/// Percentile with linear interpolation between closest ranks; undefined
/// below two samples.
fn percentile(values: &[f64], pct: f64) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (sorted.len() - 1) as f64 * pct / 100.0;
    let lower = rank.floor() as usize;
    let fraction = rank - lower as f64;
    let value = if lower + 1 < sorted.len() {
        sorted[lower] + fraction * (sorted[lower + 1] - sorted[lower])
    } else {
        sorted[lower]
    };
    Some(value)
}

fn round_to(value: f64, digits: u32) -> f64 {
    let factor = 10f64.powi(digits as i32);
    (value * factor).round() / factor
}

fn rounded_or_na(value: Option<f64>, digits: u32) -> Value {
    match value {
        Some(value) => Value::from(round_to(value, digits)),
        None => Value::from("n/a"),
    }
}

fn count_or_na(value: Option<u64>) -> Value {
    match value {
        Some(value) => Value::from(value),
        None => Value::from("n/a"),
    }
}

fn percent_or_na(value: Option<f64>) -> Value {
    match value {
        Some(value) => Value::from(format!("{}%", round_to(value, 1))),
        None => Value::from("n/a"),
    }
}

fn display_rounded(value: Option<f64>, digits: u32) -> String {
    match value {
        Some(value) => round_to(value, digits).to_string(),
        None => "n/a".to_string(),
    }
}

fn display_percent(value: Option<f64>) -> String {
    match value {
        Some(value) => format!("{}%", round_to(value, 1)),
        None => "n/a".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_needs_one_sample() {
        assert_eq!(average(&[]), None);
        assert_eq!(average(&[2.0]), Some(2.0));
        assert_eq!(average(&[1.0, 3.0]), Some(2.0));
    }

    #[test]
    fn percentile_needs_two_samples() {
        assert_eq!(percentile(&[], 95.0), None);
        assert_eq!(percentile(&[1.0], 95.0), None);
        assert_eq!(percentile(&[1.0, 2.0], 50.0), Some(1.5));
    }

    #[test]
    fn percentile_interpolates_between_ranks() {
        let values: Vec<f64> = (0..100).map(|i| 0.1 + 0.9 * i as f64 / 99.0).collect();
        let p95 = percentile(&values, 95.0).unwrap();
        assert!((p95 - 0.955).abs() < 0.001, "got {p95}");
    }

    #[test]
    fn percentile_is_order_independent() {
        let sorted = percentile(&[1.0, 2.0, 3.0, 4.0], 95.0).unwrap();
        let shuffled = percentile(&[3.0, 1.0, 4.0, 2.0], 95.0).unwrap();
        assert_eq!(sorted, shuffled);
    }

    #[test]
    fn rounding_matches_emit_policy() {
        assert_eq!(round_to(0.55349, 3), 0.553);
        assert_eq!(round_to(99.95, 1), 100.0);
        assert_eq!(round_to(19999.6, 0), 20000.0);
    }

    #[tokio::test]
    async fn samples_trim_drops_only_aged_entries() {
        let mut samples = Samples::default();
        samples.append(Instant::now(), 1.0);
        tokio::time::sleep(Duration::from_millis(80)).await;
        samples.append(Instant::now(), 2.0);
        samples.append(Instant::now(), 3.0);
        samples.trim_oldest(0.05);
        assert_eq!(samples.values(), vec![2.0, 3.0]);
    }
}
