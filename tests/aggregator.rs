//! Aggregator tests: windowed percentiles, emit/slide round trip, stop
//! idempotence, failure counting.

use std::sync::Arc;
use std::time::{Duration, Instant};

use gale::aggregator::{ReportSink, StatsAggregator};
use gale::requester::RequestStats;

/// Synthetic successful stats ending now, with the given end-to-end
/// latency and time-to-first-token.
fn success_stats(e2e: f64, ttft: f64, context_tokens: u64, generated: u64) -> RequestStats {
    let end = Instant::now();
    let start = end - Duration::from_secs_f64(e2e);
    let mut stats = RequestStats::new();
    stats.request_start_time = start;
    stats.calls = 1;
    stats.response_status_code = 200;
    stats.response_time = Some(start + Duration::from_secs_f64(ttft / 2.0));
    stats.first_token_time = Some(start + Duration::from_secs_f64(ttft));
    stats.response_end_time = Some(end);
    stats.context_tokens = context_tokens;
    stats.generated_tokens = Some(generated);
    stats
}

fn failed_stats(status: u16) -> RequestStats {
    let mut stats = RequestStats::new();
    stats.calls = 1;
    stats.response_status_code = status;
    stats
}

fn json_aggregator(window_seconds: f64) -> Arc<StatsAggregator> {
    Arc::new(StatsAggregator::new(
        Duration::from_secs(1),
        window_seconds,
        true,
        ReportSink::stdout(),
    ))
}

fn parse_report(aggregator: &StatsAggregator) -> serde_json::Value {
    serde_json::from_str(&aggregator.render_report()).unwrap()
}

// ---------------------------------------------------------------------------
// Percentiles over a uniform latency sweep
// ---------------------------------------------------------------------------

#[tokio::test]
async fn uniform_sweep_produces_expected_percentiles() {
    let aggregator = json_aggregator(60.0);
    for i in 0..100 {
        let e2e = 0.1 + 0.9 * i as f64 / 99.0;
        aggregator.aggregate(&success_stats(e2e, 0.05, 200, 50));
    }

    let report = parse_report(&aggregator);
    assert_eq!(report["rpm"], 100.0);
    assert_eq!(report["requests"], 100);
    assert_eq!(report["failures"], 0);
    assert_eq!(report["throttled"], 0);
    assert_eq!(report["tpm"]["context"], 20000);
    assert_eq!(report["tpm"]["gen"], 5000);
    assert_eq!(report["tpm"]["total"], 25000);

    let e2e_avg = report["e2e"]["avg"].as_f64().unwrap();
    assert!((e2e_avg - 0.55).abs() < 0.02, "e2e avg {e2e_avg}");
    let e2e_95th = report["e2e"]["95th"].as_f64().unwrap();
    assert!((e2e_95th - 0.955).abs() < 0.02, "e2e 95th {e2e_95th}");

    let ttft_avg = report["ttft"]["avg"].as_f64().unwrap();
    assert!((ttft_avg - 0.05).abs() < 0.005, "ttft avg {ttft_avg}");
    // No utilization header was ever seen.
    assert_eq!(report["util"]["avg"], "n/a");
}

// ---------------------------------------------------------------------------
// A record contributes to exactly one tick once it ages out
// ---------------------------------------------------------------------------

#[tokio::test]
async fn aged_out_record_contributes_to_exactly_one_tick() {
    let aggregator = json_aggregator(0.05);
    aggregator.aggregate(&success_stats(0.01, 0.005, 10, 5));

    tokio::time::sleep(Duration::from_millis(80)).await;

    // First tick reports the record, then slides it out.
    let before = parse_report(&aggregator);
    assert_eq!(before["rpm"].as_f64().unwrap(), 1200.0);
    aggregator.tick();

    let after = parse_report(&aggregator);
    assert_eq!(after["rpm"], "n/a");
    assert_eq!(after["e2e"]["avg"], "n/a");
    // Counters are cumulative, not windowed.
    assert_eq!(after["requests"], 1);
}

// ---------------------------------------------------------------------------
// Failure and throttle counting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failures_count_without_latency_samples() {
    let aggregator = json_aggregator(60.0);
    aggregator.aggregate(&failed_stats(500));
    aggregator.aggregate(&failed_stats(429));
    aggregator.aggregate(&failed_stats(429));

    let report = parse_report(&aggregator);
    assert_eq!(report["requests"], 3);
    assert_eq!(report["failures"], 3);
    assert_eq!(report["throttled"], 2);
    assert_eq!(report["rpm"], "n/a");
    assert_eq!(report["e2e"]["avg"], "n/a");
}

#[tokio::test]
async fn utilization_is_tracked_regardless_of_status() {
    let aggregator = json_aggregator(60.0);
    let mut throttled = failed_stats(429);
    throttled.deployment_utilization = Some(98.5);
    aggregator.aggregate(&throttled);

    let report = parse_report(&aggregator);
    assert_eq!(report["util"]["avg"], "98.5%");
    // A single sample is not enough for a 95th percentile.
    assert_eq!(report["util"]["95th"], "n/a");
}

// ---------------------------------------------------------------------------
// Percentile sentinels
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_sample_yields_avg_but_no_p95() {
    let aggregator = json_aggregator(60.0);
    aggregator.aggregate(&success_stats(0.5, 0.1, 100, 10));

    let report = parse_report(&aggregator);
    assert_eq!(report["e2e"]["avg"], 0.5);
    assert_eq!(report["e2e"]["95th"], "n/a");
}

// ---------------------------------------------------------------------------
// Malformed success records never panic the aggregator
// ---------------------------------------------------------------------------

#[tokio::test]
async fn success_with_missing_timings_is_counted_but_not_sampled() {
    let aggregator = json_aggregator(60.0);
    let mut stats = RequestStats::new();
    stats.calls = 1;
    stats.response_status_code = 200;
    // No timing fields set.
    aggregator.aggregate(&stats);

    let report = parse_report(&aggregator);
    assert_eq!(report["requests"], 1);
    assert_eq!(report["rpm"], "n/a");
}

// ---------------------------------------------------------------------------
// Worker lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stop_is_idempotent_and_ends_the_worker() {
    let aggregator = json_aggregator(60.0);
    let worker = aggregator.start();

    aggregator.stop();
    aggregator.stop();

    tokio::time::timeout(Duration::from_secs(1), worker)
        .await
        .expect("worker should exit after stop")
        .expect("worker should not panic");

    // Stopping again after the worker exited is still a no-op.
    aggregator.stop();
}

#[tokio::test]
async fn human_format_renders_one_line_with_field_labels() {
    let aggregator = Arc::new(StatsAggregator::new(
        Duration::from_secs(1),
        60.0,
        false,
        ReportSink::stdout(),
    ));
    aggregator.aggregate(&success_stats(0.2, 0.1, 100, 10));

    let line = aggregator.render_report();
    assert!(!line.contains('\n'));
    for label in ["rpm:", "requests:", "failures:", "throttled:", "tpm:", "ttft_avg:", "e2e_95th:", "util_avg:"] {
        assert!(line.contains(label), "missing {label} in {line}");
    }
}
