//! Rate-limited concurrent dispatch loop.
//!
//! Drives a user-supplied async request function against a shared HTTP
//! client, shaped by a rate limiter and a concurrency ceiling. On a
//! termination signal the loop stops dispatching and drains in-flight
//! work; a second signal forces immediate process exit.

use std::future::Future;
use std::time::{Duration, Instant};

use reqwest::Client;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::ratelimit::RateLimiter;

/// Wait threshold, in seconds, past which dispatch is considered to lag
/// the committed rate.
const LAG_WARN_DURATION: f64 = 1.0;

pub struct Executor {
    rate_limiter: RateLimiter,
    max_concurrency: usize,
    terminate: CancellationToken,
}

impl Executor {
    pub fn new(rate_limiter: RateLimiter, max_concurrency: usize) -> Self {
        Self {
            rate_limiter,
            max_concurrency,
            terminate: CancellationToken::new(),
        }
    }

    /// Token that ends the dispatch loop after the current dispatch;
    /// exposed so callers and tests can trigger a drain without a process
    /// signal.
    pub fn terminate_token(&self) -> CancellationToken {
        self.terminate.clone()
    }

    /// Runs the dispatch loop. With neither `call_count` nor `duration`
    /// set, runs until a termination signal. Dispatched work is never
    /// cancelled; momentary in-flight count stays within
    /// `max_concurrency + 1`.
    pub async fn run<F, Fut>(
        &mut self,
        request_fn: F,
        call_count: Option<u64>,
        duration: Option<Duration>,
    ) where
        F: Fn(Client) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let signal_task = spawn_signal_listener(self.terminate.clone());
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(self.max_concurrency.max(1))
            .build()
            .expect("failed to build HTTP client");

        let start_time = Instant::now();
        let mut calls_made: u64 = 0;
        let mut request_tasks: JoinSet<()> = JoinSet::new();

        while call_count.is_none_or(|count| calls_made < count)
            && duration.is_none_or(|limit| start_time.elapsed() < limit)
            && !self.terminate.is_cancelled()
        {
            self.rate_limiter.acquire().await;
            if request_tasks.len() > self.max_concurrency {
                let wait_start = Instant::now();
                request_tasks.join_next().await;
                let waited = wait_start.elapsed().as_secs_f64();
                if waited > LAG_WARN_DURATION && self.rate_limiter.is_paced() {
                    tracing::warn!(
                        "falling behind committed rate by {waited:.3}s, consider \
                         increasing number of clients."
                    );
                }
            }
            request_tasks.spawn(request_fn(client.clone()));
            calls_made += 1;
            self.rate_limiter.release();
        }

        if !request_tasks.is_empty() {
            tracing::info!("waiting for {} requests to drain", request_tasks.len());
            while request_tasks.join_next().await.is_some() {}
        }

        if let Some(handle) = signal_task {
            handle.abort();
        }
    }
}

/// First signal starts the drain, a second forces immediate exit.
#[cfg(unix)]
fn spawn_signal_listener(terminate: CancellationToken) -> Option<JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let (Ok(mut interrupt), Ok(mut terminated)) = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) else {
        tracing::warn!("failed to install signal handlers");
        return None;
    };

    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = interrupt.recv() => {}
                _ = terminated.recv() => {}
            }
            if terminate.is_cancelled() {
                tracing::info!("forcing program exit");
                std::process::exit(0);
            }
            tracing::warn!(
                "got terminate signal, draining. signal again to exit immediately."
            );
            terminate.cancel();
        }
    }))
}

#[cfg(not(unix))]
fn spawn_signal_listener(terminate: CancellationToken) -> Option<JoinHandle<()>> {
    Some(tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if terminate.is_cancelled() {
                tracing::info!("forcing program exit");
                std::process::exit(0);
            }
            tracing::warn!(
                "got terminate signal, draining. signal again to exit immediately."
            );
            terminate.cancel();
        }
    }))
}
