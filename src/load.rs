//! The `load` subcommand: wires generator, requester, aggregator, and
//! executor together from a validated configuration.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;

use crate::aggregator::{ReportSink, StatsAggregator};
use crate::cli::{ContextGenerationMethod, OutputFormat, RetryMode};
use crate::config::LoadConfig;
use crate::error::GaleError;
use crate::executor::Executor;
use crate::messages::{ChatMessage, MessageGenerator, RandomMessagesGenerator, ReplayMessagesGenerator};
use crate::ratelimit::RateLimiter;
use crate::requester::Requester;

/// Model assumed for token counting of generated and replayed prompts.
const TOKENIZER_MODEL: &str = "gpt-4-0613";

/// Cadence of the periodic statistics emit.
const DUMP_DURATION: Duration = Duration::from_secs(1);

/// Builds request bodies carrying the run's sampling parameters. The
/// requester forces `stream` on before sending.
pub struct RequestTemplate {
    pub max_tokens: Option<u64>,
    pub completions: u32,
    pub frequency_penalty: Option<f64>,
    pub presence_penalty: Option<f64>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
}

impl RequestTemplate {
    fn from_config(config: &LoadConfig) -> Self {
        Self {
            max_tokens: config.max_tokens,
            completions: config.completions,
            frequency_penalty: config.frequency_penalty,
            presence_penalty: config.presence_penalty,
            temperature: config.temperature,
            top_p: config.top_p,
        }
    }

    pub fn build_body(&self, messages: &[ChatMessage]) -> serde_json::Value {
        let mut body = serde_json::json!({ "messages": messages });
        if let Some(max_tokens) = self.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        body["n"] = serde_json::json!(self.completions);
        if let Some(frequency_penalty) = self.frequency_penalty {
            body["frequency_penalty"] = serde_json::json!(frequency_penalty);
        }
        if let Some(presence_penalty) = self.presence_penalty {
            body["presence_penalty"] = serde_json::json!(presence_penalty);
        }
        if let Some(temperature) = self.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(top_p) = self.top_p {
            body["top_p"] = serde_json::json!(top_p);
        }
        body
    }
}

pub async fn run(config: LoadConfig) -> Result<(), GaleError> {
    let mut sink = build_sink(&config)?;
    // One line of resolved run arguments so log analysis can reconstruct
    // the run context.
    match serde_json::to_string(&config) {
        Ok(line) => sink.write_line(&line),
        Err(e) => tracing::warn!("failed to serialize run arguments: {e}"),
    }

    let generator = Arc::new(build_generator(&config)?);

    let rate_limiter = match config.rate {
        Some(rate) if rate > 0.0 => RateLimiter::paced(rate, 60.0),
        _ => RateLimiter::unlimited(),
    };

    let requester = Arc::new(Requester::new(
        config.api_key.clone(),
        config.url.clone(),
        config.retry == RetryMode::Exponential,
    ));
    let aggregator = Arc::new(StatsAggregator::new(
        DUMP_DURATION,
        config.aggregation_window,
        config.output_format == OutputFormat::Jsonl,
        sink,
    ));
    let template = Arc::new(RequestTemplate::from_config(&config));

    let request_fn = {
        let generator = Arc::clone(&generator);
        let requester = Arc::clone(&requester);
        let aggregator = Arc::clone(&aggregator);
        let template = Arc::clone(&template);
        move |client: Client| {
            let generator = Arc::clone(&generator);
            let requester = Arc::clone(&requester);
            let aggregator = Arc::clone(&aggregator);
            let template = Arc::clone(&template);
            async move {
                let (messages, context_tokens) = generator.generate();
                let body = template.build_body(&messages);
                let mut stats = requester.call(&client, body).await;
                stats.context_tokens = context_tokens as u64;
                aggregator.aggregate(&stats);
            }
        }
    };

    tracing::info!("starting load...");
    let aggregator_task = aggregator.start();
    let mut executor = Executor::new(rate_limiter, config.clients);
    executor
        .run(
            request_fn,
            config.requests,
            config.duration.map(Duration::from_secs),
        )
        .await;
    aggregator.stop();
    aggregator_task.await.ok();

    tracing::info!("finished load test");
    Ok(())
}

fn build_sink(config: &LoadConfig) -> Result<ReportSink, GaleError> {
    let Some(dir) = &config.log_save_dir else {
        return Ok(ReportSink::stdout());
    };
    std::fs::create_dir_all(dir).map_err(|e| {
        GaleError::InvalidConfig(format!("cannot create log-save-dir: {e}"))
    })?;
    let path = dir.join(config.log_file_name());
    ReportSink::with_tee(&path)
        .map_err(|e| GaleError::InvalidConfig(format!("cannot create log file: {e}")))
}

fn build_generator(config: &LoadConfig) -> Result<MessageGenerator, GaleError> {
    match config.context_generation_method {
        ContextGenerationMethod::Generate => {
            let context_tokens = config.context_tokens.ok_or_else(|| {
                GaleError::InvalidConfig(
                    "context-tokens must be specified with shape=custom".to_string(),
                )
            })?;
            tracing::info!(
                "using shape profile {}: context tokens: {}, max tokens: {:?}",
                config.shape_profile.name(),
                context_tokens,
                config.max_tokens,
            );
            Ok(MessageGenerator::Random(RandomMessagesGenerator::new(
                TOKENIZER_MODEL,
                context_tokens,
                config.max_tokens,
                config.prevent_server_caching,
            )?))
        }
        ContextGenerationMethod::Replay => {
            let path = config.replay_path.as_deref().ok_or_else(|| {
                GaleError::InvalidConfig(
                    "replay-path must be specified with context-generation-method=replay"
                        .to_string(),
                )
            })?;
            Ok(MessageGenerator::Replay(ReplayMessagesGenerator::new(
                TOKENIZER_MODEL,
                path,
                config.prevent_server_caching,
            )?))
        }
    }
}
