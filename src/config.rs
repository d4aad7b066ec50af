use std::env;
use std::path::PathBuf;

use serde::Serialize;

use crate::cli::{
    ContextGenerationMethod, LoadArgs, OutputFormat, RetryMode, ShapeProfile,
};
use crate::error::GaleError;

/// Validated load-run configuration. Built from CLI arguments before any
/// I/O happens; once `load::run` starts, no configuration error remains.
///
/// Serializes to the one-line run-arguments record the log analyzer uses
/// to reconstruct run context. The API key never serializes.
#[derive(Debug, Serialize)]
pub struct LoadConfig {
    pub url: String,
    #[serde(skip)]
    pub api_key: String,
    pub api_base_endpoint: String,
    pub deployment: String,
    pub api_version: String,
    pub clients: usize,
    pub requests: Option<u64>,
    pub duration: Option<u64>,
    pub rate: Option<f64>,
    pub aggregation_window: f64,
    pub context_generation_method: ContextGenerationMethod,
    pub replay_path: Option<PathBuf>,
    pub shape_profile: ShapeProfile,
    /// Resolved from the shape profile for generated context.
    pub context_tokens: Option<usize>,
    /// Resolved from the shape profile for generated context.
    pub max_tokens: Option<u64>,
    pub completions: u32,
    pub frequency_penalty: Option<f64>,
    pub presence_penalty: Option<f64>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub prevent_server_caching: bool,
    pub output_format: OutputFormat,
    pub retry: RetryMode,
    pub log_save_dir: Option<PathBuf>,
}

impl LoadConfig {
    pub fn from_args(args: LoadArgs) -> Result<Self, GaleError> {
        validate(&args)?;

        let api_key = env::var(&args.api_key_env)
            .map_err(|_| invalid(format!("api-key-env {} not set", args.api_key_env)))?;

        let url = format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            args.api_base_endpoint, args.deployment, args.api_version
        );

        let (context_tokens, max_tokens) = match args.context_generation_method {
            ContextGenerationMethod::Generate => match args.shape_profile {
                ShapeProfile::Balanced => (Some(500), Some(500)),
                ShapeProfile::Context => (Some(2000), Some(200)),
                ShapeProfile::Generation => (Some(500), Some(1000)),
                ShapeProfile::Custom => (args.context_tokens, args.max_tokens),
            },
            ContextGenerationMethod::Replay => (None, args.max_tokens),
        };

        Ok(Self {
            url,
            api_key,
            api_base_endpoint: args.api_base_endpoint,
            deployment: args.deployment,
            api_version: args.api_version,
            clients: args.clients,
            requests: args.requests,
            duration: args.duration,
            rate: args.rate,
            aggregation_window: args.aggregation_window,
            context_generation_method: args.context_generation_method,
            replay_path: args.replay_path,
            shape_profile: args.shape_profile,
            context_tokens,
            max_tokens,
            completions: args.completions,
            frequency_penalty: args.frequency_penalty,
            presence_penalty: args.presence_penalty,
            temperature: args.temperature,
            top_p: args.top_p,
            prevent_server_caching: args.prevent_server_caching,
            output_format: args.output_format,
            retry: args.retry,
            log_save_dir: args.log_save_dir,
        })
    }

    /// Log-file name for `--log-save-dir`, encoding the run parameters
    /// operators filter on.
    pub fn log_file_name(&self) -> String {
        let now = chrono::Local::now().format("%Y-%m-%d-%H-%M-%S");
        let shape = if self.shape_profile == ShapeProfile::Custom {
            format!(
                "context={}_max_tokens={}",
                display_or_none(self.context_tokens),
                display_or_none(self.max_tokens),
            )
        } else {
            self.shape_profile.name().to_string()
        };
        let rate = self
            .rate
            .map(|rate| (rate as i64).to_string())
            .unwrap_or_else(|| "none".to_string());
        format!(
            "{now}_{}_shape-{shape}_clients={}_rate={rate}.log",
            self.deployment, self.clients
        )
    }
}

fn display_or_none<T: std::fmt::Display>(value: Option<T>) -> String {
    value
        .map(|value| value.to_string())
        .unwrap_or_else(|| "none".to_string())
}

fn invalid(message: String) -> GaleError {
    GaleError::InvalidConfig(message)
}

fn validate(args: &LoadArgs) -> Result<(), GaleError> {
    if args.api_version.is_empty() {
        return Err(invalid("api-version is required".to_string()));
    }
    if args.api_key_env.is_empty() {
        return Err(invalid("api-key-env is required".to_string()));
    }
    if args.clients < 1 {
        return Err(invalid("clients must be > 0".to_string()));
    }
    if let Some(duration) = args.duration
        && duration != 0
        && duration < 30
    {
        return Err(invalid("duration must be > 30".to_string()));
    }
    if let Some(rate) = args.rate
        && rate < 0.0
    {
        return Err(invalid("rate must be > 0".to_string()));
    }
    if args.context_generation_method == ContextGenerationMethod::Replay
        && args.replay_path.is_none()
    {
        return Err(invalid(
            "replay-path must be specified with context-generation-method=replay"
                .to_string(),
        ));
    }
    if args.context_generation_method == ContextGenerationMethod::Generate
        && args.shape_profile == ShapeProfile::Custom
        && !args.context_tokens.is_some_and(|tokens| tokens >= 1)
    {
        return Err(invalid(
            "context-tokens must be specified with shape=custom".to_string(),
        ));
    }
    if args.completions < 1 {
        return Err(invalid("completions must be > 0".to_string()));
    }
    if let Some(penalty) = args.frequency_penalty
        && !(-2.0..=2.0).contains(&penalty)
    {
        return Err(invalid(
            "frequency-penalty must be between -2.0 and 2.0".to_string(),
        ));
    }
    if let Some(penalty) = args.presence_penalty
        && !(-2.0..=2.0).contains(&penalty)
    {
        return Err(invalid(
            "presence-penalty must be between -2.0 and 2.0".to_string(),
        ));
    }
    if let Some(temperature) = args.temperature
        && !(0.0..=2.0).contains(&temperature)
    {
        return Err(invalid("temperature must be between 0 and 2.0".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct LoadHarness {
        #[command(flatten)]
        args: LoadArgs,
    }

    fn parse(extra: &[&str]) -> LoadArgs {
        let mut argv = vec!["load", "-e", "depl", "https://res.openai.azure.com"];
        argv.extend_from_slice(extra);
        LoadHarness::parse_from(argv).args
    }

    fn with_api_key<T>(test: impl FnOnce() -> T) -> T {
        // SAFETY: test-only env mutation, single-threaded per test body.
        unsafe { env::set_var("GALE_TEST_API_KEY", "secret") };
        test()
    }

    #[test]
    fn builds_deployment_url() {
        with_api_key(|| {
            let args = parse(&["--api-key-env", "GALE_TEST_API_KEY"]);
            let config = LoadConfig::from_args(args).unwrap();
            assert_eq!(
                config.url,
                "https://res.openai.azure.com/openai/deployments/depl/chat/completions?api-version=2023-05-15"
            );
            assert_eq!(config.api_key, "secret");
        });
    }

    #[test]
    fn shape_profiles_resolve_token_targets() {
        with_api_key(|| {
            let balanced = LoadConfig::from_args(parse(&[
                "--api-key-env",
                "GALE_TEST_API_KEY",
            ]))
            .unwrap();
            assert_eq!(balanced.context_tokens, Some(500));
            assert_eq!(balanced.max_tokens, Some(500));

            let context = LoadConfig::from_args(parse(&[
                "--api-key-env",
                "GALE_TEST_API_KEY",
                "-s",
                "context",
            ]))
            .unwrap();
            assert_eq!(context.context_tokens, Some(2000));
            assert_eq!(context.max_tokens, Some(200));

            let generation = LoadConfig::from_args(parse(&[
                "--api-key-env",
                "GALE_TEST_API_KEY",
                "-s",
                "generation",
            ]))
            .unwrap();
            assert_eq!(generation.context_tokens, Some(500));
            assert_eq!(generation.max_tokens, Some(1000));
        });
    }

    #[test]
    fn custom_shape_requires_context_tokens() {
        with_api_key(|| {
            let args = parse(&["--api-key-env", "GALE_TEST_API_KEY", "-s", "custom"]);
            let err = LoadConfig::from_args(args).unwrap_err();
            assert!(err.to_string().contains("context-tokens"));
        });
    }

    #[test]
    fn replay_requires_path() {
        with_api_key(|| {
            let args = parse(&[
                "--api-key-env",
                "GALE_TEST_API_KEY",
                "--context-generation-method",
                "replay",
            ]);
            let err = LoadConfig::from_args(args).unwrap_err();
            assert!(err.to_string().contains("replay-path"));
        });
    }

    #[test]
    fn short_durations_are_rejected() {
        with_api_key(|| {
            let args = parse(&["--api-key-env", "GALE_TEST_API_KEY", "-d", "10"]);
            assert!(LoadConfig::from_args(args).is_err());
        });
    }

    #[test]
    fn penalty_and_temperature_ranges_are_enforced() {
        with_api_key(|| {
            for extra in [
                ["--frequency-penalty", "2.5"],
                ["--presence-penalty", "-3"],
                ["--temperature", "2.1"],
            ] {
                let mut argv = vec!["--api-key-env", "GALE_TEST_API_KEY"];
                argv.extend_from_slice(&extra);
                assert!(LoadConfig::from_args(parse(&argv)).is_err(), "{extra:?}");
            }
        });
    }

    #[test]
    fn missing_api_key_env_fails() {
        let args = parse(&["--api-key-env", "GALE_TEST_MISSING_KEY"]);
        let err = LoadConfig::from_args(args).unwrap_err();
        assert!(err.to_string().contains("GALE_TEST_MISSING_KEY"));
        assert!(err.is_config());
    }

    #[test]
    fn log_file_name_encodes_run_parameters() {
        with_api_key(|| {
            let args = parse(&[
                "--api-key-env",
                "GALE_TEST_API_KEY",
                "-r",
                "120",
                "-c",
                "8",
            ]);
            let config = LoadConfig::from_args(args).unwrap();
            let name = config.log_file_name();
            assert!(name.contains("_depl_shape-balanced_clients=8_rate=120.log"));
        });
    }

    #[test]
    fn run_arguments_serialize_without_api_key() {
        with_api_key(|| {
            let args = parse(&["--api-key-env", "GALE_TEST_API_KEY"]);
            let config = LoadConfig::from_args(args).unwrap();
            let line = serde_json::to_string(&config).unwrap();
            assert!(!line.contains("secret"));
            assert!(line.contains("\"deployment\":\"depl\""));
        });
    }
}
