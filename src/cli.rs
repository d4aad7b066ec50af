use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "gale")]
#[command(about = "Load generation and measurement harness for Azure OpenAI deployments")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the load generation tool.
    Load(LoadArgs),
    /// Count tokens of text or chat messages.
    Tokenize(TokenizeArgs),
}

#[derive(Args, Debug)]
pub struct LoadArgs {
    /// Azure OpenAI deployment base endpoint.
    pub api_base_endpoint: String,

    /// Azure OpenAI deployment name.
    #[arg(short = 'e', long)]
    pub deployment: String,

    /// OpenAI API version.
    #[arg(short = 'a', long, default_value = "2023-05-15")]
    pub api_version: String,

    /// Environment variable that contains the API key.
    #[arg(short = 'k', long, default_value = "OPENAI_API_KEY")]
    pub api_key_env: String,

    /// Number of parallel clients to use for load generation.
    #[arg(short = 'c', long, default_value_t = 20)]
    pub clients: usize,

    /// Number of requests for the load run. Defaults to 'until killed'.
    #[arg(short = 'n', long)]
    pub requests: Option<u64>,

    /// Duration of the load run in seconds. Defaults to 'until killed'.
    #[arg(short = 'd', long)]
    pub duration: Option<u64>,

    /// Rate of request generation in Requests Per Minute (RPM).
    /// Defaults to as fast as possible.
    #[arg(short = 'r', long)]
    pub rate: Option<f64>,

    /// Statistics aggregation sliding window duration in seconds.
    #[arg(short = 'w', long, default_value_t = 60.0)]
    pub aggregation_window: f64,

    /// How request context is produced.
    #[arg(long, value_enum, default_value_t = ContextGenerationMethod::Generate)]
    pub context_generation_method: ContextGenerationMethod,

    /// Path to a JSON file of messages lists to replay, required with
    /// --context-generation-method=replay.
    #[arg(long)]
    pub replay_path: Option<PathBuf>,

    /// Shape profile of generated requests.
    #[arg(short = 's', long, value_enum, default_value_t = ShapeProfile::Balanced)]
    pub shape_profile: ShapeProfile,

    /// Number of context tokens when --shape-profile=custom.
    #[arg(short = 'p', long)]
    pub context_tokens: Option<usize>,

    /// Requested max_tokens when --shape-profile=custom. Defaults to unset.
    #[arg(short = 'm', long)]
    pub max_tokens: Option<u64>,

    /// Number of completions for each request.
    #[arg(short = 'i', long, default_value_t = 1)]
    pub completions: u32,

    /// Request frequency_penalty.
    #[arg(long)]
    pub frequency_penalty: Option<f64>,

    /// Request presence_penalty.
    #[arg(long, allow_hyphen_values = true)]
    pub presence_penalty: Option<f64>,

    /// Request temperature.
    #[arg(long)]
    pub temperature: Option<f64>,

    /// Request top_p.
    #[arg(long)]
    pub top_p: Option<f64>,

    /// Prepend varying text to each message to defeat server-side prompt
    /// caching.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub prevent_server_caching: bool,

    /// Output format for periodic statistics.
    #[arg(short = 'f', long, value_enum, default_value_t = OutputFormat::Human)]
    pub output_format: OutputFormat,

    /// Request retry strategy.
    #[arg(short = 't', long, value_enum, default_value_t = RetryMode::None)]
    pub retry: RetryMode,

    /// If provided, statistics emits are also saved to a file in this
    /// directory. The file name encodes important run parameters.
    #[arg(long)]
    pub log_save_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct TokenizeArgs {
    /// Model to assume for tokenization.
    #[arg(short = 'm', long)]
    pub model: String,

    /// Input text or chat messages JSON to tokenize. Defaults to stdin.
    pub text: Option<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextGenerationMethod {
    Generate,
    Replay,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeProfile {
    Balanced,
    Context,
    Generation,
    Custom,
}

impl ShapeProfile {
    pub fn name(self) -> &'static str {
        match self {
            Self::Balanced => "balanced",
            Self::Context => "context",
            Self::Generation => "generation",
            Self::Custom => "custom",
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Human,
    Jsonl,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryMode {
    None,
    Exponential,
}
