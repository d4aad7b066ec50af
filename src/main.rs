use clap::Parser;

use gale::cli::{Cli, Commands};
use gale::config::LoadConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Load .env file if present (silently ignored if missing)
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    match cli.command {
        Commands::Load(args) => {
            let config = match LoadConfig::from_args(args) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("invalid argument(s): {e}");
                    std::process::exit(1);
                }
            };
            if let Err(e) = gale::load::run(config).await {
                if e.is_config() {
                    eprintln!("invalid argument(s): {e}");
                    std::process::exit(1);
                }
                return Err(e.into());
            }
        }
        Commands::Tokenize(args) => {
            if let Err(e) = gale::tokenize::run(&args) {
                eprintln!("invalid argument(s): {e}");
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
