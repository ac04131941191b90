use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let cli = pantry_predictor_cli::Cli::parse();
    pantry_predictor_cli::run_cli(cli)
}
