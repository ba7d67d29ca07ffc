use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dhgen_cli::args::Cli;

fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "dhgen=debug,dhgen_cli=debug,dhgen_comfyui=debug,dhgen_core=debug"
    } else {
        "dhgen=info,dhgen_cli=info,dhgen_comfyui=info,dhgen_core=info"
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter(cli.verbose).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match dhgen_cli::commands::run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
