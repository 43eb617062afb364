use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use modal_lsp::cli::args::{Cli, Commands};
use modal_lsp::cli::output::OutputFormatter;
use modal_lsp::commands::Session;
use modal_lsp::config::Config;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("modal_lsp=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("modal_lsp=warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(seconds) = cli.timeout {
        config.ready_timeout_ms = seconds.saturating_mul(1000);
        config.index_ready_timeout_ms = seconds.saturating_mul(1000);
    }

    let workspace = match cli.workspace {
        Some(dir) => Some(
            dir.canonicalize()
                .with_context(|| format!("Invalid workspace: {}", dir.display()))?,
        ),
        None => None,
    };

    let mut session = Session::new(config, workspace, OutputFormatter::new(cli.format));
    let outcome = match &cli.command {
        Commands::Check { file } => session.check(file).await,
        Commands::Interactive { file } => session.interactive(file.clone()).await.map(|()| true),
        command => match command.query() {
            Some((kind, position)) => {
                session.jump(kind, &position.file, position.line, position.column).await
            }
            None => Ok(true),
        },
    };
    session.close().await;

    Ok(if outcome? { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
