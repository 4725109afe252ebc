//! Nonceshell CLI entry point.
//!
//! Provides `serve` for running the HTTP server and `render` for a single
//! render to stdout, optionally checked against the nonce invariants.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::http::{StatusCode, Uri};
use clap::{Parser, Subcommand};
use tracing::info;

use nonceshell::config::NonceshellConfig;
use nonceshell::controller::RenderController;
use nonceshell::document::{route_headers, DocumentEngine};
use nonceshell::engine::{RenderEngine, RenderRequest};
use nonceshell::{logging, server, verify};

/// Nonceshell: streaming HTML with a per-request CSP nonce.
#[derive(Parser)]
#[command(name = "nonceshell", version, about)]
struct Cli {
    /// Path to the config file (defaults to `$NONCESHELL_CONFIG_PATH` or `./nonceshell.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server.
    Serve,
    /// Render one page to stdout.
    Render {
        /// Request path.
        #[arg(default_value = "/")]
        path: String,
        /// Verify the nonce invariants and fail on violation.
        #[arg(long)]
        check: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = NonceshellConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;

    match cli.command {
        Command::Serve => handle_serve(&config).await,
        Command::Render { path, check } => handle_render(&config, &path, check).await,
    }
}

/// Run the server with file logging when a log directory is configured.
async fn handle_serve(config: &NonceshellConfig) -> anyhow::Result<()> {
    let _logging_guard = match config.logging.dir() {
        Some(dir) => Some(logging::init_production(dir, &config.logging.level)?),
        None => {
            logging::init_cli(&config.logging.level);
            None
        }
    };
    server::serve(config).await
}

/// Render `path` once and write status, headers and body to stdout.
async fn handle_render(config: &NonceshellConfig, path: &str, check: bool) -> anyhow::Result<()> {
    logging::init_cli(&config.logging.level);

    let uri: Uri = path
        .parse()
        .with_context(|| format!("invalid request path '{path}'"))?;
    let document = config.document_options();
    let headers = route_headers(&document);
    let engine: Arc<dyn RenderEngine> = Arc::new(DocumentEngine::new(document));
    let controller = RenderController::new(engine, config.controller_options());

    let response = controller
        .handle(RenderRequest::get(uri), StatusCode::OK, headers)
        .await
        .context("render rejected")?;
    let (status, headers, body, outcome) = response.collect().await;

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "HTTP/1.1 {status}")?;
    for (name, value) in &headers {
        writeln!(stdout, "{}: {}", name, value.to_str().unwrap_or("<binary>"))?;
    }
    writeln!(stdout)?;
    writeln!(stdout, "{body}")?;
    stdout.flush()?;

    info!(outcome = ?outcome.state(), "render finished");

    if check {
        let report = verify::check(&headers, &body).context("nonce check failed")?;
        info!(
            tagged = report.tagged,
            untagged = report.untagged,
            relayed_tagged = report.relayed_tagged,
            relayed_untagged = report.relayed_untagged,
            "nonce check passed"
        );
    }
    Ok(())
}
