//! CLI entry point for the esgf-fetch engine.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use esgf_fetch::config::default_credentials_path;
use esgf_fetch::{Catalog, Config, CredentialFile, Database, Downloader};
use tracing::{debug, info, warn};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Determine log level based on verbose/quiet flags
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");
    info!("esgf-fetch starting");

    let credentials_pem = args.credentials.clone().or_else(default_credentials_path);

    let config = Config {
        username: args.username,
        password: args.password,
        auth_server: args.auth_server,
        initial_threads_per_host: args.threads_per_host,
        max_total_threads: args.max_total_threads,
        credentials_pem: credentials_pem.clone(),
        tls_verify: args.tls_verify,
        exit_when_idle: !args.watch,
        ..Config::new(args.database, args.output_path)
    };

    let db = Database::new(&config.database_file).await?;
    let catalog = Catalog::new(db);

    let logon = match &credentials_pem {
        Some(path) => Arc::new(CredentialFile::new(path.clone())),
        None => anyhow::bail!("NOAUTH: no credential path (HOME unset and --credentials missing)"),
    };

    let downloader = Downloader::new(config, catalog, logon)?;

    // SIGTERM and Ctrl-C both request urgent shutdown: in-flight transfers
    // are reset to waiting and their partial files removed.
    let handle = downloader.shutdown_handle();
    tokio::spawn(async move {
        wait_for_termination().await;
        warn!("termination signal received; shutting down");
        handle.request_stop(true);
    });

    downloader.run().await?;

    info!("esgf-fetch exiting");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "cannot install SIGTERM handler; Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}
