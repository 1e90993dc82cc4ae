//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

use esgf_fetch::config::{DEFAULT_MAX_TOTAL_THREADS, DEFAULT_THREADS_PER_HOST};

/// Bulk downloader for ESGF climate data archives.
///
/// Reads pending transfers from a catalog database, downloads each file with
/// client-certificate authentication, verifies its checksum, and records the
/// outcome back in the catalog. Interrupted transfers are retried on the
/// next run.
#[derive(Parser, Debug)]
#[command(name = "esgf-fetch")]
#[command(author, version, about)]
pub struct Args {
    /// Path to the catalog database file
    #[arg(short = 'd', long)]
    pub database: PathBuf,

    /// Root directory downloaded files are placed under
    #[arg(short = 'o', long)]
    pub output_path: PathBuf,

    /// Authentication username
    #[arg(short = 'u', long, default_value = "")]
    pub username: String,

    /// Authentication password
    #[arg(short = 'p', long, default_value = "")]
    pub password: String,

    /// Server to authenticate against
    #[arg(short = 'a', long, default_value = "pcmdi9.llnl.gov")]
    pub auth_server: String,

    /// Starting download workers per data node
    #[arg(short = 't', long, default_value_t = DEFAULT_THREADS_PER_HOST)]
    pub threads_per_host: usize,

    /// Maximum download workers across all data nodes
    #[arg(short = 'T', long, default_value_t = DEFAULT_MAX_TOTAL_THREADS)]
    pub max_total_threads: usize,

    /// Client certificate PEM (default: $HOME/.esg/credentials.pem)
    #[arg(long)]
    pub credentials: Option<PathBuf>,

    /// Verify server TLS certificates
    #[arg(long)]
    pub tls_verify: bool,

    /// Keep polling the catalog for new transfers instead of exiting once
    /// the backlog drains
    #[arg(long)]
    pub watch: bool,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}
