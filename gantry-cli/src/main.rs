//! Gantry CLI (`gantry`)
//!
//! Serves every method found in the given descriptor sets over gRPC (and
//! optionally HTTP), answering calls from static JSON reply files in the
//! stacked directories.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use gantry_serve::{Server, ServerConfig, StackedFs};
use tracing_subscriber::EnvFilter;

use evaluator::StaticJsonEvaluator;

mod evaluator;

#[derive(Parser, Debug)]
#[command(name = "gantry", version, about = "Serve gRPC/HTTP from protobuf descriptors")]
struct Args {
    /// Additional descriptor-set files, loaded before directory discovery
    #[arg(long, short = 'p', value_name = "FILE")]
    protoset: Vec<PathBuf>,

    /// Listen address
    #[arg(long, short, default_value = "localhost:8080")]
    listen: String,

    /// Serve non-gRPC traffic through the HTTP transcoder
    #[arg(long)]
    http: bool,

    /// Verbose logging (-v for debug, -vv for trace)
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Directories searched for *.pb descriptor sets and <method>.json
    /// reply files; earlier directories shadow later ones
    #[arg(value_name = "DIR", required = true)]
    dirs: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose.max(debug_env_verbosity()));

    tracing::info!("gantry v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig {
        listen: args.listen,
        protosets: args.protoset,
        dirs: args.dirs.clone(),
        http: args.http,
        ..ServerConfig::default()
    };

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    let evaluator = Arc::new(StaticJsonEvaluator::new(StackedFs::new(args.dirs)));
    let server = Server::new(config, evaluator)?;

    server.serve_with_shutdown(listener, shutdown_signal()).await?;

    tracing::info!("Server stopped");
    Ok(())
}

/// `DEBUG=1|yes|true` bumps verbosity to debug without a flag.
fn debug_env_verbosity() -> u8 {
    match std::env::var("DEBUG").as_deref() {
        Ok("1") | Ok("yes") | Ok("true") => 1,
        _ => 0,
    }
}

fn init_tracing(verbosity: u8) {
    let mut filter = EnvFilter::from_default_env();

    // Only apply defaults if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        let level = match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        filter = filter.add_directive(level.parse().unwrap());
    }

    // Always silence noisy crates
    const SILENCE: &[&str] = &["h2=error", "hyper=error", "hyper_util=error"];
    for d in SILENCE {
        filter = filter.add_directive(d.parse().unwrap());
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
    }
}
