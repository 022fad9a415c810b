//! gradle-tasks-server - Gradle build introspection and task execution over gRPC
//!
//! Editor extensions start this process next to a workspace and talk to it
//! over `gradle_tasks.v1.GradleTasks`.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use gradle_tasks_core::telemetry::init_tracing;
use gradle_tasks_core::{BuildService, GradleCli, ServiceConfig, DEFAULT_STREAM_BUFFER};
use tokio::net::TcpListener;
use tracing::{info, Level};

#[derive(Parser, Debug)]
#[command(name = "gradle-tasks-server")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Gradle build and task server for editor clients", long_about = None)]
struct Args {
    /// Address to bind
    #[arg(long, env = "GRADLE_TASKS_HOST", default_value = "127.0.0.1")]
    host: IpAddr,

    /// Port to listen on
    #[arg(short, long, env = "GRADLE_TASKS_PORT", default_value_t = 8887)]
    port: u16,

    /// Messages buffered per stream before the build is held back
    #[arg(long, env = "GRADLE_TASKS_STREAM_BUFFER", default_value_t = DEFAULT_STREAM_BUFFER)]
    stream_buffer: usize,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,

    /// Default log level when GRADLE_TASKS_LOG / RUST_LOG are unset
    #[arg(long, default_value = "info")]
    log_level: Level,
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json, args.log_level);

    let addr = SocketAddr::new(args.host, args.port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let core = BuildService::new(
        Arc::new(GradleCli::new()),
        ServiceConfig {
            stream_buffer: args.stream_buffer,
        },
    );
    gradle_tasks_server::serve(listener, core, shutdown_signal()).await?;

    info!("gradle-tasks server stopped");
    Ok(())
}
