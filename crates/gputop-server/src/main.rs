mod server;

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use gputop_core::config::{DEFAULT_PORT, DEFAULT_PROGRAM};
use gputop_core::{ExporterConfig, ListenConfig, ProducerConfig};
use gputop_services::{PrometheusSink, Supervisor};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use server::AppState;

#[derive(Parser, Debug)]
#[command(name = "gputop-exporter")]
#[command(about = "Export intel_gpu_top statistics as Prometheus gauges", long_about = None)]
struct Cli {
    /// Port to expose metrics on
    #[arg(short, long, env = "PORT", default_value_t = DEFAULT_PORT, value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// Address to bind the HTTP server to
    #[arg(long, env = "GPUTOP_BIND", default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Program that writes CSV telemetry to stdout
    #[arg(long, env = "GPUTOP_COMMAND", default_value = DEFAULT_PROGRAM)]
    command: String,

    /// Arguments for the producer (default: -c)
    #[arg(last = true)]
    args: Vec<String>,
}

impl Cli {
    fn into_config(self) -> ExporterConfig {
        let mut producer = ProducerConfig {
            program: self.command,
            ..ProducerConfig::default()
        };
        if !self.args.is_empty() {
            producer.args = self.args;
        }

        ExporterConfig {
            listen: ListenConfig {
                bind: self.bind,
                port: self.port,
            },
            producer,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .compact()
        .init();

    let config = Cli::parse().into_config();
    config.validate()?;

    let sink = Arc::new(PrometheusSink::new()?);
    let pipeline = Supervisor::new(config.producer.clone(), sink.clone()).start();
    let token = pipeline.token();

    tokio::spawn(shutdown_signal(token.clone()));

    let state = AppState {
        sink,
        pipeline: pipeline.status(),
        program: config.producer.program.clone(),
    };
    let http = tokio::spawn(server::serve(
        config.listen.socket_addr(),
        state,
        token.clone(),
    ));

    token.cancelled().await;
    info!("Context cancelled, shutting down...");

    let status = pipeline.status();
    let pipeline_result = pipeline.wait().await;
    match http.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "HTTP server stopped with error"),
        Err(e) => error!(error = %e, "HTTP server task failed"),
    }

    info!(transitions = ?status.history(), "Intel GPU exporter stopped");
    pipeline_result?;
    Ok(())
}

/// Cancel `token` on Ctrl-C or SIGTERM.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
        _ = token.cancelled() => return,
    }
    token.cancel();
}
