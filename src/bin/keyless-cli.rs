use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use futures_util::future::join_all;
use serde::Serialize;

use keyless::client::TcpConnector;
use keyless::config::loader::load_client_config;
use keyless::{Client, ClientConfig};

#[derive(Parser)]
#[command(name = "keyless-cli")]
#[command(about = "Diagnostic client for keyless keyservers", long_about = None)]
struct Cli {
    /// Client configuration (certificate, key, CA bundle, timeouts).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Talk plain TCP instead of TLS.
    #[arg(long)]
    plaintext: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send concurrent pings over one connection and report latency
    Ping {
        /// Keyserver address (host:port)
        server: String,
        /// Number of pings
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,
        /// Payload size in bytes
        #[arg(short, long, default_value_t = 16)]
        size: usize,
    },
}

#[derive(Serialize)]
struct PingSummary {
    server: String,
    sent: usize,
    ok: usize,
    failed: usize,
    min_ms: f64,
    avg_ms: f64,
    max_ms: f64,
    errors: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_client_config(path)?,
        None => ClientConfig::default(),
    };
    let client = if cli.plaintext {
        Client::with_connector(&config, Arc::new(TcpConnector::new(config.connect_timeout())))
    } else {
        Client::from_config(&config)?
    };

    match cli.command {
        Commands::Ping { server, count, size } => {
            let conn = client.dial(&server).await?;
            let payload: Vec<u8> = (0..size).map(|i| i as u8).collect();

            let results = join_all((0..count).map(|_| {
                let conn = Arc::clone(&conn);
                let payload = payload.clone();
                async move {
                    let started = Instant::now();
                    match conn.ping(&payload).await {
                        Ok(echo) if echo == payload => Ok(started.elapsed()),
                        Ok(_) => Err("echo mismatch".to_string()),
                        Err(e) => Err(e.to_string()),
                    }
                }
            }))
            .await;

            let latencies: Vec<Duration> = results.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
            let errors: Vec<String> = results.into_iter().filter_map(Result::err).collect();
            let ms = |d: &Duration| d.as_secs_f64() * 1000.0;

            let summary = PingSummary {
                server,
                sent: count,
                ok: latencies.len(),
                failed: errors.len(),
                min_ms: latencies.iter().map(ms).reduce(f64::min).unwrap_or(0.0),
                avg_ms: if latencies.is_empty() {
                    0.0
                } else {
                    latencies.iter().map(ms).sum::<f64>() / latencies.len() as f64
                },
                max_ms: latencies.iter().map(ms).fold(0.0, f64::max),
                errors,
            };
            println!("{}", serde_json::to_string_pretty(&summary)?);

            if summary.failed > 0 {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
