use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use vireo::config::NetworkConfig;
use vireo::query::LocalBackend;
use vireo::server::Server;
use vireo::tasks::WorkerPool;
use vireo::transport::TlsContext;

#[derive(Parser)]
#[command(version, about = "A PostgreSQL-compatible database front-end")]
struct CommandLine {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:15432")]
    listen: String,
    /// PEM certificate chain; enables TLS together with --tls-key
    #[arg(long)]
    tls_cert: Option<PathBuf>,
    /// PEM private key
    #[arg(long)]
    tls_key: Option<PathBuf>,
    /// Execution pool size
    #[arg(long, default_value_t = 4)]
    workers: usize,
    /// Log verbosity (-v: debug, -vv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let commandline = CommandLine::parse();

    let level = match commandline.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .init();

    let config = NetworkConfig {
        listen_addr: commandline.listen,
        tls_cert: commandline.tls_cert,
        tls_key: commandline.tls_key,
        workers: commandline.workers,
    };

    let tls = match (&config.tls_cert, &config.tls_key) {
        (Some(cert), Some(key)) => {
            let ctx = TlsContext::from_pem_files(cert, key)?;
            info!(cert = %cert.display(), "tls enabled");
            Some(ctx)
        }
        (None, None) => None,
        _ => return Err("--tls-cert and --tls-key must be given together".into()),
    };

    let pool = WorkerPool::new(config.workers);
    let listener = TcpListener::bind(&config.listen_addr).await?;

    Server::new(listener, Arc::new(LocalBackend), pool, tls)
        .serve()
        .await?;
    Ok(())
}
