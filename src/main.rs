use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use xmpp_socket_bridge::{BridgeServer, Config, StreamConnector};

#[derive(Parser, Debug)]
#[command(name = "xmpp-socket-bridge", version, about)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Address to listen on for WebSocket clients (overrides the config file)
    #[arg(long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Log to stderr; `--verbose=xmpp` also logs stanza traffic
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "default"
    )]
    verbose: Option<String>,

    /// Log file path (default: platform data directory)
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Skip TLS certificate verification for XMPP servers (development only)
    #[arg(long)]
    dangerous_insecure_tls: bool,
}

/// Log directory and file name prefix.
fn log_location(cli: &Cli) -> (PathBuf, String) {
    if let Some(path) = &cli.log_file {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "bridge.log".to_string());
        return (dir, name);
    }
    // Linux: ~/.local/share/xmpp-socket-bridge/logs/ (or $XDG_DATA_HOME)
    let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    (base.join("xmpp-socket-bridge").join("logs"), "bridge.log".to_string())
}

/// Daily-rotating file log, plus stderr with `--verbose`. The returned guard
/// flushes the file writer when dropped.
fn init_tracing(cli: &Cli) -> WorkerGuard {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let (log_dir, file_name) = log_location(cli);
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Warning: could not create log directory '{}': {}", log_dir.display(), e);
    }

    let rust_log = std::env::var("RUST_LOG").is_ok();
    let file_filter = if rust_log {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("xmpp_socket_bridge=info,info")
    };
    let file_appender = tracing_appender::rolling::daily(&log_dir, &file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(file_filter);

    let stderr_layer = if cli.verbose.is_some() || rust_log {
        let stderr_filter = if rust_log {
            EnvFilter::from_default_env()
        } else if cli.verbose.as_deref() == Some("xmpp") {
            EnvFilter::new(
                "xmpp_socket_bridge=info,xmpp_socket_bridge::session=debug,xmpp_socket_bridge::client=debug,info",
            )
        } else {
            EnvFilter::new("xmpp_socket_bridge=info,info")
        };
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(stderr_filter),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();

    eprintln!("Log file: {}", log_dir.join(&file_name).display());
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(&cli);

    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(listen) = cli.listen {
        config.listen.address = listen;
    }
    if cli.dangerous_insecure_tls {
        config.xmpp.dangerous_insecure_tls = true;
    }

    let connector = StreamConnector::new(config.client_options());
    let mut server = BridgeServer::new(connector, config.session_config());
    let addr = server
        .start(config.listen.address)
        .await
        .with_context(|| format!("binding {}", config.listen.address))?;
    info!(addr = %addr, version = env!("CARGO_PKG_VERSION"), "Bridge listening");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutting down");
    server.stop();
    Ok(())
}
