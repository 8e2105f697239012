use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use boreal_tftp::config::{
    load_config, validate_config, write_config, ListenerConfig, LogFormat, LoggingConfig,
    ServerConfig,
};
use boreal_tftp::endpoint::{SocketTuning, UdpSocketFactory};
use boreal_tftp::{ServerEvent, TftpServer};

#[derive(Parser, Debug)]
#[command(name = "boreal-tftpd", about = "Read-only TFTP server")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "/etc/boreal/tftpd.toml")]
    config: PathBuf,

    /// Write the current configuration to the config path and exit
    #[arg(long)]
    init_config: bool,

    /// Validate the configuration and exit (no socket bind)
    #[arg(long)]
    check_config: bool,

    /// Create the files directories if they do not exist
    #[arg(long)]
    create_files_dir: bool,

    /// Bind address for a single-listener setup (overrides the config)
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Files directory for a single-listener setup (overrides the config)
    #[arg(long)]
    files_dir: Option<PathBuf>,

    /// Retransmission timeout in milliseconds
    #[arg(long)]
    retransmit_timeout_ms: Option<u64>,

    /// Maximum retransmissions of a block before the transfer is abandoned
    #[arg(long)]
    max_retries: Option<u32>,

    /// Mean ACK delay that counts as a slow network, in microseconds
    #[arg(long)]
    slow_network_threshold_us: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        load_config(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))?
    } else {
        ServerConfig::default()
    };

    if cli.bind.is_some() || cli.files_dir.is_some() {
        if config.listeners.is_empty() {
            config.listeners.push(ListenerConfig::default());
        }
        if let Some(bind) = cli.bind {
            config.listeners[0].bind_addr = bind;
        }
        if let Some(files_dir) = cli.files_dir {
            config.listeners[0].files_dir = files_dir;
        }
    }
    if let Some(timeout) = cli.retransmit_timeout_ms {
        config.transfer.retransmit_timeout_ms = timeout;
    }
    if let Some(retries) = cli.max_retries {
        config.transfer.max_retries = retries;
    }
    if let Some(threshold) = cli.slow_network_threshold_us {
        config.transfer.slow_network_threshold_us = threshold;
    }

    if cli.init_config {
        write_config(&cli.config, &config)?;
        if cli.create_files_dir {
            create_files_dirs(&config).await?;
        }
        println!("Wrote config to {}", cli.config.display());
        return Ok(());
    }

    if cli.create_files_dir {
        create_files_dirs(&config).await?;
    }

    if cli.check_config {
        validate_config(&config, false)?;
        println!("Config OK: {}", cli.config.display());
        return Ok(());
    }

    validate_config(&config, true)?;
    let _log_guard = init_logging(&config.logging)?;

    let factory = Arc::new(UdpSocketFactory::new(SocketTuning::default()));
    let (mut server, handle, mut events) = TftpServer::new(config.transfer.limits(), factory);
    for listener in &config.listeners {
        server.bind(
            listener.bind_addr.ip(),
            listener.bind_addr.port(),
            listener.files_dir.clone(),
        )?;
    }

    // the external notification sink: turn server events into log lines
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ServerEvent::NewReadSession { peer, filename } => {
                    info!(%peer, %filename, "transfer started");
                }
                ServerEvent::Progress { peer, percent } => {
                    debug!(%peer, percent, "transfer progress");
                }
                ServerEvent::SlowNetwork { peer, mean_delay_us } => {
                    warn!(%peer, mean_delay_us, "slow network detected");
                }
                ServerEvent::TransferFinished { peer } => {
                    info!(%peer, "transfer finished");
                }
                ServerEvent::TransferError { peer, message } => {
                    warn!(%peer, error = %message, "transfer failed");
                }
            }
        }
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            handle.close();
        }
    });

    server.run().await;
    Ok(())
}

async fn create_files_dirs(config: &ServerConfig) -> anyhow::Result<()> {
    for listener in &config.listeners {
        tokio::fs::create_dir_all(&listener.files_dir)
            .await
            .with_context(|| format!("creating {}", listener.files_dir.display()))?;
    }
    Ok(())
}

fn init_logging(
    logging: &LoggingConfig,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::new(logging.level.clone());

    if let Some(ref log_file) = logging.file {
        let dir = log_file.parent().unwrap_or_else(|| std::path::Path::new("."));
        let file_name = log_file
            .file_name()
            .and_then(|name| name.to_str())
            .context("logging.file must include a file name")?;
        let file_appender = tracing_appender::rolling::never(dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        match logging.format {
            LogFormat::Json => {
                tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(filter)
                    .with_writer(non_blocking)
                    .init();
            }
            LogFormat::Text => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(non_blocking)
                    .init();
            }
        }
        Ok(Some(guard))
    } else {
        match logging.format {
            LogFormat::Json => {
                tracing_subscriber::fmt().json().with_env_filter(filter).init();
            }
            LogFormat::Text => {
                tracing_subscriber::fmt().with_env_filter(filter).init();
            }
        }
        Ok(None)
    }
}
