//! TOML configuration for the server binary.

use std::net::{Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TftpError};
use crate::session::TransferLimits;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listening endpoints; each one serves its own files directory.
    pub listeners: Vec<ListenerConfig>,
    pub transfer: TransferSettings,
    pub logging: LoggingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listeners: vec![ListenerConfig::default()],
            transfer: TransferSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// IPv4 or IPv6 address and UDP port to listen on.
    pub bind_addr: SocketAddr,

    /// Directory that requested filenames are resolved against.
    pub files_dir: PathBuf,

    /// Uploads are not implemented; this must stay `false`. The flag exists
    /// so configurations state the posture explicitly.
    pub upload_enabled: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 69),
            files_dir: PathBuf::from("/var/lib/boreal/tftp"),
            upload_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// Time to wait for an ACK before retransmitting, in milliseconds.
    /// Clients may renegotiate this per transfer via the `timeout` option.
    pub retransmit_timeout_ms: u64,

    /// Retransmissions of a block before the transfer is abandoned.
    pub max_retries: u32,

    /// Mean ACK round trip above which a transfer is reported as slow, in
    /// microseconds.
    pub slow_network_threshold_us: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            retransmit_timeout_ms: crate::DEFAULT_RETRANSMIT_TIMEOUT_MS,
            max_retries: crate::DEFAULT_MAX_RETRIES,
            slow_network_threshold_us: crate::DEFAULT_SLOW_NETWORK_THRESHOLD_US,
        }
    }
}

impl TransferSettings {
    pub fn limits(&self) -> TransferLimits {
        TransferLimits {
            retransmit_timeout: Duration::from_millis(self.retransmit_timeout_ms),
            max_retries: self.max_retries,
            slow_network_threshold_us: self.slow_network_threshold_us,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability
    Text,
    /// JSON structured logging for log aggregators
    Json,
}

pub fn load_config(path: &std::path::Path) -> Result<ServerConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: ServerConfig = toml::from_str(&contents)
        .map_err(|e| TftpError::Tftp(format!("Invalid config file {}: {}", path.display(), e)))?;
    Ok(config)
}

pub fn write_config(path: &std::path::Path, config: &ServerConfig) -> Result<()> {
    let contents = toml::to_string_pretty(config)
        .map_err(|e| TftpError::Tftp(format!("Failed to serialize config: {}", e)))?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Validate a configuration; with `validate_bind` the listener addresses are
/// also test-bound.
pub fn validate_config(config: &ServerConfig, validate_bind: bool) -> Result<()> {
    if config.listeners.is_empty() {
        return Err(TftpError::Tftp(
            "at least one [[listeners]] entry is required".to_string(),
        ));
    }

    for listener in &config.listeners {
        if listener.bind_addr.port() == 0 {
            return Err(TftpError::Tftp(
                "listener bind_addr port must be non-zero".to_string(),
            ));
        }

        let duplicates = config
            .listeners
            .iter()
            .filter(|other| other.bind_addr == listener.bind_addr)
            .count();
        if duplicates > 1 {
            return Err(TftpError::Tftp(format!(
                "listener bind_addr {} appears more than once",
                listener.bind_addr
            )));
        }

        if listener.upload_enabled {
            return Err(TftpError::Tftp(
                "uploads are not implemented; set upload_enabled = false".to_string(),
            ));
        }

        if !listener.files_dir.is_absolute() {
            return Err(TftpError::Tftp(
                "files_dir must be an absolute path".to_string(),
            ));
        }
        match std::fs::metadata(&listener.files_dir) {
            Ok(meta) => {
                if !meta.is_dir() {
                    return Err(TftpError::Tftp("files_dir must be a directory".to_string()));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TftpError::Tftp(
                    "files_dir does not exist; create it or adjust config".to_string(),
                ));
            }
            Err(e) => return Err(TftpError::Io(e)),
        }
        if let Err(e) = std::fs::read_dir(&listener.files_dir) {
            return Err(TftpError::Tftp(format!("files_dir is not readable: {}", e)));
        }

        if validate_bind {
            if let Err(e) = std::net::UdpSocket::bind(listener.bind_addr) {
                return Err(TftpError::Tftp(format!(
                    "listener bind_addr {} is not available: {}",
                    listener.bind_addr, e
                )));
            }
        }
    }

    if config.transfer.retransmit_timeout_ms == 0 {
        return Err(TftpError::Tftp(
            "retransmit_timeout_ms must be non-zero".to_string(),
        ));
    }
    if config.transfer.max_retries == 0 {
        return Err(TftpError::Tftp("max_retries must be non-zero".to_string()));
    }

    Ok(())
}
