//! Configuration types for ProxyFS.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::channel::{DEFAULT_UNIT_ID, HEADER_LEN};
use crate::error::{ProxyError, Result};
use crate::event::EventKind;

/// Log level for the ProxyFS daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only log errors
    Error,
    /// Log errors and warnings
    Warn,
    /// Log errors, warnings, and informational messages
    Info,
    /// Log errors, warnings, info, and debug messages
    Debug,
    /// Log everything including every forwarded operation
    Trace,
}

impl LogLevel {
    /// Returns the string representation of the log level.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(format!("Unknown log level: {}", s)),
        }
    }
}

/// Settings of the notification subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Whether the channel endpoint is opened at all
    pub enabled: bool,

    /// Channel unit identifier, part of the endpoint address
    pub unit_id: u32,

    /// Number of pre-allocated message buffers
    pub pool_count: usize,

    /// Size of each message buffer in bytes, header included
    pub pool_size: usize,

    /// Directory holding the channel sockets
    pub socket_dir: PathBuf,

    /// Activity kinds to report; empty reports everything
    pub events: Vec<EventKind>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            unit_id: DEFAULT_UNIT_ID,
            pool_count: 16,
            pool_size: 1024,
            socket_dir: std::env::temp_dir(),
            events: Vec::new(),
        }
    }
}

impl NotifyConfig {
    /// Returns true if events of `kind` are reported.
    pub fn wants(&self, kind: EventKind) -> bool {
        self.events.is_empty() || self.events.contains(&kind)
    }
}

/// Global configuration for ProxyFS.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Logging level
    pub log_level: LogLevel,

    /// Directory exposed through the proxy
    pub lower_dir: Option<PathBuf>,

    /// Where the proxy volume is mounted
    pub mount_point: Option<PathBuf>,

    /// Mount the volume read-only
    pub read_only: bool,

    /// Let other users access the mount
    pub allow_other: bool,

    /// Maximum number of simultaneously open proxy handles
    pub max_open_handles: usize,

    /// Notification channel settings
    pub notify: NotifyConfig,

    /// Parent directory of the diagnostic files
    pub diag_dir: PathBuf,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            lower_dir: None,
            mount_point: None,
            read_only: false,
            allow_other: false,
            max_open_handles: 4096,
            notify: NotifyConfig::default(),
            diag_dir: PathBuf::from("/run/proxyfs"),
        }
    }
}

impl ProxyConfig {
    /// Creates a new ProxyConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a config suitable for development/testing.
    pub fn development() -> Self {
        Self {
            log_level: LogLevel::Debug,
            diag_dir: std::env::temp_dir().join("proxyfs-diag"),
            ..Self::default()
        }
    }

    /// Loads a configuration from a JSON file. Missing fields keep their
    /// defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data)
            .map_err(|e| ProxyError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| ProxyError::Config(e.to_string()))
    }

    /// Validates the configuration.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        match &self.lower_dir {
            None => errors.push("Lower directory must be specified".to_string()),
            Some(dir) if !dir.is_dir() => {
                errors.push(format!("Lower directory does not exist: {:?}", dir));
            }
            Some(_) => {}
        }

        if let Some(mount_point) = &self.mount_point {
            if !mount_point.is_dir() {
                errors.push(format!("Mount point does not exist: {:?}", mount_point));
            }
            if self.lower_dir.as_ref() == Some(mount_point) {
                errors.push("Mount point must differ from the lower directory".to_string());
            }
        }

        if self.max_open_handles == 0 {
            errors.push("max_open_handles must be greater than 0".to_string());
        }

        if self.notify.enabled {
            if self.notify.pool_count == 0 {
                errors.push("notify.pool_count must be greater than 0".to_string());
            }
            if self.notify.pool_size <= HEADER_LEN {
                errors.push(format!(
                    "notify.pool_size must exceed the {} byte frame header",
                    HEADER_LEN
                ));
            }
            if !self.notify.socket_dir.is_dir() {
                errors.push(format!(
                    "Socket directory does not exist: {:?}",
                    self.notify.socket_dir
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
