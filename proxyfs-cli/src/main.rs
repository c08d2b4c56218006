use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use proxyfs_core::config::{LogLevel, ProxyConfig};
use proxyfs_core::diag::{Endpoint, DIAG_DIR};

#[derive(Parser)]
#[command(name = "proxyfs")]
#[command(about = "A stackable passthrough filesystem with activity notifications")]
#[command(version)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Overrides the configured log level
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount a proxy volume over a directory
    Mount {
        /// Directory to expose
        #[arg(short, long)]
        lower: Option<PathBuf>,

        /// Where to mount the proxy volume
        #[arg(short, long)]
        mount: Option<PathBuf>,

        /// Mount read-only
        #[arg(long)]
        read_only: bool,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,

        /// Do not open the notification channel
        #[arg(long)]
        no_notify: bool,
    },

    /// Print the diagnostic endpoints of a running proxy
    Status,

    /// Register as the monitoring process and print notifications
    Monitor {
        /// Exit after this many notifications
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },

    /// Validate the configuration and print it
    CheckConfig,
}

fn load_config(cli: &Cli) -> Result<ProxyConfig> {
    let mut config = match &cli.config {
        Some(path) => ProxyConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => ProxyConfig::default(),
    };
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    if let Commands::Mount { lower, mount, read_only, allow_other, no_notify } = &cli.command {
        if lower.is_some() {
            config.lower_dir = lower.clone();
        }
        if mount.is_some() {
            config.mount_point = mount.clone();
        }
        config.read_only |= *read_only;
        config.allow_other |= *allow_other;
        if *no_notify {
            config.notify.enabled = false;
        }
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("proxyfs={}", config.log_level.as_str()).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Mount { .. } => mount_filesystem(config).await,
        Commands::Status => show_status(&config).await,
        Commands::Monitor { count } => monitor(&config, count).await,
        Commands::CheckConfig => check_config(&config),
    }
}

fn check_config(config: &ProxyConfig) -> Result<()> {
    println!("{}", config.to_json()?);
    match config.validate() {
        Ok(()) => {
            println!("Configuration is valid");
            Ok(())
        }
        Err(errors) => {
            for error in &errors {
                eprintln!("  - {}", error);
            }
            Err(anyhow!("{} configuration problem(s)", errors.len()))
        }
    }
}

async fn show_status(config: &ProxyConfig) -> Result<()> {
    let dir = config.diag_dir.join(DIAG_DIR);
    for endpoint in Endpoint::ALL {
        let path = dir.join(endpoint.name());
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => print!("{}: {}", endpoint, content),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("No running proxy found ({} is unreadable)", path.display())
                })
            }
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
async fn mount_filesystem(config: ProxyConfig) -> Result<()> {
    use std::sync::Arc;

    use proxyfs_core::channel::Transport;
    use proxyfs_core::context::ProxyContext;
    use proxyfs_core::volume::{MountOptions, ProxyFs};
    use proxyfs_linux::diagdir::DiagDir;
    use proxyfs_linux::{BridgeOptions, HostFs, ProcProbe, UnixTransport};

    if let Err(errors) = config.validate() {
        return Err(anyhow!("Invalid configuration: {}", errors.join("; ")));
    }
    let lower = config.lower_dir.as_ref().ok_or_else(|| anyhow!("No lower directory given"))?;
    let lower = std::fs::canonicalize(lower)
        .with_context(|| format!("Cannot resolve {}", lower.display()))?;
    let mount_point = config
        .mount_point
        .clone()
        .ok_or_else(|| anyhow!("No mount point given"))?;

    let context = Arc::new(ProxyContext::new(config.notify.clone(), Arc::new(ProcProbe))?);
    let transport = if config.notify.enabled {
        Some(Arc::new(UnixTransport::bind(&config.notify.socket_dir, config.notify.unit_id)?))
    } else {
        None
    };
    context.start(transport.clone().map(|t| t as Arc<dyn Transport>));
    let listener = match &transport {
        Some(t) => Some(t.spawn_listener(Arc::clone(&context))?),
        None => None,
    };

    let diag = match DiagDir::publish(&config.diag_dir, context.diagnostics()) {
        Ok(diag) => Some(diag),
        Err(e) => {
            warn!(dir = %config.diag_dir.display(), error = %e, "Diagnostic endpoints unavailable");
            None
        }
    };

    let options = MountOptions { max_open_handles: config.max_open_handles };
    let fs = ProxyFs::mount(Arc::new(HostFs::new()), &lower, options)
        .with_context(|| format!("Failed to mount over {}", lower.display()))?
        .with_context(Arc::clone(&context));
    let bridge = BridgeOptions {
        read_only: config.read_only,
        allow_other: config.allow_other,
        ..BridgeOptions::default()
    };
    let session = proxyfs_linux::mount(Arc::new(fs), &mount_point, &bridge)?;
    info!(lower = %lower.display(), mount_point = %mount_point.display(), "ProxyFS is running, press Ctrl-C to unmount");

    tokio::signal::ctrl_c().await?;
    info!("Unmounting");
    drop(session);
    context.stop();
    if let Some(listener) = listener {
        tokio::task::spawn_blocking(move || listener.join())
            .await?
            .map_err(|_| anyhow!("Notification listener panicked"))?;
    }
    drop(diag);
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn mount_filesystem(_config: ProxyConfig) -> Result<()> {
    anyhow::bail!("Mounting is only supported on Linux");
}

#[cfg(target_os = "linux")]
async fn monitor(config: &ProxyConfig, count: Option<usize>) -> Result<()> {
    use proxyfs_linux::Subscriber;

    let subscriber = Subscriber::bind(&config.notify.socket_dir, config.notify.unit_id)
        .context("No proxy notification endpoint to register with")?;
    subscriber.register()?;
    info!(pid = subscriber.pid(), unit_id = config.notify.unit_id, "Registered as monitor");

    let receive = tokio::task::spawn_blocking(move || -> Result<()> {
        let mut seen = 0;
        while count.map_or(true, |n| seen < n) {
            let event = subscriber.recv()?;
            println!("{}", serde_json::to_string(&event)?);
            seen += 1;
        }
        Ok(())
    });

    tokio::select! {
        result = receive => result?,
        _ = tokio::signal::ctrl_c() => Ok(()),
    }
}

#[cfg(not(target_os = "linux"))]
async fn monitor(_config: &ProxyConfig, _count: Option<usize>) -> Result<()> {
    anyhow::bail!("Monitoring is only supported on Linux");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_flags_override_config() {
        let cli = Cli::parse_from([
            "proxyfs",
            "--log-level",
            "debug",
            "mount",
            "--lower",
            "/srv/data",
            "--mount",
            "/mnt/proxy",
            "--read-only",
            "--no-notify",
        ]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.lower_dir, Some(PathBuf::from("/srv/data")));
        assert_eq!(config.mount_point, Some(PathBuf::from("/mnt/proxy")));
        assert!(config.read_only);
        assert!(!config.allow_other);
        assert!(!config.notify.enabled);
    }

    #[test]
    fn test_status_keeps_defaults() {
        let cli = Cli::parse_from(["proxyfs", "status"]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.diag_dir, PathBuf::from("/run/proxyfs"));
        assert!(config.notify.enabled);
    }
}
