use anyhow::Context;
use clap::Parser;
use mail_catcher::config::{Config, LoggingConfig};
use mail_catcher::server::Services;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mail-catcher", version, about = "Disposable SMTP/POP3 mail catcher")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Overrides `logging.level`
    #[arg(long)]
    log_level: Option<String>,
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if logging.format == "json" {
        builder.json().try_init()
    } else {
        builder.pretty().try_init()
    };
    if let Err(e) = result {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let (mut config, loaded) = if args.config.exists() {
        let config = Config::from_file(&args.config)
            .with_context(|| format!("Failed to load {}", args.config.display()))?;
        (config, true)
    } else {
        (Config::default(), false)
    };
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    init_logging(&config.logging);
    info!("Starting mail-catcher v{}", env!("CARGO_PKG_VERSION"));
    if loaded {
        info!("Configuration loaded from {}", args.config.display());
    } else {
        info!("No config file found at {}, using defaults", args.config.display());
    }
    info!("  SMTP listening on: {}", config.smtp.listen_addr);
    info!("  POP3 listening on: {}", config.pop3.listen_addr);
    info!("  Storage: {:?} {}", config.storage.kind, config.storage.path);
    info!("  Mailbox naming: {:?}", config.mailbox_naming);

    let drain_timeout = config.shutdown.drain_timeout();
    let mut services = Services::build(config).context("Failed to build services")?;
    let cancel = CancellationToken::new();
    services
        .start(cancel.clone())
        .await
        .context("Failed to start services")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Received interrupt, shutting down"),
                Err(e) => error!("Unable to listen for interrupt: {}", e),
            }
        }
        failure = services.notify() => {
            if let Some(e) = failure {
                error!("Fatal service error: {}", e);
            }
        }
    }

    cancel.cancel();
    if !services.drain(drain_timeout).await {
        warn!("Exiting with connections still open");
    }
    debug!("Final counters:\n{}", services.metrics().to_prometheus());
    info!("Shutdown complete");

    Ok(())
}
