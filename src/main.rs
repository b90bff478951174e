use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use broker_token_keeper::auth::{HttpTokenEndpoint, LifecycleCoordinator, MaskerHandle};
use broker_token_keeper::clock::SystemClock;
use broker_token_keeper::config::Config;
use broker_token_keeper::logging;
use broker_token_keeper::secrets::{EnvFileStore, EnvStore, SecretStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let config = Config::load()?;
    config.validate()?;

    // Masker is shared with the log writer and filled in as secrets load
    let masker = MaskerHandle::new();
    logging::init_logging(
        &config.log_level.to_lowercase(),
        &config.log_format,
        masker.clone(),
    )?;

    print_startup_banner(&config);
    tracing::info!("🚀 Broker Token Keeper starting...");

    let store: Arc<dyn SecretStore> = match config.env_file {
        Some(ref path) => Arc::new(
            EnvFileStore::open(path, config.credential_prefix.clone())
                .context("Failed to open credentials env file")?,
        ),
        None => Arc::new(EnvStore::new(config.credential_prefix.clone())),
    };

    let endpoint = HttpTokenEndpoint::new(
        &config.base_url,
        &config.token_path,
        &config.grant_type,
        Duration::from_secs(config.refresh_timeout),
    )?;
    tracing::info!("Token endpoint: {}", endpoint.url());

    let coordinator = match LifecycleCoordinator::start_with(
        config.coordinator_config()?,
        store,
        Arc::new(endpoint),
        Arc::new(SystemClock),
        masker,
    )
    .await
    {
        Ok(coordinator) => coordinator,
        Err(e) => {
            tracing::error!("❌ Startup failed: {}", e);
            if e.requires_operator_action() {
                tracing::error!("");
                tracing::error!("🔧 Check the {}* credentials and restart", config.credential_prefix);
            }
            return Err(e).context("Token lifecycle failed to start");
        }
    };

    tracing::info!(
        "✅ Access token ready, expires at {}",
        coordinator.token_expires_at().to_rfc3339()
    );

    run_until_shutdown(&coordinator, config.status_interval).await;

    coordinator.shutdown().await;
    tracing::info!("👋 Shutdown complete");

    Ok(())
}

/// Log status periodically and reload credentials on SIGHUP until a
/// shutdown signal arrives
async fn run_until_shutdown(coordinator: &LifecycleCoordinator, status_interval: u64) {
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut reload = ReloadSignal::install();

    let mut status = (status_interval > 0)
        .then(|| tokio::time::interval(Duration::from_secs(status_interval)));

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = reload.recv() => {
                tracing::info!("Received reload signal, re-reading credentials...");
                if let Err(e) = coordinator.reload_credentials().await {
                    tracing::error!("❌ Credential reload failed: {}", e);
                }
            }
            _ = async {
                match status.as_mut() {
                    Some(interval) => { interval.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => log_status(coordinator),
        }
    }
}

fn log_status(coordinator: &LifecycleCoordinator) {
    let metrics = coordinator.metrics();
    tracing::info!(
        phase = ?coordinator.phase(),
        source = ?coordinator.token_source(),
        expires_at = %coordinator.token_expires_at().to_rfc3339(),
        requests = metrics.requests,
        successes = metrics.successes,
        failures = metrics.total_failures(),
        joined = metrics.joined,
        "📊 Token status"
    );
}

/// Print startup banner
fn print_startup_banner(config: &Config) {
    let banner = r#"
╔═══════════════════════════════════════════════════════════╗
║                                                           ║
║                 🔑 Broker Token Keeper                    ║
║                                                           ║
║  Credential checks and daily access-token refresh         ║
║                                                           ║
╚═══════════════════════════════════════════════════════════╝
"#;

    println!("{}", banner);
    println!("  Version:       {}", env!("CARGO_PKG_VERSION"));
    println!("  API:           {}", config.base_url);
    println!(
        "  Credentials:   {}",
        config
            .env_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| format!("environment ({}*)", config.credential_prefix))
    );
    println!("  Refresh:       {}s before expiry", config.refresh_threshold);
    println!("  Log Level:     {}", config.log_level);
    println!();
}

/// SIGHUP listener, installed once so a signal arriving mid-reload is kept
struct ReloadSignal {
    #[cfg(unix)]
    hangup: Option<tokio::signal::unix::Signal>,
}

impl ReloadSignal {
    #[cfg(unix)]
    fn install() -> Self {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::hangup()) {
            Ok(hangup) => Self {
                hangup: Some(hangup),
            },
            Err(e) => {
                tracing::warn!("Failed to install SIGHUP handler: {}", e);
                Self { hangup: None }
            }
        }
    }

    #[cfg(not(unix))]
    fn install() -> Self {
        Self {}
    }

    /// Resolves on SIGHUP; never when no listener is installed
    async fn recv(&mut self) {
        #[cfg(unix)]
        {
            if let Some(hangup) = self.hangup.as_mut() {
                if hangup.recv().await.is_some() {
                    return;
                }
                self.hangup = None;
            }
        }

        std::future::pending::<()>().await
    }
}

/// Handle graceful shutdown signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
