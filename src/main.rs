use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use vacationd::config::Config;
use vacationd::delivery::SmtpRelay;
use vacationd::lmtp::{LmtpServer, spawn_lmtp_server};
use vacationd::ratelimit::{RateLimiter, spawn_expiry_worker};
use vacationd::reply::{ReplyBuilder, ReplyGenerator};
use vacationd::responder::{PROCESSING_DEADLINE, Responder};
use vacationd::store::VacationStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            eprintln!("  export VACATIOND_SMTP_SERVER_ADDRESS=smtp.example.com");
            std::process::exit(1);
        }
    };

    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("vacationd v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Domain: {}", config.autoreply_domain);
    eprintln!("   LMTP: {}", config.lmtp_listen_address);
    eprintln!("   Cooldown: {}s", config.cooldown.as_secs());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (limiter, worker) = RateLimiter::new(config.cooldown);
    let expiry = spawn_expiry_worker(worker, shutdown_rx.clone());

    let generator: Option<Arc<dyn ReplyGenerator>> = match &config.database_url {
        Some(url) => {
            let store = VacationStore::open(url, config.database_auth_token.as_ref())
                .await
                .with_context(|| format!("failed to open vacation store at {url}"))?;
            eprintln!("   Vacation store: {url}");
            Some(Arc::new(store))
        }
        None => {
            eprintln!("   Vacation store: none (default reply body)");
            None
        }
    };

    let relay = SmtpRelay::new(
        &config.smtp_server_address,
        config.smtp_server_port,
        PROCESSING_DEADLINE,
    );
    eprintln!("   Relay: {}", relay.relay());
    let responder = Responder::new(
        limiter,
        ReplyBuilder::new(config.autoreply_domain.clone(), generator),
        Arc::new(relay),
    );

    let server = LmtpServer::bind(
        config.lmtp_listen_address,
        config.autoreply_domain.clone(),
        responder,
        config.lmtp_read_timeout,
    )
    .await
    .with_context(|| format!("failed to listen on {}", config.lmtp_listen_address))?;
    let listener = spawn_lmtp_server(server, shutdown_rx);

    wait_for_shutdown_signal()
        .await
        .context("failed to install signal handlers")?;
    tracing::info!("Shutdown requested");

    let _ = shutdown_tx.send(true);
    let (listener, expiry) = tokio::join!(listener, expiry);
    listener.context("LMTP listener task failed")?;
    expiry.context("rate limiter task failed")?;

    Ok(())
}

/// Log to stderr, or to a daily-rolling file when a log directory is set.
/// The returned guard must live until exit so buffered lines are flushed.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "vacationd.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    }
}

async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
