use readygate::config::Config;
use readygate::proxy::ProxyServer;
use readygate::readiness::{ReadinessFlag, ReadinessProber};
use readygate::supervisor::{BackendSupervisor, SupervisorOutcome};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("readygate=info".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration; without a file argument the built-in defaults
    // mirror the reference deployment (listen :5000, backend :8501).
    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => {
            let config = Config::load(&path).map_err(|e| {
                error!(path = %path.display(), error = %e, "Failed to load configuration");
                e
            })?;
            info!(path = %path.display(), "Configuration loaded");
            config
        }
        None => {
            info!("No configuration file given, using built-in defaults");
            Config::default()
        }
    };

    let listen_addr = config.server.listen_addr()?;
    let upstream_addr = config.backend.loopback_addr();

    info!(
        listen = %listen_addr,
        upstream = %upstream_addr,
        command = %config.backend.command,
        "Starting readygate"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let readiness = ReadinessFlag::new();

    // The supervisor owns the backend child for the whole service lifetime.
    let supervisor = BackendSupervisor::new(config.backend.clone(), shutdown_rx.clone());
    let mut supervisor_handle = tokio::spawn(supervisor.run());

    // The prober races the boot window and flips the readiness flag once.
    let prober = ReadinessProber::new(
        upstream_addr,
        config.timeouts.probe_interval(),
        readiness.clone(),
        shutdown_rx.clone(),
    );
    tokio::spawn(prober.run());

    let proxy = ProxyServer::bind(
        listen_addr,
        upstream_addr,
        readiness,
        config.timeouts.clone(),
        shutdown_rx.clone(),
    )
    .await?;
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    let supervisor_result = tokio::select! {
        result = &mut supervisor_handle => Some(result),
        _ = shutdown_signal() => None,
    };

    match supervisor_result {
        Some(result) => {
            // The backend is gone and is never restarted; nothing is left to
            // front, so the whole service comes down with a failure status.
            let _ = shutdown_tx.send(true);
            match result {
                Ok(Ok(SupervisorOutcome::Exited(status))) => {
                    anyhow::bail!("Backend process exited unexpectedly ({})", status);
                }
                Ok(Ok(SupervisorOutcome::Shutdown)) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(anyhow::anyhow!("Supervisor task failed: {}", e)),
            }
        }
        None => {
            let _ = shutdown_tx.send(true);

            // The supervisor kills the child; give everything a bounded
            // window to wind down.
            let _ = tokio::time::timeout(Duration::from_secs(5), async {
                let _ = supervisor_handle.await;
                let _ = proxy_handle.await;
            })
            .await;

            info!("Shutdown complete");
            Ok(())
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for Ctrl+C");
    info!("Received Ctrl+C, shutting down...");
}
