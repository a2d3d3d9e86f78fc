use crate::config::BackendConfig;
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Why the supervisor returned
#[derive(Debug)]
pub enum SupervisorOutcome {
    /// The backend exited on its own; fatal for the whole service
    Exited(ExitStatus),
    /// The shutdown signal fired and the backend was killed deliberately
    Shutdown,
}

/// Owns the backend child process for its entire lifetime.
///
/// There is exactly one backend and it is never restarted: if it exits for
/// any reason the caller is expected to bring the whole service down with a
/// failure status.
pub struct BackendSupervisor {
    config: BackendConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl BackendSupervisor {
    pub fn new(config: BackendConfig, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            config,
            shutdown_rx,
        }
    }

    /// Spawn the backend and wait for it to exit or for shutdown.
    pub async fn run(mut self) -> anyhow::Result<SupervisorOutcome> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args);
        cmd.args(self.config.server_flags());
        // Backend stdout/stderr are inherited so its logs flow through.
        cmd.stdin(Stdio::null());

        if let Some(ref working_dir) = self.config.working_dir {
            cmd.current_dir(working_dir);
        }
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            anyhow::anyhow!("Failed to spawn backend '{}': {}", self.config.command, e)
        })?;
        let pid = child.id().unwrap_or(0);
        info!(
            command = %self.config.command,
            pid,
            port = self.config.port,
            "Backend process spawned"
        );

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| {
                    anyhow::anyhow!("Failed to wait on backend process: {}", e)
                })?;
                error!(%status, "Backend process exited");
                Ok(SupervisorOutcome::Exited(status))
            }
            _ = wait_for_shutdown(&mut self.shutdown_rx) => {
                info!(pid, "Shutdown requested, stopping backend");
                if let Err(e) = child.kill().await {
                    warn!(pid, error = %e, "Failed to kill backend process");
                }
                Ok(SupervisorOutcome::Shutdown)
            }
        }
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender dropped without signaling; shutdown can never arrive.
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn shell_backend(script: &str) -> BackendConfig {
        BackendConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            port: 8501,
            working_dir: None,
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn reports_backend_exit_status() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = BackendSupervisor::new(shell_backend("exit 7"), shutdown_rx);

        let outcome = tokio::time::timeout(Duration::from_secs(5), supervisor.run())
            .await
            .expect("supervisor should return once the child exits")
            .unwrap();

        match outcome {
            SupervisorOutcome::Exited(status) => assert_eq!(status.code(), Some(7)),
            other => panic!("expected Exited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn kills_backend_on_shutdown() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = BackendSupervisor::new(shell_backend("sleep 30"), shutdown_rx);
        let handle = tokio::spawn(supervisor.run());

        // Give the child a moment to spawn before signaling.
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("supervisor should return promptly after shutdown")
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, SupervisorOutcome::Shutdown));
    }

    #[tokio::test]
    async fn missing_command_is_an_error() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = BackendConfig {
            command: "readygate-no-such-binary".to_string(),
            args: vec![],
            port: 8501,
            working_dir: None,
            env: HashMap::new(),
        };
        let supervisor = BackendSupervisor::new(config, shutdown_rx);

        assert!(supervisor.run().await.is_err());
    }
}
