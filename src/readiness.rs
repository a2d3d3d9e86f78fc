//! Backend readiness detection
//!
//! Tracks a single process-wide fact: whether the backend has started
//! accepting connections on its loopback port.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info};

/// One-shot flag signaling that the backend accepts connections.
///
/// Written once (false to true) by the [`ReadinessProber`] and read by every
/// connection handler. The flag never resets, so relaxed loads are enough: a
/// stale `false` observed around the transition only downgrades that one
/// connection to the placeholder response.
#[derive(Debug, Clone, Default)]
pub struct ReadinessFlag {
    ready: Arc<AtomicBool>,
}

impl ReadinessFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Mark the backend as ready. The prober is the only production caller;
    /// the transition is sticky.
    pub fn set(&self) {
        self.ready.store(true, Ordering::Relaxed);
    }
}

/// Polls the backend's loopback port until a TCP connect succeeds.
///
/// The interval is fixed, with no backoff or jitter. Once a connect succeeds
/// the probe socket is dropped immediately, the flag is set, and probing stops
/// for good; the flag is trusted for the rest of the process lifetime.
pub struct ReadinessProber {
    backend_addr: SocketAddr,
    interval: Duration,
    flag: ReadinessFlag,
    shutdown_rx: watch::Receiver<bool>,
}

impl ReadinessProber {
    pub fn new(
        backend_addr: SocketAddr,
        interval: Duration,
        flag: ReadinessFlag,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            backend_addr,
            interval,
            flag,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        debug!(addr = %self.backend_addr, interval_secs = self.interval.as_secs_f64(), "Probing backend for readiness");

        loop {
            match TcpStream::connect(self.backend_addr).await {
                Ok(stream) => {
                    // The probe only cares that the connect succeeded.
                    drop(stream);
                    self.flag.set();
                    info!(addr = %self.backend_addr, "Backend is accepting connections, proxying enabled");
                    return;
                }
                Err(e) => {
                    debug!(addr = %self.backend_addr, error = %e, "Backend not ready yet");
                }
            }

            if self.wait_interval_or_shutdown().await {
                debug!("Readiness prober shutting down before backend came up");
                return;
            }
        }
    }

    /// Wait out one probe interval; returns true if shutdown was requested.
    ///
    /// A dropped shutdown sender means shutdown can never arrive, so probing
    /// simply continues on the interval.
    async fn wait_interval_or_shutdown(&mut self) -> bool {
        let sleep = tokio::time::sleep(self.interval);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                changed = self.shutdown_rx.changed() => match changed {
                    Ok(()) if *self.shutdown_rx.borrow() => return true,
                    Ok(()) => {}
                    Err(_) => {
                        sleep.as_mut().await;
                        return false;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn flag_starts_false() {
        let flag = ReadinessFlag::new();
        assert!(!flag.is_ready());
    }

    #[test]
    fn flag_set_is_sticky_and_idempotent() {
        let flag = ReadinessFlag::new();
        flag.set();
        assert!(flag.is_ready());
        flag.set();
        assert!(flag.is_ready());

        let clone = flag.clone();
        assert!(clone.is_ready());
    }

    #[tokio::test]
    async fn prober_sets_flag_when_backend_listens() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Keep the listener alive so the probe connect succeeds.
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let flag = ReadinessFlag::new();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let prober = ReadinessProber::new(
            addr,
            Duration::from_millis(20),
            flag.clone(),
            shutdown_rx,
        );

        tokio::time::timeout(Duration::from_secs(2), prober.run())
            .await
            .expect("prober should finish once the backend accepts");
        assert!(flag.is_ready());
    }

    #[tokio::test]
    async fn prober_continues_after_shutdown_sender_drops() {
        // Reserve a port, released so the early probes fail.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let flag = ReadinessFlag::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let prober = ReadinessProber::new(
            addr,
            Duration::from_millis(20),
            flag.clone(),
            shutdown_rx,
        );
        let handle = tokio::spawn(prober.run());

        // Dropping the sender must not stop the prober or make it spin.
        drop(shutdown_tx);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!flag.is_ready());

        // Backend comes up on the reserved port; the prober should notice.
        let listener = TcpListener::bind(addr).await.unwrap();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("prober should still detect readiness")
            .unwrap();
        assert!(flag.is_ready());
    }

    #[tokio::test]
    async fn prober_stops_on_shutdown_without_setting_flag() {
        // Bind and drop so the port refuses connections.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let flag = ReadinessFlag::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let prober = ReadinessProber::new(
            addr,
            Duration::from_millis(500),
            flag.clone(),
            shutdown_rx,
        );
        let handle = tokio::spawn(prober.run());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("prober should observe shutdown")
            .unwrap();
        assert!(!flag.is_ready());
    }
}
