//! Online/offline signal source.
//!
//! The host application feeds OS-level connectivity changes in with
//! [`NetworkMonitor::set_online`], or lets [`NetworkMonitor::watch_reachability`]
//! derive them from periodic TCP reachability checks.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Shared network status. Cloning yields another handle to the same signal.
#[derive(Clone)]
pub struct NetworkMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl NetworkMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Record a connectivity change. Repeated identical signals are ignored.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            log::info!("Network is now {}", if online { "online" } else { "offline" });
        }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Periodically try a TCP connect to `addr` and publish the outcome.
    ///
    /// Runs until `token` is cancelled.
    pub fn watch_reachability(
        &self,
        addr: String,
        interval: Duration,
        timeout: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let reachable = matches!(
                            tokio::time::timeout(timeout, TcpStream::connect(addr.as_str())).await,
                            Ok(Ok(_))
                        );
                        monitor.set_online(reachable);
                    }
                }
            }
        })
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
