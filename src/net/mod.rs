//! Connectivity signal the coordinator consults before draining.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

/// Online/offline signal with change notifications.
///
/// The engine treats this as the single source of truth for connectivity:
/// hosts flip it from whatever signal they have (native events, a probe
/// loop, a manual toggle in tests).
#[derive(Clone)]
pub struct ConnectivityMonitor {
  tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
  pub fn new(initially_online: bool) -> Self {
    let (tx, _) = watch::channel(initially_online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Update the connectivity state; subscribers only see transitions.
  pub fn set_online(&self, online: bool) {
    let changed = self.tx.send_if_modified(|current| {
      if *current != online {
        *current = online;
        true
      } else {
        false
      }
    });

    if changed {
      if online {
        info!("Connection restored");
      } else {
        warn!("Connection lost");
      }
    }
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

impl Default for ConnectivityMonitor {
  fn default() -> Self {
    Self::new(true)
  }
}

/// Probe a remote endpoint on an interval and flip the monitor accordingly.
///
/// Best-effort supplement for hosts without a native connectivity signal;
/// runs until the owning runtime shuts down.
pub async fn probe_loop(
  monitor: ConnectivityMonitor,
  client: reqwest::Client,
  url: Url,
  period: Duration,
) {
  let mut interval = tokio::time::interval(period);

  loop {
    interval.tick().await;
    let online = client.head(url.clone()).send().await.is_ok();
    debug!("Connectivity probe: {}", if online { "online" } else { "offline" });
    monitor.set_online(online);
  }
}
