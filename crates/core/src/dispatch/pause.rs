//! Global pause gate for fetch tasks.

use tokio::sync::watch;

/// Tasks that have started wait here while the gate is paused.
#[derive(Debug)]
pub struct PauseGate {
    paused: watch::Sender<bool>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self { paused }
    }

    pub fn pause(&self) {
        if !self.paused.send_replace(true) {
            tracing::debug!("Fetch work paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.send_replace(false) {
            tracing::debug!("Fetch work resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Return once the gate is open.
    pub async fn wait_resumed(&self) {
        let mut rx = self.paused.subscribe();
        let _ = rx.wait_for(|paused| !*paused).await;
    }
}
