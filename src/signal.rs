use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Process-wide shutdown flag plus the set of open critical sections.
///
/// A shutdown request only becomes an exit once no critical section is
/// open. Apply and state saving run inside critical sections so a signal
/// never interrupts them.
pub struct SignalManager {
    graceful_exit: AtomicBool,
    sections: Mutex<HashMap<String, usize>>,
    changed: Notify,
    shutdown: CancellationToken,
}

impl Default for SignalManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalManager {
    pub fn new() -> Self {
        Self {
            graceful_exit: AtomicBool::new(false),
            sections: Mutex::new(HashMap::new()),
            changed: Notify::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelled once shutdown is requested.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn request_shutdown(&self) {
        if !self.graceful_exit.swap(true, Ordering::SeqCst) {
            let open = self.open_sections();
            if open.is_empty() {
                tracing::info!("Shutdown requested");
            } else {
                tracing::warn!(sections = ?open, "Shutdown requested, waiting for critical sections");
            }
        }
        self.shutdown.cancel();
    }

    /// Wait for SIGINT or SIGTERM, then request shutdown.
    pub async fn listen(self: Arc<Self>) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    self.request_shutdown();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT"),
                _ = term.recv() => tracing::info!("Received SIGTERM"),
                _ = self.shutdown.cancelled() => return,
            }
        }
        #[cfg(not(unix))]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl-C"),
                _ = self.shutdown.cancelled() => return,
            }
        }
        self.request_shutdown();
    }

    /// Open a critical section; it closes when the guard is dropped.
    pub fn enter_critical_section(self: &Arc<Self>, stage: &str) -> CriticalSection {
        self.enter(stage);
        CriticalSection {
            manager: Arc::clone(self),
            stage: stage.to_string(),
            open: true,
        }
    }

    fn enter(&self, stage: &str) {
        if let Ok(mut sections) = self.sections.lock() {
            *sections.entry(stage.to_string()).or_insert(0) += 1;
        }
        tracing::debug!(stage = stage, "Entered critical section");
    }

    /// Close one open section named `stage`. Unmatched calls are ignored.
    pub fn exit_critical_section(&self, stage: &str) {
        if let Ok(mut sections) = self.sections.lock() {
            match sections.get_mut(stage) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    sections.remove(stage);
                }
                None => {
                    tracing::warn!(stage = stage, "Exit without matching critical section");
                    return;
                }
            }
        }
        tracing::debug!(stage = stage, "Exited critical section");
        self.changed.notify_waiters();
    }

    pub fn is_critical_section(&self) -> bool {
        self.sections.lock().map(|s| !s.is_empty()).unwrap_or(false)
    }

    pub fn open_sections(&self) -> Vec<String> {
        self.sections
            .lock()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_graceful_exit(&self) -> bool {
        self.graceful_exit.load(Ordering::SeqCst)
    }

    pub fn should_exit(&self) -> bool {
        self.is_graceful_exit() && !self.is_critical_section()
    }

    /// Wait until every critical section closed. False on timeout.
    pub async fn wait_for_critical_sections(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            if !self.is_critical_section() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return !self.is_critical_section();
            }
        }
    }

    /// Wait, without a deadline, until every critical section closed.
    pub async fn wait_until_sections_closed(&self) {
        loop {
            let notified = self.changed.notified();
            if !self.is_critical_section() {
                return;
            }
            notified.await;
        }
    }

    /// Clear the shutdown flag and every open section. The shutdown token
    /// stays cancelled.
    pub fn reset(&self) {
        self.graceful_exit.store(false, Ordering::SeqCst);
        if let Ok(mut sections) = self.sections.lock() {
            sections.clear();
        }
        self.changed.notify_waiters();
    }
}

/// Guard for an open critical section.
pub struct CriticalSection {
    manager: Arc<SignalManager>,
    stage: String,
    open: bool,
}

impl CriticalSection {
    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn exit(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.manager.exit_critical_section(&self.stage);
        }
    }
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        self.close();
    }
}
