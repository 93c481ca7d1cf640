use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SweeperConfig;
use crate::editing::EditingService;
use crate::executor::StreamRegistry;
use crate::remote_data::RemoteDataService;

/// Periodic cleanup of editing locks, drafts, takeover requests,
/// remote-data tokens and finished output streams.
pub struct Sweeper {
    config: SweeperConfig,
    editing: Arc<EditingService>,
    remote_data: Arc<RemoteDataService>,
    streams: Option<Arc<StreamRegistry>>,
}

impl Sweeper {
    pub fn new(
        config: SweeperConfig,
        editing: Arc<EditingService>,
        remote_data: Arc<RemoteDataService>,
    ) -> Self {
        Self {
            config,
            editing,
            remote_data,
            streams: None,
        }
    }

    pub fn with_streams(mut self, streams: Arc<StreamRegistry>) -> Self {
        self.streams = Some(streams);
        self
    }

    fn interval(secs: u64) -> tokio::time::Interval {
        let mut interval = tokio::time::interval(Duration::from_secs(secs.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    }

    pub fn sweep_locks(&self) {
        if let Err(e) = self.editing.cleanup_expired_locks() {
            warn!(error = %e, "Editing lock sweep failed");
        }
    }

    pub fn sweep_tokens(&self) {
        match self.remote_data.cleanup() {
            Ok(0) => {}
            Ok(n) => info!(count = n, "Removed expired remote data tokens"),
            Err(e) => warn!(error = %e, "Remote data token sweep failed"),
        }
    }

    pub fn sweep_streams(&self) -> usize {
        let Some(streams) = &self.streams else {
            return 0;
        };
        let pruned = streams.prune_closed(Duration::from_secs(self.config.stream_retention_secs));
        if pruned > 0 {
            debug!(count = pruned, "Pruned finished output streams");
        }
        pruned
    }

    pub fn sweep_history(&self) {
        if let Err(e) = self.editing.cleanup_old_drifts() {
            warn!(error = %e, "Draft sweep failed");
        }
        if let Err(e) = self.editing.cleanup_expired_requests() {
            warn!(error = %e, "Takeover request sweep failed");
        }
    }

    /// Run until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut locks = Self::interval(self.config.lock_sweep_secs);
        let mut tokens = Self::interval(self.config.token_sweep_secs);
        let mut history = Self::interval(self.config.draft_sweep_secs);

        debug!("Sweeper started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = locks.tick() => {
                    self.sweep_locks();
                    self.sweep_streams();
                }
                _ = tokens.tick() => self.sweep_tokens(),
                _ = history.tick() => self.sweep_history(),
            }
        }
        debug!("Sweeper stopped");
    }
}
