//! Scheduled synchronization loop.

use std::sync::Arc;
use std::time::Duration;

use artesync_core::SyncConfig;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::processor::{PassReport, SynchronizationProcessor};

/// Configuration for the synchronization loop.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Interval between passes.
    pub interval: Duration,
    /// Maximum consecutive failed passes before stopping.
    pub max_errors: usize,
    /// Whether to stop on the first failed pass.
    pub stop_on_error: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_errors: 10,
            stop_on_error: false,
        }
    }
}

impl From<&SyncConfig> for LoopConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            interval: config.interval(),
            max_errors: config.max_consecutive_errors,
            stop_on_error: config.stop_on_error,
        }
    }
}

/// Runs a pass on every tick until stopped.
pub struct SyncLoop {
    processor: Arc<SynchronizationProcessor>,
    config: LoopConfig,
    stop_rx: watch::Receiver<bool>,
    stop_tx: watch::Sender<bool>,
}

impl SyncLoop {
    /// Create a new loop.
    pub fn new(processor: Arc<SynchronizationProcessor>, config: LoopConfig) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            processor,
            config,
            stop_rx,
            stop_tx,
        }
    }

    /// Run until stopped or the error budget is exhausted.
    ///
    /// # Errors
    ///
    /// The failing pass error when `stop_on_error` is set, otherwise
    /// `LoopStopped` once `max_errors` consecutive passes failed.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            interval_ms = self.config.interval.as_millis(),
            "Starting synchronization loop"
        );

        let mut consecutive_errors = 0usize;
        let mut interval = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_once().await {
                        Ok(report) => {
                            consecutive_errors = 0;
                            if let Some(report) = report {
                                debug!(
                                    pass_id = %report.pass_id,
                                    applied = report.applied_count(),
                                    "Scheduled pass finished"
                                );
                            }
                        }
                        Err(e) => {
                            consecutive_errors += 1;
                            error!(
                                error = %e,
                                consecutive = consecutive_errors,
                                "Synchronization pass error"
                            );

                            if self.config.stop_on_error {
                                return Err(e);
                            }

                            if consecutive_errors >= self.config.max_errors {
                                error!("Max errors reached, stopping loop");
                                return Err(Error::loop_stopped(format!(
                                    "Max errors ({}) reached",
                                    self.config.max_errors
                                )));
                            }
                        }
                    }
                }
                _ = self.stop_rx.changed() => {
                    if *self.stop_rx.borrow() {
                        info!("Synchronization loop stopped");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Run a single scheduled pass, coalescing with any pass in flight.
    pub async fn run_once(&self) -> Result<Option<PassReport>> {
        self.processor.run_pass().await
    }

    /// Stop the loop.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Get a stopper handle.
    pub fn stopper(&self) -> LoopStopper {
        LoopStopper {
            stop_tx: self.stop_tx.clone(),
        }
    }
}

/// Handle to stop a synchronization loop.
#[derive(Clone)]
pub struct LoopStopper {
    stop_tx: watch::Sender<bool>,
}

impl LoopStopper {
    /// Stop the loop.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentSynchronizer, NoOpExecutor};
    use crate::processor::ProcessorConfig;
    use crate::source::InMemoryRepository;
    use crate::store::InMemoryArtefactStore;
    use crate::synchronizer::SynchronizerRegistry;

    fn setup() -> (Arc<InMemoryRepository>, Arc<SynchronizationProcessor>) {
        let source = Arc::new(InMemoryRepository::new());
        let registry = SynchronizerRegistry::new().with(Arc::new(DocumentSynchronizer::new(
            "role",
            "role",
            Arc::new(InMemoryArtefactStore::default()),
            Arc::new(NoOpExecutor),
        )));
        let processor = Arc::new(SynchronizationProcessor::new(
            registry,
            source.clone(),
            ProcessorConfig::default(),
        ));
        (source, processor)
    }

    fn fast() -> LoopConfig {
        LoopConfig {
            interval: Duration::from_millis(10),
            max_errors: 3,
            stop_on_error: false,
        }
    }

    #[test]
    fn test_loop_config_default() {
        let config = LoopConfig::default();
        assert_eq!(config.interval, Duration::from_secs(10));
        assert_eq!(config.max_errors, 10);
        assert!(!config.stop_on_error);
    }

    #[test]
    fn test_loop_config_from_sync_config() {
        let sync = SyncConfig {
            interval_secs: 3,
            max_consecutive_errors: 2,
            stop_on_error: true,
            ..SyncConfig::default()
        };
        let config = LoopConfig::from(&sync);
        assert_eq!(config.interval, Duration::from_secs(3));
        assert_eq!(config.max_errors, 2);
        assert!(config.stop_on_error);
    }

    #[tokio::test]
    async fn test_run_once_reports_pass() {
        let (source, processor) = setup();
        source.put("/admin.role", "{}").await;
        let sync_loop = SyncLoop::new(processor, fast());

        let report = sync_loop.run_once().await.ok().flatten();
        assert_eq!(report.map(|r| r.applied_count()), Some(1));
    }

    #[tokio::test]
    async fn test_stopper_ends_loop() {
        let (_source, processor) = setup();
        let mut sync_loop = SyncLoop::new(processor, fast());
        let stopper = sync_loop.stopper();

        let handle = tokio::spawn(async move { sync_loop.run().await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        stopper.stop();

        let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }

    #[tokio::test]
    async fn test_max_errors_stops_loop() {
        let (source, processor) = setup();
        source.set_unavailable(true);
        let mut sync_loop = SyncLoop::new(processor, fast());

        let result = tokio::time::timeout(Duration::from_secs(2), sync_loop.run()).await;
        assert!(matches!(result, Ok(Err(Error::LoopStopped { .. }))));
    }

    #[tokio::test]
    async fn test_stop_on_error_returns_pass_error() {
        let (source, processor) = setup();
        source.set_unavailable(true);
        let mut sync_loop = SyncLoop::new(
            processor,
            LoopConfig {
                stop_on_error: true,
                ..fast()
            },
        );

        let result = tokio::time::timeout(Duration::from_secs(2), sync_loop.run()).await;
        assert!(matches!(result, Ok(Err(Error::SourceUnavailable { .. }))));
    }
}
