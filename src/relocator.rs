use crate::blob_store::{BlobRef, BlobStore, CopyStatus, Lease};
use crate::config::BatchConfig;
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

/// Moves a set of blobs into a terminal partition folder.
///
/// Idempotent and safe under concurrent movers: a not-found while reading or
/// deleting the source means another mover already finished and is treated
/// as success, as is a denied lease.
pub struct Relocator {
    store: Arc<dyn BlobStore>,
    lease_enabled: bool,
    lease_duration: Duration,
    poll_initial: Duration,
    max_wait: Duration,
}

impl Relocator {
    pub fn new(store: Arc<dyn BlobStore>, config: &BatchConfig) -> Self {
        Self {
            store,
            lease_enabled: config.lease_enabled,
            lease_duration: Duration::from_secs(config.lease_secs),
            poll_initial: Duration::from_millis(config.copy_poll_initial_ms),
            max_wait: Duration::from_secs(config.copy_wait_max_secs),
        }
    }

    /// Relocate every file to the sibling `destination_folder`, filenames
    /// unchanged.
    ///
    /// Copy failures are isolated per file: the file is retried once, then
    /// logged and left in place for manual intervention while the remaining
    /// files proceed. Files already moved are never rolled back.
    #[instrument(skip(self, files), fields(count = files.len()))]
    pub async fn relocate(&self, files: &[BlobRef], destination_folder: &str) -> Result<()> {
        for file in files {
            self.relocate_file(file, destination_folder).await?;
        }
        Ok(())
    }

    async fn relocate_file(&self, src: &BlobRef, destination_folder: &str) -> Result<()> {
        let lease = if self.lease_enabled {
            match self.store.acquire_lease(src, self.lease_duration).await? {
                Some(lease) => Some(lease),
                None => {
                    // another mover holds this blob; its move counts as ours
                    debug!(blob = %src, "Lease denied, concurrent mover owns this file");
                    return Ok(());
                }
            }
        } else {
            None
        };

        let dst = src.sibling_in_folder(destination_folder);

        let copied = match self.copy_and_wait(src, &dst).await? {
            true => true,
            false => {
                warn!(blob = %src, folder = %destination_folder, "Copy failed. Retrying once...");
                self.copy_and_wait(src, &dst).await?
            }
        };

        if !copied {
            error!(
                blob = %src,
                folder = %destination_folder,
                "Copy retry failed. File not moved, manual intervention required"
            );
            metrics::counter!("gate.files.relocation_failed").increment(1);
            self.release(src, lease.as_ref()).await;
            return Ok(());
        }

        self.release(src, lease.as_ref()).await;

        match self.store.delete(src).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(blob = %src, "Source already gone, delete skipped");
            }
            Err(e) => return Err(e),
        }

        metrics::counter!("gate.files.relocated").increment(1);
        info!(blob = %src, folder = %destination_folder, "File relocated");
        Ok(())
    }

    /// Start one copy and poll its status with sleep-based backoff until a
    /// terminal status or the bounded wait elapses. Returns whether the copy
    /// reached success.
    async fn copy_and_wait(&self, src: &BlobRef, dst: &BlobRef) -> Result<bool> {
        match self.store.begin_copy(src, dst).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                // source vanished under us; treat like a concurrent mover win
                debug!(blob = %src, "Copy source missing");
                return Ok(true);
            }
            Err(e) => {
                warn!(blob = %src, error = %e, "Copy request failed");
                return Ok(false);
            }
        }

        let mut waited = Duration::ZERO;
        let mut interval = self.poll_initial;

        loop {
            match self.store.copy_status(dst).await? {
                CopyStatus::Success => return Ok(true),
                CopyStatus::Failed(reason) => {
                    warn!(blob = %dst, reason = %reason, "Copy reported failure");
                    return Ok(false);
                }
                CopyStatus::Pending => {
                    if waited >= self.max_wait {
                        warn!(
                            blob = %dst,
                            waited_secs = waited.as_secs(),
                            "Copy still pending after bounded wait"
                        );
                        return Ok(false);
                    }
                    sleep(interval).await;
                    waited += interval;
                    interval = (interval * 2).min(Duration::from_secs(5));
                }
            }
        }
    }

    async fn release(&self, src: &BlobRef, lease: Option<&Lease>) {
        if let Some(lease) = lease {
            if let Err(e) = self.store.release_lease(src, lease).await {
                // lease expires on its own; failing to release is not fatal
                warn!(blob = %src, error = %e, "Failed to release lease");
            }
        }
    }
}
