use crate::batch_store::BatchStateStore;
use crate::blob_store::BlobStore;
use crate::config::BatchConfig;
use crate::descriptor::{FileDescriptor, INBOUND_FOLDER};
use crate::error::Result;
use crate::expected::ExpectedFileSetResolver;
use crate::relocator::Relocator;
use crate::tracker::{Advance, Outcome, Tracker};
use crate::validator::FileSetValidator;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Signal channel depth per instance. Signals for one batch key are
/// delivered in arrival order.
const SIGNAL_BUFFER: usize = 32;

/// Everything an instance needs to drive a batch to its terminal state
struct WorkflowCtx {
    state_store: Arc<dyn BatchStateStore>,
    resolver: Arc<dyn ExpectedFileSetResolver>,
    validator: FileSetValidator,
    relocator: Relocator,
}

/// Handle to one running tracker instance
struct InstanceHandle {
    id: Uuid,
    signals: mpsc::Sender<FileDescriptor>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the tracker instances, one per batch key.
///
/// Instances for distinct keys run fully parallel with no shared mutable
/// state; the batch state store is the only cross-instance guard. A failed
/// instance is discarded and replaced, never resumed.
pub struct Dispatcher {
    ctx: Arc<WorkflowCtx>,
    instances: Mutex<HashMap<String, InstanceHandle>>,
}

impl Dispatcher {
    pub fn new(
        state_store: Arc<dyn BatchStateStore>,
        blob_store: Arc<dyn BlobStore>,
        resolver: Arc<dyn ExpectedFileSetResolver>,
        batch_config: &BatchConfig,
    ) -> Self {
        Self {
            ctx: Arc::new(WorkflowCtx {
                state_store,
                resolver,
                validator: FileSetValidator::new(blob_store.clone()),
                relocator: Relocator::new(blob_store, batch_config),
            }),
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Deliver a file-arrival notification for its batch key.
    ///
    /// No active instance: start one seeded with the file. Healthy
    /// instance: forward the signal. Dead instance without a terminal
    /// record: discard it and start fresh, seeded by this notification.
    /// A batch already `Done` swallows the notification.
    #[instrument(skip(self, descriptor), fields(batch_key = %descriptor.batch_prefix, filename = %descriptor.filename))]
    pub async fn start_or_signal(&self, descriptor: FileDescriptor) -> Result<()> {
        let batch_key = descriptor.batch_prefix.clone();

        let mut instances = self.instances.lock().await;

        // Sweep handles whose task already ran to completion, so the map
        // only ever holds live batches and a finished instance doesn't
        // linger for the lifetime of the process.
        instances.retain(|_, handle| !handle.task.is_finished());

        if let Some(record) = self.ctx.state_store.get(&batch_key).await? {
            if record.state.is_terminal() {
                info!(batch_key = %batch_key, "Batch already done, late notification ignored");
                return Ok(());
            }
        }

        if let Some(handle) = instances.get(&batch_key) {
            if handle.signals.send(descriptor.clone()).await.is_ok() {
                debug!(instance = %handle.id, "Signal delivered to running instance");
                return Ok(());
            }
            warn!(instance = %handle.id, "Instance stopped accepting signals");
        }

        // Failed or finished without a terminal record: bounce it and
        // start a replacement seeded by this notification.
        if let Some(stale) = instances.remove(&batch_key) {
            info!(instance = %stale.id, batch_key = %batch_key, "Discarding stale instance, restarting");
            stale.cancel.cancel();
        } else {
            info!(batch_key = %batch_key, "New instance needed. Starting...");
        }

        self.ctx.state_store.create_waiting(&descriptor).await?;
        let handle = Self::spawn_instance(self.ctx.clone(), descriptor);
        instances.insert(batch_key, handle);
        Ok(())
    }

    /// Administratively terminate the instance for a batch key, if any.
    /// The next notification for the key starts a replacement.
    ///
    /// Termination takes effect at the accumulation suspend point: an
    /// instance that already claimed validation runs its in-flight pass to
    /// completion rather than stranding a half-moved batch.
    pub async fn bounce(&self, batch_key: &str) {
        let mut instances = self.instances.lock().await;
        if let Some(handle) = instances.remove(batch_key) {
            info!(instance = %handle.id, batch_key = %batch_key, "Bouncing instance");
            handle.cancel.cancel();
        }
    }

    /// Number of instance handles currently held
    #[cfg(test)]
    pub(crate) async fn instance_count(&self) -> usize {
        self.instances.lock().await.len()
    }

    /// Await every running instance. Used on shutdown and by tests.
    pub async fn join_all(&self) {
        let handles: Vec<InstanceHandle> = {
            let mut instances = self.instances.lock().await;
            instances.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            // the signal sender is dropped with the handle map entry, so
            // idle instances wind down instead of waiting forever
            drop(handle.signals);
            if let Err(e) = handle.task.await {
                if !e.is_cancelled() {
                    error!(instance = %handle.id, error = %e, "Instance task panicked");
                }
            }
        }
    }

    fn spawn_instance(ctx: Arc<WorkflowCtx>, seed: FileDescriptor) -> InstanceHandle {
        let (signals, rx) = mpsc::channel(SIGNAL_BUFFER);
        let cancel = CancellationToken::new();
        let id = Uuid::new_v4();

        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let batch_key = seed.batch_prefix.clone();
            if let Err(e) = run_instance(ctx, id, seed, rx, task_cancel).await {
                error!(
                    instance = %id,
                    batch_key = %batch_key,
                    error = %e,
                    "Instance failed; batch left for operator attention"
                );
            }
        });

        InstanceHandle {
            id,
            signals,
            cancel,
            task,
        }
    }
}

/// One tracker instance: accumulate signals, claim validation on
/// completeness, validate, relocate, finish.
async fn run_instance(
    ctx: Arc<WorkflowCtx>,
    id: Uuid,
    seed: FileDescriptor,
    mut signals: mpsc::Receiver<FileDescriptor>,
    cancel: CancellationToken,
) -> Result<()> {
    let batch_key = seed.batch_prefix.clone();
    let expected = ctx.resolver.resolve(&seed.customer_name);
    let mut tracker = Tracker::new(batch_key.clone(), expected);

    // Replay the journal before accepting anything new: after a restart the
    // instance reconstructs exactly the received set it had, so no signal is
    // lost and no decision is repeated.
    for file_type in ctx.state_store.received_types(&batch_key).await? {
        tracker.observe_file(&file_type);
    }
    if !tracker.received().is_empty() {
        info!(
            instance = %id,
            batch_key = %batch_key,
            received = ?tracker.received(),
            "Rehydrated received set from journal"
        );
    }

    let mut next = Some(seed.clone());

    loop {
        if let Some(descriptor) = next.take() {
            ctx.state_store
                .record_file(&batch_key, &descriptor.file_type, &descriptor.filename)
                .await?;

            match tracker.observe_file(&descriptor.file_type) {
                Advance::BeginValidation => {
                    info!(instance = %id, batch_key = %batch_key, "Got all the files! Moving on...");
                    finish_batch(&ctx, id, &mut tracker, &seed).await?;
                    return Ok(());
                }
                Advance::Wait => {
                    info!(
                        instance = %id,
                        batch_key = %batch_key,
                        customer = %descriptor.customer_name,
                        missing = ?tracker.missing(),
                        "Still waiting for more files..."
                    );
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                info!(instance = %id, batch_key = %batch_key, "Instance terminated while accumulating");
                return Ok(());
            }
            signal = signals.recv() => match signal {
                Some(descriptor) => {
                    debug!(instance = %id, filename = %descriptor.filename, "Got new file via signal");
                    next = Some(descriptor);
                }
                None => {
                    debug!(instance = %id, batch_key = %batch_key, "Signal channel closed, instance winding down");
                    return Ok(());
                }
            },
        }
    }
}

/// Claim the batch, validate every expected file found at its prefix, and
/// relocate everything found there to the terminal partition.
async fn finish_batch(
    ctx: &WorkflowCtx,
    id: Uuid,
    tracker: &mut Tracker,
    seed: &FileDescriptor,
) -> Result<()> {
    let batch_key = tracker.batch_key().to_string();

    if !ctx.state_store.try_begin_validation(&batch_key).await? {
        info!(
            instance = %id,
            batch_key = %batch_key,
            "Validation already claimed elsewhere, skipping"
        );
        return Ok(());
    }
    tracker.begin_validation();

    // Re-list the physical prefix: extra, non-expected files may be present
    // and relocation covers the entire set found there.
    let prefix = format!("{}/{}", INBOUND_FOLDER, seed.batch_prefix);
    let expected = ctx.resolver.resolve(&seed.customer_name);
    let (blobs, errors) = ctx
        .validator
        .validate_file_set(&seed.container, &prefix, &expected)
        .await?;

    let outcome = if errors.is_empty() {
        Outcome::Valid
    } else {
        for error in &errors {
            warn!(instance = %id, batch_key = %batch_key, "{error}");
        }
        Outcome::Invalid
    };

    ctx.relocator
        .relocate(&blobs, outcome.destination_folder())
        .await?;
    ctx.state_store.mark_done(&batch_key).await?;
    tracker.complete(outcome);

    metrics::counter!("gate.batches.completed").increment(1);
    match outcome {
        Outcome::Valid => {
            metrics::counter!("gate.batches.valid").increment(1);
            info!(
                instance = %id,
                batch_key = %batch_key,
                "Set successfully validated and queued for further processing"
            );
        }
        Outcome::Invalid => {
            metrics::counter!("gate.batches.invalid").increment(1);
            warn!(
                instance = %id,
                batch_key = %batch_key,
                error_count = errors.len(),
                "Errors found in batch, files routed to invalid set"
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch_store::memory::InMemoryBatchStore;
    use crate::batch_store::BatchState;
    use crate::blob_store::{BlobRef, CopyStatus, MockBlobStore};
    use crate::expected::StaticResolver;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    const TYPES: [&str; 3] = ["type1", "type2", "type3"];

    fn descriptor(file_type: &str) -> FileDescriptor {
        FileDescriptor {
            container: "acme".to_string(),
            customer_name: "acme".to_string(),
            batch_prefix: "acme-0115".to_string(),
            filename: format!("acme-0115_{file_type}.csv"),
            file_type: file_type.to_string(),
        }
    }

    fn batch_blobs() -> Vec<BlobRef> {
        TYPES
            .iter()
            .map(|t| BlobRef::new("acme", format!("inbound/acme-0115_{t}.csv")))
            .collect()
    }

    /// type1: 4 quoted columns, valid. type2: one short row when `broken`.
    /// type3: 14 quoted columns, valid.
    fn blob_content(key: &str, broken_type2: bool) -> Vec<u8> {
        if key.contains("type1") {
            b"\"a\",\"b\",\"c\",\"d\"\n\"e\",\"f\",\"g\",\"h\"\n".to_vec()
        } else if key.contains("type2") {
            if broken_type2 {
                b"\"a\",\"b\",\"c\",\"d\"\n\"a\",\"b\",\"c\"\n".to_vec()
            } else {
                b"\"a\",\"b\",\"c\",\"d\"\n".to_vec()
            }
        } else {
            let row: Vec<String> = (0..14).map(|i| format!("\"{i}\"")).collect();
            format!("{}\n", row.join(",")).into_bytes()
        }
    }

    fn mock_store(broken_type2: bool, moved_to: Arc<StdMutex<Vec<String>>>) -> MockBlobStore {
        let mut store = MockBlobStore::new();
        store
            .expect_list()
            .withf(|container, prefix| container == "acme" && prefix == "inbound/acme-0115")
            .returning(|_, _| Ok(batch_blobs()));
        store.expect_open().returning(move |blob| {
            Ok(Box::new(std::io::Cursor::new(blob_content(
                &blob.key,
                broken_type2,
            ))))
        });
        store.expect_begin_copy().returning(move |_, dst| {
            moved_to.lock().unwrap().push(dst.key.clone());
            Ok(())
        });
        store
            .expect_copy_status()
            .returning(|_| Ok(CopyStatus::Success));
        store.expect_delete().returning(|_| Ok(()));
        store
    }

    fn make_dispatcher(
        state: Arc<InMemoryBatchStore>,
        blobs: MockBlobStore,
    ) -> Dispatcher {
        let config = BatchConfig {
            lease_enabled: false,
            ..BatchConfig::default()
        };
        Dispatcher::new(
            state,
            Arc::new(blobs),
            Arc::new(StaticResolver::new(TYPES)),
            &config,
        )
    }

    #[tokio::test]
    async fn test_invalid_batch_routes_everything_to_invalid_set() {
        let state = Arc::new(InMemoryBatchStore::new());
        let moved_to = Arc::new(StdMutex::new(Vec::new()));
        let dispatcher = make_dispatcher(state.clone(), mock_store(true, moved_to.clone()));

        for t in TYPES {
            dispatcher.start_or_signal(descriptor(t)).await.unwrap();
        }
        dispatcher.join_all().await;

        let moved = moved_to.lock().unwrap();
        assert_eq!(moved.len(), 3);
        assert!(moved.iter().all(|key| key.starts_with("invalid-set/")));

        let record = state.get("acme-0115").await.unwrap().unwrap();
        assert_eq!(record.state, BatchState::Done);
    }

    #[tokio::test]
    async fn test_valid_batch_routes_everything_to_valid_set() {
        let state = Arc::new(InMemoryBatchStore::new());
        let moved_to = Arc::new(StdMutex::new(Vec::new()));
        let dispatcher = make_dispatcher(state.clone(), mock_store(false, moved_to.clone()));

        // arrival order differs from the expected order on purpose
        for t in ["type3", "type1", "type2"] {
            dispatcher.start_or_signal(descriptor(t)).await.unwrap();
        }
        dispatcher.join_all().await;

        let moved = moved_to.lock().unwrap();
        assert_eq!(moved.len(), 3);
        assert!(moved.iter().all(|key| key.starts_with("valid-set/")));
    }

    #[tokio::test]
    async fn test_duplicate_signals_do_not_trigger_early_validation() {
        let state = Arc::new(InMemoryBatchStore::new());
        let moved_to = Arc::new(StdMutex::new(Vec::new()));
        let dispatcher = make_dispatcher(state.clone(), mock_store(false, moved_to.clone()));

        for t in ["type1", "type1", "type2", "type2", "type1", "type3"] {
            dispatcher.start_or_signal(descriptor(t)).await.unwrap();
        }
        dispatcher.join_all().await;

        let record = state.get("acme-0115").await.unwrap().unwrap();
        assert_eq!(record.state, BatchState::Done);
        assert_eq!(moved_to.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_racing_dispatchers_validate_once() {
        let state = Arc::new(InMemoryBatchStore::new());
        let validations = Arc::new(AtomicUsize::new(0));

        let build = |validations: Arc<AtomicUsize>| {
            let mut store = MockBlobStore::new();
            store.expect_list().returning(move |_, _| {
                validations.fetch_add(1, Ordering::SeqCst);
                Ok(batch_blobs())
            });
            store.expect_open().returning(|blob| {
                Ok(Box::new(std::io::Cursor::new(blob_content(&blob.key, false))))
            });
            store.expect_begin_copy().returning(|_, _| Ok(()));
            store
                .expect_copy_status()
                .returning(|_| Ok(CopyStatus::Success));
            store.expect_delete().returning(|_| Ok(()));
            store
        };

        let first = make_dispatcher(state.clone(), build(validations.clone()));
        let second = make_dispatcher(state.clone(), build(validations.clone()));

        // both dispatchers see the full set before either reaches terminal
        for t in TYPES {
            first.start_or_signal(descriptor(t)).await.unwrap();
            second.start_or_signal(descriptor(t)).await.unwrap();
        }
        first.join_all().await;
        second.join_all().await;

        assert_eq!(validations.load(Ordering::SeqCst), 1);
        let record = state.get("acme-0115").await.unwrap().unwrap();
        assert_eq!(record.state, BatchState::Done);
    }

    #[tokio::test]
    async fn test_late_notification_after_done_is_swallowed() {
        let state = Arc::new(InMemoryBatchStore::new());
        let moved_to = Arc::new(StdMutex::new(Vec::new()));
        let dispatcher = make_dispatcher(state.clone(), mock_store(false, moved_to.clone()));

        for t in TYPES {
            dispatcher.start_or_signal(descriptor(t)).await.unwrap();
        }
        dispatcher.join_all().await;
        assert_eq!(moved_to.lock().unwrap().len(), 3);

        // batch is done; a duplicate upload notification starts nothing
        dispatcher.start_or_signal(descriptor("type1")).await.unwrap();
        dispatcher.join_all().await;
        assert_eq!(moved_to.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_journal_replay_resumes_after_restart() {
        let state = Arc::new(InMemoryBatchStore::new());

        // a previous process already journaled two of the three types
        state.create_waiting(&descriptor("type1")).await.unwrap();
        state
            .record_file("acme-0115", "type1", "acme-0115_type1.csv")
            .await
            .unwrap();
        state
            .record_file("acme-0115", "type2", "acme-0115_type2.csv")
            .await
            .unwrap();

        let moved_to = Arc::new(StdMutex::new(Vec::new()));
        let dispatcher = make_dispatcher(state.clone(), mock_store(false, moved_to.clone()));

        // the missing type alone completes the batch after rehydration
        dispatcher.start_or_signal(descriptor("type3")).await.unwrap();
        dispatcher.join_all().await;

        let record = state.get("acme-0115").await.unwrap().unwrap();
        assert_eq!(record.state, BatchState::Done);
        assert_eq!(moved_to.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_unrecognized_expected_type_leaves_batch_unterminated() {
        let state = Arc::new(InMemoryBatchStore::new());
        let mut store = MockBlobStore::new();
        store.expect_list().returning(|_, _| {
            Ok(vec![BlobRef::new("acme", "inbound/acme-0115_type99.csv")])
        });
        store.expect_begin_copy().times(0);
        store.expect_delete().times(0);

        let config = BatchConfig {
            lease_enabled: false,
            ..BatchConfig::default()
        };
        let dispatcher = Dispatcher::new(
            state.clone(),
            Arc::new(store),
            Arc::new(StaticResolver::new(["type99"])),
            &config,
        );

        dispatcher
            .start_or_signal(FileDescriptor {
                container: "acme".to_string(),
                customer_name: "acme".to_string(),
                batch_prefix: "acme-0115".to_string(),
                filename: "acme-0115_type99.csv".to_string(),
                file_type: "type99".to_string(),
            })
            .await
            .unwrap();
        dispatcher.join_all().await;

        // claimed but never finished: left in progress for the operator
        let record = state.get("acme-0115").await.unwrap().unwrap();
        assert_eq!(record.state, BatchState::InProgress);
    }

    #[tokio::test]
    async fn test_finished_instance_is_pruned_from_the_map() {
        let state = Arc::new(InMemoryBatchStore::new());
        let moved_to = Arc::new(StdMutex::new(Vec::new()));
        let dispatcher = make_dispatcher(state.clone(), mock_store(false, moved_to.clone()));

        for t in TYPES {
            dispatcher.start_or_signal(descriptor(t)).await.unwrap();
        }
        assert_eq!(dispatcher.instance_count().await, 1);

        // once the batch is done and its task has exited, the next
        // notification sweeps the dead handle out of the map
        let mut pruned = false;
        for _ in 0..200 {
            dispatcher.start_or_signal(descriptor("type1")).await.unwrap();
            if dispatcher.instance_count().await == 0 {
                pruned = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(pruned, "finished instance handle was never swept");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bounce_during_validation_lets_the_claimed_pass_finish() {
        let state = Arc::new(InMemoryBatchStore::new());
        let moved_to = Arc::new(StdMutex::new(Vec::new()));
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        let mut store = MockBlobStore::new();
        store.expect_list().returning(move |_, _| {
            // hold the validation pass open until the test says go
            release_rx.recv().ok();
            Ok(batch_blobs())
        });
        store.expect_open().returning(|blob| {
            Ok(Box::new(std::io::Cursor::new(blob_content(&blob.key, false))))
        });
        let moved = moved_to.clone();
        store.expect_begin_copy().returning(move |_, dst| {
            moved.lock().unwrap().push(dst.key.clone());
            Ok(())
        });
        store
            .expect_copy_status()
            .returning(|_| Ok(CopyStatus::Success));
        store.expect_delete().returning(|_| Ok(()));

        let dispatcher = make_dispatcher(state.clone(), store);
        for t in TYPES {
            dispatcher.start_or_signal(descriptor(t)).await.unwrap();
        }

        // wait until the instance has won the claim and is inside its
        // validation pass
        let mut claimed = false;
        for _ in 0..200 {
            if let Some(record) = state.get("acme-0115").await.unwrap() {
                if record.state == BatchState::InProgress {
                    claimed = true;
                    break;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(claimed);

        dispatcher.bounce("acme-0115").await;
        release_tx.send(()).unwrap();

        // the claimed pass runs to completion despite the bounce
        let mut done = false;
        for _ in 0..200 {
            if state.get("acme-0115").await.unwrap().unwrap().state == BatchState::Done {
                done = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(done, "bounced instance abandoned its claimed validation pass");
        assert_eq!(moved_to.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_bounced_instance_is_replaced_on_next_signal() {
        let state = Arc::new(InMemoryBatchStore::new());
        let moved_to = Arc::new(StdMutex::new(Vec::new()));
        let dispatcher = make_dispatcher(state.clone(), mock_store(false, moved_to.clone()));

        dispatcher.start_or_signal(descriptor("type1")).await.unwrap();
        dispatcher.bounce("acme-0115").await;

        // replacement rehydrates type1 from the journal and finishes
        dispatcher.start_or_signal(descriptor("type2")).await.unwrap();
        dispatcher.start_or_signal(descriptor("type3")).await.unwrap();
        dispatcher.join_all().await;

        let record = state.get("acme-0115").await.unwrap().unwrap();
        assert_eq!(record.state, BatchState::Done);
    }
}
