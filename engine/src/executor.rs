//! Copy, verify and retry pipeline.
//!
//! For each plan entry, in order:
//! 1. the destination parent directory is created if absent;
//! 2. the source is streamed into `.<name>.offload-partial` next to the final
//!    path, hashing the source bytes as they pass;
//! 3. the temporary file is re-read and its checksum compared with the source
//!    checksum; a mismatch or a stalled chunk deletes the temporary file and
//!    retries with backoff, up to `max_retries` extra attempts;
//! 4. the verified temporary file is renamed to the final path.
//!
//! Chunk boundaries, and waits on a silent source, are the suspension points:
//! progress is reported and cancellation and volume loss are observed there. Per-item errors end up on
//! the item's record; losing the volume aborts the remaining plan.

use chrono::Utc;
use crossbeam_channel::{unbounded, Receiver};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::checksums::{compute_file_checksum_with, StreamHasher};
use crate::config::TransferConfig;
use crate::error::EngineError;
use crate::fs_ops::{self, CopyParams};
use crate::model::{
    PlanAction, PlanEntry, RecordStatus, TransferPlan, TransferRecord, TransferReport,
};
use crate::progress::{ChannelProgress, ProgressCallback, ProgressEvent};
use crate::volume::VolumeHandle;

/// Granularity of cancellable backoff sleeps.
const BACKOFF_SLICE: Duration = Duration::from_millis(50);

/// Cancellation flag shared between the caller and a running session.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Marks the executor busy until dropped.
struct RunGuard {
    running: Arc<AtomicBool>,
}

impl RunGuard {
    fn acquire(running: &Arc<AtomicBool>) -> Result<Self, EngineError> {
        running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| EngineError::SessionBusy)?;
        Ok(RunGuard {
            running: Arc::clone(running),
        })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// A session running on a worker thread.
pub struct TransferRun {
    events: Receiver<ProgressEvent>,
    cancel: CancelToken,
    handle: JoinHandle<TransferReport>,
}

impl TransferRun {
    /// Progress events, ending with [`ProgressEvent::Finished`].
    pub fn events(&self) -> &Receiver<ProgressEvent> {
        &self.events
    }

    /// Request cancellation; observed at the next chunk boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Block until the session completes.
    pub fn wait(self) -> Result<TransferReport, EngineError> {
        self.handle
            .join()
            .map_err(|_| EngineError::Internal("transfer worker panicked".to_string()))
    }
}

/// Called with the temporary file and attempt number after each copy,
/// before verification.
pub type AfterCopyHook = fn(&Path, u32) -> std::io::Result<()>;

/// Runs transfer plans. At most one plan runs per executor at a time.
#[derive(Clone)]
pub struct TransferExecutor {
    config: TransferConfig,
    running: Arc<AtomicBool>,
    after_copy: Option<AfterCopyHook>,
}

impl fmt::Debug for TransferExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferExecutor")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("after_copy", &self.after_copy.is_some())
            .finish()
    }
}

impl TransferExecutor {
    pub fn new(config: TransferConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(TransferExecutor {
            config,
            running: Arc::new(AtomicBool::new(false)),
            after_copy: None,
        })
    }

    /// Install a hook run on every copied temporary file before it is verified.
    pub fn with_after_copy(mut self, hook: AfterCopyHook) -> Self {
        self.after_copy = Some(hook);
        self
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start `plan` on a worker thread.
    ///
    /// Fails with `SessionBusy` if this executor or the volume is already in use.
    pub fn execute(&self, plan: TransferPlan, volume: VolumeHandle) -> Result<TransferRun, EngineError> {
        plan.validate()?;
        let guard = RunGuard::acquire(&self.running)?;
        let lease = volume.hold()?;

        let (tx, rx) = unbounded();
        let cancel = CancelToken::new();
        let executor = self.clone();
        let worker_cancel = cancel.clone();

        let handle = std::thread::spawn(move || {
            let _guard = guard;
            let progress = ChannelProgress::new(tx);
            executor.run_plan(&plan, lease.handle(), &worker_cancel, &progress)
        });

        Ok(TransferRun {
            events: rx,
            cancel,
            handle,
        })
    }

    /// Run `plan` on the calling thread.
    pub fn run(
        &self,
        plan: &TransferPlan,
        volume: &VolumeHandle,
        cancel: &CancelToken,
        progress: &dyn ProgressCallback,
    ) -> Result<TransferReport, EngineError> {
        plan.validate()?;
        let _guard = RunGuard::acquire(&self.running)?;
        let _lease = volume.hold()?;
        Ok(self.run_plan(plan, volume, cancel, progress))
    }

    #[instrument(skip_all, fields(items = plan.entries.len()))]
    fn run_plan(
        &self,
        plan: &TransferPlan,
        volume: &VolumeHandle,
        cancel: &CancelToken,
        progress: &dyn ProgressCallback,
    ) -> TransferReport {
        let mut report = TransferReport {
            records: plan.entries.iter().map(TransferRecord::pending).collect(),
            started_at: Some(Utc::now()),
            ..TransferReport::default()
        };
        info!(
            "Transferring {} items ({} bytes) to {}",
            plan.copy_count(),
            plan.total_bytes(),
            plan.destination_root.display()
        );
        progress.on_session_started(plan.entries.len(), plan.total_bytes());

        for (index, entry) in plan.entries.iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if let Err(e) = volume.ensure_available() {
                abort_session(&mut report, e);
                break;
            }

            let record = &mut report.records[index];
            if entry.action == PlanAction::SkipIdentical {
                debug!("Identical copy exists: {}", entry.destination_path.display());
                record.status = RecordStatus::Skipped;
                record.finished_at = Some(Utc::now());
                progress.on_record_updated(index, record);
                continue;
            }

            match self.transfer_item(index, entry, record, volume, cancel, progress) {
                Ok(()) => {}
                Err(EngineError::Cancelled) => {
                    record.status = RecordStatus::Skipped;
                    record.finished_at = Some(Utc::now());
                    progress.on_record_updated(index, record);
                    report.cancelled = true;
                    break;
                }
                Err(e @ EngineError::VolumeUnavailable { .. }) => {
                    record.status = RecordStatus::Failed;
                    record.note_error(&e);
                    record.finished_at = Some(Utc::now());
                    progress.on_record_updated(index, record);
                    abort_session(&mut report, e);
                    break;
                }
                Err(e) => {
                    warn!("Transfer of {} failed: {}", entry.source_path.display(), e);
                    record.status = RecordStatus::Failed;
                    record.note_error(&e);
                    record.finished_at = Some(Utc::now());
                    progress.on_record_updated(index, record);
                }
            }
        }

        // Items never reached
        let session_failed = report.session_error.is_some();
        for (index, record) in report.records.iter_mut().enumerate() {
            if record.status.is_terminal() {
                continue;
            }
            if session_failed {
                record.status = RecordStatus::Failed;
                record.error_kind = report.session_error_kind;
                record.error_message = report.session_error.clone();
            } else {
                record.status = RecordStatus::Skipped;
            }
            record.finished_at = Some(Utc::now());
            progress.on_record_updated(index, record);
        }

        report.finished_at = Some(Utc::now());
        info!(
            "Transfer finished: {} succeeded, {} skipped, {} failed",
            report.count(RecordStatus::Succeeded),
            report.count(RecordStatus::Skipped),
            report.count(RecordStatus::Failed)
        );
        progress.on_session_completed(&report);
        report
    }

    fn transfer_item(
        &self,
        index: usize,
        entry: &PlanEntry,
        record: &mut TransferRecord,
        volume: &VolumeHandle,
        cancel: &CancelToken,
        progress: &dyn ProgressCallback,
    ) -> Result<(), EngineError> {
        record.started_at = Some(Utc::now());
        fs_ops::ensure_parent_dir_exists(&entry.destination_path)?;
        let temporary = fs_ops::temporary_path_for(&entry.destination_path);
        let source_modified = fs::metadata(&entry.source_path)
            .and_then(|m| m.modified())
            .ok();

        loop {
            record.attempts += 1;
            record.status = RecordStatus::Copying;
            record.bytes_copied = 0;
            progress.on_record_updated(index, record);

            let result = self.attempt(index, entry, &temporary, record, volume, cancel, progress);
            let Err(e) = result else { break };

            if let Err(rm) = fs_ops::remove_if_exists(&temporary) {
                warn!("Could not remove {}: {}", temporary.display(), rm);
            }
            let e = attribute_volume_loss(e, volume);
            if !e.is_transient() || record.retries >= self.config.max_retries {
                return Err(e);
            }

            record.retries += 1;
            record.note_error(&e);
            warn!(
                "Attempt {} for {} failed ({}), retrying",
                record.attempts,
                entry.source_path.display(),
                e
            );
            progress.on_retry_scheduled(index, record, record.attempts, e.kind());
            sleep_cancellable(self.config.backoff(record.retries), cancel)?;
        }

        if let Err(e) = fs_ops::promote_temporary(&temporary, &entry.destination_path) {
            if let Err(rm) = fs_ops::remove_if_exists(&temporary) {
                warn!("Could not remove {}: {}", temporary.display(), rm);
            }
            return Err(e);
        }
        if self.config.preserve_modified_time {
            if let Some(modified) = source_modified {
                fs_ops::preserve_modified_time(&entry.destination_path, modified);
            }
        }

        record.status = RecordStatus::Succeeded;
        record.error_kind = None;
        record.error_code = None;
        record.error_message = None;
        record.finished_at = Some(Utc::now());
        debug!(
            "Copied {} -> {}",
            entry.source_path.display(),
            entry.destination_path.display()
        );
        progress.on_record_updated(index, record);
        Ok(())
    }

    /// One copy and verification attempt into `temporary`.
    #[allow(clippy::too_many_arguments)]
    fn attempt(
        &self,
        index: usize,
        entry: &PlanEntry,
        temporary: &Path,
        record: &mut TransferRecord,
        volume: &VolumeHandle,
        cancel: &CancelToken,
        progress: &dyn ProgressCallback,
    ) -> Result<(), EngineError> {
        let algorithm = self.config.checksum;
        let params = CopyParams {
            source: &entry.source_path,
            temporary,
            chunk_size: self.config.chunk_size,
            stall_timeout: self.config.stall_timeout(),
        };

        let mut hasher = StreamHasher::new(algorithm);
        let mut copied = 0u64;
        fs_ops::copy_to_temporary(
            &params,
            &mut hasher,
            |delta| {
                copied += delta;
                progress.on_bytes_copied(index, entry.item_id, delta);
                checkpoint(cancel, volume)
            },
            || checkpoint(cancel, volume),
        )?;
        record.bytes_copied = copied;
        if copied != entry.size {
            warn!(
                "{} changed size since scan ({} -> {} bytes)",
                entry.source_path.display(),
                entry.size,
                copied
            );
        }

        let source_checksum = hasher.finalize();
        record.source_checksum = Some(source_checksum.clone());
        record.status = RecordStatus::Verifying;
        progress.on_record_updated(index, record);

        if let Some(hook) = self.after_copy {
            hook(temporary, record.attempts).map_err(|e| EngineError::WriteFailure {
                path: temporary.to_path_buf(),
                source: e,
            })?;
        }

        let started = Instant::now();
        let dest_checksum =
            compute_file_checksum_with(temporary, algorithm, self.config.chunk_size, |_| {
                checkpoint(cancel, volume)
            })?;
        debug!("Verified {} in {:?}", temporary.display(), started.elapsed());
        record.dest_checksum = Some(dest_checksum.clone());

        if !dest_checksum.matches(&source_checksum) {
            record.verified = Some(false);
            return Err(EngineError::VerificationMismatch {
                path: entry.destination_path.clone(),
                expected: source_checksum.hex().to_string(),
                actual: dest_checksum.hex().to_string(),
            });
        }
        record.verified = Some(true);
        Ok(())
    }
}

/// Cancellation and volume checks done at every chunk boundary.
fn checkpoint(cancel: &CancelToken, volume: &VolumeHandle) -> Result<(), EngineError> {
    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }
    if volume.is_detached() {
        return Err(EngineError::VolumeUnavailable {
            root: volume.root().to_path_buf(),
        });
    }
    Ok(())
}

/// A read failure while the volume is gone is a volume loss, not a bad file.
fn attribute_volume_loss(err: EngineError, volume: &VolumeHandle) -> EngineError {
    match err {
        EngineError::UnreadableSource { .. } | EngineError::Stalled { .. } => {
            match volume.ensure_available() {
                Err(lost) => lost,
                Ok(()) => err,
            }
        }
        other => other,
    }
}

fn sleep_cancellable(duration: Duration, cancel: &CancelToken) -> Result<(), EngineError> {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        std::thread::sleep(BACKOFF_SLICE.min(deadline - now));
    }
}

/// Record a session-level failure; remaining records are failed afterwards.
fn abort_session(report: &mut TransferReport, err: EngineError) {
    error!("Transfer session aborted: {}", err);
    report.session_error = Some(err.to_string());
    report.session_error_kind = Some(err.kind());
}
