//! Progress reporting.
//!
//! The executor reports through the [`ProgressCallback`] trait, which keeps the
//! engine independent of any UI technology. [`ChannelProgress`] forwards the
//! same notifications as [`ProgressEvent`] values over a channel, for callers
//! that consume progress on another thread.
//!
//! All methods are called synchronously from the executing thread, after every
//! copied chunk and after every record status transition.

use crossbeam_channel::Sender;

use crate::error::ErrorKind;
use crate::model::{ItemId, TransferRecord, TransferReport};

/// Receives progress updates from a transfer session.
pub trait ProgressCallback: Send {
    /// Called once before the first item is processed.
    fn on_session_started(&self, total_items: usize, total_bytes: u64);

    /// Called after every status transition of a record.
    fn on_record_updated(&self, index: usize, record: &TransferRecord);

    /// Called after each copied chunk with the chunk size.
    fn on_bytes_copied(&self, index: usize, item_id: ItemId, delta: u64);

    /// Called when a failed attempt is about to be retried.
    fn on_retry_scheduled(&self, index: usize, record: &TransferRecord, attempt: u32, kind: ErrorKind);

    /// Called once when every record is terminal.
    fn on_session_completed(&self, report: &TransferReport);
}

/// Callback that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_session_started(&self, _total_items: usize, _total_bytes: u64) {}
    fn on_record_updated(&self, _index: usize, _record: &TransferRecord) {}
    fn on_bytes_copied(&self, _index: usize, _item_id: ItemId, _delta: u64) {}
    fn on_retry_scheduled(&self, _index: usize, _record: &TransferRecord, _attempt: u32, _kind: ErrorKind) {}
    fn on_session_completed(&self, _report: &TransferReport) {}
}

/// A progress notification.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    SessionStarted { total_items: usize, total_bytes: u64 },
    /// Snapshot of a record after a status transition
    Record { index: usize, record: TransferRecord },
    BytesCopied { index: usize, item_id: ItemId, delta: u64 },
    /// Attempt `attempt` failed with `kind` and will be retried
    Retrying {
        index: usize,
        item_id: ItemId,
        attempt: u32,
        kind: ErrorKind,
    },
    Finished(TransferReport),
}

/// Forwards notifications to a channel. A closed receiver is ignored.
#[derive(Debug, Clone)]
pub struct ChannelProgress {
    sender: Sender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn new(sender: Sender<ProgressEvent>) -> Self {
        ChannelProgress { sender }
    }

    fn send(&self, event: ProgressEvent) {
        let _ = self.sender.send(event);
    }
}

impl ProgressCallback for ChannelProgress {
    fn on_session_started(&self, total_items: usize, total_bytes: u64) {
        self.send(ProgressEvent::SessionStarted {
            total_items,
            total_bytes,
        });
    }

    fn on_record_updated(&self, index: usize, record: &TransferRecord) {
        self.send(ProgressEvent::Record {
            index,
            record: record.clone(),
        });
    }

    fn on_bytes_copied(&self, index: usize, item_id: ItemId, delta: u64) {
        self.send(ProgressEvent::BytesCopied {
            index,
            item_id,
            delta,
        });
    }

    fn on_retry_scheduled(&self, index: usize, record: &TransferRecord, attempt: u32, kind: ErrorKind) {
        self.send(ProgressEvent::Retrying {
            index,
            item_id: record.item_id,
            attempt,
            kind,
        });
    }

    fn on_session_completed(&self, report: &TransferReport) {
        self.send(ProgressEvent::Finished(report.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PlanAction, PlanEntry};
    use crossbeam_channel::unbounded;
    use std::path::PathBuf;
    use uuid::Uuid;

    #[test]
    fn test_channel_progress_forwards_events() {
        let (tx, rx) = unbounded();
        let progress = ChannelProgress::new(tx);
        let record = TransferRecord::pending(&PlanEntry {
            item_id: ItemId(Uuid::from_u128(1)),
            source_path: PathBuf::from("/card/a.jpg"),
            destination_path: PathBuf::from("/dest/IMG0001.jpg"),
            size: 3,
            action: PlanAction::Copy,
        });

        progress.on_session_started(1, 3);
        progress.on_record_updated(0, &record);
        progress.on_bytes_copied(0, record.item_id, 3);
        progress.on_retry_scheduled(0, &record, 1, ErrorKind::VerificationMismatch);

        let events: Vec<ProgressEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 4);
        assert_eq!(
            events[0],
            ProgressEvent::SessionStarted {
                total_items: 1,
                total_bytes: 3
            }
        );
        assert!(matches!(&events[1], ProgressEvent::Record { index: 0, .. }));
        assert!(matches!(
            events[3],
            ProgressEvent::Retrying {
                attempt: 1,
                kind: ErrorKind::VerificationMismatch,
                ..
            }
        ));
    }

    #[test]
    fn test_closed_channel_is_ignored() {
        let (tx, rx) = unbounded();
        drop(rx);
        let progress = ChannelProgress::new(tx);
        progress.on_session_started(0, 0);
        progress.on_session_completed(&TransferReport::default());
    }
}
