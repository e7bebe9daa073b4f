//! Post-transfer deletion of source files.
//!
//! Only sources whose record is `succeeded` are ever deleted, and only with an
//! explicit [`CleanupConfirmation::Confirmed`] from the caller.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::{info, instrument, warn};

use crate::error::{EngineError, ErrorKind};
use crate::model::{ItemId, RecordStatus, TransferRecord, TransferReport};

/// The caller's answer to "delete the originals?".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanupConfirmation {
    Confirmed,
    Declined,
}

/// A source that could not be deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupFailure {
    pub item_id: ItemId,
    pub path: PathBuf,
    pub kind: ErrorKind,
    pub error_code: Option<i32>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupResult {
    /// Sources removed
    pub deleted: Vec<ItemId>,
    /// Records left alone (not succeeded, or cleanup declined)
    pub kept: usize,
    pub failures: Vec<CleanupFailure>,
}

impl CleanupResult {
    pub fn deleted_count(&self) -> usize {
        self.deleted.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failures.len()
    }
}

/// Delete the sources of succeeded records.
///
/// Before each deletion the destination must still exist with the size that
/// was copied; otherwise the source is kept and the item reported as a
/// deletion failure. Failures never stop the remaining deletions.
#[instrument(skip(report), fields(records = report.records.len()))]
pub fn cleanup(
    report: &TransferReport,
    confirmation: CleanupConfirmation,
) -> Result<CleanupResult, EngineError> {
    let pending = report
        .records
        .iter()
        .filter(|r| !r.status.is_terminal())
        .count();
    if pending > 0 {
        return Err(EngineError::SessionIncomplete { pending });
    }

    let mut result = CleanupResult::default();
    if confirmation == CleanupConfirmation::Declined {
        info!("Cleanup declined, keeping all {} sources", report.records.len());
        result.kept = report.records.len();
        return Ok(result);
    }

    for record in &report.records {
        if record.status != RecordStatus::Succeeded {
            result.kept += 1;
            continue;
        }
        match delete_source(record) {
            Ok(()) => result.deleted.push(record.item_id),
            Err(e) => {
                warn!("Keeping {}: {}", record.source_path.display(), e);
                result.failures.push(CleanupFailure {
                    item_id: record.item_id,
                    path: record.source_path.clone(),
                    kind: e.kind(),
                    error_code: e.raw_os_error(),
                    message: e.detail(),
                });
            }
        }
    }

    info!(
        "Cleanup deleted {} sources, kept {}, {} failures",
        result.deleted_count(),
        result.kept,
        result.failed_count()
    );
    Ok(result)
}

fn delete_source(record: &TransferRecord) -> Result<(), EngineError> {
    let copy_intact = fs::metadata(&record.destination_path)
        .map(|m| m.is_file() && m.len() == record.bytes_copied)
        .unwrap_or(false);
    if !copy_intact {
        return Err(EngineError::DeletionFailure {
            path: record.source_path.clone(),
            source: io::Error::new(
                io::ErrorKind::NotFound,
                format!(
                    "copy at {} is missing or changed",
                    record.destination_path.display()
                ),
            ),
        });
    }

    fs::remove_file(&record.source_path).map_err(|e| EngineError::DeletionFailure {
        path: record.source_path.clone(),
        source: e,
    })
}
