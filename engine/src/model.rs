//! Core data model for transfer sessions.
//!
//! This module defines the data structures shared by every stage:
//! - Volume: the removable volume media is read from
//! - MediaItem / SelectionSet: catalog output and the caller's choice
//! - TransferPlan / PlanEntry: planner output
//! - TransferRecord / TransferReport: executor output

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

use crate::checksums::ChecksumValue;
use crate::error::{EngineError, ErrorKind};

/// Stable fingerprint of a volume across insertions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeId(pub String);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A mounted storage volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Fingerprint derived from mount point, label, capacity and file system
    pub id: VolumeId,

    /// Volume label (may be empty)
    pub label: String,

    /// Mount point
    pub root: PathBuf,

    /// File system name reported by the OS (e.g. "exfat", "vfat")
    pub file_system: String,

    /// Total capacity in bytes (0 if unknown)
    pub total_bytes: u64,

    /// Free space in bytes (0 if unknown)
    pub available_bytes: u64,

    /// True if the OS reports the device as removable
    pub removable: bool,
}

impl Volume {
    /// Build a volume descriptor and derive its fingerprint.
    pub fn new(
        label: impl Into<String>,
        root: impl Into<PathBuf>,
        file_system: impl Into<String>,
        total_bytes: u64,
        available_bytes: u64,
        removable: bool,
    ) -> Self {
        let label = label.into();
        let root = root.into();
        let file_system = file_system.into();

        let mut hasher = blake3::Hasher::new();
        hasher.update(root.to_string_lossy().as_bytes());
        hasher.update(label.as_bytes());
        hasher.update(&total_bytes.to_be_bytes());
        hasher.update(file_system.as_bytes());
        let hex = hasher.finalize().to_hex();
        let id = VolumeId(hex.as_str()[..16].to_string());

        Volume {
            id,
            label,
            root,
            file_system,
            total_bytes,
            available_bytes,
            removable,
        }
    }

    /// Treat an arbitrary directory as a removable volume.
    ///
    /// Used for explicit `--src` paths and for synthetic volumes in tests.
    pub fn from_directory(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let label = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Volume::new(label, root, "", 0, 0, true)
    }
}

/// Identifier of a catalogued item.
///
/// Derived from the volume fingerprint and the item's relative path, so the
/// same file keeps the same identifier across rescans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(pub Uuid);

impl ItemId {
    pub fn derive(volume: &VolumeId, relative_path: &Path) -> Self {
        let key = format!("{}/{}", volume.0, relative_path.to_string_lossy());
        ItemId(Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()))
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Broad media classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Photo,
    Video,
    Other,
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaType::Photo => write!(f, "photo"),
            MediaType::Video => write!(f, "video"),
            MediaType::Other => write!(f, "other"),
        }
    }
}

impl FromStr for MediaType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "photo" | "image" => Ok(MediaType::Photo),
            "video" => Ok(MediaType::Video),
            "other" => Ok(MediaType::Other),
            other => Err(EngineError::Config(format!("unknown media type '{}'", other))),
        }
    }
}

/// Where an item's capture timestamp came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureSource {
    /// Read from embedded metadata (EXIF)
    Embedded,
    /// Fell back to the filesystem modification time
    Modified,
}

/// One media file discovered on a volume. Immutable once catalogued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: ItemId,

    /// Path relative to the volume root
    pub relative_path: PathBuf,

    /// Absolute source path
    pub source_path: PathBuf,

    /// File size in bytes
    pub size: u64,

    /// Filesystem modification time (local wall clock)
    pub modified: NaiveDateTime,

    /// Best-effort capture time (local wall clock)
    pub captured: NaiveDateTime,

    pub capture_source: CaptureSource,

    pub media_type: MediaType,

    /// Metadata fields available to organization templates
    pub fields: BTreeMap<String, String>,
}

impl MediaItem {
    /// Original file name.
    pub fn file_name(&self) -> String {
        self.relative_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Original extension without the dot, as written on the volume.
    pub fn extension(&self) -> Option<String> {
        self.relative_path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
    }

    /// Look up a metadata field by name.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Ordered selection of catalog items, each with an inclusion flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionSet {
    entries: Vec<(ItemId, bool)>,
}

impl SelectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select every given item, in order.
    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a MediaItem>) -> Self {
        SelectionSet {
            entries: items.into_iter().map(|i| (i.id, true)).collect(),
        }
    }

    /// Include an item, appending it if unknown.
    pub fn include(&mut self, id: ItemId) {
        self.set(id, true);
    }

    /// Exclude an item, keeping its position.
    pub fn exclude(&mut self, id: ItemId) {
        self.set(id, false);
    }

    /// Flip the inclusion flag of an item. Unknown items become included.
    pub fn toggle(&mut self, id: ItemId) {
        let current = self.is_selected(id);
        self.set(id, !current);
    }

    pub fn is_selected(&self, id: ItemId) -> bool {
        self.entries
            .iter()
            .any(|(entry, included)| *entry == id && *included)
    }

    /// Included identifiers in selection order.
    pub fn selected(&self) -> impl Iterator<Item = ItemId> + '_ {
        self.entries
            .iter()
            .filter(|(_, included)| *included)
            .map(|(id, _)| *id)
    }

    pub fn len(&self) -> usize {
        self.selected().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn set(&mut self, id: ItemId, included: bool) {
        match self.entries.iter_mut().find(|(entry, _)| *entry == id) {
            Some(entry) => entry.1 = included,
            None => self.entries.push((id, included)),
        }
    }
}

/// What the executor should do with a plan entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlanAction {
    /// Copy and verify
    Copy,
    /// A byte-identical file already sits at the destination
    SkipIdentical,
}

/// One planned source -> destination mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub item_id: ItemId,
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    pub size: u64,
    pub action: PlanAction,
}

/// Collision-free mapping from items to destinations, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferPlan {
    pub destination_root: PathBuf,
    pub entries: Vec<PlanEntry>,
}

impl TransferPlan {
    /// Bytes that will actually be copied.
    pub fn total_bytes(&self) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.action == PlanAction::Copy)
            .map(|e| e.size)
            .sum()
    }

    pub fn copy_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.action == PlanAction::Copy)
            .count()
    }

    pub fn skip_count(&self) -> usize {
        self.entries.len() - self.copy_count()
    }

    pub fn destination_of(&self, id: ItemId) -> Option<&Path> {
        self.entries
            .iter()
            .find(|e| e.item_id == id)
            .map(|e| e.destination_path.as_path())
    }

    /// Check that no two entries share a destination (case-insensitive).
    pub fn validate(&self) -> Result<(), EngineError> {
        let mut seen = std::collections::HashSet::with_capacity(self.entries.len());
        for entry in &self.entries {
            let key = entry.destination_path.to_string_lossy().to_lowercase();
            if !seen.insert(key) {
                return Err(EngineError::PlanCollisionUnresolved {
                    path: entry.destination_path.clone(),
                });
            }
        }
        Ok(())
    }
}

/// The state of an individual item within a transfer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// Not yet processed
    Pending,
    /// Bytes are being streamed to the temporary file
    Copying,
    /// Checksums are being compared
    Verifying,
    /// Verified and moved to its final path
    Succeeded,
    /// Error occurred; nothing left at the final path
    Failed,
    /// Not copied (identical file present, or cancelled)
    Skipped,
}

impl RecordStatus {
    /// Returns true if this state is terminal (no further changes expected).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecordStatus::Succeeded | RecordStatus::Failed | RecordStatus::Skipped
        )
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Copying => "copying",
            RecordStatus::Verifying => "verifying",
            RecordStatus::Succeeded => "succeeded",
            RecordStatus::Failed => "failed",
            RecordStatus::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

/// Per-item outcome of a transfer session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub item_id: ItemId,
    pub source_path: PathBuf,
    pub destination_path: PathBuf,

    /// Source size in bytes
    pub size: u64,

    pub status: RecordStatus,

    /// Bytes written by the latest attempt
    pub bytes_copied: u64,

    /// Copy attempts made (0 if never attempted)
    pub attempts: u32,

    /// Attempts that were retried after a transient failure
    pub retries: u32,

    /// `Some(true)` once checksums matched, `Some(false)` after a mismatch
    pub verified: Option<bool>,

    pub source_checksum: Option<ChecksumValue>,
    pub dest_checksum: Option<ChecksumValue>,

    pub error_kind: Option<ErrorKind>,
    /// OS error code, when the failure came from the OS
    pub error_code: Option<i32>,
    /// Human-readable error message
    pub error_message: Option<String>,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TransferRecord {
    /// Fresh pending record for a plan entry.
    pub fn pending(entry: &PlanEntry) -> Self {
        TransferRecord {
            item_id: entry.item_id,
            source_path: entry.source_path.clone(),
            destination_path: entry.destination_path.clone(),
            size: entry.size,
            status: RecordStatus::Pending,
            bytes_copied: 0,
            attempts: 0,
            retries: 0,
            verified: None,
            source_checksum: None,
            dest_checksum: None,
            error_kind: None,
            error_code: None,
            error_message: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Attach an error to this record without changing its status.
    pub fn note_error(&mut self, err: &EngineError) {
        self.error_kind = Some(err.kind());
        self.error_code = err.raw_os_error();
        self.error_message = Some(err.detail());
    }
}

/// Aggregate of all records of a session. Sole input to cleanup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferReport {
    pub records: Vec<TransferRecord>,

    /// True if the caller cancelled the session
    pub cancelled: bool,

    /// Session-level failure (e.g. the volume was detached)
    pub session_error: Option<String>,
    pub session_error_kind: Option<ErrorKind>,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TransferReport {
    pub fn count(&self, status: RecordStatus) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &TransferRecord> {
        self.with_status(RecordStatus::Succeeded)
    }

    pub fn failed(&self) -> impl Iterator<Item = &TransferRecord> {
        self.with_status(RecordStatus::Failed)
    }

    pub fn skipped(&self) -> impl Iterator<Item = &TransferRecord> {
        self.with_status(RecordStatus::Skipped)
    }

    pub fn total_retries(&self) -> u32 {
        self.records.iter().map(|r| r.retries).sum()
    }

    pub fn bytes_copied(&self) -> u64 {
        self.succeeded().map(|r| r.bytes_copied).sum()
    }

    /// True once every record has reached a terminal status.
    pub fn is_complete(&self) -> bool {
        self.records.iter().all(|r| r.status.is_terminal())
    }

    pub fn record(&self, id: ItemId) -> Option<&TransferRecord> {
        self.records.iter().find(|r| r.item_id == id)
    }

    fn with_status(&self, status: RecordStatus) -> impl Iterator<Item = &TransferRecord> {
        self.records.iter().filter(move |r| r.status == status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u128, dest: &str) -> PlanEntry {
        PlanEntry {
            item_id: ItemId(Uuid::from_u128(id)),
            source_path: PathBuf::from(format!("/card/{}.jpg", id)),
            destination_path: PathBuf::from(dest),
            size: 10,
            action: PlanAction::Copy,
        }
    }

    #[test]
    fn test_item_id_is_stable() {
        let volume = VolumeId("abc".to_string());
        let a = ItemId::derive(&volume, Path::new("DCIM/100CANON/IMG_0001.JPG"));
        let b = ItemId::derive(&volume, Path::new("DCIM/100CANON/IMG_0001.JPG"));
        let c = ItemId::derive(&volume, Path::new("DCIM/100CANON/IMG_0002.JPG"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_volume_fingerprint_depends_on_root() {
        let a = Volume::new("SDCARD", "/media/a", "exfat", 100, 50, true);
        let b = Volume::new("SDCARD", "/media/b", "exfat", 100, 50, true);
        let a2 = Volume::new("SDCARD", "/media/a", "exfat", 100, 10, true);
        assert_ne!(a.id, b.id);
        // Free space changes must not change identity
        assert_eq!(a.id, a2.id);
    }

    #[test]
    fn test_selection_set_keeps_order_and_flags() {
        let ids: Vec<ItemId> = (1..=3).map(|i| ItemId(Uuid::from_u128(i))).collect();
        let mut selection = SelectionSet::new();
        for id in &ids {
            selection.include(*id);
        }
        selection.exclude(ids[1]);
        assert_eq!(selection.selected().collect::<Vec<_>>(), vec![ids[0], ids[2]]);

        selection.toggle(ids[1]);
        assert_eq!(selection.selected().collect::<Vec<_>>(), ids);
        assert_eq!(selection.len(), 3);
    }

    #[test]
    fn test_plan_validate_detects_case_insensitive_collision() {
        let plan = TransferPlan {
            destination_root: PathBuf::from("/photos"),
            entries: vec![entry(1, "/photos/IMG0001.jpg"), entry(2, "/photos/img0001.JPG")],
        };
        assert!(matches!(
            plan.validate(),
            Err(EngineError::PlanCollisionUnresolved { .. })
        ));

        let plan = TransferPlan {
            destination_root: PathBuf::from("/photos"),
            entries: vec![entry(1, "/photos/IMG0001.jpg"), entry(2, "/photos/IMG0002.jpg")],
        };
        assert!(plan.validate().is_ok());
        assert_eq!(plan.total_bytes(), 20);
    }

    #[test]
    fn test_record_status_terminal() {
        assert!(!RecordStatus::Pending.is_terminal());
        assert!(!RecordStatus::Copying.is_terminal());
        assert!(!RecordStatus::Verifying.is_terminal());
        assert!(RecordStatus::Succeeded.is_terminal());
        assert!(RecordStatus::Failed.is_terminal());
        assert!(RecordStatus::Skipped.is_terminal());
    }
}
