//! # Offload Engine - Media Transfer Library
//!
//! A headless engine that moves photos and videos from a removable volume
//! (SD card, camera, USB stick) to a destination on the host, organizing and
//! renaming them by policy, verifying every copy by checksum, and optionally
//! deleting the originals afterwards.
//!
//! ## Overview
//!
//! - Removable volume detection with attach/detach events
//! - Catalog scan with capture dates from EXIF, falling back to mtime
//! - Deterministic, collision-free destination planning
//! - Copy through temporary files, checksum verification, bounded retries
//! - Progress reporting via callbacks or a channel (no UI dependency)
//! - Cleanup of sources gated by explicit confirmation
//!
//! ## Basic Usage
//!
//! ```no_run
//! use offload_engine::{
//!     CancelToken, CleanupConfirmation, EngineConfig, NoProgress, SelectionSet,
//!     TransferSession, VolumeHandle,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let volume = VolumeHandle::for_directory("/media/me/EOS_DIGITAL");
//! let mut session = TransferSession::new(volume, "/home/me/Pictures", EngineConfig::default())?;
//!
//! // Catalog the card and select everything
//! let catalog = session.scan()?;
//! let selection = SelectionSet::from_items(catalog.items());
//!
//! // Preview the destinations
//! let plan = session.preview(&selection)?;
//! println!("Will copy {} files", plan.copy_count());
//!
//! // Copy and verify
//! let report = session.run(&plan, &CancelToken::new(), &NoProgress)?;
//!
//! // Delete the originals that were copied
//! let cleaned = session.cleanup(&report, CleanupConfirmation::Confirmed)?;
//! println!("Deleted {} originals", cleaned.deleted_count());
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **volume**: Removable volume detection and the active volume handle
//! - **catalog**: Volume scan, filters, sorting and the checksum cache
//! - **metadata**: Media classification and EXIF extraction
//! - **planner**: Destination folders, renaming and collision handling
//! - **executor**: Copy/verify/retry pipeline
//! - **cleanup**: Confirmed deletion of transferred sources
//! - **session**: Facade tying the stages together
//! - **model**: Core data structures
//! - **config**: TOML configuration
//! - **error**: Error types and handling
//! - **fs_ops**: Low-level filesystem operations
//! - **progress**: Progress callback trait and channel adapter
//! - **checksums**: Checksum computation

pub mod catalog;
pub mod checksums;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod executor;
pub mod fs_ops;
pub mod metadata;
pub mod model;
pub mod planner;
pub mod progress;
pub mod session;
pub mod volume;

// Re-export main types and functions
pub use catalog::{filter, sort_items, Filter, MediaCatalog, ScanWarning, SortKey, SortOrder};
pub use checksums::{compute_file_checksum, ChecksumAlgorithm, ChecksumValue};
pub use cleanup::{cleanup, CleanupConfirmation, CleanupFailure, CleanupResult};
pub use config::{CatalogConfig, EngineConfig, OrganizationMode, OrganizationPolicy, TransferConfig};
pub use error::{EngineError, ErrorKind};
pub use executor::{AfterCopyHook, CancelToken, TransferExecutor, TransferRun};
pub use model::{
    CaptureSource, ItemId, MediaItem, MediaType, PlanAction, PlanEntry, RecordStatus,
    SelectionSet, TransferPlan, TransferRecord, TransferReport, Volume, VolumeId,
};
pub use planner::OrganizationPlanner;
pub use progress::{ChannelProgress, NoProgress, ProgressCallback, ProgressEvent};
pub use session::TransferSession;
pub use volume::{
    MountDirProbe, SystemProbe, VolumeEvent, VolumeHandle, VolumeProbe, VolumeWatcher,
    WatcherHandle,
};
