//! Session facade.
//!
//! A [`TransferSession`] ties the components together for one front end and
//! one volume:
//!
//! ```text
//! scan -> (filter / select) -> preview -> execute | run -> cleanup
//! ```

use std::path::{Path, PathBuf};
use tracing::{info, instrument};

use crate::catalog::MediaCatalog;
use crate::cleanup::{cleanup, CleanupConfirmation, CleanupResult};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::executor::{CancelToken, TransferExecutor, TransferRun};
use crate::fs_ops;
use crate::model::{SelectionSet, TransferPlan, TransferReport};
use crate::planner::OrganizationPlanner;
use crate::progress::ProgressCallback;
use crate::volume::VolumeHandle;

pub struct TransferSession {
    volume: VolumeHandle,
    destination: PathBuf,
    config: EngineConfig,
    executor: TransferExecutor,
    catalog: Option<MediaCatalog>,
}

impl TransferSession {
    /// Create a session reading from `volume` and writing under `destination`.
    ///
    /// The destination may not exist yet but must not lie inside the volume.
    pub fn new(
        volume: VolumeHandle,
        destination: impl Into<PathBuf>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let destination = destination.into();
        config.validate()?;

        if destination.as_os_str().is_empty() {
            return Err(EngineError::InvalidPath {
                path: destination,
                reason: "Destination path is empty".to_string(),
            });
        }
        if destination.is_file() {
            return Err(EngineError::InvalidPath {
                path: destination,
                reason: "Destination must be a directory".to_string(),
            });
        }
        if destination.starts_with(volume.root()) {
            return Err(EngineError::InvalidPath {
                path: destination,
                reason: "Destination is inside the source volume".to_string(),
            });
        }

        let executor = TransferExecutor::new(config.transfer.clone())?;
        Ok(TransferSession {
            volume,
            destination,
            config,
            executor,
            catalog: None,
        })
    }

    pub fn volume(&self) -> &VolumeHandle {
        &self.volume
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> Option<&MediaCatalog> {
        self.catalog.as_ref()
    }

    /// Discard leftovers of interrupted sessions, then catalog the volume.
    #[instrument(skip(self), fields(root = %self.volume.root().display()))]
    pub fn scan(&mut self) -> Result<&MediaCatalog, EngineError> {
        let swept = fs_ops::sweep_temporaries(&self.destination)?;
        if !swept.is_empty() {
            info!("Removed {} leftover temporary files", swept.len());
        }
        let catalog = MediaCatalog::scan(&self.volume, &self.config.catalog)?;
        Ok(&*self.catalog.insert(catalog))
    }

    pub fn planner(&self) -> Result<OrganizationPlanner, EngineError> {
        OrganizationPlanner::new(
            self.config.organization.clone(),
            &self.destination,
            self.config.transfer.checksum,
        )
    }

    /// Plan the selection without touching any file.
    pub fn preview(&self, selection: &SelectionSet) -> Result<TransferPlan, EngineError> {
        let catalog = self
            .catalog
            .as_ref()
            .ok_or_else(|| EngineError::Internal("preview requested before scan".to_string()))?;
        self.planner()?.plan(catalog, selection)
    }

    /// Run `plan` on a worker thread.
    pub fn execute(&self, plan: TransferPlan) -> Result<TransferRun, EngineError> {
        self.executor.execute(plan, self.volume.clone())
    }

    /// Run `plan` on the calling thread.
    pub fn run(
        &self,
        plan: &TransferPlan,
        cancel: &CancelToken,
        progress: &dyn ProgressCallback,
    ) -> Result<TransferReport, EngineError> {
        self.executor.run(plan, &self.volume, cancel, progress)
    }

    pub fn cleanup(
        &self,
        report: &TransferReport,
        confirmation: CleanupConfirmation,
    ) -> Result<CleanupResult, EngineError> {
        cleanup(report, confirmation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_rejects_destination_inside_volume() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let volume = VolumeHandle::for_directory(temp_dir.path());
        let result = TransferSession::new(volume, temp_dir.path().join("out"), EngineConfig::default());
        assert!(matches!(result, Err(EngineError::InvalidPath { .. })));
    }

    #[test]
    fn test_preview_requires_scan() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let card = temp_dir.path().join("card");
        fs::create_dir(&card).unwrap();
        let session = TransferSession::new(
            VolumeHandle::for_directory(&card),
            temp_dir.path().join("dest"),
            EngineConfig::default(),
        )
        .unwrap();
        assert!(session.preview(&SelectionSet::new()).is_err());
    }

    #[test]
    fn test_scan_sweeps_leftover_temporaries() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let card = temp_dir.path().join("card");
        let dest = temp_dir.path().join("dest");
        fs::create_dir_all(&card).unwrap();
        fs::create_dir_all(dest.join("2024/03")).unwrap();
        fs::write(card.join("IMG_0001.JPG"), b"x").unwrap();
        let leftover = dest.join("2024/03/.IMG0001.JPG.offload-partial");
        fs::write(&leftover, b"half").unwrap();

        let mut session =
            TransferSession::new(VolumeHandle::for_directory(&card), &dest, EngineConfig::default())
                .unwrap();
        let catalog = session.scan().expect("Scan should succeed");
        assert_eq!(catalog.len(), 1);
        assert!(!leftover.exists());
    }
}
