//! Media catalog: scanning a volume, filtering and sorting items.
//!
//! A scan only reads directory entries, file metadata and (for photos) the
//! EXIF block. Content checksums are computed on demand through
//! [`MediaCatalog::checksum`] and cached for the catalog's lifetime.

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};
use dashmap::DashMap;
use std::borrow::Borrow;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, instrument, trace, warn};
use walkdir::WalkDir;

use crate::checksums::{compute_file_checksum, ChecksumAlgorithm, ChecksumValue};
use crate::config::CatalogConfig;
use crate::error::EngineError;
use crate::fs_ops::is_temporary;
use crate::metadata::{build_fields, classify, read_embedded};
use crate::model::{CaptureSource, ItemId, MediaItem, MediaType};
use crate::volume::VolumeHandle;

/// A non-fatal problem met during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanWarning {
    pub path: PathBuf,
    pub message: String,
}

/// Items found on one volume.
#[derive(Debug)]
pub struct MediaCatalog {
    volume: VolumeHandle,
    items: Vec<MediaItem>,
    index: HashMap<ItemId, usize>,
    warnings: Vec<ScanWarning>,
    checksums: DashMap<(ItemId, ChecksumAlgorithm), ChecksumValue>,
}

impl MediaCatalog {
    /// Walk the volume and catalog every allowed media file.
    pub fn scan(volume: &VolumeHandle, config: &CatalogConfig) -> Result<Self, EngineError> {
        Self::scan_with_progress(volume, config, |_| {})
    }

    /// Like [`scan`](Self::scan), calling `on_item` for each catalogued item.
    ///
    /// Fails with `VolumeUnavailable` if the volume goes away mid-scan.
    #[instrument(skip_all, fields(root = %volume.root().display()))]
    pub fn scan_with_progress<F>(
        volume: &VolumeHandle,
        config: &CatalogConfig,
        mut on_item: F,
    ) -> Result<Self, EngineError>
    where
        F: FnMut(&MediaItem),
    {
        volume.ensure_available()?;
        let root = volume.root().to_path_buf();
        // Links are followed only while they resolve inside this root
        let canonical_root =
            std::fs::canonicalize(&root).map_err(|_| EngineError::VolumeUnavailable {
                root: root.clone(),
            })?;

        let mut items = Vec::new();
        let mut warnings = Vec::new();
        let mut visited_dirs = HashSet::new();

        let mut walker = WalkDir::new(&root)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter();

        while let Some(entry) = walker.next() {
            if volume.is_detached() {
                return Err(EngineError::VolumeUnavailable { root });
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    volume.ensure_available()?;
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                    if e.loop_ancestor().is_some() {
                        debug!("Not following symlink loop at {}", path.display());
                        continue;
                    }
                    warn!("Skipping unreadable entry {}: {}", path.display(), e);
                    warnings.push(ScanWarning {
                        path,
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            let path = entry.path();

            if entry.path_is_symlink() {
                let escape = match std::fs::canonicalize(path) {
                    Ok(target) if target.starts_with(&canonical_root) => None,
                    Ok(target) => Some(format!("link leaves the volume ({})", target.display())),
                    Err(e) => Some(e.to_string()),
                };
                if let Some(message) = escape {
                    warn!("Not following {}: {}", path.display(), message);
                    warnings.push(ScanWarning {
                        path: path.to_path_buf(),
                        message,
                    });
                    if entry.file_type().is_dir() {
                        walker.skip_current_dir();
                    }
                    continue;
                }
            }

            if entry.file_type().is_dir() {
                // Two links to the same directory: walk it once
                if let Ok(canonical) = std::fs::canonicalize(path) {
                    if !visited_dirs.insert(canonical) {
                        debug!("Directory already visited: {}", path.display());
                        walker.skip_current_dir();
                    }
                }
                continue;
            }

            if !entry.file_type().is_file() || is_temporary(path) {
                continue;
            }

            let media_type = classify(path);
            if !config.media_types.contains(&media_type) {
                trace!("Skipping {} ({})", path.display(), media_type);
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!("Cannot read metadata of {}: {}", path.display(), e);
                    warnings.push(ScanWarning {
                        path: path.to_path_buf(),
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let modified = local_time(modified);

            let embedded = if config.read_embedded_metadata && media_type == MediaType::Photo {
                read_embedded(path)
            } else {
                None
            };
            let (captured, capture_source) = match embedded.as_ref().and_then(|m| m.captured) {
                Some(captured) => (captured, CaptureSource::Embedded),
                None => (modified, CaptureSource::Modified),
            };

            let relative_path = path.strip_prefix(&root).unwrap_or(path).to_path_buf();
            let fields = build_fields(
                &relative_path,
                captured,
                media_type,
                &volume.volume().label,
                embedded.as_ref(),
            );

            let item = MediaItem {
                id: ItemId::derive(volume.id(), &relative_path),
                relative_path,
                source_path: path.to_path_buf(),
                size: metadata.len(),
                modified,
                captured,
                capture_source,
                media_type,
                fields,
            };
            on_item(&item);
            items.push(item);
        }

        info!(
            "Catalogued {} items ({} warnings) on {}",
            items.len(),
            warnings.len(),
            root.display()
        );

        let index = items.iter().enumerate().map(|(i, item)| (item.id, i)).collect();
        Ok(MediaCatalog {
            volume: volume.clone(),
            items,
            index,
            warnings,
            checksums: DashMap::new(),
        })
    }

    pub fn volume(&self) -> &VolumeHandle {
        &self.volume
    }

    pub fn items(&self) -> &[MediaItem] {
        &self.items
    }

    pub fn get(&self, id: ItemId) -> Option<&MediaItem> {
        self.index.get(&id).map(|&i| &self.items[i])
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn warnings(&self) -> &[ScanWarning] {
        &self.warnings
    }

    /// Content checksum of an item, computed at most once per algorithm.
    pub fn checksum(
        &self,
        id: ItemId,
        algorithm: ChecksumAlgorithm,
    ) -> Result<ChecksumValue, EngineError> {
        if let Some(value) = self.checksums.get(&(id, algorithm)) {
            return Ok(value.clone());
        }
        let item = self
            .get(id)
            .ok_or_else(|| EngineError::Internal(format!("item {} is not in the catalog", id)))?;
        let value = compute_file_checksum(&item.source_path, algorithm).map_err(|e| {
            if self.volume.ensure_available().is_err() {
                EngineError::VolumeUnavailable {
                    root: self.volume.root().to_path_buf(),
                }
            } else {
                e
            }
        })?;
        self.checksums.insert((id, algorithm), value.clone());
        Ok(value)
    }

    /// Checksum if it was already computed.
    pub fn cached_checksum(&self, id: ItemId, algorithm: ChecksumAlgorithm) -> Option<ChecksumValue> {
        self.checksums.get(&(id, algorithm)).map(|v| v.clone())
    }
}

fn local_time(time: SystemTime) -> NaiveDateTime {
    DateTime::<Local>::from(time).naive_local()
}

/// Predicate over catalog items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Capture date within the inclusive range; open ends are unbounded
    DateRange {
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    },
    /// Size in bytes within the inclusive range
    SizeRange { min: Option<u64>, max: Option<u64> },
    Types(Vec<MediaType>),
    /// Case-insensitive match on the file name
    NameContains(String),
}

impl Filter {
    pub fn matches(&self, item: &MediaItem) -> bool {
        match self {
            Filter::DateRange { from, to } => {
                let date = item.captured.date();
                from.map_or(true, |from| date >= from) && to.map_or(true, |to| date <= to)
            }
            Filter::SizeRange { min, max } => {
                min.map_or(true, |min| item.size >= min) && max.map_or(true, |max| item.size <= max)
            }
            Filter::Types(types) => types.contains(&item.media_type),
            Filter::NameContains(needle) => item
                .file_name()
                .to_lowercase()
                .contains(&needle.to_lowercase()),
        }
    }
}

/// Items matching every filter, in catalog order.
pub fn filter<'a>(items: &'a [MediaItem], filters: &[Filter]) -> Vec<&'a MediaItem> {
    items
        .iter()
        .filter(|item| filters.iter().all(|f| f.matches(item)))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Name,
    Size,
    Type,
    Date,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Sort items in place. Ties fall back to the file name.
pub fn sort_items<T: Borrow<MediaItem>>(items: &mut [T], key: SortKey, order: SortOrder) {
    items.sort_by(|a, b| {
        let (a, b) = (a.borrow(), b.borrow());
        let by_name = || a.file_name().to_lowercase().cmp(&b.file_name().to_lowercase());
        let ordering = match key {
            SortKey::Name => by_name(),
            SortKey::Size => a.size.cmp(&b.size).then_with(by_name),
            SortKey::Type => a
                .media_type
                .cmp(&b.media_type)
                .then_with(|| extension_key(a).cmp(&extension_key(b)))
                .then_with(by_name),
            SortKey::Date => a.captured.cmp(&b.captured).then_with(by_name),
        };
        match order {
            SortOrder::Ascending => ordering,
            SortOrder::Descending => ordering.reverse(),
        }
    });
}

fn extension_key(item: &MediaItem) -> String {
    item.extension().unwrap_or_default().to_lowercase()
}
