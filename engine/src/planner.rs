//! Destination planning.
//!
//! [`OrganizationPlanner::plan`] maps the selected catalog items to
//! destination paths under the destination root. The mapping depends only on
//! the policy, the selected items and what already exists at the destination,
//! so planning the same selection twice yields the same plan.
//!
//! Items are numbered in capture order (ties broken by file name, then by
//! relative path). A destination already holding a file is either recognised
//! as a byte-identical copy (the entry becomes [`PlanAction::SkipIdentical`])
//! or avoided by appending `_<suffix>` to the generated name.

use chrono::{Datelike, NaiveDateTime, Timelike};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, error, instrument, warn};

use crate::catalog::MediaCatalog;
use crate::checksums::{compute_file_checksum, ChecksumAlgorithm};
use crate::config::{OrganizationMode, OrganizationPolicy};
use crate::error::EngineError;
use crate::metadata::UNKNOWN_FIELD;
use crate::model::{MediaItem, PlanAction, PlanEntry, SelectionSet, TransferPlan};

/// Upper bound on disambiguation attempts for a single item.
const MAX_SUFFIX_ATTEMPTS: u64 = 100_000;

/// Characters replaced in generated path segments.
const RESERVED_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

pub struct OrganizationPlanner {
    policy: OrganizationPolicy,
    destination_root: PathBuf,
    algorithm: ChecksumAlgorithm,
}

impl OrganizationPlanner {
    /// `algorithm` is used to compare items with files already at the destination.
    pub fn new(
        policy: OrganizationPolicy,
        destination_root: impl Into<PathBuf>,
        algorithm: ChecksumAlgorithm,
    ) -> Result<Self, EngineError> {
        policy.validate()?;
        Ok(OrganizationPlanner {
            policy,
            destination_root: destination_root.into(),
            algorithm,
        })
    }

    pub fn policy(&self) -> &OrganizationPolicy {
        &self.policy
    }

    /// Compute the plan for the selected items of `catalog`.
    #[instrument(skip_all, fields(destination = %self.destination_root.display()))]
    pub fn plan(
        &self,
        catalog: &MediaCatalog,
        selection: &SelectionSet,
    ) -> Result<TransferPlan, EngineError> {
        let mut seen = BTreeSet::new();
        let mut items: Vec<&MediaItem> = Vec::new();
        for id in selection.selected() {
            if !seen.insert(id) {
                continue;
            }
            match catalog.get(id) {
                Some(item) => items.push(item),
                None => warn!("Selected item {} is not in the catalog", id),
            }
        }
        items.sort_by(|a, b| {
            a.captured
                .cmp(&b.captured)
                .then_with(|| a.file_name().cmp(&b.file_name()))
                .then_with(|| a.relative_path.cmp(&b.relative_path))
        });

        let mut existing = ExistingFiles::default();
        let mut claimed: HashSet<String> = HashSet::new();
        let mut entries = Vec::with_capacity(items.len());

        for (offset, item) in items.iter().enumerate() {
            let index = self.policy.rename_start_index + offset as u64;
            let folder = self.destination_root.join(self.folder_for(item));
            let entry = self.place(catalog, item, &folder, index, &mut existing, &mut claimed)?;
            debug!(
                "Planned {} -> {} ({:?})",
                item.relative_path.display(),
                entry.destination_path.display(),
                entry.action
            );
            entries.push(entry);
        }

        let plan = TransferPlan {
            destination_root: self.destination_root.clone(),
            entries,
        };
        if let Err(e) = plan.validate() {
            error!("Planner produced a colliding plan: {}", e);
            return Err(e);
        }
        Ok(plan)
    }

    /// Folder (relative to the destination root) for an item.
    pub fn folder_for(&self, item: &MediaItem) -> PathBuf {
        match self.policy.mode {
            OrganizationMode::ByDate => format_date(&self.policy.date_format, item.captured)
                .split('/')
                .filter(|s| !s.trim().is_empty())
                .map(sanitize_segment)
                .collect(),
            OrganizationMode::ByMetadataTemplate => self
                .policy
                .template
                .iter()
                .map(|token| {
                    let value = item
                        .field(&token.trim().to_lowercase())
                        .filter(|v| !v.trim().is_empty())
                        .unwrap_or(UNKNOWN_FIELD);
                    sanitize_segment(value)
                })
                .collect(),
        }
    }

    fn file_name(&self, index: u64, suffix: Option<u64>, extension: Option<&str>) -> String {
        let width = self.policy.rename_digits as usize;
        let mut name = format!("{}{:0width$}", self.policy.rename_base, index, width = width);
        if let Some(suffix) = suffix {
            name.push_str(&format!("_{:0width$}", suffix, width = width));
        }
        if let Some(ext) = extension {
            name.push('.');
            name.push_str(ext);
        }
        name
    }

    /// Find the first destination for `item` that is free or already holds an identical copy.
    fn place(
        &self,
        catalog: &MediaCatalog,
        item: &MediaItem,
        folder: &Path,
        index: u64,
        existing: &mut ExistingFiles,
        claimed: &mut HashSet<String>,
    ) -> Result<PlanEntry, EngineError> {
        let extension = item.extension();
        let mut suffix = None;

        for _ in 0..MAX_SUFFIX_ATTEMPTS {
            let candidate = folder.join(self.file_name(index, suffix, extension.as_deref()));
            let key = collision_key(&candidate);

            if !claimed.contains(&key) {
                match existing.lookup(&candidate) {
                    Existing::Free => {
                        claimed.insert(key);
                        return Ok(entry(item, candidate, PlanAction::Copy));
                    }
                    Existing::File { path, size } if size == item.size => {
                        if self.is_identical(catalog, item, &path)? {
                            claimed.insert(key);
                            return Ok(entry(item, path, PlanAction::SkipIdentical));
                        }
                    }
                    _ => {}
                }
            }

            suffix = Some(match suffix {
                None => self.policy.rename_start_index,
                Some(n) => n + 1,
            });
        }

        error!(
            "Could not find a free destination for {} in {}",
            item.relative_path.display(),
            folder.display()
        );
        Err(EngineError::PlanCollisionUnresolved {
            path: folder.join(self.file_name(index, None, extension.as_deref())),
        })
    }

    fn is_identical(
        &self,
        catalog: &MediaCatalog,
        item: &MediaItem,
        destination: &Path,
    ) -> Result<bool, EngineError> {
        let source = match catalog.checksum(item.id, self.algorithm) {
            Ok(value) => value,
            Err(e @ EngineError::VolumeUnavailable { .. }) => return Err(e),
            Err(e) => {
                warn!("Cannot checksum {}: {}", item.source_path.display(), e);
                return Ok(false);
            }
        };
        match compute_file_checksum(destination, self.algorithm) {
            Ok(dest) => Ok(dest.matches(&source)),
            Err(e) => {
                warn!("Cannot checksum existing {}: {}", destination.display(), e);
                Ok(false)
            }
        }
    }
}

fn entry(item: &MediaItem, destination_path: PathBuf, action: PlanAction) -> PlanEntry {
    PlanEntry {
        item_id: item.id,
        source_path: item.source_path.clone(),
        destination_path,
        size: item.size,
        action,
    }
}

fn collision_key(path: &Path) -> String {
    path.to_string_lossy().to_lowercase()
}

enum Existing {
    Free,
    File { path: PathBuf, size: u64 },
    /// A directory or something unreadable is in the way
    Blocked,
}

/// Case-insensitive view of destination directories, listed once per plan.
#[derive(Default)]
struct ExistingFiles {
    dirs: HashMap<PathBuf, HashMap<String, PathBuf>>,
}

impl ExistingFiles {
    fn lookup(&mut self, candidate: &Path) -> Existing {
        let (Some(parent), Some(name)) = (candidate.parent(), candidate.file_name()) else {
            return Existing::Blocked;
        };
        let listing = self
            .dirs
            .entry(parent.to_path_buf())
            .or_insert_with(|| list_dir(parent));

        let Some(path) = listing.get(&name.to_string_lossy().to_lowercase()) else {
            return Existing::Free;
        };
        match std::fs::metadata(path) {
            Ok(meta) if meta.is_file() => Existing::File {
                path: path.clone(),
                size: meta.len(),
            },
            _ => Existing::Blocked,
        }
    }
}

fn list_dir(dir: &Path) -> HashMap<String, PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .map(|e| (e.file_name().to_string_lossy().to_lowercase(), e.path()))
            .collect(),
        Err(_) => HashMap::new(),
    }
}

/// Expand date tokens in `pattern`. Unrecognised text is copied through.
///
/// Tokens: `YYYY`, `YY`, `MM`, `DD`, `HH`, `mm`, `ss`.
pub fn format_date(pattern: &str, time: NaiveDateTime) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    let mut rest = pattern;
    while !rest.is_empty() {
        let (value, len) = if rest.starts_with("YYYY") {
            (format!("{:04}", time.year()), 4)
        } else if rest.starts_with("YY") {
            (format!("{:02}", time.year().rem_euclid(100)), 2)
        } else if rest.starts_with("MM") {
            (format!("{:02}", time.month()), 2)
        } else if rest.starts_with("DD") {
            (format!("{:02}", time.day()), 2)
        } else if rest.starts_with("HH") {
            (format!("{:02}", time.hour()), 2)
        } else if rest.starts_with("mm") {
            (format!("{:02}", time.minute()), 2)
        } else if rest.starts_with("ss") {
            (format!("{:02}", time.second()), 2)
        } else {
            let ch = rest.chars().next().unwrap_or_default();
            (ch.to_string(), ch.len_utf8())
        };
        out.push_str(&value);
        rest = &rest[len..];
    }
    out
}

/// Make a value usable as a single path segment on common file systems.
pub fn sanitize_segment(value: &str) -> String {
    let replaced: String = value
        .chars()
        .map(|c| {
            if RESERVED_CHARS.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();
    let trimmed = replaced.trim_matches(|c: char| c.is_whitespace() || c == '.');
    if trimmed.is_empty() {
        UNKNOWN_FIELD.to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CatalogConfig;
    use crate::volume::VolumeHandle;
    use chrono::{Local, NaiveDate};
    use std::fs;
    use std::time::SystemTime;

    fn add(root: &Path, relative: &str, content: &[u8], when: (i32, u32, u32, u32)) -> PathBuf {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        let local = NaiveDate::from_ymd_opt(when.0, when.1, when.2)
            .unwrap()
            .and_hms_opt(when.3, 0, 0)
            .unwrap()
            .and_local_timezone(Local)
            .unwrap();
        filetime::set_file_mtime(&path, filetime::FileTime::from_system_time(SystemTime::from(local)))
            .unwrap();
        path
    }

    fn catalog(root: &Path) -> MediaCatalog {
        MediaCatalog::scan(&VolumeHandle::for_directory(root), &CatalogConfig::default())
            .expect("Scan should succeed")
    }

    fn planner(policy: OrganizationPolicy, dest: &Path) -> OrganizationPlanner {
        OrganizationPlanner::new(policy, dest, ChecksumAlgorithm::Blake3).expect("Valid policy")
    }

    fn names(plan: &TransferPlan) -> Vec<String> {
        plan.entries
            .iter()
            .map(|e| e.destination_path.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_by_date_folder() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let card = temp_dir.path().join("card");
        let dest = temp_dir.path().join("dest");
        add(&card, "DCIM/IMG_1234.JPG", b"photo", (2024, 3, 15, 10));

        let catalog = catalog(&card);
        let plan = planner(OrganizationPolicy::default(), &dest)
            .plan(&catalog, &SelectionSet::from_items(catalog.items()))
            .expect("Plan should succeed");

        assert_eq!(plan.entries.len(), 1);
        assert_eq!(plan.entries[0].destination_path, dest.join("2024/03/IMG0001.JPG"));
        assert_eq!(plan.entries[0].action, PlanAction::Copy);
    }

    #[test]
    fn test_sequential_names_follow_capture_order() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let card = temp_dir.path().join("card");
        let dest = temp_dir.path().join("dest");
        add(&card, "a.jpg", b"third", (2024, 1, 3, 9));
        add(&card, "b.jpg", b"first", (2024, 1, 1, 9));
        add(&card, "c.mov", b"second", (2024, 1, 2, 9));

        let catalog = catalog(&card);
        let policy = OrganizationPolicy {
            date_format: "YYYY".to_string(),
            ..OrganizationPolicy::default()
        };
        let plan = planner(policy, &dest)
            .plan(&catalog, &SelectionSet::from_items(catalog.items()))
            .expect("Plan should succeed");

        assert_eq!(names(&plan), vec!["IMG0001.jpg", "IMG0002.mov", "IMG0003.jpg"]);
        let sources: Vec<String> = plan
            .entries
            .iter()
            .map(|e| e.source_path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(sources, vec!["b.jpg", "c.mov", "a.jpg"]);
    }

    #[test]
    fn test_plan_is_deterministic_and_order_independent() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let card = temp_dir.path().join("card");
        let dest = temp_dir.path().join("dest");
        for (i, name) in ["x.jpg", "y.jpg", "z.jpg"].iter().enumerate() {
            // Same capture time; file name breaks the tie
            add(&card, name, format!("{}", i).as_bytes(), (2023, 7, 4, 12));
        }

        let catalog = catalog(&card);
        let planner = planner(OrganizationPolicy::default(), &dest);
        let forward = SelectionSet::from_items(catalog.items());
        let backward = SelectionSet::from_items(catalog.items().iter().rev());

        let first = planner.plan(&catalog, &forward).unwrap();
        let second = planner.plan(&catalog, &forward).unwrap();
        let third = planner.plan(&catalog, &backward).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn test_identical_file_at_destination_is_skipped() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let card = temp_dir.path().join("card");
        let dest = temp_dir.path().join("dest");
        add(&card, "IMG_0001.JPG", b"same bytes", (2024, 3, 15, 10));
        fs::create_dir_all(dest.join("2024/03")).unwrap();
        fs::write(dest.join("2024/03/IMG0001.JPG"), b"same bytes").unwrap();

        let catalog = catalog(&card);
        let plan = planner(OrganizationPolicy::default(), &dest)
            .plan(&catalog, &SelectionSet::from_items(catalog.items()))
            .unwrap();

        assert_eq!(plan.entries[0].action, PlanAction::SkipIdentical);
        assert_eq!(plan.entries[0].destination_path, dest.join("2024/03/IMG0001.JPG"));
        assert_eq!(plan.skip_count(), 1);
        assert_eq!(plan.total_bytes(), 0);
    }

    #[test]
    fn test_different_file_at_destination_gets_suffix() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let card = temp_dir.path().join("card");
        let dest = temp_dir.path().join("dest");
        add(&card, "IMG_0001.JPG", b"new bytes!", (2024, 3, 15, 10));
        add(&card, "IMG_0002.JPG", b"other", (2024, 3, 15, 11));
        fs::create_dir_all(dest.join("2024/03")).unwrap();
        // Same size, different content, different case
        fs::write(dest.join("2024/03/img0001.jpg"), b"old bytes!").unwrap();
        fs::write(dest.join("2024/03/IMG0001_0001.JPG"), b"taken too").unwrap();

        let catalog = catalog(&card);
        let plan = planner(OrganizationPolicy::default(), &dest)
            .plan(&catalog, &SelectionSet::from_items(catalog.items()))
            .unwrap();

        assert_eq!(names(&plan), vec!["IMG0001_0002.JPG", "IMG0002.JPG"]);
        assert!(plan.entries.iter().all(|e| e.action == PlanAction::Copy));
        // Planning never touches the destination
        assert_eq!(fs::read(dest.join("2024/03/img0001.jpg")).unwrap(), b"old bytes!");
    }

    #[test]
    fn test_template_mode_uses_unknown_for_missing_fields() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let card = temp_dir.path().join("card");
        let dest = temp_dir.path().join("dest");
        add(&card, "DCIM/100CANON/IMG_0001.JPG", b"x", (2022, 12, 31, 23));

        let catalog = catalog(&card);
        let policy = OrganizationPolicy {
            mode: OrganizationMode::ByMetadataTemplate,
            template: vec!["model".into(), "type".into(), "Year".into(), "folder".into()],
            rename_base: "DSC".into(),
            rename_digits: 3,
            rename_start_index: 7,
            ..OrganizationPolicy::default()
        };
        let plan = planner(policy, &dest)
            .plan(&catalog, &SelectionSet::from_items(catalog.items()))
            .unwrap();

        assert_eq!(
            plan.entries[0].destination_path,
            dest.join("unknown/photo/2022/100CANON/DSC007.JPG")
        );
    }

    #[test]
    fn test_unselected_items_are_not_planned() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let card = temp_dir.path().join("card");
        add(&card, "a.jpg", b"a", (2024, 1, 1, 1));
        add(&card, "b.jpg", b"b", (2024, 1, 2, 1));

        let catalog = catalog(&card);
        let mut selection = SelectionSet::from_items(catalog.items());
        selection.exclude(catalog.items()[0].id);

        let plan = planner(OrganizationPolicy::default(), &temp_dir.path().join("dest"))
            .plan(&catalog, &selection)
            .unwrap();
        assert_eq!(plan.entries[0].item_id, catalog.items()[1].id);
        assert_eq!(plan.entries.len(), 1);
        assert_eq!(names(&plan), vec!["IMG0001.jpg"]);
    }

    #[test]
    fn test_format_date_tokens() {
        let time = NaiveDate::from_ymd_opt(2024, 3, 5)
            .unwrap()
            .and_hms_opt(7, 8, 9)
            .unwrap();
        assert_eq!(format_date("YYYY/MM", time), "2024/03");
        assert_eq!(format_date("YYYY/YYYY-MM-DD", time), "2024/2024-03-05");
        assert_eq!(format_date("YY_MM_DD HH.mm.ss", time), "24_03_05 07.08.09");
        assert_eq!(format_date("Trip é MM", time), "Trip é 03");
    }

    #[test]
    fn test_sanitize_segment() {
        assert_eq!(sanitize_segment("Canon EOS R5"), "Canon EOS R5");
        assert_eq!(sanitize_segment("a/b:c"), "a_b_c");
        assert_eq!(sanitize_segment("  ..  "), "unknown");
        assert_eq!(sanitize_segment(".hidden."), "hidden");
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let policy = OrganizationPolicy {
            mode: OrganizationMode::ByMetadataTemplate,
            template: Vec::new(),
            ..OrganizationPolicy::default()
        };
        assert!(OrganizationPlanner::new(policy, "/dest", ChecksumAlgorithm::Md5).is_err());
    }
}
