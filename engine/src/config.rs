//! Engine configuration.
//!
//! The settings collaborator owns persistence; the engine only reads an
//! [`EngineConfig`] at session start, either built in code or parsed from TOML:
//!
//! ```toml
//! destination = "/home/me/Pictures"
//!
//! [catalog]
//! media_types = ["photo", "video"]
//!
//! [organization]
//! mode = "by-date"
//! date_format = "YYYY/MM"
//! rename_base = "IMG"
//! rename_start_index = 1
//! rename_digits = 4
//!
//! [transfer]
//! checksum = "blake3"
//! max_retries = 3
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::checksums::ChecksumAlgorithm;
use crate::error::EngineError;
use crate::model::MediaType;

/// Largest supported sequence width.
pub const MAX_RENAME_DIGITS: u32 = 12;

/// Top-level configuration read at session start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default destination root
    pub destination: Option<PathBuf>,
    pub catalog: CatalogConfig,
    pub organization: OrganizationPolicy,
    pub transfer: TransferConfig,
}

impl EngineConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, EngineError> {
        let config: EngineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        self.organization.validate()?;
        self.transfer.validate()?;
        if self.catalog.media_types.is_empty() {
            return Err(EngineError::Config(
                "catalog.media_types must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Options controlling catalog scans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Media types kept by a scan; everything else is skipped
    pub media_types: Vec<MediaType>,

    /// Read EXIF capture dates and camera fields where available
    pub read_embedded_metadata: bool,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        CatalogConfig {
            media_types: vec![MediaType::Photo, MediaType::Video],
            read_embedded_metadata: true,
        }
    }
}

/// How destination folders are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrganizationMode {
    /// Folders from the capture date formatted with `date_format`
    ByDate,
    /// One folder level per template token
    ByMetadataTemplate,
}

/// Folder layout and renaming rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrganizationPolicy {
    pub mode: OrganizationMode,

    /// Date pattern using `YYYY`, `YY`, `MM`, `DD`, `HH`, `mm`, `ss`; `/` separates folders
    pub date_format: String,

    /// Metadata field names, one folder level each
    pub template: Vec<String>,

    pub rename_base: String,
    pub rename_start_index: u64,
    pub rename_digits: u32,
}

impl Default for OrganizationPolicy {
    fn default() -> Self {
        OrganizationPolicy {
            mode: OrganizationMode::ByDate,
            date_format: "YYYY/MM".to_string(),
            template: Vec::new(),
            rename_base: "IMG".to_string(),
            rename_start_index: 1,
            rename_digits: 4,
        }
    }
}

impl OrganizationPolicy {
    pub fn validate(&self) -> Result<(), EngineError> {
        match self.mode {
            OrganizationMode::ByDate if self.date_format.trim().is_empty() => {
                return Err(EngineError::InvalidPolicy {
                    reason: "date_format is empty".to_string(),
                });
            }
            OrganizationMode::ByMetadataTemplate if self.template.is_empty() => {
                return Err(EngineError::InvalidPolicy {
                    reason: "template has no tokens".to_string(),
                });
            }
            _ => {}
        }
        if self.rename_digits == 0 || self.rename_digits > MAX_RENAME_DIGITS {
            return Err(EngineError::InvalidPolicy {
                reason: format!(
                    "rename_digits must be between 1 and {}",
                    MAX_RENAME_DIGITS
                ),
            });
        }
        if self.rename_base.contains(['/', '\\']) {
            return Err(EngineError::InvalidPolicy {
                reason: "rename_base must not contain path separators".to_string(),
            });
        }
        Ok(())
    }
}

/// Copy pipeline tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes per read/write chunk
    pub chunk_size: usize,

    /// Extra attempts after a transient failure
    pub max_retries: u32,

    /// Backoff before the first retry; doubles on each further retry
    pub retry_backoff_ms: u64,

    /// A single chunk taking longer than this counts as a stall
    pub stall_timeout_ms: u64,

    pub checksum: ChecksumAlgorithm,

    /// Copy the source modification time onto the destination
    pub preserve_modified_time: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            chunk_size: 1024 * 1024,
            max_retries: 3,
            retry_backoff_ms: 250,
            stall_timeout_ms: 30_000,
            checksum: ChecksumAlgorithm::Blake3,
            preserve_modified_time: true,
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.chunk_size == 0 {
            return Err(EngineError::Config(
                "transfer.chunk_size must be positive".to_string(),
            ));
        }
        if self.stall_timeout_ms == 0 {
            return Err(EngineError::Config(
                "transfer.stall_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().expect("Default config should validate");
        assert_eq!(config.organization.date_format, "YYYY/MM");
        assert_eq!(config.transfer.checksum, ChecksumAlgorithm::Blake3);
    }

    #[test]
    fn test_parse_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
            destination = "/photos"

            [catalog]
            media_types = ["photo"]

            [organization]
            mode = "by-metadata-template"
            template = ["make", "model"]
            rename_base = "DSC"
            rename_digits = 5

            [transfer]
            checksum = "sha256"
            max_retries = 1
            "#,
        )
        .expect("Config should parse");

        assert_eq!(config.destination, Some(PathBuf::from("/photos")));
        assert_eq!(config.catalog.media_types, vec![MediaType::Photo]);
        assert_eq!(config.organization.mode, OrganizationMode::ByMetadataTemplate);
        assert_eq!(config.organization.template, vec!["make", "model"]);
        assert_eq!(config.organization.rename_start_index, 1);
        assert_eq!(config.transfer.checksum, ChecksumAlgorithm::Sha256);
        assert_eq!(config.transfer.max_retries, 1);
        assert_eq!(config.transfer.chunk_size, 1024 * 1024);
    }

    #[test]
    fn test_rejects_bad_policy() {
        let result = EngineConfig::from_toml_str(
            r#"
            [organization]
            mode = "by-metadata-template"
            "#,
        );
        assert!(matches!(result, Err(EngineError::InvalidPolicy { .. })));

        let policy = OrganizationPolicy {
            rename_digits: 0,
            ..OrganizationPolicy::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_rejects_malformed_toml() {
        let result = EngineConfig::from_toml_str("[organization\nmode = 3");
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_backoff_doubles() {
        let config = TransferConfig {
            retry_backoff_ms: 100,
            ..TransferConfig::default()
        };
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(400));
    }
}
