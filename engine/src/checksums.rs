//! Checksum computation.
//!
//! This module provides:
//! - Multiple checksum algorithms (CRC32, MD5, SHA-256, BLAKE3)
//! - [`StreamHasher`], fed chunk by chunk while bytes are copied
//! - File-level checksum computation with a per-chunk hook

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

/// Buffer size used when hashing a file on its own.
pub const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Supported checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// CRC32 (fast, 32-bit)
    Crc32,
    /// MD5 (deprecated, but included for compatibility)
    Md5,
    /// SHA-256 (cryptographic, 256-bit)
    Sha256,
    /// BLAKE3 (modern, fast, 256-bit)
    #[default]
    Blake3,
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crc32 => write!(f, "crc32"),
            Self::Md5 => write!(f, "md5"),
            Self::Sha256 => write!(f, "sha256"),
            Self::Blake3 => write!(f, "blake3"),
        }
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "crc32" => Ok(Self::Crc32),
            "md5" => Ok(Self::Md5),
            "sha256" => Ok(Self::Sha256),
            "blake3" => Ok(Self::Blake3),
            other => Err(EngineError::Config(format!(
                "unknown checksum algorithm '{}'",
                other
            ))),
        }
    }
}

/// A computed checksum value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChecksumValue {
    algorithm: ChecksumAlgorithm,
    hex: String,
}

impl ChecksumValue {
    /// Create a new checksum value
    pub fn new(algorithm: ChecksumAlgorithm, hex: String) -> Self {
        ChecksumValue { algorithm, hex }
    }

    /// Get the algorithm
    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    /// Get the hex string representation
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Whether two values were produced by the same algorithm over the same bytes.
    pub fn matches(&self, other: &ChecksumValue) -> bool {
        self.algorithm == other.algorithm && self.hex.eq_ignore_ascii_case(&other.hex)
    }
}

impl fmt::Display for ChecksumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex)
    }
}

/// Incremental hasher for one of the supported algorithms.
///
/// The copy loop feeds every chunk it writes through one of these, so the
/// source digest is known without reading the source a second time.
pub enum StreamHasher {
    Crc32(crc32fast::Hasher),
    Md5(md5::Context),
    Sha256(sha2::Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl StreamHasher {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Crc32 => StreamHasher::Crc32(crc32fast::Hasher::new()),
            ChecksumAlgorithm::Md5 => StreamHasher::Md5(md5::Context::new()),
            ChecksumAlgorithm::Sha256 => StreamHasher::Sha256(sha2::Sha256::default()),
            ChecksumAlgorithm::Blake3 => StreamHasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        match self {
            StreamHasher::Crc32(_) => ChecksumAlgorithm::Crc32,
            StreamHasher::Md5(_) => ChecksumAlgorithm::Md5,
            StreamHasher::Sha256(_) => ChecksumAlgorithm::Sha256,
            StreamHasher::Blake3(_) => ChecksumAlgorithm::Blake3,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            StreamHasher::Crc32(h) => h.update(data),
            StreamHasher::Md5(ctx) => ctx.consume(data),
            StreamHasher::Sha256(h) => sha2::Digest::update(h, data),
            StreamHasher::Blake3(h) => {
                h.update(data);
            }
        }
    }

    pub fn finalize(self) -> ChecksumValue {
        let algorithm = self.algorithm();
        let hex = match self {
            StreamHasher::Crc32(h) => format!("{:08x}", h.finalize()),
            StreamHasher::Md5(ctx) => format!("{:x}", ctx.compute()),
            StreamHasher::Sha256(h) => format!("{:x}", sha2::Digest::finalize(h)),
            StreamHasher::Blake3(h) => h.finalize().to_hex().to_string(),
        };
        ChecksumValue::new(algorithm, hex)
    }
}

/// Compute checksum for a file
pub fn compute_file_checksum(
    path: &Path,
    algorithm: ChecksumAlgorithm,
) -> Result<ChecksumValue, EngineError> {
    compute_file_checksum_with(path, algorithm, HASH_BUFFER_SIZE, |_| Ok(()))
}

/// Compute checksum for a file, calling `on_chunk` with the size of every
/// chunk read.
///
/// `on_chunk` is the suspension point of the computation: returning an error
/// (for instance on cancellation) aborts hashing with that error.
pub fn compute_file_checksum_with<F>(
    path: &Path,
    algorithm: ChecksumAlgorithm,
    buffer_size: usize,
    mut on_chunk: F,
) -> Result<ChecksumValue, EngineError>
where
    F: FnMut(u64) -> Result<(), EngineError>,
{
    let mut file = File::open(path).map_err(|e| EngineError::UnreadableSource {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut buffer = vec![0u8; buffer_size.max(1)];
    let mut hasher = StreamHasher::new(algorithm);
    loop {
        match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                hasher.update(&buffer[..n]);
                on_chunk(n as u64)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(EngineError::UnreadableSource {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        }
    }

    Ok(hasher.finalize())
}
