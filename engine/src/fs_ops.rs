//! Filesystem operations module.
//!
//! This module provides low-level operations for:
//! - Creating destination directories (idempotent, race tolerant)
//! - Streaming a source file into a temporary destination file chunk by chunk,
//!   with reads on a separate thread so a hung source surfaces as a stall
//! - Promoting a verified temporary file to its final name
//! - Recognising and sweeping temporary leftovers of crashed sessions

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::checksums::StreamHasher;
use crate::error::EngineError;

/// Suffix carried by every in-flight copy.
pub const TEMP_SUFFIX: &str = ".offload-partial";

/// Temporary path used while copying to `final_path`.
///
/// The temporary file sits next to the final one (same directory, so the
/// final rename never crosses file systems) and is hidden on Unix.
pub fn temporary_path_for(final_path: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    final_path.with_file_name(format!(".{}{}", name, TEMP_SUFFIX))
}

/// True if `path` names an engine temporary file.
pub fn is_temporary(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().ends_with(TEMP_SUFFIX))
        .unwrap_or(false)
}

/// Delete temporary files left under `root` by an interrupted session.
///
/// Returns the removed paths. A missing root is not an error.
pub fn sweep_temporaries(root: &Path) -> Result<Vec<PathBuf>, EngineError> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut removed = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry while sweeping {}: {}", root.display(), e);
                continue;
            }
        };
        if entry.file_type().is_file() && is_temporary(entry.path()) {
            fs::remove_file(entry.path()).map_err(|e| EngineError::WriteFailure {
                path: entry.path().to_path_buf(),
                source: e,
            })?;
            debug!("Removed stale temporary file {}", entry.path().display());
            removed.push(entry.path().to_path_buf());
        }
    }
    Ok(removed)
}

/// Ensure the parent directory of a path exists, creating it if necessary.
///
/// Safe to call concurrently for the same directory.
///
/// # Errors
/// Returns `WriteFailure` if the parent exists as a file or cannot be created.
pub fn ensure_parent_dir_exists(path: &Path) -> Result<(), EngineError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => return Ok(()),
    };

    match fs::metadata(parent) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(EngineError::WriteFailure {
            path: parent.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                "Parent path exists but is not a directory",
            ),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            // create_dir_all tolerates another writer creating the same tree
            fs::create_dir_all(parent).map_err(|e| EngineError::WriteFailure {
                path: parent.to_path_buf(),
                source: e,
            })
        }
        Err(e) => Err(EngineError::WriteFailure {
            path: parent.to_path_buf(),
            source: e,
        }),
    }
}

/// Parameters for [`copy_to_temporary`].
pub struct CopyParams<'a> {
    pub source: &'a Path,
    pub temporary: &'a Path,
    pub chunk_size: usize,
    pub stall_timeout: Duration,
}

/// Chunks read ahead of the writer.
const READ_AHEAD_CHUNKS: usize = 4;

/// Longest wait between two interruption checks while the source is silent.
const WAIT_SLICE: Duration = Duration::from_millis(50);

enum ReadEvent {
    Chunk(Vec<u8>),
    Eof,
    Failed(io::Error),
}

/// Read `source` on its own thread so a blocked read cannot block the caller.
///
/// A reader stuck in the OS is abandoned; it exits once its read returns and
/// the receiver is gone.
fn spawn_reader(source: &Path, chunk_size: usize) -> Result<Receiver<ReadEvent>, EngineError> {
    let (tx, rx) = bounded(READ_AHEAD_CHUNKS);
    let path = source.to_path_buf();
    std::thread::Builder::new()
        .name("offload-reader".to_string())
        .spawn(move || {
            let mut file = match fs::File::open(&path) {
                Ok(file) => file,
                Err(e) => {
                    let _ = tx.send(ReadEvent::Failed(e));
                    return;
                }
            };
            loop {
                let mut buffer = vec![0u8; chunk_size];
                match file.read(&mut buffer) {
                    Ok(0) => {
                        let _ = tx.send(ReadEvent::Eof);
                        return;
                    }
                    Ok(n) => {
                        buffer.truncate(n);
                        if tx.send(ReadEvent::Chunk(buffer)).is_err() {
                            return;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        let _ = tx.send(ReadEvent::Failed(e));
                        return;
                    }
                }
            }
        })
        .map_err(|e| EngineError::Internal(format!("cannot start source reader: {}", e)))?;
    Ok(rx)
}

/// Stream `source` into `temporary`, feeding every chunk to `hasher`.
///
/// `on_chunk` is called after each chunk is written with the chunk's size.
/// `interrupted` is polled while waiting for the source to deliver. Both are
/// suspension points where cancellation and volume loss are observed, and an
/// error from either stops the copy. Waiting longer than `stall_timeout` for
/// a chunk, or writing one for longer than that, fails with
/// [`EngineError::Stalled`].
///
/// The temporary file is left in place on error; the caller removes it.
///
/// # Returns
/// Number of bytes copied
pub fn copy_to_temporary<F, I>(
    params: &CopyParams<'_>,
    hasher: &mut StreamHasher,
    mut on_chunk: F,
    mut interrupted: I,
) -> Result<u64, EngineError>
where
    F: FnMut(u64) -> Result<(), EngineError>,
    I: FnMut() -> Result<(), EngineError>,
{
    let mut dst_file = fs::File::create(params.temporary).map_err(|e| EngineError::WriteFailure {
        path: params.temporary.to_path_buf(),
        source: e,
    })?;
    let chunks = spawn_reader(params.source, params.chunk_size.max(1))?;
    let wait_slice = params.stall_timeout.min(WAIT_SLICE);

    let mut copied = 0u64;
    let mut waiting_since = Instant::now();
    loop {
        let data = match chunks.recv_timeout(wait_slice) {
            Ok(ReadEvent::Chunk(data)) => data,
            Ok(ReadEvent::Eof) => break,
            Ok(ReadEvent::Failed(e)) => {
                return Err(EngineError::UnreadableSource {
                    path: params.source.to_path_buf(),
                    source: e,
                })
            }
            Err(RecvTimeoutError::Timeout) => {
                interrupted()?;
                let elapsed = waiting_since.elapsed();
                if elapsed > params.stall_timeout {
                    return Err(EngineError::Stalled {
                        path: params.source.to_path_buf(),
                        elapsed,
                    });
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(EngineError::Internal(format!(
                    "reader of {} stopped without reaching the end",
                    params.source.display()
                )))
            }
        };

        let write_started = Instant::now();
        dst_file.write_all(&data).map_err(|e| EngineError::WriteFailure {
            path: params.temporary.to_path_buf(),
            source: e,
        })?;
        let elapsed = write_started.elapsed();
        if elapsed > params.stall_timeout {
            return Err(EngineError::Stalled {
                path: params.temporary.to_path_buf(),
                elapsed,
            });
        }

        hasher.update(&data);
        copied += data.len() as u64;
        on_chunk(data.len() as u64)?;
        waiting_since = Instant::now();
    }

    dst_file.sync_all().map_err(|e| EngineError::WriteFailure {
        path: params.temporary.to_path_buf(),
        source: e,
    })?;

    Ok(copied)
}

/// Move a verified temporary file to its final name.
///
/// Refuses to replace a file that appeared at `final_path` after planning.
pub fn promote_temporary(temporary: &Path, final_path: &Path) -> Result<(), EngineError> {
    if final_path.exists() {
        return Err(EngineError::WriteFailure {
            path: final_path.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::AlreadyExists,
                "Destination appeared after planning",
            ),
        });
    }
    fs::rename(temporary, final_path).map_err(|e| EngineError::WriteFailure {
        path: final_path.to_path_buf(),
        source: e,
    })
}

/// Copy a modification time onto `path`. Failure is logged, not returned.
pub fn preserve_modified_time(path: &Path, modified: SystemTime) {
    if let Err(e) = filetime::set_file_mtime(path, filetime::FileTime::from_system_time(modified)) {
        warn!("Could not set modification time on {}: {}", path.display(), e);
    }
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksums::{compute_file_checksum, ChecksumAlgorithm, StreamHasher};

    fn params<'a>(source: &'a Path, temporary: &'a Path, chunk_size: usize) -> CopyParams<'a> {
        CopyParams {
            source,
            temporary,
            chunk_size,
            stall_timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_temporary_path_naming() {
        let tmp = temporary_path_for(Path::new("/photos/2024/03/IMG0001.jpg"));
        assert_eq!(tmp, PathBuf::from("/photos/2024/03/.IMG0001.jpg.offload-partial"));
        assert!(is_temporary(&tmp));
        assert!(!is_temporary(Path::new("/photos/2024/03/IMG0001.jpg")));
    }

    #[test]
    fn test_copy_to_temporary_streams_and_hashes() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("source.jpg");
        let tmp = temp_dir.path().join(".dest.jpg.offload-partial");
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&src, &data).expect("Failed to write source");

        let mut hasher = StreamHasher::new(ChecksumAlgorithm::Sha256);
        let mut chunks = Vec::new();
        let bytes = copy_to_temporary(
            &params(&src, &tmp, 4096),
            &mut hasher,
            |n| {
                chunks.push(n);
                Ok(())
            },
            || Ok(()),
        )
        .expect("Copy should succeed");

        assert_eq!(bytes, 10_000);
        assert_eq!(chunks, vec![4096, 4096, 1808]);
        assert_eq!(fs::read(&tmp).expect("Failed to read temp"), data);
        assert_eq!(
            hasher.finalize(),
            compute_file_checksum(&src, ChecksumAlgorithm::Sha256).unwrap()
        );
    }

    #[test]
    fn test_copy_to_temporary_stops_when_hook_fails() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("source.mov");
        let tmp = temp_dir.path().join(".dest.mov.offload-partial");
        fs::write(&src, vec![0u8; 8192]).expect("Failed to write source");

        let mut hasher = StreamHasher::new(ChecksumAlgorithm::Crc32);
        let mut calls = 0;
        let result = copy_to_temporary(
            &params(&src, &tmp, 1024),
            &mut hasher,
            |_| {
                calls += 1;
                Err(EngineError::Cancelled)
            },
            || Ok(()),
        );

        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert_eq!(calls, 1, "Cancellation latency is one chunk");
    }

    #[test]
    fn test_copy_missing_source_is_unreadable() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("missing.jpg");
        let tmp = temp_dir.path().join(".x.offload-partial");
        let mut hasher = StreamHasher::new(ChecksumAlgorithm::Crc32);
        let result = copy_to_temporary(&params(&src, &tmp, 1024), &mut hasher, |_| Ok(()), || Ok(()));
        assert!(matches!(result, Err(EngineError::UnreadableSource { .. })));
    }

    #[cfg(unix)]
    fn make_fifo(path: &Path) {
        let status = std::process::Command::new("mkfifo")
            .arg(path)
            .status()
            .expect("Failed to run mkfifo");
        assert!(status.success(), "mkfifo failed");
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_reports_hung_source_as_stalled() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("clip.mts");
        let tmp = temp_dir.path().join(".clip.mts.offload-partial");
        make_fifo(&src);

        // Sends a few bytes, then holds the pipe open without writing
        let writer_path = src.clone();
        std::thread::spawn(move || {
            let mut pipe = fs::OpenOptions::new()
                .write(true)
                .open(&writer_path)
                .expect("Failed to open fifo");
            pipe.write_all(&[7u8; 10]).expect("Failed to write fifo");
            std::thread::sleep(Duration::from_secs(3));
        });

        let copy = CopyParams {
            stall_timeout: Duration::from_millis(100),
            ..params(&src, &tmp, 1024)
        };
        let mut hasher = StreamHasher::new(ChecksumAlgorithm::Crc32);
        let mut copied = 0;
        let started = Instant::now();
        let result = copy_to_temporary(
            &copy,
            &mut hasher,
            |n| {
                copied += n;
                Ok(())
            },
            || Ok(()),
        );

        assert!(matches!(result, Err(EngineError::Stalled { .. })), "got {:?}", result);
        assert_eq!(copied, 10);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_observes_cancel_while_source_is_silent() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("clip.mts");
        let tmp = temp_dir.path().join(".clip.mts.offload-partial");
        make_fifo(&src);

        let mut hasher = StreamHasher::new(ChecksumAlgorithm::Crc32);
        let mut polls = 0;
        let started = Instant::now();
        let result = copy_to_temporary(
            &params(&src, &tmp, 1024),
            &mut hasher,
            |_| Ok(()),
            || {
                polls += 1;
                if polls >= 2 {
                    Err(EngineError::Cancelled)
                } else {
                    Ok(())
                }
            },
        );

        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_promote_refuses_to_clobber() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let tmp = temp_dir.path().join(".a.jpg.offload-partial");
        let dst = temp_dir.path().join("a.jpg");
        fs::write(&tmp, b"new").expect("Failed to write temp");
        fs::write(&dst, b"old").expect("Failed to write dest");

        assert!(promote_temporary(&tmp, &dst).is_err());
        assert_eq!(fs::read(&dst).unwrap(), b"old");

        fs::remove_file(&dst).unwrap();
        promote_temporary(&tmp, &dst).expect("Promote should succeed");
        assert_eq!(fs::read(&dst).unwrap(), b"new");
        assert!(!tmp.exists());
    }

    #[test]
    fn test_ensure_parent_dir_exists() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("2024").join("03").join("IMG0001.jpg");

        ensure_parent_dir_exists(&path).expect("Failed to create parent");
        assert!(path.parent().unwrap().is_dir());

        // Idempotent
        ensure_parent_dir_exists(&path).expect("Second call should succeed");
    }

    #[test]
    fn test_ensure_parent_dir_rejects_file_parent() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let blocker = temp_dir.path().join("2024");
        fs::write(&blocker, b"not a dir").unwrap();
        let result = ensure_parent_dir_exists(&blocker.join("IMG0001.jpg"));
        assert!(matches!(result, Err(EngineError::WriteFailure { .. })));
    }

    #[test]
    fn test_sweep_temporaries() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let nested = temp_dir.path().join("2024").join("03");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join(".IMG0001.jpg.offload-partial"), b"half").unwrap();
        fs::write(nested.join("IMG0002.jpg"), b"done").unwrap();

        let removed = sweep_temporaries(temp_dir.path()).expect("Sweep should succeed");
        assert_eq!(removed.len(), 1);
        assert!(nested.join("IMG0002.jpg").exists());
        assert!(!nested.join(".IMG0001.jpg.offload-partial").exists());

        let removed = sweep_temporaries(&temp_dir.path().join("absent")).unwrap();
        assert!(removed.is_empty());
    }

    #[test]
    fn test_preserve_modified_time() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("a.jpg");
        fs::write(&path, b"x").unwrap();
        let when = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        preserve_modified_time(&path, when);
        assert_eq!(fs::metadata(&path).unwrap().modified().unwrap(), when);
    }
}
