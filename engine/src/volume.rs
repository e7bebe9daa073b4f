//! Removable volume detection.
//!
//! A [`VolumeProbe`] lists mounted volumes; the [`VolumeWatcher`] diffs
//! successive probes into attach/detach events and tracks the single active
//! volume. The active volume is handed out as a [`VolumeHandle`], an explicit
//! handle shared with the catalog and executor rather than process-wide state.
//! Detaching a volume flips the handle's flag so an in-flight transfer fails
//! fast at its next chunk boundary.

use crossbeam_channel::{unbounded, Receiver};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::model::{Volume, VolumeId};

/// Source of the currently mounted volumes.
pub trait VolumeProbe: Send {
    /// All mounted volumes, removable or not.
    fn mounted_volumes(&self) -> Result<Vec<Volume>, EngineError>;
}

/// Native disk enumeration through `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl VolumeProbe for SystemProbe {
    fn mounted_volumes(&self) -> Result<Vec<Volume>, EngineError> {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        Ok(disks
            .list()
            .iter()
            .map(|disk| {
                Volume::new(
                    disk.name().to_string_lossy(),
                    disk.mount_point(),
                    disk.file_system().to_string_lossy(),
                    disk.total_space(),
                    disk.available_space(),
                    disk.is_removable(),
                )
            })
            .collect())
    }
}

/// Coarse fallback: every directory below a mount parent is a removable volume.
#[derive(Debug, Clone)]
pub struct MountDirProbe {
    parents: Vec<PathBuf>,
}

impl MountDirProbe {
    pub fn new(parents: Vec<PathBuf>) -> Self {
        MountDirProbe { parents }
    }

    /// Conventional mount parents for removable media on this OS.
    pub fn platform_default() -> Self {
        let mut parents = Vec::new();
        if cfg!(target_os = "macos") {
            parents.push(PathBuf::from("/Volumes"));
        } else if cfg!(unix) {
            if let Ok(user) = std::env::var("USER") {
                parents.push(PathBuf::from("/media").join(&user));
                parents.push(PathBuf::from("/run/media").join(&user));
            }
            parents.push(PathBuf::from("/mnt"));
        }
        MountDirProbe { parents }
    }
}

impl VolumeProbe for MountDirProbe {
    fn mounted_volumes(&self) -> Result<Vec<Volume>, EngineError> {
        let mut volumes = Vec::new();
        for parent in &self.parents {
            let entries = match std::fs::read_dir(parent) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                // macOS links the boot volume into /Volumes
                if std::fs::canonicalize(&path).map(|p| p == Path::new("/")).unwrap_or(false) {
                    continue;
                }
                let label = entry.file_name().to_string_lossy().into_owned();
                volumes.push(Volume::new(label, path, "", 0, 0, true));
            }
        }
        Ok(volumes)
    }
}

/// Attach/detach notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeEvent {
    /// A removable volume appeared
    Attached(Volume),
    /// A known volume disappeared or became unreadable
    Detached(Volume),
    /// The volume became the active one
    Activated(Volume),
}

/// Shared handle to a volume.
///
/// Cloning shares the detached and held flags.
#[derive(Debug, Clone)]
pub struct VolumeHandle {
    volume: Arc<Volume>,
    detached: Arc<AtomicBool>,
    held: Arc<AtomicBool>,
}

impl VolumeHandle {
    pub fn new(volume: Volume) -> Self {
        VolumeHandle {
            volume: Arc::new(volume),
            detached: Arc::new(AtomicBool::new(false)),
            held: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle for a plain directory (explicit source path, tests).
    pub fn for_directory(root: impl Into<PathBuf>) -> Self {
        Self::new(Volume::from_directory(root))
    }

    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    pub fn id(&self) -> &VolumeId {
        &self.volume.id
    }

    pub fn root(&self) -> &Path {
        &self.volume.root
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    /// Flag the volume as gone. Irreversible for this handle.
    pub fn mark_detached(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }

    /// Fail with `VolumeUnavailable` once the volume is detached or its root vanished.
    pub fn ensure_available(&self) -> Result<(), EngineError> {
        if self.is_detached() || !self.volume.root.is_dir() {
            return Err(EngineError::VolumeUnavailable {
                root: self.volume.root.clone(),
            });
        }
        Ok(())
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// Claim the volume for a session. Fails if another session holds it.
    pub fn hold(&self) -> Result<VolumeLease, EngineError> {
        self.held
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| EngineError::SessionBusy)?;
        Ok(VolumeLease {
            handle: self.clone(),
        })
    }
}

/// Exclusive claim on a volume, released on drop.
#[derive(Debug)]
pub struct VolumeLease {
    handle: VolumeHandle,
}

impl VolumeLease {
    pub fn handle(&self) -> &VolumeHandle {
        &self.handle
    }
}

impl Drop for VolumeLease {
    fn drop(&mut self) {
        self.handle.held.store(false, Ordering::SeqCst);
    }
}

/// Check that a mount root can still be listed.
pub fn is_volume_readable(root: &Path) -> bool {
    std::fs::read_dir(root).is_ok()
}

/// Tracks removable volumes and the single active one.
pub struct VolumeWatcher<P: VolumeProbe> {
    probe: P,
    known: BTreeMap<PathBuf, VolumeHandle>,
    active: Option<VolumeHandle>,
}

impl<P: VolumeProbe> VolumeWatcher<P> {
    pub fn new(probe: P) -> Self {
        VolumeWatcher {
            probe,
            known: BTreeMap::new(),
            active: None,
        }
    }

    /// Compare the probe's view with the known set and report changes.
    ///
    /// Non-removable volumes are ignored. If no volume is active afterwards,
    /// the first known candidate (by mount point) is activated.
    pub fn poll(&mut self) -> Result<Vec<VolumeEvent>, EngineError> {
        let mut current = BTreeMap::new();
        for volume in self.probe.mounted_volumes()? {
            if !volume.removable {
                continue;
            }
            current.insert(volume.root.clone(), volume);
        }

        let mut events = Vec::new();

        let gone: Vec<PathBuf> = self
            .known
            .keys()
            .filter(|root| !current.contains_key(*root) || !is_volume_readable(root))
            .cloned()
            .collect();
        for root in gone {
            if let Some(handle) = self.known.remove(&root) {
                handle.mark_detached();
                info!("Volume detached: {} at {}", handle.volume().label, root.display());
                if self.active.as_ref().map(|a| a.root() == root).unwrap_or(false) {
                    self.active = None;
                }
                events.push(VolumeEvent::Detached(handle.volume().clone()));
            }
        }

        for (root, volume) in current {
            if self.known.contains_key(&root) || !is_volume_readable(&root) {
                continue;
            }
            info!("Volume attached: {} at {}", volume.label, root.display());
            events.push(VolumeEvent::Attached(volume.clone()));
            self.known.insert(root, VolumeHandle::new(volume));
        }

        if self.active.is_none() {
            if let Some(handle) = self.known.values().next().cloned() {
                debug!("Activating volume {}", handle.root().display());
                events.push(VolumeEvent::Activated(handle.volume().clone()));
                self.active = Some(handle);
            }
        }

        Ok(events)
    }

    /// Known removable volumes.
    pub fn candidates(&self) -> Vec<Volume> {
        self.known.values().map(|h| h.volume().clone()).collect()
    }

    pub fn active(&self) -> Option<VolumeHandle> {
        self.active.clone()
    }

    /// Make a specific candidate the active volume.
    ///
    /// Refused while the current active volume is held by a session.
    pub fn activate(&mut self, id: &VolumeId) -> Result<VolumeHandle, EngineError> {
        if let Some(active) = &self.active {
            if active.id() == id {
                return Ok(active.clone());
            }
            if active.is_held() {
                return Err(EngineError::SessionBusy);
            }
        }
        let handle = self
            .known
            .values()
            .find(|h| h.id() == id)
            .cloned()
            .ok_or_else(|| EngineError::InvalidPath {
                path: PathBuf::new(),
                reason: format!("no attached volume with id {}", id),
            })?;
        self.active = Some(handle.clone());
        Ok(handle)
    }

    /// End the active session explicitly. Refused while a session holds it.
    pub fn release(&mut self) -> Result<(), EngineError> {
        if self.active.as_ref().map(|a| a.is_held()).unwrap_or(false) {
            return Err(EngineError::SessionBusy);
        }
        self.active = None;
        Ok(())
    }
}

impl<P: VolumeProbe + 'static> VolumeWatcher<P> {
    /// Poll on a background thread every `interval`, forwarding events.
    pub fn spawn(self, interval: Duration) -> WatcherHandle<P> {
        let shared = Arc::new(Mutex::new(self));
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = unbounded();

        let thread = {
            let shared = Arc::clone(&shared);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    let result = shared
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .poll();
                    match result {
                        Ok(events) => {
                            for event in events {
                                if tx.send(event).is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => warn!("Error checking for volume changes: {}", e),
                    }
                    std::thread::sleep(interval);
                }
            })
        };

        WatcherHandle {
            shared,
            events: rx,
            stop,
            thread: Some(thread),
        }
    }
}

/// Background watcher; stops when dropped.
pub struct WatcherHandle<P: VolumeProbe> {
    shared: Arc<Mutex<VolumeWatcher<P>>>,
    events: Receiver<VolumeEvent>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl<P: VolumeProbe> WatcherHandle<P> {
    pub fn events(&self) -> &Receiver<VolumeEvent> {
        &self.events
    }

    pub fn active(&self) -> Option<VolumeHandle> {
        self.lock().active()
    }

    pub fn candidates(&self) -> Vec<Volume> {
        self.lock().candidates()
    }

    pub fn activate(&self, id: &VolumeId) -> Result<VolumeHandle, EngineError> {
        self.lock().activate(id)
    }

    pub fn release(&self) -> Result<(), EngineError> {
        self.lock().release()
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VolumeWatcher<P>> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl<P: VolumeProbe> Drop for WatcherHandle<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
