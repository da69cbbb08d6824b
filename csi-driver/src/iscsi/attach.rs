//! Attach/detach orchestration for one volume on one node.
//!
//! Attach: connect sessions, record the multipath alias, persist the
//! connector, then format and mount. Detach walks the same steps backwards
//! and stops as soon as the mounted device is still referenced elsewhere.
//!
//! Calls for the same volume are expected to be serialized by the caller.

use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::connector::{Connector, is_multipath_device};
use super::disk::IscsiDisk;
use super::error::{IscsiError, Result};
use super::persist::ConnectorStore;
use super::session::SessionConnector;
use crate::platform::Mounter;

const TARGET_DIR_MODE: u32 = 0o750;

/// Everything needed to publish one volume at one target path.
#[derive(Debug, Clone)]
pub struct MountRequest {
    pub disk: IscsiDisk,
    pub connector: Connector,
    pub target_path: PathBuf,
    pub fs_type: String,
    pub mount_flags: Vec<String>,
    pub read_only: bool,
}

impl MountRequest {
    pub fn new(
        disk: IscsiDisk,
        target_path: impl Into<PathBuf>,
        fs_type: impl Into<String>,
        mount_flags: Vec<String>,
        read_only: bool,
    ) -> Result<Self> {
        let connector = Connector::from_disk(&disk)?;
        Ok(Self {
            disk,
            connector,
            target_path: target_path.into(),
            fs_type: fs_type.into(),
            mount_flags,
            read_only,
        })
    }

    /// `ro`/`rw` followed by the caller's flags.
    pub fn mount_options(&self) -> Vec<String> {
        let mode = if self.read_only { "ro" } else { "rw" };
        std::iter::once(mode.to_string())
            .chain(
                self.mount_flags
                    .iter()
                    .filter(|flag| flag.as_str() != "ro" && flag.as_str() != "rw")
                    .cloned(),
            )
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmountRequest {
    pub volume_name: String,
    pub target_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachOutcome {
    Mounted { device: String },
    /// Target path was already a mount point; nothing was mounted.
    AlreadyMounted { device: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachOutcome {
    /// Target path did not exist.
    AlreadyClean,
    /// No connector file; the volume was detached earlier.
    AlreadyDetached,
    /// Unmounted, but the device is still mounted at this many other paths.
    StillInUse(usize),
    Detached,
}

/// Drives a volume through connect, persist, mount and back.
pub struct VolumeAttacher {
    sessions: Arc<dyn SessionConnector>,
    mounter: Arc<dyn Mounter>,
    store: ConnectorStore,
}

impl VolumeAttacher {
    pub fn new(
        sessions: Arc<dyn SessionConnector>,
        mounter: Arc<dyn Mounter>,
        store: ConnectorStore,
    ) -> Self {
        Self {
            sessions,
            mounter,
            store,
        }
    }

    pub fn store(&self) -> &ConnectorStore {
        &self.store
    }

    pub fn sessions(&self) -> &Arc<dyn SessionConnector> {
        &self.sessions
    }

    pub fn mounter(&self) -> &Arc<dyn Mounter> {
        &self.mounter
    }

    pub fn attach_disk(&self, request: &MountRequest) -> Result<AttachOutcome> {
        let mut connector = request.connector.clone();
        let volume = connector.volume_name.clone();
        let target = request.target_path.as_path();

        let device = self.sessions.connect(&connector)?;

        if is_multipath_device(&device) {
            connector.set_multipath_device(&device)?;
        }

        let path = self.store.persist(&connector)?;
        debug!(volume = %volume, path = %path.display(), "Connector persisted");

        let mounted = self
            .mounter
            .is_mount_point(target)
            .map_err(|source| mount_err(&device, target, source))?;
        if mounted {
            info!(volume = %volume, target = %target.display(), "Volume already mounted");
            return Ok(AttachOutcome::AlreadyMounted { device });
        }

        DirBuilder::new()
            .recursive(true)
            .mode(TARGET_DIR_MODE)
            .create(target)
            .map_err(|e| mount_err(&device, target, e.into()))?;

        let options = request.mount_options();
        self.mounter
            .format_and_mount(&device, target, &request.fs_type, &options)
            .map_err(|source| mount_err(&device, target, source))?;

        info!(
            volume = %volume,
            device = %device,
            target = %target.display(),
            fs_type = %request.fs_type,
            read_only = request.read_only,
            "Volume mounted"
        );
        Ok(AttachOutcome::Mounted { device })
    }

    pub fn detach_disk(&self, request: &UnmountRequest) -> Result<DetachOutcome> {
        let volume = request.volume_name.as_str();
        let target = request.target_path.as_path();

        match fs::symlink_metadata(target) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(volume = %volume, target = %target.display(), "Target path absent, nothing to detach");
                return Ok(DetachOutcome::AlreadyClean);
            }
            Err(e) => return Err(IscsiError::Io(e)),
        }

        let mount = self
            .mounter
            .mount_refs(target)
            .map_err(|source| unmount_err(target, source))?;

        let connector = match self.store.load(volume) {
            Ok(connector) => connector,
            Err(IscsiError::NotFound(path)) => {
                warn!(volume = %volume, path = %path, "No connector file, volume already detached");
                return Ok(DetachOutcome::AlreadyDetached);
            }
            Err(e) => return Err(e),
        };

        let remaining = match &mount {
            Some(refs) => {
                self.mounter
                    .unmount(target)
                    .map_err(|source| unmount_err(target, source))?;
                debug!(volume = %volume, device = %refs.device, target = %target.display(), "Unmounted");
                refs.refs.saturating_sub(1)
            }
            None => self.device_mounts(&connector, target)?,
        };

        if remaining > 0 {
            info!(
                volume = %volume,
                remaining,
                "Device still mounted elsewhere, keeping session"
            );
            if let Err(e) = fs::remove_dir(target) {
                warn!(target = %target.display(), error = %e, "Failed to remove target directory");
            }
            return Ok(DetachOutcome::StillInUse(remaining));
        }

        self.sessions.disconnect_volume(&connector)?;

        let portals = self.unshared_portals(&connector);
        if portals.len() < connector.target_portals.len() {
            info!(
                volume = %volume,
                target_iqn = %connector.target_iqn,
                kept = connector.target_portals.len() - portals.len(),
                "Keeping sessions shared with other volumes"
            );
        }
        if !portals.is_empty() {
            self.sessions.disconnect(&connector.target_iqn, &portals);
        }

        if let Err(e) = fs::remove_dir(target) {
            warn!(target = %target.display(), error = %e, "Failed to remove target directory");
        }

        self.store.remove(volume)?;

        info!(volume = %volume, target_iqn = %connector.target_iqn, "Volume detached");
        Ok(DetachOutcome::Detached)
    }

    /// Mount-table entries backed by any device of the attachment.
    fn device_mounts(&self, connector: &Connector, target: &Path) -> Result<usize> {
        let devices = self.sessions.devices(connector);
        if devices.is_empty() {
            return Ok(0);
        }
        let mounts = self
            .mounter
            .mounts()
            .map_err(|source| unmount_err(target, source))?;
        Ok(mounts
            .iter()
            .filter(|entry| devices.contains(&entry.device))
            .count())
    }

    /// Portals of `connector` that no other persisted connector for the
    /// same IQN still uses.
    fn unshared_portals(&self, connector: &Connector) -> Vec<String> {
        let others = match self.store.list() {
            Ok(others) => others,
            Err(e) => {
                warn!(error = %e, "Could not list connectors, logging out of every portal");
                Vec::new()
            }
        };

        connector
            .target_portals
            .iter()
            .filter(|portal| {
                !others.iter().any(|other| {
                    other.volume_name != connector.volume_name
                        && other.target_iqn == connector.target_iqn
                        && other.target_portals.contains(portal)
                })
            })
            .cloned()
            .collect()
    }
}

fn mount_err(device: &str, target: &Path, source: crate::platform::PlatformError) -> IscsiError {
    IscsiError::Mount {
        device: device.to_string(),
        target: target.display().to_string(),
        source,
    }
}

fn unmount_err(target: &Path, source: crate::platform::PlatformError) -> IscsiError {
    IscsiError::Unmount {
        target: target.display().to_string(),
        source,
    }
}
