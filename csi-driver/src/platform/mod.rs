//! Platform operations for the CSI Node service
//!
//! Wraps the OS facilities the node plugin depends on: running external
//! tools, reading the mount table, formatting and mounting block devices.
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use crate::platform::{LinuxMounter, Mounter, SystemRunner};
//!
//! let mounter = LinuxMounter::new(Arc::new(SystemRunner));
//! mounter.format_and_mount("/dev/sdb", Path::new("/mnt/vol"), "ext4", &["rw".into()])?;
//! ```

pub mod exec;
mod linux;

use std::io;
use std::path::Path;

use thiserror::Error;

pub use exec::{CommandOutput, CommandRunner, SystemRunner, redact_args};
pub use linux::{DEFAULT_FS_TYPE, LinuxMounter, parse_mount_table, validate_fs_type};

/// Errors raised by platform operations.
#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("failed to execute {program}: {source}")]
    Exec {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} failed with exit code {code}: {stderr}")]
    CommandFailed {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("unsupported filesystem type '{0}': supported types are ext4, ext3 and xfs")]
    UnsupportedFs(String),

    #[error("could not parse {what}: {detail}")]
    Parse { what: &'static str, detail: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for platform operations
pub type PlatformResult<T> = Result<T, PlatformError>;

impl From<PlatformError> for tonic::Status {
    fn from(err: PlatformError) -> Self {
        match err {
            PlatformError::UnsupportedFs(_) => tonic::Status::invalid_argument(err.to_string()),
            _ => tonic::Status::internal(err.to_string()),
        }
    }
}

/// One line of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mount_point: String,
    pub fs_type: String,
    pub options: String,
}

/// Device mounted at a path and how many mount points share it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRefs {
    pub device: String,
    pub refs: usize,
}

/// Mount-table queries and filesystem operations.
///
/// Only [`Mounter::mounts`] has to be provided to answer the mount-point and
/// reference-count questions; the remaining methods touch the system.
pub trait Mounter: Send + Sync {
    /// Current mount table.
    fn mounts(&self) -> PlatformResult<Vec<MountEntry>>;

    /// Format `device` with `fs_type` when it carries no filesystem, then
    /// mount it at `target` with `options`.
    fn format_and_mount(
        &self,
        device: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> PlatformResult<()>;

    fn unmount(&self, target: &Path) -> PlatformResult<()>;

    /// Grow the filesystem on `device` (mounted at `mount_path`) to fill it.
    fn resize_filesystem(
        &self,
        device: &str,
        mount_path: &Path,
        fs_type: &str,
    ) -> PlatformResult<()>;

    /// Total size in bytes of the filesystem mounted at `path`.
    fn filesystem_capacity(&self, path: &Path) -> PlatformResult<i64>;

    /// Mount table entry whose mount point is `path`.
    fn find_mount(&self, path: &Path) -> PlatformResult<Option<MountEntry>> {
        let wanted = normalize_mount_point(path);
        Ok(self
            .mounts()?
            .into_iter()
            .rev()
            .find(|entry| entry.mount_point == wanted))
    }

    fn is_mount_point(&self, path: &Path) -> PlatformResult<bool> {
        Ok(self.find_mount(path)?.is_some())
    }

    /// Device mounted at `path` and the number of mount points using it,
    /// `None` when `path` is not a mount point.
    fn mount_refs(&self, path: &Path) -> PlatformResult<Option<MountRefs>> {
        let wanted = normalize_mount_point(path);
        let mounts = self.mounts()?;

        let Some(device) = mounts
            .iter()
            .rev()
            .find(|entry| entry.mount_point == wanted)
            .map(|entry| entry.device.clone())
        else {
            return Ok(None);
        };

        let refs = mounts.iter().filter(|entry| entry.device == device).count();
        Ok(Some(MountRefs { device, refs }))
    }
}

/// Mount point string as it appears in the mount table (no trailing slash).
pub fn normalize_mount_point(path: &Path) -> String {
    let s = path.to_string_lossy();
    let trimmed = s.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}
