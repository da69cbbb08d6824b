//! Connector persistence.
//!
//! One JSON file per volume at `<run_dir>/iscsi-<volume>.json`, written
//! atomically so a crash never leaves a half-written connector behind.

use std::fs::{self, DirBuilder, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::connector::Connector;
use super::error::{IscsiError, Result};

const FILE_PREFIX: &str = "iscsi-";
const FILE_SUFFIX: &str = ".json";
const FILE_MODE: u32 = 0o600;
const DIR_MODE: u32 = 0o750;

/// Serialize `connector` to `path` atomically with mode 0600.
pub fn persist_connector(connector: &Connector, path: &Path) -> Result<()> {
    let persist_err = |source: io::Error| IscsiError::Persist {
        volume: connector.volume_name.clone(),
        path: path.display().to_string(),
        source,
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(dir)
        .map_err(persist_err)?;

    let content = serde_json::to_vec_pretty(connector).map_err(|e| persist_err(e.into()))?;

    // Write atomically via unique temp file in the same directory
    let mut temp_file = NamedTempFile::new_in(dir).map_err(persist_err)?;
    temp_file
        .as_file()
        .set_permissions(Permissions::from_mode(FILE_MODE))
        .map_err(persist_err)?;
    temp_file.write_all(&content).map_err(persist_err)?;
    temp_file.as_file().sync_all().map_err(persist_err)?;

    temp_file.persist(path).map_err(|e| persist_err(e.error))?;

    debug!(volume = %connector.volume_name, path = %path.display(), "Persisted connector");
    Ok(())
}

/// Read a connector written by [`persist_connector`].
///
/// A missing file is reported as [`IscsiError::NotFound`] so callers can
/// treat it as already cleaned up.
pub fn load_connector(path: &Path) -> Result<Connector> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(IscsiError::NotFound(path.display().to_string()));
        }
        Err(e) => return Err(IscsiError::Io(e)),
    };

    serde_json::from_str(&content).map_err(|source| IscsiError::CorruptConnector {
        path: path.display().to_string(),
        source,
    })
}

/// Per-volume connector files under one runtime directory.
#[derive(Debug, Clone)]
pub struct ConnectorStore {
    run_dir: PathBuf,
}

impl ConnectorStore {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
        }
    }

    /// Store rooted at `/var/run/<driver_name>`.
    pub fn for_driver(driver_name: &str) -> Self {
        Self::new(Path::new("/var/run").join(driver_name))
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Path of the connector file for `volume_name`.
    pub fn path_for(&self, volume_name: &str) -> Result<PathBuf> {
        if volume_name.is_empty()
            || volume_name.contains('/')
            || volume_name.contains('\0')
            || volume_name.contains("..")
        {
            return Err(IscsiError::InvalidArgument(format!(
                "volume name '{}' cannot be used as a file name",
                volume_name.escape_debug()
            )));
        }
        Ok(self
            .run_dir
            .join(format!("{}{}{}", FILE_PREFIX, volume_name, FILE_SUFFIX)))
    }

    pub fn persist(&self, connector: &Connector) -> Result<PathBuf> {
        let path = self.path_for(&connector.volume_name)?;
        persist_connector(connector, &path)?;
        Ok(path)
    }

    pub fn load(&self, volume_name: &str) -> Result<Connector> {
        load_connector(&self.path_for(volume_name)?)
    }

    /// Delete the connector file; an already absent file is not an error.
    pub fn remove(&self, volume_name: &str) -> Result<()> {
        let path = self.path_for(volume_name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Connector file already removed");
                Ok(())
            }
            Err(e) => Err(IscsiError::Io(e)),
        }
    }

    /// All readable connectors in the store. Corrupt files are skipped with a
    /// warning.
    pub fn list(&self) -> Result<Vec<Connector>> {
        let entries = match fs::read_dir(&self.run_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(IscsiError::Io(e)),
        };

        let mut connectors = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with(FILE_PREFIX) || !name.ends_with(FILE_SUFFIX) {
                continue;
            }

            match load_connector(&entry.path()) {
                Ok(connector) => connectors.push(connector),
                // Removed between read_dir and open
                Err(IscsiError::NotFound(_)) => {}
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "Skipping unreadable connector")
                }
            }
        }

        Ok(connectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iscsi::connector::{DEFAULT_INTERFACE, Secrets};

    fn connector(volume: &str) -> Connector {
        Connector {
            volume_name: volume.to_string(),
            target_iqn: "iqn.2025-01.test:vol1".to_string(),
            target_portals: vec!["10.0.0.5:3260".to_string(), "[fd00::5]:3260".to_string()],
            lun: 2,
            do_chap_discovery: true,
            discovery_secrets: Secrets {
                username: "disc-user".to_string(),
                password: "disc-pass".to_string(),
                username_in: "disc-in".to_string(),
                password_in: "disc-pass-in".to_string(),
                secrets_type: "chap".to_string(),
            },
            session_secrets: Secrets::default(),
            interface: DEFAULT_INTERFACE.to_string(),
            initiator_name: String::new(),
            multipath_device: "/dev/mapper/mpatha".to_string(),
        }
    }

    #[test]
    fn test_round_trip_preserves_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iscsi-vol-1.json");
        let original = connector("vol-1");

        persist_connector(&original, &path).unwrap();
        let loaded = load_connector(&path).unwrap();

        assert_eq!(loaded, original);
        assert!(loaded.session_secrets.is_empty());
        assert!(!loaded.discovery_secrets.is_empty());
    }

    #[test]
    fn test_persist_file_mode_and_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConnectorStore::new(dir.path().join("run").join("driver"));

        let path = store.persist(&connector("vol-1")).unwrap();
        assert_eq!(path, store.run_dir().join("iscsi-vol-1.json"));

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        let dir_mode = fs::metadata(store.run_dir()).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode & 0o007, 0, "run directory must not be world accessible");
    }

    #[test]
    fn test_persist_overwrites_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConnectorStore::new(dir.path());

        let mut c = connector("vol-1");
        store.persist(&c).unwrap();
        c.multipath_device = "/dev/mapper/mpathb".to_string();
        store.persist(&c).unwrap();

        assert_eq!(store.load("vol-1").unwrap().multipath_device, "/dev/mapper/mpathb");
        let files: Vec<_> = fs::read_dir(dir.path()).unwrap().flatten().collect();
        assert_eq!(files.len(), 1, "no temp files left behind");
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_connector(&dir.path().join("iscsi-missing.json")).unwrap_err();
        assert!(matches!(err, IscsiError::NotFound(_)));
    }

    #[test]
    fn test_load_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iscsi-bad.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            load_connector(&path).unwrap_err(),
            IscsiError::CorruptConnector { .. }
        ));
    }

    #[test]
    fn test_path_for_rejects_unsafe_names() {
        let store = ConnectorStore::for_driver("iscsi.csi.example.com");
        assert_eq!(
            store.path_for("vol-1").unwrap(),
            PathBuf::from("/var/run/iscsi.csi.example.com/iscsi-vol-1.json")
        );
        assert!(store.path_for("").is_err());
        assert!(store.path_for("../etc/passwd").is_err());
        assert!(store.path_for("a/b").is_err());
        assert!(store.path_for("a\0b").is_err());
    }

    #[test]
    fn test_remove_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConnectorStore::new(dir.path());
        store.persist(&connector("vol-1")).unwrap();

        store.remove("vol-1").unwrap();
        store.remove("vol-1").unwrap();
        assert!(matches!(store.load("vol-1"), Err(IscsiError::NotFound(_))));
    }

    #[test]
    fn test_list_skips_foreign_and_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConnectorStore::new(dir.path());
        store.persist(&connector("vol-1")).unwrap();
        store.persist(&connector("vol-2")).unwrap();
        fs::write(dir.path().join("iscsi-broken.json"), "[]").unwrap();
        fs::write(dir.path().join("notes.txt"), "hello").unwrap();

        let mut names: Vec<_> = store
            .list()
            .unwrap()
            .into_iter()
            .map(|c| c.volume_name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["vol-1", "vol-2"]);
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConnectorStore::new(dir.path().join("absent"));
        assert!(store.list().unwrap().is_empty());
    }
}
