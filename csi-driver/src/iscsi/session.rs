//! iSCSI session establishment and teardown through `iscsiadm`.
//!
//! Connecting walks every portal of a [`Connector`]: sendtargets discovery
//! (with optional discovery CHAP), node record creation, optional session
//! CHAP, login. Portals that fail are logged and skipped; the attach only
//! fails when no portal produced a session. The resulting block devices are
//! then polled under `/dev/disk/by-path` and, with more than one path, the
//! device-mapper multipath holder is preferred.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::connector::{Connector, DEFAULT_INTERFACE, Secrets};
use super::error::{IscsiError, Result};
use crate::metrics;
use crate::platform::{CommandOutput, CommandRunner, redact_args};

const ISCSIADM: &str = "iscsiadm";

/// `iscsiadm` exit code: session or record already exists.
const ISCSI_ERR_SESS_EXISTS: i32 = 15;
/// `iscsiadm` exit code: no records or sessions found.
const ISCSI_ERR_NO_OBJS_FOUND: i32 = 21;

/// Session lifecycle for one attachment.
///
/// Implementations block; callers on an async runtime should use
/// `spawn_blocking`.
pub trait SessionConnector: Send + Sync {
    /// Log in to the target on every reachable portal and return the block
    /// device to mount.
    fn connect(&self, connector: &Connector) -> Result<String>;

    /// Release the local block devices of the attachment (multipath map and
    /// per-portal SCSI disks).
    fn disconnect_volume(&self, connector: &Connector) -> Result<()>;

    /// Log out of `iqn` on each portal and delete the node records. Failures
    /// are logged per portal and never stop the loop.
    fn disconnect(&self, iqn: &str, portals: &[String]);

    /// Rescan the sessions of an attachment so a grown LUN is picked up.
    fn rescan(&self, connector: &Connector) -> Result<()>;

    /// Block devices currently backing the attachment, as they may appear
    /// in the mount table.
    fn devices(&self, connector: &Connector) -> Vec<String>;
}

/// Bounded exponential backoff for device appearance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceWaitPolicy {
    pub attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl Default for DeviceWaitPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(5),
        }
    }
}

impl DeviceWaitPolicy {
    /// Sleep before retry number `attempt` (zero based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_interval
            .saturating_mul(factor)
            .min(self.max_interval)
    }

    /// Call `probe` until it returns `Some` or the attempts run out.
    pub fn poll<T>(&self, mut probe: impl FnMut() -> Option<T>) -> Option<T> {
        let attempts = self.attempts.max(1);
        for attempt in 0..attempts {
            if let Some(value) = probe() {
                return Some(value);
            }
            if attempt + 1 < attempts {
                thread::sleep(self.delay(attempt));
            }
        }
        None
    }
}

/// Filesystem locations consulted while resolving devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePaths {
    pub by_path: PathBuf,
    pub sys_block: PathBuf,
    pub mapper: PathBuf,
    pub dev_root: PathBuf,
}

impl Default for DevicePaths {
    fn default() -> Self {
        Self {
            by_path: PathBuf::from("/dev/disk/by-path"),
            sys_block: PathBuf::from("/sys/block"),
            mapper: PathBuf::from("/dev/mapper"),
            dev_root: PathBuf::from("/dev"),
        }
    }
}

/// [`SessionConnector`] backed by open-iscsi.
pub struct IscsiAdm {
    runner: Arc<dyn CommandRunner>,
    paths: DevicePaths,
    wait: DeviceWaitPolicy,
}

impl IscsiAdm {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            paths: DevicePaths::default(),
            wait: DeviceWaitPolicy::default(),
        }
    }

    pub fn with_paths(mut self, paths: DevicePaths) -> Self {
        self.paths = paths;
        self
    }

    pub fn with_wait_policy(mut self, wait: DeviceWaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    fn iscsiadm(&self, args: &[&str]) -> Result<CommandOutput> {
        self.runner
            .run(ISCSIADM, args)
            .map_err(|e| IscsiError::CommandFailed {
                command: command_line(args),
                code: -1,
                stderr: format!("failed to execute: {}", e),
            })
    }

    fn iscsiadm_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = self.iscsiadm(args)?;
        if !output.success() {
            return Err(command_failed(args, &output));
        }
        Ok(output)
    }

    /// Like [`Self::iscsiadm_checked`] but an existing record is success.
    fn iscsiadm_create(&self, args: &[&str]) -> Result<()> {
        let output = self.iscsiadm(args)?;
        if output.success() || output.code == Some(ISCSI_ERR_SESS_EXISTS) {
            return Ok(());
        }
        Err(command_failed(args, &output))
    }

    /// Apply CHAP settings under `prefix` to the record selected by `base`.
    fn set_chap(&self, base: &[&str], prefix: &str, secrets: &Secrets) -> Result<()> {
        let method_name = format!("{}.authmethod", prefix);
        let mut args = base.to_vec();
        args.extend(["-o", "update", "-n", method_name.as_str(), "-v", "CHAP"]);
        self.iscsiadm_checked(&args)?;

        for (field, value) in secrets.auth_fields() {
            let name = format!("{}.{}", prefix, field);
            let mut args = base.to_vec();
            args.extend(["-o", "update", "-n", name.as_str(), "-v", value]);
            self.iscsiadm_checked(&args)?;
        }
        Ok(())
    }

    /// Bind the initiator name to a dedicated iface record.
    fn ensure_iface(&self, connector: &Connector) -> Result<()> {
        if connector.initiator_name.is_empty() || connector.interface == DEFAULT_INTERFACE {
            return Ok(());
        }

        let iface = connector.interface.as_str();
        self.iscsiadm_create(&["-m", "iface", "-I", iface, "-o", "new"])?;
        self.iscsiadm_checked(&[
            "-m",
            "iface",
            "-I",
            iface,
            "-o",
            "update",
            "-n",
            "iface.initiatorname",
            "-v",
            connector.initiator_name.as_str(),
        ])?;
        Ok(())
    }

    /// SendTargets discovery against one portal. The discoverydb record is
    /// removed again when authentication or discovery fails.
    fn discover(&self, connector: &Connector, portal: &str) -> Result<()> {
        let base = [
            "-m",
            "discoverydb",
            "-t",
            "sendtargets",
            "-p",
            portal,
            "-I",
            connector.interface.as_str(),
        ];

        let mut args = base.to_vec();
        args.extend(["-o", "new"]);
        self.iscsiadm_create(&args)?;

        let discovered = (|| -> Result<CommandOutput> {
            if connector.do_chap_discovery {
                self.set_chap(&base, "discovery.sendtargets.auth", &connector.discovery_secrets)?;
            }
            let mut args = base.to_vec();
            args.push("--discover");
            self.iscsiadm_checked(&args)
        })();

        let output = match discovered {
            Ok(output) => output,
            Err(e) => {
                let mut args = base.to_vec();
                args.extend(["-o", "delete"]);
                if let Err(cleanup) = self.iscsiadm_checked(&args) {
                    debug!(portal = %portal, error = %cleanup, "Failed to delete discoverydb record");
                }
                return Err(e);
            }
        };

        let advertised = output
            .stdout
            .lines()
            .any(|line| line.split_whitespace().nth(1) == Some(connector.target_iqn.as_str()));
        if !advertised {
            return Err(IscsiError::CommandFailed {
                command: command_line(&base),
                code: 0,
                stderr: format!("portal does not advertise target {}", connector.target_iqn),
            });
        }

        debug!(portal = %portal, iqn = %connector.target_iqn, "Target discovered");
        Ok(())
    }

    /// Create the node record, configure session CHAP and log in.
    fn login(&self, connector: &Connector, portal: &str) -> Result<()> {
        let base = [
            "-m",
            "node",
            "-T",
            connector.target_iqn.as_str(),
            "-p",
            portal,
            "-I",
            connector.interface.as_str(),
        ];

        let mut args = base.to_vec();
        args.extend(["-o", "new"]);
        self.iscsiadm_create(&args)?;

        if !connector.session_secrets.is_empty() {
            self.set_chap(&base, "node.session.auth", &connector.session_secrets)?;
        }

        let mut args = base.to_vec();
        args.push("--login");
        let output = self.iscsiadm(&args)?;
        if output.success()
            || output.code == Some(ISCSI_ERR_SESS_EXISTS)
            || output.stderr.contains("already present")
        {
            return Ok(());
        }
        Err(command_failed(&args, &output))
    }

    /// Active `(portal, iqn)` sessions.
    fn active_sessions(&self) -> Result<Vec<(String, String)>> {
        let output = self.iscsiadm(&["-m", "session"])?;
        if output.code == Some(ISCSI_ERR_NO_OBJS_FOUND) {
            return Ok(Vec::new());
        }
        if !output.success() {
            return Err(command_failed(&["-m", "session"], &output));
        }
        Ok(parse_sessions(&output.stdout))
    }

    /// Canonical device behind each portal's by-path link, polling until all
    /// have appeared or the wait policy is exhausted.
    fn wait_for_devices(&self, connector: &Connector, portals: &[&str]) -> Vec<PathBuf> {
        let links: Vec<PathBuf> = portals
            .iter()
            .map(|portal| self.paths.by_path.join(connector.by_path_name(portal)))
            .collect();

        let resolve = || -> Vec<PathBuf> {
            links
                .iter()
                .filter_map(|link| fs::canonicalize(link).ok())
                .collect()
        };

        let devices = self
            .wait
            .poll(|| {
                let found = resolve();
                (found.len() == links.len()).then_some(found)
            })
            .unwrap_or_else(resolve);

        let mut unique: Vec<PathBuf> = Vec::with_capacity(devices.len());
        for device in devices {
            if !unique.contains(&device) {
                unique.push(device);
            }
        }
        unique
    }

    /// `dm-N` holder of a raw disk, if any.
    fn holder_of(&self, device: &Path) -> Option<String> {
        let name = device.file_name()?;
        let holders = self.paths.sys_block.join(name).join("holders");
        fs::read_dir(holders)
            .ok()?
            .flatten()
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .find(|holder| holder.starts_with("dm-"))
    }

    /// `/dev/mapper` alias of `dm-N`, falling back to `/dev/dm-N`.
    fn mapper_alias(&self, dm_name: &str) -> String {
        if let Ok(entries) = fs::read_dir(&self.paths.mapper) {
            for entry in entries.flatten() {
                if let Ok(target) = fs::read_link(entry.path())
                    && target.file_name().is_some_and(|n| n == dm_name)
                {
                    return entry.path().to_string_lossy().into_owned();
                }
            }
        }
        self.paths.dev_root.join(dm_name).to_string_lossy().into_owned()
    }

    /// Pick the device to mount from the per-portal paths.
    fn select_device(&self, devices: &[PathBuf]) -> Option<String> {
        let first = devices.first()?;

        let holder = if devices.len() > 1 {
            let holder = self
                .wait
                .poll(|| devices.iter().find_map(|device| self.holder_of(device)));
            if holder.is_none() {
                warn!(
                    paths = devices.len(),
                    "Multipath device did not appear, using a single path"
                );
            }
            holder
        } else {
            self.holder_of(first)
        };

        match holder {
            Some(dm) => {
                let alias = self.mapper_alias(&dm);
                info!(
                    original = %first.display(),
                    multipath = %alias,
                    "Device is multipathed, using dm device"
                );
                Some(alias)
            }
            None => Some(first.to_string_lossy().into_owned()),
        }
    }

    fn logout(&self, iqn: &str, portal: &str) -> Result<()> {
        let base = ["-m", "node", "-T", iqn, "-p", portal];
        let logout_err = |output: &CommandOutput| IscsiError::Logout {
            iqn: iqn.to_string(),
            portal: portal.to_string(),
            reason: output.error_text(),
        };

        let mut args = base.to_vec();
        args.push("--logout");
        let output = self.iscsiadm(&args)?;
        if !output.success() && !already_gone(&output) {
            return Err(logout_err(&output));
        }

        let mut args = base.to_vec();
        args.extend(["-o", "delete"]);
        let output = self.iscsiadm(&args)?;
        if !output.success() && !already_gone(&output) {
            return Err(logout_err(&output));
        }

        Ok(())
    }
}

impl SessionConnector for IscsiAdm {
    fn connect(&self, connector: &Connector) -> Result<String> {
        let volume = connector.volume_name.as_str();
        let iqn = connector.target_iqn.as_str();
        let connect_err = |reason: String| IscsiError::Connect {
            volume: volume.to_string(),
            iqn: iqn.to_string(),
            reason,
        };

        info!(
            volume = %volume,
            target_iqn = %iqn,
            portals = ?connector.target_portals,
            lun = connector.lun,
            discovery_chap = connector.do_chap_discovery,
            session_chap = !connector.session_secrets.is_empty(),
            "Connecting to iSCSI target"
        );

        self.ensure_iface(connector)
            .map_err(|e| connect_err(format!("iface {}: {}", connector.interface, e)))?;

        let sessions = self.active_sessions().unwrap_or_else(|e| {
            warn!(error = %e, "Could not list iSCSI sessions, logging in on every portal");
            Vec::new()
        });

        let mut logged_in: Vec<&str> = Vec::new();
        let mut failures: Vec<String> = Vec::new();

        for portal in &connector.target_portals {
            if sessions.iter().any(|(p, i)| p == portal && i == iqn) {
                info!(portal = %portal, target_iqn = %iqn, "iSCSI session already exists");
                logged_in.push(portal);
                continue;
            }

            if let Err(e) = self.discover(connector, portal) {
                warn!(portal = %portal, target_iqn = %iqn, error = %e, "iSCSI discovery failed");
                failures.push(format!("{}: {}", portal, e));
                continue;
            }

            match self.login(connector, portal) {
                Ok(()) => {
                    info!(portal = %portal, target_iqn = %iqn, "iSCSI login successful");
                    logged_in.push(portal);
                }
                Err(e) => {
                    warn!(portal = %portal, target_iqn = %iqn, error = %e, "iSCSI login failed");
                    failures.push(format!("{}: {}", portal, e));
                }
            }
        }

        if logged_in.is_empty() {
            return Err(connect_err(format!(
                "no portal could be logged in ({})",
                failures.join("; ")
            )));
        }

        let devices = self.wait_for_devices(connector, &logged_in);
        let device = self.select_device(&devices).ok_or_else(|| {
            connect_err(format!(
                "no device appeared for LUN {} via {}",
                connector.lun,
                logged_in.join(", ")
            ))
        })?;

        info!(
            volume = %volume,
            device = %device,
            paths = devices.len(),
            "iSCSI target connected"
        );
        Ok(device)
    }

    fn disconnect_volume(&self, connector: &Connector) -> Result<()> {
        let volume = connector.volume_name.as_str();
        let disconnect_err = |reason: String| IscsiError::Disconnect {
            volume: volume.to_string(),
            reason,
        };

        if !connector.multipath_device.is_empty() && Path::new(&connector.multipath_device).exists()
        {
            let device = connector.multipath_device.as_str();
            info!(volume = %volume, device = %device, "Flushing multipath map");
            let output = self
                .runner
                .run("multipath", &["-f", device])
                .map_err(|e| disconnect_err(format!("failed to execute multipath: {}", e)))?;
            if !output.success() {
                return Err(disconnect_err(format!(
                    "multipath -f {}: {}",
                    device,
                    output.error_text()
                )));
            }
        }

        for portal in &connector.target_portals {
            let link = self.paths.by_path.join(connector.by_path_name(portal));
            let device = match fs::canonicalize(&link) {
                Ok(device) => device,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(link = %link.display(), "Device path already gone");
                    continue;
                }
                Err(e) => return Err(disconnect_err(format!("{}: {}", link.display(), e))),
            };

            let Some(name) = device.file_name() else {
                continue;
            };
            let delete = self.paths.sys_block.join(name).join("device").join("delete");
            match fs::write(&delete, "1") {
                Ok(()) => {
                    info!(volume = %volume, device = %device.display(), "Removed SCSI device")
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(device = %device.display(), "SCSI device already removed");
                }
                Err(e) => {
                    return Err(disconnect_err(format!(
                        "removing {} via {}: {}",
                        device.display(),
                        delete.display(),
                        e
                    )));
                }
            }
        }

        Ok(())
    }

    fn disconnect(&self, iqn: &str, portals: &[String]) {
        for portal in portals {
            match self.logout(iqn, portal) {
                Ok(()) => info!(target_iqn = %iqn, portal = %portal, "Logged out of iSCSI target"),
                Err(e) => {
                    warn!(target_iqn = %iqn, portal = %portal, error = %e, "iSCSI logout failed");
                    metrics::record_logout_failure();
                }
            }
        }
    }

    fn rescan(&self, connector: &Connector) -> Result<()> {
        let iqn = connector.target_iqn.as_str();
        self.iscsiadm_checked(&["-m", "node", "-T", iqn, "-R"])?;

        if !connector.multipath_device.is_empty() {
            let map = connector
                .multipath_device
                .rsplit('/')
                .next()
                .unwrap_or(connector.multipath_device.as_str());
            let output = self
                .runner
                .run("multipathd", &["resize", "map", map])
                .map_err(IscsiError::Io)?;
            if !output.success() {
                return Err(IscsiError::CommandFailed {
                    command: format!("multipathd resize map {}", map),
                    code: output.exit_code(),
                    stderr: output.error_text(),
                });
            }
        }

        debug!(target_iqn = %iqn, "Rescanned iSCSI sessions");
        Ok(())
    }

    fn devices(&self, connector: &Connector) -> Vec<String> {
        let mut devices: Vec<String> = Vec::new();
        let mut add = |device: String| {
            if !devices.contains(&device) {
                devices.push(device);
            }
        };

        if !connector.multipath_device.is_empty() {
            add(connector.multipath_device.clone());
            if let Ok(dm) = fs::canonicalize(&connector.multipath_device) {
                add(dm.to_string_lossy().into_owned());
            }
        }
        for portal in &connector.target_portals {
            let link = self.paths.by_path.join(connector.by_path_name(portal));
            if let Ok(device) = fs::canonicalize(&link) {
                add(device.to_string_lossy().into_owned());
            }
        }
        devices
    }
}

/// Parse `iscsiadm -m session` into `(portal, iqn)` pairs.
///
/// Lines look like `tcp: [1] 10.0.0.5:3260,1 iqn.2025-01.test:vol1 (non-flash)`.
fn parse_sessions(stdout: &str) -> Vec<(String, String)> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace().skip(2);
            let portal = fields.next()?.split(',').next()?.to_string();
            let iqn = fields.next()?.to_string();
            Some((portal, iqn))
        })
        .collect()
}

fn already_gone(output: &CommandOutput) -> bool {
    let text = output.error_text().to_lowercase();
    output.code == Some(ISCSI_ERR_NO_OBJS_FOUND)
        || text.contains("no matching sessions")
        || text.contains("not logged in")
        || text.contains("no records found")
}

fn command_line(args: &[&str]) -> String {
    format!("{} {}", ISCSIADM, redact_args(args).join(" "))
}

fn command_failed(args: &[&str], output: &CommandOutput) -> IscsiError {
    IscsiError::CommandFailed {
        command: command_line(args),
        code: output.exit_code(),
        stderr: output.error_text(),
    }
}
