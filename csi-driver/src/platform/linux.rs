//! Linux platform implementation for CSI Node operations
//!
//! Uses Linux-specific tools:
//! - /proc/mounts for the mount table
//! - blkid for filesystem detection
//! - mkfs.ext4/mkfs.ext3/mkfs.xfs for filesystem formatting
//! - resize2fs/xfs_growfs for online expansion

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::{CommandOutput, CommandRunner, MountEntry, Mounter, PlatformError, PlatformResult};

/// Default filesystem type for Linux
pub const DEFAULT_FS_TYPE: &str = "ext4";

/// Exit code of `blkid -p` when the device carries no recognizable signature.
const BLKID_NO_SIGNATURE: i32 = 2;

/// [`Mounter`] for Linux hosts.
pub struct LinuxMounter {
    runner: Arc<dyn CommandRunner>,
    mounts_path: PathBuf,
}

impl LinuxMounter {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self::with_mounts_path(runner, "/proc/mounts")
    }

    /// Read the mount table from `mounts_path` instead of `/proc/mounts`.
    pub fn with_mounts_path(
        runner: Arc<dyn CommandRunner>,
        mounts_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            mounts_path: mounts_path.into(),
        }
    }

    /// Run a command and fail unless it exits successfully.
    fn run_checked(&self, program: &str, args: &[&str]) -> PlatformResult<CommandOutput> {
        let output = self.run(program, args)?;
        if !output.success() {
            error!(program = %program, stderr = %output.error_text(), "Command failed");
            return Err(PlatformError::CommandFailed {
                program: program.to_string(),
                code: output.exit_code(),
                stderr: output.error_text(),
            });
        }
        Ok(output)
    }

    fn run(&self, program: &str, args: &[&str]) -> PlatformResult<CommandOutput> {
        self.runner.run(program, args).map_err(|e| {
            error!(error = %e, program = %program, "Failed to execute command");
            PlatformError::Exec {
                program: program.to_string(),
                source: e,
            }
        })
    }

    /// Check if a device needs formatting (has no filesystem signature).
    pub fn needs_formatting(&self, device: &str) -> PlatformResult<bool> {
        let output = self.run("blkid", &["-p", device])?;

        if output.code == Some(BLKID_NO_SIGNATURE) {
            return Ok(true);
        }
        if !output.success() {
            return Err(PlatformError::CommandFailed {
                program: "blkid".to_string(),
                code: output.exit_code(),
                stderr: output.error_text(),
            });
        }

        // Partition tables report PTTYPE=, only a TYPE= tag means a filesystem
        let has_fs = output
            .stdout
            .split_whitespace()
            .any(|token| token.starts_with("TYPE="));
        Ok(!has_fs)
    }

    /// Format a device with the specified filesystem type.
    pub fn format_device(&self, device: &str, fs_type: &str) -> PlatformResult<()> {
        let fs_type = validate_fs_type(fs_type)?;
        info!(device = %device, fs_type = %fs_type, "Formatting device");

        match fs_type {
            "xfs" => self.run_checked("mkfs.xfs", &["-f", device])?,
            other => {
                let program = format!("mkfs.{}", other);
                self.run_checked(&program, &["-F", device])?
            }
        };

        Ok(())
    }
}

impl Mounter for LinuxMounter {
    fn mounts(&self) -> PlatformResult<Vec<MountEntry>> {
        let content = fs::read_to_string(&self.mounts_path)?;
        Ok(parse_mount_table(&content))
    }

    fn format_and_mount(
        &self,
        device: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> PlatformResult<()> {
        let fs_type = validate_fs_type(fs_type)?;

        if self.needs_formatting(device)? {
            self.format_device(device, fs_type)?;
        } else {
            debug!(device = %device, "Device already carries a filesystem");
        }

        let target_str = target.to_string_lossy();
        let opts = options.join(",");
        info!(
            device = %device,
            target = %target_str,
            fs_type = %fs_type,
            options = %opts,
            "Mounting device"
        );

        let mut args = vec!["-t", fs_type];
        if !opts.is_empty() {
            args.extend(["-o", opts.as_str()]);
        }
        args.extend([device, &*target_str]);

        self.run_checked("mount", &args)?;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> PlatformResult<()> {
        let target_str = target.to_string_lossy();
        info!(target = %target_str, "Unmounting");

        let output = self.run("umount", &[&*target_str])?;
        if !output.success() {
            let stderr = output.error_text();
            // Treat "not mounted" as success
            if stderr.contains("not mounted") || stderr.contains("no mount point") {
                warn!(target = %target_str, "Path was not mounted");
                return Ok(());
            }
            error!(stderr = %stderr, "umount failed");
            return Err(PlatformError::CommandFailed {
                program: "umount".to_string(),
                code: output.exit_code(),
                stderr,
            });
        }

        Ok(())
    }

    fn resize_filesystem(
        &self,
        device: &str,
        mount_path: &Path,
        fs_type: &str,
    ) -> PlatformResult<()> {
        info!(device = %device, fs_type = %fs_type, "Resizing filesystem");

        match fs_type {
            "ext2" | "ext3" | "ext4" => {
                self.run_checked("resize2fs", &[device])?;
            }
            "xfs" => {
                let path = mount_path.to_string_lossy();
                self.run_checked("xfs_growfs", &[&*path])?;
            }
            other => return Err(PlatformError::UnsupportedFs(other.to_string())),
        }

        Ok(())
    }

    fn filesystem_capacity(&self, path: &Path) -> PlatformResult<i64> {
        let path_str = path.to_string_lossy();
        let output = self.run_checked("df", &["-k", &*path_str])?;

        // Parse df output (second line, second column is total size in KB)
        if let Some(line) = output.stdout.lines().nth(1)
            && let Some(size_kb) = line.split_whitespace().nth(1)
            && let Ok(size) = size_kb.parse::<i64>()
        {
            return Ok(size * 1024);
        }

        Err(PlatformError::Parse {
            what: "df output",
            detail: output.stdout,
        })
    }
}

/// Parse `/proc/mounts` content.
pub fn parse_mount_table(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            let fs_type = fields.next()?;
            let options = fields.next().unwrap_or_default();
            Some(MountEntry {
                device: unescape_octal(device),
                mount_point: unescape_octal(mount_point),
                fs_type: fs_type.to_string(),
                options: options.to_string(),
            })
        })
        .collect()
}

/// Decode the `\040`-style escapes the kernel uses for whitespace in paths.
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = (bytes[i + 1] - b'0') as u32 * 64
                + (bytes[i + 2] - b'0') as u32 * 8
                + (bytes[i + 3] - b'0') as u32;
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// Validate filesystem type for Linux.
pub fn validate_fs_type(fs_type: &str) -> PlatformResult<&'static str> {
    match fs_type.to_lowercase().as_str() {
        "ext4" | "" => Ok(DEFAULT_FS_TYPE),
        "ext3" => Ok("ext3"),
        "xfs" => Ok("xfs"),
        _ => Err(PlatformError::UnsupportedFs(fs_type.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Mutex;

    /// Replays canned outputs keyed by program name and records invocations.
    #[derive(Default)]
    struct ScriptedRunner {
        outputs: Mutex<Vec<(String, CommandOutput)>>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedRunner {
        fn respond(self, program: &str, output: CommandOutput) -> Self {
            self.outputs
                .lock()
                .unwrap()
                .push((program.to_string(), output));
            self
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
            let mut call = vec![program.to_string()];
            call.extend(args.iter().map(|a| a.to_string()));
            self.calls.lock().unwrap().push(call);

            let mut outputs = self.outputs.lock().unwrap();
            match outputs.iter().position(|(p, _)| p == program) {
                Some(idx) => Ok(outputs.remove(idx).1),
                None => Ok(CommandOutput::ok("")),
            }
        }
    }

    #[test]
    fn test_validate_fs_type_valid() {
        assert_eq!(validate_fs_type("ext4").unwrap(), "ext4");
        assert_eq!(validate_fs_type("ext3").unwrap(), "ext3");
        assert_eq!(validate_fs_type("xfs").unwrap(), "xfs");
        assert_eq!(validate_fs_type("").unwrap(), "ext4");
        assert_eq!(validate_fs_type("EXT4").unwrap(), "ext4");
    }

    #[test]
    fn test_validate_fs_type_invalid() {
        assert!(validate_fs_type("ufs").is_err());
        assert!(validate_fs_type("zfs").is_err());
        assert!(validate_fs_type("ntfs").is_err());
    }

    #[test]
    fn test_parse_mount_table() {
        let content = "\
/dev/sda1 / ext4 rw,relatime 0 0
proc /proc proc rw,nosuid 0 0
/dev/sdb /var/lib/kubelet/pods/x/volumes/my\\040vol ext4 rw 0 0
";
        let mounts = parse_mount_table(content);
        assert_eq!(mounts.len(), 3);
        assert_eq!(mounts[0].device, "/dev/sda1");
        assert_eq!(mounts[2].mount_point, "/var/lib/kubelet/pods/x/volumes/my vol");
        assert_eq!(mounts[2].fs_type, "ext4");
    }

    #[test]
    fn test_unescape_octal_leaves_plain_backslash() {
        assert_eq!(unescape_octal("a\\b"), "a\\b");
        assert_eq!(unescape_octal("tab\\011x"), "tab\tx");
        assert_eq!(unescape_octal("end\\04"), "end\\04");
    }

    #[test]
    fn test_needs_formatting() {
        let runner = Arc::new(ScriptedRunner::default().respond(
            "blkid",
            CommandOutput::failed(BLKID_NO_SIGNATURE, ""),
        ));
        let mounter = LinuxMounter::new(runner);
        assert!(mounter.needs_formatting("/dev/sdb").unwrap());

        let runner = Arc::new(ScriptedRunner::default().respond(
            "blkid",
            CommandOutput::ok("/dev/sdb: UUID=\"abc\" TYPE=\"ext4\"\n"),
        ));
        let mounter = LinuxMounter::new(runner);
        assert!(!mounter.needs_formatting("/dev/sdb").unwrap());

        let runner = Arc::new(ScriptedRunner::default().respond(
            "blkid",
            CommandOutput::ok("/dev/sdb: PTUUID=\"x\" PTTYPE=\"gpt\"\n"),
        ));
        let mounter = LinuxMounter::new(runner);
        assert!(mounter.needs_formatting("/dev/sdb").unwrap());

        let runner = Arc::new(
            ScriptedRunner::default().respond("blkid", CommandOutput::failed(4, "usage error")),
        );
        let mounter = LinuxMounter::new(runner);
        assert!(mounter.needs_formatting("/dev/sdb").is_err());
    }

    #[test]
    fn test_format_and_mount_formats_blank_device() {
        let runner = Arc::new(ScriptedRunner::default().respond(
            "blkid",
            CommandOutput::failed(BLKID_NO_SIGNATURE, ""),
        ));
        let mounter = LinuxMounter::new(runner.clone());

        mounter
            .format_and_mount(
                "/dev/sdb",
                Path::new("/mnt/vol"),
                "ext4",
                &["rw".to_string(), "noatime".to_string()],
            )
            .unwrap();

        let calls = runner.calls();
        assert_eq!(calls[1], vec!["mkfs.ext4", "-F", "/dev/sdb"]);
        assert_eq!(
            calls[2],
            vec!["mount", "-t", "ext4", "-o", "rw,noatime", "/dev/sdb", "/mnt/vol"]
        );
    }

    #[test]
    fn test_format_and_mount_skips_mkfs_for_existing_fs() {
        let runner = Arc::new(ScriptedRunner::default().respond(
            "blkid",
            CommandOutput::ok("/dev/sdb: TYPE=\"xfs\"\n"),
        ));
        let mounter = LinuxMounter::new(runner.clone());

        mounter
            .format_and_mount("/dev/sdb", Path::new("/mnt/vol"), "xfs", &["ro".to_string()])
            .unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1][0], "mount");
    }

    #[test]
    fn test_mount_failure_reports_stderr() {
        let runner = Arc::new(
            ScriptedRunner::default()
                .respond("blkid", CommandOutput::ok("/dev/sdb: TYPE=\"ext4\"\n"))
                .respond("mount", CommandOutput::failed(32, "wrong fs type, bad option")),
        );
        let mounter = LinuxMounter::new(runner);

        let err = mounter
            .format_and_mount("/dev/sdb", Path::new("/mnt/vol"), "ext4", &[])
            .unwrap_err();
        assert!(err.to_string().contains("wrong fs type"));
    }

    #[test]
    fn test_unmount_not_mounted_is_success() {
        let runner = Arc::new(
            ScriptedRunner::default()
                .respond("umount", CommandOutput::failed(32, "umount: /mnt/vol: not mounted.")),
        );
        let mounter = LinuxMounter::new(runner);
        assert!(mounter.unmount(Path::new("/mnt/vol")).is_ok());
    }

    #[test]
    fn test_unmount_busy_fails() {
        let runner = Arc::new(
            ScriptedRunner::default()
                .respond("umount", CommandOutput::failed(32, "umount: /mnt/vol: target is busy.")),
        );
        let mounter = LinuxMounter::new(runner);
        assert!(mounter.unmount(Path::new("/mnt/vol")).is_err());
    }

    #[test]
    fn test_resize_filesystem_tools() {
        let runner = Arc::new(ScriptedRunner::default());
        let mounter = LinuxMounter::new(runner.clone());

        mounter
            .resize_filesystem("/dev/sdb", Path::new("/mnt/a"), "ext4")
            .unwrap();
        mounter
            .resize_filesystem("/dev/sdc", Path::new("/mnt/b"), "xfs")
            .unwrap();
        assert!(
            mounter
                .resize_filesystem("/dev/sdd", Path::new("/mnt/c"), "btrfs")
                .is_err()
        );

        let calls = runner.calls();
        assert_eq!(calls[0], vec!["resize2fs", "/dev/sdb"]);
        assert_eq!(calls[1], vec!["xfs_growfs", "/mnt/b"]);
    }

    #[test]
    fn test_filesystem_capacity_parses_df() {
        let runner = Arc::new(ScriptedRunner::default().respond(
            "df",
            CommandOutput::ok(
                "Filesystem 1K-blocks Used Available Use% Mounted on\n/dev/sdb 1048576 1024 1047552 1% /mnt/vol\n",
            ),
        ));
        let mounter = LinuxMounter::new(runner);
        assert_eq!(
            mounter.filesystem_capacity(Path::new("/mnt/vol")).unwrap(),
            1024 * 1024 * 1024
        );
    }

    #[test]
    fn test_mounts_reads_table_file() {
        let dir = tempfile::tempdir().unwrap();
        let table = dir.path().join("mounts");
        fs::write(&table, "/dev/sdb /mnt/vol ext4 rw 0 0\n/dev/sdb /mnt/other ext4 rw 0 0\n")
            .unwrap();

        let mounter = LinuxMounter::with_mounts_path(Arc::new(ScriptedRunner::default()), &table);
        let refs = mounter.mount_refs(Path::new("/mnt/vol")).unwrap().unwrap();
        assert_eq!(refs.refs, 2);
    }
}
