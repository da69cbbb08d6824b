//! External command execution.
//!
//! Every call to `iscsiadm`, `multipath`, `blkid`, `mkfs.*`, `mount` and
//! friends goes through a [`CommandRunner`], so the node logic can be driven
//! against a scripted runner in tests.

use std::io;
use std::process::Command;

use tracing::debug;

/// Captured result of one external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Exit code for error messages (`-1` when terminated by a signal).
    pub fn exit_code(&self) -> i32 {
        self.code.unwrap_or(-1)
    }

    /// Trimmed stderr, falling back to stdout when stderr is empty.
    pub fn error_text(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Runs external programs to completion.
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` and capture its output.
    ///
    /// Returns `Err` only when the program could not be started; a non-zero
    /// exit status is reported through [`CommandOutput::code`].
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput>;
}

/// [`CommandRunner`] backed by `std::process::Command`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
        debug!(program = %program, args = ?redact_args(args), "Executing command");

        let output = Command::new(program).args(args).output()?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Copy of `args` with CHAP credential values masked.
///
/// `iscsiadm -o update -n <name> -v <value>` carries secrets in `<value>`
/// whenever `<name>` is an `auth.` field other than the auth method.
pub fn redact_args(args: &[&str]) -> Vec<String> {
    let mut redacted = Vec::with_capacity(args.len());
    let mut sensitive_name = false;
    let mut expect_value = false;

    for (i, arg) in args.iter().enumerate() {
        if expect_value {
            redacted.push(if sensitive_name {
                "******".to_string()
            } else {
                (*arg).to_string()
            });
            expect_value = false;
            sensitive_name = false;
            continue;
        }

        if *arg == "-n"
            && let Some(name) = args.get(i + 1)
        {
            sensitive_name = name.contains(".auth.") && !name.ends_with(".authmethod");
        } else if *arg == "-v" {
            expect_value = true;
        }
        redacted.push((*arg).to_string());
    }

    redacted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_output_helpers() {
        let ok = CommandOutput::ok("done\n");
        assert!(ok.success());
        assert_eq!(ok.exit_code(), 0);

        let failed = CommandOutput::failed(21, "  no records found\n");
        assert!(!failed.success());
        assert_eq!(failed.exit_code(), 21);
        assert_eq!(failed.error_text(), "no records found");

        let signalled = CommandOutput {
            code: None,
            stdout: "partial output".to_string(),
            stderr: String::new(),
        };
        assert!(!signalled.success());
        assert_eq!(signalled.exit_code(), -1);
        assert_eq!(signalled.error_text(), "partial output");
    }

    #[test]
    fn test_redact_args_masks_chap_values() {
        let args = [
            "-m",
            "node",
            "-o",
            "update",
            "-n",
            "node.session.auth.password",
            "-v",
            "s3cret",
        ];
        let redacted = redact_args(&args);
        assert_eq!(redacted[7], "******");
        assert!(!redacted.iter().any(|a| a == "s3cret"));
    }

    #[test]
    fn test_redact_args_keeps_authmethod() {
        let args = [
            "-o",
            "update",
            "-n",
            "discovery.sendtargets.auth.authmethod",
            "-v",
            "CHAP",
        ];
        assert_eq!(redact_args(&args)[5], "CHAP");
    }

    #[test]
    fn test_system_runner_reports_exit_code() {
        let runner = SystemRunner;
        let output = runner.run("sh", &["-c", "echo out; echo err >&2; exit 3"]).unwrap();
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[test]
    fn test_system_runner_missing_program() {
        let runner = SystemRunner;
        assert!(runner.run("definitely-not-a-real-binary-xyz", &[]).is_err());
    }
}
