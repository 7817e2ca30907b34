//! Host command execution for the kernel backends
//!
//! The tunnel, packet-filter and route backends drive the host's `ip`,
//! `bridge` and `iptables` tools. Commands are spawned directly, never
//! through a shell, and always in the C locale.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::trace;

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Captured result of a host command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Process exited with status 0
    pub success: bool,
    /// Standard output, lossily decoded
    pub stdout: String,
    /// Standard error, lossily decoded
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given stderr
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Stderr with surrounding whitespace removed, for error messages
    pub fn error_text(&self) -> String {
        self.stderr.trim().to_string()
    }
}

/// Runs host programs and captures their output
///
/// A non-zero exit is reported through [`CommandOutput::success`], not as
/// an `Err`; callers classify the failure from stderr. `Err` means the
/// program could not be spawned at all.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` and wait for it to exit
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, Error>;
}

/// Runs commands on the host with `tokio::process`
#[derive(Clone, Debug, Default)]
pub struct HostCommandRunner;

impl HostCommandRunner {
    /// Create a new host runner
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for HostCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, Error> {
        trace!(program, args = %args.join(" "), "running host command");

        // Failures are classified from stderr, which must not be translated
        let output = Command::new(program)
            .args(args)
            .env("LC_ALL", "C")
            .env("LANG", "C")
            .output()
            .await
            .map_err(|e| Error::command(program, e.to_string()))?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Build an owned argument vector from string slices
pub fn args<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    parts.into_iter().map(|s| s.as_ref().to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_host_runner_reports_exit_status() {
        let runner = HostCommandRunner::new();

        let out = runner.run("sh", &args(["-c", "echo hello"])).await.unwrap();
        assert!(out.success);
        assert_eq!(out.stdout.trim(), "hello");

        let out = runner
            .run("sh", &args(["-c", "echo nope >&2; exit 2"]))
            .await
            .unwrap();
        assert!(!out.success);
        assert_eq!(out.error_text(), "nope");
    }

    #[tokio::test]
    async fn test_commands_run_in_c_locale() {
        let runner = HostCommandRunner::new();

        let out = runner
            .run("sh", &args(["-c", "echo \"$LC_ALL $LANG\""]))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "C C");
    }

    #[tokio::test]
    async fn test_missing_program_is_a_command_error() {
        let runner = HostCommandRunner::new();
        let err = runner
            .run("peernet-definitely-not-installed", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Command { .. }));
    }
}
