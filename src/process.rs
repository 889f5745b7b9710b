//! Centralized command execution with consistent error handling.
//!
//! This module provides a unified API for running external commands,
//! ensuring all commands capture output and provide useful error messages.
//! Every invocation and its captured output is mirrored to the `tracing`
//! debug stream, so a failed build can be reconstructed from the log alone.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::process::{Command, ExitStatus};
use tracing::debug;

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Exit status of the command.
    pub status: ExitStatus,
    /// Captured stdout as a string.
    pub stdout: String,
    /// Captured stderr as a string.
    pub stderr: String,
}

impl CommandResult {
    /// Returns true if the command exited successfully.
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Get the exit code, or -1 if terminated by signal.
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    /// Get stdout, trimmed of whitespace.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Get stderr, trimmed of whitespace.
    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }

    /// Both output streams concatenated, stdout first.
    ///
    /// Package managers split their diagnostics across the two streams
    /// inconsistently, so failure scans look at both.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Builder for configuring command execution.
pub struct Cmd {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    current_dir: Option<std::path::PathBuf>,
    /// If true, don't fail on non-zero exit.
    allow_fail: bool,
    /// Custom error message prefix.
    error_prefix: Option<String>,
}

impl Cmd {
    /// Create a new command builder.
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
            allow_fail: false,
            error_prefix: None,
        }
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_string());
        }
        self
    }

    /// Add a path as an argument.
    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    /// Set an environment variable for this invocation only.
    pub fn env(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.envs
            .push((key.as_ref().to_string(), value.as_ref().to_string()));
        self
    }

    /// Set an environment variable to a path value.
    pub fn env_path(mut self, key: impl AsRef<str>, value: &Path) -> Self {
        self.envs.push((
            key.as_ref().to_string(),
            value.to_string_lossy().into_owned(),
        ));
        self
    }

    /// Set multiple environment variables.
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            self.envs
                .push((key.as_ref().to_string(), value.as_ref().to_string()));
        }
        self
    }

    /// Set the working directory.
    pub fn dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    /// Allow non-zero exit codes without failing.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Set a custom error message prefix.
    pub fn error_msg(mut self, msg: impl AsRef<str>) -> Self {
        self.error_prefix = Some(msg.as_ref().to_string());
        self
    }

    /// Run the command and capture output.
    pub fn run(self) -> Result<CommandResult> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);

        for (key, value) in &self.envs {
            cmd.env(key, value);
        }

        if let Some(ref dir) = self.current_dir {
            cmd.current_dir(dir);
        }

        debug!(program = %self.program, args = ?self.args, "running command");

        let output = cmd.output().with_context(|| {
            format!(
                "Failed to execute '{}'. Is it installed?",
                self.program
            )
        })?;

        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.stdout.is_empty() {
            debug!(program = %self.program, "stdout:\n{}", result.stdout_trimmed());
        }
        if !result.stderr.is_empty() {
            debug!(program = %self.program, "stderr:\n{}", result.stderr_trimmed());
        }

        if !self.allow_fail && !result.success() {
            let prefix = self
                .error_prefix
                .unwrap_or_else(|| format!("'{}' failed", self.program));

            let detail = result.combined();
            let detail = detail.trim();
            if detail.is_empty() {
                bail!("{} (exit code {})", prefix, result.code());
            } else {
                bail!("{} (exit code {}):\n{}", prefix, result.code(), detail);
            }
        }

        Ok(result)
    }
}

// =============================================================================
// Convenience functions
// =============================================================================

/// Run a command with arguments. Fails with captured output on error.
///
/// # Example
/// ```ignore
/// let result = run("ls", &["-la", "/tmp"])?;
/// println!("Files:\n{}", result.stdout);
/// ```
pub fn run<I, S>(program: &str, args: I) -> Result<CommandResult>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut cmd = Cmd::new(program);
    for arg in args {
        cmd = cmd.arg(arg);
    }
    cmd.run()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_success() {
        let result = run("echo", ["hello"]).unwrap();
        assert!(result.success());
        assert_eq!(result.stdout_trimmed(), "hello");
    }

    #[test]
    fn test_run_captures_stderr() {
        // `ls` on a non-existent file writes to stderr
        let result = Cmd::new("ls")
            .arg("/nonexistent_path_12345")
            .allow_fail()
            .run()
            .unwrap();

        assert!(!result.success());
        assert!(!result.stderr.is_empty());
    }

    #[test]
    fn test_run_failure_includes_stderr() {
        let err = run("ls", ["/nonexistent_path_12345"]).unwrap_err();
        let msg = err.to_string();

        // Error message should include the stderr
        assert!(msg.contains("No such file") || msg.contains("cannot access"));
    }

    #[test]
    fn test_cmd_builder_chaining() {
        let result = Cmd::new("echo")
            .arg("hello")
            .arg("world")
            .run()
            .unwrap();

        assert_eq!(result.stdout_trimmed(), "hello world");
    }

    #[test]
    fn test_cmd_args_iterator() {
        let args = vec!["one", "two", "three"];
        let result = Cmd::new("echo").args(args).run().unwrap();

        assert_eq!(result.stdout_trimmed(), "one two three");
    }

    #[test]
    fn test_cmd_env_passed_to_child() {
        let result = Cmd::new("sh")
            .args(["-c", "printf %s \"$ROOTSTRAP_TEST_VAR\""])
            .env("ROOTSTRAP_TEST_VAR", "propagated")
            .run()
            .unwrap();

        assert_eq!(result.stdout, "propagated");
    }

    #[test]
    fn test_custom_error_message() {
        let err = Cmd::new("false") // `false` always exits with 1
            .error_msg("Custom install step failed")
            .run()
            .unwrap_err();

        assert!(err.to_string().contains("Custom install step failed"));
    }

    #[test]
    fn test_allow_fail() {
        let result = Cmd::new("false").allow_fail().run().unwrap();

        assert!(!result.success());
        assert_eq!(result.code(), 1);
    }

    #[test]
    fn test_run_in_directory() {
        let result = Cmd::new("pwd").dir(Path::new("/tmp")).run().unwrap();
        assert!(result.stdout_trimmed().contains("tmp"));
    }

    #[test]
    fn test_combined_merges_streams() {
        let result = Cmd::new("sh")
            .args(["-c", "echo out; echo err >&2"])
            .run()
            .unwrap();

        let combined = result.combined();
        assert!(combined.contains("out"));
        assert!(combined.contains("err"));
    }
}
