//! Centralized command execution, adapted from the tool that preceded this
//! one: a builder that always captures stderr and gives command failures a
//! useful error message, plus an interactive mode for long-running builds
//! where the user should see live output.

use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};

use anyhow::{Context, Result};

use crate::error::CommandError;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

/// Builder for configuring command execution. Every spawned process in the
/// strategy executor goes through this, so that working directory, env, and
/// failure messages are handled consistently.
pub struct Cmd {
    program: String,
    args: Vec<String>,
    current_dir: Option<std::path::PathBuf>,
    env: Vec<(String, String)>,
    clear_env: bool,
    allow_fail: bool,
    error_prefix: Option<String>,
}

impl Cmd {
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            current_dir: None,
            env: Vec::new(),
            clear_env: false,
            allow_fail: false,
            error_prefix: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

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

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    pub fn dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    /// Overlay an effective-environment map (phase env ∪ step env) onto
    /// the child's environment.
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (k, v) in vars {
            self.env.push((k.as_ref().to_string(), v.as_ref().to_string()));
        }
        self
    }

    pub fn clear_env(mut self) -> Self {
        self.clear_env = true;
        self
    }

    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    pub fn error_msg(mut self, msg: impl AsRef<str>) -> Self {
        self.error_prefix = Some(msg.as_ref().to_string());
        self
    }

    fn build(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(ref dir) = self.current_dir {
            cmd.current_dir(dir);
        }
        if self.clear_env {
            cmd.env_clear();
        }
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd
    }

    pub fn run(self) -> Result<CommandResult> {
        let mut cmd = self.build();
        let output = cmd
            .output()
            .with_context(|| format!("failed to execute '{}'. is it installed?", self.program))?;

        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !self.allow_fail && !result.success() {
            let prefix = self
                .error_prefix
                .clone()
                .unwrap_or_else(|| format!("'{}' failed", self.program));
            let stderr = result.stderr_trimmed().to_string();
            let context_msg = if stderr.is_empty() {
                format!("{} (exit code {})", prefix, result.code())
            } else {
                format!("{} (exit code {}):\n{}", prefix, result.code(), stderr)
            };
            let cmd_err = CommandError::Failed {
                argv: self.argv(),
                exit_code: result.status.code(),
                stderr,
            };
            return Err(anyhow::Error::new(cmd_err).context(context_msg));
        }

        Ok(result)
    }

    /// Run with inherited stdio. Used for long builds (`make`, `cmake
    /// --build`) where output throttling/streaming is the orchestrator's
    /// concern, not this crate's.
    pub fn run_interactive(self) -> Result<ExitStatus> {
        let mut cmd = self.build();
        cmd.stdin(Stdio::inherit());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        let status = cmd
            .status()
            .with_context(|| format!("failed to execute '{}'. is it installed?", self.program))?;

        if !self.allow_fail && !status.success() {
            let prefix = self
                .error_prefix
                .clone()
                .unwrap_or_else(|| format!("'{}' failed", self.program));
            let context_msg = format!("{} (exit code {})", prefix, status.code().unwrap_or(-1));
            let cmd_err = CommandError::Failed {
                argv: self.argv(),
                exit_code: status.code(),
                stderr: String::new(),
            };
            return Err(anyhow::Error::new(cmd_err).context(context_msg));
        }

        Ok(status)
    }

    /// The argv this builder would execute, for failure-report capture.
    pub fn argv(&self) -> Vec<String> {
        let mut v = vec![self.program.clone()];
        v.extend(self.args.iter().cloned());
        v
    }
}

pub fn run<I, S>(program: &str, args: I) -> Result<CommandResult>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    Cmd::new(program).args(args).run()
}

pub fn shell(command: &str) -> Result<CommandResult> {
    run("sh", ["-c", command])
}

pub fn shell_in(command: &str, dir: &Path) -> Result<CommandResult> {
    Cmd::new("sh").args(["-c", command]).dir(dir).run()
}

/// Number of logical CPUs, used for `-j<cpus>` build parallelism.
pub fn cpu_count() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

pub fn which(program: &str) -> Option<String> {
    which::which(program)
        .ok()
        .map(|p| p.to_string_lossy().into_owned())
}

pub fn exists(program: &str) -> bool {
    which(program).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_success() {
        let result = run("echo", ["hello"]).unwrap();
        assert!(result.success());
        assert_eq!(result.stdout_trimmed(), "hello");
    }

    #[test]
    fn run_failure_includes_stderr() {
        let err = run("ls", ["/nonexistent_path_12345"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("No such file") || msg.contains("cannot access"));
    }

    #[test]
    fn allow_fail_suppresses_error() {
        let result = Cmd::new("false").allow_fail().run().unwrap();
        assert!(!result.success());
    }

    #[test]
    fn envs_are_visible_to_child() {
        let result = Cmd::new("sh")
            .args(["-c", "echo $FOO"])
            .envs([("FOO", "bar")])
            .run()
            .unwrap();
        assert_eq!(result.stdout_trimmed(), "bar");
    }

    #[test]
    fn which_missing_is_none() {
        assert!(which("nonexistent_program_12345").is_none());
        assert!(exists("sh"));
    }

    #[test]
    fn argv_reflects_program_and_args() {
        let cmd = Cmd::new("make").args(["-j4", "install"]);
        assert_eq!(cmd.argv(), vec!["make", "-j4", "install"]);
    }
}
