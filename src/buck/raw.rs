//! A narrow interface wrapping invocations of the external build tool.
//!
//! Two command families are exposed: queries, which describe targets, and
//! builds, which force artifact generation. Both return the tool's JSON
//! output. Diagnostic output is retained in a bounded tail and embedded in
//! the error when the tool fails, together with the full argument vector,
//! so a failing invocation can be replayed verbatim.

use crate::error::ToolError;
use itertools::Itertools;
use serde_json::Value;
use std::{path::PathBuf, process::Stdio};
use tokio::process::Command;

/// How many trailing lines of diagnostic output are kept per invocation.
pub const LOG_TAIL_LINES: usize = 100;

/// Which major version of the build tool is being driven. The two versions
/// ship as different executables and differ in flag spelling and flavored
/// target syntax.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolVersion {
    V1,
    V2,
}

/// Knobs forwarded unchanged to every invocation.
#[derive(Clone, Debug, Default)]
pub struct InvocationOptions {
    /// Build mode, passed as a leading `@mode` argument.
    pub mode: Option<String>,
    /// Keeps this consumer's daemon state separate from interactive use.
    pub isolation_prefix: Option<String>,
}

impl InvocationOptions {
    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    pub fn with_isolation_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.isolation_prefix = Some(prefix.into());
        self
    }
}

/// Abstraction over the build tool's command line.
#[derive(Clone, Debug)]
pub struct Raw {
    executable: PathBuf,
    version: ToolVersion,
}

impl Raw {
    /// Drives the version-1 tool, `buck` on the search path.
    pub fn v1() -> Self {
        Self { executable: PathBuf::from("buck"), version: ToolVersion::V1 }
    }

    /// Drives the version-2 tool, `buck2` on the search path.
    pub fn v2() -> Self {
        Self { executable: PathBuf::from("buck2"), version: ToolVersion::V2 }
    }

    /// Overrides the executable location.
    #[must_use]
    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = executable.into();
        self
    }

    pub fn version(&self) -> ToolVersion {
        self.version
    }

    /// Issues a query describing targets; the reply is JSON.
    pub async fn query(
        &self,
        options: &InvocationOptions,
        args: &[String],
    ) -> Result<Value, ToolError> {
        let subcommand = match self.version {
            ToolVersion::V1 => "query",
            ToolVersion::V2 => "uquery",
        };
        self.invoke(subcommand, options, args).await
    }

    /// Forces artifact generation; the reply is JSON describing output
    /// locations.
    pub async fn build(
        &self,
        options: &InvocationOptions,
        args: &[String],
    ) -> Result<Value, ToolError> {
        self.invoke("build", options, args).await
    }

    /// Runs a dedicated builder script (version 2 only).
    pub async fn bxl(
        &self,
        options: &InvocationOptions,
        args: &[String],
    ) -> Result<Value, ToolError> {
        self.invoke("bxl", options, args).await
    }

    async fn invoke(
        &self,
        subcommand: &str,
        options: &InvocationOptions,
        extra_args: &[String],
    ) -> Result<Value, ToolError> {
        let mut args: Vec<String> = Vec::with_capacity(extra_args.len() + 4);
        if let Some(prefix) = &options.isolation_prefix {
            match self.version {
                ToolVersion::V1 => {
                    args.push("--isolation_prefix".to_string());
                    args.push(prefix.clone());
                }
                ToolVersion::V2 => {
                    args.push("--isolation-dir".to_string());
                    args.push(prefix.clone());
                }
            }
        }
        args.push(subcommand.to_string());
        if let Some(mode) = &options.mode {
            args.push(format!("@{mode}"));
        }
        args.extend(extra_args.iter().cloned());

        debug!(
            command = %self.executable.display(),
            args = %args.iter().join(" "),
            "invoking build tool"
        );
        let output = Command::new(&self.executable)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|err| self.error(&args, format!("could not be launched: {err}"), None, Vec::new()))?;

        let logs = log_tail(&output.stderr);
        if !output.status.success() {
            let description = match output.status.code() {
                Some(_) => "exited with non-zero status".to_string(),
                None => "did not exit cleanly".to_string(),
            };
            return Err(self.error(&args, description, output.status.code(), logs));
        }
        serde_json::from_slice(&output.stdout).map_err(|err| {
            self.error(
                &args,
                format!("produced output that is not valid JSON: {err}"),
                output.status.code(),
                logs,
            )
        })
    }

    fn error(
        &self,
        args: &[String],
        description: String,
        exit_code: Option<i32>,
        logs: Vec<String>,
    ) -> ToolError {
        ToolError {
            command: self.executable.display().to_string(),
            args: args.to_vec(),
            description,
            exit_code,
            logs,
        }
    }
}

fn log_tail(stderr: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(LOG_TAIL_LINES);
    lines[start..].iter().map(|line| line.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::Path;

    /// Writes an executable shell script standing in for the build tool.
    fn fake_tool(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-buck");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut permissions = std::fs::metadata(&path).unwrap().permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(&path, permissions).unwrap();
        path
    }

    #[tokio::test]
    async fn query_returns_parsed_json() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path(), r#"echo '{"//foo:bar": ["//foo:bar-lib"]}'"#);
        let raw = Raw::v2().with_executable(tool);

        let value = raw.query(&InvocationOptions::default(), &[]).await.unwrap();
        assert_eq!(value["//foo:bar"][0], "//foo:bar-lib");
    }

    #[tokio::test]
    async fn subcommand_mode_and_isolation_are_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        // the fake tool echoes its arguments back as a JSON array
        let tool = fake_tool(
            dir.path(),
            r#"printf '['; sep=''; for arg in "$@"; do printf '%s"%s"' "$sep" "$arg"; sep=','; done; printf ']'"#,
        );
        let raw = Raw::v2().with_executable(tool);
        let options =
            InvocationOptions::default().with_mode("mode/dev").with_isolation_prefix(".analysis");

        let value = raw
            .build(&options, &["//foo:bar".to_string()])
            .await
            .unwrap();
        let args: Vec<String> =
            serde_json::from_value(value).unwrap();
        assert_eq!(
            args,
            vec!["--isolation-dir", ".analysis", "build", "@mode/dev", "//foo:bar"]
        );
    }

    #[tokio::test]
    async fn failing_invocations_carry_code_and_log_tail() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path(), "echo 'first line' >&2; echo 'last line' >&2; exit 3");
        let raw = Raw::v1().with_executable(tool);

        let err = raw.query(&InvocationOptions::default(), &["deps(...)".to_string()]).await.unwrap_err();
        assert_eq!(err.exit_code, Some(3));
        assert_eq!(err.logs, vec!["first line", "last line"]);
        assert_eq!(err.args, vec!["query", "deps(...)"]);
        assert!(err.to_string().contains("exit code 3"));
    }

    #[tokio::test]
    async fn signal_termination_has_no_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path(), "kill -TERM $$");
        let raw = Raw::v2().with_executable(tool);

        let err = raw.query(&InvocationOptions::default(), &[]).await.unwrap_err();
        assert_eq!(err.exit_code, None);
        assert!(err.to_string().contains("terminated by signal"));
    }

    #[tokio::test]
    async fn non_json_output_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path(), "echo 'this is not json'");
        let raw = Raw::v2().with_executable(tool);

        let err = raw.query(&InvocationOptions::default(), &[]).await.unwrap_err();
        assert!(err.description.contains("not valid JSON"));
    }

    #[tokio::test]
    async fn missing_executable_is_an_error() {
        let raw = Raw::v2().with_executable("/nonexistent/buck2");
        let err = raw.query(&InvocationOptions::default(), &[]).await.unwrap_err();
        assert!(err.description.contains("could not be launched"));
    }

    #[test]
    fn log_tail_is_bounded() {
        let many_lines: String =
            (0..LOG_TAIL_LINES + 10).map(|i| format!("line {i}\n")).collect();
        let tail = log_tail(many_lines.as_bytes());
        assert_eq!(tail.len(), LOG_TAIL_LINES);
        assert_eq!(tail[0], "line 10");
    }
}
