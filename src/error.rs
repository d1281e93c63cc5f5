//! Error types for build-map construction and module tracking.

use std::{
    fmt,
    io,
    path::{Path, PathBuf},
};

pub type Result<T, E = SourceDbError> = std::result::Result<T, E>;

/// Various errors that can occur while constructing build maps, driving the
/// external build tool or answering module queries.
#[derive(Debug, thiserror::Error)]
pub enum SourceDbError {
    /// The external build tool failed. Fatal for the current operation.
    #[error(transparent)]
    Tool(#[from] ToolError),
    /// External JSON input was malformed. Fatal for the current operation.
    #[error("failed to parse {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
    /// A filesystem mutation under the artifact root failed.
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Io(#[from] SourceDbIoError),
    /// Two build-map partials disagreed and the caller opted into strict
    /// merging.
    #[error(transparent)]
    MergeConflict(#[from] MergeConflict),
    /// A query referred to a path unknown to the module tracker.
    #[error("path is not tracked by the module tracker: {}", .0.display())]
    ModuleNotTracked(PathBuf),
    /// General purpose message.
    #[error("{0}")]
    Message(String),
}

impl SourceDbError {
    pub fn io(err: io::Error, path: impl Into<PathBuf>) -> Self {
        SourceDbIoError::new(err, path).into()
    }

    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        SourceDbError::Json { context: context.into(), source }
    }

    pub fn msg(msg: impl fmt::Display) -> Self {
        SourceDbError::Message(msg.to_string())
    }
}

/// An `io::Error` with the path it occurred on attached.
#[derive(Debug, thiserror::Error)]
#[error("\"{}\": {io}", .path.display())]
pub struct SourceDbIoError {
    io: io::Error,
    path: PathBuf,
}

impl SourceDbIoError {
    pub fn new(io: io::Error, path: impl Into<PathBuf>) -> Self {
        Self { io, path: path.into() }
    }

    /// The path at which the error occurred.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn into_inner(self) -> io::Error {
        self.io
    }
}

/// An invocation of the external build tool that did not produce usable
/// output.
///
/// Carries the full argument vector so the failing invocation can be
/// reproduced verbatim, together with a bounded tail of the tool's
/// diagnostic output.
#[derive(Debug)]
pub struct ToolError {
    /// The executable that was invoked, e.g. `buck2`.
    pub command: String,
    /// The full argument vector, excluding the executable itself.
    pub args: Vec<String>,
    /// Human readable description of what went wrong.
    pub description: String,
    /// Exit code of the process. `None` when the process was terminated by
    /// a signal.
    pub exit_code: Option<i32>,
    /// The last lines of the tool's diagnostic output.
    pub logs: Vec<String>,
}

impl ToolError {
    /// The command line of the failing invocation, suitable for replaying.
    pub fn command_line(&self) -> String {
        let mut line = self.command.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}` {}", self.command_line(), self.description)?;
        match self.exit_code {
            Some(code) => write!(f, " (exit code {code})")?,
            None => write!(f, " (terminated by signal)")?,
        }
        if !self.logs.is_empty() {
            write!(f, "\n{}", self.logs.join("\n"))?;
        }
        Ok(())
    }
}

impl std::error::Error for ToolError {}

/// Two build-map partials mapped the same artifact to different sources.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "artifact \"{}\" maps to both \"{}\" and \"{}\"",
    .key.display(),
    .left.display(),
    .right.display()
)]
pub struct MergeConflict {
    pub key: PathBuf,
    pub left: PathBuf,
    pub right: PathBuf,
}

/// A filesystem operation under the artifact root failed.
///
/// Always returned as a value; the materializer never panics on filesystem
/// trouble.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("\"{}\" is not a directory", .0.display())]
    NotADirectory(PathBuf),
    #[error("cannot create directory \"{}\": {source}", .path.display())]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot create symlink at \"{}\": {source}", .path.display())]
    CreateLink {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot remove symlink at \"{}\": {source}", .path.display())]
    RemoveLink {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_error_display_contains_command_line() {
        let err = ToolError {
            command: "buck2".to_string(),
            args: vec!["build".to_string(), "//foo:bar".to_string()],
            description: "exited with non-zero status".to_string(),
            exit_code: Some(1),
            logs: vec!["something went wrong".to_string()],
        };
        let rendered = err.to_string();
        assert!(rendered.contains("`buck2 build //foo:bar`"));
        assert!(rendered.contains("exit code 1"));
        assert!(rendered.contains("something went wrong"));
    }

    #[test]
    fn tool_error_display_signal() {
        let err = ToolError {
            command: "buck".to_string(),
            args: vec!["query".to_string()],
            description: "did not exit cleanly".to_string(),
            exit_code: None,
            logs: Vec::new(),
        };
        assert!(err.to_string().contains("terminated by signal"));
    }
}
