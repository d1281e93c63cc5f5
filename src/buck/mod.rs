//! Driving the external build tool: raw command invocation, target
//! normalization, build-map construction and incremental orchestration.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod builder;
pub mod interface;
pub mod raw;

pub use builder::{BuildOutcome, Builder, LazyBuilder};
pub use interface::{BuildResult, ChangedTargets};
pub use raw::{InvocationOptions, Raw, ToolVersion};

/// A concrete build target label, e.g. `//foo/bar:library`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Target(String);

impl Target {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Target {
    fn from(label: &str) -> Self {
        Self::new(label)
    }
}
