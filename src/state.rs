//! The saved-state file: enough of a finished build to restart analysis
//! without consulting the build tool.

use crate::{
    buck::Target,
    buildmap::BuildMap,
    error::Result,
    store::UnusedReason,
    utils,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Bumped whenever the on-disk layout changes; a mismatch on read yields
/// [`UnusedReason::Stale`].
const STATE_FORMAT_VERSION: &str = "sourcedb-state-1";

/// A snapshot of a finished build: the surviving targets and the merged
/// build map.
///
/// On a cold start the snapshot lets the orchestrator re-materialize the
/// artifact root and resume incremental operation immediately; the build
/// tool is only consulted again when sources change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedState {
    #[serde(rename = "_format")]
    format: String,
    /// The target patterns the session was started with; full incremental
    /// rebuilds re-normalize these.
    #[serde(default)]
    pub target_specs: Vec<String>,
    pub targets: Vec<Target>,
    pub build_map: BuildMap,
}

impl SavedState {
    pub fn new(target_specs: Vec<String>, targets: Vec<Target>, build_map: BuildMap) -> Self {
        Self { format: STATE_FORMAT_VERSION.to_string(), target_specs, targets, build_map }
    }

    /// Writes the snapshot as a JSON file.
    pub fn write(&self, path: &Path) -> Result<()> {
        trace!(path = %path.display(), entries = self.build_map.len(), "writing saved state");
        utils::create_parent_dir_all(path)?;
        utils::write_json_file(self, path)
    }

    /// Reads a previously written snapshot.
    ///
    /// Unreadable or incompatible snapshots are reported as
    /// [`UnusedReason`] values; the caller recovers with a cold build.
    pub fn read(path: &Path) -> Result<Self, UnusedReason> {
        let state: Self = utils::read_json_file(path)
            .map_err(|error| UnusedReason::LoadError(error.to_string()))?;
        if state.format != STATE_FORMAT_VERSION {
            return Err(UnusedReason::Stale);
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn saved_state_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("build.json");

        let state = SavedState::new(
            vec!["//proj/...".to_string()],
            vec![Target::new("//proj:foo")],
            BuildMap::from_pairs_lenient([("pkg/a.py", "src/a.py")]),
        );
        state.write(&path).unwrap();
        assert_eq!(SavedState::read(&path).unwrap(), state);
    }

    #[test]
    fn unreadable_state_is_a_load_error() {
        let err = SavedState::read(Path::new("/nonexistent/state.json")).unwrap_err();
        assert!(matches!(err, UnusedReason::LoadError(_)));
    }

    #[test]
    fn incompatible_state_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(
            &path,
            r#"{"_format": "someone-elses-version", "targets": [], "build_map": {}}"#,
        )
        .unwrap();
        assert_eq!(SavedState::read(&path).unwrap_err(), UnusedReason::Stale);
    }
}
