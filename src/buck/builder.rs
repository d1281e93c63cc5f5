//! Orchestrates build-map construction and keeps the artifact tree in
//! sync, exposing full, incremental, fast-incremental and lazy rebuild
//! flavors.
//!
//! Callers pick the cheapest flavor whose preconditions hold: a full
//! incremental build whenever the target set may have changed, the
//! normalized variant when it has not, and the fast variant when
//! additionally no changed file affects generated code (e.g. no recipe
//! file changed).

use crate::{
    artifacts,
    buck::{
        interface::{BuildResult, ChangedTargets, Classic, Lazy},
        Target,
    },
    buildmap::{BuildMap, IndexedBuildMap},
    error::Result,
    module::PathEvent,
};
use std::path::{Path, PathBuf};

/// The result of one (re)build: the new build map, the targets that
/// survived merging, and the artifact-path events describing how the
/// artifact tree changed, ready to feed the module tracker.
#[derive(Clone, Debug)]
pub struct BuildOutcome {
    pub build_map: BuildMap,
    pub targets: Vec<Target>,
    pub events: Vec<PathEvent>,
}

/// Drives the classic interface against a fixed pair of roots.
#[derive(Clone, Debug)]
pub struct Builder {
    interface: Classic,
    source_root: PathBuf,
    artifact_root: PathBuf,
}

impl Builder {
    pub fn new(
        interface: Classic,
        source_root: impl Into<PathBuf>,
        artifact_root: impl Into<PathBuf>,
    ) -> Self {
        Self { interface, source_root: source_root.into(), artifact_root: artifact_root.into() }
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn artifact_root(&self) -> &Path {
        &self.artifact_root
    }

    /// Cold build: normalize the target patterns, construct the build map
    /// from scratch and populate a cleared artifact root.
    pub async fn build(&self, target_specs: &[String]) -> Result<BuildOutcome> {
        info!(specs = target_specs.len(), "starting cold build");
        let targets = self.interface.normalize_targets(target_specs).await?;
        let BuildResult { build_map, targets } =
            self.interface.construct_build_map(&targets, &self.source_root).await?;
        artifacts::clear(&self.artifact_root).await?;
        artifacts::populate(&self.source_root, &self.artifact_root, &build_map).await?;
        Ok(BuildOutcome { build_map, targets, events: Vec::new() })
    }

    /// Re-normalizes targets and reconstructs the build map from scratch.
    /// The most expensive incremental flavor; needed whenever the target
    /// set may have changed.
    pub async fn full_incremental_build(
        &self,
        old_build_map: &BuildMap,
        target_specs: &[String],
    ) -> Result<BuildOutcome> {
        info!(specs = target_specs.len(), "starting full incremental build");
        let targets = self.interface.normalize_targets(target_specs).await?;
        self.incremental_build_with_normalized_targets(old_build_map, &targets).await
    }

    /// Reconstructs the build map for an unchanged target set.
    pub async fn incremental_build_with_normalized_targets(
        &self,
        old_build_map: &BuildMap,
        targets: &[Target],
    ) -> Result<BuildOutcome> {
        info!(targets = targets.len(), "starting incremental build");
        let BuildResult { build_map, targets } =
            self.interface.construct_build_map(targets, &self.source_root).await?;
        self.apply(old_build_map, build_map, targets).await
    }

    /// Splices per-file partial maps into the previous build map without
    /// rebuilding.
    ///
    /// Sound only when the target set is unchanged and none of the changed
    /// files affects generated code: owning targets are re-queried for
    /// their current sources, removed sources drop their artifact entries,
    /// and everything else is carried over.
    pub async fn fast_incremental_build(
        &self,
        old_build_map: &BuildMap,
        targets: &[Target],
        changed_paths: &[PathBuf],
        removed_paths: &[PathBuf],
    ) -> Result<BuildOutcome> {
        info!(
            changed = changed_paths.len(),
            removed = removed_paths.len(),
            "starting fast incremental build"
        );
        let changed_targets =
            self.interface.query_changed_targets(targets, changed_paths).await?;

        let index = old_build_map.index();
        let removed_artifacts: Vec<PathBuf> = removed_paths
            .iter()
            .flat_map(|source| index.lookup_artifact(source).to_vec())
            .collect();
        let build_map = old_build_map
            .without_artifacts(removed_artifacts.iter().map(PathBuf::as_path))
            .overlaid_with(changed_targets.iter().flat_map(ChangedTargets::build_map_pairs));

        self.apply(old_build_map, build_map, targets.to_vec()).await
    }

    /// Materializes the artifact root from a previously saved build map
    /// without consulting the build tool. Used on cold start from a
    /// snapshot.
    pub async fn restore(&self, build_map: &BuildMap) -> Result<()> {
        info!(entries = build_map.len(), "restoring artifact root from a saved build map");
        artifacts::clear(&self.artifact_root).await?;
        artifacts::populate(&self.source_root, &self.artifact_root, build_map).await?;
        Ok(())
    }

    /// The absolute source location behind an absolute artifact path.
    pub fn lookup_source(&self, index: &IndexedBuildMap, artifact_path: &Path) -> Option<PathBuf> {
        lookup_source(index, &self.source_root, &self.artifact_root, artifact_path)
    }

    /// All absolute artifact locations of an absolute source path.
    pub fn lookup_artifact(&self, index: &IndexedBuildMap, source_path: &Path) -> Vec<PathBuf> {
        lookup_artifact(index, &self.source_root, &self.artifact_root, source_path)
    }

    async fn apply(
        &self,
        old_build_map: &BuildMap,
        build_map: BuildMap,
        targets: Vec<Target>,
    ) -> Result<BuildOutcome> {
        let difference = BuildMap::difference(old_build_map, &build_map);
        debug!(changes = difference.len(), "applying build map difference");
        artifacts::update(&self.source_root, &self.artifact_root, &difference).await?;
        let events = artifacts::difference_to_events(&self.artifact_root, &difference);
        Ok(BuildOutcome { build_map, targets, events })
    }
}

/// Drives the lazy interface: only the targets owning the working set are
/// ever built, and newly built entries are layered over the previous map.
#[derive(Clone, Debug)]
pub struct LazyBuilder {
    interface: Lazy,
    source_root: PathBuf,
    artifact_root: PathBuf,
}

impl LazyBuilder {
    pub fn new(
        interface: Lazy,
        source_root: impl Into<PathBuf>,
        artifact_root: impl Into<PathBuf>,
    ) -> Self {
        Self { interface, source_root: source_root.into(), artifact_root: artifact_root.into() }
    }

    /// Builds the owners of the working set and layers the resulting
    /// entries over the previous build map. Pass an empty previous map on
    /// cold start.
    pub async fn build(
        &self,
        old_build_map: &BuildMap,
        working_set: &[PathBuf],
    ) -> Result<BuildOutcome> {
        self.incremental_build(old_build_map, working_set, &[]).await
    }

    /// Like [`Self::build`], additionally dropping the artifact entries of
    /// sources that no longer exist.
    pub async fn incremental_build(
        &self,
        old_build_map: &BuildMap,
        working_set: &[PathBuf],
        removed_paths: &[PathBuf],
    ) -> Result<BuildOutcome> {
        info!(
            working_set = working_set.len(),
            removed = removed_paths.len(),
            "starting lazy build"
        );
        let built = self.interface.construct_build_map(working_set).await?;

        let index = old_build_map.index();
        let removed_artifacts: Vec<PathBuf> = removed_paths
            .iter()
            .flat_map(|source| index.lookup_artifact(source).to_vec())
            .collect();
        let build_map = old_build_map
            .without_artifacts(removed_artifacts.iter().map(PathBuf::as_path))
            .overlaid_with(built.iter().map(|(artifact, source)| (artifact, source)));

        let difference = BuildMap::difference(old_build_map, &build_map);
        artifacts::update(&self.source_root, &self.artifact_root, &difference).await?;
        let events = artifacts::difference_to_events(&self.artifact_root, &difference);
        // the lazy builder reports no per-target survivor list
        Ok(BuildOutcome { build_map, targets: Vec::new(), events })
    }

    /// See [`Builder::restore`].
    pub async fn restore(&self, build_map: &BuildMap) -> Result<()> {
        info!(entries = build_map.len(), "restoring artifact root from a saved build map");
        artifacts::clear(&self.artifact_root).await?;
        artifacts::populate(&self.source_root, &self.artifact_root, build_map).await?;
        Ok(())
    }

    pub fn lookup_source(&self, index: &IndexedBuildMap, artifact_path: &Path) -> Option<PathBuf> {
        lookup_source(index, &self.source_root, &self.artifact_root, artifact_path)
    }

    pub fn lookup_artifact(&self, index: &IndexedBuildMap, source_path: &Path) -> Vec<PathBuf> {
        lookup_artifact(index, &self.source_root, &self.artifact_root, source_path)
    }
}

fn lookup_source(
    index: &IndexedBuildMap,
    source_root: &Path,
    artifact_root: &Path,
    artifact_path: &Path,
) -> Option<PathBuf> {
    let relative = artifact_path.strip_prefix(artifact_root).ok()?;
    index.lookup_source(relative).map(|source| source_root.join(source))
}

fn lookup_artifact(
    index: &IndexedBuildMap,
    source_root: &Path,
    artifact_root: &Path,
    source_path: &Path,
) -> Vec<PathBuf> {
    match source_path.strip_prefix(source_root) {
        Ok(relative) => index
            .lookup_artifact(relative)
            .iter()
            .map(|artifact| artifact_root.join(artifact))
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn lookups_translate_between_absolute_roots() {
        let build_map = BuildMap::from_pairs_lenient([
            ("pkg/a.py", "src/a.py"),
            ("other/a.py", "src/a.py"),
        ]);
        let index = build_map.index();
        let source_root = Path::new("/data/source");
        let artifact_root = Path::new("/data/artifact");

        assert_eq!(
            lookup_source(&index, source_root, artifact_root, Path::new("/data/artifact/pkg/a.py")),
            Some(PathBuf::from("/data/source/src/a.py"))
        );
        assert_eq!(
            lookup_source(&index, source_root, artifact_root, Path::new("/data/artifact/nope.py")),
            None
        );
        // paths outside the artifact root are unknown
        assert_eq!(
            lookup_source(&index, source_root, artifact_root, Path::new("/tmp/pkg/a.py")),
            None
        );

        assert_eq!(
            lookup_artifact(&index, source_root, artifact_root, Path::new("/data/source/src/a.py")),
            vec![
                PathBuf::from("/data/artifact/other/a.py"),
                PathBuf::from("/data/artifact/pkg/a.py"),
            ]
        );
        assert_eq!(
            lookup_artifact(&index, source_root, artifact_root, Path::new("/tmp/src/a.py")),
            Vec::<PathBuf>::new()
        );
    }
}
