//! The top-level driver: one value owning the build orchestrator, the
//! materialized build map and the module tracker, exposing the
//! cold-start, incremental-update and saved-state entry points analysis
//! servers need.
//!
//! Data flows in one direction: the builder produces a build map and a
//! set of artifact-path events, the artifact tree is patched, and the
//! tracker folds the events into module updates handed back to the
//! caller. The driver is the single writer; readers consult the tracker
//! view between updates.

use crate::{
    buck::{
        builder::{BuildOutcome, Builder, LazyBuilder},
        interface,
        Target,
    },
    buildmap::{BuildMap, IndexedBuildMap},
    config::PathsConfig,
    error::{Result, SourceDbError},
    module::{
        tracker::{ModuleLookup, ModuleTracker, ModuleUpdate, ModuleView},
        ModulePath, Qualifier,
    },
    state::SavedState,
    store::SharedStore,
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

/// File names whose change can alter the target set or the generated
/// code, making the fast incremental path unsound.
const RECIPE_FILE_NAMES: &[&str] = &["BUCK", "TARGETS"];

/// Whether the path is a build recipe rather than a source file.
pub fn is_recipe_file(path: &Path) -> bool {
    match path.file_name().and_then(|name| name.to_str()) {
        Some(name) => RECIPE_FILE_NAMES.contains(&name) || name.ends_with(".bzl"),
        None => false,
    }
}

#[derive(Clone, Debug)]
enum BuildFlavor {
    Classic(Builder),
    Lazy(LazyBuilder),
}

/// A running build-and-track session.
///
/// Constructed through [`BuildSystemBuilder`], either with a cold build
/// or from a saved state.
#[derive(Debug)]
pub struct BuildSystem {
    flavor: BuildFlavor,
    tracker: ModuleTracker,
    target_specs: Vec<String>,
    targets: Vec<Target>,
    build_map: BuildMap,
    index: IndexedBuildMap,
}

impl BuildSystem {
    /// Convenience function to call `BuildSystemBuilder::default()`.
    pub fn builder() -> BuildSystemBuilder {
        BuildSystemBuilder::default()
    }

    /// The current build map. Treat as immutable; updates replace it.
    pub fn build_map(&self) -> &BuildMap {
        &self.build_map
    }

    /// The targets that survived the last merge. Empty for the lazy
    /// flavor.
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// The tracker's read view.
    pub fn tracker(&self) -> &ModuleTracker {
        &self.tracker
    }

    /// The absolute source location behind an absolute artifact path.
    pub fn lookup_source(&self, artifact_path: &Path) -> Option<PathBuf> {
        match &self.flavor {
            BuildFlavor::Classic(builder) => builder.lookup_source(&self.index, artifact_path),
            BuildFlavor::Lazy(builder) => builder.lookup_source(&self.index, artifact_path),
        }
    }

    /// All absolute artifact locations of an absolute source path.
    pub fn lookup_artifact(&self, source_path: &Path) -> Vec<PathBuf> {
        match &self.flavor {
            BuildFlavor::Classic(builder) => builder.lookup_artifact(&self.index, source_path),
            BuildFlavor::Lazy(builder) => builder.lookup_artifact(&self.index, source_path),
        }
    }

    /// Rebuilds after source changes and returns the affected module
    /// updates.
    ///
    /// The cheapest build variant whose preconditions hold is selected:
    /// a recipe-file change forces re-normalization and a rebuild from
    /// scratch, anything else takes the fast path that splices owner
    /// partials into the previous map. The lazy flavor rebuilds the
    /// owners of the changed paths. Paths are relative to the source
    /// root.
    pub async fn process_source_changes(
        &mut self,
        changed_paths: &[PathBuf],
        removed_paths: &[PathBuf],
    ) -> Result<Vec<ModuleUpdate>> {
        let recipe_changed = changed_paths
            .iter()
            .chain(removed_paths)
            .any(|path| is_recipe_file(path));

        let outcome = match &self.flavor {
            BuildFlavor::Classic(builder) => {
                if recipe_changed {
                    builder.full_incremental_build(&self.build_map, &self.target_specs).await?
                } else {
                    builder
                        .fast_incremental_build(
                            &self.build_map,
                            &self.targets,
                            changed_paths,
                            removed_paths,
                        )
                        .await?
                }
            }
            BuildFlavor::Lazy(builder) => {
                builder
                    .incremental_build(&self.build_map, changed_paths, removed_paths)
                    .await?
            }
        };
        Ok(self.absorb(outcome))
    }

    /// Extends the lazy working set with additional source paths, building
    /// their owners. A no-op for the classic flavor, whose build map
    /// already covers every normalized target.
    pub async fn update_working_set(
        &mut self,
        working_set: &[PathBuf],
    ) -> Result<Vec<ModuleUpdate>> {
        match &self.flavor {
            BuildFlavor::Classic(_) => {
                trace!("ignoring working set update for an eagerly built session");
                Ok(Vec::new())
            }
            BuildFlavor::Lazy(builder) => {
                let outcome = builder.build(&self.build_map, working_set).await?;
                Ok(self.absorb(outcome))
            }
        }
    }

    /// A snapshot sufficient to restart this session without the build
    /// tool.
    pub fn saved_state(&self) -> SavedState {
        SavedState::new(self.target_specs.clone(), self.targets.clone(), self.build_map.clone())
    }

    fn absorb(&mut self, outcome: BuildOutcome) -> Vec<ModuleUpdate> {
        let BuildOutcome { build_map, targets, events } = outcome;
        self.index = build_map.index();
        self.build_map = build_map;
        if matches!(self.flavor, BuildFlavor::Classic(_)) {
            self.targets = targets;
        }
        self.tracker.process_events(&events)
    }
}

impl ModuleView for BuildSystem {
    fn look_up_qualifier(&self, qualifier: &Qualifier) -> ModuleLookup {
        self.tracker.look_up_qualifier(qualifier)
    }

    fn code_of_module_path(&self, module_path: &ModulePath) -> Result<String> {
        self.tracker.code_of_module_path(module_path)
    }
}

#[derive(Clone, Debug)]
enum InterfaceFlavor {
    Classic(interface::Classic),
    Lazy(interface::Lazy),
}

/// Builder for [`BuildSystem`].
#[derive(Debug, Default)]
pub struct BuildSystemBuilder {
    paths: Option<PathsConfig>,
    interface: Option<InterfaceFlavor>,
    store: Option<Arc<SharedStore>>,
    lazy_tracking: bool,
}

impl BuildSystemBuilder {
    #[must_use]
    pub fn paths(mut self, paths: PathsConfig) -> Self {
        self.paths = Some(paths);
        self
    }

    /// Uses the classic interface: a fixed target set, eagerly built.
    #[must_use]
    pub fn classic(mut self, interface: interface::Classic) -> Self {
        self.interface = Some(InterfaceFlavor::Classic(interface));
        self
    }

    /// Uses the lazy interface: only the owners of the working set are
    /// built.
    #[must_use]
    pub fn lazy(mut self, interface: interface::Lazy) -> Self {
        self.interface = Some(InterfaceFlavor::Lazy(interface));
        self
    }

    /// The store backing lazy-tracking caches. A fresh one is created if
    /// not provided.
    #[must_use]
    pub fn store(mut self, store: Arc<SharedStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Selects the lazy module tracker instead of the eager crawl.
    #[must_use]
    pub fn lazy_tracking(mut self, lazy_tracking: bool) -> Self {
        self.lazy_tracking = lazy_tracking;
        self
    }

    /// Builds from scratch: normalizes the target patterns, constructs
    /// the build map, materializes the artifact root and indexes modules.
    ///
    /// For the lazy flavor the patterns are ignored and the session
    /// starts with an empty build map; use
    /// [`BuildSystem::update_working_set`] to populate it.
    pub async fn cold_start(self, target_specs: &[String]) -> Result<BuildSystem> {
        let (paths, flavor, store, lazy_tracking) = self.into_parts()?;

        let (outcome, target_specs) = match &flavor {
            BuildFlavor::Classic(builder) => {
                (builder.build(target_specs).await?, target_specs.to_vec())
            }
            BuildFlavor::Lazy(builder) => {
                // materialization validates the (empty) roots
                builder.restore(&BuildMap::default()).await?;
                let outcome = BuildOutcome {
                    build_map: BuildMap::default(),
                    targets: Vec::new(),
                    events: Vec::new(),
                };
                (outcome, Vec::new())
            }
        };

        let tracker = make_tracker(paths, store, lazy_tracking);
        let index = outcome.build_map.index();
        Ok(BuildSystem {
            flavor,
            tracker,
            target_specs,
            targets: outcome.targets,
            build_map: outcome.build_map,
            index,
        })
    }

    /// Restores a session from a saved state: the artifact root is
    /// materialized from the saved build map without consulting the build
    /// tool.
    pub async fn from_saved_state(self, saved: SavedState) -> Result<BuildSystem> {
        let (paths, flavor, store, lazy_tracking) = self.into_parts()?;
        let target_specs = saved.target_specs;
        let targets = saved.targets;
        let build_map = saved.build_map;

        match &flavor {
            BuildFlavor::Classic(builder) => builder.restore(&build_map).await?,
            BuildFlavor::Lazy(builder) => builder.restore(&build_map).await?,
        }

        let tracker = make_tracker(paths, store, lazy_tracking);
        let index = build_map.index();
        Ok(BuildSystem { flavor, tracker, target_specs, targets, build_map, index })
    }

    fn into_parts(self) -> Result<(PathsConfig, BuildFlavor, Arc<SharedStore>, bool)> {
        let Self { paths, interface, store, lazy_tracking } = self;
        let paths =
            paths.ok_or_else(|| SourceDbError::msg("build system lacks a paths config"))?;
        let interface = interface
            .ok_or_else(|| SourceDbError::msg("build system lacks a build interface"))?;
        let store = store.unwrap_or_default();
        let flavor = match interface {
            InterfaceFlavor::Classic(interface) => BuildFlavor::Classic(Builder::new(
                interface,
                &paths.source_root,
                &paths.artifact_root,
            )),
            InterfaceFlavor::Lazy(interface) => BuildFlavor::Lazy(LazyBuilder::new(
                interface,
                &paths.source_root,
                &paths.artifact_root,
            )),
        };
        Ok((paths, flavor, store, lazy_tracking))
    }
}

fn make_tracker(
    paths: PathsConfig,
    store: Arc<SharedStore>,
    lazy_tracking: bool,
) -> ModuleTracker {
    if lazy_tracking {
        ModuleTracker::lazy(paths, store)
    } else {
        ModuleTracker::eager(paths)
    }
}
