//! End-to-end module tracking over a materialized artifact tree: the
//! build map is realized as symlinks, the tracker indexes the artifact
//! view, and incremental build deltas flow through to module updates.

use pretty_assertions::assert_eq;
use sourcedb::{
    artifacts, BuildMap, CodeUpdate, ModuleLookup, ModuleTracker, ModuleUpdate, ModuleView,
    Overlay, PathsConfig, Qualifier, SearchRoot, SharedStore,
};
use std::{path::PathBuf, sync::Arc};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

struct TestProject {
    _dir: tempfile::TempDir,
    source_root: PathBuf,
    artifact_root: PathBuf,
    typeshed_root: PathBuf,
}

impl TestProject {
    fn new() -> Self {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let source_root = dir.path().join("source");
        let artifact_root = dir.path().join("artifact");
        let typeshed_root = dir.path().join("typeshed");
        std::fs::create_dir_all(&source_root).unwrap();
        std::fs::create_dir_all(&artifact_root).unwrap();
        std::fs::create_dir_all(&typeshed_root).unwrap();
        Self { _dir: dir, source_root, artifact_root, typeshed_root }
    }

    fn config(&self) -> PathsConfig {
        PathsConfig::builder()
            .source_root(&self.source_root)
            .artifact_root(&self.artifact_root)
            .search_root(SearchRoot::source(&self.artifact_root))
            .search_root(SearchRoot::external(&self.typeshed_root))
            .build()
            .unwrap()
    }

    fn write_source(&self, relative: &str, content: &str) {
        let path = self.source_root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn write_typeshed(&self, relative: &str, content: &str) {
        let path = self.typeshed_root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }
}

fn winner_relative(lookup: ModuleLookup) -> String {
    match lookup {
        ModuleLookup::Explicit(module_path) => {
            module_path.raw().relative.to_string_lossy().into_owned()
        }
        other => panic!("expected an explicit module, got {other:?}"),
    }
}

#[tokio::test]
async fn modules_resolve_through_the_materialized_tree() {
    let project = TestProject::new();
    project.write_source("original/layout/mod.py", "x: int = 1\n");

    let build_map = BuildMap::from_pairs_lenient([("pkg/mod.py", "original/layout/mod.py")]);
    artifacts::populate(&project.source_root, &project.artifact_root, &build_map).await.unwrap();

    let tracker = ModuleTracker::eager(project.config());
    let lookup = tracker.look_up_qualifier(&Qualifier::new("pkg.mod"));
    let ModuleLookup::Explicit(module_path) = lookup else {
        panic!("expected an explicit module, got {lookup:?}");
    };
    assert_eq!(module_path.raw().relative, PathBuf::from("pkg/mod.py"));
    assert_eq!(tracker.look_up_qualifier(&Qualifier::new("pkg")), ModuleLookup::Implicit);

    // code reads go through the symlink into the source tree
    assert_eq!(tracker.code_of_module_path(&module_path).unwrap(), "x: int = 1\n");
}

#[tokio::test]
async fn build_deltas_flow_through_to_module_updates() {
    let project = TestProject::new();
    project.write_source("impl/a.py", "a\n");
    project.write_source("impl/b.py", "b\n");

    let original = BuildMap::from_pairs_lenient([("pkg/a.py", "impl/a.py")]);
    artifacts::populate(&project.source_root, &project.artifact_root, &original).await.unwrap();
    let mut tracker = ModuleTracker::eager(project.config());

    // the next build adds pkg/b.py and drops pkg/a.py
    let current = BuildMap::from_pairs_lenient([("pkg/b.py", "impl/b.py")]);
    let difference = BuildMap::difference(&original, &current);
    artifacts::update(&project.source_root, &project.artifact_root, &difference).await.unwrap();
    let events = artifacts::difference_to_events(&project.artifact_root, &difference);

    let updates = tracker.process_events(&events);
    assert_eq!(updates.len(), 2);
    assert!(matches!(
        &updates[0],
        ModuleUpdate::Delete(qualifier) if qualifier == &Qualifier::new("pkg.a")
    ));
    assert!(matches!(
        &updates[1],
        ModuleUpdate::New(module_path) if module_path.qualifier() == &Qualifier::new("pkg.b")
    ));

    assert_eq!(tracker.look_up_qualifier(&Qualifier::new("pkg.a")), ModuleLookup::NotFound);
    assert_eq!(
        winner_relative(tracker.look_up_qualifier(&Qualifier::new("pkg.b"))),
        "pkg/b.py"
    );
    // pkg stays implicit throughout: it kept an explicit child
    assert_eq!(tracker.look_up_qualifier(&Qualifier::new("pkg")), ModuleLookup::Implicit);
}

#[tokio::test]
async fn typeshed_stubs_shadow_materialized_implementations() {
    let project = TestProject::new();
    project.write_source("impl/sqlite.py", "class Connection: ...\n");
    project.write_typeshed("sqlite.pyi", "class Connection: ...\n");

    let build_map = BuildMap::from_pairs_lenient([("sqlite.py", "impl/sqlite.py")]);
    artifacts::populate(&project.source_root, &project.artifact_root, &build_map).await.unwrap();

    // the artifact root is listed first, yet the stub wins
    let tracker = ModuleTracker::eager(project.config());
    let winner = match tracker.look_up_qualifier(&Qualifier::new("sqlite")) {
        ModuleLookup::Explicit(module_path) => module_path,
        other => panic!("expected an explicit module, got {other:?}"),
    };
    assert!(winner.is_stub());
    assert_eq!(winner.raw().root, 1);
    assert!(!winner.raw().should_type_check);
}

#[tokio::test]
async fn lazy_tracker_follows_the_artifact_tree_on_demand() {
    let project = TestProject::new();
    project.write_source("impl/a.py", "a\n");
    project.write_source("impl/late.py", "late\n");

    let original = BuildMap::from_pairs_lenient([("pkg/a.py", "impl/a.py")]);
    artifacts::populate(&project.source_root, &project.artifact_root, &original).await.unwrap();

    let store = Arc::new(SharedStore::new());
    let mut tracker = ModuleTracker::lazy(project.config(), store);

    // an event for a qualifier nobody asked about is skipped entirely
    let current = BuildMap::from_pairs_lenient([
        ("pkg/a.py", "impl/a.py"),
        ("pkg/late.py", "impl/late.py"),
    ]);
    let difference = BuildMap::difference(&original, &current);
    artifacts::update(&project.source_root, &project.artifact_root, &difference).await.unwrap();
    let events = artifacts::difference_to_events(&project.artifact_root, &difference);
    assert_eq!(tracker.process_events(&events), Vec::new());

    // yet the module is discovered on demand afterwards
    assert_eq!(
        winner_relative(tracker.look_up_qualifier(&Qualifier::new("pkg.late"))),
        "pkg/late.py"
    );

    // once asked about, the qualifier reacts to events
    let next = BuildMap::from_pairs_lenient([("pkg/a.py", "impl/a.py")]);
    let difference = BuildMap::difference(&current, &next);
    artifacts::update(&project.source_root, &project.artifact_root, &difference).await.unwrap();
    let events = artifacts::difference_to_events(&project.artifact_root, &difference);
    let updates = tracker.process_events(&events);
    assert_eq!(updates, vec![ModuleUpdate::Delete(Qualifier::new("pkg.late"))]);
    assert_eq!(tracker.look_up_qualifier(&Qualifier::new("pkg.late")), ModuleLookup::NotFound);
}

#[tokio::test]
async fn overlays_serve_unsaved_state_over_the_artifact_view() {
    let project = TestProject::new();
    project.write_source("impl/mod.py", "saved = True\n");

    let build_map = BuildMap::from_pairs_lenient([("pkg/mod.py", "impl/mod.py")]);
    artifacts::populate(&project.source_root, &project.artifact_root, &build_map).await.unwrap();
    let tracker = ModuleTracker::eager(project.config());
    let mut overlay = Overlay::new(&tracker);

    let artifact_path = project.artifact_root.join("pkg/mod.py");
    let updates = overlay
        .update_overlaid_code([(
            artifact_path,
            CodeUpdate::NewCode("unsaved = True\n".to_string()),
        )])
        .unwrap();
    assert_eq!(updates.len(), 1);
    assert!(overlay.owns_qualifier(&Qualifier::new("pkg.mod")));

    let module_path = match overlay.look_up_qualifier(&Qualifier::new("pkg.mod")) {
        ModuleLookup::Explicit(module_path) => module_path,
        other => panic!("expected an explicit module, got {other:?}"),
    };
    assert_eq!(overlay.code_of_module_path(&module_path).unwrap(), "unsaved = True\n");
    assert_eq!(tracker.code_of_module_path(&module_path).unwrap(), "saved = True\n");
}
