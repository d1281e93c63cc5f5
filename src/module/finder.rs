//! Module discovery: an eager crawler that walks every search root once,
//! and a lazy prober that inspects only the directories that could realize
//! a given qualifier.

use crate::{
    config::PathsConfig,
    module::{is_valid_module_file, ModulePath, Qualifier},
    store::{SharedStore, Table},
};
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
};
use walkdir::WalkDir;

/// Crawls every search root recursively and returns all module paths.
///
/// Hidden and excluded directories are pruned, files must pass the module
/// file predicate, and a file reachable from several roots is attributed to
/// the first one. Roots are crawled in parallel; results keep root order.
pub fn find_all_module_paths(config: &PathsConfig) -> Vec<ModulePath> {
    use rayon::prelude::*;

    let per_root: Vec<Vec<(PathBuf, ModulePath)>> = config
        .search_roots
        .par_iter()
        .map(|root| crawl_root(config, &root.path))
        .collect();

    let mut seen = HashSet::new();
    let mut found = Vec::new();
    for entries in per_root {
        for (absolute, module_path) in entries {
            if seen.insert(absolute) {
                found.push(module_path);
            }
        }
    }
    trace!(modules = found.len(), "eager module crawl finished");
    found
}

fn crawl_root(config: &PathsConfig, root: &Path) -> Vec<(PathBuf, ModulePath)> {
    WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || is_valid_directory_entry(config, entry))
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let path = entry.into_path();
            let module_path = ModulePath::classify(config, &path)?;
            Some((path, module_path))
        })
        .collect()
}

fn is_valid_directory_entry(config: &PathsConfig, entry: &walkdir::DirEntry) -> bool {
    if !entry.file_type().is_dir() {
        return true;
    }
    let hidden = entry.file_name().to_str().map(|name| name.starts_with('.')).unwrap_or(true);
    !hidden && !config.is_excluded(entry.path())
}

const MODULE_LISTING: Table<Qualifier, Vec<ModulePath>> = Table::new("lazy-finder-modules");
const NAMESPACE_LISTING: Table<Qualifier, bool> = Table::new("lazy-finder-namespace");

/// Discovers modules on demand, never crawling.
///
/// Given a qualifier, the finder probes exactly the directories that could
/// contain a file realizing it and caches the outcome in a shared-store
/// table keyed by qualifier. Incremental events invalidate the entries of
/// the event's qualifier and all its ancestors.
#[derive(Clone, Debug)]
pub struct LazyFinder {
    store: Arc<SharedStore>,
}

impl LazyFinder {
    pub fn new(store: Arc<SharedStore>) -> Self {
        Self { store }
    }

    /// The module paths realizing `qualifier`, best first.
    pub fn find_module_paths(&self, config: &PathsConfig, qualifier: &Qualifier) -> Vec<ModulePath> {
        if let Some(cached) = MODULE_LISTING.get(&self.store, qualifier) {
            return cached;
        }
        let found = probe_module_paths(config, qualifier);
        MODULE_LISTING.add(&self.store, qualifier, &found);
        found
    }

    /// Whether the qualifier denotes a namespace package: a directory with
    /// at least one explicit child module.
    pub fn is_namespace_package(&self, config: &PathsConfig, qualifier: &Qualifier) -> bool {
        if let Some(cached) = NAMESPACE_LISTING.get(&self.store, qualifier) {
            return cached;
        }
        let result = probe_namespace_package(config, qualifier);
        NAMESPACE_LISTING.add(&self.store, qualifier, &result);
        result
    }

    /// Whether the qualifier has ever been asked about (and not since
    /// invalidated).
    pub fn is_cached(&self, qualifier: &Qualifier) -> bool {
        MODULE_LISTING.mem(&self.store, qualifier) || NAMESPACE_LISTING.mem(&self.store, qualifier)
    }

    /// The cached winning module path, if a listing is cached.
    pub fn cached_winner(&self, qualifier: &Qualifier) -> Option<ModulePath> {
        MODULE_LISTING.get(&self.store, qualifier)?.into_iter().next()
    }

    /// Drops the cached listings of the qualifier and of every ancestor.
    pub fn invalidate_with_ancestors(&self, qualifier: &Qualifier) {
        let ancestors: Vec<Qualifier> = qualifier.ancestors().collect();
        MODULE_LISTING.remove_batch(&self.store, &ancestors);
        NAMESPACE_LISTING.remove_batch(&self.store, &ancestors);
    }
}

/// Probes every candidate location of `qualifier` under every search root.
///
/// For components `c1.….cn` the candidates are the package index files of
/// directory `c1/…/cn` plus, for every prefix split `k`, the dotted file
/// `c1/…/ck/ck+1.….cn.{pyi,py}` — file stems may contain dots.
fn probe_module_paths(config: &PathsConfig, qualifier: &Qualifier) -> Vec<ModulePath> {
    let components: Vec<&str> = qualifier.components().collect();

    let mut found: Vec<ModulePath> = Vec::new();
    for root in &config.search_roots {
        let mut consider = |candidate: PathBuf| {
            if candidate.is_file() {
                if let Some(module_path) = ModulePath::classify(config, &candidate) {
                    if module_path.qualifier() == qualifier {
                        found.push(module_path);
                    }
                }
            }
        };

        let package_dir: PathBuf = root.path.join(qualifier.to_relative_directory());
        consider(package_dir.join("__init__.pyi"));
        consider(package_dir.join("__init__.py"));

        for split in 0..components.len() {
            let mut directory = root.path.clone();
            for component in &components[..split] {
                directory.push(component);
            }
            let stem = components[split..].join(".");
            consider(directory.join(format!("{stem}.pyi")));
            consider(directory.join(format!("{stem}.py")));
        }
    }

    found.sort_by(ModulePath::priority_cmp);
    found.dedup();
    found
}

fn probe_namespace_package(config: &PathsConfig, qualifier: &Qualifier) -> bool {
    if qualifier.is_root() {
        return false;
    }
    for root in &config.search_roots {
        let directory = root.path.join(qualifier.to_relative_directory());
        let Ok(entries) = std::fs::read_dir(&directory) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(module_path) = ModulePath::classify(config, &path) else {
                continue;
            };
            if module_path.qualifier().parent().as_ref() == Some(qualifier) {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SearchRoot;
    use pretty_assertions::assert_eq;

    struct TestRoots {
        _dir: tempfile::TempDir,
        config: PathsConfig,
    }

    fn two_roots() -> TestRoots {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        std::fs::create_dir_all(&first).unwrap();
        std::fs::create_dir_all(&second).unwrap();
        let config = PathsConfig::builder()
            .source_root(dir.path())
            .artifact_root(&first)
            .search_root(SearchRoot::source(&first))
            .search_root(SearchRoot::external(&second))
            .build()
            .unwrap();
        TestRoots { _dir: dir, config }
    }

    fn write(config: &PathsConfig, root: usize, relative: &str) {
        let path = config.search_roots[root].path.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "").unwrap();
    }

    fn qualifiers(paths: &[ModulePath]) -> Vec<String> {
        paths.iter().map(|p| p.qualifier().as_str().to_string()).collect()
    }

    #[test]
    fn eager_crawl_finds_modules_in_all_roots() {
        let roots = two_roots();
        let config = &roots.config;
        write(config, 0, "pkg/__init__.py");
        write(&config, 0, "pkg/mod.py");
        write(&config, 1, "dep.pyi");
        write(&config, 0, "pkg/notes.txt");
        write(&config, 0, ".hidden/secret.py");

        let mut found = qualifiers(&find_all_module_paths(&config));
        found.sort();
        assert_eq!(found, vec!["dep", "pkg", "pkg.mod"]);
    }

    #[test]
    fn eager_crawl_prunes_excluded_directories() {
        let mut roots = two_roots();
        roots.config.excludes = vec![regex::Regex::new(r".*/generated(/.*)?$").unwrap()];
        write(&roots.config, 0, "generated/mod.py");
        write(&roots.config, 0, "kept.py");

        assert_eq!(qualifiers(&find_all_module_paths(&roots.config)), vec!["kept"]);
    }

    #[test]
    fn lazy_probe_finds_package_and_dotted_candidates() {
        let roots = two_roots();
        let config = &roots.config;
        write(&config, 0, "a/b/c.py");
        write(&config, 0, "a/b.c.py");
        write(&config, 1, "a.b.c.pyi");

        let finder = LazyFinder::new(Arc::new(SharedStore::new()));
        let found = finder.find_module_paths(&config, &Qualifier::new("a.b.c"));
        // the stub wins; the two same-length implementations tie-break
        // lexically
        assert_eq!(
            found
                .iter()
                .map(|p| p.raw().relative.to_string_lossy().into_owned())
                .collect::<Vec<_>>(),
            vec!["a.b.c.pyi", "a/b/c.py", "a/b.c.py"]
        );
    }

    #[test]
    fn lazy_probe_finds_init_files() {
        let roots = two_roots();
        let config = &roots.config;
        write(&config, 0, "pkg/__init__.py");

        let finder = LazyFinder::new(Arc::new(SharedStore::new()));
        let found = finder.find_module_paths(&config, &Qualifier::new("pkg"));
        assert_eq!(qualifiers(&found), vec!["pkg"]);
        assert!(found[0].is_init());
    }

    #[test]
    fn lazy_results_are_cached_until_invalidated() {
        let roots = two_roots();
        let config = &roots.config;
        let finder = LazyFinder::new(Arc::new(SharedStore::new()));
        let qualifier = Qualifier::new("late.arrival");

        assert!(finder.find_module_paths(&config, &qualifier).is_empty());
        assert!(finder.is_cached(&qualifier));

        // the file appears after the listing was cached
        write(&config, 0, "late/arrival.py");
        assert!(finder.find_module_paths(&config, &qualifier).is_empty());

        finder.invalidate_with_ancestors(&qualifier);
        assert!(!finder.is_cached(&qualifier));
        assert_eq!(qualifiers(&finder.find_module_paths(&config, &qualifier)), vec!["late.arrival"]);
    }

    #[test]
    fn invalidation_covers_ancestors() {
        let roots = two_roots();
        let config = &roots.config;
        write(&config, 0, "a/b/c.py");
        let finder = LazyFinder::new(Arc::new(SharedStore::new()));

        finder.find_module_paths(&config, &Qualifier::new("a.b"));
        finder.find_module_paths(&config, &Qualifier::new("a.b.c"));

        finder.invalidate_with_ancestors(&Qualifier::new("a.b.c.d"));
        assert!(!finder.is_cached(&Qualifier::new("a.b")));
        assert!(!finder.is_cached(&Qualifier::new("a.b.c")));
    }

    #[test]
    fn namespace_packages_require_an_explicit_child() {
        let roots = two_roots();
        let config = &roots.config;
        write(&config, 0, "pkg/mod.py");
        std::fs::create_dir_all(config.search_roots[0].path.join("empty")).unwrap();

        let finder = LazyFinder::new(Arc::new(SharedStore::new()));
        assert!(finder.is_namespace_package(&config, &Qualifier::new("pkg")));
        assert!(!finder.is_namespace_package(&config, &Qualifier::new("empty")));
        assert!(!finder.is_namespace_package(&config, &Qualifier::new("missing")));
    }
}
