//! Project layout configuration: build roots, module search roots and
//! exclude patterns.

use crate::{
    error::{Result, SourceDbError},
    module::ModulePath,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

/// Exclude patterns that virtually every deployment wants: bytecode caches
/// and hidden trees.
pub static DEFAULT_EXCLUDES: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r".*/__pycache__(/.*)?$").unwrap(),
        Regex::new(r".*/\.[^/]+(/.*)?$").unwrap(),
    ]
});

/// A directory in which module files are located.
///
/// Search roots are ordered; a file shadowed by an equally named file in an
/// earlier root loses module resolution.
#[derive(Clone, Debug)]
pub struct SearchRoot {
    /// Absolute path of the root.
    pub path: PathBuf,
    /// Whether files under this root are to be analyzed in depth.
    ///
    /// Project sources are, dependency roots such as typeshed or site
    /// packages are only consulted for interfaces.
    pub should_type_check: bool,
}

impl SearchRoot {
    /// A root containing project sources.
    pub fn source(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), should_type_check: true }
    }

    /// A root containing dependencies that are consulted but not analyzed.
    pub fn external(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), should_type_check: false }
    }
}

/// Where the source tree, the artifact tree and the module search roots
/// live.
///
/// The artifact root is usually one of the search roots: the build tool
/// relocates sources into it, and module resolution operates on the
/// relocated view.
#[derive(Clone, Debug)]
pub struct PathsConfig {
    /// Root of the user-visible project tree.
    pub source_root: PathBuf,
    /// Root of the generated tree handed to analysis.
    pub artifact_root: PathBuf,
    /// Ordered module search roots.
    pub search_roots: Vec<SearchRoot>,
    /// Paths matching any of these patterns are invisible to module
    /// discovery.
    pub excludes: Vec<Regex>,
}

impl PathsConfig {
    /// Convenience function to call `PathsConfigBuilder::default()`.
    pub fn builder() -> PathsConfigBuilder {
        PathsConfigBuilder::default()
    }

    /// Returns the first search root that contains `path` together with its
    /// index and the path relative to it.
    pub fn search_root_of<'a>(&self, path: &'a Path) -> Option<(usize, &SearchRoot, &'a Path)> {
        self.search_roots.iter().enumerate().find_map(|(index, root)| {
            path.strip_prefix(&root.path).ok().map(|relative| (index, root, relative))
        })
    }

    /// Whether the path matches one of the configured exclude patterns.
    pub fn is_excluded(&self, path: &Path) -> bool {
        let text = path.to_string_lossy();
        self.excludes.iter().any(|pattern| pattern.is_match(&text))
    }

    /// The absolute location of a module path, resolved against its search
    /// root.
    pub fn absolute_path_of(&self, module_path: &ModulePath) -> PathBuf {
        let raw = module_path.raw();
        match self.search_roots.get(raw.root) {
            Some(root) => root.path.join(&raw.relative),
            // A stale module path whose root is gone; keep the relative part
            // so the caller gets a readable error out of the file read.
            None => raw.relative.clone(),
        }
    }
}

/// Builder for [`PathsConfig`].
#[derive(Debug, Default)]
pub struct PathsConfigBuilder {
    source_root: Option<PathBuf>,
    artifact_root: Option<PathBuf>,
    search_roots: Vec<SearchRoot>,
    excludes: Vec<Regex>,
}

impl PathsConfigBuilder {
    #[must_use]
    pub fn source_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.source_root = Some(root.into());
        self
    }

    #[must_use]
    pub fn artifact_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.artifact_root = Some(root.into());
        self
    }

    #[must_use]
    pub fn search_root(mut self, root: SearchRoot) -> Self {
        self.search_roots.push(root);
        self
    }

    #[must_use]
    pub fn search_roots(mut self, roots: impl IntoIterator<Item = SearchRoot>) -> Self {
        self.search_roots.extend(roots);
        self
    }

    #[must_use]
    pub fn exclude(mut self, pattern: Regex) -> Self {
        self.excludes.push(pattern);
        self
    }

    #[must_use]
    pub fn excludes(mut self, patterns: impl IntoIterator<Item = Regex>) -> Self {
        self.excludes.extend(patterns);
        self
    }

    /// Appends [`DEFAULT_EXCLUDES`].
    #[must_use]
    pub fn default_excludes(self) -> Self {
        self.excludes(DEFAULT_EXCLUDES.iter().cloned())
    }

    pub fn build(self) -> Result<PathsConfig> {
        let Self { source_root, artifact_root, search_roots, excludes } = self;
        let source_root =
            source_root.ok_or_else(|| SourceDbError::msg("paths config lacks a source root"))?;
        let artifact_root = artifact_root
            .ok_or_else(|| SourceDbError::msg("paths config lacks an artifact root"))?;
        if search_roots.is_empty() {
            return Err(SourceDbError::msg("paths config lacks search roots"));
        }
        Ok(PathsConfig { source_root, artifact_root, search_roots, excludes })
    }
}
