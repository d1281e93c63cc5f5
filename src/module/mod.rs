//! Logical modules: dotted qualifiers and their on-disk realizations.

use crate::config::PathsConfig;
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    path::{Component, Path, PathBuf},
};

pub mod finder;
pub mod overlay;
pub mod tracker;

/// A dotted module name, e.g. `pkg.sub.mod`.
///
/// The empty qualifier denotes the root package.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Qualifier(String);

impl Qualifier {
    pub fn root() -> Self {
        Self(String::new())
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Derives the qualifier from a path relative to its search root.
    ///
    /// Separators become dots, the `.py`/`.pyi` suffix is stripped, and a
    /// package index file collapses to its parent package. File stems may
    /// themselves contain dots; each dotted part contributes a component.
    /// Returns `None` for paths without a source suffix or with non-UTF-8
    /// components.
    pub fn from_relative_path(path: &Path) -> Option<Self> {
        let file_name = path.file_name()?.to_str()?;
        let stem = file_name
            .strip_suffix(".pyi")
            .or_else(|| file_name.strip_suffix(".py"))
            .filter(|stem| !stem.is_empty())?;

        let mut parts = Vec::new();
        if let Some(parent) = path.parent() {
            for component in parent.components() {
                match component {
                    Component::Normal(part) => parts.push(part.to_str()?),
                    Component::CurDir => {}
                    _ => return None,
                }
            }
        }
        if stem != "__init__" {
            parts.push(stem);
        }
        Some(Self(parts.join(".")))
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn components(&self) -> impl DoubleEndedIterator<Item = &str> {
        self.0.split('.').filter(|component| !component.is_empty())
    }

    /// The enclosing package, or `None` for the root qualifier.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('.') {
            Some(split) => Some(Self(self.0[..split].to_string())),
            None => Some(Self::root()),
        }
    }

    /// The qualifier itself followed by every enclosing package up to the
    /// root.
    pub fn ancestors(&self) -> impl Iterator<Item = Qualifier> {
        std::iter::successors(Some(self.clone()), Qualifier::parent)
    }

    /// The relative directory a package with this qualifier occupies.
    pub fn to_relative_directory(&self) -> PathBuf {
        self.components().collect()
    }
}

impl fmt::Display for Qualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The identity of a module file: which search root it lives under, where
/// underneath it, and whether its contents are to be analyzed in depth.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawModulePath {
    /// Index into the configured search roots.
    pub root: usize,
    /// Path relative to that root.
    pub relative: PathBuf,
    pub should_type_check: bool,
}

impl RawModulePath {
    pub fn new(root: usize, relative: impl Into<PathBuf>, should_type_check: bool) -> Self {
        Self { root, relative: relative.into(), should_type_check }
    }

    /// Whether two raws denote the same file, disregarding the type-check
    /// flag. Removal matching uses this: a deleted symlink can no longer be
    /// classified, so the flag on the removal request is unreliable.
    pub(crate) fn same_file(&self, other: &Self) -> bool {
        self.root == other.root && self.relative == other.relative
    }
}

/// A logical handle to one module file.
///
/// Equality and hashing consider only the raw identity; the remaining
/// fields are derived from it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModulePath {
    raw: RawModulePath,
    qualifier: Qualifier,
    is_stub: bool,
    is_init: bool,
}

impl ModulePath {
    /// Builds a module path from its raw identity, deriving the qualifier.
    /// Returns `None` when the relative path does not denote a module file.
    pub fn from_raw(raw: RawModulePath) -> Option<Self> {
        let qualifier = Qualifier::from_relative_path(&raw.relative)?;
        let file_name = raw.relative.file_name()?.to_str()?;
        let is_stub = file_name.ends_with(".pyi");
        let is_init = matches!(file_name, "__init__.py" | "__init__.pyi");
        Some(Self { raw, qualifier, is_stub, is_init })
    }

    /// Classifies an absolute path against the configured search roots.
    ///
    /// Hidden files, files with non-source suffixes and paths matching an
    /// exclude pattern yield `None`, as do paths outside every root.
    pub fn classify(config: &PathsConfig, path: &Path) -> Option<Self> {
        if !is_valid_module_file(config, path) {
            return None;
        }
        let (root, search_root, relative) = config.search_root_of(path)?;
        Self::from_raw(RawModulePath::new(root, relative, search_root.should_type_check))
    }

    pub fn raw(&self) -> &RawModulePath {
        &self.raw
    }

    pub fn qualifier(&self) -> &Qualifier {
        &self.qualifier
    }

    pub fn is_stub(&self) -> bool {
        self.is_stub
    }

    pub fn is_init(&self) -> bool {
        self.is_init
    }

    /// Total order on module paths sharing a qualifier, deciding which file
    /// wins: stubs beat implementations, shorter relative paths beat longer
    /// ones, lower-index search roots beat higher ones.
    pub fn priority_cmp(&self, other: &Self) -> Ordering {
        (other.is_stub)
            .cmp(&self.is_stub)
            .then_with(|| {
                self.raw.relative.as_os_str().len().cmp(&other.raw.relative.as_os_str().len())
            })
            .then_with(|| self.raw.root.cmp(&other.raw.root))
            .then_with(|| self.raw.relative.cmp(&other.raw.relative))
    }
}

impl PartialEq for ModulePath {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for ModulePath {}

impl Hash for ModulePath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

/// Whether the path may realize a module: not hidden, carries a source
/// suffix, and matches no exclude pattern.
pub(crate) fn is_valid_module_file(config: &PathsConfig, path: &Path) -> bool {
    let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    if file_name.starts_with('.') {
        return false;
    }
    if !(file_name.ends_with(".py") || file_name.ends_with(".pyi")) {
        return false;
    }
    !config.is_excluded(path)
}

/// An atomic filesystem event on one path, as delivered by the build
/// orchestrator or a file watcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathEvent {
    pub kind: PathEventKind,
    pub path: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathEventKind {
    CreatedOrChanged,
    Removed,
}

impl PathEvent {
    pub fn created_or_changed(path: impl Into<PathBuf>) -> Self {
        Self { kind: PathEventKind::CreatedOrChanged, path: path.into() }
    }

    pub fn removed(path: impl Into<PathBuf>) -> Self {
        Self { kind: PathEventKind::Removed, path: path.into() }
    }
}
