//! The artifact-to-source relation produced by the build tool, with merge,
//! difference and indexed lookup support.
//!
//! All paths held by a build map are relative; turning them into absolute
//! locations requires a source root and an artifact root, which only the
//! build orchestrator knows about.

use crate::error::{MergeConflict, Result, SourceDbError};
use md5::{Digest, Md5};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::{
    collections::{hash_map, BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
};

/// A finite map from artifact-relative paths to source-relative paths.
///
/// Artifact keys are unique; several artifacts may map to the same source.
/// Once handed to the materializer and the module tracker a build map is
/// treated as immutable: updates produce a new map plus a
/// [`BuildMapDifference`] used to patch the artifact tree in place.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BuildMap {
    map: HashMap<PathBuf, PathBuf>,
}

impl BuildMap {
    /// Builds a map from `(artifact, source)` pairs, failing on duplicate
    /// artifact keys that disagree on the source.
    pub fn from_pairs_strict<I, P, Q>(pairs: I) -> Result<Self, MergeConflict>
    where
        I: IntoIterator<Item = (P, Q)>,
        P: Into<PathBuf>,
        Q: Into<PathBuf>,
    {
        let mut map = HashMap::new();
        for (artifact, source) in pairs {
            let (artifact, source) = (artifact.into(), source.into());
            match map.entry(artifact) {
                hash_map::Entry::Vacant(entry) => {
                    entry.insert(source);
                }
                hash_map::Entry::Occupied(entry) => {
                    if *entry.get() != source {
                        return Err(MergeConflict {
                            key: entry.key().clone(),
                            left: entry.get().clone(),
                            right: source,
                        });
                    }
                }
            }
        }
        Ok(Self { map })
    }

    /// Builds a map from `(artifact, source)` pairs; on duplicate artifact
    /// keys the first binding wins.
    pub fn from_pairs_lenient<I, P, Q>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (P, Q)>,
        P: Into<PathBuf>,
        Q: Into<PathBuf>,
    {
        let mut map = HashMap::new();
        for (artifact, source) in pairs {
            let (artifact, source) = (artifact.into(), source.into());
            match map.entry(artifact) {
                hash_map::Entry::Vacant(entry) => {
                    entry.insert(source);
                }
                hash_map::Entry::Occupied(entry) => {
                    trace!(
                        artifact = %entry.key().display(),
                        kept = %entry.get().display(),
                        dropped = %source.display(),
                        "duplicate artifact key, first binding wins"
                    );
                }
            }
        }
        Self { map }
    }

    /// Parses a build map from a JSON document shaped as
    /// `{artifact: source, ...}`, or the same object nested under a
    /// `"sources"` key. A `"dependencies"` sibling is ignored.
    ///
    /// Duplicate keys cannot survive JSON object parsing, so the lenient
    /// first-wins policy is implied.
    pub fn from_json_value(value: &Value, context: &str) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| invalid_json(context, "expected a JSON object"))?;
        let entries = match object.get("sources") {
            Some(sources) => sources
                .as_object()
                .ok_or_else(|| invalid_json(context, "expected \"sources\" to be an object"))?,
            None => object,
        };

        let mut map = HashMap::with_capacity(entries.len());
        for (artifact, source) in entries {
            let source = source.as_str().ok_or_else(|| {
                invalid_json(context, format!("expected a string value for key \"{artifact}\""))
            })?;
            map.insert(PathBuf::from(artifact), PathBuf::from(source));
        }
        Ok(Self { map })
    }

    /// Serializes the map into the flat `{artifact: source, ...}` shape,
    /// with keys sorted for reproducible output. Inverse of
    /// [`Self::from_json_value`] modulo the `"sources"` container.
    pub fn to_json_value(&self) -> Value {
        let entries: serde_json::Map<String, Value> = self
            .sorted_pairs()
            .into_iter()
            .map(|(artifact, source)| {
                (
                    artifact.to_string_lossy().into_owned(),
                    Value::String(source.to_string_lossy().into_owned()),
                )
            })
            .collect();
        Value::Object(entries)
    }

    /// Returns a new map retaining the entries for which the predicate
    /// holds.
    pub fn filter(&self, mut predicate: impl FnMut(&Path, &Path) -> bool) -> Self {
        let map = self
            .map
            .iter()
            .filter(|(artifact, source)| predicate(artifact, source))
            .map(|(artifact, source)| (artifact.clone(), source.clone()))
            .collect();
        Self { map }
    }

    /// Merges two maps into one containing all keys from either side.
    ///
    /// Keys present in both maps are reconciled by the resolver, which
    /// either picks a source or fails with a conflict carrying the key and
    /// both candidates.
    pub fn merge(
        left: &Self,
        right: &Self,
        resolver: &impl MergeResolver,
    ) -> Result<Self, MergeConflict> {
        let mut map = left.map.clone();
        for (artifact, source) in &right.map {
            match map.entry(artifact.clone()) {
                hash_map::Entry::Vacant(entry) => {
                    entry.insert(source.clone());
                }
                hash_map::Entry::Occupied(mut entry) => {
                    if entry.get() != source {
                        let resolved = resolver.resolve(artifact, entry.get(), source)?;
                        entry.insert(resolved);
                    }
                }
            }
        }
        Ok(Self { map })
    }

    /// Builds the derived structure supporting bidirectional lookup.
    pub fn index(&self) -> IndexedBuildMap {
        let mut reverse: HashMap<PathBuf, Vec<PathBuf>> = HashMap::new();
        for (artifact, source) in &self.map {
            reverse.entry(source.clone()).or_default().push(artifact.clone());
        }
        // lookup_artifact results are order-sensitive for callers that pick
        // the first artifact of a source
        for artifacts in reverse.values_mut() {
            artifacts.sort();
        }
        IndexedBuildMap { forward: self.map.clone(), reverse }
    }

    /// Tags every artifact key on which `original` and `current` disagree.
    ///
    /// Keys only in `current` become `New`, keys only in `original` become
    /// `Deleted`, keys in both with differing sources become `Changed`;
    /// unchanged keys are absent from the result.
    pub fn difference(original: &Self, current: &Self) -> BuildMapDifference {
        let mut entries = BTreeMap::new();
        for (artifact, source) in &current.map {
            match original.map.get(artifact) {
                None => {
                    entries.insert(artifact.clone(), DifferenceKind::New(source.clone()));
                }
                Some(old_source) if old_source != source => {
                    entries.insert(artifact.clone(), DifferenceKind::Changed(source.clone()));
                }
                Some(_) => {}
            }
        }
        for artifact in original.map.keys() {
            if !current.map.contains_key(artifact) {
                entries.insert(artifact.clone(), DifferenceKind::Deleted);
            }
        }
        BuildMapDifference { entries }
    }

    /// Rebuilds the post-difference map, failing when the difference is
    /// inconsistent with this map: deleting or changing a key that is
    /// absent, or adding a key that is already present.
    pub fn strict_apply_difference(
        &self,
        difference: &BuildMapDifference,
    ) -> Result<Self, ApplyDifferenceError> {
        let mut map = self.map.clone();
        for (artifact, kind) in &difference.entries {
            match kind {
                DifferenceKind::New(source) => match map.entry(artifact.clone()) {
                    hash_map::Entry::Vacant(entry) => {
                        entry.insert(source.clone());
                    }
                    hash_map::Entry::Occupied(_) => {
                        return Err(ApplyDifferenceError::NewExisting(artifact.clone()));
                    }
                },
                DifferenceKind::Deleted => {
                    if map.remove(artifact).is_none() {
                        return Err(ApplyDifferenceError::DeleteMissing(artifact.clone()));
                    }
                }
                DifferenceKind::Changed(source) => match map.get_mut(artifact) {
                    Some(slot) => *slot = source.clone(),
                    None => return Err(ApplyDifferenceError::ChangeMissing(artifact.clone())),
                },
            }
        }
        Ok(Self { map })
    }

    /// Looks up the source an artifact maps to.
    pub fn get(&self, artifact: &Path) -> Option<&Path> {
        self.map.get(artifact).map(PathBuf::as_path)
    }

    pub fn contains_artifact(&self, artifact: &Path) -> bool {
        self.map.contains_key(artifact)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterates over all `(artifact, source)` entries in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&Path, &Path)> {
        self.map.iter().map(|(artifact, source)| (artifact.as_path(), source.as_path()))
    }

    /// All entries sorted by artifact key, for deterministic processing.
    pub fn sorted_pairs(&self) -> Vec<(&Path, &Path)> {
        let mut pairs: Vec<_> = self.iter().collect();
        pairs.sort_by_key(|(artifact, _)| *artifact);
        pairs
    }

    /// Overlays `other` onto this map: every binding of `other` wins.
    pub(crate) fn overlaid_with<I, P, Q>(&self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (P, Q)>,
        P: Into<PathBuf>,
        Q: Into<PathBuf>,
    {
        let mut map = self.map.clone();
        for (artifact, source) in pairs {
            map.insert(artifact.into(), source.into());
        }
        Self { map }
    }

    /// Drops every artifact entry in `artifacts`.
    pub(crate) fn without_artifacts<'a>(
        &self,
        artifacts: impl IntoIterator<Item = &'a Path>,
    ) -> Self {
        let mut map = self.map.clone();
        for artifact in artifacts {
            map.remove(artifact);
        }
        Self { map }
    }
}

// serialized as a plain sorted map, the same shape saved states and
// source databases use
impl Serialize for BuildMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let sorted: BTreeMap<&Path, &Path> = self.iter().collect();
        sorted.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for BuildMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = HashMap::<PathBuf, PathBuf>::deserialize(deserializer)?;
        Ok(Self { map })
    }
}

fn invalid_json(context: &str, message: impl std::fmt::Display) -> SourceDbError {
    SourceDbError::msg(format!("failed to parse {context}: {message}"))
}

/// A [`BuildMap`] supplemented with the inverse multimap, supporting
/// amortized O(1) lookup in both directions.
#[derive(Clone, Debug, Default)]
pub struct IndexedBuildMap {
    forward: HashMap<PathBuf, PathBuf>,
    reverse: HashMap<PathBuf, Vec<PathBuf>>,
}

impl IndexedBuildMap {
    /// The source a given artifact was relocated from.
    pub fn lookup_source(&self, artifact: &Path) -> Option<&Path> {
        self.forward.get(artifact).map(PathBuf::as_path)
    }

    /// All artifacts a given source was relocated to, sorted.
    pub fn lookup_artifact(&self, source: &Path) -> &[PathBuf] {
        self.reverse.get(source).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// How a single artifact key changed between two build maps.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DifferenceKind {
    /// The artifact appeared, mapped to the given source.
    New(PathBuf),
    /// The artifact disappeared.
    Deleted,
    /// The artifact now maps to a different source.
    Changed(PathBuf),
}

/// A keyed set of [`DifferenceKind`] tags describing how to patch an
/// artifact tree from one build map to another.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BuildMapDifference {
    entries: BTreeMap<PathBuf, DifferenceKind>,
}

impl BuildMapDifference {
    pub fn from_entries<I, P>(entries: I) -> Self
    where
        I: IntoIterator<Item = (P, DifferenceKind)>,
        P: Into<PathBuf>,
    {
        Self { entries: entries.into_iter().map(|(path, kind)| (path.into(), kind)).collect() }
    }

    pub fn get(&self, artifact: &Path) -> Option<&DifferenceKind> {
        self.entries.get(artifact)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates in artifact-key order.
    pub fn iter(&self) -> impl Iterator<Item = (&Path, &DifferenceKind)> {
        self.entries.iter().map(|(artifact, kind)| (artifact.as_path(), kind))
    }

    /// Composes two differences. Composition is partial: the same key
    /// tagged differently on both sides is a conflict.
    pub fn merge(self, other: Self) -> Result<Self, DifferenceMergeError> {
        let mut entries = self.entries;
        for (artifact, kind) in other.entries {
            match entries.entry(artifact) {
                std::collections::btree_map::Entry::Vacant(entry) => {
                    entry.insert(kind);
                }
                std::collections::btree_map::Entry::Occupied(entry) => {
                    if *entry.get() != kind {
                        return Err(DifferenceMergeError { key: entry.key().clone() });
                    }
                }
            }
        }
        Ok(Self { entries })
    }
}

/// Two differences disagree on how the same artifact key changed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("conflicting difference tags for artifact \"{}\"", .key.display())]
pub struct DifferenceMergeError {
    pub key: PathBuf,
}

/// A difference referred to an artifact in a way inconsistent with the map
/// it was applied to.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyDifferenceError {
    #[error("cannot delete \"{}\": absent from the original build map", .0.display())]
    DeleteMissing(PathBuf),
    #[error("cannot add \"{}\": already present in the original build map", .0.display())]
    NewExisting(PathBuf),
    #[error("cannot change \"{}\": absent from the original build map", .0.display())]
    ChangeMissing(PathBuf),
}

/// Decides which source wins when two build maps bind the same artifact to
/// different sources.
pub trait MergeResolver {
    fn resolve(&self, key: &Path, left: &Path, right: &Path) -> Result<PathBuf, MergeConflict>;
}

impl<F> MergeResolver for F
where
    F: Fn(&Path, &Path, &Path) -> Result<PathBuf, MergeConflict>,
{
    fn resolve(&self, key: &Path, left: &Path, right: &Path) -> Result<PathBuf, MergeConflict> {
        (self)(key, left, right)
    }
}

/// Accepts a duplicate key only when both sides bind it to the same source.
///
/// `BuildMap::merge` short-circuits equal bindings before consulting the
/// resolver, so this resolver always fails.
#[derive(Clone, Copy, Debug, Default)]
pub struct NameEqual;

impl MergeResolver for NameEqual {
    fn resolve(&self, key: &Path, left: &Path, right: &Path) -> Result<PathBuf, MergeConflict> {
        Err(MergeConflict {
            key: key.to_path_buf(),
            left: left.to_path_buf(),
            right: right.to_path_buf(),
        })
    }
}

/// Like [`NameEqual`], but additionally accepts two distinct sources whose
/// file contents are byte-identical, preserving the left one.
#[derive(Clone, Debug)]
pub struct NameOrContentEqual {
    source_root: PathBuf,
}

impl NameOrContentEqual {
    pub fn new(source_root: impl Into<PathBuf>) -> Self {
        Self { source_root: source_root.into() }
    }

    fn content_hash(&self, source: &Path) -> Option<[u8; 16]> {
        let content = fs::read(self.source_root.join(source)).ok()?;
        Some(Md5::digest(content).into())
    }
}

impl MergeResolver for NameOrContentEqual {
    fn resolve(&self, key: &Path, left: &Path, right: &Path) -> Result<PathBuf, MergeConflict> {
        let conflict = || MergeConflict {
            key: key.to_path_buf(),
            left: left.to_path_buf(),
            right: right.to_path_buf(),
        };
        let left_hash = self.content_hash(left).ok_or_else(conflict)?;
        let right_hash = self.content_hash(right).ok_or_else(conflict)?;
        if left_hash == right_hash {
            debug!(
                artifact = %key.display(),
                preserved = %left.display(),
                dropped = %right.display(),
                "sources have identical content, preserving the first"
            );
            Ok(left.to_path_buf())
        } else {
            Err(conflict())
        }
    }
}
