//! Higher level operations over the raw build tool: target normalization,
//! per-target source-database loading and merging, and changed-target
//! queries.

use crate::{
    buck::{
        raw::{InvocationOptions, Raw},
        Target,
    },
    buildmap::{BuildMap, NameOrContentEqual},
    error::{Result, SourceDbError},
};
use futures_util::{stream, StreamExt, TryStreamExt};
use itertools::Itertools;
use serde::Deserialize;
use serde_json::Value;
use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

/// How many per-target source databases are read concurrently.
const CONCURRENT_SOURCE_DB_LOADS: usize = 16;

/// Target kinds whose sources participate in analysis.
const ANALYZED_KINDS: &str = "python_binary|python_library|python_test";

/// Housekeeping files the source-db generator commonly emits; they carry no
/// analyzable code and are filtered from every partial build map.
const HOUSEKEEPING_FILES: &[&str] = &["__manifest__.py", "__test_main__.py", "__test_modules__.py"];

/// A merged build map together with the targets that survived merging.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildResult {
    pub build_map: BuildMap,
    pub targets: Vec<Target>,
}

/// Everything needed to rebuild one target's partial build map without a
/// full re-query: where its sources live, where its artifacts go, and the
/// relative pairs in between.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangedTargets {
    pub source_base_path: PathBuf,
    pub artifact_base_path: PathBuf,
    /// Pairs relative to the two base paths.
    pub artifacts_to_sources: Vec<(PathBuf, PathBuf)>,
}

impl ChangedTargets {
    /// The target's build-map entries, with both sides joined to their base
    /// paths.
    pub fn build_map_pairs(&self) -> impl Iterator<Item = (PathBuf, PathBuf)> + '_ {
        self.artifacts_to_sources.iter().map(|(artifact, source)| {
            (self.artifact_base_path.join(artifact), self.source_base_path.join(source))
        })
    }
}

/// The classic interface: normalize target patterns, build every target's
/// source database and merge the results. Works with both tool versions.
#[derive(Clone, Debug)]
pub struct Classic {
    raw: Raw,
    options: InvocationOptions,
}

impl Classic {
    pub fn new(raw: Raw, options: InvocationOptions) -> Self {
        Self { raw, options }
    }

    pub fn v1() -> Self {
        Self::new(Raw::v1(), InvocationOptions::default())
    }

    pub fn v2() -> Self {
        Self::new(Raw::v2(), InvocationOptions::default())
    }

    /// Resolves target patterns (possibly containing wildcards and filter
    /// operators) to the deduplicated, sorted set of concrete targets that
    /// participate in analysis.
    ///
    /// Targets labeled `generated` or `no_pyre` are excluded; targets
    /// labeled `unittest-library` are included even when their kind alone
    /// would not qualify them.
    pub async fn normalize_targets(&self, target_specs: &[String]) -> Result<Vec<Target>> {
        if target_specs.is_empty() {
            return Ok(Vec::new());
        }
        let query = normalization_query(target_specs);
        let reply =
            self.raw.query(&self.options, &[query, "--json".to_string()]).await?;

        let object = reply
            .as_object()
            .ok_or_else(|| SourceDbError::msg("target query did not return a JSON object"))?;
        let mut targets = BTreeSet::new();
        for value in object.values() {
            let labels = value.as_array().ok_or_else(|| {
                SourceDbError::msg("target query values are expected to be arrays")
            })?;
            for label in labels {
                let label = label.as_str().ok_or_else(|| {
                    SourceDbError::msg("target query arrays are expected to hold strings")
                })?;
                targets.insert(Target::new(label));
            }
        }
        debug!(specs = target_specs.len(), targets = targets.len(), "normalized targets");
        Ok(targets.into_iter().collect())
    }

    /// Builds every target's source database, loads the per-target partial
    /// build maps and merges them in sorted-target order.
    ///
    /// A target whose partial conflicts with the accumulated map (same
    /// artifact, different source content) is dropped with a warning; the
    /// result carries the survivors.
    pub async fn construct_build_map(
        &self,
        targets: &[Target],
        source_root: &Path,
    ) -> Result<BuildResult> {
        let mut sorted: Vec<Target> = targets.to_vec();
        sorted.sort();
        sorted.dedup();
        if sorted.is_empty() {
            return Ok(BuildResult { build_map: BuildMap::default(), targets: Vec::new() });
        }

        let mut args: Vec<String> =
            sorted.iter().map(|target| self.source_db_flavor(target)).collect();
        args.push("--show-full-json-output".to_string());
        let reply = self.raw.build(&self.options, &args).await?;

        let partials = self.load_partials(&sorted, &reply).await?;

        let resolver = NameOrContentEqual::new(source_root);
        let mut build_map = BuildMap::default();
        let mut survivors = Vec::with_capacity(partials.len());
        for (target, partial) in partials {
            match BuildMap::merge(&build_map, &partial, &resolver) {
                Ok(merged) => {
                    build_map = merged;
                    survivors.push(target);
                }
                Err(conflict) => {
                    warn!(
                        target = %target,
                        artifact = %conflict.key.display(),
                        preserved = %conflict.left.display(),
                        dropped = %conflict.right.display(),
                        "dropping target due to a build map conflict"
                    );
                }
            }
        }
        debug!(entries = build_map.len(), targets = survivors.len(), "constructed build map");
        Ok(BuildResult { build_map, targets: survivors })
    }

    /// Returns, for each target owning one of the changed sources, the
    /// record needed to splice its partial build map into an existing map.
    pub async fn query_changed_targets(
        &self,
        targets: &[Target],
        changed_paths: &[PathBuf],
    ) -> Result<Vec<ChangedTargets>> {
        if changed_paths.is_empty() {
            return Ok(Vec::new());
        }
        let query = changed_paths
            .iter()
            .map(|path| format!("owner(\"{}\")", path.display()))
            .join(" + ");
        let args = vec![
            query,
            "--json".to_string(),
            "--output-attributes".to_string(),
            "buck.base_path".to_string(),
            "buck.base_module".to_string(),
            "base_module".to_string(),
            "srcs".to_string(),
        ];
        let reply = self.raw.query(&self.options, &args).await?;

        let object = reply
            .as_object()
            .ok_or_else(|| SourceDbError::msg("owner query did not return a JSON object"))?;
        let known: BTreeSet<&Target> = targets.iter().collect();
        let mut changed = Vec::new();
        for (label, attributes) in object {
            if !known.contains(&Target::new(label.clone())) {
                trace!(target = %label, "ignoring owner outside the normalized target set");
                continue;
            }
            let attributes: TargetAttributes = serde_json::from_value(attributes.clone())
                .map_err(|err| SourceDbError::json(format!("attributes of {label}"), err))?;
            changed.push(attributes.into_changed_targets());
        }
        Ok(changed)
    }

    fn source_db_flavor(&self, target: &Target) -> String {
        match self.raw.version() {
            crate::buck::ToolVersion::V1 => format!("{target}#source-db"),
            crate::buck::ToolVersion::V2 => format!("{target}[source-db]"),
        }
    }

    /// Reads every target's source database concurrently, preserving the
    /// given target order in the result.
    async fn load_partials(
        &self,
        targets: &[Target],
        reply: &Value,
    ) -> Result<Vec<(Target, BuildMap)>> {
        let object = reply
            .as_object()
            .ok_or_else(|| SourceDbError::msg("build reply did not return a JSON object"))?;

        let mut jobs = Vec::with_capacity(targets.len());
        for target in targets {
            let flavored = self.source_db_flavor(target);
            let path = object.get(&flavored).and_then(Value::as_str).ok_or_else(|| {
                SourceDbError::msg(format!("build reply lacks an output for \"{flavored}\""))
            })?;
            jobs.push((target.clone(), PathBuf::from(path)));
        }

        stream::iter(jobs)
            .map(|(target, path)| async move {
                let partial = load_partial_build_map(&path).await?;
                Ok::<_, SourceDbError>((target, partial))
            })
            .buffered(CONCURRENT_SOURCE_DB_LOADS)
            .try_collect()
            .await
    }
}

/// Loads one per-target source database from disk, applying the
/// housekeeping filter.
async fn load_partial_build_map(path: &Path) -> Result<BuildMap> {
    let contents =
        tokio::fs::read(path).await.map_err(|err| SourceDbError::io(err, path))?;
    let value: Value = serde_json::from_slice(&contents)
        .map_err(|err| SourceDbError::json(path.display().to_string(), err))?;
    let partial = BuildMap::from_json_value(&value, &path.display().to_string())?;
    Ok(partial.filter(|artifact, _| !is_housekeeping_file(artifact)))
}

fn is_housekeeping_file(artifact: &Path) -> bool {
    artifact
        .file_name()
        .and_then(|name| name.to_str())
        .map(|name| HOUSEKEEPING_FILES.contains(&name))
        .unwrap_or(false)
}

fn normalization_query(target_specs: &[String]) -> String {
    let spec_set =
        format!("set({})", target_specs.iter().map(|spec| format!("\"{spec}\"")).join(" "));
    let analyzed = format!("kind(\"{ANALYZED_KINDS}\", {spec_set})");
    format!(
        "({analyzed} - attrfilter(labels, generated, {analyzed}) \
         - attrfilter(labels, no_pyre, {analyzed})) \
         + attrfilter(labels, unittest-library, {spec_set})"
    )
}

#[derive(Debug, Deserialize)]
struct TargetAttributes {
    #[serde(rename = "buck.base_path")]
    base_path: String,
    #[serde(rename = "buck.base_module", default)]
    buck_base_module: Option<String>,
    #[serde(default)]
    base_module: Option<String>,
    #[serde(default)]
    srcs: serde_json::Map<String, Value>,
}

impl TargetAttributes {
    fn into_changed_targets(self) -> ChangedTargets {
        // an explicitly configured base module overrides the implied one,
        // which overrides the target's base path
        let artifact_base_path = self
            .base_module
            .as_deref()
            .or(self.buck_base_module.as_deref())
            .map(|module| module.split('.').collect::<PathBuf>())
            .unwrap_or_else(|| PathBuf::from(&self.base_path));
        let artifacts_to_sources = self
            .srcs
            .iter()
            .filter_map(|(artifact, source)| {
                let source = source.as_str()?;
                // sources from other cells cannot be mapped locally
                if source.starts_with("//") {
                    return None;
                }
                Some((PathBuf::from(artifact), PathBuf::from(source)))
            })
            .collect();
        ChangedTargets {
            source_base_path: PathBuf::from(self.base_path),
            artifact_base_path,
            artifacts_to_sources,
        }
    }
}

/// The lazy interface: instead of normalizing and building a fixed target
/// set, a dedicated builder determines and materializes only the targets
/// owning a working set of sources, and returns one merged source
/// database.
#[derive(Clone, Debug)]
pub struct Lazy {
    raw: Raw,
    options: InvocationOptions,
    /// Label of the dedicated builder script.
    builder_label: String,
}

impl Lazy {
    pub fn new(raw: Raw, options: InvocationOptions, builder_label: impl Into<String>) -> Self {
        Self { raw, options, builder_label: builder_label.into() }
    }

    /// Builds the merged build map covering the owners of the given source
    /// paths. Dropped targets are logged with their conflict records; the
    /// conflict policy matches the classic merge.
    pub async fn construct_build_map(&self, source_paths: &[PathBuf]) -> Result<BuildMap> {
        let mut args = vec![self.builder_label.clone(), "--".to_string()];
        for path in source_paths {
            args.push("--source".to_string());
            args.push(path.display().to_string());
        }
        let reply = self.raw.bxl(&self.options, &args).await?;
        let output: LazyBuildOutput = serde_json::from_value(reply)
            .map_err(|err| SourceDbError::json("lazy build output", err))?;

        for (target, conflict) in &output.dropped_targets {
            warn!(
                target = %target,
                conflict_with = %conflict.conflict_with,
                artifact = %conflict.artifact_path,
                preserved = %conflict.preserved_source_path,
                dropped = %conflict.dropped_source_path,
                "lazy build dropped a target due to a build map conflict"
            );
        }
        let build_map = BuildMap::from_json_value(&output.build_map, "lazy build map")?;
        debug!(
            entries = build_map.len(),
            built_targets = output.built_targets_count,
            dropped_targets = output.dropped_targets.len(),
            "lazily constructed build map"
        );
        Ok(build_map)
    }
}

#[derive(Debug, Deserialize)]
struct LazyBuildOutput {
    build_map: Value,
    #[serde(default)]
    built_targets_count: u64,
    #[serde(default)]
    dropped_targets: std::collections::BTreeMap<String, DroppedTargetConflict>,
}

#[derive(Debug, Deserialize)]
struct DroppedTargetConflict {
    conflict_with: String,
    artifact_path: String,
    preserved_source_path: String,
    dropped_source_path: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn normalization_query_mentions_all_filters() {
        let query = normalization_query(&["//foo/...".to_string(), "//bar:baz".to_string()]);
        assert!(query.contains(r#"set("//foo/..." "//bar:baz")"#));
        assert!(query.contains("python_binary|python_library|python_test"));
        assert!(query.contains("attrfilter(labels, generated"));
        assert!(query.contains("attrfilter(labels, no_pyre"));
        assert!(query.contains("attrfilter(labels, unittest-library"));
    }

    #[test]
    fn housekeeping_files_are_recognized() {
        assert!(is_housekeeping_file(Path::new("pkg/__manifest__.py")));
        assert!(is_housekeeping_file(Path::new("__test_main__.py")));
        assert!(!is_housekeeping_file(Path::new("pkg/module.py")));
    }

    #[test]
    fn changed_target_attributes_prefer_the_explicit_base_module() {
        let attributes: TargetAttributes = serde_json::from_value(serde_json::json!({
            "buck.base_path": "project/pkg",
            "buck.base_module": "implied.module",
            "base_module": "explicit.module",
            "srcs": {"a.py": "src/a.py", "remote.py": "//other/cell:remote.py"}
        }))
        .unwrap();
        let changed = attributes.into_changed_targets();
        assert_eq!(changed.source_base_path, PathBuf::from("project/pkg"));
        assert_eq!(changed.artifact_base_path, PathBuf::from("explicit/module"));
        // the cross-cell source is skipped
        assert_eq!(
            changed.artifacts_to_sources,
            vec![(PathBuf::from("a.py"), PathBuf::from("src/a.py"))]
        );
        assert_eq!(
            changed.build_map_pairs().collect::<Vec<_>>(),
            vec![(PathBuf::from("explicit/module/a.py"), PathBuf::from("project/pkg/src/a.py"))]
        );
    }

    #[test]
    fn changed_target_attributes_fall_back_to_the_base_path() {
        let attributes: TargetAttributes = serde_json::from_value(serde_json::json!({
            "buck.base_path": "project/pkg",
            "srcs": {"a.py": "a.py"}
        }))
        .unwrap();
        let changed = attributes.into_changed_targets();
        assert_eq!(changed.artifact_base_path, PathBuf::from("project/pkg"));
    }
}
