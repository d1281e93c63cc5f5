//! Materializes a build map as a tree of symbolic links and keeps the tree
//! in sync with incremental build-map deltas.
//!
//! Each link's path under the artifact root equals its build-map key, and
//! its target is the source root joined with the build-map value. The
//! materializer relies on artifact keys being disjoint in the
//! file-vs-directory sense: no key is a path prefix of another key. The
//! build tool guarantees this; it is not re-checked here.

use crate::{
    buildmap::{BuildMap, BuildMapDifference, DifferenceKind},
    error::ArtifactError,
};
use futures_util::{stream, TryStreamExt};
use std::path::{Path, PathBuf};

/// How many filesystem mutations are kept in flight at once.
const CONCURRENT_LINK_OPERATIONS: usize = 64;

/// Creates one symbolic link per build-map entry under `artifact_root`.
///
/// Parent directories are created as needed (permission `0777` subject to
/// the process umask). The ordering between entries is unspecified; the
/// future resolves only after every link exists. Fails if either root is
/// not a directory or any link creation fails, e.g. on a collision with an
/// existing non-symlink file.
pub async fn populate(
    source_root: &Path,
    artifact_root: &Path,
    build_map: &BuildMap,
) -> Result<(), ArtifactError> {
    ensure_directory(source_root).await?;
    ensure_directory(artifact_root).await?;
    trace!(
        entries = build_map.len(),
        artifact_root = %artifact_root.display(),
        "populating artifact root"
    );

    stream::iter(build_map.iter().map(Ok))
        .try_for_each_concurrent(Some(CONCURRENT_LINK_OPERATIONS), |(artifact, source)| {
            let link = artifact_root.join(artifact);
            let target = source_root.join(source);
            async move { create_link(&link, &target).await }
        })
        .await
}

/// Applies a build-map difference to an already populated artifact root.
///
/// `New` entries create a link, `Deleted` entries remove one and `Changed`
/// entries replace the link target. The operation is not transactional:
/// on error, mutations already applied remain in place and the error is
/// surfaced; the next build reconciles.
pub async fn update(
    source_root: &Path,
    artifact_root: &Path,
    difference: &BuildMapDifference,
) -> Result<(), ArtifactError> {
    ensure_directory(source_root).await?;
    ensure_directory(artifact_root).await?;
    trace!(
        entries = difference.len(),
        artifact_root = %artifact_root.display(),
        "updating artifact root"
    );

    stream::iter(difference.iter().map(Ok))
        .try_for_each_concurrent(Some(CONCURRENT_LINK_OPERATIONS), |(artifact, kind)| {
            let link = artifact_root.join(artifact);
            let kind = kind.clone();
            async move {
                match kind {
                    DifferenceKind::New(source) => {
                        create_link(&link, &source_root.join(source)).await
                    }
                    DifferenceKind::Deleted => remove_link(&link).await,
                    DifferenceKind::Changed(source) => {
                        // replace the target by removing the old link first
                        remove_link(&link).await?;
                        create_link(&link, &source_root.join(source)).await
                    }
                }
            }
        })
        .await
}

/// Removes everything under the artifact root, leaving the root itself in
/// place. Cold builds and snapshot restores call this so stale links from
/// a previous session cannot collide with fresh ones.
pub async fn clear(artifact_root: &Path) -> Result<(), ArtifactError> {
    ensure_directory(artifact_root).await?;
    trace!(artifact_root = %artifact_root.display(), "clearing artifact root");

    let mut entries = tokio::fs::read_dir(artifact_root).await.map_err(|source| {
        ArtifactError::RemoveLink { path: artifact_root.to_path_buf(), source }
    })?;
    loop {
        let entry = entries.next_entry().await.map_err(|source| {
            ArtifactError::RemoveLink { path: artifact_root.to_path_buf(), source }
        })?;
        let Some(entry) = entry else { break };
        let path = entry.path();
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        let removed = if is_dir {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        removed.map_err(|source| ArtifactError::RemoveLink { path, source })?;
    }
    Ok(())
}

async fn ensure_directory(path: &Path) -> Result<(), ArtifactError> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        _ => Err(ArtifactError::NotADirectory(path.to_path_buf())),
    }
}

async fn create_link(link: &Path, target: &Path) -> Result<(), ArtifactError> {
    if let Some(parent) = link.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|source| {
            ArtifactError::CreateDirectory { path: parent.to_path_buf(), source }
        })?;
    }
    tokio::fs::symlink(target, link)
        .await
        .map_err(|source| ArtifactError::CreateLink { path: link.to_path_buf(), source })
}

async fn remove_link(link: &Path) -> Result<(), ArtifactError> {
    tokio::fs::remove_file(link)
        .await
        .map_err(|source| ArtifactError::RemoveLink { path: link.to_path_buf(), source })
}

/// Turns a difference into the absolute artifact-path events the module
/// tracker consumes, sorted by path.
pub fn difference_to_events(
    artifact_root: &Path,
    difference: &BuildMapDifference,
) -> Vec<crate::module::PathEvent> {
    use crate::module::PathEvent;

    difference
        .iter()
        .map(|(artifact, kind)| {
            let path = artifact_root.join(artifact);
            match kind {
                DifferenceKind::New(_) | DifferenceKind::Changed(_) => {
                    PathEvent::created_or_changed(path)
                }
                DifferenceKind::Deleted => PathEvent::removed(path),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buildmap::BuildMap;
    use std::path::PathBuf;

    struct Roots {
        _dir: tempfile::TempDir,
        source: PathBuf,
        artifact: PathBuf,
    }

    fn roots() -> Roots {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source");
        let artifact = dir.path().join("artifact");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::create_dir_all(&artifact).unwrap();
        Roots { _dir: dir, source, artifact }
    }

    fn write_source(roots: &Roots, relative: &str, content: &str) {
        let path = roots.source.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn read_through_link(roots: &Roots, relative: &str) -> String {
        std::fs::read_to_string(roots.artifact.join(relative)).unwrap()
    }

    #[tokio::test]
    async fn populate_links_every_entry() {
        let roots = roots();
        write_source(&roots, "src/a.py", "a");
        write_source(&roots, "src/nested/b.py", "b");

        let build_map = BuildMap::from_pairs_lenient([
            ("pkg/a.py", "src/a.py"),
            ("pkg/sub/b.py", "src/nested/b.py"),
        ]);
        populate(&roots.source, &roots.artifact, &build_map).await.unwrap();

        assert!(roots.artifact.join("pkg/a.py").is_symlink());
        assert_eq!(read_through_link(&roots, "pkg/a.py"), "a");
        assert_eq!(read_through_link(&roots, "pkg/sub/b.py"), "b");
    }

    #[tokio::test]
    async fn populate_rejects_missing_roots() {
        let roots = roots();
        let build_map = BuildMap::default();
        let missing = roots.source.join("nope");
        let err = populate(&missing, &roots.artifact, &build_map).await.unwrap_err();
        assert!(matches!(err, ArtifactError::NotADirectory(path) if path == missing));
    }

    #[tokio::test]
    async fn populate_fails_on_collision_with_regular_file() {
        let roots = roots();
        write_source(&roots, "src/a.py", "a");
        std::fs::write(roots.artifact.join("a.py"), "already here").unwrap();

        let build_map = BuildMap::from_pairs_lenient([("a.py", "src/a.py")]);
        let err = populate(&roots.source, &roots.artifact, &build_map).await.unwrap_err();
        assert!(matches!(err, ArtifactError::CreateLink { .. }));
    }

    #[tokio::test]
    async fn clear_empties_the_artifact_root() {
        let roots = roots();
        write_source(&roots, "src/a.py", "a");
        let build_map = BuildMap::from_pairs_lenient([("pkg/a.py", "src/a.py")]);
        populate(&roots.source, &roots.artifact, &build_map).await.unwrap();
        std::fs::write(roots.artifact.join("stray.txt"), "stale").unwrap();

        clear(&roots.artifact).await.unwrap();
        assert!(roots.artifact.exists());
        assert_eq!(std::fs::read_dir(&roots.artifact).unwrap().count(), 0);

        // a fresh populate over the cleared root succeeds
        populate(&roots.source, &roots.artifact, &build_map).await.unwrap();
        assert_eq!(read_through_link(&roots, "pkg/a.py"), "a");
    }

    #[tokio::test]
    async fn update_applies_each_tag() {
        let roots = roots();
        write_source(&roots, "src/a.py", "a");
        write_source(&roots, "src/b.py", "b");
        write_source(&roots, "src/b2.py", "b2");
        write_source(&roots, "src/c.py", "c");

        let original =
            BuildMap::from_pairs_lenient([("a.py", "src/a.py"), ("b.py", "src/b.py")]);
        populate(&roots.source, &roots.artifact, &original).await.unwrap();

        let current =
            BuildMap::from_pairs_lenient([("b.py", "src/b2.py"), ("c.py", "src/c.py")]);
        let difference = BuildMap::difference(&original, &current);
        update(&roots.source, &roots.artifact, &difference).await.unwrap();

        assert!(!roots.artifact.join("a.py").exists());
        assert_eq!(read_through_link(&roots, "b.py"), "b2");
        assert_eq!(read_through_link(&roots, "c.py"), "c");
    }

    #[tokio::test]
    async fn update_surfaces_removal_of_missing_link() {
        let roots = roots();
        let difference = BuildMapDifference::from_entries([(
            "never-created.py",
            DifferenceKind::Deleted,
        )]);
        let err = update(&roots.source, &roots.artifact, &difference).await.unwrap_err();
        assert!(matches!(err, ArtifactError::RemoveLink { .. }));
    }

    #[test]
    fn events_are_sorted_and_tagged() {
        use crate::module::PathEventKind;

        let difference = BuildMapDifference::from_entries([
            ("pkg/b.py", DifferenceKind::Deleted),
            ("pkg/a.py", DifferenceKind::New(PathBuf::from("src/a.py"))),
            ("pkg/c.py", DifferenceKind::Changed(PathBuf::from("src/c.py"))),
        ]);
        let events = difference_to_events(Path::new("/artifact"), &difference);
        let kinds: Vec<_> =
            events.iter().map(|event| (event.path.clone(), event.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                (PathBuf::from("/artifact/pkg/a.py"), PathEventKind::CreatedOrChanged),
                (PathBuf::from("/artifact/pkg/b.py"), PathEventKind::Removed),
                (PathBuf::from("/artifact/pkg/c.py"), PathEventKind::CreatedOrChanged),
            ]
        );
    }
}
