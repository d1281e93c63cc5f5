//! Utility functions

use crate::error::{Result, SourceDbError};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

/// Canonicalize the path, returning an error with the path attached.
///
/// Unlike `std::fs::canonicalize` this does not return UNC paths on Windows.
pub fn canonicalize(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    dunce::canonicalize(path).map_err(|err| SourceDbError::io(err, path))
}

/// Returns the path relative to `root`, or the path itself when it is not
/// located underneath `root`.
///
/// `/data/project/pkg/mod.py` with root `/data/project` -> `pkg/mod.py`
pub fn relative_to<'a>(path: &'a Path, root: &Path) -> &'a Path {
    path.strip_prefix(root).unwrap_or(path)
}

/// Creates all missing parent directories of the given file path.
pub fn create_parent_dir_all(file: impl AsRef<Path>) -> Result<()> {
    let file = file.as_ref();
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).map_err(|err| SourceDbError::io(err, parent))?;
    }
    Ok(())
}

/// Reads the json file and deserializes it into the provided type.
pub fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|err| SourceDbError::io(err, path))?;
    serde_json::from_str(&contents)
        .map_err(|err| SourceDbError::json(path.display().to_string(), err))
}

/// Writes serializes the provided value to json and writes it to the file.
pub fn write_json_file<T: Serialize>(value: &T, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let file = fs::File::create(path).map_err(|err| SourceDbError::io(err, path))?;
    let mut writer = std::io::BufWriter::new(file);
    serde_json::to_writer(&mut writer, value)
        .map_err(|err| SourceDbError::json(path.display().to_string(), err))?;
    writer.flush().map_err(|err| SourceDbError::io(err, path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_relativize_paths() {
        let root = Path::new("/data/project");
        assert_eq!(
            relative_to(Path::new("/data/project/pkg/mod.py"), root),
            Path::new("pkg/mod.py")
        );
        assert_eq!(relative_to(Path::new("/elsewhere/mod.py"), root), Path::new("/elsewhere/mod.py"));
    }

    #[test]
    fn json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("nested").join("value.json");
        create_parent_dir_all(&file).unwrap();
        write_json_file(&vec![1u64, 2, 3], &file).unwrap();
        let read: Vec<u64> = read_json_file(&file).unwrap();
        assert_eq!(read, vec![1, 2, 3]);
    }

    #[test]
    fn read_json_file_reports_path() {
        let err = read_json_file::<Vec<u64>>("/nonexistent/value.json").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/value.json"));
    }
}
