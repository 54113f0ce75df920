// Crash-safe JSON files: serialize into a temp file in the destination
// directory, fsync, then rename over the old file.

use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{RelayError, Result};

/// Atomically replace `path` with the JSON encoding of `value`.
///
/// A crash at any point leaves either the previous file or the new one on
/// disk, never a truncated mix of the two.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|e| RelayError::persistence(path, e))?;

    let bytes = serde_json::to_vec_pretty(value)?;
    let mut tmp =
        tempfile::NamedTempFile::new_in(dir).map_err(|e| RelayError::persistence(path, e))?;
    tmp.write_all(&bytes)
        .map_err(|e| RelayError::persistence(path, e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| RelayError::persistence(path, e))?;
    tmp.persist(path)
        .map_err(|e| RelayError::persistence(path, e.error))?;
    Ok(())
}

/// Read a JSON file. Returns `Ok(None)` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(RelayError::persistence(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ids.json");

        write_json_atomic(&path, &vec!["a", "b"]).unwrap();
        let back: Option<Vec<String>> = read_json(&path).unwrap();
        assert_eq!(back, Some(vec!["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn overwrite_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ids.json");

        write_json_atomic(&path, &vec!["a"]).unwrap();
        write_json_atomic(&path, &vec!["a", "b", "c"]).unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1, "temp file should have been renamed away");
        let back: Option<Vec<String>> = read_json(&path).unwrap();
        assert_eq!(back.unwrap().len(), 3);
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let back: Option<Vec<String>> = read_json(&dir.path().join("nope.json")).unwrap();
        assert!(back.is_none());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ids.json");
        std::fs::write(&path, b"[\"a\", ").unwrap();
        assert!(read_json::<Vec<String>>(&path).is_err());
    }
}
