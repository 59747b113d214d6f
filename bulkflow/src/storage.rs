//! JSON file persistence shared by the job queue and the cache index.
//!
//! Writes go to a temporary file in the target directory which is synced and
//! then renamed over the target, so a crash leaves either the old or the new
//! contents on disk.

use crate::errors::{BulkflowError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Reads a JSON document, returning `None` if the file does not exist.
///
/// Any other I/O error and any parse error is returned; a corrupt store is
/// never silently replaced by an empty one.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(BulkflowError::persistence(path, e)),
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Atomically replaces `path` with the pretty-printed JSON of `value`.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    write_atomic(path, |writer| Ok(serde_json::to_writer_pretty(writer, value)?))
}

/// Atomically replaces `path` with `bytes`.
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    write_atomic(path, |writer| {
        writer
            .write_all(bytes)
            .map_err(|e| BulkflowError::persistence(path, e))
    })
}

fn write_atomic<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<&std::fs::File>) -> Result<()>,
{
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|e| BulkflowError::persistence(dir, e))?;

    let tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| BulkflowError::persistence(dir, e))?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        write(&mut writer)?;
        writer
            .flush()
            .map_err(|e| BulkflowError::persistence(tmp.path(), e))?;
    }
    tmp.as_file()
        .sync_all()
        .map_err(|e| BulkflowError::persistence(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| BulkflowError::persistence(path, e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_read_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let value: Option<Vec<u32>> = read_json(&dir.path().join("missing.json")).unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");
        let mut map = HashMap::new();
        map.insert("a".to_string(), 1);

        write_json_atomic(&path, &map).unwrap();
        let loaded: HashMap<String, i32> = read_json(&path).unwrap().unwrap();
        assert_eq!(loaded, map);
    }

    #[test]
    fn test_write_bytes_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.bin");
        write_bytes_atomic(&path, b"first").unwrap();
        write_bytes_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, b"{not json").unwrap();

        let result: Result<Option<Vec<u32>>> = read_json(&path);
        assert!(matches!(result, Err(BulkflowError::Serialization(_))));
    }

    #[test]
    fn test_empty_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, b"  \n").unwrap();

        let value: Option<Vec<u32>> = read_json(&path).unwrap();
        assert!(value.is_none());
    }
}
