use std::fs;
use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::{StoreError, StoreResult};

/// Replaces `path` with whatever `fill` writes into a sibling temporary file.
///
/// The temporary file only takes the place of `path` once `fill` returned `Ok`
/// and the bytes were synced. On any failure the temporary file is dropped and
/// the previous contents of `path` stay visible to readers.
pub fn write_atomic<F>(path: &Path, fill: F) -> StoreResult<()>
where
    F: FnOnce(&mut NamedTempFile) -> std::io::Result<()>,
{
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|source| StoreError::io(parent, source))?;

    let mut staged =
        NamedTempFile::new_in(parent).map_err(|source| StoreError::io(parent, source))?;
    fill(&mut staged).map_err(|source| StoreError::io(path, source))?;
    staged
        .as_file()
        .sync_all()
        .map_err(|source| StoreError::io(path, source))?;
    staged
        .persist(path)
        .map_err(|err| StoreError::io(path, err.error))?;
    Ok(())
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let rendered =
        serde_json::to_vec_pretty(value).map_err(|source| StoreError::json(path, source))?;
    write_atomic(path, |file| {
        file.write_all(&rendered)?;
        file.write_all(b"\n")
    })
}

/// Reads a JSON document, returning `None` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(StoreError::io(path, err)),
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|source| StoreError::json(path, source))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serde_json::{json, Value};

    use super::{read_json, write_atomic, write_json_atomic};

    #[test]
    fn failed_fill_keeps_previous_contents() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("doc.json");
        write_json_atomic(&path, &json!({"value": 1}))?;

        let result = write_atomic(&path, |file| {
            file.write_all(b"{\"value\": ")?;
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
        });
        assert!(result.is_err());

        let reloaded: Option<Value> = read_json(&path)?;
        assert_eq!(reloaded, Some(json!({"value": 1})));
        let leftovers = std::fs::read_dir(temp.path())?.count();
        assert_eq!(leftovers, 1);
        Ok(())
    }

    #[test]
    fn read_json_missing_file_is_none() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let missing: Option<Value> = read_json(&temp.path().join("nope.json"))?;
        assert!(missing.is_none());
        Ok(())
    }

    #[test]
    fn read_json_reports_malformed_documents() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("broken.json");
        std::fs::write(&path, "{not json")?;
        let err = read_json::<Value>(&path).err();
        assert!(matches!(err, Some(crate::StoreError::Json { .. })));
        Ok(())
    }

    #[test]
    fn write_creates_missing_parent_directories() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("deeper").join("doc.json");
        write_json_atomic(&path, &json!(["a", "b"]))?;
        assert_eq!(read_json::<Value>(&path)?, Some(json!(["a", "b"])));
        Ok(())
    }
}
