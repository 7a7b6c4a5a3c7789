//! Flat-file persistence: whole-document JSON writes via temp file + rename.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Serialize `value` and atomically replace the file at `path`.
///
/// Parent directories are created as needed. Readers never observe a
/// partially written file: the document is written and synced to a sibling
/// temp file, then renamed over the target.
pub async fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let json = serde_json::to_vec_pretty(value).map_err(std::io::Error::other)?;
    let tmp = temp_path(path);

    let mut file = fs::File::create(&tmp).await?;
    file.write_all(&json).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

/// Read and deserialize a JSON document. Returns `Ok(None)` if the file does not exist.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> std::io::Result<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let value = serde_json::from_slice(&bytes)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/state.json");
        write_json_atomic(&path, &vec![1, 2, 3]).await.unwrap();

        let back: Option<Vec<i32>> = read_json(&path).await.unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));
        assert!(!dir.path().join("nested/state.json.tmp").exists());
    }

    #[tokio::test]
    async fn missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let back: Option<Vec<i32>> = read_json(&dir.path().join("nope.json")).await.unwrap();
        assert!(back.is_none());
    }

    #[tokio::test]
    async fn corrupt_file_is_invalid_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        let err = read_json::<Vec<i32>>(&path).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
