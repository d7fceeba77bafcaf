//! Opaque object storage: put/get/delete/list plus a chunked multipart
//! sub-API, keyed `{sessionId}/{fileId}`.
//!
//! The chest engine and reaper depend on this trait rather than a concrete
//! filesystem layout, so an object-store-backed implementation could be
//! swapped in later without touching either.

use crate::error::{Error, Result, ResultIoExt};
use async_trait::async_trait;
use bytes::Bytes;
use sha2::Digest;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

pub type BlobReader = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

#[derive(Debug, Clone)]
pub struct Part {
    pub part_number: u32,
    pub etag: String,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;
    async fn get(&self, key: &str) -> Result<BlobReader>;
    async fn size(&self, key: &str) -> Result<u64>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn multipart_create(&self, key: &str) -> Result<String>;
    async fn multipart_upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String>;
    async fn multipart_complete(&self, key: &str, upload_id: &str, parts: &[Part]) -> Result<()>;
    async fn multipart_abort(&self, key: &str, upload_id: &str) -> Result<()>;

    /// Removes multipart staging state older than `older_than_secs` that no
    /// `complete`/`abort` call ever claimed, and returns how many uploads
    /// were pruned. A session's upload ids live only inside its signed
    /// multipart tokens, not in the metadata store, so the reaper cannot
    /// enumerate them by session; this age-based sweep is the fallback.
    /// The default implementation does nothing.
    async fn prune_stale_multipart_uploads(&self, _older_than_secs: i64) -> Result<usize> {
        Ok(0)
    }
}

fn validate_path_component(component: &str) -> Result<()> {
    if component.is_empty() || component == "." || component == ".." {
        return Err(Error::BadRequest {
            msg: format!("invalid blob key component: '{component}'"),
        });
    }
    if component.contains('/') || component.contains('\\') || component.contains('\0') {
        return Err(Error::BadRequest {
            msg: "blob key component cannot contain path separators".to_string(),
        });
    }
    Ok(())
}

fn validate_path_within_base(base: &Path, path: &Path) -> Result<()> {
    let canonical_base = base.canonicalize().map_io_err(base)?;
    let path_to_check = if path.exists() {
        path.canonicalize()?
    } else if let Some(parent) = path.parent() {
        if parent.exists() {
            parent.canonicalize()?.join(path.file_name().ok_or_else(|| Error::Internal {
                msg: "invalid blob path structure".to_string(),
            })?)
        } else {
            return Ok(());
        }
    } else {
        return Err(Error::Internal {
            msg: "invalid blob path structure".to_string(),
        });
    };

    if !path_to_check.starts_with(&canonical_base) {
        return Err(Error::Internal {
            msg: "blob path traversal detected".to_string(),
        });
    }
    Ok(())
}

/// Filesystem-backed [`BlobStore`]. Keys are `{sessionId}/{fileId}`, which
/// maps directly onto `{base}/{sessionId}/{fileId}`; multipart uploads stage
/// their parts under `{base}/.multipart/{uploadId}/part-{n}` until `complete`
/// streams them, in order, into the final key.
pub struct FsBlobStore {
    base_path: PathBuf,
}

impl FsBlobStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn key_path(&self, key: &str) -> Result<PathBuf> {
        let mut segments = key.split('/');
        let session_id = segments.next().unwrap_or_default();
        let file_id = segments.next().unwrap_or_default();
        if segments.next().is_some() {
            return Err(Error::BadRequest {
                msg: format!("malformed blob key: {key}"),
            });
        }
        validate_path_component(session_id)?;
        validate_path_component(file_id)?;

        let path = self.base_path.join(session_id).join(file_id);
        validate_path_within_base(&self.base_path, &path)?;
        Ok(path)
    }

    fn multipart_dir(&self, upload_id: &str) -> Result<PathBuf> {
        validate_path_component(upload_id)?;
        let path = self.base_path.join(".multipart").join(upload_id);
        validate_path_within_base(&self.base_path, &path)?;
        Ok(path)
    }

    fn part_path(&self, upload_id: &str, part_number: u32) -> Result<PathBuf> {
        Ok(self
            .multipart_dir(upload_id)?
            .join(format!("part-{part_number:05}")))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.key_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_io_err(parent)?;
        }

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await
            .map_io_err(&path)?;
        file.write_all(&data).await.map_io_err(&path)?;
        file.sync_all().await.map_io_err(&path)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<BlobReader> {
        let path = self.key_path(key)?;
        let file = fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::BlobMissing { key: key.to_string() }
            } else {
                Error::from(e)
            }
        })?;
        Ok(Box::new(file))
    }

    async fn size(&self, key: &str) -> Result<u64> {
        let path = self.key_path(key)?;
        let metadata = fs::metadata(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::BlobMissing { key: key.to_string() }
            } else {
                Error::from(e)
            }
        })?;
        Ok(metadata.len())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.key_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let session_id = prefix.trim_end_matches('/');
        validate_path_component(session_id)?;
        let dir = self.base_path.join(session_id);

        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&dir).await.map_io_err(&dir)?;
        while let Some(entry) = entries.next_entry().await.map_io_err(&dir)? {
            if entry.file_type().await.map_io_err(&dir)?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    keys.push(format!("{session_id}/{name}"));
                }
            }
        }
        Ok(keys)
    }

    async fn multipart_create(&self, _key: &str) -> Result<String> {
        let upload_id = Uuid::new_v4().to_string();
        let dir = self.multipart_dir(&upload_id)?;
        fs::create_dir_all(&dir).await.map_io_err(&dir)?;
        Ok(upload_id)
    }

    async fn multipart_upload_part(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String> {
        let path = self.part_path(upload_id, part_number)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_io_err(parent)?;
        }
        // Re-uploading a part number overwrites it, per blob-store semantics.
        let mut file = fs::File::create(&path).await.map_io_err(&path)?;
        file.write_all(&data).await.map_io_err(&path)?;
        file.sync_all().await.map_io_err(&path)?;

        let etag = format!("{:x}", sha2::Sha256::digest(&data));
        Ok(etag)
    }

    async fn multipart_complete(&self, key: &str, upload_id: &str, parts: &[Part]) -> Result<()> {
        let final_path = self.key_path(key)?;
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await.map_io_err(parent)?;
        }

        let mut sorted = parts.to_vec();
        sorted.sort_by_key(|p| p.part_number);

        let mut output = fs::File::create(&final_path).await.map_io_err(&final_path)?;
        for part in &sorted {
            let part_path = self.part_path(upload_id, part.part_number)?;
            let mut buf = Vec::new();
            fs::File::open(&part_path)
                .await
                .map_io_err(&part_path)?
                .read_to_end(&mut buf)
                .await
                .map_io_err(&part_path)?;
            output.write_all(&buf).await.map_io_err(&final_path)?;
        }
        output.sync_all().await.map_io_err(&final_path)?;

        self.multipart_abort(key, upload_id).await
    }

    async fn multipart_abort(&self, _key: &str, upload_id: &str) -> Result<()> {
        let dir = self.multipart_dir(upload_id)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn prune_stale_multipart_uploads(&self, older_than_secs: i64) -> Result<usize> {
        let root = self.base_path.join(".multipart");
        if !root.exists() {
            return Ok(0);
        }

        let cutoff = std::time::SystemTime::now()
            - std::time::Duration::from_secs(older_than_secs.max(0) as u64);

        let mut pruned = 0;
        let mut entries = fs::read_dir(&root).await.map_io_err(&root)?;
        while let Some(entry) = entries.next_entry().await.map_io_err(&root)? {
            let path = entry.path();
            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(m) => m,
                Err(_) => continue,
            };
            if modified < cutoff {
                if fs::remove_dir_all(&path).await.is_ok() {
                    pruned += 1;
                }
            }
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, FsBlobStore) {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn put_then_get_roundtrips_bytes() {
        let (_dir, store) = store();
        let key = format!("{}/{}", Uuid::new_v4(), Uuid::new_v4());
        store.put(&key, Bytes::from_static(b"hello\n")).await.unwrap();

        let mut reader = store.get(&key).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello\n");
        assert_eq!(store.size(&key).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn get_on_missing_key_is_blob_missing() {
        let (_dir, store) = store();
        let key = format!("{}/{}", Uuid::new_v4(), Uuid::new_v4());
        let err = store.get(&key).await.unwrap_err();
        assert!(matches!(err, Error::BlobMissing { .. }));
    }

    #[tokio::test]
    async fn multipart_assembles_parts_in_sorted_order() {
        let (_dir, store) = store();
        let session_id = Uuid::new_v4();
        let file_id = Uuid::new_v4();
        let key = format!("{session_id}/{file_id}");

        let upload_id = store.multipart_create(&key).await.unwrap();
        let etag2 = store
            .multipart_upload_part(&key, &upload_id, 2, Bytes::from_static(b"world"))
            .await
            .unwrap();
        let etag1 = store
            .multipart_upload_part(&key, &upload_id, 1, Bytes::from_static(b"hello "))
            .await
            .unwrap();

        store
            .multipart_complete(
                &key,
                &upload_id,
                &[
                    Part { part_number: 2, etag: etag2 },
                    Part { part_number: 1, etag: etag1 },
                ],
            )
            .await
            .unwrap();

        let mut reader = store.get(&key).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello world");
    }

    #[tokio::test]
    async fn reuploading_a_part_number_replaces_it() {
        let (_dir, store) = store();
        let key = format!("{}/{}", Uuid::new_v4(), Uuid::new_v4());
        let upload_id = store.multipart_create(&key).await.unwrap();

        store
            .multipart_upload_part(&key, &upload_id, 1, Bytes::from_static(b"first"))
            .await
            .unwrap();
        let etag = store
            .multipart_upload_part(&key, &upload_id, 1, Bytes::from_static(b"second"))
            .await
            .unwrap();

        store
            .multipart_complete(&key, &upload_id, &[Part { part_number: 1, etag }])
            .await
            .unwrap();

        let mut reader = store.get(&key).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"second");
    }

    #[tokio::test]
    async fn list_returns_keys_under_a_session_prefix() {
        let (_dir, store) = store();
        let session_id = Uuid::new_v4();
        let file_a = Uuid::new_v4();
        let file_b = Uuid::new_v4();
        store
            .put(&format!("{session_id}/{file_a}"), Bytes::from_static(b"a"))
            .await
            .unwrap();
        store
            .put(&format!("{session_id}/{file_b}"), Bytes::from_static(b"b"))
            .await
            .unwrap();

        let mut keys = store.list(&session_id.to_string()).await.unwrap();
        keys.sort();
        assert_eq!(keys.len(), 2);
    }

    #[tokio::test]
    async fn delete_then_list_is_empty() {
        let (_dir, store) = store();
        let session_id = Uuid::new_v4();
        let file_id = Uuid::new_v4();
        let key = format!("{session_id}/{file_id}");
        store.put(&key, Bytes::from_static(b"a")).await.unwrap();
        store.delete(&key).await.unwrap();

        assert!(store.list(&session_id.to_string()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn prune_spares_uploads_within_the_window_but_removes_those_outside_it() {
        let (_dir, store) = store();
        let key = format!("{}/{}", Uuid::new_v4(), Uuid::new_v4());
        let upload_id = store.multipart_create(&key).await.unwrap();
        store
            .multipart_upload_part(&key, &upload_id, 1, Bytes::from_static(b"in flight"))
            .await
            .unwrap();

        let untouched = store.prune_stale_multipart_uploads(3600).await.unwrap();
        assert_eq!(untouched, 0);
        assert!(store.multipart_dir(&upload_id).unwrap().exists());

        let pruned = store.prune_stale_multipart_uploads(0).await.unwrap();
        assert_eq!(pruned, 1);
        assert!(!store.multipart_dir(&upload_id).unwrap().exists());
    }

    #[tokio::test]
    async fn rejects_path_traversal_in_key() {
        let (_dir, store) = store();
        let err = store.put("../evil", Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, Error::BadRequest { .. }));
    }
}
