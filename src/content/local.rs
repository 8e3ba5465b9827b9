use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};

use super::{
    check_oid, copy_hashed, hash_stream, transform_key, ByteStream, ContentError, ContentStore,
};
use crate::meta::Object;

/// Filesystem content store.
///
/// Objects live at `<base>/aa/bb/rest`. Uploads are written to a uniquely named
/// staging file next to the final path and renamed into place once verified,
/// so readers never observe partial content and concurrent identical uploads
/// settle on the same bytes.
pub struct LocalStore {
    base_path: PathBuf,
}

impl LocalStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, std::io::Error> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    fn object_path(&self, oid: &str) -> Result<PathBuf, ContentError> {
        check_oid(oid)?;
        Ok(self.base_path.join(transform_key(oid)))
    }

    async fn write_staged(
        &self,
        staging: &Path,
        path: &Path,
        object: &Object,
        body: &mut ByteStream,
    ) -> Result<(), ContentError> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(staging)
            .await?;

        let digest = copy_hashed(body, &mut file).await?;
        file.sync_all().await?;
        drop(file);

        digest.check(object)?;
        fs::rename(staging, path).await?;
        Ok(())
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}.tmp", uuid::Uuid::new_v4()));
    PathBuf::from(name)
}

fn not_found(oid: &str, e: std::io::Error) -> ContentError {
    if e.kind() == ErrorKind::NotFound {
        ContentError::NotFound(oid.to_string())
    } else {
        ContentError::Io(e)
    }
}

#[async_trait]
impl ContentStore for LocalStore {
    async fn get(&self, object: &Object) -> Result<ByteStream, ContentError> {
        let path = self.object_path(&object.oid)?;
        let file = File::open(&path)
            .await
            .map_err(|e| not_found(&object.oid, e))?;
        Ok(Box::pin(file))
    }

    async fn put(&self, object: &Object, mut body: ByteStream) -> Result<(), ContentError> {
        let path = self.object_path(&object.oid)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }

        let staging = staging_path(&path);
        let result = self.write_staged(&staging, &path, object, &mut body).await;
        if let Err(ref e) = result {
            tracing::debug!(oid = %object.oid, error = %e, "Discarding staged upload");
            if let Err(e) = fs::remove_file(&staging).await {
                if e.kind() != ErrorKind::NotFound {
                    tracing::warn!(path = %staging.display(), error = %e, "Failed to remove staging file");
                }
            }
        }
        result
    }

    async fn exists(&self, object: &Object) -> bool {
        let Ok(path) = self.object_path(&object.oid) else {
            return false;
        };
        match fs::metadata(&path).await {
            Ok(meta) => meta.is_file(),
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                tracing::warn!(oid = %object.oid, error = %e, "Failed to stat object");
                false
            }
        }
    }

    async fn verify(&self, object: &Object) -> Result<(), ContentError> {
        let path = self.object_path(&object.oid)?;
        let meta = fs::metadata(&path)
            .await
            .map_err(|e| not_found(&object.oid, e))?;
        if meta.len() as i64 != object.size {
            return Err(ContentError::SizeMismatch {
                expected: object.size,
                actual: meta.len() as i64,
            });
        }

        let mut file = File::open(&path)
            .await
            .map_err(|e| not_found(&object.oid, e))?;
        hash_stream(&mut file).await?.check(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_path_is_sibling_of_target() {
        let path = Path::new("/base/6a/e8/rest");
        let staging = staging_path(path);
        assert_eq!(staging.parent(), path.parent());
        let name = staging.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("rest."));
        assert!(name.ends_with(".tmp"));
    }

    #[test]
    fn test_object_path_rejects_separators() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        assert!(store.object_path("").is_err());
        assert!(store.object_path("ab/../cd").is_err());
        assert_eq!(
            store.object_path("abcdef").unwrap(),
            dir.path().join("ab").join("cd").join("ef")
        );
    }
}
