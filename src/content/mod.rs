mod local;
mod s3;

pub use local::LocalStore;
pub use s3::{BucketAcl, S3Config, S3Store};

use std::pin::Pin;

use async_trait::async_trait;
use ring::digest::{Context, SHA256};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::meta::Object;

/// A stream of object bytes, as handed to and returned from a content store.
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Invalid object id: {0:?}")]
    InvalidOid(String),
    #[error("Content size does not match (expected {expected}, got {actual})")]
    SizeMismatch { expected: i64, actual: i64 },
    #[error("Content hash does not match OID (expected {expected}, got {actual})")]
    HashMismatch { expected: String, actual: String },
    #[error("Not supported by this content store: {0}")]
    Unsupported(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Backend error: {0}")]
    Backend(String),
}

impl ContentError {
    /// True for the two content-integrity failures.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            ContentError::SizeMismatch { .. } | ContentError::HashMismatch { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ContentError::NotFound(_))
    }
}

/// Content-addressable byte storage keyed by an object's oid.
///
/// Writes are verified against the object's size and SHA-256 oid before they
/// become visible. Reads trust the write path and do no verification; use
/// [`ContentStore::verify`] for an explicit integrity check.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn get(&self, object: &Object) -> Result<ByteStream, ContentError>;
    async fn put(&self, object: &Object, body: ByteStream) -> Result<(), ContentError>;
    async fn exists(&self, object: &Object) -> bool;
    async fn verify(&self, object: &Object) -> Result<(), ContentError>;
}

/// Reject oids that could escape the key layout. Only ASCII alphanumerics
/// are accepted.
pub fn check_oid(oid: &str) -> Result<(), ContentError> {
    if oid.is_empty() || !oid.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(ContentError::InvalidOid(oid.to_string()));
    }
    Ok(())
}

/// Derive the storage key for an oid: `aa/bb/rest`.
///
/// Oids shorter than five characters are used verbatim.
pub fn transform_key(oid: &str) -> String {
    if oid.len() < 5 || !oid.is_ascii() {
        return oid.to_string();
    }
    format!("{}/{}/{}", &oid[0..2], &oid[2..4], &oid[4..])
}

/// Byte count and lowercase hex SHA-256 of a fully consumed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Digest {
    pub size: i64,
    pub oid: String,
}

impl Digest {
    /// Check the digest against the object, size first.
    pub fn check(&self, object: &Object) -> Result<(), ContentError> {
        if self.size != object.size {
            return Err(ContentError::SizeMismatch {
                expected: object.size,
                actual: self.size,
            });
        }
        if self.oid != object.oid {
            return Err(ContentError::HashMismatch {
                expected: object.oid.clone(),
                actual: self.oid.clone(),
            });
        }
        Ok(())
    }
}

/// Copy `reader` into `writer`, hashing the bytes as they pass through.
pub(crate) async fn copy_hashed<R, W>(reader: &mut R, writer: &mut W) -> std::io::Result<Digest>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut ctx = Context::new(&SHA256);
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut size: i64 = 0;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        ctx.update(&buf[..n]);
        writer.write_all(&buf[..n]).await?;
        size += n as i64;
    }
    writer.flush().await?;

    Ok(Digest {
        size,
        oid: hex::encode(ctx.finish().as_ref()),
    })
}

/// Hash a stream without keeping its bytes.
pub(crate) async fn hash_stream<R>(reader: &mut R) -> std::io::Result<Digest>
where
    R: AsyncRead + Unpin + ?Sized,
{
    copy_hashed(reader, &mut tokio::io::sink()).await
}

/// Lowercase hex SHA-256 of an in-memory buffer.
pub(crate) fn sha256_hex(data: &[u8]) -> String {
    hex::encode(ring::digest::digest(&SHA256, data).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_OID: &str = "6ae8a75555209fd6c44157c0aed8016e763ff435a19cf186f76863140143ff72";

    #[test]
    fn test_transform_key_splits_oid() {
        assert_eq!(
            transform_key(TEST_OID),
            "6a/e8/a75555209fd6c44157c0aed8016e763ff435a19cf186f76863140143ff72"
        );
    }

    #[test]
    fn test_transform_key_short_oid_verbatim() {
        assert_eq!(transform_key("abcd"), "abcd");
        assert_eq!(transform_key(""), "");
        assert_eq!(transform_key("abcde"), "ab/cd/e");
    }

    #[test]
    fn test_check_oid() {
        assert!(check_oid(TEST_OID).is_ok());
        assert!(check_oid("abcd").is_ok());
        for bad in ["", "../etc/passwd", "ab/cd", "ab%2Fcd", "a b", "é"] {
            assert!(
                matches!(check_oid(bad), Err(ContentError::InvalidOid(_))),
                "{bad:?} accepted"
            );
        }
    }

    #[test]
    fn test_sha256_hex_known_value() {
        assert_eq!(sha256_hex(b"test content"), TEST_OID);
    }

    #[tokio::test]
    async fn test_copy_hashed_counts_and_hashes() {
        let mut reader: &[u8] = b"test content";
        let mut out = Vec::new();
        let digest = copy_hashed(&mut reader, &mut out).await.unwrap();
        assert_eq!(digest.size, 12);
        assert_eq!(digest.oid, TEST_OID);
        assert_eq!(out, b"test content");
    }

    #[test]
    fn test_digest_check_size_before_hash() {
        let object = Object::new(TEST_OID, 12);
        let digest = Digest {
            size: 13,
            oid: "0".repeat(64),
        };
        assert!(matches!(
            digest.check(&object),
            Err(ContentError::SizeMismatch {
                expected: 12,
                actual: 13
            })
        ));
    }
}
