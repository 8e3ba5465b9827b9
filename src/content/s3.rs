use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use reqwest::{header, Client, Method, Response, StatusCode, Url};
use ring::hmac;
use tokio_util::io::StreamReader;

use super::{
    check_oid, copy_hashed, hash_stream, sha256_hex, transform_key, ByteStream, ContentError,
    ContentStore,
};
use crate::meta::Object;

const CONTENT_TYPE: &str = "binary/octet-stream";
const SERVICE: &str = "s3";
/// SHA-256 of the empty string, the payload hash of bodiless requests.
const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Canned access-control level applied to the bucket and every stored object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BucketAcl {
    #[default]
    Private,
    PublicRead,
    PublicReadWrite,
    AuthenticatedRead,
    BucketOwnerRead,
    BucketOwnerFullControl,
}

impl BucketAcl {
    /// Parse a canned ACL name. Unknown values fall back to `Private`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "private" | "" => BucketAcl::Private,
            "public-read" => BucketAcl::PublicRead,
            "public-read-write" => BucketAcl::PublicReadWrite,
            "authenticated-read" => BucketAcl::AuthenticatedRead,
            "bucket-owner-read" => BucketAcl::BucketOwnerRead,
            "bucket-owner-full-control" => BucketAcl::BucketOwnerFullControl,
            other => {
                tracing::warn!(acl = other, "Unrecognized bucket ACL, using private");
                BucketAcl::Private
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BucketAcl::Private => "private",
            BucketAcl::PublicRead => "public-read",
            BucketAcl::PublicReadWrite => "public-read-write",
            BucketAcl::AuthenticatedRead => "authenticated-read",
            BucketAcl::BucketOwnerRead => "bucket-owner-read",
            BucketAcl::BucketOwnerFullControl => "bucket-owner-full-control",
        }
    }
}

#[derive(Debug, Clone)]
pub struct S3Config {
    /// Service endpoint. Defaults to the AWS regional endpoint.
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub acl: BucketAcl,
}

impl S3Config {
    fn endpoint_url(&self) -> String {
        match self.endpoint {
            Some(ref endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://s3.{}.amazonaws.com", self.region),
        }
    }
}

/// S3-compatible content store using path-style requests signed with SigV4.
pub struct S3Store {
    client: Client,
    config: S3Config,
    endpoint: String,
}

impl S3Store {
    /// Connect to the service and create the bucket if it does not exist.
    pub async fn new(config: S3Config) -> Result<Self, ContentError> {
        let client = Client::builder()
            .build()
            .map_err(|e| ContentError::Backend(e.to_string()))?;
        let endpoint = config.endpoint_url();
        Url::parse(&endpoint)
            .map_err(|e| ContentError::Backend(format!("Invalid S3 endpoint {endpoint}: {e}")))?;

        let store = Self {
            client,
            config,
            endpoint,
        };
        store.ensure_bucket().await?;
        Ok(store)
    }

    fn bucket_url(&self) -> String {
        format!("{}/{}", self.endpoint, self.config.bucket)
    }

    fn object_url(&self, oid: &str) -> Result<String, ContentError> {
        check_oid(oid)?;
        Ok(format!("{}/{}", self.bucket_url(), transform_key(oid)))
    }

    async fn ensure_bucket(&self) -> Result<(), ContentError> {
        let resp = self
            .send(Method::HEAD, &self.bucket_url(), None, false)
            .await?;
        if resp.status().is_success() {
            return Ok(());
        }
        if resp.status() != StatusCode::NOT_FOUND {
            return Err(failure("S3 bucket lookup", resp).await);
        }

        let body = if self.config.region == "us-east-1" {
            None
        } else {
            Some(Bytes::from(format!(
                "<CreateBucketConfiguration xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
                 <LocationConstraint>{}</LocationConstraint>\
                 </CreateBucketConfiguration>",
                self.config.region
            )))
        };
        let resp = self.send(Method::PUT, &self.bucket_url(), body, true).await?;
        if !resp.status().is_success() {
            return Err(failure("S3 bucket creation", resp).await);
        }
        tracing::info!(
            bucket = %self.config.bucket,
            acl = self.config.acl.as_str(),
            "Created S3 bucket"
        );
        Ok(())
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<Bytes>,
        with_acl: bool,
    ) -> Result<Response, ContentError> {
        let parsed = Url::parse(url).map_err(|e| ContentError::Backend(e.to_string()))?;
        let payload_hash = match body {
            Some(ref data) => sha256_hex(data),
            None => EMPTY_PAYLOAD_SHA256.to_string(),
        };

        let mut headers = vec![("x-amz-content-sha256".to_string(), payload_hash.clone())];
        if with_acl {
            headers.push(("x-amz-acl".to_string(), self.config.acl.as_str().to_string()));
        }

        let signer = Signer {
            access_key_id: &self.config.access_key_id,
            secret_access_key: &self.config.secret_access_key,
            region: &self.config.region,
        };
        let signed = signer.sign(&method, &parsed, headers, &payload_hash, Utc::now());

        let mut request = self.client.request(method, parsed);
        for (name, value) in signed {
            request = request.header(name, value);
        }
        if let Some(data) = body {
            request = request.header(header::CONTENT_TYPE, CONTENT_TYPE).body(data);
        }

        request
            .send()
            .await
            .map_err(|e| ContentError::Backend(e.to_string()))
    }

    async fn stored_size(&self, oid: &str) -> Result<Option<i64>, ContentError> {
        let resp = self
            .send(Method::HEAD, &self.object_url(oid)?, None, false)
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(failure("S3 head", resp).await);
        }
        let size = resp
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| ContentError::Backend("S3 head returned no content length".into()))?;
        Ok(Some(size))
    }

    async fn delete(&self, oid: &str) -> Result<(), ContentError> {
        let resp = self
            .send(Method::DELETE, &self.object_url(oid)?, None, false)
            .await?;
        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            return Err(failure("S3 delete", resp).await);
        }
        Ok(())
    }
}

async fn failure(what: &str, resp: Response) -> ContentError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    ContentError::Backend(format!("{what} failed ({status}): {body}"))
}

#[async_trait]
impl ContentStore for S3Store {
    async fn get(&self, object: &Object) -> Result<ByteStream, ContentError> {
        let resp = self
            .send(Method::GET, &self.object_url(&object.oid)?, None, false)
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ContentError::NotFound(object.oid.clone()));
        }
        if !resp.status().is_success() {
            return Err(failure("S3 download", resp).await);
        }

        let stream = resp.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::pin(StreamReader::new(stream)))
    }

    async fn put(&self, object: &Object, mut body: ByteStream) -> Result<(), ContentError> {
        let url = self.object_url(&object.oid)?;

        // The digest has to be known before anything is sent, so the body is
        // spooled in memory and uploaded in one atomic PUT.
        let mut buf = Vec::new();
        copy_hashed(&mut body, &mut buf).await?.check(object)?;

        let resp = self
            .send(Method::PUT, &url, Some(Bytes::from(buf)), true)
            .await?;
        if !resp.status().is_success() {
            return Err(failure("S3 upload", resp).await);
        }

        match self.stored_size(&object.oid).await? {
            Some(size) if size == object.size => Ok(()),
            Some(size) => {
                tracing::warn!(oid = %object.oid, size, "Stored size differs, removing object");
                self.delete(&object.oid).await?;
                Err(ContentError::SizeMismatch {
                    expected: object.size,
                    actual: size,
                })
            }
            None => Err(ContentError::Backend(format!(
                "S3 object {} missing after upload",
                object.oid
            ))),
        }
    }

    async fn exists(&self, object: &Object) -> bool {
        if check_oid(&object.oid).is_err() {
            return false;
        }
        match self.stored_size(&object.oid).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                tracing::warn!(oid = %object.oid, error = %e, "Failed to check S3 object");
                false
            }
        }
    }

    async fn verify(&self, object: &Object) -> Result<(), ContentError> {
        let mut stream = self.get(object).await?;
        hash_stream(&mut stream).await?.check(object)
    }
}

// ============================================================================
// AWS Signature Version 4
// ============================================================================

struct Signer<'a> {
    access_key_id: &'a str,
    secret_access_key: &'a str,
    region: &'a str,
}

impl Signer<'_> {
    /// Sign a request, returning the headers to send: the given ones plus
    /// `x-amz-date` and `authorization`. `host` is signed but left to the
    /// HTTP client to send.
    fn sign(
        &self,
        method: &Method,
        url: &Url,
        mut headers: Vec<(String, String)>,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> Vec<(String, String)> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        headers.push(("x-amz-date".to_string(), amz_date.clone()));

        let mut signed: Vec<(String, String)> = headers
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.trim().to_string()))
            .collect();
        signed.push(("host".to_string(), host_header(url)));
        signed.sort();

        let canonical_headers: String = signed.iter().map(|(k, v)| format!("{k}:{v}\n")).collect();
        let signed_headers = signed
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri(url),
            canonical_query(url),
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let scope = format!("{date}/{}/{SERVICE}/aws4_request", self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            sha256_hex(canonical_request.as_bytes())
        );

        let key = signing_key(self.secret_access_key, &date, self.region, SERVICE);
        let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes()));

        headers.push((
            "authorization".to_string(),
            format!(
                "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
                self.access_key_id
            ),
        ));
        headers
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::sign(&key, data).as_ref().to_vec()
}

fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn canonical_uri(url: &Url) -> String {
    let path = url.path();
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}

fn canonical_query(url: &Url) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (uri_encode(&k), uri_encode(&v)))
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn uri_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
