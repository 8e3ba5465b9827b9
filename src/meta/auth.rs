//! Request authorization for metadata operations.

use std::num::NonZeroU32;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

use super::MetaError;

const HASH_SCHEME: &str = "pbkdf2-sha256";
const HASH_LEN: usize = 32;
const SALT_LEN: usize = 16;
pub const DEFAULT_HASH_ITERATIONS: u32 = 100_000;

/// Why a credential was refused. All variants surface as [`MetaError::Auth`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthFailure {
    #[error("no credentials supplied")]
    Missing,
    #[error("credentials are not valid HTTP Basic")]
    Malformed,
    #[error("credentials rejected")]
    Rejected,
    #[error("credential service unavailable")]
    Unavailable,
}

/// External authentication oracle, e.g. a directory service.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn authenticate(&self, user: &str, password: &str) -> Result<bool, MetaError>;
}

/// Lookup into a backend's own password table.
#[async_trait]
pub(crate) trait PasswordTable: Send + Sync {
    async fn password_hash(&self, user: &str) -> Result<Option<String>, MetaError>;
}

/// How a meta store decides whether a request may proceed.
#[derive(Clone, Default)]
pub enum Authenticator {
    /// Every request is allowed.
    Public,
    /// HTTP Basic credentials checked against the backend's users table.
    #[default]
    Internal,
    /// HTTP Basic credentials checked by an external credential store. User
    /// management is unsupported in this mode.
    External(Arc<dyn CredentialStore>),
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Authenticator::Public => f.write_str("Public"),
            Authenticator::Internal => f.write_str("Internal"),
            Authenticator::External(_) => f.write_str("External"),
        }
    }
}

impl Authenticator {
    pub(crate) async fn authorize<T>(&self, authorization: &str, table: &T) -> Result<(), MetaError>
    where
        T: PasswordTable + ?Sized,
    {
        self.check(authorization, table).await.map_err(|failure| {
            tracing::debug!(reason = %failure, "Request not authorized");
            MetaError::Auth(failure)
        })
    }

    async fn check<T>(&self, authorization: &str, table: &T) -> Result<(), AuthFailure>
    where
        T: PasswordTable + ?Sized,
    {
        let accepted = match self {
            Authenticator::Public => return Ok(()),
            Authenticator::Internal => {
                let (user, password) = parse_basic(authorization)?;
                let hash = match table.password_hash(&user).await {
                    Ok(Some(hash)) => hash,
                    Ok(None) => return Err(AuthFailure::Rejected),
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to read password table");
                        return Err(AuthFailure::Unavailable);
                    }
                };
                tokio::task::spawn_blocking(move || verify_password(&hash, &password))
                    .await
                    .map_err(|e| {
                        tracing::warn!(error = %e, "Password verification task failed");
                        AuthFailure::Unavailable
                    })?
            }
            Authenticator::External(store) => {
                let (user, password) = parse_basic(authorization)?;
                store.authenticate(&user, &password).await.map_err(|e| {
                    tracing::warn!(error = %e, "External credential store failed");
                    AuthFailure::Unavailable
                })?
            }
        };

        if accepted {
            Ok(())
        } else {
            Err(AuthFailure::Rejected)
        }
    }

    /// User management only applies to the internal password table.
    pub(crate) fn ensure_user_management(&self) -> Result<(), MetaError> {
        match self {
            Authenticator::External(_) => Err(MetaError::Unsupported(
                "user management is delegated to an external credential store".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Split an `Authorization: Basic ...` header into user and password.
///
/// Both the standard and the URL-safe base64 alphabets are accepted.
pub fn parse_basic(authorization: &str) -> Result<(String, String), AuthFailure> {
    let authorization = authorization.trim();
    if authorization.is_empty() {
        return Err(AuthFailure::Missing);
    }

    let (scheme, encoded) = authorization
        .split_once(' ')
        .ok_or(AuthFailure::Malformed)?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return Err(AuthFailure::Malformed);
    }

    let encoded = encoded.trim();
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE.decode(encoded))
        .map_err(|_| AuthFailure::Malformed)?;
    let decoded = String::from_utf8(decoded).map_err(|_| AuthFailure::Malformed)?;

    let (user, password) = decoded.split_once(':').ok_or(AuthFailure::Malformed)?;
    Ok((user.to_string(), password.to_string()))
}

/// Hash a password with PBKDF2-HMAC-SHA256 and a random salt.
pub fn hash_password(password: &str) -> Result<String, MetaError> {
    let iterations = NonZeroU32::new(DEFAULT_HASH_ITERATIONS)
        .ok_or_else(|| MetaError::backend("hash iterations must be non-zero"))?;
    hash_password_with(password, iterations)
}

/// [`hash_password`] on the blocking pool, keeping the key derivation off
/// the async workers.
pub(crate) async fn hash_password_blocking(password: &str) -> Result<String, MetaError> {
    let password = password.to_string();
    tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(MetaError::backend)?
}

pub fn hash_password_with(password: &str, iterations: NonZeroU32) -> Result<String, MetaError> {
    let mut salt = [0u8; SALT_LEN];
    SystemRandom::new()
        .fill(&mut salt)
        .map_err(|_| MetaError::backend("failed to generate password salt"))?;

    let mut hash = [0u8; HASH_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        &salt,
        password.as_bytes(),
        &mut hash,
    );

    let engine = base64::engine::general_purpose::STANDARD_NO_PAD;
    Ok(format!(
        "${HASH_SCHEME}${iterations}${}${}",
        engine.encode(salt),
        engine.encode(hash)
    ))
}

/// Check a password against an encoded hash. Malformed hashes never match.
pub fn verify_password(encoded: &str, password: &str) -> bool {
    let mut parts = encoded.split('$');
    let (Some(""), Some(HASH_SCHEME), Some(iterations), Some(salt), Some(hash), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return false;
    };

    let Some(iterations) = iterations.parse().ok().and_then(NonZeroU32::new) else {
        return false;
    };
    let engine = base64::engine::general_purpose::STANDARD_NO_PAD;
    let (Ok(salt), Ok(hash)) = (engine.decode(salt), engine.decode(hash)) else {
        return false;
    };

    pbkdf2::verify(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        &salt,
        password.as_bytes(),
        &hash,
    )
    .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::basic_auth;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Table(HashMap<String, String>);

    #[async_trait]
    impl PasswordTable for Table {
        async fn password_hash(&self, user: &str) -> Result<Option<String>, MetaError> {
            Ok(self.0.get(user).cloned())
        }
    }

    struct BrokenTable;

    #[async_trait]
    impl PasswordTable for BrokenTable {
        async fn password_hash(&self, _user: &str) -> Result<Option<String>, MetaError> {
            Err(MetaError::Backend("connection refused".into()))
        }
    }

    struct Directory;

    #[async_trait]
    impl CredentialStore for Directory {
        async fn authenticate(&self, user: &str, password: &str) -> Result<bool, MetaError> {
            if user == "down" {
                return Err(MetaError::Backend("ldap unreachable".into()));
            }
            Ok(user == "ldap" && password == "secret")
        }
    }

    fn fast_hash(password: &str) -> String {
        hash_password_with(password, NonZeroU32::new(1_000).unwrap()).unwrap()
    }

    fn table() -> Table {
        Table(HashMap::from([("admin".to_string(), fast_hash("admin"))]))
    }

    #[test]
    fn test_parse_basic_standard_encoding() {
        let (user, pass) = parse_basic(&basic_auth("admin", "admin")).unwrap();
        assert_eq!(user, "admin");
        assert_eq!(pass, "admin");
    }

    #[test]
    fn test_parse_basic_password_may_contain_colon() {
        let (user, pass) = parse_basic(&basic_auth("u", "p:a:ss")).unwrap();
        assert_eq!(user, "u");
        assert_eq!(pass, "p:a:ss");
    }

    #[test]
    fn test_parse_basic_url_safe_encoding() {
        // "a?>:b" encodes to "YT8+OmI=" in the standard alphabet
        let header = "Basic YT8-OmI=";
        let (user, pass) = parse_basic(header).unwrap();
        assert_eq!(user, "a?>");
        assert_eq!(pass, "b");
    }

    #[test]
    fn test_parse_basic_failures() {
        assert_eq!(parse_basic(""), Err(AuthFailure::Missing));
        assert_eq!(parse_basic("Bearer abc"), Err(AuthFailure::Malformed));
        assert_eq!(parse_basic("Basic !!!"), Err(AuthFailure::Malformed));
        // "nocolon"
        assert_eq!(parse_basic("Basic bm9jb2xvbg=="), Err(AuthFailure::Malformed));
    }

    #[test]
    fn test_password_hash_roundtrip() {
        let hash = fast_hash("hunter2");
        assert!(hash.starts_with("$pbkdf2-sha256$1000$"));
        assert!(verify_password(&hash, "hunter2"));
        assert!(!verify_password(&hash, "hunter3"));
    }

    #[test]
    fn test_password_hash_is_salted() {
        assert_ne!(fast_hash("same"), fast_hash("same"));
    }

    #[test]
    fn test_verify_password_rejects_malformed_hash() {
        assert!(!verify_password("", "x"));
        assert!(!verify_password("plaintext", "plaintext"));
        assert!(!verify_password("$pbkdf2-sha256$0$AAAA$AAAA", "x"));
        assert!(!verify_password("$bcrypt$10$AAAA$AAAA", "x"));
    }

    #[tokio::test]
    async fn test_public_allows_anything() {
        let auth = Authenticator::Public;
        assert!(auth.authorize("", &BrokenTable).await.is_ok());
    }

    #[tokio::test]
    async fn test_internal_checks_table() {
        let auth = Authenticator::Internal;
        let table = table();
        assert!(auth
            .authorize(&basic_auth("admin", "admin"), &table)
            .await
            .is_ok());

        let err = auth
            .authorize(&basic_auth("admin", "wrong"), &table)
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::Auth(AuthFailure::Rejected)));

        let err = auth
            .authorize(&basic_auth("nobody", "admin"), &table)
            .await
            .unwrap_err();
        assert!(err.is_auth());

        let err = auth.authorize("", &table).await.unwrap_err();
        assert!(matches!(err, MetaError::Auth(AuthFailure::Missing)));
    }

    #[tokio::test]
    async fn test_password_check_leaves_runtime_free() {
        let hash = hash_password_with("admin", NonZeroU32::new(50_000).unwrap()).unwrap();
        let table = Table(HashMap::from([("admin".to_string(), hash)]));

        // Single-threaded runtime: the ticker only runs while authorize yields.
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let ticks = Arc::clone(&ticks);
            tokio::spawn(async move {
                loop {
                    ticks.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
        };

        Authenticator::Internal
            .authorize(&basic_auth("admin", "admin"), &table)
            .await
            .unwrap();
        let seen = ticks.load(Ordering::SeqCst);
        ticker.abort();
        assert!(seen > 0, "runtime made no progress during the password check");
    }

    #[tokio::test]
    async fn test_hash_password_blocking_verifies() {
        let hash = hash_password_blocking("s3cret").await.unwrap();
        assert!(verify_password(&hash, "s3cret"));
        assert!(!verify_password(&hash, "other"));
    }

    #[tokio::test]
    async fn test_internal_table_failure_is_auth_error() {
        let err = Authenticator::Internal
            .authorize(&basic_auth("admin", "admin"), &BrokenTable)
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::Auth(AuthFailure::Unavailable)));
    }

    #[tokio::test]
    async fn test_external_delegates() {
        let auth = Authenticator::External(Arc::new(Directory));
        assert!(auth
            .authorize(&basic_auth("ldap", "secret"), &BrokenTable)
            .await
            .is_ok());
        assert!(auth
            .authorize(&basic_auth("ldap", "nope"), &BrokenTable)
            .await
            .unwrap_err()
            .is_auth());
        assert!(matches!(
            auth.authorize(&basic_auth("down", "x"), &BrokenTable).await,
            Err(MetaError::Auth(AuthFailure::Unavailable))
        ));
        assert!(auth.ensure_user_management().unwrap_err().is_unsupported());
        assert!(Authenticator::Internal.ensure_user_management().is_ok());
    }
}
