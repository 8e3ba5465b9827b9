use thiserror::Error;

use crate::content::{BucketAcl, S3Config};
use crate::meta::{ColumnConfig, SqlConfig, SqlDialect};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Skip authorization on object operations.
    pub public: bool,
    /// Delegate authentication to an external directory.
    pub ldap_enabled: bool,
    pub meta: MetaConfig,
    pub content: ContentConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaBackend {
    Embedded,
    Column,
    Sql,
}

#[derive(Debug, Clone)]
pub struct MetaConfig {
    pub backend: MetaBackend,
    /// Directory for the embedded database
    pub data_dir: String,
    pub column: ColumnConfig,
    pub sql: SqlConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentBackend {
    Filesystem,
    S3,
}

#[derive(Debug, Clone)]
pub struct ContentConfig {
    pub backend: ContentBackend,
    /// Root directory for the filesystem backend
    pub path: String,
    pub s3: S3Settings,
}

/// Raw S3 settings. Bucket and keys are only required when the S3 backend is
/// selected.
#[derive(Debug, Clone)]
pub struct S3Settings {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub acl: BucketAcl,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            backend: MetaBackend::Embedded,
            data_dir: "./data".to_string(),
            column: ColumnConfig::default(),
            sql: SqlConfig::default(),
        }
    }
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: "us-east-1".to_string(),
            bucket: None,
            access_key_id: None,
            secret_access_key: None,
            acl: BucketAcl::Private,
        }
    }
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            backend: ContentBackend::Filesystem,
            path: "./lfs-content".to_string(),
            s3: S3Settings::default(),
        }
    }
}

impl S3Settings {
    /// Build the store configuration, failing if a required value is unset.
    pub fn to_config(&self) -> Result<S3Config, ConfigError> {
        let required = |value: &Option<String>, name: &str| {
            value
                .clone()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    ConfigError::ValidationError(format!(
                        "{name} is required when LFS_CONTENT_BACKEND=s3"
                    ))
                })
        };
        Ok(S3Config {
            endpoint: self.endpoint.clone(),
            region: self.region.clone(),
            bucket: required(&self.bucket, "S3_BUCKET")?,
            access_key_id: required(&self.access_key_id, "S3_ACCESS_KEY_ID")?,
            secret_access_key: required(&self.secret_access_key, "S3_SECRET_ACCESS_KEY")?,
            acl: self.acl,
        })
    }
}

fn flag(value: Option<String>) -> bool {
    value
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let meta_backend = match var("LFS_META_BACKEND", "redb").to_lowercase().as_str() {
            "redb" => MetaBackend::Embedded,
            "cassandra" | "scylla" => MetaBackend::Column,
            "sql" | "sqlite" | "mysql" => MetaBackend::Sql,
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "unknown LFS_META_BACKEND {other:?}"
                )))
            }
        };

        let content_backend = match var("LFS_CONTENT_BACKEND", "filesystem")
            .to_lowercase()
            .as_str()
        {
            "filesystem" | "local" => ContentBackend::Filesystem,
            "s3" => ContentBackend::S3,
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "unknown LFS_CONTENT_BACKEND {other:?}"
                )))
            }
        };

        let hosts: Vec<String> = var("CASSANDRA_HOSTS", "127.0.0.1:9042")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let max_connections = lookup("SQL_MAX_CONNECTIONS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        let acl = lookup("S3_ACL")
            .map(|v| BucketAcl::parse(&v))
            .unwrap_or(BucketAcl::Private);

        let config = Config {
            public: flag(lookup("LFS_PUBLIC")),
            ldap_enabled: flag(lookup("LDAP_ENABLED")),
            meta: MetaConfig {
                backend: meta_backend,
                data_dir: var("LFS_DATA_DIR", "./data"),
                column: ColumnConfig {
                    hosts,
                    keyspace: var("CASSANDRA_KEYSPACE", "lfs"),
                    environment: var("LFS_ENV", "production"),
                    username: lookup("CASSANDRA_USERNAME"),
                    password: lookup("CASSANDRA_PASSWORD"),
                    ..Default::default()
                },
                sql: SqlConfig {
                    url: var("SQL_URL", "sqlite://lfs.db"),
                    max_connections,
                },
            },
            content: ContentConfig {
                backend: content_backend,
                path: var("LFS_CONTENT_PATH", "./lfs-content"),
                s3: S3Settings {
                    endpoint: lookup("S3_ENDPOINT").filter(|v| !v.is_empty()),
                    region: var("S3_REGION", "us-east-1"),
                    bucket: lookup("S3_BUCKET"),
                    access_key_id: lookup("S3_ACCESS_KEY_ID"),
                    secret_access_key: lookup("S3_SECRET_ACCESS_KEY"),
                    acl,
                },
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self.meta.backend {
            MetaBackend::Column => {
                if self.meta.column.hosts.is_empty() {
                    return Err(ConfigError::ValidationError(
                        "CASSANDRA_HOSTS must name at least one host".to_string(),
                    ));
                }
                self.meta
                    .column
                    .keyspace_name()
                    .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
            }
            MetaBackend::Sql if self.meta.sql.url.is_empty() => {
                return Err(ConfigError::ValidationError(
                    "SQL_URL is required when LFS_META_BACKEND=sql".to_string(),
                ));
            }
            MetaBackend::Sql => {
                SqlDialect::from_url(&self.meta.sql.url)
                    .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
            }
            _ => {}
        }

        if self.content.backend == ContentBackend::S3 {
            self.content.s3.to_config()?;
        }

        if self.public && self.ldap_enabled {
            tracing::warn!("LFS_PUBLIC is set; LDAP_ENABLED has no effect on object access");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert!(!config.public);
        assert!(!config.ldap_enabled);
        assert_eq!(config.meta.backend, MetaBackend::Embedded);
        assert_eq!(config.meta.data_dir, "./data");
        assert_eq!(config.content.backend, ContentBackend::Filesystem);
        assert_eq!(config.content.path, "./lfs-content");
        assert_eq!(config.meta.column.hosts, vec!["127.0.0.1:9042".to_string()]);
        assert_eq!(config.meta.sql.max_connections, 5);
    }

    #[test]
    fn test_s3_requires_bucket_and_keys() {
        let err = load(&[("LFS_CONTENT_BACKEND", "s3"), ("S3_ACCESS_KEY_ID", "k")]).unwrap_err();
        assert!(err.to_string().contains("S3_BUCKET"));

        let config = load(&[
            ("LFS_CONTENT_BACKEND", "s3"),
            ("S3_BUCKET", "lfs"),
            ("S3_ACCESS_KEY_ID", "k"),
            ("S3_SECRET_ACCESS_KEY", "s"),
            ("S3_ACL", "public-read"),
        ])
        .unwrap();
        let s3 = config.content.s3.to_config().unwrap();
        assert_eq!(s3.bucket, "lfs");
        assert_eq!(s3.acl, BucketAcl::PublicRead);
    }

    #[test]
    fn test_sql_url_scheme_is_checked() {
        let config = load(&[
            ("LFS_META_BACKEND", "mysql"),
            ("SQL_URL", "mysql://lfs:pw@db:3306/lfs"),
        ])
        .unwrap();
        assert_eq!(config.meta.backend, MetaBackend::Sql);

        let err = load(&[
            ("LFS_META_BACKEND", "sql"),
            ("SQL_URL", "postgres://db/lfs"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("unsupported sql url"));
    }

    #[test]
    fn test_column_hosts_are_split_and_required() {
        let config = load(&[
            ("LFS_META_BACKEND", "cassandra"),
            ("CASSANDRA_HOSTS", "a:9042, b:9042,"),
            ("LFS_ENV", "test"),
        ])
        .unwrap();
        assert_eq!(config.meta.column.hosts.len(), 2);
        assert_eq!(config.meta.column.keyspace_name().unwrap(), "lfs_test");

        assert!(load(&[("LFS_META_BACKEND", "cassandra"), ("CASSANDRA_HOSTS", " , ")]).is_err());
    }

    #[test]
    fn test_unknown_backend_rejected() {
        assert!(load(&[("LFS_META_BACKEND", "mongo")]).is_err());
        assert!(load(&[("LFS_CONTENT_BACKEND", "ftp")]).is_err());
    }

    #[test]
    fn test_flags() {
        let config = load(&[("LFS_PUBLIC", "true"), ("LDAP_ENABLED", "1")]).unwrap();
        assert!(config.public);
        assert!(config.ldap_enabled);
    }
}
