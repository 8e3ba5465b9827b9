use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lfs_store::{
    audit,
    config::{Config, ContentBackend, MetaBackend},
    content::{ContentStore, LocalStore, S3Store},
    meta::{
        Authenticator, ColumnMetaStore, EmbeddedMetaStore, MetaStore, ScyllaSession,
        SqlMetaStore,
    },
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    match log_format.to_lowercase().as_str() {
        "gcp" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_stackdriver::layer())
                .init();
        }
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_span_list(false),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    info!(version = env!("CARGO_PKG_VERSION"), "lfs-store audit starting");

    let config = Config::load()?;

    if config.ldap_enabled {
        anyhow::bail!(
            "LDAP_ENABLED is set but this binary has no directory client; \
             embed the library with a CredentialStore instead"
        );
    }
    let auth = if config.public {
        Authenticator::Public
    } else {
        Authenticator::Internal
    };

    let meta: Arc<dyn MetaStore> = match config.meta.backend {
        MetaBackend::Embedded => {
            let store = EmbeddedMetaStore::open(&config.meta.data_dir, auth)?;
            info!(backend = "redb", path = %config.meta.data_dir, "Opened meta store");
            Arc::new(store)
        }
        MetaBackend::Column => {
            let session = ScyllaSession::connect(&config.meta.column).await?;
            info!(backend = "cassandra", hosts = ?config.meta.column.hosts, "Opened meta store");
            Arc::new(ColumnMetaStore::new(session, auth))
        }
        MetaBackend::Sql => {
            let store = SqlMetaStore::connect(&config.meta.sql, auth).await?;
            info!(backend = "sql", "Opened meta store");
            Arc::new(store)
        }
    };

    let content: Arc<dyn ContentStore> = match config.content.backend {
        ContentBackend::Filesystem => {
            let store = LocalStore::new(&config.content.path)?;
            info!(backend = "filesystem", path = %config.content.path, "Opened content store");
            Arc::new(store)
        }
        ContentBackend::S3 => {
            let s3 = config.content.s3.to_config()?;
            let bucket = s3.bucket.clone();
            let store = S3Store::new(s3).await?;
            info!(backend = "s3", bucket = %bucket, "Opened content store");
            Arc::new(store)
        }
    };

    let result = audit::run(meta.as_ref(), content.as_ref()).await;
    meta.close().await;
    let report = result?;

    if !report.is_healthy() {
        for oid in &report.missing {
            tracing::error!(oid = %oid, "Missing content");
        }
        for oid in &report.corrupt {
            tracing::error!(oid = %oid, "Corrupt content");
        }
        anyhow::bail!(
            "{} missing and {} corrupt objects",
            report.missing.len(),
            report.corrupt.len()
        );
    }

    info!(checked = report.checked, "Shutdown complete");
    Ok(())
}
