use async_trait::async_trait;
use futures::TryStreamExt;
use scylla::frame::response::result::CqlValue;
use scylla::statement::Consistency;
use scylla::{ExecutionProfile, QueryResult, Session, SessionBuilder};
use std::sync::{Arc, RwLock};

use super::{ColumnSession, Membership, OidRow, ProjectRow};
use crate::meta::{closed_error, MetaError};

#[derive(Debug, Clone)]
pub struct ColumnConfig {
    /// Contact points, `host:port`.
    pub hosts: Vec<String>,
    pub keyspace: String,
    /// Appended to the keyspace name, e.g. `lfs_production`.
    pub environment: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub replication_factor: u32,
}

impl Default for ColumnConfig {
    fn default() -> Self {
        Self {
            hosts: vec!["127.0.0.1:9042".to_string()],
            keyspace: "lfs".to_string(),
            environment: "production".to_string(),
            username: None,
            password: None,
            replication_factor: 1,
        }
    }
}

impl ColumnConfig {
    pub fn keyspace_name(&self) -> Result<String, MetaError> {
        let name = format!("{}_{}", self.keyspace, self.environment);
        let valid = !name.is_empty()
            && name.len() <= 48
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(MetaError::InvalidRequest(format!(
                "invalid keyspace name {name:?}"
            )));
        }
        Ok(name)
    }
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS projects (name text PRIMARY KEY, oids set<text>, pending set<text>)",
    "CREATE INDEX IF NOT EXISTS ON projects (oids)",
    "CREATE INDEX IF NOT EXISTS ON projects (pending)",
    "CREATE TABLE IF NOT EXISTS oids (oid text PRIMARY KEY, size bigint, pending boolean)",
    "CREATE TABLE IF NOT EXISTS users (username text PRIMARY KEY, password text)",
];

// Rows in `oids` and `users` are created by lightweight transactions, so every
// later write to them goes through Paxos as well. Mixing in plain writes would
// let a skewed timestamp shadow them.
const INSERT_PENDING_OID: &str =
    "INSERT INTO oids (oid, size, pending) VALUES (?, ?, true) IF NOT EXISTS";
const MARK_OID_COMMITTED: &str = "UPDATE oids SET pending = false WHERE oid = ? IF EXISTS";
const INSERT_USER: &str = "INSERT INTO users (username, password) VALUES (?, ?) IF NOT EXISTS";
const DELETE_USER: &str = "DELETE FROM users WHERE username = ? IF EXISTS";

/// CQL session against Cassandra or ScyllaDB, at `QUORUM` consistency.
pub struct ScyllaSession {
    session: RwLock<Option<Arc<Session>>>,
}

impl ScyllaSession {
    /// Connect, then create the keyspace and tables if needed.
    pub async fn connect(config: &ColumnConfig) -> Result<Self, MetaError> {
        let keyspace = config.keyspace_name()?;
        tracing::info!(hosts = ?config.hosts, keyspace = %keyspace, "Connecting to column store");

        let profile = ExecutionProfile::builder()
            .consistency(Consistency::Quorum)
            .build()
            .into_handle();
        let mut builder = SessionBuilder::new()
            .known_nodes(&config.hosts)
            .default_execution_profile_handle(profile);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            builder = builder.user(user, pass);
        }
        let session = builder.build().await.map_err(MetaError::backend)?;

        session
            .query(
                format!(
                    "CREATE KEYSPACE IF NOT EXISTS {keyspace} WITH replication = \
                     {{'class': 'SimpleStrategy', 'replication_factor': {}}}",
                    config.replication_factor
                ),
                (),
            )
            .await
            .map_err(MetaError::backend)?;
        session
            .use_keyspace(&keyspace, false)
            .await
            .map_err(MetaError::backend)?;
        for statement in SCHEMA {
            session
                .query(*statement, ())
                .await
                .map_err(MetaError::backend)?;
        }

        Ok(Self {
            session: RwLock::new(Some(Arc::new(session))),
        })
    }

    fn session(&self) -> Result<Arc<Session>, MetaError> {
        self.session
            .read()
            .map_err(|_| MetaError::backend("session lock poisoned"))?
            .clone()
            .ok_or_else(closed_error)
    }
}

fn set_column(membership: Membership) -> &'static str {
    match membership {
        Membership::Pending => "pending",
        Membership::Committed => "oids",
    }
}

/// The `[applied]` column of a lightweight transaction result.
fn applied(result: QueryResult) -> Result<bool, MetaError> {
    let row = result.first_row().map_err(MetaError::backend)?;
    Ok(row
        .columns
        .first()
        .and_then(|c| c.as_ref())
        .and_then(CqlValue::as_boolean)
        .unwrap_or(false))
}

#[async_trait]
impl ColumnSession for ScyllaSession {
    async fn find_oid(&self, oid: &str) -> Result<Option<OidRow>, MetaError> {
        let row = self
            .session()?
            .query("SELECT oid, size, pending FROM oids WHERE oid = ?", (oid,))
            .await
            .map_err(MetaError::backend)?
            .maybe_first_row_typed::<(String, i64, Option<bool>)>()
            .map_err(MetaError::backend)?;
        Ok(row.map(|(oid, size, pending)| OidRow {
            oid,
            size,
            pending: pending.unwrap_or(false),
        }))
    }

    async fn insert_pending_oid(&self, oid: &str, size: i64) -> Result<bool, MetaError> {
        let result = self
            .session()?
            .query(INSERT_PENDING_OID, (oid, size))
            .await
            .map_err(MetaError::backend)?;
        applied(result)
    }

    async fn mark_oid_committed(&self, oid: &str) -> Result<(), MetaError> {
        let result = self
            .session()?
            .query(MARK_OID_COMMITTED, (oid,))
            .await
            .map_err(MetaError::backend)?;
        if !applied(result)? {
            tracing::debug!(oid, "Commit found no oid row");
        }
        Ok(())
    }

    async fn all_oids(&self) -> Result<Vec<OidRow>, MetaError> {
        let rows: Vec<(String, i64, Option<bool>)> = self
            .session()?
            .query_iter("SELECT oid, size, pending FROM oids", ())
            .await
            .map_err(MetaError::backend)?
            .into_typed::<(String, i64, Option<bool>)>()
            .map_err(MetaError::backend)
            .try_collect()
            .await?;
        Ok(rows
            .into_iter()
            .map(|(oid, size, pending)| OidRow {
                oid,
                size,
                pending: pending.unwrap_or(false),
            })
            .collect())
    }

    async fn ensure_project(&self, name: &str) -> Result<(), MetaError> {
        // Writing only the key leaves existing oid sets untouched.
        self.session()?
            .query("INSERT INTO projects (name) VALUES (?)", (name,))
            .await
            .map_err(MetaError::backend)?;
        Ok(())
    }

    async fn add_project_oid(
        &self,
        name: &str,
        oid: &str,
        membership: Membership,
    ) -> Result<(), MetaError> {
        let column = set_column(membership);
        self.session()?
            .query(
                format!("UPDATE projects SET {column} = {column} + ? WHERE name = ?"),
                (vec![oid.to_string()], name),
            )
            .await
            .map_err(MetaError::backend)?;
        Ok(())
    }

    async fn remove_pending_project_oid(&self, name: &str, oid: &str) -> Result<(), MetaError> {
        self.session()?
            .query(
                "UPDATE projects SET pending = pending - ? WHERE name = ?",
                (vec![oid.to_string()], name),
            )
            .await
            .map_err(MetaError::backend)?;
        Ok(())
    }

    async fn projects_with_oid(
        &self,
        oid: &str,
        membership: Membership,
    ) -> Result<Vec<String>, MetaError> {
        let column = set_column(membership);
        let names = self
            .session()?
            .query(
                format!("SELECT name FROM projects WHERE {column} CONTAINS ?"),
                (oid,),
            )
            .await
            .map_err(MetaError::backend)?
            .rows_typed::<(String,)>()
            .map_err(MetaError::backend)?
            .map(|row| row.map(|(name,)| name))
            .collect::<Result<Vec<_>, _>>()
            .map_err(MetaError::backend)?;
        Ok(names)
    }

    async fn all_projects(&self) -> Result<Vec<ProjectRow>, MetaError> {
        let rows: Vec<(String, Option<Vec<String>>, Option<Vec<String>>)> = self
            .session()?
            .query_iter("SELECT name, oids, pending FROM projects", ())
            .await
            .map_err(MetaError::backend)?
            .into_typed::<(String, Option<Vec<String>>, Option<Vec<String>>)>()
            .map_err(MetaError::backend)
            .try_collect()
            .await?;
        Ok(rows
            .into_iter()
            .map(|(name, oids, pending)| ProjectRow {
                name,
                oids: oids.unwrap_or_default(),
                pending: pending.unwrap_or_default(),
            })
            .collect())
    }

    async fn find_user(&self, name: &str) -> Result<Option<String>, MetaError> {
        let row = self
            .session()?
            .query("SELECT password FROM users WHERE username = ?", (name,))
            .await
            .map_err(MetaError::backend)?
            .maybe_first_row_typed::<(Option<String>,)>()
            .map_err(MetaError::backend)?;
        Ok(row.and_then(|(password,)| password))
    }

    async fn insert_user_if_absent(&self, name: &str, hash: &str) -> Result<bool, MetaError> {
        let result = self
            .session()?
            .query(INSERT_USER, (name, hash))
            .await
            .map_err(MetaError::backend)?;
        applied(result)
    }

    async fn delete_user(&self, name: &str) -> Result<(), MetaError> {
        let result = self
            .session()?
            .query(DELETE_USER, (name,))
            .await
            .map_err(MetaError::backend)?;
        applied(result)?;
        Ok(())
    }

    async fn all_users(&self) -> Result<Vec<String>, MetaError> {
        let rows: Vec<(String,)> = self
            .session()?
            .query_iter("SELECT username FROM users", ())
            .await
            .map_err(MetaError::backend)?
            .into_typed::<(String,)>()
            .map_err(MetaError::backend)
            .try_collect()
            .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn close(&self) {
        if let Ok(mut guard) = self.session.write() {
            if guard.take().is_some() {
                tracing::debug!("Closed column store session");
            }
        }
    }
}
