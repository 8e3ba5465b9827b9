use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::RwLock;

use super::{ColumnSession, Membership, OidRow, ProjectRow};
use crate::meta::{closed_error, MetaError};

#[derive(Default)]
struct Tables {
    oids: BTreeMap<String, (i64, bool)>,
    projects: BTreeMap<String, (BTreeSet<String>, BTreeSet<String>)>,
    users: BTreeMap<String, String>,
    closed: bool,
}

impl Tables {
    fn open(&self) -> Result<&Self, MetaError> {
        if self.closed {
            return Err(closed_error());
        }
        Ok(self)
    }

    fn open_mut(&mut self) -> Result<&mut Self, MetaError> {
        if self.closed {
            return Err(closed_error());
        }
        Ok(self)
    }
}

/// In-process [`ColumnSession`] with the same statement semantics as the
/// CQL session. Used for tests and single-node development.
#[derive(Default)]
pub struct MemorySession {
    tables: RwLock<Tables>,
}

impl MemorySession {
    pub fn new() -> Self {
        Self::default()
    }
}

fn pick(
    sets: &mut (BTreeSet<String>, BTreeSet<String>),
    membership: Membership,
) -> &mut BTreeSet<String> {
    match membership {
        Membership::Committed => &mut sets.0,
        Membership::Pending => &mut sets.1,
    }
}

#[async_trait]
impl ColumnSession for MemorySession {
    async fn find_oid(&self, oid: &str) -> Result<Option<OidRow>, MetaError> {
        let tables = self.tables.read().await;
        Ok(tables.open()?.oids.get(oid).map(|&(size, pending)| OidRow {
            oid: oid.to_string(),
            size,
            pending,
        }))
    }

    async fn insert_pending_oid(&self, oid: &str, size: i64) -> Result<bool, MetaError> {
        let mut tables = self.tables.write().await;
        let tables = tables.open_mut()?;
        if tables.oids.contains_key(oid) {
            return Ok(false);
        }
        tables.oids.insert(oid.to_string(), (size, true));
        Ok(true)
    }

    async fn mark_oid_committed(&self, oid: &str) -> Result<(), MetaError> {
        let mut tables = self.tables.write().await;
        if let Some(row) = tables.open_mut()?.oids.get_mut(oid) {
            row.1 = false;
        }
        Ok(())
    }

    async fn all_oids(&self) -> Result<Vec<OidRow>, MetaError> {
        let tables = self.tables.read().await;
        Ok(tables
            .open()?
            .oids
            .iter()
            .map(|(oid, &(size, pending))| OidRow {
                oid: oid.clone(),
                size,
                pending,
            })
            .collect())
    }

    async fn ensure_project(&self, name: &str) -> Result<(), MetaError> {
        let mut tables = self.tables.write().await;
        tables
            .open_mut()?
            .projects
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn add_project_oid(
        &self,
        name: &str,
        oid: &str,
        membership: Membership,
    ) -> Result<(), MetaError> {
        let mut tables = self.tables.write().await;
        let sets = tables
            .open_mut()?
            .projects
            .entry(name.to_string())
            .or_default();
        pick(sets, membership).insert(oid.to_string());
        Ok(())
    }

    async fn remove_pending_project_oid(&self, name: &str, oid: &str) -> Result<(), MetaError> {
        let mut tables = self.tables.write().await;
        if let Some(sets) = tables.open_mut()?.projects.get_mut(name) {
            sets.1.remove(oid);
        }
        Ok(())
    }

    async fn projects_with_oid(
        &self,
        oid: &str,
        membership: Membership,
    ) -> Result<Vec<String>, MetaError> {
        let tables = self.tables.read().await;
        Ok(tables
            .open()?
            .projects
            .iter()
            .filter(|(_, (committed, pending))| match membership {
                Membership::Committed => committed.contains(oid),
                Membership::Pending => pending.contains(oid),
            })
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn all_projects(&self) -> Result<Vec<ProjectRow>, MetaError> {
        let tables = self.tables.read().await;
        Ok(tables
            .open()?
            .projects
            .iter()
            .map(|(name, (committed, pending))| ProjectRow {
                name: name.clone(),
                oids: committed.iter().cloned().collect(),
                pending: pending.iter().cloned().collect(),
            })
            .collect())
    }

    async fn find_user(&self, name: &str) -> Result<Option<String>, MetaError> {
        let tables = self.tables.read().await;
        Ok(tables.open()?.users.get(name).cloned())
    }

    async fn insert_user_if_absent(&self, name: &str, hash: &str) -> Result<bool, MetaError> {
        let mut tables = self.tables.write().await;
        let tables = tables.open_mut()?;
        if tables.users.contains_key(name) {
            return Ok(false);
        }
        tables.users.insert(name.to_string(), hash.to_string());
        Ok(true)
    }

    async fn delete_user(&self, name: &str) -> Result<(), MetaError> {
        let mut tables = self.tables.write().await;
        tables.open_mut()?.users.remove(name);
        Ok(())
    }

    async fn all_users(&self) -> Result<Vec<String>, MetaError> {
        let tables = self.tables.read().await;
        Ok(tables.open()?.users.keys().cloned().collect())
    }

    async fn close(&self) {
        self.tables.write().await.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_conditional_insert_keeps_first_row() {
        let session = MemorySession::new();
        assert!(session.insert_pending_oid("a", 1).await.unwrap());
        session.mark_oid_committed("a").await.unwrap();
        assert!(!session.insert_pending_oid("a", 2).await.unwrap());

        let row = session.find_oid("a").await.unwrap().unwrap();
        assert_eq!(row.size, 1);
        assert!(!row.pending);
    }

    #[tokio::test]
    async fn test_membership_sets_are_separate() {
        let session = MemorySession::new();
        session
            .add_project_oid("p", "a", Membership::Pending)
            .await
            .unwrap();
        assert_eq!(
            session.projects_with_oid("a", Membership::Pending).await.unwrap(),
            vec!["p".to_string()]
        );
        assert!(session
            .projects_with_oid("a", Membership::Committed)
            .await
            .unwrap()
            .is_empty());

        session.remove_pending_project_oid("p", "a").await.unwrap();
        let rows = session.all_projects().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].pending.is_empty());
    }

    #[tokio::test]
    async fn test_closed_session_rejects_calls() {
        let session = MemorySession::new();
        session.close().await;
        session.close().await;
        assert!(session.all_users().await.is_err());
    }
}
