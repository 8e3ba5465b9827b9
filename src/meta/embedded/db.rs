use redb::{Database as RedbDatabase, ReadTransaction, ReadableTable, WriteTransaction};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use super::tables::*;
use crate::meta::{MetaError, Object, Project};

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Commit error: {0}")]
    Commit(Box<redb::CommitError>),
    #[error("Database error: {0}")]
    RedbDatabase(Box<redb::DatabaseError>),
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),
    #[error("Storage error: {0}")]
    Storage(Box<redb::StorageError>),
    #[error("Table error: {0}")]
    Table(Box<redb::TableError>),
    #[error("Transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
}

impl From<redb::CommitError> for DatabaseError {
    fn from(e: redb::CommitError) -> Self {
        DatabaseError::Commit(Box::new(e))
    }
}

impl From<redb::DatabaseError> for DatabaseError {
    fn from(e: redb::DatabaseError) -> Self {
        DatabaseError::RedbDatabase(Box::new(e))
    }
}

impl From<redb::StorageError> for DatabaseError {
    fn from(e: redb::StorageError) -> Self {
        DatabaseError::Storage(Box::new(e))
    }
}

impl From<redb::TableError> for DatabaseError {
    fn from(e: redb::TableError) -> Self {
        DatabaseError::Table(Box::new(e))
    }
}

impl From<redb::TransactionError> for DatabaseError {
    fn from(e: redb::TransactionError) -> Self {
        DatabaseError::Transaction(Box::new(e))
    }
}

impl From<DatabaseError> for MetaError {
    fn from(e: DatabaseError) -> Self {
        MetaError::Backend(e.to_string())
    }
}

#[derive(Clone)]
pub struct Database {
    db: Arc<RedbDatabase>,
}

impl Database {
    /// Open or create a database in the given directory
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, DatabaseError> {
        std::fs::create_dir_all(data_dir.as_ref())?;
        let db_path = data_dir.as_ref().join("lfs-meta.redb");
        let db = Arc::new(RedbDatabase::create(db_path)?);

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(USERS)?;
            let _ = write_txn.open_table(OBJECTS)?;
            let _ = write_txn.open_table(PROJECTS)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    fn begin_read(&self) -> Result<ReadTransaction, DatabaseError> {
        Ok(self.db.begin_read()?)
    }

    fn begin_write(&self) -> Result<WriteTransaction, DatabaseError> {
        Ok(self.db.begin_write()?)
    }

    // ========================================================================
    // Objects
    // ========================================================================

    pub fn get_object(&self, oid: &str) -> Result<Option<Object>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(OBJECTS)?;

        match table.get(oid)? {
            Some(data) => Ok(Some(rmp_serde::from_slice(data.value())?)),
            None => Ok(None),
        }
    }

    /// Store `object` unless a record for its oid exists, creating any missing
    /// projects it names. Returns the record now stored.
    pub fn register_object(&self, object: &Object) -> Result<Object, DatabaseError> {
        let write_txn = self.begin_write()?;
        let stored = {
            let mut objects = write_txn.open_table(OBJECTS)?;
            let existing: Option<Object> = match objects.get(object.oid.as_str())? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };

            match existing {
                Some(existing) => existing,
                None => {
                    let data = rmp_serde::to_vec_named(object)?;
                    objects.insert(object.oid.as_str(), data.as_slice())?;

                    let mut projects = write_txn.open_table(PROJECTS)?;
                    for name in &object.project_names {
                        let missing = projects.get(name.as_str())?.is_none();
                        if missing {
                            let data = rmp_serde::to_vec_named(&Project::new(name.as_str()))?;
                            projects.insert(name.as_str(), data.as_slice())?;
                        }
                    }
                    object.clone()
                }
            }
        };
        write_txn.commit()?;
        Ok(stored)
    }

    /// Flip an object to committed and record it in each of its projects.
    pub fn commit_object(&self, oid: &str) -> Result<Option<Object>, DatabaseError> {
        let write_txn = self.begin_write()?;
        let committed = {
            let mut objects = write_txn.open_table(OBJECTS)?;
            let existing: Option<Object> = match objects.get(oid)? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };

            match existing {
                Some(mut object) => {
                    object.existing = true;
                    let data = rmp_serde::to_vec_named(&object)?;
                    objects.insert(oid, data.as_slice())?;

                    let mut projects = write_txn.open_table(PROJECTS)?;
                    for name in &object.project_names {
                        let mut project: Project = match projects.get(name.as_str())? {
                            Some(data) => rmp_serde::from_slice(data.value())?,
                            None => Project::new(name.as_str()),
                        };
                        project.insert_oid(oid);
                        let data = rmp_serde::to_vec_named(&project)?;
                        projects.insert(name.as_str(), data.as_slice())?;
                    }
                    Some(object)
                }
                None => None,
            }
        };
        write_txn.commit()?;
        Ok(committed)
    }

    pub fn get_all_objects(&self) -> Result<Vec<Object>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(OBJECTS)?;

        let mut objects = Vec::new();
        for result in table.iter()? {
            let (_, value) = result?;
            objects.push(rmp_serde::from_slice(value.value())?);
        }
        Ok(objects)
    }

    // ========================================================================
    // Projects
    // ========================================================================

    /// Create an empty project unless it exists. Returns true if created.
    pub fn put_project(&self, name: &str) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;
        let created = {
            let mut table = write_txn.open_table(PROJECTS)?;
            let missing = table.get(name)?.is_none();
            if missing {
                let data = rmp_serde::to_vec_named(&Project::new(name))?;
                table.insert(name, data.as_slice())?;
            }
            missing
        };
        write_txn.commit()?;
        Ok(created)
    }

    pub fn get_all_projects(&self) -> Result<Vec<Project>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(PROJECTS)?;

        let mut projects = Vec::new();
        for result in table.iter()? {
            let (_, value) = result?;
            projects.push(rmp_serde::from_slice(value.value())?);
        }
        Ok(projects)
    }

    // ========================================================================
    // Users
    // ========================================================================

    pub fn get_password_hash(&self, user: &str) -> Result<Option<String>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(USERS)?;
        let hash = table.get(user)?.map(|v| v.value().to_string());
        Ok(hash)
    }

    /// Insert a user unless one with that name exists. Never overwrites.
    pub fn put_user_if_absent(&self, user: &str, hash: &str) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;
        let created = {
            let mut table = write_txn.open_table(USERS)?;
            let missing = table.get(user)?.is_none();
            if missing {
                table.insert(user, hash)?;
            }
            missing
        };
        write_txn.commit()?;
        Ok(created)
    }

    pub fn delete_user(&self, user: &str) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;
        let deleted = {
            let mut table = write_txn.open_table(USERS)?;
            let removed = table.remove(user)?.is_some();
            removed
        };
        write_txn.commit()?;
        Ok(deleted)
    }

    pub fn get_all_users(&self) -> Result<Vec<String>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(USERS)?;
        let names = table
            .iter()?
            .map(|r| r.map(|(k, _)| k.value().to_string()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(oid: &str, project: &str) -> Object {
        Object {
            oid: oid.to_string(),
            size: 3,
            project_names: vec![project.to_string()],
            existing: false,
        }
    }

    #[test]
    fn test_register_does_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();

        let first = db.register_object(&pending("abc", "one")).unwrap();
        let second = db.register_object(&pending("abc", "two")).unwrap();
        assert_eq!(first, second);
        assert_eq!(second.project_names, vec!["one".to_string()]);

        let names: Vec<String> = db
            .get_all_projects()
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["one".to_string()]);
    }

    #[test]
    fn test_commit_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(dir.path()).unwrap();
            db.register_object(&pending("abc", "one")).unwrap();
            db.commit_object("abc").unwrap().unwrap();
        }

        let db = Database::open(dir.path()).unwrap();
        assert!(db.get_object("abc").unwrap().unwrap().existing);
        assert_eq!(db.get_all_projects().unwrap()[0].oids, vec!["abc".to_string()]);
        assert!(db.commit_object("missing").unwrap().is_none());
    }

    #[test]
    fn test_users_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();

        assert!(db.put_user_if_absent("admin", "hash-1").unwrap());
        assert!(!db.put_user_if_absent("admin", "hash-2").unwrap());
        assert_eq!(db.get_password_hash("admin").unwrap().as_deref(), Some("hash-1"));
        assert!(db.delete_user("admin").unwrap());
        assert!(!db.delete_user("admin").unwrap());
        assert!(db.get_all_users().unwrap().is_empty());
    }
}
