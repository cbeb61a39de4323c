use crate::{SqlContext, StorageError};
use osacct_core::ObjectId;
use rusqlite::{params, Connection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    OsAccount,
}

impl ObjectType {
    pub fn id(self) -> i64 {
        match self {
            Self::OsAccount => 8,
        }
    }
}

/// Hands out object ids for new case objects.
///
/// Allocation runs on the caller's connection so that a rolled back insert
/// also rolls back its id.
pub trait ObjectIdAllocator: Send + Sync {
    fn allocate(
        &self,
        conn: &Connection,
        parent_id: Option<ObjectId>,
        object_type: ObjectType,
    ) -> Result<ObjectId, StorageError>;
}

/// Allocates ids from the `tsk_objects` table.
#[derive(Debug, Default, Clone, Copy)]
pub struct TskObjectAllocator;

impl ObjectIdAllocator for TskObjectAllocator {
    fn allocate(
        &self,
        conn: &Connection,
        parent_id: Option<ObjectId>,
        object_type: ObjectType,
    ) -> Result<ObjectId, StorageError> {
        conn.execute(
            "INSERT INTO tsk_objects (par_obj_id, type) VALUES (?1, ?2)",
            params![parent_id, object_type.id()],
        )
        .context(|| format!("allocate {object_type:?} object id"))?;
        Ok(conn.last_insert_rowid())
    }
}
