use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::entities::{Category, Project, Subtask, Task, User};
use crate::error::CoreError;
use crate::hlc::Hlc;
use crate::ids::BatchId;

/// A synchronized collection. Each one syncs independently with its own
/// cursor and pending outbound set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Users,
    Categories,
    Projects,
    Tasks,
    Subtasks,
}

impl Collection {
    /// Parent-first order.
    pub const ALL: [Collection; 5] = [
        Collection::Users,
        Collection::Categories,
        Collection::Projects,
        Collection::Tasks,
        Collection::Subtasks,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Categories => "categories",
            Self::Projects => "projects",
            Self::Tasks => "tasks",
            Self::Subtasks => "subtasks",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "users" => Ok(Self::Users),
            "categories" => Ok(Self::Categories),
            "projects" => Ok(Self::Projects),
            "tasks" => Ok(Self::Tasks),
            "subtasks" => Ok(Self::Subtasks),
            _ => Err(CoreError::InvalidData(format!("unknown collection: {s}"))),
        }
    }

    /// SQL table backing this collection.
    pub fn table(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The full state of one synchronized row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncRecord {
    User(User),
    Category(Category),
    Project(Project),
    Task(Task),
    Subtask(Subtask),
}

impl SyncRecord {
    pub fn collection(&self) -> Collection {
        match self {
            Self::User(_) => Collection::Users,
            Self::Category(_) => Collection::Categories,
            Self::Project(_) => Collection::Projects,
            Self::Task(_) => Collection::Tasks,
            Self::Subtask(_) => Collection::Subtasks,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Self::User(r) => r.id.into(),
            Self::Category(r) => r.id.into(),
            Self::Project(r) => r.id.into(),
            Self::Task(r) => r.id.into(),
            Self::Subtask(r) => r.id.into(),
        }
    }

    pub fn updated_at(&self) -> Hlc {
        match self {
            Self::User(r) => r.updated_at,
            Self::Category(r) => r.updated_at,
            Self::Project(r) => r.updated_at,
            Self::Task(r) => r.updated_at,
            Self::Subtask(r) => r.updated_at,
        }
    }

    pub fn deleted(&self) -> bool {
        match self {
            Self::User(r) => r.deleted,
            Self::Category(r) => r.deleted,
            Self::Project(r) => r.deleted,
            Self::Task(r) => r.deleted,
            Self::Subtask(r) => r.deleted,
        }
    }

    fn set_sync_meta(&mut self, updated_at: Hlc, deleted: bool) {
        let (stamp, flag) = match self {
            Self::User(r) => (&mut r.updated_at, &mut r.deleted),
            Self::Category(r) => (&mut r.updated_at, &mut r.deleted),
            Self::Project(r) => (&mut r.updated_at, &mut r.deleted),
            Self::Task(r) => (&mut r.updated_at, &mut r.deleted),
            Self::Subtask(r) => (&mut r.updated_at, &mut r.deleted),
        };
        *stamp = updated_at;
        *flag = deleted;
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

/// One row as exchanged with the remote backend. `updated_at` and `deleted`
/// are lifted out of the body so the backend can filter by cursor and apply
/// soft-deletes without decoding it. The envelope is authoritative for both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRow {
    pub collection: Collection,
    pub id: Uuid,
    pub updated_at: Hlc,
    pub deleted: bool,
    pub body: Vec<u8>,
}

impl RemoteRow {
    pub fn from_record(record: &SyncRecord) -> Result<Self, CoreError> {
        Ok(Self {
            collection: record.collection(),
            id: record.id(),
            updated_at: record.updated_at(),
            deleted: record.deleted(),
            body: record.to_msgpack()?,
        })
    }

    /// Decode the body, checking its identity against the envelope. A backend
    /// soft-delete only touches the envelope, so its `updated_at` and
    /// `deleted` replace whatever the body carries.
    pub fn decode(&self) -> Result<SyncRecord, CoreError> {
        let mut record = SyncRecord::from_msgpack(&self.body)?;
        if record.collection() != self.collection {
            return Err(CoreError::RecordMismatch(format!(
                "row {} in {} carries a {} body",
                self.id,
                self.collection,
                record.collection()
            )));
        }
        if record.id() != self.id {
            return Err(CoreError::RecordMismatch(format!(
                "row {} in {} carries body for {}",
                self.id,
                self.collection,
                record.id()
            )));
        }
        record.set_sync_meta(self.updated_at, self.deleted);
        Ok(record)
    }
}

/// A batch of pending rows pushed in one round-trip. `batch_id` is derived
/// from the collection and checksum, so rebuilding the same pending rows
/// after a lost acknowledgment yields the same id and the backend can
/// recognise the re-send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundBatch {
    pub batch_id: BatchId,
    pub collection: Collection,
    pub rows: Vec<RemoteRow>,
    pub checksum: [u8; 32],
}

impl OutboundBatch {
    pub fn new(collection: Collection, rows: Vec<RemoteRow>) -> Self {
        let checksum = Self::compute_checksum(&rows);
        let mut hasher = blake3::Hasher::new();
        hasher.update(collection.as_str().as_bytes());
        hasher.update(&checksum);
        let mut id = [0u8; 16];
        id.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
        Self {
            batch_id: BatchId::from_uuid(Uuid::new_v8(id)),
            collection,
            rows,
            checksum,
        }
    }

    fn compute_checksum(rows: &[RemoteRow]) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        for row in rows {
            hasher.update(row.id.as_bytes());
            hasher.update(&row.updated_at.to_bytes());
            hasher.update(&row.body);
        }
        *hasher.finalize().as_bytes()
    }

    pub fn verify_checksum(&self) -> bool {
        Self::compute_checksum(&self.rows) == self.checksum
    }

    /// Largest `updated_at` in the batch.
    pub fn high_water(&self) -> Option<Hlc> {
        self.rows.iter().map(|r| r.updated_at).max()
    }
}
