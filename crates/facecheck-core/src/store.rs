//! Persistence of people, face records, source images and attendance.

use crate::encoder::MAX_ENROLL_IMAGES;
use crate::notifier::{AttendanceEvent, AttendanceNotifier, CaptureMethod, NotifierError};
use crate::types::{FaceRecord, PersonId, RecordId, StoredEncoding};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cannot create database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("face record {0} not found")]
    RecordNotFound(RecordId),
    #[error("person {0} not found")]
    PersonNotFound(PersonId),
    #[error("a face record takes 1 to {MAX_ENROLL_IMAGES} images, got {0}")]
    ImageCount(usize),
    #[error("malformed row: {0}")]
    Malformed(String),
}

/// Read/write access to enrolled face records.
///
/// Calls block on I/O; async callers go through `spawn_blocking`.
pub trait EncodingStore: Send + Sync {
    fn get_record(&self, id: RecordId) -> Result<Option<FaceRecord>, StoreError>;
    /// Every record whose encoding column is non-null.
    fn list_records_with_encoding(&self) -> Result<Vec<StoredEncoding>, StoreError>;
    fn list_records_missing_encoding(&self) -> Result<Vec<RecordId>, StoreError>;
    fn save_encoding(&self, id: RecordId, blob: &[u8]) -> Result<(), StoreError>;
    /// Display name of a person; `None` when unknown or blank.
    fn get_person_label(&self, person_id: PersonId) -> Result<Option<String>, StoreError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct Person {
    pub id: PersonId,
    pub name: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordSummary {
    pub id: RecordId,
    pub person_id: PersonId,
    pub image_count: usize,
    pub has_encoding: bool,
    pub updated_at: String,
}

/// SQLite-backed store. One connection, serialized behind a mutex.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

const SCHEMA_SQL: &str = "
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS people (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS face_records (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    person_id   INTEGER NOT NULL REFERENCES people(id) ON DELETE CASCADE,
    encoding    BLOB,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS face_images (
    record_id   INTEGER NOT NULL REFERENCES face_records(id) ON DELETE CASCADE,
    slot        INTEGER NOT NULL,
    data        BLOB NOT NULL,
    PRIMARY KEY (record_id, slot)
);

CREATE TABLE IF NOT EXISTS attendance (
    id              TEXT PRIMARY KEY,
    person_id       INTEGER NOT NULL REFERENCES people(id) ON DELETE CASCADE,
    service_id      INTEGER,
    capture_method  TEXT NOT NULL CHECK (capture_method IN ('FACE', 'FORM')),
    checked_in_at   TEXT NOT NULL,
    record_id       INTEGER REFERENCES face_records(id) ON DELETE SET NULL,
    confidence      REAL
);

CREATE INDEX IF NOT EXISTS idx_face_records_person ON face_records(person_id);
CREATE INDEX IF NOT EXISTS idx_attendance_person ON attendance(person_id, checked_in_at);
";

fn now() -> String {
    Utc::now().to_rfc3339()
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        tracing::debug!(path = %path.display(), "opened face store");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_person(&self, name: &str) -> Result<PersonId, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO people (name, created_at) VALUES (?1, ?2)",
            params![name.trim(), now()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_people(&self) -> Result<Vec<Person>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, name, created_at FROM people ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(Person {
                id: row.get(0)?,
                name: row.get(1)?,
                created_at: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Create a face record with 1–3 source images and no encoding yet.
    pub fn add_record(&self, person_id: PersonId, images: &[Vec<u8>]) -> Result<RecordId, StoreError> {
        check_image_count(images)?;
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let person_exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM people WHERE id = ?1)",
            [person_id],
            |row| row.get(0),
        )?;
        if !person_exists {
            return Err(StoreError::PersonNotFound(person_id));
        }

        let ts = now();
        tx.execute(
            "INSERT INTO face_records (person_id, encoding, created_at, updated_at)
             VALUES (?1, NULL, ?2, ?2)",
            params![person_id, ts],
        )?;
        let record_id = tx.last_insert_rowid();
        insert_images(&tx, record_id, images)?;
        tx.commit()?;

        tracing::info!(record_id, person_id, images = images.len(), "face record added");
        Ok(record_id)
    }

    /// Swap a record's source images. The stale encoding is cleared.
    pub fn replace_images(&self, record_id: RecordId, images: &[Vec<u8>]) -> Result<(), StoreError> {
        check_image_count(images)?;
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE face_records SET encoding = NULL, updated_at = ?2 WHERE id = ?1",
            params![record_id, now()],
        )?;
        if updated == 0 {
            return Err(StoreError::RecordNotFound(record_id));
        }
        tx.execute("DELETE FROM face_images WHERE record_id = ?1", [record_id])?;
        insert_images(&tx, record_id, images)?;
        tx.commit()?;
        Ok(())
    }

    pub fn list_records(&self) -> Result<Vec<RecordSummary>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT r.id, r.person_id, COUNT(i.slot), r.encoding IS NOT NULL, r.updated_at
             FROM face_records r
             LEFT JOIN face_images i ON i.record_id = r.id
             GROUP BY r.id
             ORDER BY r.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(RecordSummary {
                id: row.get(0)?,
                person_id: row.get(1)?,
                image_count: row.get::<_, i64>(2)? as usize,
                has_encoding: row.get(3)?,
                updated_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Delete a person with their records, images and attendance.
    pub fn remove_person(&self, person_id: PersonId) -> Result<bool, StoreError> {
        let removed = self
            .conn()
            .execute("DELETE FROM people WHERE id = ?1", [person_id])?;
        Ok(removed > 0)
    }

    pub fn remove_record(&self, record_id: RecordId) -> Result<bool, StoreError> {
        let removed = self
            .conn()
            .execute("DELETE FROM face_records WHERE id = ?1", [record_id])?;
        Ok(removed > 0)
    }

    /// Attendance rows, newest first, optionally for one person.
    pub fn list_attendance(&self, person_id: Option<PersonId>) -> Result<Vec<AttendanceEvent>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, person_id, service_id, capture_method, checked_in_at, record_id, confidence
             FROM attendance
             WHERE ?1 IS NULL OR person_id = ?1
             ORDER BY checked_in_at DESC",
        )?;
        let raw = stmt
            .query_map([person_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, PersonId>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<RecordId>>(5)?,
                    row.get::<_, Option<f64>>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(id, person_id, service_id, method, at, record_id, confidence)| {
                Ok(AttendanceEvent {
                    id: Uuid::parse_str(&id).map_err(|e| StoreError::Malformed(e.to_string()))?,
                    person_id,
                    service_id,
                    capture_method: match method.as_str() {
                        "FACE" => CaptureMethod::Face,
                        "FORM" => CaptureMethod::Form,
                        other => return Err(StoreError::Malformed(format!("capture method {other}"))),
                    },
                    checked_in_at: DateTime::parse_from_rfc3339(&at)
                        .map_err(|e| StoreError::Malformed(e.to_string()))?
                        .with_timezone(&Utc),
                    record_id,
                    confidence: confidence.map(|c| c as f32),
                })
            })
            .collect()
    }

    fn insert_attendance(&self, event: &AttendanceEvent) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO attendance
                (id, person_id, service_id, capture_method, checked_in_at, record_id, confidence)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.id.to_string(),
                event.person_id,
                event.service_id,
                event.capture_method.as_str(),
                event.checked_in_at.to_rfc3339(),
                event.record_id,
                event.confidence.map(f64::from),
            ],
        )?;
        Ok(())
    }
}

fn check_image_count(images: &[Vec<u8>]) -> Result<(), StoreError> {
    if images.is_empty() || images.len() > MAX_ENROLL_IMAGES {
        return Err(StoreError::ImageCount(images.len()));
    }
    Ok(())
}

fn insert_images(conn: &Connection, record_id: RecordId, images: &[Vec<u8>]) -> Result<(), StoreError> {
    let mut stmt = conn.prepare("INSERT INTO face_images (record_id, slot, data) VALUES (?1, ?2, ?3)")?;
    for (slot, data) in images.iter().enumerate() {
        stmt.execute(params![record_id, slot as i64, data])?;
    }
    Ok(())
}

impl EncodingStore for SqliteStore {
    fn get_record(&self, id: RecordId) -> Result<Option<FaceRecord>, StoreError> {
        let conn = self.conn();
        let head = conn
            .query_row(
                "SELECT person_id, encoding FROM face_records WHERE id = ?1",
                [id],
                |row| Ok((row.get::<_, PersonId>(0)?, row.get::<_, Option<Vec<u8>>>(1)?)),
            )
            .optional()?;
        let Some((person_id, encoding)) = head else {
            return Ok(None);
        };

        let mut stmt = conn.prepare("SELECT data FROM face_images WHERE record_id = ?1 ORDER BY slot")?;
        let images = stmt
            .query_map([id], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(FaceRecord {
            id,
            person_id,
            images,
            encoding,
        }))
    }

    fn list_records_with_encoding(&self) -> Result<Vec<StoredEncoding>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, person_id, encoding FROM face_records WHERE encoding IS NOT NULL ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(StoredEncoding {
                record_id: row.get(0)?,
                person_id: row.get(1)?,
                blob: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn list_records_missing_encoding(&self) -> Result<Vec<RecordId>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id FROM face_records WHERE encoding IS NULL ORDER BY id")?;
        let ids = stmt.query_map([], |row| row.get(0))?;
        Ok(ids.collect::<Result<_, _>>()?)
    }

    fn save_encoding(&self, id: RecordId, blob: &[u8]) -> Result<(), StoreError> {
        let updated = self.conn().execute(
            "UPDATE face_records SET encoding = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, blob, now()],
        )?;
        if updated == 0 {
            return Err(StoreError::RecordNotFound(id));
        }
        Ok(())
    }

    fn get_person_label(&self, person_id: PersonId) -> Result<Option<String>, StoreError> {
        let name: Option<String> = self
            .conn()
            .query_row("SELECT name FROM people WHERE id = ?1", [person_id], |row| row.get(0))
            .optional()?;
        Ok(name.filter(|n| !n.trim().is_empty()))
    }
}

impl AttendanceNotifier for SqliteStore {
    fn notify(&self, event: &AttendanceEvent) -> Result<(), NotifierError> {
        self.insert_attendance(event)
            .map_err(|e| NotifierError::Write(e.to_string()))?;
        tracing::info!(
            event_id = %event.id,
            person_id = event.person_id,
            service_id = ?event.service_id,
            "attendance recorded"
        );
        Ok(())
    }
}
