//! SQLite-backed repository with on-disk attachment blobs.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use crate::config::{self, Config};
use crate::error::{RegistryError, Result};
use crate::model::record::{validate_fields, validate_number};
use crate::model::{Attachment, DedupKey, IncomingRecord, NewRecord, RecordUpdate};

use super::blob::BlobStore;
use super::{sort_for_listing, RecordFilter, Repository};

const SCHEMA: &str = "
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        number INTEGER NOT NULL UNIQUE CHECK (number > 0),
        date TEXT NOT NULL,
        applicant TEXT NOT NULL,
        summary TEXT NOT NULL,
        responsible TEXT NOT NULL,
        deadline TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS attachments (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        record_id INTEGER NOT NULL,
        filename TEXT NOT NULL,
        stored_path TEXT NOT NULL,
        size INTEGER NOT NULL,
        FOREIGN KEY (record_id) REFERENCES records(id) ON DELETE CASCADE
    );

    CREATE INDEX IF NOT EXISTS idx_records_key ON records(date, applicant);
    CREATE INDEX IF NOT EXISTS idx_attachments_record ON attachments(record_id);
";

const RECORD_COLUMNS: &str = "id, number, date, applicant, summary, responsible, deadline";

/// Records in SQLite, attachment payloads in a [`BlobStore`].
#[derive(Debug)]
pub struct SqliteRepository {
    conn: Connection,
    blobs: BlobStore,
}

impl SqliteRepository {
    /// Open or create the database at `db_path` and the blob directory.
    pub fn open(db_path: &Path, blob_dir: impl Into<PathBuf>) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| RegistryError::io(parent, e))?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(SCHEMA)?;
        let blobs = BlobStore::open(blob_dir)?;
        info!(db = %db_path.display(), "Opened registry database");
        Ok(Self { conn, blobs })
    }

    /// Open the database and blob directory under the configured data dir.
    pub fn open_from_config(config: &Config) -> Result<Self> {
        Self::open(&config::database_path(config), config::attachments_dir(config))
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<IncomingRecord> {
        Ok(IncomingRecord {
            id: row.get(0)?,
            number: row.get(1)?,
            date: row.get(2)?,
            applicant: row.get(3)?,
            summary: row.get(4)?,
            responsible: row.get(5)?,
            deadline: row.get(6)?,
        })
    }

    fn row_to_attachment(row: &rusqlite::Row<'_>) -> rusqlite::Result<Attachment> {
        let stored_path: String = row.get(3)?;
        let size: i64 = row.get(4)?;
        Ok(Attachment {
            id: row.get(0)?,
            record_id: row.get(1)?,
            filename: row.get(2)?,
            stored_path: PathBuf::from(stored_path),
            size: size.max(0).unsigned_abs(),
        })
    }

    /// Delete blobs that no attachment row points to any more.
    fn remove_unreferenced(&self, paths: &[PathBuf]) -> Result<()> {
        for path in paths {
            let refs: i64 = self.conn.query_row(
                "SELECT COUNT(*) FROM attachments WHERE stored_path = ?1",
                params![path.to_string_lossy()],
                |row| row.get(0),
            )?;
            if refs == 0 {
                self.blobs.remove(path);
            }
        }
        Ok(())
    }
}

fn next_number_in(conn: &Connection) -> Result<i64> {
    let max: Option<i64> = conn.query_row("SELECT MAX(number) FROM records", [], |row| row.get(0))?;
    Ok(max.unwrap_or(0) + 1)
}

/// Reject a number that is non-positive or held by a record other than `except`.
fn check_number_free(conn: &Connection, number: i64, except: Option<i64>) -> Result<()> {
    validate_number(number)?;
    let holder: Option<i64> = conn
        .query_row(
            "SELECT id FROM records WHERE number = ?1",
            params![number],
            |row| row.get(0),
        )
        .optional()?;
    match holder {
        Some(id) if Some(id) != except => Err(RegistryError::Validation(format!(
            "number {number} is already used"
        ))),
        _ => Ok(()),
    }
}

/// Map a constraint violation raised by SQLite itself to `Validation`.
fn constraint_to_validation(e: rusqlite::Error) -> RegistryError {
    match e {
        rusqlite::Error::SqliteFailure(ref err, ref msg)
            if err.code == ErrorCode::ConstraintViolation =>
        {
            RegistryError::Validation(msg.clone().unwrap_or_else(|| e.to_string()))
        }
        other => other.into(),
    }
}

impl Repository for SqliteRepository {
    fn find_by_key(&self, key: DedupKey<'_>) -> Result<Option<IncomingRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM records
             WHERE summary = ?1 AND date = ?2 AND applicant = ?3
             ORDER BY number LIMIT 1"
        );
        let found = self
            .conn
            .query_row(
                &sql,
                params![key.summary, key.date, key.applicant],
                Self::row_to_record,
            )
            .optional()?;
        Ok(found)
    }

    fn next_number(&self) -> Result<i64> {
        next_number_in(&self.conn)
    }

    fn create(&mut self, record: NewRecord) -> Result<IncomingRecord> {
        record.validate()?;

        // IMMEDIATE takes the write lock before reading MAX(number)
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let number = match record.number {
            Some(n) => {
                check_number_free(&tx, n, None)?;
                n
            }
            None => next_number_in(&tx)?,
        };

        tx.execute(
            "INSERT INTO records (number, date, applicant, summary, responsible, deadline)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                number,
                record.date,
                record.applicant,
                record.summary,
                record.responsible,
                record.deadline,
            ],
        )
        .map_err(constraint_to_validation)?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        debug!(id, number, "Created record");
        Ok(IncomingRecord {
            id,
            number,
            date: record.date,
            applicant: record.applicant,
            summary: record.summary,
            responsible: record.responsible,
            deadline: record.deadline,
        })
    }

    fn add_attachment(
        &mut self,
        record_id: i64,
        filename: &str,
        content: &[u8],
    ) -> Result<Attachment> {
        // Fail before touching the blob store
        self.get(record_id)?;

        let stored_path = self.blobs.put(content)?;
        let size = content.len() as u64;
        let inserted = self.conn.execute(
            "INSERT INTO attachments (record_id, filename, stored_path, size)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record_id,
                filename,
                stored_path.to_string_lossy(),
                i64::try_from(size).unwrap_or(i64::MAX),
            ],
        );
        if let Err(e) = inserted {
            self.remove_unreferenced(std::slice::from_ref(&stored_path))?;
            return Err(constraint_to_validation(e));
        }

        let id = self.conn.last_insert_rowid();
        debug!(record_id, filename, size, "Stored attachment");
        Ok(Attachment {
            id,
            record_id,
            filename: filename.to_string(),
            stored_path,
            size,
        })
    }

    fn get(&self, id: i64) -> Result<IncomingRecord> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?1");
        self.conn
            .query_row(&sql, params![id], Self::row_to_record)
            .optional()?
            .ok_or_else(|| RegistryError::NotFound(format!("record id {id}")))
    }

    fn get_by_number(&self, number: i64) -> Result<IncomingRecord> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE number = ?1");
        self.conn
            .query_row(&sql, params![number], Self::row_to_record)
            .optional()?
            .ok_or_else(|| RegistryError::NotFound(format!("record No. {number}")))
    }

    fn list(&self, filter: &RecordFilter) -> Result<Vec<IncomingRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS},
                    (SELECT COUNT(*) FROM attachments a WHERE a.record_id = records.id)
             FROM records
             ORDER BY number DESC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            let count: i64 = row.get(7)?;
            Ok((Self::row_to_record(row)?, count))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (record, count) = row?;
            if filter.matches(&record, usize::try_from(count).unwrap_or(0)) {
                records.push(record);
            }
        }
        sort_for_listing(&mut records);
        Ok(records)
    }

    fn update(&mut self, id: i64, update: &RecordUpdate) -> Result<IncomingRecord> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?1");
        let mut record = tx
            .query_row(&sql, params![id], Self::row_to_record)
            .optional()?
            .ok_or_else(|| RegistryError::NotFound(format!("record id {id}")))?;

        if let Some(n) = update.number {
            check_number_free(&tx, n, Some(id))?;
        }
        update.apply(&mut record);
        validate_fields(&record.applicant, &record.summary, &record.responsible)?;

        tx.execute(
            "UPDATE records
             SET number = ?1, date = ?2, applicant = ?3, summary = ?4,
                 responsible = ?5, deadline = ?6
             WHERE id = ?7",
            params![
                record.number,
                record.date,
                record.applicant,
                record.summary,
                record.responsible,
                record.deadline,
                id,
            ],
        )
        .map_err(constraint_to_validation)?;
        tx.commit()?;

        debug!(id, number = record.number, "Updated record");
        Ok(record)
    }

    fn delete(&mut self, id: i64) -> Result<()> {
        let paths: Vec<PathBuf> = self
            .attachments(id)?
            .into_iter()
            .map(|a| a.stored_path)
            .collect();

        let deleted = self
            .conn
            .execute("DELETE FROM records WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(RegistryError::NotFound(format!("record id {id}")));
        }

        self.remove_unreferenced(&paths)?;
        debug!(id, attachments = paths.len(), "Deleted record");
        Ok(())
    }

    fn attachments(&self, record_id: i64) -> Result<Vec<Attachment>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, record_id, filename, stored_path, size
             FROM attachments WHERE record_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![record_id], Self::row_to_attachment)?;
        let attachments = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(attachments)
    }

    fn attachment_content(&self, attachment: &Attachment) -> Result<Vec<u8>> {
        self.blobs.read(&attachment.stored_path)
    }
}
