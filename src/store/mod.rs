//! Record persistence.
//!
//! [`Repository`] is the seam the ingestion pipeline and the CLI write
//! through. [`SqliteRepository`] is the durable implementation;
//! [`MemoryRepository`] backs tests.

pub mod blob;
pub mod memory;
pub mod sqlite;

use std::path::PathBuf;

use chrono::NaiveDate;
use tracing::{error, warn};
use unicode_normalization::UnicodeNormalization;

use crate::error::Result;
use crate::model::{
    Attachment, AttachmentPart, DedupKey, IncomingRecord, NewRecord, RecordUpdate,
};

pub use memory::MemoryRepository;
pub use sqlite::SqliteRepository;

/// Storage for records and their attachments.
pub trait Repository {
    /// Exact lookup on `(summary, date, applicant)`.
    fn find_by_key(&self, key: DedupKey<'_>) -> Result<Option<IncomingRecord>>;

    /// `max(number) + 1`, or 1 for an empty registry.
    fn next_number(&self) -> Result<i64>;

    /// Insert a record, assigning the next number when none is given.
    ///
    /// A non-positive or already used number is a `Validation` error.
    fn create(&mut self, record: NewRecord) -> Result<IncomingRecord>;

    /// Store `content` and link it to `record_id`.
    fn add_attachment(&mut self, record_id: i64, filename: &str, content: &[u8])
        -> Result<Attachment>;

    /// `NotFound` when no record has this id.
    fn get(&self, id: i64) -> Result<IncomingRecord>;

    fn get_by_number(&self, number: i64) -> Result<IncomingRecord>;

    /// Records matching `filter`, highest number first.
    fn list(&self, filter: &RecordFilter) -> Result<Vec<IncomingRecord>>;

    /// Apply a partial update. A changed number is validated like on create,
    /// ignoring the record itself.
    fn update(&mut self, id: i64, update: &RecordUpdate) -> Result<IncomingRecord>;

    /// Remove a record together with its attachments.
    fn delete(&mut self, id: i64) -> Result<()>;

    fn attachments(&self, record_id: i64) -> Result<Vec<Attachment>>;

    /// Stored bytes of one attachment.
    fn attachment_content(&self, attachment: &Attachment) -> Result<Vec<u8>>;
}

/// Filters for listing records. Unset fields match everything.
///
/// Text filters are case-insensitive substring matches after NFKC
/// normalization and trimming.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub applicant: Option<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub responsible: Option<String>,
    pub number: Option<i64>,
    pub summary: Option<String>,
    pub deadline_from: Option<NaiveDate>,
    pub deadline_to: Option<NaiveDate>,
    pub has_attachments: Option<bool>,
}

impl RecordFilter {
    /// Check one record. `attachment_count` is only consulted when
    /// `has_attachments` is set.
    pub fn matches(&self, record: &IncomingRecord, attachment_count: usize) -> bool {
        // 1. Exact and range filters (cheapest)
        if let Some(n) = self.number {
            if record.number != n {
                return false;
            }
        }
        if !in_range(record.date, self.date_from, self.date_to) {
            return false;
        }
        if !in_range(record.deadline, self.deadline_from, self.deadline_to) {
            return false;
        }

        // 2. Attachment presence
        if let Some(want) = self.has_attachments {
            if (attachment_count > 0) != want {
                return false;
            }
        }

        // 3. Text filters
        contains_normalized(&record.applicant, self.applicant.as_deref())
            && contains_normalized(&record.responsible, self.responsible.as_deref())
            && contains_normalized(&record.summary, self.summary.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn in_range(value: NaiveDate, from: Option<NaiveDate>, to: Option<NaiveDate>) -> bool {
    from.map_or(true, |f| value >= f) && to.map_or(true, |t| value <= t)
}

/// NFKC, trim, lowercase.
pub fn normalize(s: &str) -> String {
    s.nfkc().collect::<String>().trim().to_lowercase()
}

fn contains_normalized(haystack: &str, needle: Option<&str>) -> bool {
    match needle.map(normalize) {
        None => true,
        Some(n) if n.is_empty() => true,
        Some(n) => normalize(haystack).contains(&n),
    }
}

/// Sort records the way listings show them: highest number first.
pub(crate) fn sort_for_listing(records: &mut [IncomingRecord]) {
    records.sort_by(|a, b| b.number.cmp(&a.number));
}

/// Create a record together with its attachments.
///
/// If any attachment cannot be stored the record is deleted again (taking
/// the attachments stored so far with it) and the error is returned.
pub fn create_with_attachments<R: Repository + ?Sized>(
    repo: &mut R,
    record: NewRecord,
    parts: &[AttachmentPart],
) -> Result<IncomingRecord> {
    let created = repo.create(record)?;
    for part in parts {
        if let Err(e) = repo.add_attachment(created.id, &part.filename, &part.content) {
            warn!(
                number = created.number,
                filename = %part.filename,
                error = %e,
                "Failed to store attachment, removing record"
            );
            if let Err(del) = repo.delete(created.id) {
                error!(
                    number = created.number,
                    error = %del,
                    "Could not remove partially stored record"
                );
            }
            return Err(e);
        }
    }
    Ok(created)
}

/// Register a record with attachments read from `files`.
///
/// All files are read first; an unreadable one fails the call before the
/// record is created.
pub fn register_with_files<R: Repository + ?Sized>(
    repo: &mut R,
    record: NewRecord,
    files: &[PathBuf],
) -> Result<IncomingRecord> {
    let parts = files
        .iter()
        .map(|path| blob::load_file(path))
        .collect::<Result<Vec<_>>>()?;
    create_with_attachments(repo, record, &parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record() -> IncomingRecord {
        IncomingRecord {
            id: 1,
            number: 5,
            date: day(2024, 3, 10),
            applicant: "Ivan Petrov".into(),
            summary: "Request for a building permit".into(),
            responsible: "Default Responsible".into(),
            deadline: day(2024, 3, 20),
        }
    }

    #[test]
    fn test_empty_filter_matches_all() {
        let f = RecordFilter::default();
        assert!(f.is_empty());
        assert!(f.matches(&record(), 0));
    }

    #[test]
    fn test_text_filters_are_case_insensitive() {
        let f = RecordFilter {
            applicant: Some("  PETROV ".into()),
            summary: Some("permit".into()),
            ..Default::default()
        };
        assert!(f.matches(&record(), 0));

        let f = RecordFilter {
            responsible: Some("someone else".into()),
            ..Default::default()
        };
        assert!(!f.matches(&record(), 0));
    }

    #[test]
    fn test_nfkc_normalization() {
        // Fullwidth "PETROV"
        let f = RecordFilter {
            applicant: Some("ＰＥＴＲＯＶ".into()),
            ..Default::default()
        };
        assert!(f.matches(&record(), 0));
    }

    #[test]
    fn test_date_ranges_are_inclusive() {
        let f = RecordFilter {
            date_from: Some(day(2024, 3, 10)),
            date_to: Some(day(2024, 3, 10)),
            deadline_to: Some(day(2024, 3, 20)),
            ..Default::default()
        };
        assert!(f.matches(&record(), 0));

        let f = RecordFilter {
            date_from: Some(day(2024, 3, 11)),
            ..Default::default()
        };
        assert!(!f.matches(&record(), 0));
    }

    #[test]
    fn test_attachment_and_number_filters() {
        let f = RecordFilter {
            has_attachments: Some(true),
            ..Default::default()
        };
        assert!(!f.matches(&record(), 0));
        assert!(f.matches(&record(), 2));

        let f = RecordFilter {
            number: Some(6),
            ..Default::default()
        };
        assert!(!f.matches(&record(), 0));
    }
}
