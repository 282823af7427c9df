//! Registry records and their attachments.

use std::path::PathBuf;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

/// A persisted piece of incoming correspondence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingRecord {
    /// Storage key.
    pub id: i64,
    /// Registration number shown to users. Positive and unique.
    pub number: i64,
    /// Date the correspondence was received.
    pub date: NaiveDate,
    /// Sender display name or address.
    pub applicant: String,
    /// Short description of the content. Part of the dedup key.
    pub summary: String,
    /// Person in charge of the reply.
    pub responsible: String,
    /// Reply due date.
    pub deadline: NaiveDate,
}

impl IncomingRecord {
    /// The `(summary, date, applicant)` triple used to detect re-ingestion.
    pub fn dedup_key(&self) -> DedupKey<'_> {
        DedupKey {
            summary: &self.summary,
            date: self.date,
            applicant: &self.applicant,
        }
    }
}

impl std::fmt::Display for IncomingRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "No. {} of {}", self.number, self.date)
    }
}

/// Exact-match identity of an ingested message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupKey<'a> {
    pub summary: &'a str,
    pub date: NaiveDate,
    pub applicant: &'a str,
}

/// Fields for creating a record. `number: None` asks the repository to
/// assign `max + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecord {
    pub number: Option<i64>,
    pub date: NaiveDate,
    pub applicant: String,
    pub summary: String,
    pub responsible: String,
    pub deadline: NaiveDate,
}

impl NewRecord {
    /// Build a record with the deadline `deadline_days` after `date`.
    pub fn new(
        date: NaiveDate,
        applicant: impl Into<String>,
        summary: impl Into<String>,
        responsible: impl Into<String>,
        deadline_days: i64,
    ) -> Self {
        Self {
            number: None,
            date,
            applicant: applicant.into(),
            summary: summary.into(),
            responsible: responsible.into(),
            deadline: default_deadline(date, deadline_days),
        }
    }

    pub fn dedup_key(&self) -> DedupKey<'_> {
        DedupKey {
            summary: &self.summary,
            date: self.date,
            applicant: &self.applicant,
        }
    }

    /// Check the number (when given) and the required text fields.
    pub fn validate(&self) -> crate::error::Result<()> {
        if let Some(number) = self.number {
            validate_number(number)?;
        }
        validate_fields(&self.applicant, &self.summary, &self.responsible)
    }
}

/// Partial update for the manual edit path. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordUpdate {
    pub number: Option<i64>,
    pub date: Option<NaiveDate>,
    pub applicant: Option<String>,
    pub summary: Option<String>,
    pub responsible: Option<String>,
    pub deadline: Option<NaiveDate>,
}

impl RecordUpdate {
    /// Apply the update on top of an existing record.
    pub fn apply(&self, record: &mut IncomingRecord) {
        if let Some(number) = self.number {
            record.number = number;
        }
        if let Some(date) = self.date {
            record.date = date;
        }
        if let Some(ref applicant) = self.applicant {
            record.applicant = applicant.clone();
        }
        if let Some(ref summary) = self.summary {
            record.summary = summary.clone();
        }
        if let Some(ref responsible) = self.responsible {
            record.responsible = responsible.clone();
        }
        if let Some(deadline) = self.deadline {
            record.deadline = deadline;
        }
    }
}

/// A stored file belonging to exactly one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: i64,
    /// Owning record. Deleting the record deletes the attachment.
    pub record_id: i64,
    /// Decoded display name.
    pub filename: String,
    /// Location of the blob inside the content store.
    pub stored_path: PathBuf,
    /// Payload size in bytes.
    pub size: u64,
}

/// `date + days`, saturating at the calendar's end.
pub fn default_deadline(date: NaiveDate, days: i64) -> NaiveDate {
    let shifted = if days >= 0 {
        date.checked_add_days(Days::new(days.unsigned_abs()))
    } else {
        date.checked_sub_days(Days::new(days.unsigned_abs()))
    };
    shifted.unwrap_or(date)
}

/// Reject record numbers that cannot be stored.
pub fn validate_number(number: i64) -> crate::error::Result<()> {
    if number <= 0 {
        return Err(crate::error::RegistryError::Validation(format!(
            "number must be positive, got {number}"
        )));
    }
    Ok(())
}

/// Reject blank applicant, summary or responsible.
pub fn validate_fields(
    applicant: &str,
    summary: &str,
    responsible: &str,
) -> crate::error::Result<()> {
    let blank: Vec<&str> = [
        ("applicant", applicant),
        ("summary", summary),
        ("responsible", responsible),
    ]
    .into_iter()
    .filter(|(_, value)| value.trim().is_empty())
    .map(|(name, _)| name)
    .collect();

    if !blank.is_empty() {
        return Err(crate::error::RegistryError::Validation(format!(
            "{} must not be empty",
            blank.join(", ")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_default_deadline_is_ten_days_later() {
        let rec = NewRecord::new(day(2024, 12, 25), "a", "b", "c", 10);
        assert_eq!(rec.deadline, day(2025, 1, 4));
        assert_eq!(rec.number, None);
    }

    #[test]
    fn test_validate_number() {
        assert!(validate_number(1).is_ok());
        assert!(validate_number(0).is_err());
        assert!(validate_number(-3).is_err());
    }

    #[test]
    fn test_blank_fields_are_rejected() {
        let rec = NewRecord::new(day(2024, 1, 1), "", "   ", "", 10);
        let err = rec.validate().unwrap_err().to_string();
        assert!(err.contains("applicant, summary, responsible"), "{err}");

        let rec = NewRecord::new(day(2024, 1, 1), "Alice", "Request", "\t", 10);
        assert!(rec.validate().is_err());

        let mut rec = NewRecord::new(day(2024, 1, 1), "Alice", "Request", "Bob", 10);
        assert!(rec.validate().is_ok());
        rec.number = Some(0);
        assert!(rec.validate().is_err());
    }

    #[test]
    fn test_update_apply_only_touches_given_fields() {
        let mut rec = IncomingRecord {
            id: 1,
            number: 7,
            date: day(2024, 3, 1),
            applicant: "Alice".into(),
            summary: "Request".into(),
            responsible: "Default Responsible".into(),
            deadline: day(2024, 3, 11),
        };
        let update = RecordUpdate {
            responsible: Some("Bob".into()),
            ..Default::default()
        };
        update.apply(&mut rec);
        assert_eq!(rec.responsible, "Bob");
        assert_eq!(rec.number, 7);
        assert_eq!(rec.summary, "Request");
    }

    #[test]
    fn test_display() {
        let rec = IncomingRecord {
            id: 1,
            number: 12,
            date: day(2024, 3, 1),
            applicant: String::new(),
            summary: String::new(),
            responsible: String::new(),
            deadline: day(2024, 3, 11),
        };
        assert_eq!(rec.to_string(), "No. 12 of 2024-03-01");
    }
}
