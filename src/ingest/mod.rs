//! Mailbox-to-registry ingestion.
//!
//! One run connects, lists unread messages and walks them in order:
//! fetch, decode, summarize, dedup check, then either skip or persist
//! (record plus attachments), and finally mark the message read.
//!
//! Only `Auth` and `Connectivity` errors end a run early. Anything that
//! goes wrong with one message is logged and counted, the message stays
//! unread, and the next message is processed. A message is marked read only
//! after its record and attachments are stored, so a crash in between at
//! worst leaves a record whose message is re-fetched and then recognized as
//! a duplicate on the next run.

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{RegistryError, Result};
use crate::mailbox::{MailboxConnector, MailboxSession, MessageId, SessionGuard};
use crate::model::{DecodedMessage, IncomingRecord, NewRecord};
use crate::parser;
use crate::store::{self, Repository};
use crate::summary::Summarizer;

/// Subject characters included in log lines.
const LOG_SUBJECT_CHARS: usize = 50;

/// Per-run settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOptions {
    /// Folder polled for unread messages.
    pub folder: String,
    /// `responsible` stored on new records.
    pub default_responsible: String,
    /// Deadline offset from the received date.
    pub deadline_days: i64,
    /// Flag duplicates as read so they are not fetched again.
    pub mark_read_on_duplicate: bool,
    /// Decode and summarize only; write nothing, flag nothing.
    pub dry_run: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for IngestOptions {
    fn from(config: &Config) -> Self {
        Self {
            folder: config.mailbox.folder.clone(),
            default_responsible: config.ingest.default_responsible.clone(),
            deadline_days: config.ingest.deadline_days,
            mark_read_on_duplicate: config.ingest.mark_read_on_duplicate,
            dry_run: false,
        }
    }
}

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Unread messages found.
    pub listed: usize,
    /// Records created (or, in a dry run, that would be created).
    pub created: usize,
    /// Messages matching an existing record.
    pub duplicates: usize,
    /// Messages skipped because of an error; they stay unread.
    pub failed: usize,
    pub attachments_saved: usize,
    /// Attachment parts that could not be decoded.
    pub attachments_skipped: usize,
    /// Stored records whose message could not be flagged as read.
    pub mark_read_failures: usize,
    /// Numbers of the records created in this run.
    pub created_numbers: Vec<i64>,
    pub dry_run: bool,
}

/// What happened to one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Created {
        record: IncomingRecord,
        attachments: usize,
    },
    Duplicate {
        existing: IncomingRecord,
    },
    /// Dry run: the record that would have been created.
    WouldCreate(NewRecord),
}

/// Drives ingestion runs against one mailbox and one repository.
pub struct Ingestor<'a> {
    connector: &'a dyn MailboxConnector,
    repo: &'a mut dyn Repository,
    summarizer: &'a Summarizer,
    options: IngestOptions,
    today: Option<NaiveDate>,
}

impl<'a> Ingestor<'a> {
    pub fn new(
        connector: &'a dyn MailboxConnector,
        repo: &'a mut dyn Repository,
        summarizer: &'a Summarizer,
        options: IngestOptions,
    ) -> Self {
        Self {
            connector,
            repo,
            summarizer,
            options,
            today: None,
        }
    }

    /// Pin the date used for messages without a usable `Date` header.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| chrono::Local::now().date_naive())
    }

    /// Process every unread message once.
    ///
    /// Returns `Err` only for connection-level failures; the session is
    /// closed on every path.
    pub fn run(&mut self) -> Result<RunReport> {
        let mut report = RunReport {
            dry_run: self.options.dry_run,
            ..Default::default()
        };

        let mut session = SessionGuard::new(self.connector.connect()?);
        let ids = session.list_unread(&self.options.folder)?;
        report.listed = ids.len();
        info!(
            folder = %self.options.folder,
            count = ids.len(),
            dry_run = self.options.dry_run,
            "Found unread messages"
        );

        for id in ids {
            match self.process_message(&mut *session, id, &mut report) {
                Ok(Outcome::Created { record, attachments }) => {
                    report.created += 1;
                    report.attachments_saved += attachments;
                    report.created_numbers.push(record.number);
                }
                Ok(Outcome::Duplicate { .. }) => report.duplicates += 1,
                Ok(Outcome::WouldCreate(_)) => report.created += 1,
                Err(e) if e.is_fatal() => {
                    error!(uid = %id, error = %e, "Aborting ingestion run");
                    return Err(e);
                }
                Err(_) => report.failed += 1,
            }
        }

        info!(
            listed = report.listed,
            created = report.created,
            duplicates = report.duplicates,
            failed = report.failed,
            attachments_saved = report.attachments_saved,
            attachments_skipped = report.attachments_skipped,
            "Ingestion run finished"
        );
        Ok(report)
    }

    /// Take one message through the pipeline. Per-message errors are logged
    /// here, with whatever context is known at that point.
    fn process_message(
        &mut self,
        session: &mut dyn MailboxSession,
        id: MessageId,
        report: &mut RunReport,
    ) -> Result<Outcome> {
        let raw = session.fetch(id).inspect_err(|e| {
            if !e.is_fatal() {
                warn!(uid = %id, error = %e, "Failed to fetch message, leaving it unread");
            }
        })?;

        let msg = parser::decode_with_fallback(&raw, self.today()).inspect_err(|e| {
            warn!(uid = %id, error = %e, "Failed to decode message, leaving it unread")
        })?;
        report.attachments_skipped += msg.skipped_attachments;

        let summary = self.summarizer.summarize(&msg.body, &msg.subject);
        let new_record = NewRecord::new(
            msg.date,
            msg.applicant.clone(),
            summary,
            self.options.default_responsible.clone(),
            self.options.deadline_days,
        );

        let existing = self
            .repo
            .find_by_key(new_record.dedup_key())
            .inspect_err(|e| log_failure(id, &msg, e, "Dedup lookup failed"))?;
        if let Some(existing) = existing {
            info!(
                uid = %id,
                applicant = %msg.applicant,
                number = existing.number,
                "Message duplicates an existing record"
            );
            if self.options.mark_read_on_duplicate && !self.options.dry_run {
                mark_read(session, id, report)?;
            }
            return Ok(Outcome::Duplicate { existing });
        }

        if self.options.dry_run {
            info!(
                uid = %id,
                applicant = %msg.applicant,
                date = %new_record.date,
                attachments = msg.attachments.len(),
                "Would create record"
            );
            return Ok(Outcome::WouldCreate(new_record));
        }

        let record = store::create_with_attachments(&mut *self.repo, new_record, &msg.attachments)
            .inspect_err(|e| log_failure(id, &msg, e, "Failed to store record"))?;

        info!(
            uid = %id,
            number = record.number,
            applicant = %record.applicant,
            attachments = msg.attachments.len(),
            "Created record"
        );
        mark_read(session, id, report)?;

        Ok(Outcome::Created {
            attachments: msg.attachments.len(),
            record,
        })
    }
}

/// Flag a handled message. Only a broken connection is propagated; any
/// other failure is logged and the next run sees a duplicate.
fn mark_read(
    session: &mut dyn MailboxSession,
    id: MessageId,
    report: &mut RunReport,
) -> Result<()> {
    match session.mark_read(id) {
        Ok(()) => {
            debug!(uid = %id, "Marked message read");
            Ok(())
        }
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            report.mark_read_failures += 1;
            warn!(uid = %id, error = %e, "Failed to mark message read");
            Ok(())
        }
    }
}

fn log_failure(id: MessageId, msg: &DecodedMessage, e: &RegistryError, what: &str) {
    warn!(
        uid = %id,
        applicant = %msg.applicant,
        subject = %msg.subject_prefix(LOG_SUBJECT_CHARS),
        error = %e,
        "{what}"
    );
}

/// Run one ingestion pass.
///
/// Safe to call repeatedly: with nothing unread it returns an empty report.
pub fn run_ingestion(
    connector: &dyn MailboxConnector,
    repo: &mut dyn Repository,
    summarizer: &Summarizer,
    options: IngestOptions,
) -> Result<RunReport> {
    Ingestor::new(connector, repo, summarizer, options).run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::MemoryMailbox;
    use crate::store::MemoryRepository;
    use crate::summary::SummaryLimits;

    fn message(from: &str, subject: &str, body: &str) -> Vec<u8> {
        format!(
            "From: {from}\r\nSubject: {subject}\r\nDate: Tue, 02 Apr 2024 09:15:00 +0200\r\n\r\n{body}\r\n"
        )
        .into_bytes()
    }

    #[test]
    fn test_empty_mailbox_gives_empty_report() {
        let mailbox = MemoryMailbox::new();
        let mut repo = MemoryRepository::new();
        let summarizer = Summarizer::truncating(SummaryLimits::default());

        let report =
            run_ingestion(&mailbox, &mut repo, &summarizer, IngestOptions::default()).unwrap();
        assert_eq!(report, RunReport::default());
        assert_eq!(mailbox.close_count(), 1);
    }

    #[test]
    fn test_record_fields_from_message() {
        let mailbox = MemoryMailbox::new();
        let id = mailbox.deliver(message("Alice <alice@example.com>", "Permit", "Please approve."));
        let mut repo = MemoryRepository::new();
        let summarizer = Summarizer::truncating(SummaryLimits::default());

        let report =
            run_ingestion(&mailbox, &mut repo, &summarizer, IngestOptions::default()).unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.created_numbers, vec![1]);
        assert!(mailbox.is_seen(id));

        let rec = repo.get_by_number(1).unwrap();
        assert_eq!(rec.applicant, "Alice");
        assert_eq!(rec.date, NaiveDate::from_ymd_opt(2024, 4, 2).unwrap());
        assert_eq!(rec.deadline, NaiveDate::from_ymd_opt(2024, 4, 12).unwrap());
        assert_eq!(rec.responsible, "Default Responsible");
        assert!(rec.summary.starts_with("Please approve."));
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let mailbox = MemoryMailbox::new();
        let id = mailbox.deliver(message("a@b.com", "x", "body"));
        let mut repo = MemoryRepository::new();
        let summarizer = Summarizer::truncating(SummaryLimits::default());
        let options = IngestOptions {
            dry_run: true,
            ..Default::default()
        };

        let report = run_ingestion(&mailbox, &mut repo, &summarizer, options).unwrap();
        assert_eq!(report.created, 1);
        assert!(report.dry_run);
        assert!(repo.is_empty());
        assert!(!mailbox.is_seen(id));
    }

    #[test]
    fn test_auth_failure_is_returned() {
        let mailbox = MemoryMailbox::new();
        mailbox.reject_login();
        let mut repo = MemoryRepository::new();
        let summarizer = Summarizer::truncating(SummaryLimits::default());
        let err = run_ingestion(&mailbox, &mut repo, &summarizer, IngestOptions::default())
            .unwrap_err();
        assert!(matches!(err, RegistryError::Auth(_)));
    }

    #[test]
    fn test_duplicate_left_unread_when_configured() {
        let mailbox = MemoryMailbox::new();
        let raw = message("a@b.com", "Same", "Same body");
        mailbox.deliver(raw.clone());
        let mut repo = MemoryRepository::new();
        let summarizer = Summarizer::truncating(SummaryLimits::default());
        run_ingestion(&mailbox, &mut repo, &summarizer, IngestOptions::default()).unwrap();

        let dup = mailbox.deliver(raw);
        let options = IngestOptions {
            mark_read_on_duplicate: false,
            ..Default::default()
        };
        let report = run_ingestion(&mailbox, &mut repo, &summarizer, options).unwrap();
        assert_eq!(report.duplicates, 1);
        assert_eq!(repo.len(), 1);
        assert!(!mailbox.is_seen(dup));
    }

    #[test]
    fn test_mark_read_failure_keeps_record() {
        let mailbox = MemoryMailbox::new();
        let id = mailbox.deliver(message("a@b.com", "x", "body"));
        mailbox.fail_mark_read(id);
        let mut repo = MemoryRepository::new();
        let summarizer = Summarizer::truncating(SummaryLimits::default());

        let report =
            run_ingestion(&mailbox, &mut repo, &summarizer, IngestOptions::default()).unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.mark_read_failures, 1);
        assert!(!mailbox.is_seen(id));
        assert_eq!(repo.len(), 1);
    }
}
