//! Pipeline-internal view of one decoded message.
//!
//! Exists only while a single message is being processed; never persisted.

use chrono::NaiveDate;

use super::address::EmailAddress;

/// Structured fields pulled out of raw message bytes.
#[derive(Debug, Clone)]
pub struct DecodedMessage {
    /// Parsed `From` header.
    pub sender: EmailAddress,
    /// Display name if present, else the bare address; `"Unknown"` without `From`.
    pub applicant: String,
    /// Decoded subject; `"No Subject"` when missing.
    pub subject: String,
    /// Received date in the sender's offset, or the fallback date.
    pub date: NaiveDate,
    /// `true` when `date` came from the fallback rather than the `Date` header.
    pub date_is_fallback: bool,
    /// Plain-text body (may be empty).
    pub body: String,
    /// Attachments that decoded cleanly.
    pub attachments: Vec<AttachmentPart>,
    /// Attachment parts dropped because they could not be decoded.
    pub skipped_attachments: usize,
}

/// One attachment payload ready to be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentPart {
    /// Decoded, sanitized file name.
    pub filename: String,
    /// Transfer-decoded bytes.
    pub content: Vec<u8>,
}

impl DecodedMessage {
    /// First `len` characters of the subject, for log lines.
    pub fn subject_prefix(&self, len: usize) -> String {
        self.subject.chars().take(len).collect()
    }
}
