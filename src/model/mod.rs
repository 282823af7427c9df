//! Core data model types: records, attachments, addresses and decoded messages.

pub mod address;
pub mod message;
pub mod record;

pub use address::EmailAddress;
pub use message::{AttachmentPart, DecodedMessage};
pub use record::{Attachment, DedupKey, IncomingRecord, NewRecord, RecordUpdate};
