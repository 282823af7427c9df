//! `incoming-registry`: a registry of incoming correspondence.
//!
//! Records are entered by hand or ingested from a mailbox: unread messages
//! are decoded, summarized, checked against existing records and stored
//! with their attachments, then marked read.

pub mod config;
pub mod error;
pub mod ingest;
pub mod mailbox;
pub mod model;
pub mod parser;
pub mod store;
pub mod summary;
