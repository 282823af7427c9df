//! Mailbox access: list unread messages, fetch raw bytes, flag as read.
//!
//! [`MailboxConnector`] opens a [`MailboxSession`]; the ingestion run wraps
//! the session in a [`SessionGuard`] so it is closed on every exit path.

pub mod imap;
pub mod memory;

use std::ops::{Deref, DerefMut};

use tracing::{debug, warn};

use crate::error::Result;

pub use self::imap::ImapConnector;
pub use memory::MemoryMailbox;

/// Server-side identifier of a message (an IMAP UID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(pub u32);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An open, authenticated mailbox session.
pub trait MailboxSession {
    /// Select `folder` and return its unread messages in ascending id order.
    fn list_unread(&mut self, folder: &str) -> Result<Vec<MessageId>>;

    /// Raw RFC 5322 bytes of a message. Must not mark it read.
    fn fetch(&mut self, id: MessageId) -> Result<Vec<u8>>;

    /// Set the read flag. Marking an already-read message is a no-op.
    fn mark_read(&mut self, id: MessageId) -> Result<()>;

    /// End the session. Called at most once by [`SessionGuard`].
    fn close(&mut self) -> Result<()>;
}

/// Opens mailbox sessions.
pub trait MailboxConnector {
    /// Connect and authenticate. Failures are `Auth` or `Connectivity`.
    fn connect(&self) -> Result<Box<dyn MailboxSession>>;
}

/// Closes the wrapped session when dropped.
pub struct SessionGuard {
    session: Box<dyn MailboxSession>,
}

impl SessionGuard {
    pub fn new(session: Box<dyn MailboxSession>) -> Self {
        Self { session }
    }
}

impl Deref for SessionGuard {
    type Target = dyn MailboxSession;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

impl DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session.as_mut()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        match self.session.close() {
            Ok(()) => debug!("Mailbox session closed"),
            Err(e) => warn!(error = %e, "Failed to close mailbox session"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_closes_on_drop() {
        let mailbox = MemoryMailbox::new();
        {
            let mut guard = SessionGuard::new(mailbox.connect().unwrap());
            assert!(guard.list_unread("INBOX").unwrap().is_empty());
        }
        assert_eq!(mailbox.close_count(), 1);
    }

    #[test]
    fn test_message_id_display() {
        assert_eq!(MessageId(42).to_string(), "42");
    }
}
