//! In-process mailbox backed by a shared map.
//!
//! Used by the test-suite and by `ingest --eml-dir`, which loads a directory
//! of `.eml` files as unread messages.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use crate::error::{RegistryError, Result};

use super::{MailboxConnector, MailboxSession, MessageId};

#[derive(Debug, Default)]
struct StoredMessage {
    raw: Vec<u8>,
    seen: bool,
}

#[derive(Debug, Default)]
struct State {
    messages: BTreeMap<u32, StoredMessage>,
    next_uid: u32,
    failing_fetch: HashSet<u32>,
    failing_mark_read: HashSet<u32>,
    reject_login: bool,
    connects: usize,
    closes: usize,
}

/// A mailbox whose handles all share one state; clone freely.
#[derive(Debug, Clone, Default)]
pub struct MemoryMailbox {
    state: Arc<Mutex<State>>,
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.eml` file in `dir` (sorted by name) as an unread message.
    pub fn from_eml_dir(dir: &Path) -> Result<Self> {
        let mailbox = Self::new();
        let entries = std::fs::read_dir(dir).map_err(|e| RegistryError::io(dir, e))?;

        let mut paths: Vec<_> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .map(|ext| ext.eq_ignore_ascii_case("eml"))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();

        for path in &paths {
            let raw = std::fs::read(path).map_err(|e| RegistryError::io(path, e))?;
            let id = mailbox.deliver(raw);
            debug!(path = %path.display(), uid = %id, "Loaded message");
        }
        info!(dir = %dir.display(), count = paths.len(), "Loaded .eml files");
        Ok(mailbox)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves the maps consistent
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add an unread message and return its id.
    pub fn deliver(&self, raw: impl Into<Vec<u8>>) -> MessageId {
        let mut state = self.lock();
        state.next_uid += 1;
        let uid = state.next_uid;
        state.messages.insert(
            uid,
            StoredMessage {
                raw: raw.into(),
                seen: false,
            },
        );
        MessageId(uid)
    }

    pub fn is_seen(&self, id: MessageId) -> bool {
        self.lock()
            .messages
            .get(&id.0)
            .map(|m| m.seen)
            .unwrap_or(false)
    }

    /// Ids of messages not yet marked read.
    pub fn unread(&self) -> Vec<MessageId> {
        self.lock()
            .messages
            .iter()
            .filter(|(_, m)| !m.seen)
            .map(|(uid, _)| MessageId(*uid))
            .collect()
    }

    /// Make every fetch of `id` fail with a per-message error.
    pub fn fail_fetch(&self, id: MessageId) {
        self.lock().failing_fetch.insert(id.0);
    }

    /// Make every `mark_read` of `id` fail.
    pub fn fail_mark_read(&self, id: MessageId) {
        self.lock().failing_mark_read.insert(id.0);
    }

    /// Make `connect` fail with an authentication error.
    pub fn reject_login(&self) {
        self.lock().reject_login = true;
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    pub fn close_count(&self) -> usize {
        self.lock().closes
    }
}

impl MailboxConnector for MemoryMailbox {
    fn connect(&self) -> Result<Box<dyn MailboxSession>> {
        let mut state = self.lock();
        if state.reject_login {
            return Err(RegistryError::Auth("invalid credentials".into()));
        }
        state.connects += 1;
        Ok(Box::new(MemorySession {
            mailbox: self.clone(),
            closed: false,
        }))
    }
}

struct MemorySession {
    mailbox: MemoryMailbox,
    closed: bool,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(RegistryError::Connectivity("session closed".into()));
        }
        Ok(())
    }
}

impl MailboxSession for MemorySession {
    fn list_unread(&mut self, _folder: &str) -> Result<Vec<MessageId>> {
        self.ensure_open()?;
        Ok(self.mailbox.unread())
    }

    fn fetch(&mut self, id: MessageId) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let state = self.mailbox.lock();
        if state.failing_fetch.contains(&id.0) {
            return Err(RegistryError::fetch(id.to_string(), "injected fetch failure"));
        }
        state
            .messages
            .get(&id.0)
            .map(|m| m.raw.clone())
            .ok_or_else(|| RegistryError::fetch(id.to_string(), "no such message"))
    }

    fn mark_read(&mut self, id: MessageId) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.mailbox.lock();
        if state.failing_mark_read.contains(&id.0) {
            return Err(RegistryError::fetch(id.to_string(), "injected flag failure"));
        }
        match state.messages.get_mut(&id.0) {
            Some(m) => {
                m.seen = true;
                Ok(())
            }
            None => Err(RegistryError::fetch(id.to_string(), "no such message")),
        }
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.mailbox.lock().closes += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_does_not_mark_read() {
        let mb = MemoryMailbox::new();
        let id = mb.deliver(b"Subject: x\n\nbody".to_vec());
        let mut session = mb.connect().unwrap();
        assert_eq!(session.fetch(id).unwrap(), b"Subject: x\n\nbody");
        assert!(!mb.is_seen(id));
        assert_eq!(session.list_unread("INBOX").unwrap(), vec![id]);
    }

    #[test]
    fn test_mark_read_is_idempotent() {
        let mb = MemoryMailbox::new();
        let id = mb.deliver(b"x".to_vec());
        let mut session = mb.connect().unwrap();
        session.mark_read(id).unwrap();
        session.mark_read(id).unwrap();
        assert!(mb.is_seen(id));
        assert!(session.list_unread("INBOX").unwrap().is_empty());
    }

    #[test]
    fn test_injected_failures() {
        let mb = MemoryMailbox::new();
        let id = mb.deliver(b"x".to_vec());
        mb.fail_fetch(id);
        let mut session = mb.connect().unwrap();
        let err = session.fetch(id).unwrap_err();
        assert!(!err.is_fatal());

        mb.reject_login();
        assert!(matches!(mb.connect(), Err(RegistryError::Auth(_))));
    }

    #[test]
    fn test_closed_session_rejects_calls() {
        let mb = MemoryMailbox::new();
        let mut session = mb.connect().unwrap();
        session.close().unwrap();
        session.close().unwrap();
        assert_eq!(mb.close_count(), 1);
        assert!(session.list_unread("INBOX").unwrap_err().is_fatal());
    }

    #[test]
    fn test_from_eml_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.eml"), b"Subject: second\n\nb").unwrap();
        std::fs::write(dir.path().join("a.eml"), b"Subject: first\n\na").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let mb = MemoryMailbox::from_eml_dir(dir.path()).unwrap();
        let ids = mb.unread();
        assert_eq!(ids.len(), 2);
        let mut session = mb.connect().unwrap();
        assert_eq!(session.fetch(ids[0]).unwrap(), b"Subject: first\n\na");
    }
}
