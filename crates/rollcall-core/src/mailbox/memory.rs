//! In-memory mailbox for tests.
//!
//! Subject search follows IMAP `SEARCH SUBJECT`: a case-insensitive
//! substring match, so replies and forwards are returned too.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use super::{MailboxConnector, MailboxError, MailboxSession, decode_subject};

#[derive(Debug, Clone)]
struct StoredMessage {
    uid: String,
    subject: String,
    raw: Vec<u8>,
}

#[derive(Debug, Default)]
struct State {
    messages: Vec<StoredMessage>,
    failing_fetches: HashSet<String>,
    refuse_connections: bool,
    connections: usize,
    logouts: usize,
}

/// Scripted mailbox. Clones share the same message list and counters.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMailbox {
    state: Arc<Mutex<State>>,
}

impl InMemoryMailbox {
    /// Creates an empty mailbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state(self, update: impl FnOnce(&mut State)) -> Self {
        update(&mut self.state.lock().unwrap_or_else(PoisonError::into_inner));
        self
    }

    /// Appends a raw RFC 822 message (newest last), found by searches for
    /// `subject`.
    #[must_use]
    pub fn with_raw_message(self, uid: &str, subject: &str, raw: &str) -> Self {
        let message = StoredMessage {
            uid: uid.to_string(),
            subject: subject.to_string(),
            raw: raw.as_bytes().to_vec(),
        };
        self.with_state(|state| state.messages.push(message))
    }

    /// Appends a single-part `text/plain` message (newest last).
    #[must_use]
    pub fn with_plain_message(self, uid: &str, subject: &str, body: &str) -> Self {
        let raw = format!(
            "From: office@school.example\r\nSubject: {subject}\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\r\n{body}\r\n"
        );
        self.with_raw_message(uid, subject, &raw)
    }

    /// Makes fetching the body of `uid` fail.
    #[must_use]
    pub fn fail_fetch_for(self, uid: &str) -> Self {
        let uid = uid.to_string();
        self.with_state(|state| {
            state.failing_fetches.insert(uid);
        })
    }

    /// Makes every connection attempt fail at login.
    #[must_use]
    pub fn refuse_connections(self) -> Self {
        self.with_state(|state| state.refuse_connections = true)
    }

    /// Number of sessions opened.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .connections
    }

    /// Number of logouts.
    #[must_use]
    pub fn logouts(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .logouts
    }
}

/// Session handed out by [`InMemoryMailbox`].
#[derive(Debug)]
pub struct InMemorySession {
    state: Arc<Mutex<State>>,
}

impl InMemorySession {
    fn message(&self, seq: u32) -> Result<StoredMessage, MailboxError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        usize::try_from(seq)
            .ok()
            .and_then(|seq| seq.checked_sub(1))
            .and_then(|index| state.messages.get(index))
            .cloned()
            .ok_or(MailboxError::MissingItem { seq, item: "message" })
    }
}

impl MailboxConnector for InMemoryMailbox {
    type Session = InMemorySession;

    fn connect(&self) -> Result<Self::Session, MailboxError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.refuse_connections {
            return Err(MailboxError::Authentication {
                user: "roster@school.example".to_string(),
                message: "invalid credentials".to_string(),
            });
        }
        state.connections += 1;
        Ok(InMemorySession {
            state: Arc::clone(&self.state),
        })
    }
}

impl MailboxSession for InMemorySession {
    fn search_subject(&mut self, subject: &str) -> Result<Vec<u32>, MailboxError> {
        let needle = subject.to_lowercase();
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state
            .messages
            .iter()
            .zip(1u32..)
            .filter(|(message, _)| message.subject.to_lowercase().contains(&needle))
            .map(|(_, seq)| seq)
            .collect())
    }

    fn fetch_subject(&mut self, seq: u32) -> Result<String, MailboxError> {
        decode_subject(&self.message(seq)?.raw)
    }

    fn fetch_uid(&mut self, seq: u32) -> Result<String, MailboxError> {
        self.message(seq).map(|message| message.uid)
    }

    fn fetch_message(&mut self, seq: u32) -> Result<Vec<u8>, MailboxError> {
        let message = self.message(seq)?;
        let failing = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .failing_fetches
            .contains(&message.uid);
        if failing {
            return Err(MailboxError::MissingItem { seq, item: "RFC822" });
        }
        Ok(message.raw)
    }

    fn logout(&mut self) -> Result<(), MailboxError> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .logouts += 1;
        Ok(())
    }
}
