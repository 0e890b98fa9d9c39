//! Roster mailbox polling.
//!
//! [`MailboxReader`] finds the newest roster email that has not been acted
//! upon yet, records its UID and hands back the plain-text body. Every
//! failure on the way (connection, login, search, parsing) is logged and
//! reported as "no content"; the mailbox is never fatal to a run.

use mailparse::{MailHeaderMap, ParsedMail};

use crate::uid_store::{UidStore, UidStoreError};

pub mod imap;
pub mod memory;

pub use self::imap::ImapConnector;
pub use self::memory::InMemoryMailbox;

/// Errors raised by mailbox sessions.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    /// The server could not be reached.
    #[error("mailbox connection failed: {0}")]
    Io(#[from] std::io::Error),

    /// TLS setup failed.
    #[error("tls setup failed: {0}")]
    Tls(#[from] native_tls::Error),

    /// The TLS handshake with the server failed.
    #[error("tls handshake with {host} failed: {message}")]
    Handshake {
        /// Mailbox host.
        host: String,
        /// Handshake error.
        message: String,
    },

    /// The server rejected the login.
    #[error("mailbox login failed for {user}: {message}")]
    Authentication {
        /// Mailbox account.
        user: String,
        /// Server response.
        message: String,
    },

    /// IMAP command failed.
    #[error("imap command failed: {0}")]
    Imap(#[from] ::imap::error::Error),

    /// The server answered without the requested item.
    #[error("message {seq} has no {item}")]
    MissingItem {
        /// Message sequence number.
        seq: u32,
        /// The fetch item that was absent.
        item: &'static str,
    },

    /// The message could not be parsed as MIME.
    #[error("malformed message: {0}")]
    Parse(#[from] mailparse::MailParseError),

    /// The UID could not be recorded.
    #[error(transparent)]
    UidStore(#[from] UidStoreError),
}

/// An open, logged-in mailbox with the roster folder selected.
pub trait MailboxSession {
    /// Sequence numbers of messages whose subject contains `subject`,
    /// ignoring case, oldest first.
    ///
    /// This is the server-side `SEARCH SUBJECT` and may return more than
    /// the exact matches.
    fn search_subject(&mut self, subject: &str) -> Result<Vec<u32>, MailboxError>;

    /// The decoded `Subject` header of the message at `seq`.
    fn fetch_subject(&mut self, seq: u32) -> Result<String, MailboxError>;

    /// The durable UID of the message at `seq`.
    fn fetch_uid(&mut self, seq: u32) -> Result<String, MailboxError>;

    /// The full raw message at `seq`.
    fn fetch_message(&mut self, seq: u32) -> Result<Vec<u8>, MailboxError>;

    /// Ends the session.
    fn logout(&mut self) -> Result<(), MailboxError>;
}

/// Opens mailbox sessions.
pub trait MailboxConnector {
    /// The session type produced.
    type Session: MailboxSession;

    /// Connects and logs in.
    fn connect(&self) -> Result<Self::Session, MailboxError>;
}

/// Reads roster emails exactly once.
#[derive(Debug)]
pub struct MailboxReader<C, S> {
    connector: C,
    store: S,
}

impl<C: MailboxConnector, S: UidStore> MailboxReader<C, S> {
    /// Creates a reader over `connector`, gated by `store`.
    pub const fn new(connector: C, store: S) -> Self {
        Self { connector, store }
    }

    /// The UID store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// The connector.
    pub const fn connector(&self) -> &C {
        &self.connector
    }

    /// Returns the body of the newest unprocessed email titled `subject`.
    ///
    /// Only messages whose subject equals `subject` exactly count; replies
    /// and forwards are ignored. Matching messages are scanned newest to
    /// oldest. Messages whose UID is already in the store are skipped; the
    /// first new one is recorded and its text returned. Older unprocessed
    /// messages are left for a later run. The session is logged out on
    /// every path.
    pub fn fetch_unprocessed_roster_text(&self, subject: &str) -> Option<String> {
        let mut session = match self.connector.connect() {
            Ok(session) => session,
            Err(error) => {
                tracing::error!(%error, "error fetching email");
                return None;
            },
        };
        tracing::info!(subject, "checking mailbox for roster email");

        let result = self.scan(&mut session, subject);
        if let Err(error) = session.logout() {
            tracing::warn!(%error, "mailbox logout failed");
        }

        result.unwrap_or_else(|error| {
            tracing::error!(%error, "error fetching email");
            None
        })
    }

    fn scan(
        &self,
        session: &mut C::Session,
        subject: &str,
    ) -> Result<Option<String>, MailboxError> {
        let candidates = session.search_subject(subject)?;
        let mut matched = 0usize;

        for &seq in candidates.iter().rev() {
            let found = session.fetch_subject(seq)?;
            if found != subject {
                tracing::debug!(seq, subject = %found, "subject is not an exact match, skipping");
                continue;
            }
            matched += 1;

            let uid = session.fetch_uid(seq)?;
            if self.store.contains(&uid) {
                tracing::info!(uid = %uid, "email already processed, skipping");
                continue;
            }

            let raw = match session.fetch_message(seq) {
                Ok(raw) => raw,
                Err(error) => {
                    tracing::error!(uid = %uid, %error, "failed to fetch email");
                    continue;
                },
            };

            self.store.record(&uid)?;
            tracing::info!(uid = %uid, "processing email");

            let body = extract_plain_text(&raw)?;
            if body.is_none() {
                tracing::warn!(uid = %uid, "email has no text/plain part");
            }
            return Ok(body);
        }

        if matched == 0 {
            tracing::info!("no matching emails found");
        } else {
            tracing::info!("all matching emails already processed");
        }
        Ok(None)
    }
}

/// Decoded `Subject` of a raw header block (or a whole message).
///
/// Encoded words are decoded; a missing header is an empty subject.
pub fn decode_subject(raw: &[u8]) -> Result<String, MailboxError> {
    let (headers, _) = mailparse::parse_headers(raw)?;
    Ok(headers.get_first_value("Subject").unwrap_or_default())
}

/// Decoded text of the first `text/plain` part of `raw`.
///
/// A non-multipart message yields its single decoded body whatever its
/// content type.
pub fn extract_plain_text(raw: &[u8]) -> Result<Option<String>, MailboxError> {
    let parsed = mailparse::parse_mail(raw)?;
    if parsed.subparts.is_empty() {
        return Ok(Some(parsed.get_body()?));
    }
    first_plain_part(&parsed)
        .map(ParsedMail::get_body)
        .transpose()
        .map_err(MailboxError::from)
}

fn first_plain_part<'a>(part: &'a ParsedMail<'a>) -> Option<&'a ParsedMail<'a>> {
    if part.subparts.is_empty() {
        return (part.ctype.mimetype == "text/plain").then_some(part);
    }
    part.subparts.iter().find_map(first_plain_part)
}
