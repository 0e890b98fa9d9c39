//! IMAP-over-TLS mailbox binding.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use native_tls::{TlsConnector, TlsStream};
use secrecy::{ExposeSecret, SecretString};

use super::{MailboxConnector, MailboxError, MailboxSession, decode_subject};
use crate::config::MailboxConfig;

/// Bound on connecting to the server and on every socket read and write.
pub const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Connects to the roster mailbox over implicit TLS.
#[derive(Debug)]
pub struct ImapConnector {
    host: String,
    port: u16,
    username: String,
    password: SecretString,
    folder: String,
}

impl ImapConnector {
    /// Creates a connector for the configured mailbox.
    #[must_use]
    pub fn new(config: &MailboxConfig, password: SecretString) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            password,
            folder: config.folder.clone(),
        }
    }
}

/// Opens a TCP connection with [`IO_TIMEOUT`] on connect, read and write.
fn connect_tcp(host: &str, port: u16) -> Result<TcpStream, MailboxError> {
    let mut last_error = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, IO_TIMEOUT) {
            Ok(stream) => {
                stream.set_read_timeout(Some(IO_TIMEOUT))?;
                stream.set_write_timeout(Some(IO_TIMEOUT))?;
                return Ok(stream);
            },
            Err(error) => last_error = Some(error),
        }
    }
    Err(last_error
        .unwrap_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("{host} resolved to no address"),
            )
        })
        .into())
}

/// Reads the greeting, logs in and selects `folder`.
///
/// A session whose folder cannot be selected is logged out before the
/// error is returned.
fn open_session<T: Read + Write>(
    stream: T,
    username: &str,
    password: &SecretString,
    folder: &str,
) -> Result<imap::Session<T>, MailboxError> {
    let mut client = imap::Client::new(stream);
    client.read_greeting()?;
    let mut session = client
        .login(username, password.expose_secret())
        .map_err(|(error, _client)| MailboxError::Authentication {
            user: username.to_string(),
            message: error.to_string(),
        })?;

    if let Err(error) = session.select(folder) {
        if let Err(logout_error) = session.logout() {
            tracing::warn!(error = %logout_error, "mailbox logout failed");
        }
        return Err(error.into());
    }
    Ok(session)
}

impl MailboxConnector for ImapConnector {
    type Session = ImapSession;

    fn connect(&self) -> Result<Self::Session, MailboxError> {
        let tls = TlsConnector::builder().build()?;
        let stream = connect_tcp(&self.host, self.port)?;
        let stream = tls
            .connect(&self.host, stream)
            .map_err(|error| MailboxError::Handshake {
                host: self.host.clone(),
                message: error.to_string(),
            })?;
        let session = open_session(stream, &self.username, &self.password, &self.folder)?;

        tracing::info!(
            user = %self.username,
            folder = %self.folder,
            "successfully authenticated to mailbox"
        );
        Ok(ImapSession { inner: session })
    }
}

/// Logged-in IMAP session.
pub struct ImapSession<T: Read + Write = TlsStream<TcpStream>> {
    inner: imap::Session<T>,
}

impl<T: Read + Write> std::fmt::Debug for ImapSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapSession").finish_non_exhaustive()
    }
}

/// Quotes `value` as an IMAP string literal.
fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

impl<T: Read + Write> MailboxSession for ImapSession<T> {
    fn search_subject(&mut self, subject: &str) -> Result<Vec<u32>, MailboxError> {
        let mut matches: Vec<u32> = self
            .inner
            .search(format!("SUBJECT {}", quote(subject)))?
            .into_iter()
            .collect();
        matches.sort_unstable();
        Ok(matches)
    }

    fn fetch_subject(&mut self, seq: u32) -> Result<String, MailboxError> {
        let fetches = self.inner.fetch(seq.to_string(), "BODY.PEEK[HEADER]")?;
        let header = fetches
            .iter()
            .find_map(|fetch| fetch.header())
            .ok_or(MailboxError::MissingItem {
                seq,
                item: "BODY[HEADER]",
            })?;
        decode_subject(header)
    }

    fn fetch_uid(&mut self, seq: u32) -> Result<String, MailboxError> {
        let fetches = self.inner.fetch(seq.to_string(), "UID")?;
        fetches
            .iter()
            .find_map(|fetch| fetch.uid)
            .map(|uid| uid.to_string())
            .ok_or(MailboxError::MissingItem { seq, item: "UID" })
    }

    fn fetch_message(&mut self, seq: u32) -> Result<Vec<u8>, MailboxError> {
        let fetches = self.inner.fetch(seq.to_string(), "RFC822")?;
        fetches
            .iter()
            .find_map(|fetch| fetch.body())
            .map(<[u8]>::to_vec)
            .ok_or(MailboxError::MissingItem { seq, item: "RFC822" })
    }

    fn logout(&mut self) -> Result<(), MailboxError> {
        self.inner.logout()?;
        Ok(())
    }
}
