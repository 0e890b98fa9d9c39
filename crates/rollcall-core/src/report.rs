//! End-of-run summary email.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Mutex, PoisonError};

use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};

use crate::config::ReportConfig;
use crate::workflow::RunSummary;

/// Errors raised while delivering the summary.
#[derive(Debug, thiserror::Error)]
pub enum ReportingError {
    /// A sender or receiver address is malformed.
    #[error("invalid mail address: {0}")]
    Address(#[from] lettre::address::AddressError),

    /// The message could not be built.
    #[error("failed to build message: {0}")]
    Message(#[from] lettre::error::Error),

    /// The SMTP exchange failed.
    #[error("smtp delivery failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    /// The transport refused the message.
    #[error("mail transport unavailable: {0}")]
    Unavailable(String),
}

/// A plain-text message to a single recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Sender address.
    pub from: String,
    /// Recipient address.
    pub to: String,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
}

/// Delivers outbound mail.
pub trait MailSender {
    /// Sends `message` once.
    fn send(&self, message: &OutboundMessage) -> Result<(), ReportingError>;
}

/// SMTP over implicit TLS with login credentials.
pub struct SmtpMailSender {
    host: String,
    port: u16,
    username: String,
    password: SecretString,
}

impl std::fmt::Debug for SmtpMailSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpMailSender")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl SmtpMailSender {
    /// Creates a sender that logs in as the configured sender address.
    #[must_use]
    pub fn new(config: &ReportConfig, password: SecretString) -> Self {
        Self {
            host: config.smtp_host.clone(),
            port: config.smtp_port,
            username: config.sender.clone(),
            password,
        }
    }
}

impl MailSender for SmtpMailSender {
    fn send(&self, message: &OutboundMessage) -> Result<(), ReportingError> {
        let email = Message::builder()
            .from(message.from.parse::<Mailbox>()?)
            .to(message.to.parse::<Mailbox>()?)
            .subject(message.subject.as_str())
            .header(ContentType::TEXT_PLAIN)
            .body(message.body.clone())?;

        let transport = SmtpTransport::relay(&self.host)?
            .port(self.port)
            .credentials(Credentials::new(
                self.username.clone(),
                self.password.expose_secret().to_string(),
            ))
            .build();
        transport.send(&email)?;
        Ok(())
    }
}

/// Captures sent messages instead of delivering them.
#[derive(Debug, Default)]
pub struct RecordingMailSender {
    sent: Mutex<Vec<OutboundMessage>>,
    fail: bool,
}

impl RecordingMailSender {
    /// Creates a sender that accepts every message.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a sender that records every attempt and then fails it.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            sent: Mutex::default(),
            fail: true,
        }
    }

    /// Every attempted message, in order.
    #[must_use]
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl MailSender for RecordingMailSender {
    fn send(&self, message: &OutboundMessage) -> Result<(), ReportingError> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());
        if self.fail {
            return Err(ReportingError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

/// Where and how the run executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunEnvironment {
    /// Operating system description.
    pub os: String,
    /// Host name, or `unknown`.
    pub hostname: String,
    /// Program name.
    pub program: String,
    /// Absolute path of the run's log file.
    pub log_path: PathBuf,
}

impl RunEnvironment {
    /// Describes the current process.
    #[must_use]
    pub fn detect(program: impl Into<String>, log_path: PathBuf) -> Self {
        Self {
            os: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
            hostname: detect_hostname().unwrap_or_else(|| "unknown".to_string()),
            program: program.into(),
            log_path,
        }
    }
}

fn detect_hostname() -> Option<String> {
    let output = Command::new("hostname")
        .output()
        .ok()
        .filter(|output| output.status.success())?;

    let hostname = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if hostname.is_empty() {
        None
    } else {
        Some(hostname)
    }
}

/// How a single-user activation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationStatus {
    /// The user was found, updated and sent a password reset.
    Activated,
    /// The user could not be found or updated.
    NotUpdated,
    /// The browser session failed before the user was handled.
    Aborted,
}

impl ActivationStatus {
    /// Subject line of the activation email for `full_name`.
    #[must_use]
    pub fn subject(self, full_name: &str) -> String {
        match self {
            Self::Activated => {
                format!("Success: Class Charts User {full_name} Account Has Been Activated.")
            },
            Self::NotUpdated => format!("Failure: Unable To Update Class Charts User {full_name}"),
            Self::Aborted => {
                format!("General Error: Failed To Process Class Charts User {full_name}")
            },
        }
    }
}

/// Composes and sends the run summary.
#[derive(Debug)]
pub struct SummaryReporter<M> {
    sender: M,
    from: String,
    to: String,
    subject: String,
    environment: RunEnvironment,
}

impl<M: MailSender> SummaryReporter<M> {
    /// Creates a reporter addressing the configured receiver.
    pub fn new(sender: M, config: &ReportConfig, environment: RunEnvironment) -> Self {
        Self {
            sender,
            from: config.sender.clone(),
            to: config.receiver.clone(),
            subject: config.subject.clone(),
            environment,
        }
    }

    /// The underlying transport.
    pub const fn sender(&self) -> &M {
        &self.sender
    }

    /// Renders the summary message under the configured subject.
    pub fn compose(&self, summary: &RunSummary) -> OutboundMessage {
        self.compose_as(summary, &self.subject)
    }

    fn compose_as(&self, summary: &RunSummary, subject: &str) -> OutboundMessage {
        let env = &self.environment;
        let mut body = String::from(
            "This is a summary email of an automated script for Class Charts staff user activation.\n\n",
        );
        let _ = writeln!(
            body,
            "Environment:\n\
             Operating System: {}\n\
             Hostname: {}\n\
             Script Name: {}\n\
             Start Time: {}\n\
             End Time: {}\n",
            env.os,
            env.hostname,
            env.program,
            summary.started_at().format("%H:%M:%S"),
            summary.finished_at().format("%H:%M:%S"),
        );

        let mut succeeded = summary.succeeded().peekable();
        if succeeded.peek().is_some() {
            body.push_str("Successfully Processed Users:\n");
            for record in succeeded {
                let _ = writeln!(
                    body,
                    "{} - {}\nPassword reset email sent to: {}.\n",
                    record.full_name, record.email, record.email
                );
            }
        }

        let mut failed = summary.failed().peekable();
        if failed.peek().is_some() {
            body.push_str("Failed Users:\n");
            for record in failed {
                let _ = writeln!(body, "{} - {}", record.full_name, record.email);
            }
        } else {
            body.push_str("No failures occurred.\n");
        }

        if !summary.errors().is_empty() {
            body.push_str("General Errors:\n");
            for error in summary.errors() {
                let _ = writeln!(body, "{error}\n");
            }
        }

        let _ = writeln!(
            body,
            "\n\nLog files can be found at: {}",
            env.log_path.display()
        );

        OutboundMessage {
            from: self.from.clone(),
            to: self.to.clone(),
            subject: subject.to_string(),
            body,
        }
    }

    /// Sends the summary once. Failures are logged and reported as `false`.
    pub fn send(&self, summary: &RunSummary) -> bool {
        self.deliver(&self.compose(summary))
    }

    /// Sends the summary of a single-user activation, titled by its status.
    pub fn send_activation(
        &self,
        summary: &RunSummary,
        full_name: &str,
        status: ActivationStatus,
    ) -> bool {
        self.deliver(&self.compose_as(summary, &status.subject(full_name)))
    }

    fn deliver(&self, message: &OutboundMessage) -> bool {
        match self.sender.send(message) {
            Ok(()) => {
                tracing::info!(receiver = %self.to, "summary email sent");
                true
            },
            Err(error) => {
                tracing::error!(receiver = %self.to, %error, "failed to send summary email");
                false
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Local, TimeZone};

    use super::*;
    use crate::roster::RosterRecord;
    use crate::workflow::ProvisioningOutcome;

    fn config() -> ReportConfig {
        ReportConfig {
            smtp_host: "smtp.example.com".to_string(),
            smtp_port: 465,
            sender: "bot@school.example".to_string(),
            sender_password_env: "ROLLCALL_SMTP_PASSWORD".to_string(),
            receiver: "it@school.example".to_string(),
            subject: "Activation Summary".to_string(),
        }
    }

    fn environment() -> RunEnvironment {
        RunEnvironment {
            os: "linux x86_64".to_string(),
            hostname: "office-pc".to_string(),
            program: "rollcall".to_string(),
            log_path: PathBuf::from("/var/log/rollcall/rollcall_log_20240102_090000.log"),
        }
    }

    fn summary() -> RunSummary {
        let start = Local.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap();
        let mut summary = RunSummary::new(start);
        summary.finish(Local.with_ymd_and_hms(2024, 1, 2, 9, 5, 30).unwrap());
        summary
    }

    #[test]
    fn test_compose_lists_successes_and_failures() {
        let mut summary = summary();
        summary.push_outcome(ProvisioningOutcome::Succeeded(RosterRecord::new(
            "Jane Doe",
            "jane.doe@example.com",
        )));
        summary.push_outcome(ProvisioningOutcome::NotFound(RosterRecord::new(
            "John Roe",
            "john.roe@example.com",
        )));

        let reporter = SummaryReporter::new(RecordingMailSender::new(), &config(), environment());
        let message = reporter.compose(&summary);

        assert_eq!(message.to, "it@school.example");
        assert_eq!(message.subject, "Activation Summary");
        assert!(message.body.contains("Hostname: office-pc\n"));
        assert!(message.body.contains("Start Time: 09:00:00\nEnd Time: 09:05:30\n"));
        assert!(message.body.contains(
            "Successfully Processed Users:\nJane Doe - jane.doe@example.com\n\
             Password reset email sent to: jane.doe@example.com.\n"
        ));
        assert!(message.body.contains("Failed Users:\nJohn Roe - john.roe@example.com\n"));
        assert!(!message.body.contains("No failures occurred."));
        assert!(message.body.ends_with(
            "Log files can be found at: /var/log/rollcall/rollcall_log_20240102_090000.log\n"
        ));
    }

    #[test]
    fn test_compose_without_failures_includes_general_errors() {
        let mut summary = summary();
        summary.push_error("General WebDriver error: browser session lost");

        let reporter = SummaryReporter::new(RecordingMailSender::new(), &config(), environment());
        let body = reporter.compose(&summary).body;

        assert!(body.contains("No failures occurred.\n"));
        assert!(body.contains("General Errors:\nGeneral WebDriver error: browser session lost\n"));
        assert!(!body.contains("Successfully Processed Users"));
    }

    #[test]
    fn test_send_failure_is_not_escalated() {
        let reporter = SummaryReporter::new(RecordingMailSender::failing(), &config(), environment());
        assert!(!reporter.send(&summary()));
        assert_eq!(reporter.sender().sent().len(), 1);
    }

    #[test]
    fn test_activation_subject_follows_status() {
        let reporter = SummaryReporter::new(RecordingMailSender::new(), &config(), environment());

        assert!(reporter.send_activation(&summary(), "Jane Doe", ActivationStatus::Activated));
        reporter.send_activation(&summary(), "Jane Doe", ActivationStatus::NotUpdated);
        reporter.send_activation(&summary(), "Jane Doe", ActivationStatus::Aborted);

        let subjects: Vec<String> = reporter
            .sender()
            .sent()
            .into_iter()
            .map(|message| message.subject)
            .collect();
        assert_eq!(
            subjects,
            vec![
                "Success: Class Charts User Jane Doe Account Has Been Activated.",
                "Failure: Unable To Update Class Charts User Jane Doe",
                "General Error: Failed To Process Class Charts User Jane Doe",
            ]
        );
    }
}
