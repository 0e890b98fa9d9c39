//! Configuration parsing and management.
//!
//! This module handles parsing of the rollcall configuration file (TOML) that
//! describes the roster mailbox, the staff portal and the summary report
//! recipient. Passwords never live in the file: each one is named by an
//! environment variable and resolved once at startup into [`Credentials`].

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Subject line of the summary email sent after each run.
pub const DEFAULT_SUMMARY_SUBJECT: &str = "Staff Onboarding - Class Charts User Activation Summary";

/// Top-level rollcall configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RollcallConfig {
    /// Append-only log of processed mailbox message UIDs.
    pub uid_log: PathBuf,

    /// Directory receiving one log file per run.
    pub log_dir: PathBuf,

    /// Roster mailbox settings.
    pub mailbox: MailboxConfig,

    /// Staff portal settings.
    pub portal: PortalConfig,

    /// Summary report settings.
    pub report: ReportConfig,
}

/// Roster mailbox (IMAP over TLS).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MailboxConfig {
    /// IMAP server host name.
    pub host: String,

    /// IMAP server port.
    #[serde(default = "default_imap_port")]
    pub port: u16,

    /// Mailbox login.
    pub username: String,

    /// Environment variable holding the mailbox password.
    pub password_env: String,

    /// Exact subject of roster emails.
    pub subject: String,

    /// Folder searched for roster emails.
    #[serde(default = "default_folder")]
    pub folder: String,
}

/// How a roster record is matched against portal rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowMatch {
    /// Case-insensitive substring match of the full name against the row's
    /// displayed name.
    #[default]
    NameContains,

    /// Exact match of the full name against the row's `data-full_name`
    /// attribute.
    FullNameAttribute,
}

/// Staff portal and the WebDriver session used to drive it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortalConfig {
    /// Login page URL.
    pub login_url: String,

    /// User-management page URL.
    pub users_url: String,

    /// Portal account login.
    pub account_email: String,

    /// Environment variable holding the portal account password.
    pub account_password_env: String,

    /// WebDriver endpoint.
    #[serde(default = "default_webdriver_url")]
    pub webdriver_url: String,

    /// Driver executable spawned for the run. When absent, a driver is
    /// expected to already listen on `webdriver_url`.
    #[serde(default)]
    pub driver_binary: Option<PathBuf>,

    /// Browser name requested from the driver.
    #[serde(default = "default_browser")]
    pub browser: String,

    /// Run the browser without a window.
    #[serde(default = "default_true")]
    pub headless: bool,

    /// Row matching strategy.
    #[serde(default)]
    pub row_match: RowMatch,

    /// Upper bound on every UI wait, in seconds.
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,
}

impl PortalConfig {
    /// Returns the UI wait bound as a [`Duration`].
    #[must_use]
    pub const fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}

/// Summary report delivery (SMTP over implicit TLS).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportConfig {
    /// SMTP relay host.
    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,

    /// SMTP relay port.
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,

    /// Sender address, also used as the SMTP login.
    pub sender: String,

    /// Environment variable holding the sender password.
    pub sender_password_env: String,

    /// Recipient of the summary.
    pub receiver: String,

    /// Subject of the summary.
    #[serde(default = "default_summary_subject")]
    pub subject: String,
}

const fn default_imap_port() -> u16 {
    993
}

fn default_folder() -> String {
    "INBOX".to_string()
}

fn default_webdriver_url() -> String {
    "http://localhost:9515".to_string()
}

fn default_browser() -> String {
    "MicrosoftEdge".to_string()
}

const fn default_true() -> bool {
    true
}

const fn default_wait_timeout_secs() -> u64 {
    10
}

fn default_smtp_host() -> String {
    "smtp.gmail.com".to_string()
}

const fn default_smtp_port() -> u16 {
    465
}

fn default_summary_subject() -> String {
    DEFAULT_SUMMARY_SUBJECT.to_string()
}

/// Secrets resolved from the environment at startup.
#[derive(Debug)]
pub struct Credentials {
    /// Mailbox password.
    pub mailbox_password: SecretString,

    /// Portal account password.
    pub portal_password: SecretString,

    /// Summary sender password.
    pub sender_password: SecretString,
}

impl RollcallConfig {
    /// Load configuration from a TOML file and validate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The TOML is invalid or a required key is missing
    /// - A required value is empty
    /// - A URL does not parse
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML. Contains no secrets.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Checks that every required value is present and well formed.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("uid_log", self.uid_log.as_os_str().to_string_lossy()),
            ("log_dir", self.log_dir.as_os_str().to_string_lossy()),
            ("mailbox.host", self.mailbox.host.as_str().into()),
            ("mailbox.username", self.mailbox.username.as_str().into()),
            ("mailbox.password_env", self.mailbox.password_env.as_str().into()),
            ("mailbox.subject", self.mailbox.subject.as_str().into()),
            ("mailbox.folder", self.mailbox.folder.as_str().into()),
            ("portal.account_email", self.portal.account_email.as_str().into()),
            (
                "portal.account_password_env",
                self.portal.account_password_env.as_str().into(),
            ),
            ("portal.browser", self.portal.browser.as_str().into()),
            ("report.smtp_host", self.report.smtp_host.as_str().into()),
            ("report.sender", self.report.sender.as_str().into()),
            (
                "report.sender_password_env",
                self.report.sender_password_env.as_str().into(),
            ),
            ("report.receiver", self.report.receiver.as_str().into()),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Validation(format!("{field} must not be empty")));
            }
        }

        for (field, value) in [
            ("portal.login_url", &self.portal.login_url),
            ("portal.users_url", &self.portal.users_url),
            ("portal.webdriver_url", &self.portal.webdriver_url),
        ] {
            reqwest::Url::parse(value).map_err(|error| {
                ConfigError::Validation(format!("{field} is not a valid URL: {error}"))
            })?;
        }

        if self.mailbox.port == 0 || self.report.smtp_port == 0 {
            return Err(ConfigError::Validation(
                "mailbox.port and report.smtp_port must be non-zero".to_string(),
            ));
        }
        if self.portal.wait_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "portal.wait_timeout_secs must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Resolves every password from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingSecret`] for the first variable that is
    /// unset or empty.
    pub fn resolve_credentials(&self) -> Result<Credentials, ConfigError> {
        self.resolve_credentials_with(|name| std::env::var(name).ok())
    }

    /// Resolves every password through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingSecret`] for the first variable that
    /// `lookup` cannot provide.
    pub fn resolve_credentials_with<F>(&self, lookup: F) -> Result<Credentials, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let resolve = |field: &str, env: &str| -> Result<SecretString, ConfigError> {
            lookup(env)
                .filter(|value| !value.trim().is_empty())
                .map(SecretString::from)
                .ok_or_else(|| ConfigError::MissingSecret {
                    field: field.to_string(),
                    env: env.to_string(),
                })
        };

        Ok(Credentials {
            mailbox_password: resolve("mailbox.password_env", &self.mailbox.password_env)?,
            portal_password: resolve("portal.account_password_env", &self.portal.account_password_env)?,
            sender_password: resolve("report.sender_password_env", &self.report.sender_password_env)?,
        })
    }
}

/// Configuration errors. All of them are fatal before a run starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),

    /// A secret environment variable is unset or empty.
    #[error("secret for {field} is missing: environment variable {env} is not set")]
    MissingSecret {
        /// Configuration field naming the variable.
        field: String,
        /// The environment variable.
        env: String,
    },
}
