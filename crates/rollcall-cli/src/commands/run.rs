//! `rollcall run`: one ingestion-and-provisioning pass.

use std::path::Path;

use anyhow::{Context, Result};
use rollcall_core::mailbox::{ImapConnector, MailboxReader};
use rollcall_core::portal::{PortalCredentials, WebDriverLauncher};
use rollcall_core::report::{RunEnvironment, SmtpMailSender, SummaryReporter};
use rollcall_core::{FileUidStore, run_once};

use super::load_config;
use crate::logging;

/// Runs the pipeline once.
///
/// Configuration, secrets, logging and the UID log must be usable before
/// anything else happens; failures there are returned. Everything after that
/// is reported through logs and the summary email.
pub fn run(config_path: &Path, log_level: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let log_path = logging::init_run(log_level, &config.log_dir)?;
    let credentials = config
        .resolve_credentials()
        .context("failed to resolve credentials")?;
    let store = FileUidStore::open(&config.uid_log)
        .with_context(|| format!("failed to open uid log {}", config.uid_log.display()))?;

    let reader = MailboxReader::new(
        ImapConnector::new(&config.mailbox, credentials.mailbox_password),
        store,
    );
    let launcher = WebDriverLauncher::new(config.portal.clone());
    let portal_credentials = PortalCredentials {
        email: config.portal.account_email.clone(),
        password: credentials.portal_password,
    };
    let reporter = SummaryReporter::new(
        SmtpMailSender::new(&config.report, credentials.sender_password),
        &config.report,
        RunEnvironment::detect(env!("CARGO_BIN_NAME"), log_path.clone()),
    );

    let report = run_once(
        &reader,
        &config.mailbox.subject,
        &launcher,
        &portal_credentials,
        &reporter,
    );

    match &report.summary {
        Some(summary) => println!(
            "{} record(s): {} succeeded, {} failed, summary {}",
            report.records,
            summary.succeeded().count(),
            summary.failed().count(),
            if report.summary_sent { "sent" } else { "not sent" },
        ),
        None => println!("No users found in the email to process."),
    }
    println!("Log file: {}", log_path.display());
    Ok(())
}
