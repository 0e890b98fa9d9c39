//! `rollcall activate`: activate one named user without reading the mailbox.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use rollcall_core::portal::{PortalCredentials, WebDriverLauncher};
use rollcall_core::report::{ActivationStatus, RunEnvironment, SmtpMailSender, SummaryReporter};
use rollcall_core::{RosterRecord, activate_one};

use super::load_config;
use crate::logging;

/// Arguments for `rollcall activate`.
#[derive(Debug, Args)]
pub struct ActivateArgs {
    /// Full name as shown on the portal
    #[arg(long)]
    pub name: String,

    /// Email address to set on the account
    #[arg(long)]
    pub email: String,

    /// Analytics permission
    #[arg(long, value_enum, default_value = "yes")]
    pub analytics: Switch,

    /// SEN (provision map) permission
    #[arg(long, value_enum, default_value = "yes")]
    pub sen: Switch,

    /// Detentions permission
    #[arg(long, value_enum, default_value = "yes")]
    pub detentions: Switch,
}

/// A yes/no permission value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Switch {
    /// Enabled.
    #[default]
    Yes,
    /// Disabled.
    No,
}

impl Switch {
    const fn enabled(self) -> bool {
        matches!(self, Self::Yes)
    }
}

impl fmt::Display for Switch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Yes => write!(f, "yes"),
            Self::No => write!(f, "no"),
        }
    }
}

impl ActivateArgs {
    /// The roster record this invocation describes.
    pub fn record(&self) -> RosterRecord {
        RosterRecord::new(self.name.trim(), self.email.trim()).with_permissions(
            self.analytics.enabled(),
            self.sen.enabled(),
            self.detentions.enabled(),
        )
    }
}

/// Activates the user named in `args` and mails the outcome.
pub fn run(config_path: &Path, log_level: &str, args: &ActivateArgs) -> Result<()> {
    let config = load_config(config_path)?;
    let log_path = logging::init_run(log_level, &config.log_dir)?;
    let credentials = config
        .resolve_credentials()
        .context("failed to resolve credentials")?;

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

    tracing::info!(
        analytics = %args.analytics,
        sen = %args.sen,
        detentions = %args.detentions,
        "requested permissions"
    );
    let report = activate_one(&launcher, &portal_credentials, args.record(), &reporter);

    let outcome = match report.status {
        ActivationStatus::Activated => "activated",
        ActivationStatus::NotUpdated => "not updated",
        ActivationStatus::Aborted => "not processed",
    };
    println!(
        "{}: {outcome}, summary {}",
        args.name,
        if report.summary_sent { "sent" } else { "not sent" },
    );
    println!("Log file: {}", log_path.display());
    Ok(())
}
