//! One full ingestion-and-provisioning pass.

use chrono::Local;

use crate::mailbox::{MailboxConnector, MailboxReader};
use crate::portal::{PortalActuator, PortalCredentials, PortalLauncher};
use crate::report::{ActivationStatus, MailSender, SummaryReporter};
use crate::roster::{self, RosterRecord};
use crate::uid_store::UidStore;
use crate::workflow::{ProvisioningWorkflow, RunSummary};

/// What a run did.
#[derive(Debug)]
pub struct RunReport {
    /// Roster records found.
    pub records: usize,
    /// The summary, when the roster was non-empty.
    pub summary: Option<RunSummary>,
    /// Whether the summary was delivered.
    pub summary_sent: bool,
}

impl RunReport {
    const fn idle() -> Self {
        Self {
            records: 0,
            summary: None,
            summary_sent: false,
        }
    }
}

/// What a single-user activation did.
#[derive(Debug)]
pub struct ActivationReport {
    /// How the activation ended.
    pub status: ActivationStatus,
    /// The summary that was mailed.
    pub summary: RunSummary,
    /// Whether the summary was delivered.
    pub summary_sent: bool,
}

/// Runs the pipeline once: mailbox, roster, portal, summary.
///
/// The browser is only launched when the roster has records, and a summary
/// is sent exactly once in that case, including when the portal could not
/// be launched or the run was aborted part-way. An empty roster sends
/// nothing.
pub fn run_once<C, S, L, M>(
    reader: &MailboxReader<C, S>,
    subject: &str,
    launcher: &L,
    credentials: &PortalCredentials,
    reporter: &SummaryReporter<M>,
) -> RunReport
where
    C: MailboxConnector,
    S: UidStore,
    L: PortalLauncher,
    M: MailSender,
{
    let started_at = Local::now();
    tracing::info!(started_at = %started_at.format("%H:%M:%S"), "run started");

    let records = reader
        .fetch_unprocessed_roster_text(subject)
        .map(|text| roster::parse(&text))
        .unwrap_or_default();
    if records.is_empty() {
        tracing::info!("no users found in the email to process, no action taken");
        return RunReport::idle();
    }

    let mut summary = RunSummary::new(started_at);
    provision(launcher, credentials, &records, &mut summary);

    let summary_sent = reporter.send(&summary);
    RunReport {
        records: records.len(),
        summary: Some(summary),
        summary_sent,
    }
}

/// Activates one named user, bypassing the mailbox.
///
/// The summary subject reports whether the user was activated, could not be
/// updated, or was never reached because the browser session failed.
pub fn activate_one<L, M>(
    launcher: &L,
    credentials: &PortalCredentials,
    record: RosterRecord,
    reporter: &SummaryReporter<M>,
) -> ActivationReport
where
    L: PortalLauncher,
    M: MailSender,
{
    let started_at = Local::now();
    tracing::info!(
        started_at = %started_at.format("%H:%M:%S"),
        user = %record.full_name,
        "activation started"
    );

    let mut summary = RunSummary::new(started_at);
    let completed = provision(launcher, credentials, std::slice::from_ref(&record), &mut summary);

    let status = if !completed {
        ActivationStatus::Aborted
    } else if summary.succeeded().next().is_some() {
        ActivationStatus::Activated
    } else {
        ActivationStatus::NotUpdated
    };

    let summary_sent = reporter.send_activation(&summary, &record.full_name, status);
    ActivationReport {
        status,
        summary,
        summary_sent,
    }
}

/// Launches the portal, provisions `records` and finishes `summary`.
///
/// Returns `false` when the run was aborted before every record was
/// handled. Records never attempted are named in the summary's errors.
fn provision<L: PortalLauncher>(
    launcher: &L,
    credentials: &PortalCredentials,
    records: &[RosterRecord],
    summary: &mut RunSummary,
) -> bool {
    let mut completed = false;
    match launcher.launch() {
        Ok(mut portal) => {
            match ProvisioningWorkflow::new(&mut portal).run(credentials, records, summary) {
                Ok(()) => completed = true,
                Err(error) => {
                    tracing::error!(%error, "run aborted");
                    summary.push_error(format!("General WebDriver error: {error}"));
                },
            }
            if let Err(error) = portal.release() {
                tracing::warn!(%error, "failed to release browser session");
            }
        },
        Err(error) => {
            tracing::error!(%error, "failed to start browser session");
            summary.push_error(format!("General WebDriver error: {error}"));
        },
    }

    // Outcomes follow roster order, so the tail was never attempted.
    let not_attempted = records.get(summary.outcomes().len()..).unwrap_or_default();
    if !not_attempted.is_empty() {
        summary.push_error(format!("{} user(s) were not processed.", not_attempted.len()));
        for record in not_attempted {
            summary.push_error(format!(
                "Not processed: {} <{}>",
                record.full_name, record.email
            ));
        }
    }

    let finished_at = Local::now();
    summary.finish(finished_at);
    tracing::info!(
        finished_at = %finished_at.format("%H:%M:%S"),
        succeeded = summary.succeeded().count(),
        failed = summary.failed().count(),
        "run finished"
    );
    completed
}
