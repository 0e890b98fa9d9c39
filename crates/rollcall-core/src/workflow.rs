//! Per-record provisioning against the portal.
//!
//! Each roster record walks a small state machine:
//!
//! ```text
//! Pending --> Located --> FieldsUpdated --> PasswordTriggered --> Done
//!    |           |             |                                  ^
//!    |           |             +----------------------------------+
//!    |           |               (reset failed, still succeeded)
//!    v           v
//! NotFound     Error
//! ```
//!
//! # Failure isolation
//!
//! A failure while provisioning one record becomes that record's
//! [`ProvisioningOutcome::Error`] and the loop moves on. Only run-level
//! failures stop the loop: authentication, opening the user view, or a
//! lost browser session. Outcomes gathered before the abort are kept in
//! the [`RunSummary`].

use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::portal::{
    ActuationError, AuthenticationError, PermissionFlag, PortalActuator, PortalCredentials,
    RowHandle,
};
use crate::roster::RosterRecord;

/// Lifecycle of a single record within a run.
///
/// # Terminal States
///
/// `Done`, `NotFound` and `Error` are terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum RecordState {
    /// Not yet looked up.
    #[default]
    Pending,

    /// The portal row was found.
    Located,

    /// Email and permission flags match the record.
    FieldsUpdated,

    /// The password reset dialog was confirmed.
    PasswordTriggered,

    /// Provisioning finished (terminal).
    Done,

    /// No portal row matched (terminal).
    NotFound,

    /// Provisioning failed (terminal).
    Error,
}

impl RecordState {
    /// Returns `true` if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::NotFound | Self::Error)
    }

    /// Returns the state as a string identifier.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Located => "located",
            Self::FieldsUpdated => "fields_updated",
            Self::PasswordTriggered => "password_triggered",
            Self::Done => "done",
            Self::NotFound => "not_found",
            Self::Error => "error",
        }
    }

    /// Returns the valid transitions from this state.
    #[must_use]
    pub const fn valid_transitions(&self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::Located, Self::NotFound, Self::Error],
            Self::Located => &[Self::FieldsUpdated, Self::Error],
            Self::FieldsUpdated => &[Self::PasswordTriggered, Self::Done, Self::Error],
            Self::PasswordTriggered => &[Self::Done],
            Self::Done | Self::NotFound | Self::Error => &[],
        }
    }

    /// Returns `true` if transitioning to `target` is valid from this state.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        self.valid_transitions().contains(&target)
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Final result for one roster record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningOutcome {
    /// Email and flags were applied.
    Succeeded(RosterRecord),

    /// No matching portal row.
    NotFound(RosterRecord),

    /// Provisioning failed part-way.
    Error {
        /// The record being provisioned.
        record: RosterRecord,
        /// Rendered cause.
        cause: String,
    },
}

impl ProvisioningOutcome {
    /// The record this outcome belongs to.
    #[must_use]
    pub const fn record(&self) -> &RosterRecord {
        match self {
            Self::Succeeded(record) | Self::NotFound(record) | Self::Error { record, .. } => record,
        }
    }

    /// Returns `true` for [`ProvisioningOutcome::Succeeded`].
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    /// The terminal state matching this outcome.
    #[must_use]
    pub const fn state(&self) -> RecordState {
        match self {
            Self::Succeeded(_) => RecordState::Done,
            Self::NotFound(_) => RecordState::NotFound,
            Self::Error { .. } => RecordState::Error,
        }
    }
}

/// Run-scoped accumulator handed to the summary reporter.
#[derive(Debug, Clone)]
pub struct RunSummary {
    started_at: DateTime<Local>,
    finished_at: Option<DateTime<Local>>,
    outcomes: Vec<ProvisioningOutcome>,
    errors: Vec<String>,
}

impl RunSummary {
    /// Starts a summary for a run that began at `started_at`.
    #[must_use]
    pub const fn new(started_at: DateTime<Local>) -> Self {
        Self {
            started_at,
            finished_at: None,
            outcomes: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Appends a record outcome.
    pub fn push_outcome(&mut self, outcome: ProvisioningOutcome) {
        self.outcomes.push(outcome);
    }

    /// Appends a general (non-record) error line.
    pub fn push_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    /// Stamps the end of the run.
    pub fn finish(&mut self, finished_at: DateTime<Local>) {
        self.finished_at = Some(finished_at);
    }

    /// Run start.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    /// Run end; the start time until [`RunSummary::finish`] is called.
    #[must_use]
    pub fn finished_at(&self) -> DateTime<Local> {
        self.finished_at.unwrap_or(self.started_at)
    }

    /// All outcomes in processing order.
    #[must_use]
    pub fn outcomes(&self) -> &[ProvisioningOutcome] {
        &self.outcomes
    }

    /// General errors in the order they occurred.
    #[must_use]
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Records that were provisioned.
    pub fn succeeded(&self) -> impl Iterator<Item = &RosterRecord> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.is_success())
            .map(ProvisioningOutcome::record)
    }

    /// Records that were not found or failed.
    pub fn failed(&self) -> impl Iterator<Item = &RosterRecord> {
        self.outcomes
            .iter()
            .filter(|outcome| !outcome.is_success())
            .map(ProvisioningOutcome::record)
    }
}

/// Failures that stop the per-record loop.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// Login failed.
    #[error(transparent)]
    Authentication(#[from] AuthenticationError),

    /// The user-management page could not be opened.
    #[error("could not open user management view: {0}")]
    UserView(#[source] ActuationError),

    /// The browser session died mid-run.
    #[error("browser session lost with {remaining} record(s) left: {source}")]
    SessionLost {
        /// Records never attempted.
        remaining: usize,
        /// The fatal error.
        #[source]
        source: ActuationError,
    },
}

/// Desired state of `flag` for `record`.
#[must_use]
pub const fn desired_permission(record: &RosterRecord, flag: PermissionFlag) -> bool {
    match flag {
        PermissionFlag::Analytics => record.analytics,
        PermissionFlag::Sen => record.sen,
        PermissionFlag::Detentions => record.detentions,
    }
}

/// Writes the email and reconciles the three permission flags on `row`.
///
/// Only mismatching flags are toggled, so a second call with the same
/// record issues no toggles. Returns the number of toggles issued.
pub fn update_fields<P: PortalActuator + ?Sized>(
    portal: &mut P,
    row: &RowHandle,
    record: &RosterRecord,
) -> Result<usize, ActuationError> {
    portal.set_email_field(row, &record.email)?;
    tracing::info!(
        row = %row,
        name = %record.full_name,
        email = %record.email,
        "email address entered"
    );

    let mut toggles = 0;
    for flag in PermissionFlag::ALL {
        let desired = desired_permission(record, flag);
        if portal.set_permission_state(row, flag, desired)? {
            toggles += 1;
            tracing::info!(row = %row, permission = %flag, enabled = desired, "permission updated");
        } else {
            tracing::debug!(row = %row, permission = %flag, enabled = desired, "permission already set");
        }
    }
    Ok(toggles)
}

fn advance(state: &mut RecordState, next: RecordState, record: &RosterRecord) {
    debug_assert!(
        state.can_transition_to(next),
        "invalid record transition {state} -> {next}"
    );
    tracing::debug!(name = %record.full_name, from = %state, to = %next, "record state");
    *state = next;
}

/// Drives the portal through a list of roster records.
pub struct ProvisioningWorkflow<'a, P: ?Sized> {
    portal: &'a mut P,
}

impl<'a, P: PortalActuator + ?Sized> ProvisioningWorkflow<'a, P> {
    /// Creates a workflow over an open portal session.
    pub const fn new(portal: &'a mut P) -> Self {
        Self { portal }
    }

    /// Logs in once, opens the user view once, then provisions every record
    /// in order, appending outcomes to `summary`.
    ///
    /// # Errors
    ///
    /// Returns a [`WorkflowError`] when the run cannot continue. Outcomes
    /// recorded before that point stay in `summary`.
    pub fn run(
        &mut self,
        credentials: &PortalCredentials,
        records: &[RosterRecord],
        summary: &mut RunSummary,
    ) -> Result<(), WorkflowError> {
        self.portal.authenticate(credentials)?;
        self.portal
            .open_user_management_view()
            .map_err(WorkflowError::UserView)?;

        for (index, record) in records.iter().enumerate() {
            tracing::info!(name = %record.full_name, email = %record.email, "processing user");

            let mut state = RecordState::Pending;
            match self.provision(record, &mut state, summary) {
                Ok(outcome) => summary.push_outcome(outcome),
                Err(error) => {
                    advance(&mut state, RecordState::Error, record);
                    tracing::error!(name = %record.full_name, %error, "error processing user");
                    summary.push_outcome(ProvisioningOutcome::Error {
                        record: record.clone(),
                        cause: error.to_string(),
                    });
                    if error.is_session_fatal() {
                        return Err(WorkflowError::SessionLost {
                            remaining: records.len() - index - 1,
                            source: error,
                        });
                    }
                },
            }
        }
        Ok(())
    }

    fn provision(
        &mut self,
        record: &RosterRecord,
        state: &mut RecordState,
        summary: &mut RunSummary,
    ) -> Result<ProvisioningOutcome, ActuationError> {
        let Some(row) = self.portal.find_user_row(&record.full_name)? else {
            advance(state, RecordState::NotFound, record);
            tracing::info!(name = %record.full_name, "user not found in the portal");
            return Ok(ProvisioningOutcome::NotFound(record.clone()));
        };
        advance(state, RecordState::Located, record);

        update_fields(&mut *self.portal, &row, record)?;
        advance(state, RecordState::FieldsUpdated, record);

        match self.portal.trigger_password_reset(&row) {
            Ok(()) => {
                advance(state, RecordState::PasswordTriggered, record);
                tracing::info!(email = %record.email, "password reset email sent");
            },
            Err(error) => {
                tracing::error!(name = %record.full_name, %error, "password reset failed");
                summary.push_error(format!(
                    "Password reset failed for {}: {error}",
                    record.full_name
                ));
            },
        }

        advance(state, RecordState::Done, record);
        tracing::info!(name = %record.full_name, "successfully processed user");
        Ok(ProvisioningOutcome::Succeeded(record.clone()))
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;
    use crate::portal::FakePortal;

    fn credentials() -> PortalCredentials {
        PortalCredentials {
            email: "admin@school.example".to_string(),
            password: SecretString::from("pw".to_string()),
        }
    }

    fn summary() -> RunSummary {
        RunSummary::new(Local::now())
    }

    #[test]
    fn test_terminal_states_have_no_transitions() {
        for state in [RecordState::Done, RecordState::NotFound, RecordState::Error] {
            assert!(state.is_terminal());
            assert!(state.valid_transitions().is_empty());
        }
        assert!(RecordState::FieldsUpdated.can_transition_to(RecordState::Done));
        assert!(!RecordState::Pending.can_transition_to(RecordState::Done));
    }

    #[test]
    fn test_found_record_succeeds_and_applies_fields() {
        let mut portal = FakePortal::new().with_row("7", "Jane Doe");
        let records = vec![
            RosterRecord::new("Jane Doe", "jane.doe@example.com").with_permissions(true, false, true),
        ];
        let mut summary = summary();

        ProvisioningWorkflow::new(&mut portal)
            .run(&credentials(), &records, &mut summary)
            .unwrap();

        assert_eq!(
            summary.outcomes(),
            &[ProvisioningOutcome::Succeeded(records[0].clone())]
        );
        let row = portal.row("7").unwrap();
        assert_eq!(row.email, "jane.doe@example.com");
        assert!(row.analytics && !row.sen && row.detentions);
        assert_eq!(portal.toggles(), 2);
        assert_eq!(portal.resets(), ["7"]);
        assert_eq!(portal.view_opened(), 1);
    }

    #[test]
    fn test_missing_row_is_not_found() {
        let mut portal = FakePortal::new().with_row("7", "Jane Doe");
        let records = vec![RosterRecord::new("John Roe", "john@example.com")];
        let mut summary = summary();

        ProvisioningWorkflow::new(&mut portal)
            .run(&credentials(), &records, &mut summary)
            .unwrap();

        assert_eq!(summary.outcomes()[0].state(), RecordState::NotFound);
        assert_eq!(summary.failed().count(), 1);
        assert_eq!(portal.toggles(), 0);
    }

    #[test]
    fn test_reset_failure_keeps_success_and_logs_error() {
        let mut portal = FakePortal::new()
            .with_row("7", "Jane Doe")
            .fail_reset_for("7");
        let records = vec![RosterRecord::new("Jane Doe", "jane.doe@example.com")];
        let mut summary = summary();

        ProvisioningWorkflow::new(&mut portal)
            .run(&credentials(), &records, &mut summary)
            .unwrap();

        assert!(summary.outcomes()[0].is_success());
        assert_eq!(summary.errors().len(), 1);
        assert!(summary.errors()[0].starts_with("Password reset failed for Jane Doe"));
    }

    #[test]
    fn test_blocked_control_is_bounded_error() {
        let mut portal = FakePortal::new()
            .with_row("7", "Jane Doe")
            .block_control("7", PermissionFlag::Detentions);
        let records = vec![RosterRecord::new("Jane Doe", "jane.doe@example.com")];
        let mut summary = summary();

        ProvisioningWorkflow::new(&mut portal)
            .run(&credentials(), &records, &mut summary)
            .unwrap();

        match &summary.outcomes()[0] {
            ProvisioningOutcome::Error { cause, .. } => assert!(cause.contains("detentions-7")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(portal.resets().is_empty());
    }

    #[test]
    fn test_authentication_failure_aborts_before_records() {
        let mut portal = FakePortal::new()
            .with_row("7", "Jane Doe")
            .fail_authentication();
        let records = vec![RosterRecord::new("Jane Doe", "jane.doe@example.com")];
        let mut summary = summary();

        let err = ProvisioningWorkflow::new(&mut portal)
            .run(&credentials(), &records, &mut summary)
            .unwrap_err();

        assert!(matches!(err, WorkflowError::Authentication(_)));
        assert!(summary.outcomes().is_empty());
        assert_eq!(portal.view_opened(), 0);
    }

    #[test]
    fn test_update_fields_reports_toggles() {
        let mut portal = FakePortal::new().with_row("3", "Ola Nowak");
        let row = RowHandle::new("3");
        let record = RosterRecord::new("Ola Nowak", "ola@example.com");

        assert_eq!(update_fields(&mut portal, &row, &record).unwrap(), 3);
        assert_eq!(update_fields(&mut portal, &row, &record).unwrap(), 0);
    }
}
