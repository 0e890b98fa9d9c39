//! In-memory portal for tests.
//!
//! Clones of a [`FakePortal`] share one row table, so a test can hand a
//! clone to the runner (through [`PortalLauncher`]) and inspect the final
//! state afterwards.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use secrecy::ExposeSecret;

use super::{
    ActuationError, AuthenticationError, PermissionFlag, PortalActuator, PortalCredentials,
    PortalLauncher, RowHandle,
};

/// One user row of the fake user-management page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeRow {
    /// Per-user id.
    pub id: String,
    /// Name shown in the row.
    pub name: String,
    /// Email input contents.
    pub email: String,
    /// Analytics control state.
    pub analytics: bool,
    /// SEN control state.
    pub sen: bool,
    /// Detentions control state.
    pub detentions: bool,
}

impl FakeRow {
    fn flag_mut(&mut self, flag: PermissionFlag) -> &mut bool {
        match flag {
            PermissionFlag::Analytics => &mut self.analytics,
            PermissionFlag::Sen => &mut self.sen,
            PermissionFlag::Detentions => &mut self.detentions,
        }
    }

    /// Current state of `flag`.
    #[must_use]
    pub const fn flag(&self, flag: PermissionFlag) -> bool {
        match flag {
            PermissionFlag::Analytics => self.analytics,
            PermissionFlag::Sen => self.sen,
            PermissionFlag::Detentions => self.detentions,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    rows: Vec<FakeRow>,
    accepted_password: Option<String>,
    reject_login: bool,
    refuse_launch: bool,
    authenticated: bool,
    launches: usize,
    view_opened: usize,
    lookups: usize,
    lose_session_after: Option<usize>,
    session_lost: bool,
    failing_lookups: HashSet<String>,
    blocked_controls: HashSet<(String, PermissionFlag)>,
    failing_resets: HashSet<String>,
    toggles: usize,
    resets: Vec<String>,
    releases: usize,
}

impl State {
    fn ensure_session(&self) -> Result<(), ActuationError> {
        if self.session_lost {
            return Err(ActuationError::SessionLost {
                reason: "browser window closed".to_string(),
            });
        }
        Ok(())
    }

    fn row_mut(&mut self, row: &RowHandle) -> Result<&mut FakeRow, ActuationError> {
        self.rows
            .iter_mut()
            .find(|candidate| candidate.id == row.id())
            .ok_or_else(|| ActuationError::no_such_element(format!("teacher-{row}")))
    }
}

/// Scripted portal with a row table and failure injection.
#[derive(Debug, Clone, Default)]
pub struct FakePortal {
    state: Arc<Mutex<State>>,
}

impl FakePortal {
    /// Creates an empty portal that accepts any login.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn configure(self, update: impl FnOnce(&mut State)) -> Self {
        update(&mut self.state());
        self
    }

    /// Adds a row with all three permissions disabled.
    #[must_use]
    pub fn with_row(self, id: &str, name: &str) -> Self {
        let row = FakeRow {
            id: id.to_string(),
            name: name.to_string(),
            email: String::new(),
            analytics: false,
            sen: false,
            detentions: false,
        };
        self.configure(|state| state.rows.push(row))
    }

    /// Only accepts this password at login.
    #[must_use]
    pub fn require_password(self, password: &str) -> Self {
        let password = password.to_string();
        self.configure(|state| state.accepted_password = Some(password))
    }

    /// Makes every login attempt fail.
    #[must_use]
    pub fn fail_authentication(self) -> Self {
        self.configure(|state| state.reject_login = true)
    }

    /// Makes [`PortalLauncher::launch`] fail.
    #[must_use]
    pub fn fail_launch(self) -> Self {
        self.configure(|state| state.refuse_launch = true)
    }

    /// Makes the lookup of `name` raise a driver error.
    #[must_use]
    pub fn fail_lookup_for(self, name: &str) -> Self {
        let name = name.to_string();
        self.configure(|state| {
            state.failing_lookups.insert(name);
        })
    }

    /// Makes a control on row `id` never become clickable.
    #[must_use]
    pub fn block_control(self, id: &str, flag: PermissionFlag) -> Self {
        let id = id.to_string();
        self.configure(|state| {
            state.blocked_controls.insert((id, flag));
        })
    }

    /// Makes the password reset of row `id` time out.
    #[must_use]
    pub fn fail_reset_for(self, id: &str) -> Self {
        let id = id.to_string();
        self.configure(|state| {
            state.failing_resets.insert(id);
        })
    }

    /// Loses the browser session once `lookups` row lookups have completed.
    #[must_use]
    pub fn lose_session_after(self, lookups: usize) -> Self {
        self.configure(|state| state.lose_session_after = Some(lookups))
    }

    /// Snapshot of the row with `id`.
    #[must_use]
    pub fn row(&self, id: &str) -> Option<FakeRow> {
        self.state().rows.iter().find(|row| row.id == id).cloned()
    }

    /// Whether login succeeded.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.state().authenticated
    }

    /// Number of sessions launched.
    #[must_use]
    pub fn launches(&self) -> usize {
        self.state().launches
    }

    /// How often the user-management view was opened.
    #[must_use]
    pub fn view_opened(&self) -> usize {
        self.state().view_opened
    }

    /// Number of row lookups.
    #[must_use]
    pub fn lookups(&self) -> usize {
        self.state().lookups
    }

    /// Number of toggles issued so far.
    #[must_use]
    pub fn toggles(&self) -> usize {
        self.state().toggles
    }

    /// Row ids whose password reset completed, in order.
    #[must_use]
    pub fn resets(&self) -> Vec<String> {
        self.state().resets.clone()
    }

    /// Number of `release` calls.
    #[must_use]
    pub fn releases(&self) -> usize {
        self.state().releases
    }
}

impl PortalActuator for FakePortal {
    fn authenticate(&mut self, credentials: &PortalCredentials) -> Result<(), AuthenticationError> {
        let mut state = self.state();
        state
            .ensure_session()
            .map_err(AuthenticationError::NotCompleted)?;
        let password_ok = state
            .accepted_password
            .as_deref()
            .is_none_or(|expected| expected == credentials.password.expose_secret());
        if state.reject_login || !password_ok {
            return Err(AuthenticationError::Rejected {
                account: credentials.email.clone(),
            });
        }
        state.authenticated = true;
        Ok(())
    }

    fn open_user_management_view(&mut self) -> Result<(), ActuationError> {
        let mut state = self.state();
        state.ensure_session()?;
        state.view_opened += 1;
        Ok(())
    }

    fn find_user_row(&mut self, full_name: &str) -> Result<Option<RowHandle>, ActuationError> {
        let mut state = self.state();
        state.ensure_session()?;
        state.lookups += 1;
        if state
            .lose_session_after
            .is_some_and(|limit| state.lookups > limit)
        {
            state.session_lost = true;
            state.ensure_session()?;
        }
        if state.failing_lookups.contains(full_name) {
            return Err(ActuationError::Driver {
                error: "unknown error".to_string(),
                message: format!("row lookup for {full_name} failed"),
            });
        }

        let needle = full_name.to_lowercase();
        Ok(state
            .rows
            .iter()
            .find(|row| row.name.to_lowercase().contains(&needle))
            .map(|row| RowHandle::new(row.id.clone())))
    }

    fn set_email_field(&mut self, row: &RowHandle, email: &str) -> Result<(), ActuationError> {
        let mut state = self.state();
        state.ensure_session()?;
        state.row_mut(row)?.email = email.to_string();
        Ok(())
    }

    fn permission_state(
        &mut self,
        row: &RowHandle,
        flag: PermissionFlag,
    ) -> Result<bool, ActuationError> {
        let mut state = self.state();
        state.ensure_session()?;
        Ok(state.row_mut(row)?.flag(flag))
    }

    fn toggle_permission(
        &mut self,
        row: &RowHandle,
        flag: PermissionFlag,
    ) -> Result<(), ActuationError> {
        let mut state = self.state();
        state.ensure_session()?;
        if state
            .blocked_controls
            .contains(&(row.id().to_string(), flag))
        {
            return Err(ActuationError::timeout(
                flag.control_id(row),
                Duration::from_secs(10),
            ));
        }
        let control = state.row_mut(row)?.flag_mut(flag);
        *control = !*control;
        state.toggles += 1;
        Ok(())
    }

    fn trigger_password_reset(&mut self, row: &RowHandle) -> Result<(), ActuationError> {
        let mut state = self.state();
        state.ensure_session()?;
        if state.failing_resets.contains(row.id()) {
            return Err(ActuationError::timeout(
                "change-teacher-password",
                Duration::from_secs(10),
            ));
        }
        state.row_mut(row)?;
        state.resets.push(row.id().to_string());
        Ok(())
    }

    fn release(&mut self) -> Result<(), ActuationError> {
        self.state().releases += 1;
        Ok(())
    }
}

impl PortalLauncher for FakePortal {
    type Portal = Self;

    fn launch(&self) -> Result<Self::Portal, ActuationError> {
        let mut state = self.state();
        if state.refuse_launch {
            return Err(ActuationError::Http {
                status: None,
                message: "driver not reachable".to_string(),
            });
        }
        state.launches += 1;
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;

    fn creds(password: &str) -> PortalCredentials {
        PortalCredentials {
            email: "admin@school.example".to_string(),
            password: SecretString::from(password.to_string()),
        }
    }

    #[test]
    fn test_login_checks_password() {
        let mut portal = FakePortal::new().require_password("s3cret");
        assert!(matches!(
            portal.authenticate(&creds("wrong")),
            Err(AuthenticationError::Rejected { .. })
        ));
        portal.authenticate(&creds("s3cret")).unwrap();
        assert!(portal.is_authenticated());
    }

    #[test]
    fn test_lookup_is_case_insensitive_substring() {
        let mut portal = FakePortal::new().with_row("12", "Mrs JANE DOE");
        assert_eq!(
            portal.find_user_row("Jane Doe").unwrap(),
            Some(RowHandle::new("12"))
        );
        assert_eq!(portal.find_user_row("John Roe").unwrap(), None);
    }

    #[test]
    fn test_blocked_control_times_out() {
        let mut portal = FakePortal::new()
            .with_row("12", "Jane Doe")
            .block_control("12", PermissionFlag::Sen);
        let row = RowHandle::new("12");

        portal
            .toggle_permission(&row, PermissionFlag::Analytics)
            .unwrap();
        let err = portal
            .toggle_permission(&row, PermissionFlag::Sen)
            .unwrap_err();
        assert!(matches!(err, ActuationError::Timeout { .. }));
        let snapshot = portal.row("12").unwrap();
        assert!(snapshot.analytics);
        assert!(!snapshot.sen);
    }

    #[test]
    fn test_session_loss_is_sticky() {
        let mut portal = FakePortal::new()
            .with_row("1", "Jane Doe")
            .lose_session_after(1);
        portal.find_user_row("Jane Doe").unwrap();
        assert!(
            portal
                .find_user_row("Jane Doe")
                .unwrap_err()
                .is_session_fatal()
        );
        assert!(
            portal
                .set_email_field(&RowHandle::new("1"), "x@example.com")
                .unwrap_err()
                .is_session_fatal()
        );
    }

    #[test]
    fn test_launched_clone_shares_rows() {
        let portal = FakePortal::new().with_row("5", "Ola Nowak");
        let mut session = portal.launch().unwrap();
        session
            .set_email_field(&RowHandle::new("5"), "ola@example.com")
            .unwrap();

        assert_eq!(portal.launches(), 1);
        assert_eq!(portal.row("5").unwrap().email, "ola@example.com");
    }
}
