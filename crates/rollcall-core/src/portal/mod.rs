//! Staff portal actuation.
//!
//! The provisioning workflow never touches a browser directly. It drives the
//! portal through the [`PortalActuator`] capability trait:
//!
//! ```text
//! PortalActuator (trait)
//!     |
//!     +-- WebDriverPortal
//!     |       W3C WebDriver session against the live portal pages.
//!     |
//!     +-- FakePortal (for testing)
//!             In-memory row table with failure injection.
//! ```
//!
//! Every operation that waits for the UI is bounded by a fixed timeout (see
//! [`Waiter`]). Exceeding it is a recoverable [`ActuationError::Timeout`],
//! never a hang.

use std::fmt;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

#[cfg(test)]
mod driver_stub;
pub mod fake;
pub mod wait;
pub mod webdriver;

pub use fake::FakePortal;
pub use wait::Waiter;
pub use webdriver::{WebDriverLauncher, WebDriverPortal};

/// One of the three per-user permission controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PermissionFlag {
    /// Analytics access.
    Analytics,
    /// SEN access (the portal calls this control "provision map").
    Sen,
    /// Detentions access.
    Detentions,
}

impl PermissionFlag {
    /// All flags in the order they are reconciled.
    pub const ALL: [Self; 3] = [Self::Analytics, Self::Sen, Self::Detentions];

    /// Prefix of the control's DOM id (`<prefix>-<row id>`).
    #[must_use]
    pub const fn control_prefix(self) -> &'static str {
        match self {
            Self::Analytics => "analytics",
            Self::Sen => "provisionmap",
            Self::Detentions => "detentions",
        }
    }

    /// Human-readable label used in logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Analytics => "Analytics",
            Self::Sen => "SEN",
            Self::Detentions => "Detentions",
        }
    }

    /// DOM id of this control on the given row.
    #[must_use]
    pub fn control_id(self, row: &RowHandle) -> String {
        format!("{}-{}", self.control_prefix(), row.id())
    }
}

impl fmt::Display for PermissionFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Opaque reference to a located user row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowHandle {
    id: String,
}

impl RowHandle {
    /// Creates a handle from the row's per-user id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Parses the per-user id out of a row element id of the form
    /// `teacher-<id>`.
    #[must_use]
    pub fn from_row_element_id(element_id: &str) -> Option<Self> {
        element_id
            .strip_prefix("teacher-")
            .and_then(|rest| rest.split('-').next())
            .filter(|id| !id.is_empty())
            .map(Self::new)
    }

    /// The per-user id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// DOM id of the row's email input.
    #[must_use]
    pub fn email_input_id(&self) -> String {
        format!("email-{}", self.id)
    }
}

impl fmt::Display for RowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Portal account used to log in.
#[derive(Debug)]
pub struct PortalCredentials {
    /// Login email.
    pub email: String,
    /// Login password.
    pub password: SecretString,
}

/// Errors raised while driving the portal UI.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ActuationError {
    /// A bounded wait elapsed before the target became ready.
    #[error("timed out after {:.1}s waiting for {target}", .waited.as_secs_f32())]
    Timeout {
        /// What was being waited for.
        target: String,
        /// How long the wait lasted.
        waited: Duration,
    },

    /// The target element does not exist.
    #[error("no such element: {target}")]
    NoSuchElement {
        /// The element that was looked up.
        target: String,
    },

    /// The browser session is gone; no further actuation is possible.
    #[error("browser session lost: {reason}")]
    SessionLost {
        /// Driver-reported reason.
        reason: String,
    },

    /// The driver rejected a command.
    #[error("webdriver error {error}: {message}")]
    Driver {
        /// W3C error code.
        error: String,
        /// Driver message.
        message: String,
    },

    /// The driver endpoint could not be reached.
    #[error("webdriver transport failed: {message}")]
    Http {
        /// HTTP status, when a response arrived.
        status: Option<u16>,
        /// Error details.
        message: String,
    },

    /// The driver answered with something unexpected.
    #[error("unexpected webdriver response: {0}")]
    Protocol(String),
}

impl ActuationError {
    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(target: impl Into<String>, waited: Duration) -> Self {
        Self::Timeout {
            target: target.into(),
            waited,
        }
    }

    /// Creates a missing element error.
    #[must_use]
    pub fn no_such_element(target: impl Into<String>) -> Self {
        Self::NoSuchElement {
            target: target.into(),
        }
    }

    /// Returns `true` if the browser session can no longer be used.
    ///
    /// After such an error the remaining records of a run cannot be
    /// processed and the run is aborted.
    #[must_use]
    pub const fn is_session_fatal(&self) -> bool {
        matches!(self, Self::SessionLost { .. } | Self::Http { .. })
    }
}

/// Login failed or never completed.
#[derive(Debug, thiserror::Error)]
pub enum AuthenticationError {
    /// The login form or the post-login page never appeared.
    #[error("login did not complete: {0}")]
    NotCompleted(#[source] ActuationError),

    /// The portal stayed on the login page.
    #[error("login rejected for {account}")]
    Rejected {
        /// The account that attempted to log in.
        account: String,
    },
}

/// UI capabilities required by the provisioning workflow.
///
/// Implementations own a single, non-shareable UI session; every method
/// takes `&mut self`.
pub trait PortalActuator {
    /// Logs in and waits (bounded) for the post-login state.
    fn authenticate(&mut self, credentials: &PortalCredentials) -> Result<(), AuthenticationError>;

    /// Navigates to the page listing all provisionable users.
    fn open_user_management_view(&mut self) -> Result<(), ActuationError>;

    /// Locates the row for `full_name`. Returns `Ok(None)` when no row
    /// matches within the bounded search.
    fn find_user_row(&mut self, full_name: &str) -> Result<Option<RowHandle>, ActuationError>;

    /// Clears the row's email input and types `email`.
    fn set_email_field(&mut self, row: &RowHandle, email: &str) -> Result<(), ActuationError>;

    /// Reads the current state of a permission control.
    fn permission_state(
        &mut self,
        row: &RowHandle,
        flag: PermissionFlag,
    ) -> Result<bool, ActuationError>;

    /// Activates a permission control once, flipping its state.
    fn toggle_permission(&mut self, row: &RowHandle, flag: PermissionFlag)
    -> Result<(), ActuationError>;

    /// Opens the row menu, chooses "set password" and confirms the dialog.
    fn trigger_password_reset(&mut self, row: &RowHandle) -> Result<(), ActuationError>;

    /// Ends the UI session. Best effort; safe to call more than once.
    fn release(&mut self) -> Result<(), ActuationError>;

    /// Brings a permission control to `desired`.
    ///
    /// No-op when the control already matches; otherwise a single toggle.
    /// Returns whether a toggle was issued.
    fn set_permission_state(
        &mut self,
        row: &RowHandle,
        flag: PermissionFlag,
        desired: bool,
    ) -> Result<bool, ActuationError> {
        if self.permission_state(row, flag)? == desired {
            return Ok(false);
        }
        self.toggle_permission(row, flag)?;
        Ok(true)
    }
}

impl<P: PortalActuator + ?Sized> PortalActuator for Box<P> {
    fn authenticate(&mut self, credentials: &PortalCredentials) -> Result<(), AuthenticationError> {
        (**self).authenticate(credentials)
    }

    fn open_user_management_view(&mut self) -> Result<(), ActuationError> {
        (**self).open_user_management_view()
    }

    fn find_user_row(&mut self, full_name: &str) -> Result<Option<RowHandle>, ActuationError> {
        (**self).find_user_row(full_name)
    }

    fn set_email_field(&mut self, row: &RowHandle, email: &str) -> Result<(), ActuationError> {
        (**self).set_email_field(row, email)
    }

    fn permission_state(
        &mut self,
        row: &RowHandle,
        flag: PermissionFlag,
    ) -> Result<bool, ActuationError> {
        (**self).permission_state(row, flag)
    }

    fn toggle_permission(
        &mut self,
        row: &RowHandle,
        flag: PermissionFlag,
    ) -> Result<(), ActuationError> {
        (**self).toggle_permission(row, flag)
    }

    fn trigger_password_reset(&mut self, row: &RowHandle) -> Result<(), ActuationError> {
        (**self).trigger_password_reset(row)
    }

    fn release(&mut self) -> Result<(), ActuationError> {
        (**self).release()
    }
}

/// Opens a fresh portal session for a run.
pub trait PortalLauncher {
    /// The session type produced.
    type Portal: PortalActuator;

    /// Acquires the UI session (e.g. spawns the driver and a browser).
    fn launch(&self) -> Result<Self::Portal, ActuationError>;
}
