//! # rollcall-core
//!
//! Bulk activation of staff accounts on a school portal.
//!
//! A run reads the newest unprocessed roster email, parses one staff member
//! per row, and drives the portal's user-management page to enter each
//! person's email address, set three permission flags and trigger a
//! password-reset email. The outcome of every record is mailed as a summary.
//!
//! ## Pipeline
//!
//! - [`mailbox::MailboxReader`]: newest-first scan of the roster mailbox,
//!   gated by a [`uid_store::UidStore`] so every message is acted upon once
//! - [`roster::parse`]: free-text rows to [`RosterRecord`]s
//! - [`workflow::ProvisioningWorkflow`]: per-record state machine against a
//!   [`portal::PortalActuator`]
//! - [`report::SummaryReporter`]: one plain-text summary per non-empty run
//! - [`runner::run_once`]: wires the above together
//! - [`runner::activate_one`]: one named user, without the mailbox
//!
//! ## Example
//!
//! ```rust
//! use chrono::Local;
//! use rollcall_core::portal::{FakePortal, PortalCredentials};
//! use rollcall_core::workflow::{ProvisioningWorkflow, RunSummary};
//! use rollcall_core::roster;
//! use secrecy::SecretString;
//!
//! let records = roster::parse("Jane, Doe, Maths, Teacher, jane.doe@example.com");
//! let mut portal = FakePortal::new().with_row("42", "Jane Doe");
//! let credentials = PortalCredentials {
//!     email: "admin@school.example".to_string(),
//!     password: SecretString::from("hunter2".to_string()),
//! };
//!
//! let mut summary = RunSummary::new(Local::now());
//! ProvisioningWorkflow::new(&mut portal)
//!     .run(&credentials, &records, &mut summary)
//!     .unwrap();
//!
//! assert_eq!(summary.succeeded().count(), 1);
//! assert_eq!(portal.row("42").unwrap().email, "jane.doe@example.com");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod mailbox;
pub mod portal;
pub mod report;
pub mod roster;
pub mod runner;
pub mod uid_store;
pub mod workflow;

pub use config::{ConfigError, Credentials, RollcallConfig};
pub use mailbox::{MailboxError, MailboxReader};
pub use portal::{ActuationError, AuthenticationError, PortalActuator, PortalLauncher};
pub use report::{ReportingError, SummaryReporter};
pub use roster::RosterRecord;
pub use runner::{ActivationReport, RunReport, activate_one, run_once};
pub use uid_store::{FileUidStore, UidStore, UidStoreError};
pub use workflow::{ProvisioningOutcome, ProvisioningWorkflow, RunSummary};
