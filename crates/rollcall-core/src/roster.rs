//! Roster parsing.
//!
//! A roster email lists one new staff member per row as free text:
//!
//! ```text
//! Jane, Doe, Maths, Teacher, jane.doe@example.com
//! Sam, O'Neil, Science, TA, sam.oneil@example.com, yes, no, yes
//! ```
//!
//! Every row matching the pattern becomes a [`RosterRecord`]; everything else
//! is ignored. The two fields between the last name and the email are not
//! used. A row may end with three explicit `yes`/`no` permission columns
//! (analytics, SEN, detentions); without them all three default to enabled.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Row pattern, compiled once at first use.
static ROSTER_ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        (?P<first>\w+) , [\t\x20]* (?P<last>[\w'-]+) ,
        .*? , .*? , [\t\x20]*
        (?P<email>[\w.-]+@[\w.-]+\.\w+)
        (?: [\t\x20]* , [\t\x20]* (?P<analytics>(?i:yes|no))
            [\t\x20]* , [\t\x20]* (?P<sen>(?i:yes|no))
            [\t\x20]* , [\t\x20]* (?P<detentions>(?i:yes|no)) \b )?
        ",
    )
    .expect("roster row regex is valid")
});

/// One staff member to activate on the portal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterRecord {
    /// `"<first> <last>"` as written in the roster.
    pub full_name: String,

    /// Address entered on the portal.
    pub email: String,

    /// Desired analytics permission.
    pub analytics: bool,

    /// Desired SEN (provision map) permission.
    pub sen: bool,

    /// Desired detentions permission.
    pub detentions: bool,
}

impl RosterRecord {
    /// Creates a record with every permission enabled.
    #[must_use]
    pub fn new(full_name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
            email: email.into(),
            analytics: true,
            sen: true,
            detentions: true,
        }
    }

    /// Overrides the desired permissions.
    #[must_use]
    pub const fn with_permissions(mut self, analytics: bool, sen: bool, detentions: bool) -> Self {
        self.analytics = analytics;
        self.sen = sen;
        self.detentions = detentions;
        self
    }
}

impl fmt::Display for RosterRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.full_name, self.email)
    }
}

/// Extracts every roster row from `text`, in source order.
///
/// Rows that do not match are skipped silently; no match at all yields an
/// empty list. Duplicate names are kept as separate records.
#[must_use]
pub fn parse(text: &str) -> Vec<RosterRecord> {
    let flag = |caps: &regex::Captures<'_>, name: &str| {
        caps.name(name)
            .is_none_or(|value| value.as_str().eq_ignore_ascii_case("yes"))
    };

    ROSTER_ROW
        .captures_iter(text)
        .map(|caps| {
            let record = RosterRecord::new(
                format!("{} {}", &caps["first"], &caps["last"]),
                &caps["email"],
            )
            .with_permissions(
                flag(&caps, "analytics"),
                flag(&caps, "sen"),
                flag(&caps, "detentions"),
            );
            tracing::info!(name = %record.full_name, email = %record.email, "parsed roster row");
            record
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_row_and_broken_line() {
        let records =
            parse("Jane, Doe, X, Y, jane.doe@example.com\nBroken line without enough fields");

        assert_eq!(records, vec![RosterRecord::new("Jane Doe", "jane.doe@example.com")]);
    }

    #[test]
    fn test_email_directly_after_comma() {
        let records = parse("Amir,Khan,English,Teacher,a.khan@school.example.org");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].full_name, "Amir Khan");
        assert_eq!(records[0].email, "a.khan@school.example.org");
    }

    #[test]
    fn test_last_name_with_apostrophe_and_hyphen() {
        let records = parse(
            "Sam, O'Neil, Science, TA, sam.oneil@example.com\n\
             Mary, Smith-Jones, History, HoD, m.smith-jones@example.com\n",
        );
        let names: Vec<&str> = records.iter().map(|r| r.full_name.as_str()).collect();
        assert_eq!(names, vec!["Sam O'Neil", "Mary Smith-Jones"]);
    }

    #[test]
    fn test_permissions_default_to_enabled() {
        let record = &parse("Jane, Doe, X, Y, jane.doe@example.com")[0];
        assert!(record.analytics);
        assert!(record.sen);
        assert!(record.detentions);
    }

    #[test]
    fn test_explicit_permission_columns() {
        let records = parse("Jane, Doe, X, Y, jane.doe@example.com, yes, NO, no");
        assert_eq!(
            records,
            vec![RosterRecord::new("Jane Doe", "jane.doe@example.com").with_permissions(
                true, false, false
            )]
        );
    }

    #[test]
    fn test_no_matches_is_empty() {
        assert!(parse("").is_empty());
        assert!(parse("Hello,\nplease find attached the new starters.\nThanks").is_empty());
    }

    #[test]
    fn test_duplicates_kept_in_source_order() {
        let records = parse(
            "Jane, Doe, X, Y, jane.doe@example.com\n\
             Jane, Doe, X, Y, jane.d@example.com\n",
        );
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].email, "jane.doe@example.com");
        assert_eq!(records[1].email, "jane.d@example.com");
    }

    #[test]
    fn test_row_never_spans_lines() {
        let records = parse("Hello,\nJane, Doe, Maths, Teacher, jane.doe@example.com");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].full_name, "Jane Doe");
    }

    #[test]
    fn test_rows_embedded_in_prose() {
        let text = "Hi team,\r\n\r\nNew starters below:\r\n\
                    Jane, Doe, Maths, Teacher, jane.doe@example.com\r\n\
                    Ola, Nowak, Art, Teacher, ola.nowak@example.com\r\n\r\nRegards";
        let emails: Vec<String> = parse(text).into_iter().map(|r| r.email).collect();
        assert_eq!(emails, vec!["jane.doe@example.com", "ola.nowak@example.com"]);
    }
}
