//! Keyword/regex-based SQL policy filters. No SQL parser: anchored,
//! case-insensitive regular expressions are enough, and false positives on
//! string literals containing these tokens are an accepted cost — Postgres
//! itself is the authoritative backstop for read-only enforcement.

use once_cell_regex::LazyRegex;
use regex::Regex;

use crate::error::ProxyError;

mod once_cell_regex {
    use regex::Regex;
    use std::sync::OnceLock;

    /// A `Regex` compiled once on first use. `regex::Regex::new` isn't
    /// `const`, so every call site needs somewhere to stash the compiled
    /// pattern; this is that somewhere.
    pub struct LazyRegex {
        cell: OnceLock<Regex>,
        pattern: &'static str,
    }

    impl LazyRegex {
        pub const fn new(pattern: &'static str) -> Self {
            Self { cell: OnceLock::new(), pattern }
        }

        pub fn get(&self) -> &Regex {
            self.cell.get_or_init(|| Regex::new(self.pattern).expect("static regex is valid"))
        }
    }
}

static PASSWORD_CHANGE: LazyRegex =
    LazyRegex::new(r"(?is)^\s*ALTER\s+(USER|ROLE)\b.*\bPASSWORD\b");

static WRITE_KEYWORD: LazyRegex = LazyRegex::new(
    r"(?is)^\s*(INSERT|UPDATE|DELETE|DROP|TRUNCATE|CREATE|ALTER|GRANT|REVOKE)\b",
);

static DISABLE_READ_ONLY: LazyRegex = LazyRegex::new(
    r"(?is)^\s*SET\s+(SESSION\s+)?default_transaction_read_only\s*(=|TO)\s*(off|false|0)\b",
);

static RESET_READ_ONLY: LazyRegex =
    LazyRegex::new(r"(?is)^\s*RESET\s+(SESSION\s+)?default_transaction_read_only\b");

static SET_AUTHORIZATION: LazyRegex =
    LazyRegex::new(r"(?is)^\s*SET\s+(SESSION\s+)?AUTHORIZATION\b");

static SET_ROLE: LazyRegex = LazyRegex::new(r"(?is)^\s*SET\s+ROLE\b");

fn matches(re: &LazyRegex, sql: &str) -> bool {
    re.get().is_match(sql)
}

/// `ALTER USER`/`ALTER ROLE` statements touching `PASSWORD` are always
/// denied, regardless of access level.
pub fn is_password_change(sql: &str) -> bool {
    matches(&PASSWORD_CHANGE, sql)
}

/// Statements that would defeat a read-only grant's database-level
/// enforcement: flipping `default_transaction_read_only` off, resetting it,
/// or switching role/authorization mid-session.
pub fn is_read_only_bypass(sql: &str) -> bool {
    matches(&DISABLE_READ_ONLY, sql)
        || matches(&RESET_READ_ONLY, sql)
        || matches(&SET_AUTHORIZATION, sql)
        || matches(&SET_ROLE, sql)
}

/// Write-keyword statements rejected under a `read` grant.
pub fn is_write_statement(sql: &str) -> bool {
    matches(&WRITE_KEYWORD, sql)
}

/// Applies the password-change filter, then (for read-only grants) the
/// bypass and write filters, in the order spec'd for both Simple Query and
/// Parse-time defence-in-depth checks.
pub fn check(sql: &str, read_only: bool) -> Result<(), ProxyError> {
    if is_password_change(sql) {
        return Err(ProxyError::PasswordChangeDenied);
    }
    if read_only {
        if is_read_only_bypass(sql) {
            return Err(ProxyError::ReadOnlyBypass);
        }
        if is_write_statement(sql) {
            return Err(ProxyError::WriteNotPermitted);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("INSERT INTO t VALUES (1)")]
    #[case("  update t set x=1")]
    #[case("Delete from t")]
    #[case("DROP TABLE t")]
    #[case("truncate t")]
    #[case("CREATE TABLE t (x int)")]
    #[case("ALTER TABLE t ADD COLUMN y int")]
    #[case("GRANT SELECT ON t TO bob")]
    #[case("REVOKE SELECT ON t FROM bob")]
    fn rejects_every_write_keyword(#[case] sql: &str) {
        assert!(is_write_statement(sql), "{sql} should be classified as a write");
    }

    #[test]
    fn select_is_not_a_write() {
        assert!(!is_write_statement("SELECT 1"));
    }

    #[rstest]
    #[case("ALTER USER alice PASSWORD 'x'")]
    #[case("alter role bob with password 'y'")]
    fn rejects_password_change(#[case] sql: &str) {
        assert!(is_password_change(sql));
    }

    #[test]
    fn accepts_password_change_lookalike_without_password_keyword() {
        assert!(!is_password_change("ALTER USER alice VALID UNTIL 'infinity'"));
    }

    #[rstest]
    #[case("SET SESSION default_transaction_read_only = off")]
    #[case("SET default_transaction_read_only TO false")]
    #[case("set default_transaction_read_only = 0")]
    #[case("RESET default_transaction_read_only")]
    #[case("RESET SESSION default_transaction_read_only")]
    #[case("SET ROLE admin")]
    #[case("SET SESSION AUTHORIZATION admin")]
    fn rejects_read_only_bypass(#[case] sql: &str) {
        assert!(is_read_only_bypass(sql));
    }

    #[test]
    fn allows_enabling_read_only() {
        assert!(!is_read_only_bypass("SET SESSION default_transaction_read_only = on"));
    }

    #[test]
    fn check_denies_password_change_even_under_write_grant() {
        assert!(matches!(
            check("ALTER USER alice PASSWORD 'x'", false),
            Err(ProxyError::PasswordChangeDenied)
        ));
    }

    #[test]
    fn check_allows_write_under_write_grant() {
        assert!(check("INSERT INTO t VALUES (1)", false).is_ok());
    }

    #[test]
    fn check_denies_write_under_read_grant() {
        assert!(matches!(
            check("INSERT INTO t VALUES (1)", true),
            Err(ProxyError::WriteNotPermitted)
        ));
    }
}
