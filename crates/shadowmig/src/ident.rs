//! Identifier guard for SQL that cannot use bound parameters.
//!
//! `CREATE DATABASE`, `DROP DATABASE` and table DDL take identifiers, not
//! values, so names are interpolated into the statement text. Every name that
//! reaches such a statement goes through [`quote_identifier`] first.

use crate::error::{MigrateError, Result};

/// PostgreSQL silently truncates identifiers longer than NAMEDATALEN - 1.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Check that `name` is a safe identifier: ASCII letters, digits,
/// underscores and hyphens, starting with a letter or underscore, at most
/// 63 bytes. Hyphens are allowed because names are always quoted.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MigrateError::InvalidIdentifier(
            "identifier is empty".to_string(),
        ));
    }

    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(MigrateError::InvalidIdentifier(format!(
            "{} exceeds {} bytes",
            name, MAX_IDENTIFIER_LEN
        )));
    }

    if !name.starts_with(|ch: char| ch.is_ascii_alphabetic() || ch == '_') {
        return Err(MigrateError::InvalidIdentifier(format!(
            "{} must start with a letter or underscore",
            name
        )));
    }

    if let Some(bad) = name
        .chars()
        .find(|ch| !(ch.is_ascii_alphanumeric() || *ch == '_' || *ch == '-'))
    {
        return Err(MigrateError::InvalidIdentifier(format!(
            "{} contains forbidden character {:?}",
            name, bad
        )));
    }

    Ok(())
}

/// Validate `name` and wrap it in double quotes for interpolation.
///
/// Quoting keeps mixed-case names intact; validation guarantees there is no
/// quote character to escape.
pub fn quote_identifier(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_plain_names() {
        assert!(validate_identifier("app").is_ok());
        assert!(validate_identifier("_shadowmig_migrations").is_ok());
        assert!(validate_identifier("App_Prod_2024").is_ok());
    }

    #[test]
    fn test_accepts_hyphenated_database_names() {
        assert!(validate_identifier("my-app").is_ok());
        assert_eq!(quote_identifier("my-app").unwrap(), "\"my-app\"");
    }

    #[test]
    fn test_rejects_injection_shaped_names() {
        assert!(validate_identifier("app; DROP DATABASE prod").is_err());
        assert!(validate_identifier("app\"--").is_err());
        assert!(validate_identifier("-app").is_err());
        assert!(validate_identifier("app db").is_err());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("1app").is_err());
    }

    #[test]
    fn test_rejects_names_postgres_would_truncate() {
        let at_limit = "a".repeat(MAX_IDENTIFIER_LEN);
        assert!(validate_identifier(&at_limit).is_ok());

        let over = "a".repeat(MAX_IDENTIFIER_LEN + 1);
        assert!(validate_identifier(&over).is_err());
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("MyDb_shadow").unwrap(), "\"MyDb_shadow\"");
        assert!(matches!(
            quote_identifier("x'y"),
            Err(MigrateError::InvalidIdentifier(_))
        ));
    }
}
