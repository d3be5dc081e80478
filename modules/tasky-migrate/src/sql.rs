//! Quoting primitives for statements that cannot take bind parameters
//! (DDL such as `CREATE DATABASE`, `CREATE USER`, `GRANT`).

use crate::error::ConfigError;

/// Postgres truncates identifiers beyond NAMEDATALEN - 1 bytes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Quote an identifier: wrap in double quotes, double any embedded quote.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a string literal: wrap in single quotes, double any embedded quote.
/// Assumes `standard_conforming_strings = on` (the default since 9.1).
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Reject identifiers Postgres would silently truncate or cannot represent.
pub fn validate_identifier(field: &str, ident: &str) -> Result<(), ConfigError> {
    if ident.is_empty() {
        return Err(ConfigError::invalid(field, "must not be empty"));
    }
    if ident.contains('\0') {
        return Err(ConfigError::invalid(field, "must not contain NUL"));
    }
    if ident.len() > MAX_IDENTIFIER_LEN {
        return Err(ConfigError::invalid(
            field,
            format!(
                "{} bytes exceeds the {MAX_IDENTIFIER_LEN}-byte identifier limit",
                ident.len()
            ),
        ));
    }
    Ok(())
}
