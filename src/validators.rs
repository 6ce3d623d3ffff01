//! Input validation for names that end up on an iptables/ip command line
//!
//! Arguments are passed as argv, so shell injection is not the concern here;
//! the goal is that a name can never be read as an option (`-j`, `--flush`)
//! and never exceeds kernel limits.

use crate::core::error::{Error, Result};

/// Maximum chain name length accepted by iptables (`XT_EXTENSION_MAXNAMELEN - 1`)
pub const MAX_CHAIN_NAME_LEN: usize = 28;

fn allowed_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')
}

/// Validates a network interface name.
///
/// Linux kernel interface name rules:
/// - Max 15 characters (IFNAMSIZ - 1)
/// - Alphanumeric, dot, dash, underscore only
/// - Cannot be "." or ".."
///
/// Additionally the name must not be empty or start with `-`.
///
/// # Errors
///
/// Returns `Err` if interface name violates those constraints.
pub fn validate_interface(name: &str) -> std::result::Result<String, String> {
    if name.is_empty() {
        return Err("Interface name is empty".to_string());
    }

    if name.len() > 15 {
        return Err("Interface name too long (max 15 characters)".to_string());
    }

    if name == "." || name == ".." || name.starts_with('-') {
        return Err("Invalid interface name".to_string());
    }

    if !name.chars().all(allowed_name_char) {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(name.to_string())
}

/// Validates an iptables chain name.
///
/// # Errors
///
/// Returns `Err` if the name is empty, too long, starts with `-`, or
/// contains characters outside `[A-Za-z0-9._-]`.
pub fn validate_chain_name(name: &str) -> std::result::Result<String, String> {
    if name.is_empty() {
        return Err("Chain name is empty".to_string());
    }

    if name.len() > MAX_CHAIN_NAME_LEN {
        return Err(format!(
            "Chain name too long (max {MAX_CHAIN_NAME_LEN} characters)"
        ));
    }

    if name.starts_with('-') {
        return Err("Invalid chain name".to_string());
    }

    if !name.chars().all(allowed_name_char) {
        return Err("Chain name contains invalid characters".to_string());
    }

    Ok(name.to_string())
}

/// [`validate_interface`] mapped onto [`Error::InvalidInput`]
pub fn require_interface(field: &str, name: &str) -> Result<()> {
    validate_interface(name)
        .map(|_| ())
        .map_err(|message| Error::InvalidInput {
            field: field.to_string(),
            message,
        })
}

/// [`validate_chain_name`] mapped onto [`Error::InvalidInput`]
pub fn require_chain_name(field: &str, name: &str) -> Result<()> {
    validate_chain_name(name)
        .map(|_| ())
        .map_err(|message| Error::InvalidInput {
            field: field.to_string(),
            message,
        })
}
