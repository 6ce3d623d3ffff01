use thiserror::Error;

use crate::elevation::ElevationError;

/// Core error types for fwpath
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The binary is missing or not executable
    #[error("{program} is not installed or not executable")]
    ToolUnavailable { program: String },

    /// The tool ran but exited non-zero
    #[error("{program} failed: {}", stderr.trim())]
    ToolExecutionFailed {
        program: String,
        args: Vec<String>,
        stderr: String,
        exit_code: Option<i32>,
    },

    /// The tool did not finish within the configured timeout
    #[error("{program} did not finish within {seconds}s")]
    Timeout { program: String, seconds: u64 },

    /// The requested chain does not exist in the table
    #[error("Chain {chain} not found in table {table}")]
    ChainNotFound { table: String, chain: String },

    /// A network interface required for analysis does not exist
    #[error("Network interface not found: {0}")]
    InterfaceNotFound(String),

    /// Input validation failed
    #[error("Validation error in {field}: {message}")]
    InvalidInput { field: String, message: String },

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(#[from] ElevationError),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stderr of a failed tool invocation, if any
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Error::ToolExecutionFailed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }

    /// Returns a user-facing translation with suggestions
    pub fn translate(&self) -> ErrorTranslation {
        match self {
            Error::ToolUnavailable { program } => {
                IptablesErrorPattern::match_error(&format!("{program}: command not found"))
            }
            Error::ToolExecutionFailed { stderr, .. } => IptablesErrorPattern::match_error(stderr),
            Error::Timeout { .. } => IptablesErrorPattern::match_error("timed out"),
            Error::InterfaceNotFound(name) => {
                ErrorTranslation::new(format!("Network interface {name} does not exist"))
                    .with_suggestion("Check available interfaces: ip link show")
                    .with_suggestion("Tunnel interfaces only exist while the VPN is connected")
                    .with_suggestion("Bridge names look like br-<network id> or docker0")
            }
            other => ErrorTranslation::new(other.to_string()),
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
    pub help_url: Option<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
            help_url: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_help(mut self, url: impl Into<String>) -> Self {
        self.help_url = Some(url.into());
        self
    }
}

/// Database of iptables / iproute2 error patterns and their translations
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        // Permission errors
        if lower.contains("permission denied")
            || lower.contains("operation not permitted")
            || lower.contains("you must be root")
        {
            return ErrorTranslation::new("Insufficient permissions to read or modify firewall rules")
                .with_suggestion("Run as root, or make sure sudo/run0/pkexec is available")
                .with_suggestion("Set FWPATH_ELEVATION_METHOD=sudo to force a specific method")
                .with_suggestion("Check if CAP_NET_ADMIN capability is available")
                .with_help("https://man7.org/linux/man-pages/man8/iptables.8.html");
        }

        // Missing binary
        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("iptables or iproute2 is not installed or not found in PATH")
                .with_suggestion("Install iptables: sudo apt install iptables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install iptables-nft  (Fedora/RHEL)")
                .with_suggestion("Or: sudo pacman -S iptables-nft  (Arch)")
                .with_suggestion("Or point iptables_path in config.json at the binary");
        }

        // xtables lock
        if lower.contains("xtables lock") || lower.contains("resource temporarily unavailable") {
            return ErrorTranslation::new("Another process is holding the xtables lock")
                .with_suggestion("Another firewall manager may be modifying rules right now")
                .with_suggestion("Wait a moment and try again")
                .with_suggestion(
                    "Check for conflicting managers: sudo systemctl status firewalld ufw docker",
                );
        }

        // Unknown chain or target
        if lower.contains("no chain/target/match by that name") || lower.contains("chain") && lower.contains("does not exist") {
            return ErrorTranslation::new("Firewall chain or target not found")
                .with_suggestion("List the table to see which chains exist: iptables -t filter -L -n")
                .with_suggestion("Docker creates its isolation chains only after its first network is created")
                .with_help("https://docs.docker.com/engine/network/packet-filtering-firewalls/");
        }

        // -C on a missing rule, or malformed rule
        if lower.contains("bad rule") || lower.contains("does a matching rule exist") {
            return ErrorTranslation::new("The rule does not exist in that chain")
                .with_suggestion("The rule may already have been removed by another tool")
                .with_suggestion("Re-run the diagnosis to refresh the rule list");
        }

        // Insert position past the end of the chain
        if lower.contains("index of insertion too big") || lower.contains("index of deletion too big") {
            return ErrorTranslation::new("Rule position is outside the chain")
                .with_suggestion("The chain changed between reading and modifying it")
                .with_suggestion("Re-run the command to work on fresh line numbers");
        }

        // Unknown interface
        if lower.contains("cannot find device") || lower.contains("does not exist") {
            return ErrorTranslation::new("Network interface not found")
                .with_suggestion("Check available interfaces: ip link show")
                .with_suggestion("Interface names are case-sensitive and max 15 chars");
        }

        // Timeout errors
        if lower.contains("timeout") || lower.contains("timed out") {
            return ErrorTranslation::new("Operation timed out")
                .with_suggestion("The firewall tool took too long to respond")
                .with_suggestion("Check system load: uptime")
                .with_suggestion("Raise command_timeout_secs in config.json");
        }

        // Generic fallback
        ErrorTranslation::new(format!("Firewall error: {}", msg.trim()))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Verify iptables is working: sudo iptables -L -n")
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied() {
        let translation = IptablesErrorPattern::match_error(
            "iptables v1.8.7 (nf_tables): Could not fetch rule set generation id: Permission denied (you must be root)",
        );
        assert!(translation.user_message.contains("permissions"));
        assert!(translation.help_url.is_some());
    }

    #[test]
    fn test_missing_command() {
        let translation = IptablesErrorPattern::match_error("command not found: iptables");
        assert!(translation.user_message.contains("not installed"));
        assert!(translation.suggestions.len() >= 3); // Multiple distro options
    }

    #[test]
    fn test_unknown_chain() {
        let translation = IptablesErrorPattern::match_error(
            "iptables: No chain/target/match by that name.",
        );
        assert!(translation.user_message.contains("chain"));
        assert!(translation.suggestions.iter().any(|s| s.contains("Docker")));
    }

    #[test]
    fn test_xtables_lock() {
        let translation = IptablesErrorPattern::match_error(
            "Another app is currently holding the xtables lock. Perhaps you want to use the -w option?",
        );
        assert!(translation.user_message.contains("xtables lock"));
    }

    #[test]
    fn test_insert_index() {
        let translation = IptablesErrorPattern::match_error("iptables: Index of insertion too big.");
        assert!(translation.user_message.contains("position"));
    }

    #[test]
    fn test_tool_unavailable_translation() {
        let err = Error::ToolUnavailable {
            program: "iptables".to_string(),
        };
        assert!(err.translate().user_message.contains("not installed"));
    }

    #[test]
    fn test_interface_not_found_translation() {
        let err = Error::InterfaceNotFound("tun9".to_string());
        let translation = err.translate();
        assert!(translation.user_message.contains("tun9"));
        assert!(translation.suggestions.iter().any(|s| s.contains("ip link")));
    }

    #[test]
    fn test_execution_failed_display_trims_stderr() {
        let err = Error::ToolExecutionFailed {
            program: "iptables".to_string(),
            args: vec!["-L".to_string()],
            stderr: "boom\n".to_string(),
            exit_code: Some(1),
        };
        assert_eq!(err.to_string(), "iptables failed: boom");
        assert_eq!(err.stderr(), Some("boom\n"));
    }
}
