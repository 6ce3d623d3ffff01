//! fwpath - firewall path doctor
//!
//! Reads the live iptables state, answers "can traffic flow between this
//! tunnel and this container bridge?", and applies the minimal rule changes
//! when it cannot.
//!
//! # Architecture
//!
//! - [`core`] - Listing parser, path matching, isolation analysis, diagnosis and remediation
//! - [`elevation`] - Privilege escalation for iptables, `ip` and `sysctl`
//! - [`validators`] - Input validation for interface and chain names
//! - [`config`] - Configuration persistence
//! - [`utils`] - Utility functions (XDG directories, interface listing)
//!
//! # Safety Features
//!
//! - Existence check (`iptables -C`) before every insert
//! - Mutating commands are never killed on timeout
//! - Names validated before they reach a command line
//! - Atomic config writes with secure permissions

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::backend::{FirewallBackend, IptablesBackend};
pub use core::diagnose::{ConnectivityAnalysis, Diagnostician};
pub use core::error::{Error, Result};
pub use core::remediate::{RemediationEngine, RemediationResult};
pub use core::rule::{Rule, RuleSpec, Table};
