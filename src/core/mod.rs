//! Core firewall analysis functionality
//!
//! Leaves first:
//!
//! - [`units`]: counter parsing (`231K`, `1.2M`, `--`)
//! - [`rule`]: rule records and mutation specs
//! - [`parser`]: tolerant iptables listing parser
//! - [`chain_eval`]: the shared "sort by line, then walk" primitive
//! - [`matcher`]: forwarding path queries for an interface pair
//! - [`isolation`]: isolation chain effectiveness
//! - [`netinfo`]: `ip`, `ss` and sysfs records
//! - [`backend`]: the OS boundary ([`backend::FirewallBackend`])
//! - [`simulated`]: in-memory backend for tests and dry runs
//! - [`snapshot`]: table snapshots and interface-centric views
//! - [`diagnose`]: connectivity analysis for a tunnel/bridge pair
//! - [`remediate`]: idempotent repair of that pair
//! - [`error`]: error types and stderr translation

pub mod backend;
pub mod chain_eval;
pub mod diagnose;
pub mod error;
pub mod isolation;
pub mod matcher;
pub mod netinfo;
pub mod parser;
pub mod remediate;
pub mod rule;
pub mod simulated;
pub mod snapshot;
pub mod units;

#[cfg(test)]
pub mod test_helpers;
