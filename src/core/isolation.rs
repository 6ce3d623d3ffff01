//! Isolation chain effectiveness
//!
//! Docker drops cross-bridge traffic in `DOCKER-ISOLATION-STAGE-2`. A RETURN
//! rule for the tunnel/bridge pair placed before those DROP rules makes them
//! unreachable for that pair. This module counts which DROPs actually fire.

use crate::core::chain_eval::in_evaluation_order;
use crate::core::rule::{Rule, is_wildcard_interface};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Whether the pair gets through the isolation chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum IsolationVerdict {
    #[strum(serialize = "blocked")]
    Blocked,
    #[strum(serialize = "allowed")]
    Allowed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationReport {
    pub chain: String,
    pub chain_present: bool,
    pub effective_drops: usize,
    pub ineffective_drops: usize,
    pub bypass_present: bool,
    /// Line of the first bypassing RETURN
    pub bypass_line: Option<u32>,
    pub verdict: IsolationVerdict,
    pub status: String,
}

impl IsolationReport {
    pub fn is_blocking(&self) -> bool {
        self.verdict == IsolationVerdict::Blocked
    }
}

/// Interface criteria shared by RETURN and DROP rules: input is the tunnel
/// or any, output is the bridge or another bridge by prefix.
fn affects_pair(rule: &Rule, tunnel: &str, bridge: &str, bridge_prefix: &str) -> bool {
    let in_ok = rule.in_interface == tunnel || is_wildcard_interface(&rule.in_interface);
    let out_ok = rule.out_interface == bridge
        || (!bridge_prefix.is_empty() && rule.out_interface.starts_with(bridge_prefix));
    in_ok && out_ok
}

/// Analyzes the isolation rules relevant to a tunnel/bridge pair.
///
/// Rules are walked in line order. DROPs before the first bypassing RETURN
/// are effective, DROPs after it are not.
pub fn analyze_isolation(
    chain: &str,
    chain_present: bool,
    rules: &[Rule],
    tunnel: &str,
    bridge: &str,
    bridge_prefix: &str,
) -> IsolationReport {
    let mut effective_drops = 0;
    let mut ineffective_drops = 0;
    let mut bypass_line = None;

    for rule in in_evaluation_order(rules) {
        if !affects_pair(rule, tunnel, bridge, bridge_prefix) {
            continue;
        }
        match rule.target.as_str() {
            "RETURN" if bypass_line.is_none() => {
                debug!("Isolation bypass for {} -> {} at line {}", tunnel, bridge, rule.line_number);
                bypass_line = Some(rule.line_number);
            }
            "DROP" if bypass_line.is_some() => ineffective_drops += 1,
            "DROP" => effective_drops += 1,
            _ => {}
        }
    }

    let (verdict, status) = if !chain_present {
        (IsolationVerdict::Allowed, format!("{chain} does not exist"))
    } else if effective_drops > 0 {
        (
            IsolationVerdict::Blocked,
            format!("{effective_drops} effective DROP rule(s) may block traffic"),
        )
    } else if ineffective_drops > 0 {
        (
            IsolationVerdict::Allowed,
            format!(
                "{ineffective_drops} DROP rule(s) bypassed by the RETURN rule at line {}",
                bypass_line.unwrap_or_default()
            ),
        )
    } else if !rules.is_empty() {
        (
            IsolationVerdict::Allowed,
            "Isolation rules present but none affect this path".to_string(),
        )
    } else {
        (IsolationVerdict::Allowed, "No relevant isolation rules".to_string())
    };

    debug!(
        "Isolation analysis for {} -> {}: {} (effective: {}, ineffective: {})",
        tunnel, bridge, status, effective_drops, ineffective_drops
    );

    IsolationReport {
        chain: chain.to_string(),
        chain_present,
        effective_drops,
        ineffective_drops,
        bypass_present: bypass_line.is_some(),
        bypass_line,
        verdict,
        status,
    }
}
