//! Forwarding path matching
//!
//! Answers "is there a rule in FORWARD that permits traffic from interface A
//! to interface B?" for a protocol-agnostic connectivity query.
//!
//! A rule qualifies when:
//! 1. both interfaces match exactly, or one matches and the other is a wildcard
//! 2. its target is `ACCEPT`
//! 3. its protocol is `all`
//! 4. any conntrack restriction is a return-path state set
//!
//! `found` is true as soon as one qualifying rule exists, regardless of what
//! precedes it. [`PathMatch::shadowed_by`] adds the first-match view: a
//! blanket DROP/REJECT for the pair that sits before the first qualifying
//! ACCEPT wins in the kernel even though `found` is true.

use crate::core::chain_eval::{in_evaluation_order, walk};
use crate::core::rule::{Rule, is_wildcard_interface};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::ControlFlow;
use tracing::debug;

/// Directional query unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfacePair {
    pub from: String,
    pub to: String,
}

impl InterfacePair {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn reversed(&self) -> Self {
        Self::new(self.to.clone(), self.from.clone())
    }
}

impl fmt::Display for InterfacePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// Result of one directional query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMatch {
    pub pair: InterfacePair,
    pub found: bool,
    /// Qualifying rules in evaluation order
    pub matched_rules: Vec<Rule>,
    /// Blanket DROP/REJECT evaluated before the first qualifying ACCEPT
    pub shadowed_by: Option<Rule>,
}

impl PathMatch {
    /// Found and not pre-empted by an earlier blocking rule
    pub fn permitted(&self) -> bool {
        self.found && self.shadowed_by.is_none()
    }

    pub fn first_match(&self) -> Option<&Rule> {
        self.matched_rules.first()
    }
}

fn interfaces_match(rule: &Rule, pair: &InterfacePair) -> bool {
    let in_exact = rule.in_interface == pair.from;
    let out_exact = rule.out_interface == pair.to;
    (in_exact && out_exact)
        || (in_exact && is_wildcard_interface(&rule.out_interface))
        || (is_wildcard_interface(&rule.in_interface) && out_exact)
}

/// True if `rule` permits generic forwarding for `pair`
pub fn rule_permits(rule: &Rule, pair: &InterfacePair) -> bool {
    interfaces_match(rule, pair)
        && rule.target == "ACCEPT"
        && rule.protocol_is_all()
        && rule.has_return_path_state()
}

/// True if `rule` drops every packet of `pair` it sees
pub fn rule_blocks(rule: &Rule, pair: &InterfacePair) -> bool {
    let both_wild =
        is_wildcard_interface(&rule.in_interface) && is_wildcard_interface(&rule.out_interface);
    (interfaces_match(rule, pair) || both_wild)
        && rule.targets_any(&["DROP", "REJECT"])
        && rule.protocol_is_all()
        && rule.conntrack_state().is_none()
        && rule.addresses_are_any()
}

/// Runs the path query over a chain's rules.
pub fn match_path(rules: &[Rule], pair: &InterfacePair) -> PathMatch {
    let matched_rules: Vec<Rule> = in_evaluation_order(rules)
        .into_iter()
        .filter(|r| rule_permits(r, pair))
        .cloned()
        .collect();

    let shadowed_by = walk(rules, |r| {
        if rule_permits(r, pair) {
            ControlFlow::Break(None)
        } else if rule_blocks(r, pair) {
            ControlFlow::Break(Some(r.clone()))
        } else {
            ControlFlow::Continue(())
        }
    })
    .flatten()
    .filter(|_| !matched_rules.is_empty());

    debug!(
        "Path {}: {} qualifying rule(s), shadowed: {}",
        pair,
        matched_rules.len(),
        shadowed_by.as_ref().map_or(0, |r| r.line_number)
    );

    PathMatch {
        pair: pair.clone(),
        found: !matched_rules.is_empty(),
        matched_rules,
        shadowed_by,
    }
}
