//! Rule records and mutation specs
//!
//! [`Rule`] is one row of an iptables listing, normalized by the parser.
//! [`RuleSpec`] describes a rule fwpath wants to check, insert or append, and
//! renders both the argv passed to iptables and the human-readable command
//! shown in recommendations.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Connection-tracking states accepted as a generic return path
pub const RETURN_PATH_STATES: [&str; 3] = [
    "RELATED,ESTABLISHED",
    "ESTABLISHED,RELATED",
    "NEW,RELATED,ESTABLISHED",
];

/// iptables table
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Table {
    Raw,
    Mangle,
    Nat,
    Filter,
}

impl Table {
    /// Listing order used for full snapshots
    pub const ALL: [Table; 4] = [Table::Raw, Table::Mangle, Table::Nat, Table::Filter];

    pub const fn as_str(self) -> &'static str {
        match self {
            Table::Raw => "raw",
            Table::Mangle => "mangle",
            Table::Nat => "nat",
            Table::Filter => "filter",
        }
    }
}

/// `*`, `any` and empty all mean "every interface"
pub fn is_wildcard_interface(name: &str) -> bool {
    name.is_empty() || name == "*" || name == "any"
}

/// Matches every address
pub fn is_any_address(addr: &str) -> bool {
    matches!(addr, "" | "0.0.0.0/0" | "::/0" | "anywhere")
}

/// One rule as reported by the live firewall.
///
/// Built fresh on every read and never mutated afterwards. Counters are only
/// meaningful between two reads of the same unchanged rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub table: Table,
    pub chain: String,
    /// 1-based position in the chain; lower numbers are evaluated first
    pub line_number: u32,
    pub packets: u64,
    pub bytes: u64,
    /// Empty for pure counting rules
    pub target: String,
    pub protocol: String,
    pub options: String,
    pub in_interface: String,
    pub out_interface: String,
    pub source: String,
    pub destination: String,
    /// Match extensions as printed after the destination column
    pub extra: String,
    /// Listing line this rule was parsed from
    pub raw: String,
}

impl Rule {
    /// `all`, `0` and an empty protocol column match every protocol
    pub fn protocol_is_all(&self) -> bool {
        matches!(self.protocol.as_str(), "" | "all" | "0")
    }

    pub fn addresses_are_any(&self) -> bool {
        is_any_address(&self.source) && is_any_address(&self.destination)
    }

    /// Conntrack state restriction, if the extra text carries one.
    ///
    /// Recognises `ctstate X`, `state X`, `--ctstate X` and `--state X`.
    pub fn conntrack_state(&self) -> Option<&str> {
        let mut tokens = self.extra.split_whitespace();
        while let Some(token) = tokens.next() {
            if matches!(token, "ctstate" | "state" | "--ctstate" | "--state") {
                return tokens.next();
            }
        }
        None
    }

    /// True if the state restriction (if any) admits generic forwarding
    pub fn has_return_path_state(&self) -> bool {
        self.conntrack_state()
            .is_none_or(|state| RETURN_PATH_STATES.contains(&state))
    }

    /// True if `name` appears as a whole token anywhere in the listing line
    pub fn mentions(&self, name: &str) -> bool {
        self.raw.split_whitespace().any(|token| token == name)
    }

    /// Like [`Rule::mentions`], but a negated token (`!br-x`) also counts
    pub fn refers_to(&self, name: &str) -> bool {
        self.raw
            .split_whitespace()
            .any(|token| token.trim_start_matches('!') == name)
    }

    pub fn targets_any(&self, targets: &[&str]) -> bool {
        targets.contains(&self.target.as_str())
    }

    /// Short explanation used in reports, e.g.
    /// `Line 1: ACCEPT all -i tun0 -o br-1234567890ab`
    pub fn describe(&self) -> String {
        let mut text = format!(
            "Line {}: {} {} -i {} -o {}",
            self.line_number,
            if self.target.is_empty() { "-" } else { &self.target },
            if self.protocol.is_empty() { "all" } else { &self.protocol },
            display_interface(&self.in_interface),
            display_interface(&self.out_interface),
        );
        if let Some(state) = self.conntrack_state() {
            text.push_str(" --ctstate ");
            text.push_str(state);
        }
        text
    }
}

fn display_interface(name: &str) -> &str {
    if is_wildcard_interface(name) { "*" } else { name }
}

/// A rule fwpath checks for, inserts or appends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub table: Table,
    pub chain: String,
    pub in_interface: Option<String>,
    pub out_interface: Option<String>,
    pub ctstate: Option<String>,
    pub target: String,
}

impl RuleSpec {
    /// `-i from -o to -j ACCEPT` in filter/FORWARD
    pub fn forward_accept(from: &str, to: &str) -> Self {
        Self {
            table: Table::Filter,
            chain: "FORWARD".to_string(),
            in_interface: Some(from.to_string()),
            out_interface: Some(to.to_string()),
            ctstate: None,
            target: "ACCEPT".to_string(),
        }
    }

    /// Return-path rule restricted to RELATED,ESTABLISHED
    pub fn forward_return_path(from: &str, to: &str) -> Self {
        Self {
            ctstate: Some(RETURN_PATH_STATES[0].to_string()),
            ..Self::forward_accept(from, to)
        }
    }

    /// RETURN rule that exits an isolation chain before its DROP rules
    pub fn isolation_bypass(chain: &str, from: &str, to: &str) -> Self {
        Self {
            table: Table::Filter,
            chain: chain.to_string(),
            in_interface: Some(from.to_string()),
            out_interface: Some(to.to_string()),
            ctstate: None,
            target: "RETURN".to_string(),
        }
    }

    /// nat/POSTROUTING MASQUERADE keyed on the output interface only
    pub fn masquerade(out: &str) -> Self {
        Self {
            table: Table::Nat,
            chain: "POSTROUTING".to_string(),
            in_interface: None,
            out_interface: Some(out.to_string()),
            ctstate: None,
            target: "MASQUERADE".to_string(),
        }
    }

    /// Match and jump arguments shared by `-C`, `-I` and `-A`
    pub fn match_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(iface) = &self.in_interface {
            args.push("-i".to_string());
            args.push(iface.clone());
        }
        if let Some(iface) = &self.out_interface {
            args.push("-o".to_string());
            args.push(iface.clone());
        }
        if let Some(state) = &self.ctstate {
            args.extend(["-m", "conntrack", "--ctstate"].map(String::from));
            args.push(state.clone());
        }
        args.push("-j".to_string());
        args.push(self.target.clone());
        args
    }

    fn with_operation(&self, operation: &str, position: Option<u32>) -> Vec<String> {
        let mut args = Vec::new();
        if self.table != Table::Filter {
            args.push("-t".to_string());
            args.push(self.table.as_str().to_string());
        }
        args.push(operation.to_string());
        args.push(self.chain.clone());
        if let Some(pos) = position {
            args.push(pos.to_string());
        }
        args.extend(self.match_args());
        args
    }

    /// Arguments for the existence check (`-C`)
    pub fn check_args(&self) -> Vec<String> {
        self.with_operation("-C", None)
    }

    /// Arguments for inserting at a 1-based position (`-I`)
    pub fn insert_args(&self, position: u32) -> Vec<String> {
        self.with_operation("-I", Some(position))
    }

    /// Arguments for appending (`-A`)
    pub fn append_args(&self) -> Vec<String> {
        self.with_operation("-A", None)
    }

    /// Command line shown to users for an insert
    pub fn insert_command(&self, position: u32) -> String {
        format!("iptables {}", self.insert_args(position).join(" "))
    }

    /// Command line shown to users for an append
    pub fn append_command(&self) -> String {
        format!("iptables {}", self.append_args().join(" "))
    }

    /// True if a listed rule is the same rule as this spec, the way
    /// `iptables -C` compares them.
    pub fn matches_rule(&self, rule: &Rule) -> bool {
        fn same_iface(spec: Option<&String>, listed: &str) -> bool {
            match spec {
                Some(name) => name == listed,
                None => is_wildcard_interface(listed),
            }
        }

        // `-C` treats a state list as a set
        fn same_states(listed: Option<&str>, spec: Option<&str>) -> bool {
            fn set(s: &str) -> BTreeSet<&str> {
                s.split(',').map(str::trim).collect::<BTreeSet<_>>()
            }
            match (listed, spec) {
                (Some(a), Some(b)) => set(a) == set(b),
                (None, None) => true,
                _ => false,
            }
        }

        rule.table == self.table
            && rule.chain == self.chain
            && rule.target == self.target
            && rule.protocol_is_all()
            && rule.addresses_are_any()
            && same_iface(self.in_interface.as_ref(), &rule.in_interface)
            && same_iface(self.out_interface.as_ref(), &rule.out_interface)
            && same_states(rule.conntrack_state(), self.ctstate.as_deref())
    }
}

impl fmt::Display for RuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "iptables {}", self.append_args().join(" "))
    }
}
