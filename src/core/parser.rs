//! iptables listing parser
//!
//! Converts the text printed by `iptables -t <table> -L -n -v [--line-numbers]`
//! into [`ChainListing`]s holding [`Rule`] records.
//!
//! The parser never fails. Lines it cannot attribute or tokenize are recorded
//! as [`SkippedLine`]s and logged at debug level, so one odd row (a new match
//! extension, a warning banner, a wrapped line) does not lose the table.
//!
//! # Listing forms
//!
//! - [`ListingFormat::LineNumbered`]: `num pkts bytes target prot opt in out source destination [extra]`
//! - [`ListingFormat::Plain`]: the same without `num`; rules are numbered 1..n
//!   in listing order, which is their evaluation order.
//!
//! Counters go through [`parse_count`] in both forms, so exact (`-x`) and
//! abbreviated (`1.2M`) values are both accepted.

use crate::core::rule::{Rule, Table};
use crate::core::units::parse_count;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Which invocation produced the text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingFormat {
    /// `-L -n -v --line-numbers` (whole table)
    LineNumbered,
    /// `-L CHAIN -n -v` (single chain)
    Plain,
}

/// A line the parser could not use
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedLine {
    /// 1-based line number in the listing text
    pub line_no: usize,
    pub text: String,
    pub reason: String,
}

/// One chain with its header data and rules in listing order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainListing {
    pub name: String,
    /// Set for built-in chains
    pub policy: Option<String>,
    pub policy_packets: u64,
    pub policy_bytes: u64,
    /// Set for user-defined chains
    pub references: Option<u32>,
    pub rules: Vec<Rule>,
}

/// Parsed listing of one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableListing {
    pub table: Table,
    pub chains: Vec<ChainListing>,
    pub skipped: Vec<SkippedLine>,
}

impl TableListing {
    pub fn chain(&self, name: &str) -> Option<&ChainListing> {
        self.chains.iter().find(|c| c.name == name)
    }

    /// Rules of a chain, or an empty slice if the chain is absent
    pub fn chain_rules(&self, name: &str) -> &[Rule] {
        self.chain(name).map_or(&[][..], |c| c.rules.as_slice())
    }

    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.chains.iter().flat_map(|c| c.rules.iter())
    }
}

/// Parses a full listing.
pub fn parse_listing(table: Table, text: &str, format: ListingFormat) -> TableListing {
    let mut chains: Vec<ChainListing> = Vec::new();
    let mut skipped = Vec::new();
    // Data lines seen in the current chain, parsed or not
    let mut data_lines = 0_u32;

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(header) = parse_chain_header(trimmed) {
            chains.push(header);
            data_lines = 0;
            continue;
        }

        if is_column_header(trimmed) {
            continue;
        }

        let Some(current) = chains.last_mut() else {
            skip(&mut skipped, line_no, trimmed, "rule line before any chain header");
            continue;
        };

        data_lines += 1;
        match parse_rule_line(table, &current.name, trimmed, format, data_lines) {
            Ok(rule) => current.rules.push(rule),
            Err(reason) => skip(&mut skipped, line_no, trimmed, reason),
        }
    }

    TableListing {
        table,
        chains,
        skipped,
    }
}

fn skip(skipped: &mut Vec<SkippedLine>, line_no: usize, text: &str, reason: &str) {
    debug!("Skipping listing line {}: {} ({:?})", line_no, reason, text);
    skipped.push(SkippedLine {
        line_no,
        text: text.to_string(),
        reason: reason.to_string(),
    });
}

/// `Chain FORWARD (policy DROP 12 packets, 3456 bytes)`,
/// `Chain FORWARD (policy DROP)` or `Chain DOCKER (2 references)`
fn parse_chain_header(line: &str) -> Option<ChainListing> {
    let rest = line.strip_prefix("Chain ")?;
    let (name, details) = match rest.split_once(' ') {
        Some((name, details)) => (name, details.trim()),
        None => (rest, ""),
    };
    if name.is_empty() {
        return None;
    }

    let mut chain = ChainListing {
        name: name.to_string(),
        policy: None,
        policy_packets: 0,
        policy_bytes: 0,
        references: None,
        rules: Vec::new(),
    };

    let inner = details.trim_start_matches('(').trim_end_matches(')');
    let tokens: Vec<&str> = inner
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty())
        .collect();

    match tokens.as_slice() {
        ["policy", policy, rest @ ..] => {
            chain.policy = Some((*policy).to_string());
            if let [packets, "packets", bytes, "bytes", ..] = rest {
                chain.policy_packets = parse_count(packets);
                chain.policy_bytes = parse_count(bytes);
            }
        }
        [count, refs, ..] if refs.starts_with("reference") => {
            chain.references = count.parse().ok();
        }
        _ => {}
    }

    Some(chain)
}

fn is_column_header(line: &str) -> bool {
    matches!(
        line.split_whitespace().next(),
        Some("num" | "pkts" | "target")
    )
}

fn is_opt_column(token: &str) -> bool {
    matches!(token, "--" | "-f" | "!f")
}

fn looks_numeric(token: &str) -> bool {
    token.chars().next().is_some_and(|c| c.is_ascii_digit())
}

fn parse_rule_line(
    table: Table,
    chain: &str,
    line: &str,
    format: ListingFormat,
    fallback_number: u32,
) -> Result<Rule, &'static str> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let mut pos = 0;

    let line_number = match format {
        ListingFormat::LineNumbered => {
            let number = tokens
                .first()
                .and_then(|t| t.parse::<u32>().ok())
                .ok_or("line number is not numeric")?;
            pos += 1;
            number
        }
        ListingFormat::Plain => fallback_number,
    };

    let (Some(packets), Some(bytes)) = (tokens.get(pos), tokens.get(pos + 1)) else {
        return Err("too few columns");
    };
    if !looks_numeric(packets) || !looks_numeric(bytes) {
        return Err("counter columns are not numeric");
    }
    pos += 2;

    let rest = &tokens[pos..];

    // target prot opt | prot opt (counting rule) | target prot (no opt column)
    let (target, protocol, options, columns) = if rest.len() > 2 && is_opt_column(rest[2]) {
        (rest[0], rest[1], rest[2], &rest[3..])
    } else if rest.len() > 1 && is_opt_column(rest[1]) {
        ("", rest[0], rest[1], &rest[2..])
    } else if rest.len() > 1 {
        (rest[0], rest[1], "", &rest[2..])
    } else {
        return Err("too few columns");
    };

    let [in_interface, out_interface, source, destination, extra @ ..] = columns else {
        return Err("too few columns");
    };

    Ok(Rule {
        table,
        chain: chain.to_string(),
        line_number,
        packets: parse_count(packets),
        bytes: parse_count(bytes),
        target: target.to_string(),
        protocol: if protocol == "0" {
            "all".to_string()
        } else {
            protocol.to_string()
        },
        options: options.to_string(),
        in_interface: (*in_interface).to_string(),
        out_interface: (*out_interface).to_string(),
        source: (*source).to_string(),
        destination: (*destination).to_string(),
        extra: extra.join(" "),
        raw: line.to_string(),
    })
}
