//! Firewall snapshots and interface-centric views
//!
//! Reads tables through a [`FirewallBackend`] and parses them. A table that
//! cannot be listed is reported with its error instead of failing the whole
//! snapshot.

use crate::config::AppConfig;
use crate::core::backend::FirewallBackend;
use crate::core::error::{Error, Result};
use crate::core::parser::{ChainListing, ListingFormat, TableListing, parse_listing};
use crate::core::rule::{Rule, Table};
use crate::validators::{require_chain_name, require_interface};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;
use tracing::{debug, warn};

/// Lists and parses one table (form A).
pub async fn read_table<B: FirewallBackend>(backend: &B, table: Table) -> Result<TableListing> {
    let text = backend.list_table(table).await?;
    let listing = parse_listing(table, &text, ListingFormat::LineNumbered);
    if !listing.skipped.is_empty() {
        debug!(
            "{} table: skipped {} unparsable line(s)",
            table,
            listing.skipped.len()
        );
    }
    Ok(listing)
}

/// One table of a full snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableReport {
    pub table: Table,
    pub listing: Option<TableListing>,
    pub error: Option<String>,
}

/// Reads raw, mangle, nat and filter in that order.
pub async fn read_all_tables<B: FirewallBackend>(backend: &B) -> Vec<TableReport> {
    let mut reports = Vec::with_capacity(Table::ALL.len());
    for table in Table::ALL {
        let report = match read_table(backend, table).await {
            Ok(listing) => TableReport {
                table,
                listing: Some(listing),
                error: None,
            },
            Err(e) => {
                warn!("Cannot read {} table: {}", table, e);
                TableReport {
                    table,
                    listing: None,
                    error: Some(e.to_string()),
                }
            }
        };
        reports.push(report);
    }
    reports
}

/// Reads a single chain (form B). Rules are numbered in listing order.
pub async fn read_chain<B: FirewallBackend>(
    backend: &B,
    table: Table,
    chain: &str,
) -> Result<ChainListing> {
    require_chain_name("chain", chain)?;
    let text = backend.list_chain_verbose(table, chain).await?;
    parse_listing(table, &text, ListingFormat::Plain)
        .chains
        .into_iter()
        .find(|c| c.name == chain)
        .ok_or_else(|| Error::ChainNotFound {
            table: table.to_string(),
            chain: chain.to_string(),
        })
}

/// True if a rule names `iface` as either interface or mentions it
pub fn rule_references(rule: &Rule, iface: &str) -> bool {
    rule.in_interface == iface || rule.out_interface == iface || rule.mentions(iface)
}

/// Every rule across the readable tables that references `iface`
pub fn rules_for_interface<'a>(reports: &'a [TableReport], iface: &str) -> Vec<&'a Rule> {
    reports
        .iter()
        .filter_map(|r| r.listing.as_ref())
        .flat_map(TableListing::rules)
        .filter(|rule| rule_references(rule, iface))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TunnelKind {
    Tun,
    Tap,
    Unknown,
}

impl TunnelKind {
    pub fn from_name(name: &str) -> Self {
        if name.starts_with("tun") {
            Self::Tun
        } else if name.starts_with("tap") {
            Self::Tap
        } else {
            Self::Unknown
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelReport {
    pub name: String,
    pub kind: TunnelKind,
    pub local_address: Option<IpAddr>,
    pub peer_address: Option<IpAddr>,
    pub addresses: Vec<IpNetwork>,
    pub related_rules: Vec<Rule>,
    /// Bridges the tunnel's rules forward to or from
    pub connected_bridges: Vec<String>,
    /// Tables that could not be read
    pub errors: Vec<String>,
}

/// Builds the report for one tunnel interface.
pub async fn tunnel_report<B: FirewallBackend>(
    backend: &B,
    config: &AppConfig,
    name: &str,
) -> Result<TunnelReport> {
    require_interface("interface", name)?;
    if !backend.interface_exists(name).await? {
        return Err(Error::InterfaceNotFound(name.to_string()));
    }

    let addresses = backend.interface_addresses(name).await?;
    let peer_address = backend.tunnel_peer_address(name).await?;

    let tables = read_all_tables(backend).await;
    let related_rules: Vec<Rule> = rules_for_interface(&tables, name)
        .into_iter()
        .cloned()
        .collect();

    let connected_bridges = connected_bridges(&related_rules, name, &config.bridge_prefix);

    Ok(TunnelReport {
        name: name.to_string(),
        kind: TunnelKind::from_name(name),
        local_address: addresses.first().map(IpNetwork::ip),
        peer_address,
        addresses,
        related_rules,
        connected_bridges,
        errors: tables.into_iter().filter_map(|t| t.error).collect(),
    })
}

fn connected_bridges(rules: &[Rule], tunnel: &str, bridge_prefix: &str) -> Vec<String> {
    let is_bridge = |iface: &str| {
        (!bridge_prefix.is_empty() && iface.starts_with(bridge_prefix)) || iface.starts_with("docker")
    };

    let mut bridges = BTreeSet::new();
    for rule in rules {
        for iface in [&rule.in_interface, &rule.out_interface] {
            let iface = iface.trim_start_matches('!');
            if iface != tunnel && is_bridge(iface) {
                bridges.insert(iface.to_string());
            }
        }
    }
    bridges.into_iter().collect()
}

/// Line diff of two listings, `None` when they are identical
pub fn listing_diff(before: &str, after: &str) -> Option<String> {
    use std::fmt::Write;

    if before == after {
        return None;
    }
    let diff = similar::TextDiff::from_lines(before, after);
    let mut result = String::new();
    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            similar::ChangeTag::Delete => "- ",
            similar::ChangeTag::Insert => "+ ",
            similar::ChangeTag::Equal => "  ",
        };
        let _ = write!(result, "{sign}{change}");
    }
    Some(result)
}
