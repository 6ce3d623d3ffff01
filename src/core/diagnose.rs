//! Tunnel/bridge connectivity diagnosis
//!
//! [`Diagnostician::analyze`] combines one read of the filter and nat tables
//! with the path matcher and the isolation analyzer into a
//! [`ConnectivityAnalysis`]: relevant rules, a step-by-step packet trace,
//! traffic statistics and recommendations with copy-pasteable commands.
//!
//! Both interfaces must exist, and the filter table must be readable, before
//! anything is reported. Everything else that fails is collected into
//! [`ConnectivityAnalysis::errors`] and the analysis continues.

use crate::config::AppConfig;
use crate::core::backend::FirewallBackend;
use crate::core::error::{Error, Result};
use crate::core::isolation::{IsolationReport, analyze_isolation};
use crate::core::matcher::{InterfacePair, PathMatch, match_path};
use crate::core::netinfo::InterfaceCounters;
use crate::core::rule::{Rule, RuleSpec, Table, is_wildcard_interface};
use crate::core::snapshot::read_table;
use crate::validators::{require_chain_name, require_interface};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tracing::{debug, info, warn};

/// One hop of the packet trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathStep {
    pub step: u32,
    pub description: String,
    pub table: String,
    pub chain: String,
    pub action: String,
    pub interface: Option<String>,
}

impl PathStep {
    fn new(step: u32, table: &str, chain: &str, action: &str, description: String) -> Self {
        Self {
            step,
            description,
            table: table.to_string(),
            chain: chain.to_string(),
            action: action.to_string(),
            interface: None,
        }
    }

    fn on(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }
}

/// Counter totals for the pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficStats {
    pub tunnel_to_bridge_packets: u64,
    pub tunnel_to_bridge_bytes: u64,
    pub bridge_to_tunnel_packets: u64,
    pub bridge_to_tunnel_bytes: u64,
    pub forwarded_packets: u64,
    pub dropped_packets: u64,
    /// Derived from interface counters, not from rule counters
    pub estimated: bool,
}

impl TrafficStats {
    /// Dropped share of forwarded + dropped packets, in percent
    pub fn drop_rate_percent(&self) -> Option<f64> {
        let total = self.forwarded_packets.saturating_add(self.dropped_packets);
        (self.dropped_packets > 0 && total > 0)
            .then(|| self.dropped_packets as f64 / total as f64 * 100.0)
    }
}

/// Diagnostic result for one tunnel/bridge pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityAnalysis {
    pub tunnel: String,
    pub bridge: String,
    /// Peer address when the tunnel has one, local addresses otherwise
    pub tunnel_addresses: Vec<IpAddr>,
    pub bridge_addresses: Vec<IpAddr>,
    pub forward_rules: Vec<Rule>,
    pub nat_rules: Vec<Rule>,
    pub isolation_rules: Vec<Rule>,
    pub tunnel_to_bridge: PathMatch,
    pub bridge_to_tunnel: PathMatch,
    pub isolation: IsolationReport,
    pub path: Vec<PathStep>,
    pub statistics: TrafficStats,
    pub recommendations: Vec<String>,
    /// What could not be gathered
    pub errors: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

impl ConnectivityAnalysis {
    /// Both directions permitted and the isolation chain does not block
    pub fn is_connected(&self) -> bool {
        self.tunnel_to_bridge.permitted()
            && self.bridge_to_tunnel.permitted()
            && !self.isolation.is_blocking()
    }
}

pub struct Diagnostician<'a, B> {
    backend: &'a B,
    config: &'a AppConfig,
}

impl<'a, B: FirewallBackend> Diagnostician<'a, B> {
    pub fn new(backend: &'a B, config: &'a AppConfig) -> Self {
        Self { backend, config }
    }

    /// Runs the full analysis for `tunnel` and `bridge`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidInput`] for malformed names, [`Error::InterfaceNotFound`]
    /// if either interface is missing, and any backend error from reading
    /// the filter table.
    pub async fn analyze(&self, tunnel: &str, bridge: &str) -> Result<ConnectivityAnalysis> {
        require_interface("tunnel", tunnel)?;
        require_interface("bridge", bridge)?;
        require_chain_name("isolation_chain", &self.config.isolation_chain)?;

        for name in [tunnel, bridge] {
            if !self.backend.interface_exists(name).await? {
                return Err(Error::InterfaceNotFound(name.to_string()));
            }
        }

        if !self.config.is_tunnel_name(tunnel) {
            warn!("{} does not use a tunnel prefix, continuing anyway", tunnel);
        }
        info!("Diagnosing connectivity {} <-> {}", tunnel, bridge);
        let mut errors = Vec::new();

        let tunnel_addresses = self.resolve_addresses(tunnel, true, &mut errors).await;
        let bridge_addresses = self.resolve_addresses(bridge, false, &mut errors).await;

        let filter = read_table(self.backend, Table::Filter).await?;
        let forward_chain = filter.chain_rules("FORWARD");
        let forward_rules: Vec<Rule> = forward_chain
            .iter()
            .filter(|r| forward_rule_is_relevant(r, tunnel, bridge))
            .cloned()
            .collect();

        let isolation_chain = &self.config.isolation_chain;
        let isolation_present = filter.chain(isolation_chain).is_some();
        let isolation_rules: Vec<Rule> = filter
            .chain_rules(isolation_chain)
            .iter()
            .filter(|r| isolation_rule_is_relevant(r, bridge))
            .cloned()
            .collect();

        let nat_rules = match read_table(self.backend, Table::Nat).await {
            Ok(nat) => nat
                .rules()
                .filter(|r| nat_rule_is_relevant(r, tunnel, bridge))
                .cloned()
                .collect(),
            Err(e) => {
                warn!("NAT rules unavailable: {}", e);
                errors.push(format!("nat table: {e}"));
                Vec::new()
            }
        };

        let pair = InterfacePair::new(tunnel, bridge);
        let tunnel_to_bridge = match_path(forward_chain, &pair);
        let bridge_to_tunnel = match_path(forward_chain, &pair.reversed());

        let isolation = analyze_isolation(
            isolation_chain,
            isolation_present,
            &isolation_rules,
            tunnel,
            bridge,
            &self.config.bridge_prefix,
        );

        let statistics = self.traffic_stats(tunnel, bridge, &forward_rules).await;

        let mut analysis = ConnectivityAnalysis {
            tunnel: tunnel.to_string(),
            bridge: bridge.to_string(),
            tunnel_addresses,
            bridge_addresses,
            forward_rules,
            nat_rules,
            isolation_rules,
            tunnel_to_bridge,
            bridge_to_tunnel,
            isolation,
            path: Vec::new(),
            statistics,
            recommendations: Vec::new(),
            errors,
            generated_at: Utc::now(),
        };
        analysis.path = packet_path(&analysis);
        analysis.recommendations = recommendations(&analysis, self.config);

        debug!(
            "Diagnosis {} <-> {}: forward {}, return {}, isolation {}",
            tunnel,
            bridge,
            analysis.tunnel_to_bridge.found,
            analysis.bridge_to_tunnel.found,
            analysis.isolation.verdict
        );
        Ok(analysis)
    }

    async fn resolve_addresses(
        &self,
        name: &str,
        prefer_peer: bool,
        errors: &mut Vec<String>,
    ) -> Vec<IpAddr> {
        if prefer_peer {
            match self.backend.tunnel_peer_address(name).await {
                Ok(Some(peer)) => return vec![peer],
                Ok(None) => {}
                Err(e) => {
                    warn!("Cannot read peer address of {}: {}", name, e);
                    errors.push(format!("{name} peer address: {e}"));
                }
            }
        }

        match self.backend.interface_addresses(name).await {
            Ok(nets) => nets.iter().map(ipnetwork::IpNetwork::ip).collect(),
            Err(e) => {
                warn!("Cannot read addresses of {}: {}", name, e);
                errors.push(format!("{name} addresses: {e}"));
                Vec::new()
            }
        }
    }

    async fn traffic_stats(&self, tunnel: &str, bridge: &str, rules: &[Rule]) -> TrafficStats {
        let prefix = self.config.bridge_prefix.as_str();
        let is_bridge = |iface: &str| iface == bridge || (!prefix.is_empty() && iface.starts_with(prefix));

        let mut stats = TrafficStats::default();
        for rule in rules {
            let outbound = rule.in_interface == tunnel && is_bridge(&rule.out_interface);
            let inbound = is_bridge(&rule.in_interface) && rule.out_interface == tunnel;
            if outbound {
                stats.tunnel_to_bridge_packets = stats.tunnel_to_bridge_packets.saturating_add(rule.packets);
                stats.tunnel_to_bridge_bytes = stats.tunnel_to_bridge_bytes.saturating_add(rule.bytes);
            }
            if inbound {
                stats.bridge_to_tunnel_packets = stats.bridge_to_tunnel_packets.saturating_add(rule.packets);
                stats.bridge_to_tunnel_bytes = stats.bridge_to_tunnel_bytes.saturating_add(rule.bytes);
            }
            if outbound || inbound {
                match rule.target.as_str() {
                    "ACCEPT" => {
                        stats.forwarded_packets = stats.forwarded_packets.saturating_add(rule.packets);
                    }
                    "DROP" | "REJECT" => {
                        stats.dropped_packets = stats.dropped_packets.saturating_add(rule.packets);
                    }
                    _ => {}
                }
            }
        }

        if stats.tunnel_to_bridge_packets == 0 && stats.bridge_to_tunnel_packets == 0 {
            let divisor = self.config.estimate_divisor.max(1);
            debug!("No rule counters for the pair, estimating from interface counters / {}", divisor);
            if let Some(c) = self.transmit_counters(tunnel).await {
                stats.tunnel_to_bridge_packets = c.tx_packets / divisor;
                stats.tunnel_to_bridge_bytes = c.tx_bytes / divisor;
                stats.estimated = true;
            }
            if let Some(c) = self.transmit_counters(bridge).await {
                stats.bridge_to_tunnel_packets = c.tx_packets / divisor;
                stats.bridge_to_tunnel_bytes = c.tx_bytes / divisor;
                stats.estimated = true;
            }
        }

        stats
    }

    /// Interface counters worth estimating from: readable and not all zero
    async fn transmit_counters(&self, name: &str) -> Option<InterfaceCounters> {
        match self.backend.interface_counters(name).await {
            Ok(c) if c.tx_packets > 0 || c.tx_bytes > 0 => Some(c),
            Ok(_) => {
                debug!("{} has not transmitted anything, no estimate", name);
                None
            }
            Err(e) => {
                debug!("No counters for {}: {}", name, e);
                None
            }
        }
    }
}

/// Either direction, one side wildcarded, or both names in the rule text.
/// Negated names (`!br-x`) count as references here.
fn forward_rule_is_relevant(rule: &Rule, tunnel: &str, bridge: &str) -> bool {
    let (i, o) = (rule.in_interface.as_str(), rule.out_interface.as_str());
    (i == tunnel && o == bridge)
        || (i == bridge && o == tunnel)
        || (i == tunnel && is_wildcard_interface(o))
        || (is_wildcard_interface(i) && o == bridge)
        || (rule.refers_to(tunnel) && rule.refers_to(bridge))
}

fn isolation_rule_is_relevant(rule: &Rule, bridge: &str) -> bool {
    rule.targets_any(&["DROP", "RETURN", "ACCEPT"])
        && (rule.in_interface == bridge || rule.out_interface == bridge || rule.refers_to(bridge))
}

/// MASQUERADE rules are keyed by output interface only, so they count even
/// when they never name the bridge.
fn nat_rule_is_relevant(rule: &Rule, tunnel: &str, bridge: &str) -> bool {
    let chain_ok = matches!(rule.chain.as_str(), "PREROUTING" | "POSTROUTING" | "OUTPUT");
    let mentioned = rule.refers_to(tunnel) || rule.refers_to(bridge);
    let masquerade = rule.target == "MASQUERADE"
        && (rule.out_interface == tunnel || rule.in_interface == tunnel);
    chain_ok && (mentioned || masquerade)
}

fn has_masquerade_for(rules: &[Rule], tunnel: &str) -> bool {
    rules
        .iter()
        .any(|r| r.target == "MASQUERADE" && r.out_interface == tunnel)
}

fn verdict_text(path: &PathMatch) -> String {
    match (&path.shadowed_by, path.first_match()) {
        (Some(blocker), _) => format!("blocked by line {} before the ACCEPT", blocker.line_number),
        (None, Some(rule)) => format!("permitted by line {}", rule.line_number),
        (None, None) => "no permitting rule".to_string(),
    }
}

/// PREROUTING to egress, annotated with the matcher and isolation results
fn packet_path(analysis: &ConnectivityAnalysis) -> Vec<PathStep> {
    let (tunnel, bridge) = (analysis.tunnel.as_str(), analysis.bridge.as_str());
    let pair = format!("{tunnel}->{bridge}");
    let forward_action = if analysis.tunnel_to_bridge.permitted() {
        "ACCEPT"
    } else {
        "DROP"
    };
    let isolation_action = match (analysis.isolation.is_blocking(), analysis.isolation.bypass_present) {
        (true, _) => "DROP",
        (false, true) => "RETURN",
        (false, false) => "pass",
    };
    let masquerade = if has_masquerade_for(&analysis.nat_rules, tunnel) {
        format!("MASQUERADE via {tunnel} present")
    } else {
        format!("no MASQUERADE rule for {tunnel}")
    };

    let mut steps = vec![
        PathStep::new(1, "raw", "PREROUTING", "conntrack", format!("Packet enters on {tunnel}"))
            .on(tunnel),
        PathStep::new(2, "mangle", "PREROUTING", "mark", "Packet marking".to_string()),
        PathStep::new(3, "nat", "PREROUTING", "DNAT", "Destination NAT check".to_string())
            .on(tunnel),
        PathStep::new(4, "mangle", "FORWARD", "mark", "Pre-forward packet handling".to_string()),
        PathStep::new(
            5,
            "filter",
            "FORWARD",
            forward_action,
            format!(
                "Forward check ({tunnel} -> {bridge}): {}; return path ({bridge} -> {tunnel}): {}",
                verdict_text(&analysis.tunnel_to_bridge),
                verdict_text(&analysis.bridge_to_tunnel)
            ),
        )
        .on(pair.clone()),
        PathStep::new(
            6,
            "filter",
            &analysis.isolation.chain,
            isolation_action,
            format!("Isolation check ({}): {}", analysis.isolation.chain, analysis.isolation.status),
        )
        .on(pair),
        PathStep::new(7, "mangle", "POSTROUTING", "mark", "Post-forward packet handling".to_string()),
        PathStep::new(8, "nat", "POSTROUTING", "SNAT", format!("Source NAT: {masquerade}"))
            .on(bridge),
        PathStep::new(9, "output", "OUTPUT", "send", format!("Packet leaves via {bridge}"))
            .on(bridge),
    ];

    if !analysis.errors.is_empty() {
        steps.push(PathStep::new(
            10,
            "analysis",
            "RULE_ANALYSIS",
            "incomplete",
            format!("Analysis incomplete: {}", analysis.errors.join("; ")),
        ));
    }
    steps
}

fn recommendations(analysis: &ConnectivityAnalysis, config: &AppConfig) -> Vec<String> {
    let (tunnel, bridge) = (analysis.tunnel.as_str(), analysis.bridge.as_str());
    let mut out = Vec::new();

    let forward = &analysis.tunnel_to_bridge;
    let back = &analysis.bridge_to_tunnel;

    if !forward.found {
        out.push(format!(
            "Missing forward rule {tunnel} -> {bridge}, run: {}",
            RuleSpec::forward_accept(tunnel, bridge).insert_command(1)
        ));
    }
    if !back.found {
        out.push(format!(
            "Missing return-path rule {bridge} -> {tunnel}, run: {}",
            RuleSpec::forward_return_path(bridge, tunnel).insert_command(2)
        ));
    }

    if config.strict_first_match {
        for path in [forward, back] {
            if let (Some(blocker), Some(accept)) = (&path.shadowed_by, path.first_match()) {
                out.push(format!(
                    "{} drops {} before the ACCEPT at line {}; move the ACCEPT rule above line {}",
                    blocker.describe(),
                    path.pair,
                    accept.line_number,
                    blocker.line_number
                ));
            }
        }
    }

    let permitted = |p: &PathMatch| {
        if config.strict_first_match {
            p.permitted()
        } else {
            p.found
        }
    };

    if !(forward.found && back.found) && !has_masquerade_for(&analysis.nat_rules, tunnel) {
        out.push(format!(
            "Missing MASQUERADE rule, run: {}",
            RuleSpec::masquerade(tunnel).append_command()
        ));
    }

    if let Some(rate) = analysis.statistics.drop_rate_percent()
        && rate > config.drop_rate_warning_percent
    {
        out.push(format!(
            "High drop rate ({rate:.2}%) for this pair, review the FORWARD rule order"
        ));
    }

    if analysis.forward_rules.len() > config.forward_rule_count_hint {
        out.push(format!(
            "{} FORWARD rules involve this pair, put frequently used rules first",
            analysis.forward_rules.len()
        ));
    }
    if analysis.forward_rules.is_empty() {
        out.push("No FORWARD rules reference this pair, check the iptables configuration".to_string());
    }
    if analysis.nat_rules.is_empty() {
        out.push("No NAT rules reference this pair, a MASQUERADE rule may be required".to_string());
    }

    let isolation = &analysis.isolation;
    if !analysis.isolation_rules.is_empty() {
        if isolation.effective_drops > 0 {
            out.push(format!(
                "⚠ {} effective isolation DROP rule(s) block this path",
                isolation.effective_drops
            ));
            out.push(format!(
                "Add an isolation bypass, run: {}",
                RuleSpec::isolation_bypass(&isolation.chain, tunnel, bridge).insert_command(1)
            ));
        } else if isolation.ineffective_drops > 0 && isolation.bypass_present {
            out.push(format!(
                "✓ {} isolation DROP rule(s) are bypassed by the RETURN rule at line {}",
                isolation.ineffective_drops,
                isolation.bypass_line.unwrap_or_default()
            ));
        } else {
            out.push(format!("{} does not affect this path", isolation.chain));
        }
    }

    if permitted(forward) && permitted(back) && !isolation.is_blocking() {
        out.insert(0, "Configuration normal: forwarding is permitted in both directions".to_string());
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::simulated::{SimRule, SimulatedBackend};
    use pretty_assertions::assert_eq;

    const TUN: &str = "tun0";
    const BR: &str = "br-1234567890ab";

    fn base() -> SimulatedBackend {
        SimulatedBackend::new()
            .with_policy(Table::Filter, "FORWARD", "DROP")
            .with_interface(TUN, &["10.8.0.2/32"], Some("10.8.0.1"), true)
            .with_interface(BR, &["172.20.0.1/16"], None, true)
    }

    fn connected(backend: SimulatedBackend) -> SimulatedBackend {
        backend
            .with_rule(
                Table::Filter,
                "FORWARD",
                SimRule::new("ACCEPT").input(TUN).output(BR).counters(900, 90_000),
            )
            .with_rule(
                Table::Filter,
                "FORWARD",
                SimRule::new("ACCEPT")
                    .input(BR)
                    .output(TUN)
                    .extra("ctstate RELATED,ESTABLISHED")
                    .counters(800, 80_000),
            )
            .with_rule(Table::Nat, "POSTROUTING", SimRule::new("MASQUERADE").output(TUN))
    }

    async fn analyze(backend: &SimulatedBackend) -> ConnectivityAnalysis {
        let config = AppConfig::default();
        Diagnostician::new(backend, &config)
            .analyze(TUN, BR)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_empty_forward_chain() {
        let analysis = analyze(&base()).await;

        assert!(!analysis.tunnel_to_bridge.found);
        assert!(!analysis.bridge_to_tunnel.found);
        assert!(!analysis.is_connected());
        assert_eq!(analysis.tunnel_addresses, ["10.8.0.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(analysis.bridge_addresses, ["172.20.0.1".parse::<IpAddr>().unwrap()]);
        assert!(!analysis.isolation.chain_present);

        let all = analysis.recommendations.join("\n");
        assert!(all.contains("iptables -I FORWARD 1 -i tun0 -o br-1234567890ab -j ACCEPT"));
        assert!(all.contains(
            "iptables -I FORWARD 2 -i br-1234567890ab -o tun0 -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT"
        ));
        assert!(all.contains("iptables -t nat -A POSTROUTING -o tun0 -j MASQUERADE"));
        assert!(all.contains("No FORWARD rules reference this pair"));
        assert!(!all.contains("Configuration normal"));
    }

    #[tokio::test]
    async fn test_connected_pair() {
        let analysis = analyze(&connected(base())).await;

        assert!(analysis.is_connected());
        assert_eq!(analysis.forward_rules.len(), 2);
        assert_eq!(analysis.nat_rules.len(), 1);
        assert_eq!(analysis.statistics.forwarded_packets, 1700);
        assert_eq!(analysis.statistics.tunnel_to_bridge_bytes, 90_000);
        assert!(!analysis.statistics.estimated);
        assert!(analysis.recommendations[0].starts_with("Configuration normal"));
        assert!(!analysis.recommendations.iter().any(|r| r.contains("iptables -I")));
    }

    #[tokio::test]
    async fn test_path_has_nine_steps_without_errors() {
        let analysis = analyze(&connected(base())).await;
        let numbers: Vec<u32> = analysis.path.iter().map(|s| s.step).collect();
        assert_eq!(numbers, (1..=9).collect::<Vec<_>>());
        assert_eq!(analysis.path[4].action, "ACCEPT");
        assert!(analysis.path[4].description.contains("permitted by line 1"));
    }

    #[tokio::test]
    async fn test_nat_failure_adds_analysis_step() {
        let backend = connected(base()).with_unreadable_table(Table::Nat);
        let analysis = analyze(&backend).await;

        assert_eq!(analysis.errors.len(), 1);
        assert!(analysis.errors[0].starts_with("nat table:"));
        assert_eq!(analysis.path.len(), 10);
        assert_eq!(analysis.path[9].chain, "RULE_ANALYSIS");
    }

    #[tokio::test]
    async fn test_filter_failure_is_fatal() {
        let backend = base().with_unreadable_table(Table::Filter);
        let config = AppConfig::default();
        let result = Diagnostician::new(&backend, &config).analyze(TUN, BR).await;
        assert!(matches!(result, Err(Error::ToolExecutionFailed { .. })));
    }

    #[tokio::test]
    async fn test_missing_interface() {
        let backend = SimulatedBackend::new().with_interface(TUN, &[], None, true);
        let config = AppConfig::default();
        let result = Diagnostician::new(&backend, &config).analyze(TUN, BR).await;
        assert!(matches!(result, Err(Error::InterfaceNotFound(ref n)) if n == BR));
    }

    #[tokio::test]
    async fn test_effective_isolation_drop() {
        let backend = connected(base())
            .with_rule(
                Table::Filter,
                "DOCKER-ISOLATION-STAGE-2",
                SimRule::new("DROP").output(BR),
            )
            .with_rule(Table::Filter, "DOCKER-ISOLATION-STAGE-2", SimRule::new("RETURN"));
        let analysis = analyze(&backend).await;

        assert_eq!(analysis.isolation_rules.len(), 1);
        assert_eq!(analysis.isolation.effective_drops, 1);
        assert!(!analysis.is_connected());
        assert_eq!(analysis.path[5].action, "DROP");
        assert!(analysis.recommendations.iter().any(|r| {
            r.contains("iptables -I DOCKER-ISOLATION-STAGE-2 1 -i tun0 -o br-1234567890ab -j RETURN")
        }));
    }

    #[tokio::test]
    async fn test_bypassed_isolation_drop() {
        let backend = connected(base())
            .with_rule(
                Table::Filter,
                "DOCKER-ISOLATION-STAGE-2",
                SimRule::new("RETURN").input(TUN).output(BR),
            )
            .with_rule(
                Table::Filter,
                "DOCKER-ISOLATION-STAGE-2",
                SimRule::new("DROP").output(BR),
            );
        let analysis = analyze(&backend).await;

        assert!(analysis.is_connected());
        assert_eq!(analysis.isolation.ineffective_drops, 1);
        assert!(analysis
            .recommendations
            .iter()
            .any(|r| r.contains("bypassed by the RETURN rule at line 1")));
    }

    #[tokio::test]
    async fn test_shadowed_accept() {
        let backend = base()
            .with_rule(Table::Filter, "FORWARD", SimRule::new("DROP").input(TUN).output(BR))
            .with_rule(Table::Filter, "FORWARD", SimRule::new("ACCEPT").input(TUN).output(BR));
        let analysis = analyze(&backend).await;

        assert!(analysis.tunnel_to_bridge.found);
        assert!(!analysis.tunnel_to_bridge.permitted());
        assert!(analysis
            .recommendations
            .iter()
            .any(|r| r.contains("move the ACCEPT rule above line 1")));
    }

    #[tokio::test]
    async fn test_estimated_statistics() {
        let backend = base().with_counters(
            TUN,
            InterfaceCounters {
                tx_packets: 1000,
                tx_bytes: 50_000,
                ..InterfaceCounters::default()
            },
        );
        let analysis = analyze(&backend).await;

        assert!(analysis.statistics.estimated);
        assert_eq!(analysis.statistics.tunnel_to_bridge_packets, 100);
        assert_eq!(analysis.statistics.tunnel_to_bridge_bytes, 5000);
    }

    #[tokio::test]
    async fn test_zero_interface_counters_are_not_an_estimate() {
        let analysis = analyze(&base()).await;

        assert!(!analysis.statistics.estimated);
        assert_eq!(analysis.statistics.tunnel_to_bridge_packets, 0);
        assert_eq!(analysis.statistics.bridge_to_tunnel_packets, 0);
    }

    #[tokio::test]
    async fn test_saturated_counters_do_not_overflow() {
        let backend = base()
            .with_rule(
                Table::Filter,
                "FORWARD",
                SimRule::new("ACCEPT").input(TUN).output(BR).counters(u64::MAX, u64::MAX),
            )
            .with_rule(
                Table::Filter,
                "FORWARD",
                SimRule::new("DROP").input(TUN).output(BR).counters(u64::MAX, u64::MAX),
            );
        let analysis = analyze(&backend).await;

        assert_eq!(analysis.statistics.tunnel_to_bridge_packets, u64::MAX);
        assert_eq!(analysis.statistics.forwarded_packets, u64::MAX);
        assert!(analysis.statistics.drop_rate_percent().is_some());
    }

    #[tokio::test]
    async fn test_negated_bridge_masquerade_is_relevant() {
        let backend = base().with_rule(
            Table::Nat,
            "POSTROUTING",
            SimRule::new("MASQUERADE")
                .output(&format!("!{BR}"))
                .source("172.20.0.0/16"),
        );
        let analysis = analyze(&backend).await;

        assert_eq!(analysis.nat_rules.len(), 1);
        assert_eq!(analysis.nat_rules[0].out_interface, format!("!{BR}"));
        assert!(
            !analysis
                .recommendations
                .iter()
                .any(|r| r.starts_with("No NAT rules reference this pair"))
        );
    }

    #[tokio::test]
    async fn test_high_drop_rate() {
        let backend = connected(base()).with_rule(
            Table::Filter,
            "FORWARD",
            SimRule::new("DROP").input(TUN).output(BR).counters(300, 30_000),
        );
        let analysis = analyze(&backend).await;
        assert_eq!(analysis.statistics.dropped_packets, 300);
        assert!(analysis
            .recommendations
            .iter()
            .any(|r| r.starts_with("High drop rate (15.00%)")));
    }

    #[test]
    fn test_relevance_filters() {
        use crate::core::test_helpers::{chain_rule, rule};

        assert!(forward_rule_is_relevant(&rule(1, "ACCEPT", "all", "*", BR), TUN, BR));
        assert!(forward_rule_is_relevant(&rule(1, "ACCEPT", "all", BR, TUN), TUN, BR));
        assert!(!forward_rule_is_relevant(&rule(1, "ACCEPT", "all", "eth0", BR), TUN, BR));

        let mut masq = chain_rule("POSTROUTING", 1, "MASQUERADE", "all", "*", TUN);
        masq.table = Table::Nat;
        masq.raw.clear();
        assert!(nat_rule_is_relevant(&masq, TUN, BR));
        masq.chain = "INPUT".to_string();
        assert!(!nat_rule_is_relevant(&masq, TUN, BR));
    }
}
