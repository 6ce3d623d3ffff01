//! In-memory firewall backend
//!
//! [`SimulatedBackend`] holds tables, chains, rules and interfaces and renders
//! them in the exact text format `iptables -L -n -v [--line-numbers]` prints,
//! so the real parser runs against it. Inserts honour iptables position
//! bounds and existence checks compare rules the way `iptables -C` does.
//!
//! The state lives behind a [`std::sync::Mutex`] that is never held across an
//! `.await`.
//!
//! # Example
//!
//! ```
//! use fwpath::core::simulated::{SimRule, SimulatedBackend};
//! use fwpath::core::rule::Table;
//!
//! let backend = SimulatedBackend::new()
//!     .with_interface("tun0", &[], Some("10.8.0.1"), true)
//!     .with_interface("br-1234567890ab", &["172.20.0.1/16"], None, true)
//!     .with_rule(Table::Filter, "FORWARD", SimRule::new("ACCEPT").input("tun0").output("br-1234567890ab"));
//! assert_eq!(backend.rule_count(Table::Filter, "FORWARD"), 1);
//! ```

use crate::core::backend::FirewallBackend;
use crate::core::error::{Error, Result};
use crate::core::netinfo::{Connection, InterfaceCounters, RouteEntry};
use crate::core::rule::{Rule, RuleSpec, Table};
use ipnetwork::IpNetwork;
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};

/// One stored rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimRule {
    pub target: String,
    pub protocol: String,
    pub in_interface: String,
    pub out_interface: String,
    pub source: String,
    pub destination: String,
    pub extra: String,
    pub packets: u64,
    pub bytes: u64,
}

impl SimRule {
    /// `<target> all -- * * 0.0.0.0/0 0.0.0.0/0`
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            protocol: "all".to_string(),
            in_interface: "*".to_string(),
            out_interface: "*".to_string(),
            source: "0.0.0.0/0".to_string(),
            destination: "0.0.0.0/0".to_string(),
            extra: String::new(),
            packets: 0,
            bytes: 0,
        }
    }

    pub fn protocol(mut self, protocol: &str) -> Self {
        self.protocol = protocol.to_string();
        self
    }

    pub fn input(mut self, iface: &str) -> Self {
        self.in_interface = iface.to_string();
        self
    }

    pub fn output(mut self, iface: &str) -> Self {
        self.out_interface = iface.to_string();
        self
    }

    pub fn source(mut self, source: &str) -> Self {
        self.source = source.to_string();
        self
    }

    pub fn extra(mut self, extra: &str) -> Self {
        self.extra = extra.to_string();
        self
    }

    pub fn counters(mut self, packets: u64, bytes: u64) -> Self {
        self.packets = packets;
        self.bytes = bytes;
        self
    }

    fn from_spec(spec: &RuleSpec) -> Self {
        let mut rule = Self::new(&spec.target);
        if let Some(iface) = &spec.in_interface {
            rule.in_interface.clone_from(iface);
        }
        if let Some(iface) = &spec.out_interface {
            rule.out_interface.clone_from(iface);
        }
        if let Some(state) = &spec.ctstate {
            rule.extra = format!("ctstate {state}");
        }
        rule
    }

    fn to_rule(&self, table: Table, chain: &str, line_number: u32) -> Rule {
        Rule {
            table,
            chain: chain.to_string(),
            line_number,
            packets: self.packets,
            bytes: self.bytes,
            target: self.target.clone(),
            protocol: self.protocol.clone(),
            options: "--".to_string(),
            in_interface: self.in_interface.clone(),
            out_interface: self.out_interface.clone(),
            source: self.source.clone(),
            destination: self.destination.clone(),
            extra: self.extra.clone(),
            raw: self.render(Some(line_number)).trim().to_string(),
        }
    }

    fn render(&self, line_number: Option<u32>) -> String {
        let mut line = String::new();
        if let Some(num) = line_number {
            let _ = write!(line, "{num:<5} ");
        }
        let _ = write!(
            line,
            "{:>5} {:>5} {:<10} {:<4} --  {:<6} {:<6} {:<20} {:<20} {}",
            self.packets,
            self.bytes,
            self.target,
            self.protocol,
            self.in_interface,
            self.out_interface,
            self.source,
            self.destination,
            self.extra
        );
        line.trim_end().to_string()
    }
}

#[derive(Debug, Clone)]
struct SimChain {
    name: String,
    policy: Option<String>,
    references: u32,
    rules: Vec<SimRule>,
}

#[derive(Debug, Clone)]
struct SimInterface {
    addresses: Vec<IpNetwork>,
    peer: Option<IpAddr>,
    up: bool,
    counters: InterfaceCounters,
}

#[derive(Debug, Default)]
struct SimState {
    tables: BTreeMap<Table, Vec<SimChain>>,
    interfaces: BTreeMap<String, SimInterface>,
    ip_forward: bool,
    routes: Vec<RouteEntry>,
    connections: Vec<Connection>,
    unreadable_tables: HashSet<Table>,
    read_only_chains: HashSet<(Table, String)>,
    mutations: Vec<String>,
}

impl SimState {
    fn chain(&self, table: Table, chain: &str) -> Result<&SimChain> {
        self.tables
            .get(&table)
            .and_then(|chains| chains.iter().find(|c| c.name == chain))
            .ok_or_else(|| chain_not_found(table, chain))
    }

    fn chain_mut(&mut self, table: Table, chain: &str) -> Result<&mut SimChain> {
        self.tables
            .get_mut(&table)
            .and_then(|chains| chains.iter_mut().find(|c| c.name == chain))
            .ok_or_else(|| chain_not_found(table, chain))
    }

    fn interface(&self, name: &str) -> Result<&SimInterface> {
        self.interfaces
            .get(name)
            .ok_or_else(|| Error::InterfaceNotFound(name.to_string()))
    }

    fn check_writable(&self, table: Table, chain: &str, args: Vec<String>) -> Result<()> {
        if self.read_only_chains.contains(&(table, chain.to_string())) {
            return Err(iptables_failed(
                args,
                "iptables v1.8.10 (nf_tables): Could not fetch rule set generation id: Permission denied (you must be root)\n",
            ));
        }
        Ok(())
    }
}

fn chain_not_found(table: Table, chain: &str) -> Error {
    Error::ChainNotFound {
        table: table.to_string(),
        chain: chain.to_string(),
    }
}

fn iptables_failed(args: Vec<String>, stderr: &str) -> Error {
    Error::ToolExecutionFailed {
        program: "iptables".to_string(),
        args,
        stderr: stderr.to_string(),
        exit_code: Some(1),
    }
}

const BUILTIN_CHAINS: [(Table, &[&str]); 4] = [
    (Table::Raw, &["PREROUTING", "OUTPUT"]),
    (
        Table::Mangle,
        &["PREROUTING", "INPUT", "FORWARD", "OUTPUT", "POSTROUTING"],
    ),
    (Table::Nat, &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"]),
    (Table::Filter, &["INPUT", "FORWARD", "OUTPUT"]),
];

const COLUMN_HEADER: &str =
    "pkts bytes target     prot opt in     out     source               destination";

/// In-memory [`FirewallBackend`]
#[derive(Debug)]
pub struct SimulatedBackend {
    state: Mutex<SimState>,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBackend {
    /// Empty built-in chains with ACCEPT policies, no interfaces,
    /// forwarding enabled
    pub fn new() -> Self {
        let mut state = SimState {
            ip_forward: true,
            ..SimState::default()
        };
        for (table, chains) in BUILTIN_CHAINS {
            state.tables.insert(
                table,
                chains
                    .iter()
                    .map(|name| SimChain {
                        name: (*name).to_string(),
                        policy: Some("ACCEPT".to_string()),
                        references: 0,
                        rules: Vec::new(),
                    })
                    .collect(),
            );
        }
        Self {
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn with_policy(self, table: Table, chain: &str, policy: &str) -> Self {
        if let Ok(c) = self.lock().chain_mut(table, chain) {
            c.policy = Some(policy.to_string());
        }
        self
    }

    /// Adds an empty user-defined chain
    pub fn with_chain(self, table: Table, chain: &str) -> Self {
        self.lock()
            .tables
            .entry(table)
            .or_default()
            .push(SimChain {
                name: chain.to_string(),
                policy: None,
                references: 1,
                rules: Vec::new(),
            });
        self
    }

    /// Appends a rule; the chain is created as a user chain if missing
    pub fn with_rule(self, table: Table, chain: &str, rule: SimRule) -> Self {
        let exists = self.lock().chain(table, chain).is_ok();
        let this = if exists { self } else { self.with_chain(table, chain) };
        if let Ok(c) = this.lock().chain_mut(table, chain) {
            c.rules.push(rule);
        }
        this
    }

    /// Adds an interface. `addresses` are CIDRs; unparsable entries are ignored.
    pub fn with_interface(
        self,
        name: &str,
        addresses: &[&str],
        peer: Option<&str>,
        up: bool,
    ) -> Self {
        let iface = SimInterface {
            addresses: addresses.iter().filter_map(|a| a.parse().ok()).collect(),
            peer: peer.and_then(|p| p.parse().ok()),
            up,
            counters: InterfaceCounters::default(),
        };
        self.lock().interfaces.insert(name.to_string(), iface);
        self
    }

    pub fn with_counters(self, name: &str, counters: InterfaceCounters) -> Self {
        if let Some(iface) = self.lock().interfaces.get_mut(name) {
            iface.counters = counters;
        }
        self
    }

    pub fn with_ip_forward(self, enabled: bool) -> Self {
        self.lock().ip_forward = enabled;
        self
    }

    pub fn with_routes(self, routes: Vec<RouteEntry>) -> Self {
        self.lock().routes = routes;
        self
    }

    pub fn with_connections(self, connections: Vec<Connection>) -> Self {
        self.lock().connections = connections;
        self
    }

    /// Listing this table fails as if permission were denied
    pub fn with_unreadable_table(self, table: Table) -> Self {
        self.lock().unreadable_tables.insert(table);
        self
    }

    /// Inserts and deletes in this chain fail as if permission were denied
    pub fn with_read_only_chain(self, table: Table, chain: &str) -> Self {
        self.lock()
            .read_only_chains
            .insert((table, chain.to_string()));
        self
    }

    /// Mutating commands applied so far, in order
    pub fn mutations(&self) -> Vec<String> {
        self.lock().mutations.clone()
    }

    pub fn rule_count(&self, table: Table, chain: &str) -> usize {
        self.lock().chain(table, chain).map_or(0, |c| c.rules.len())
    }

    pub fn ip_forward(&self) -> bool {
        self.lock().ip_forward
    }

    pub fn is_up(&self, name: &str) -> bool {
        self.lock().interfaces.get(name).is_some_and(|i| i.up)
    }

    fn render_chain(chain: &SimChain, numbered: bool) -> String {
        let mut out = String::new();
        let _ = match (&chain.policy, chain.references) {
            (Some(policy), _) => {
                writeln!(out, "Chain {} (policy {} 0 packets, 0 bytes)", chain.name, policy)
            }
            (None, refs) => writeln!(out, "Chain {} ({} references)", chain.name, refs),
        };
        if numbered {
            let _ = writeln!(out, "num   {COLUMN_HEADER}");
        } else {
            let _ = writeln!(out, " {COLUMN_HEADER}");
        }
        for (idx, rule) in chain.rules.iter().enumerate() {
            let num = numbered.then(|| idx as u32 + 1);
            let _ = writeln!(out, "{}", rule.render(num));
        }
        out
    }
}

impl FirewallBackend for SimulatedBackend {
    async fn list_table(&self, table: Table) -> Result<String> {
        let state = self.lock();
        if state.unreadable_tables.contains(&table) {
            return Err(iptables_failed(
                vec!["-t".to_string(), table.to_string(), "-L".to_string()],
                "iptables v1.8.10 (nf_tables): Could not fetch rule set generation id: Permission denied (you must be root)\n",
            ));
        }
        let chains = state.tables.get(&table).map(Vec::as_slice).unwrap_or_default();
        Ok(chains
            .iter()
            .map(|c| Self::render_chain(c, true))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    async fn list_chain_verbose(&self, table: Table, chain: &str) -> Result<String> {
        let state = self.lock();
        Ok(Self::render_chain(state.chain(table, chain)?, false))
    }

    async fn chain_exists(&self, table: Table, chain: &str) -> Result<bool> {
        Ok(self.lock().chain(table, chain).is_ok())
    }

    async fn rule_exists(&self, spec: &RuleSpec) -> Result<bool> {
        let state = self.lock();
        let chain = state.chain(spec.table, &spec.chain)?;
        Ok(chain
            .rules
            .iter()
            .enumerate()
            .any(|(idx, r)| spec.matches_rule(&r.to_rule(spec.table, &spec.chain, idx as u32 + 1))))
    }

    async fn insert_rule(&self, spec: &RuleSpec, position: u32) -> Result<()> {
        let mut state = self.lock();
        state.check_writable(spec.table, &spec.chain, spec.insert_args(position))?;
        let chain = state.chain_mut(spec.table, &spec.chain)?;
        let index = position as usize;
        if index == 0 || index > chain.rules.len() + 1 {
            return Err(iptables_failed(
                spec.insert_args(position),
                "iptables: Index of insertion too big.\n",
            ));
        }
        chain.rules.insert(index - 1, SimRule::from_spec(spec));
        state.mutations.push(spec.insert_command(position));
        Ok(())
    }

    async fn delete_rule(&self, table: Table, chain: &str, line_number: u32) -> Result<()> {
        let args = vec![
            "-t".to_string(),
            table.to_string(),
            "-D".to_string(),
            chain.to_string(),
            line_number.to_string(),
        ];
        let mut state = self.lock();
        state.check_writable(table, chain, args.clone())?;
        let sim_chain = state.chain_mut(table, chain)?;
        let index = line_number as usize;
        if index == 0 || index > sim_chain.rules.len() {
            return Err(iptables_failed(args, "iptables: Index of deletion too big.\n"));
        }
        sim_chain.rules.remove(index - 1);
        let table_arg = if table == Table::Filter {
            String::new()
        } else {
            format!("-t {table} ")
        };
        state
            .mutations
            .push(format!("iptables {table_arg}-D {chain} {line_number}"));
        Ok(())
    }

    async fn interface_exists(&self, name: &str) -> Result<bool> {
        Ok(self.lock().interfaces.contains_key(name))
    }

    async fn interface_addresses(&self, name: &str) -> Result<Vec<IpNetwork>> {
        Ok(self.lock().interface(name)?.addresses.clone())
    }

    async fn tunnel_peer_address(&self, name: &str) -> Result<Option<IpAddr>> {
        Ok(self.lock().interface(name)?.peer)
    }

    async fn interface_is_up(&self, name: &str) -> Result<bool> {
        Ok(self.lock().interface(name)?.up)
    }

    async fn set_interface_up(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        let iface = state
            .interfaces
            .get_mut(name)
            .ok_or_else(|| Error::InterfaceNotFound(name.to_string()))?;
        iface.up = true;
        state.mutations.push(format!("ip link set {name} up"));
        Ok(())
    }

    async fn ip_forward_enabled(&self) -> Result<bool> {
        Ok(self.lock().ip_forward)
    }

    async fn enable_ip_forward(&self) -> Result<()> {
        let mut state = self.lock();
        state.ip_forward = true;
        state
            .mutations
            .push("sysctl -w net.ipv4.ip_forward=1".to_string());
        Ok(())
    }

    async fn interface_counters(&self, name: &str) -> Result<InterfaceCounters> {
        Ok(self.lock().interface(name)?.counters)
    }

    async fn list_routes(&self) -> Result<Vec<RouteEntry>> {
        Ok(self.lock().routes.clone())
    }

    async fn list_connections(&self) -> Result<Vec<Connection>> {
        Ok(self.lock().connections.clone())
    }
}
