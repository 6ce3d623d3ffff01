//! Shared test utilities for core module tests
//!
//! Canned listings captured from a Docker host with one bridge network
//! (`br-1234567890ab`) and builders for hand-made [`Rule`]s.
//! This module is only compiled in test mode.

use crate::core::rule::{Rule, Table};
use std::sync::Mutex;

/// Mutex for tests that need exclusive access to environment variables.
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("FWPATH_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("FWPATH_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

/// `iptables -t filter -L -n -v --line-numbers` on a Docker host
pub const DOCKER_FILTER_LISTING: &str = "\
Chain INPUT (policy ACCEPT 0 packets, 0 bytes)
num   pkts bytes target     prot opt in     out     source               destination

Chain FORWARD (policy DROP 12 packets, 1200K bytes)
num   pkts bytes target     prot opt in     out     source               destination
1    2319K 1.2G DOCKER-USER  all  --  *      *       0.0.0.0/0            0.0.0.0/0
2    2319K 1.2G DOCKER-ISOLATION-STAGE-1  all  --  *      *       0.0.0.0/0            0.0.0.0/0
3        0     0 DOCKER     all  --  *      br-1234567890ab  0.0.0.0/0            0.0.0.0/0
4     231K   21M ACCEPT     all  --  *      br-1234567890ab  0.0.0.0/0            0.0.0.0/0            ctstate RELATED,ESTABLISHED
5      120  9600 ACCEPT     all  --  br-1234567890ab !br-1234567890ab  0.0.0.0/0            0.0.0.0/0
6        0     0 ACCEPT     all  --  br-1234567890ab br-1234567890ab  0.0.0.0/0            0.0.0.0/0

Chain OUTPUT (policy ACCEPT 0 packets, 0 bytes)
num   pkts bytes target     prot opt in     out     source               destination

Chain DOCKER (1 references)
num   pkts bytes target     prot opt in     out     source               destination

Chain DOCKER-ISOLATION-STAGE-1 (1 references)
num   pkts bytes target     prot opt in     out     source               destination
1      120  9600 DOCKER-ISOLATION-STAGE-2  all  --  br-1234567890ab !br-1234567890ab  0.0.0.0/0            0.0.0.0/0
2    2319K 1.2G RETURN     all  --  *      *       0.0.0.0/0            0.0.0.0/0

Chain DOCKER-ISOLATION-STAGE-2 (1 references)
num   pkts bytes target     prot opt in     out     source               destination
1        0     0 DROP       all  --  *      br-1234567890ab  0.0.0.0/0            0.0.0.0/0
2      120  9600 RETURN     all  --  *      *       0.0.0.0/0            0.0.0.0/0

Chain DOCKER-USER (1 references)
num   pkts bytes target     prot opt in     out     source               destination
1    2319K 1.2G RETURN     all  --  *      *       0.0.0.0/0            0.0.0.0/0
";

/// `iptables -t nat -L -n -v --line-numbers` on the same host, plus a
/// MASQUERADE rule for `tun0`
pub const NAT_LISTING: &str = "\
Chain PREROUTING (policy ACCEPT 10 packets, 800 bytes)
num   pkts bytes target     prot opt in     out     source               destination
1       50  3000 DOCKER     all  --  *      *       0.0.0.0/0            0.0.0.0/0            ADDRTYPE match dst-type LOCAL

Chain INPUT (policy ACCEPT 0 packets, 0 bytes)
num   pkts bytes target     prot opt in     out     source               destination

Chain OUTPUT (policy ACCEPT 5 packets, 400 bytes)
num   pkts bytes target     prot opt in     out     source               destination
1        0     0 DOCKER     all  --  *      *       0.0.0.0/0           !127.0.0.0/8          ADDRTYPE match dst-type LOCAL

Chain POSTROUTING (policy ACCEPT 5 packets, 400 bytes)
num   pkts bytes target     prot opt in     out     source               destination
1        3   180 MASQUERADE  all  --  *      !br-1234567890ab  172.20.0.0/16        0.0.0.0/0
2       40  2400 MASQUERADE  all  --  *      tun0    0.0.0.0/0            0.0.0.0/0

Chain DOCKER (2 references)
num   pkts bytes target     prot opt in     out     source               destination
1        0     0 RETURN     all  --  br-1234567890ab *       0.0.0.0/0            0.0.0.0/0
";

/// Builds a filter/FORWARD rule with any addresses and zero counters
pub fn rule(line: u32, target: &str, protocol: &str, in_iface: &str, out_iface: &str) -> Rule {
    chain_rule("FORWARD", line, target, protocol, in_iface, out_iface)
}

/// Builds a filter rule in the given chain
pub fn chain_rule(
    chain: &str,
    line: u32,
    target: &str,
    protocol: &str,
    in_iface: &str,
    out_iface: &str,
) -> Rule {
    Rule {
        table: Table::Filter,
        chain: chain.to_string(),
        line_number: line,
        packets: 0,
        bytes: 0,
        target: target.to_string(),
        protocol: protocol.to_string(),
        options: "--".to_string(),
        in_interface: in_iface.to_string(),
        out_interface: out_iface.to_string(),
        source: "0.0.0.0/0".to_string(),
        destination: "0.0.0.0/0".to_string(),
        extra: String::new(),
        raw: format!(
            "{line} 0 0 {target} {protocol} -- {in_iface} {out_iface} 0.0.0.0/0 0.0.0.0/0"
        ),
    }
}

/// Same as [`rule`] with a conntrack state in the extra column
pub fn stateful_rule(line: u32, in_iface: &str, out_iface: &str, state: &str) -> Rule {
    let mut r = rule(line, "ACCEPT", "all", in_iface, out_iface);
    r.extra = format!("ctstate {state}");
    r.raw = format!("{} ctstate {state}", r.raw);
    r
}
