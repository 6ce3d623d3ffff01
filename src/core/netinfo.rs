//! Network introspection records
//!
//! Structured views of `ip addr`, `ip route`, `ss -tuln` and
//! `/sys/class/net/<if>/statistics`. The parsers here are pure; the backend
//! runs the tools and hands the text over. Field counts differ between
//! iproute2 versions, so every parser tokenizes defensively and drops lines
//! it cannot read instead of failing.

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use tracing::debug;

/// Interface state from `ip addr show dev <if>`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceAddresses {
    pub up: bool,
    pub addresses: Vec<IpNetwork>,
    /// Point-to-point peer (`inet A peer B/32`)
    pub peer: Option<IpAddr>,
}

/// Parses `ip addr show` output for a single interface.
pub fn parse_ip_addr(text: &str) -> InterfaceAddresses {
    let mut info = InterfaceAddresses::default();

    for line in text.lines() {
        let trimmed = line.trim();
        if let (Some(start), Some(end)) = (trimmed.find('<'), trimmed.find('>'))
            && start < end
            && !trimmed.starts_with("inet")
        {
            info.up = trimmed[start + 1..end].split(',').any(|flag| flag == "UP");
            continue;
        }

        let mut tokens = trimmed.split_whitespace();
        if tokens.next() != Some("inet") {
            continue;
        }
        let Some(local) = tokens.next() else {
            continue;
        };
        match parse_network(local) {
            Some(net) => info.addresses.push(net),
            None => debug!("Ignoring unparsable inet address {:?}", local),
        }

        while let Some(token) = tokens.next() {
            if token == "peer" {
                info.peer = tokens.next().and_then(parse_host);
                break;
            }
        }
    }

    info
}

/// `10.8.0.2/24`, or a bare address as a host network
fn parse_network(token: &str) -> Option<IpNetwork> {
    token
        .parse::<IpNetwork>()
        .ok()
        .or_else(|| token.parse::<IpAddr>().ok().map(IpNetwork::from))
}

/// Address part of `10.8.0.1/32` or `10.8.0.1`
fn parse_host(token: &str) -> Option<IpAddr> {
    token.split('/').next()?.parse().ok()
}

/// First host-route destination in `ip route show dev <if>`, used as the
/// tunnel peer when `ip addr` has no `peer` field.
pub fn peer_from_routes(text: &str) -> Option<IpAddr> {
    text.lines()
        .filter_map(|line| line.split_whitespace().next())
        .find_map(|first| first.parse::<IpAddr>().ok())
}

/// One row of `ip route show`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub destination: IpNetwork,
    pub gateway: Option<IpAddr>,
    pub interface: Option<String>,
    pub source: Option<IpAddr>,
    pub metric: Option<u32>,
}

/// Parses `ip route show`. `default` becomes `0.0.0.0/0`; route types such
/// as `unreachable` or `blackhole` are skipped.
pub fn parse_routes(text: &str) -> Vec<RouteEntry> {
    let mut routes = Vec::new();

    for line in text.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = tokens.first() else {
            continue;
        };
        let destination = if *first == "default" {
            IpNetwork::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0).ok()
        } else {
            parse_network(first)
        };
        let Some(destination) = destination else {
            debug!("Skipping route line {:?}", line);
            continue;
        };

        let value_after = |key: &str| {
            tokens
                .windows(2)
                .find(|pair| pair[0] == key)
                .map(|pair| pair[1])
        };

        routes.push(RouteEntry {
            destination,
            gateway: value_after("via").and_then(|v| v.parse().ok()),
            interface: value_after("dev").map(str::to_string),
            source: value_after("src").and_then(|v| v.parse().ok()),
            metric: value_after("metric").and_then(|v| v.parse().ok()),
        });
    }

    routes
}

/// One socket from `ss -tuln`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub protocol: String,
    pub state: String,
    pub local_address: String,
    pub peer_address: String,
}

/// Parses `ss -tuln`. The header and short lines are skipped.
pub fn parse_connections(text: &str) -> Vec<Connection> {
    text.lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            match tokens.as_slice() {
                ["Netid", ..] => None,
                [protocol, state, _recv_q, _send_q, local, peer, ..] => Some(Connection {
                    protocol: (*protocol).to_string(),
                    state: (*state).to_string(),
                    local_address: (*local).to_string(),
                    peer_address: (*peer).to_string(),
                }),
                _ => None,
            }
        })
        .collect()
}

/// Kernel interface counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceCounters {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Parses one `/sys/class/net/<if>/statistics/*` file; garbage is 0
pub fn parse_sysfs_counter(text: &str) -> u64 {
    text.trim().parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TUN_ADDR: &str = "\
7: tun0: <POINTOPOINT,MULTICAST,NOARP,UP,LOWER_UP> mtu 1500 qdisc fq_codel state UNKNOWN group default qlen 500
    link/none
    inet 10.8.0.2 peer 10.8.0.1/32 scope global tun0
       valid_lft forever preferred_lft forever
";

    const BRIDGE_ADDR: &str = "\
4: br-1234567890ab: <NO-CARRIER,BROADCAST,MULTICAST,UP> mtu 1500 qdisc noqueue state DOWN group default
    link/ether 02:42:6b:1c:2d:3e brd ff:ff:ff:ff:ff:ff
    inet 172.20.0.1/16 brd 172.20.255.255 scope global br-1234567890ab
       valid_lft forever preferred_lft forever
";

    #[test]
    fn test_parse_tunnel_addr() {
        let info = parse_ip_addr(TUN_ADDR);
        assert!(info.up);
        assert_eq!(info.addresses, vec!["10.8.0.2/32".parse::<IpNetwork>().unwrap()]);
        assert_eq!(info.peer, Some("10.8.0.1".parse().unwrap()));
    }

    #[test]
    fn test_parse_bridge_addr() {
        let info = parse_ip_addr(BRIDGE_ADDR);
        assert!(info.up);
        assert_eq!(info.addresses, vec!["172.20.0.1/16".parse::<IpNetwork>().unwrap()]);
        assert_eq!(info.peer, None);
    }

    #[test]
    fn test_down_interface() {
        let info = parse_ip_addr("3: tun1: <POINTOPOINT,NOARP> mtu 1500 state DOWN\n");
        assert!(!info.up);
        assert!(info.addresses.is_empty());
    }

    #[test]
    fn test_peer_from_routes() {
        let text = "10.8.0.1 proto kernel scope link src 10.8.0.2\n10.8.0.0/24 via 10.8.0.1\n";
        assert_eq!(peer_from_routes(text), Some("10.8.0.1".parse().unwrap()));
        assert_eq!(peer_from_routes("10.8.0.0/24 via 10.8.0.1\n"), None);
    }

    #[test]
    fn test_parse_routes() {
        let text = "\
default via 192.168.1.1 dev eth0 proto dhcp src 192.168.1.10 metric 100
172.20.0.0/16 dev br-1234567890ab proto kernel scope link src 172.20.0.1 linkdown
unreachable 10.0.0.0/8
";
        let routes = parse_routes(text);
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].destination.to_string(), "0.0.0.0/0");
        assert_eq!(routes[0].gateway, Some("192.168.1.1".parse().unwrap()));
        assert_eq!(routes[0].interface.as_deref(), Some("eth0"));
        assert_eq!(routes[0].metric, Some(100));
        assert_eq!(routes[1].gateway, None);
        assert_eq!(routes[1].source, Some("172.20.0.1".parse().unwrap()));
    }

    #[test]
    fn test_parse_connections() {
        let text = "\
Netid State  Recv-Q Send-Q Local Address:Port  Peer Address:Port Process
udp   UNCONN 0      0      127.0.0.53%lo:53        0.0.0.0:*
tcp   LISTEN 0      4096         0.0.0.0:22        0.0.0.0:*
tcp   LISTEN
";
        let conns = parse_connections(text);
        assert_eq!(conns.len(), 2);
        assert_eq!(conns[1].protocol, "tcp");
        assert_eq!(conns[1].state, "LISTEN");
        assert_eq!(conns[1].local_address, "0.0.0.0:22");
    }

    #[test]
    fn test_sysfs_counter() {
        assert_eq!(parse_sysfs_counter("12345\n"), 12345);
        assert_eq!(parse_sysfs_counter(""), 0);
    }
}
