//! Network interface enumeration and management endpoint discovery
//!
//! This module handles:
//! - Interface enumeration with MAC, IPv4/IPv6 addresses and gateways
//! - Gateway lookup from the OS routing table (Linux `/proc`, Windows `route print`)
//! - Report target derivation: one target per interface whose gateway ends in `.1`

use anyhow::{Context, Result};
use if_addrs::{get_if_addrs, IfAddr};
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use tracing::{debug, info, warn};

/// MAC reported by interfaces with no usable hardware identity
pub const ZERO_MAC: &str = "00:00:00:00:00:00";

/// Network interface as seen by the agent at startup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkInterface {
    pub mac: String,
    pub label: String,
    pub ip4_addr: String,
    pub ip6_addr: String,
    pub ip4_gate: String,
    pub ip6_gate: String,
}

/// Management endpoint for one qualifying interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportTarget {
    pub host: String,
    pub port: u16,
    pub mac: String,
}

impl ReportTarget {
    /// Full upload URL, identifying the reporting NIC by MAC in the query string
    pub fn url(&self, path: &str) -> String {
        format!("http://{}:{}{}?nic={}", self.host, self.port, path, self.mac)
    }
}

/// Derive one report target per qualifying interface.
///
/// Interfaces are skipped when the IPv4 gateway is empty or does not end in
/// `.1`, or when the MAC is all zeroes. A multi-homed guest gets one target per
/// network; targets are not deduplicated.
pub fn discover_targets(interfaces: &[NetworkInterface], port: u16) -> Vec<ReportTarget> {
    let mut targets = Vec::new();

    for iface in interfaces {
        let Some(host) = management_host(&iface.ip4_gate) else {
            debug!(interface = %iface.label, gateway = %iface.ip4_gate, "Gateway does not qualify, skipping");
            continue;
        };
        if is_zero_mac(&iface.mac) {
            debug!(interface = %iface.label, "Interface has no hardware identity, skipping");
            continue;
        }
        targets.push(ReportTarget {
            host,
            port,
            mac: iface.mac.clone(),
        });
    }

    targets
}

/// `a.b.c.1` -> `a.b.c.2`; anything else has no management host
fn management_host(gateway: &str) -> Option<String> {
    if gateway.is_empty() || !gateway.ends_with(".1") {
        return None;
    }
    let prefix = &gateway[..gateway.len() - 2];
    Some(format!("{}.2", prefix))
}

fn is_zero_mac(mac: &str) -> bool {
    mac.eq_ignore_ascii_case(ZERO_MAC)
}

/// Deterministic stand-in MAC for interfaces whose hardware address is unreadable
pub fn synthetic_mac(ip4: Ipv4Addr) -> String {
    let octets = ip4.octets();
    let prefix = match octets[0] {
        192 => "00:1C",
        172 => "CC:D9",
        10 => "10:F6",
        100 => "00:1E",
        _ => "00:00",
    };
    format!(
        "{}:{:02x}:{:02x}:{:02x}:{:02x}",
        prefix, octets[0], octets[1], octets[2], octets[3]
    )
}

/// Gateways known to the routing table
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GatewayTable {
    /// interface key (name on Linux, local IPv4 on Windows) -> gateway
    pub by_interface: HashMap<String, String>,
    pub default: Option<String>,
}

impl GatewayTable {
    /// Interface-specific gateway, falling back to the default route
    pub fn lookup(&self, key: &str) -> String {
        self.by_interface
            .get(key)
            .or(self.default.as_ref())
            .cloned()
            .unwrap_or_default()
    }
}

/// Parse `/proc/net/route` (hex, little-endian IPv4 columns)
pub fn parse_proc_net_route(content: &str) -> GatewayTable {
    let mut table = GatewayTable::default();

    for line in content.lines().skip(1) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 3 {
            continue;
        }
        let (iface, destination, gateway) = (cols[0], cols[1], cols[2]);
        let Some(gateway) = parse_le_ipv4(gateway) else {
            continue;
        };
        if gateway.is_unspecified() {
            continue;
        }
        let gateway = gateway.to_string();
        if destination == "00000000" && table.default.is_none() {
            table.default = Some(gateway.clone());
        }
        table
            .by_interface
            .entry(iface.to_string())
            .or_insert(gateway);
    }

    table
}

fn parse_le_ipv4(hex: &str) -> Option<Ipv4Addr> {
    let raw = u32::from_str_radix(hex, 16).ok()?;
    Some(Ipv4Addr::from(raw.to_le_bytes()))
}

/// Parse `/proc/net/ipv6_route` (32-hex-digit big-endian addresses)
pub fn parse_proc_net_ipv6_route(content: &str) -> GatewayTable {
    let mut table = GatewayTable::default();

    for line in content.lines() {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 10 {
            continue;
        }
        let (destination, prefix_len, next_hop, iface) = (cols[0], cols[1], cols[4], cols[9]);
        let Some(next_hop) = parse_hex_ipv6(next_hop) else {
            continue;
        };
        if next_hop.is_unspecified() {
            continue;
        }
        let gateway = next_hop.to_string();
        if prefix_len == "00"
            && destination.chars().all(|c| c == '0')
            && table.default.is_none()
        {
            table.default = Some(gateway.clone());
        }
        table
            .by_interface
            .entry(iface.to_string())
            .or_insert(gateway);
    }

    table
}

fn parse_hex_ipv6(hex: &str) -> Option<Ipv6Addr> {
    if hex.len() != 32 {
        return None;
    }
    u128::from_str_radix(hex, 16).ok().map(Ipv6Addr::from)
}

/// Parse the IPv4 "Active Routes" block of Windows `route print -4`.
/// Keys are the local interface addresses.
pub fn parse_windows_route_print(content: &str) -> GatewayTable {
    let mut table = GatewayTable::default();
    let mut in_active = false;

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("Active Routes") {
            in_active = true;
            continue;
        }
        if !in_active {
            continue;
        }
        if trimmed.starts_with("Persistent Routes") || trimmed.starts_with("====") {
            if !table.by_interface.is_empty() || table.default.is_some() {
                break;
            }
            continue;
        }

        let cols: Vec<&str> = trimmed.split_whitespace().collect();
        if cols.len() < 5 {
            continue;
        }
        let (destination, netmask, gateway, interface) = (cols[0], cols[1], cols[2], cols[3]);
        if gateway.parse::<Ipv4Addr>().is_err() || interface.parse::<Ipv4Addr>().is_err() {
            // Header row or "On-link"
            continue;
        }
        if destination == "0.0.0.0" && netmask == "0.0.0.0" && table.default.is_none() {
            table.default = Some(gateway.to_string());
        }
        table
            .by_interface
            .entry(interface.to_string())
            .or_insert_with(|| gateway.to_string());
    }

    table
}

/// Routing tables for IPv4 and IPv6, read from the running OS
async fn read_gateway_tables() -> (GatewayTable, GatewayTable) {
    if cfg!(target_os = "linux") {
        let v4 = match tokio::fs::read_to_string("/proc/net/route").await {
            Ok(content) => parse_proc_net_route(&content),
            Err(e) => {
                warn!("Failed to read /proc/net/route: {}", e);
                GatewayTable::default()
            }
        };
        let v6 = match tokio::fs::read_to_string("/proc/net/ipv6_route").await {
            Ok(content) => parse_proc_net_ipv6_route(&content),
            Err(e) => {
                debug!("No IPv6 routing table: {}", e);
                GatewayTable::default()
            }
        };
        (v4, v6)
    } else if cfg!(target_os = "windows") {
        let output = tokio::process::Command::new("route")
            .args(["print", "-4"])
            .output()
            .await;
        let v4 = match output {
            Ok(out) => parse_windows_route_print(&String::from_utf8_lossy(&out.stdout)),
            Err(e) => {
                warn!("Failed to run route print: {}", e);
                GatewayTable::default()
            }
        };
        (v4, GatewayTable::default())
    } else {
        warn!("Gateway lookup not supported on {}", std::env::consts::OS);
        (GatewayTable::default(), GatewayTable::default())
    }
}

/// Enumerate non-loopback interfaces with their MAC, addresses and gateways
pub async fn enumerate_interfaces() -> Result<Vec<NetworkInterface>> {
    debug!("Enumerating network interfaces...");

    let if_addrs = get_if_addrs().context("Failed to enumerate network interfaces")?;
    let (v4_routes, v6_routes) = read_gateway_tables().await;
    let keyed_by_ip = cfg!(target_os = "windows");

    let mut interfaces: Vec<NetworkInterface> = Vec::new();
    for if_addr in if_addrs {
        if if_addr.is_loopback() {
            continue;
        }

        let idx = match interfaces.iter().position(|i| i.label == if_addr.name) {
            Some(idx) => idx,
            None => {
                interfaces.push(NetworkInterface {
                    label: if_addr.name.clone(),
                    ..NetworkInterface::default()
                });
                interfaces.len() - 1
            }
        };
        let iface = &mut interfaces[idx];

        match if_addr.addr {
            IfAddr::V4(v4) if iface.ip4_addr.is_empty() => iface.ip4_addr = v4.ip.to_string(),
            IfAddr::V6(v6) if iface.ip6_addr.is_empty() => iface.ip6_addr = v6.ip.to_string(),
            _ => {}
        }
    }

    let mut result = Vec::with_capacity(interfaces.len());
    for mut iface in interfaces {
        iface.mac = match hardware_mac(&iface.label) {
            Some(mac) if is_zero_mac(&mac) => {
                debug!(interface = %iface.label, "Dropping interface with zero MAC");
                continue;
            }
            Some(mac) => mac,
            None => match iface.ip4_addr.parse::<Ipv4Addr>() {
                Ok(ip) => {
                    let mac = synthetic_mac(ip);
                    warn!(interface = %iface.label, mac = %mac, "No hardware MAC, using synthetic MAC");
                    mac
                }
                Err(_) => {
                    debug!(interface = %iface.label, "No MAC and no IPv4 address, skipping");
                    continue;
                }
            },
        };

        let v4_key = if keyed_by_ip { &iface.ip4_addr } else { &iface.label };
        iface.ip4_gate = v4_routes.lookup(v4_key);
        iface.ip6_gate = v6_routes.lookup(&iface.label);

        debug!(
            interface = %iface.label,
            mac = %iface.mac,
            ip4 = %iface.ip4_addr,
            gateway = %iface.ip4_gate,
            "Found interface"
        );
        result.push(iface);
    }

    info!("Enumerated {} network interfaces", result.len());
    Ok(result)
}

/// Hardware MAC for an interface name, lowercase colon-separated
fn hardware_mac(interface_name: &str) -> Option<String> {
    match mac_address::mac_address_by_name(interface_name) {
        Ok(Some(mac)) => {
            let b = mac.bytes();
            Some(format!(
                "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                b[0], b[1], b[2], b[3], b[4], b[5]
            ))
        }
        Ok(None) => None,
        Err(e) => {
            debug!("Error getting MAC for {}: {}", interface_name, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(label: &str, gateway: &str, mac: &str) -> NetworkInterface {
        NetworkInterface {
            mac: mac.to_string(),
            label: label.to_string(),
            ip4_gate: gateway.to_string(),
            ..NetworkInterface::default()
        }
    }

    #[test]
    fn test_discovery_filter() {
        let interfaces = vec![
            iface("A", "192.168.1.1", "aa:bb:cc:dd:ee:ff"),
            iface("B", "10.0.0.5", "11:22:33:44:55:66"),
            iface("C", "192.168.2.1", "00:00:00:00:00:00"),
        ];
        let targets = discover_targets(&interfaces, 1880);

        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].host, "192.168.1.2");
        assert_eq!(targets[0].port, 1880);
        assert_eq!(targets[0].mac, "aa:bb:cc:dd:ee:ff");
        assert_eq!(
            targets[0].url("/api/client/upload"),
            "http://192.168.1.2:1880/api/client/upload?nic=aa:bb:cc:dd:ee:ff"
        );
    }

    #[test]
    fn test_multi_homed_guest_fans_out() {
        let interfaces = vec![
            iface("eth0", "192.168.1.1", "aa:aa:aa:aa:aa:01"),
            iface("eth1", "172.16.8.1", "aa:aa:aa:aa:aa:02"),
            iface("eth2", "192.168.1.1", "aa:aa:aa:aa:aa:03"),
        ];
        let targets = discover_targets(&interfaces, 1880);

        let hosts: Vec<&str> = targets.iter().map(|t| t.host.as_str()).collect();
        assert_eq!(hosts, vec!["192.168.1.2", "172.16.8.2", "192.168.1.2"]);
    }

    #[test]
    fn test_management_host_edge_cases() {
        assert_eq!(management_host(""), None);
        assert_eq!(management_host("10.0.0.11"), None);
        assert_eq!(management_host("10.0.0.21"), None);
        assert_eq!(management_host("10.0.0.1").as_deref(), Some("10.0.0.2"));
        assert!(is_zero_mac("00:00:00:00:00:00"));
        assert!(!is_zero_mac("00:00:00:00:00:01"));
    }

    #[test]
    fn test_synthetic_mac() {
        assert_eq!(synthetic_mac("192.168.1.5".parse().unwrap()), "00:1C:c0:a8:01:05");
        assert_eq!(synthetic_mac("172.16.0.9".parse().unwrap()), "CC:D9:ac:10:00:09");
        assert_eq!(synthetic_mac("10.1.2.3".parse().unwrap()), "10:F6:0a:01:02:03");
        assert_eq!(synthetic_mac("100.64.0.1".parse().unwrap()), "00:1E:64:40:00:01");
        assert_eq!(synthetic_mac("8.8.8.8".parse().unwrap()), "00:00:08:08:08:08");
    }

    #[test]
    fn test_parse_proc_net_route() {
        let content = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
eth0\t00000000\t0101A8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0
eth0\t0001A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\t0\t0\t0
eth1\t0010AC0A\t00000000\t0001\t0\t0\t0\t00F0FFFF\t0\t0\t0
eth2\t0000000A\t0100000A\t0003\t0\t0\t0\t000000FF\t0\t0\t0
";
        let table = parse_proc_net_route(content);
        assert_eq!(table.default.as_deref(), Some("192.168.1.1"));
        assert_eq!(table.lookup("eth0"), "192.168.1.1");
        assert_eq!(table.lookup("eth2"), "10.0.0.1");
        // No specific gateway: inherits the default route
        assert_eq!(table.lookup("eth1"), "192.168.1.1");
    }

    #[test]
    fn test_parse_proc_net_ipv6_route() {
        let content = "\
00000000000000000000000000000000 00 00000000000000000000000000000000 00 fe800000000000000000000000000001 00000400 00000001 00000000 00450003 eth0
fe800000000000000000000000000000 40 00000000000000000000000000000000 00 00000000000000000000000000000000 00000100 00000001 00000000 00000001 eth0
";
        let table = parse_proc_net_ipv6_route(content);
        assert_eq!(table.default.as_deref(), Some("fe80::1"));
        assert_eq!(table.lookup("eth0"), "fe80::1");
    }

    #[test]
    fn test_parse_windows_route_print() {
        let content = "\
===========================================================================
Interface List
 12...00 15 5d 01 02 03 ......Microsoft Hyper-V Network Adapter
===========================================================================

IPv4 Route Table
===========================================================================
Active Routes:
Network Destination        Netmask          Gateway       Interface  Metric
          0.0.0.0          0.0.0.0      192.168.1.1    192.168.1.100     25
        127.0.0.0        255.0.0.0         On-link         127.0.0.1    331
      192.168.1.0    255.255.255.0         On-link     192.168.1.100    281
         10.8.0.0      255.255.0.0         10.8.0.1         10.8.0.50     30
===========================================================================
Persistent Routes:
  None
";
        let table = parse_windows_route_print(content);
        assert_eq!(table.default.as_deref(), Some("192.168.1.1"));
        assert_eq!(table.lookup("192.168.1.100"), "192.168.1.1");
        assert_eq!(table.lookup("10.8.0.50"), "10.8.0.1");
        assert_eq!(table.by_interface.len(), 2);
    }

    #[tokio::test]
    async fn test_enumeration_excludes_loopback_and_zero_mac() {
        let interfaces = enumerate_interfaces().await.unwrap();
        assert!(interfaces.iter().all(|i| i.label != "lo"));
        assert!(interfaces.iter().all(|i| !is_zero_mac(&i.mac)));
    }
}
