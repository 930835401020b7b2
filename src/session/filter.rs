// Include/exclude filter policies applied before event emission.

use std::collections::HashSet;
use std::net::IpAddr;

use crate::error::NetWatchError;
use crate::store::EventType;

/// Event classes selectable via the `only` filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrafficClass {
    Tcp,
    Udp,
    Icmp,
    Dns,
    Tls,
}

impl TrafficClass {
    fn parse(s: &str) -> Result<Self, NetWatchError> {
        Ok(match s {
            "tcp" => TrafficClass::Tcp,
            "udp" => TrafficClass::Udp,
            "icmp" => TrafficClass::Icmp,
            "dns" => TrafficClass::Dns,
            "tls" => TrafficClass::Tls,
            other => {
                return Err(NetWatchError::Config(format!(
                    "unknown event class '{other}' (expected tcp, udp, icmp, dns, tls)"
                )))
            }
        })
    }

    /// The class an emitted event belongs to for `only` filtering.
    pub fn of_event(event_type: EventType) -> Option<TrafficClass> {
        Some(match event_type {
            EventType::TcpStart | EventType::TcpEnd | EventType::Timeout => TrafficClass::Tcp,
            EventType::UdpStart | EventType::UdpEnd => TrafficClass::Udp,
            EventType::Dns => TrafficClass::Dns,
            EventType::TlsSni => TrafficClass::Tls,
            EventType::Icmp => TrafficClass::Icmp,
            // Compacted variants never pass through the live path.
            EventType::Tcp | EventType::Udp | EventType::Hourly => return None,
        })
    }
}

/// Traffic classes removable via the `exclude` filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExcludeClass {
    Multicast,
    Broadcast,
    LinkLocal,
    Bittorrent,
    Mdns,
    Ssdp,
    Metadata,
    Ndp,
    Unreachable,
}

impl ExcludeClass {
    fn parse(s: &str) -> Result<Self, NetWatchError> {
        Ok(match s {
            "multicast" => ExcludeClass::Multicast,
            "broadcast" => ExcludeClass::Broadcast,
            "linklocal" => ExcludeClass::LinkLocal,
            "bittorrent" => ExcludeClass::Bittorrent,
            "mdns" => ExcludeClass::Mdns,
            "ssdp" => ExcludeClass::Ssdp,
            "metadata" => ExcludeClass::Metadata,
            "ndp" => ExcludeClass::Ndp,
            "unreachable" => ExcludeClass::Unreachable,
            other => {
                return Err(NetWatchError::Config(format!(
                    "unknown exclude class '{other}'"
                )))
            }
        })
    }
}

/// ICMP identity of a packet, for `ndp`/`unreachable` classification.
#[derive(Debug, Clone, Copy)]
pub struct IcmpId {
    pub v6: bool,
    pub icmp_type: u8,
}

/// Parsed filter policy. Empty `only` means all classes; `exclude` and
/// `exclude_ports` remove matching packets before any flow tracking.
#[derive(Debug, Clone, Default)]
pub struct FilterPolicy {
    only: HashSet<TrafficClass>,
    exclude: HashSet<ExcludeClass>,
    exclude_ports: HashSet<u16>,
}

impl FilterPolicy {
    /// Parse the three comma-separated CLI filter strings. Empty strings
    /// leave the corresponding filter unset.
    pub fn parse(only: &str, exclude: &str, exclude_ports: &str) -> Result<Self, NetWatchError> {
        let mut policy = FilterPolicy::default();
        for item in split_list(only) {
            policy.only.insert(TrafficClass::parse(item)?);
        }
        for item in split_list(exclude) {
            policy.exclude.insert(ExcludeClass::parse(item)?);
        }
        for item in split_list(exclude_ports) {
            let port: u16 = item.parse().map_err(|_| {
                NetWatchError::Config(format!("invalid port '{item}' in exclude-ports"))
            })?;
            policy.exclude_ports.insert(port);
        }
        Ok(policy)
    }

    /// True if events of `event_type` pass the `only` filter.
    pub fn allows_event(&self, event_type: EventType) -> bool {
        if self.only.is_empty() {
            return true;
        }
        match TrafficClass::of_event(event_type) {
            Some(class) => self.only.contains(&class),
            None => true,
        }
    }

    /// True if a packet with these endpoints must be dropped before any
    /// tracking or emission.
    pub fn excludes_packet(
        &self,
        src: &IpAddr,
        dst: &IpAddr,
        src_port: u16,
        dst_port: u16,
        icmp: Option<IcmpId>,
    ) -> bool {
        if self.exclude_ports.contains(&src_port) || self.exclude_ports.contains(&dst_port) {
            return true;
        }
        for class in &self.exclude {
            let hit = match class {
                ExcludeClass::Multicast => src.is_multicast() || dst.is_multicast(),
                ExcludeClass::Broadcast => is_broadcast(src) || is_broadcast(dst),
                ExcludeClass::LinkLocal => is_link_local(src) || is_link_local(dst),
                ExcludeClass::Metadata => is_metadata(src) || is_metadata(dst),
                ExcludeClass::Bittorrent => {
                    is_bittorrent_port(src_port) || is_bittorrent_port(dst_port)
                }
                ExcludeClass::Mdns => src_port == 5353 || dst_port == 5353,
                ExcludeClass::Ssdp => src_port == 1900 || dst_port == 1900,
                ExcludeClass::Ndp => {
                    matches!(icmp, Some(IcmpId { v6: true, icmp_type }) if (133..=137).contains(&icmp_type))
                }
                ExcludeClass::Unreachable => matches!(
                    icmp,
                    Some(IcmpId {
                        v6: false,
                        icmp_type: 3
                    }) | Some(IcmpId {
                        v6: true,
                        icmp_type: 1
                    })
                ),
            };
            if hit {
                return true;
            }
        }
        false
    }
}

fn split_list(s: &str) -> impl Iterator<Item = &str> {
    s.split(',').map(str::trim).filter(|item| !item.is_empty())
}

fn is_broadcast(ip: &IpAddr) -> bool {
    matches!(ip, IpAddr::V4(v4) if v4.is_broadcast())
}

fn is_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        // fe80::/10
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

fn is_metadata(ip: &IpAddr) -> bool {
    matches!(ip, IpAddr::V4(v4) if v4.octets() == [169, 254, 169, 254])
}

fn is_bittorrent_port(port: u16) -> bool {
    (6881..=6889).contains(&port) || port == 6969
}
