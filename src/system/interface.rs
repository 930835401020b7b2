// Network interface enumeration via getifaddrs.

use std::collections::HashMap;
use std::ffi::CStr;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::NetWatchError;

/// Interface name prefixes skipped during best-effort detection; these are
/// container bridges and virtual pairs, not host egress paths.
const VIRTUAL_PREFIXES: &[&str] = &["docker", "br-", "veth"];

/// Raw interface data from getifaddrs.
#[derive(Debug, Clone, Default)]
pub struct RawInterface {
    pub name: String,
    pub addresses: Vec<IpAddr>,
    pub flags: u32,
}

impl RawInterface {
    pub fn is_up(&self) -> bool {
        (self.flags & libc::IFF_UP as u32) != 0
    }

    pub fn is_loopback(&self) -> bool {
        (self.flags & libc::IFF_LOOPBACK as u32) != 0
    }
}

/// Enumerate all network interfaces with their addresses and flags.
pub fn list_interfaces() -> Result<Vec<RawInterface>, NetWatchError> {
    let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();

    if unsafe { libc::getifaddrs(&mut ifaddrs) } != 0 {
        return Err(NetWatchError::Interface(std::io::Error::last_os_error()));
    }

    let result = collect_interfaces(ifaddrs);

    unsafe { libc::freeifaddrs(ifaddrs) };

    Ok(result)
}

fn collect_interfaces(ifaddrs: *mut libc::ifaddrs) -> Vec<RawInterface> {
    let mut interfaces: HashMap<String, RawInterface> = HashMap::new();
    let mut current = ifaddrs;

    while !current.is_null() {
        let entry = unsafe { &*current };
        let name = unsafe { CStr::from_ptr(entry.ifa_name) }
            .to_string_lossy()
            .into_owned();

        let iface = interfaces
            .entry(name.clone())
            .or_insert_with(|| RawInterface {
                name,
                ..Default::default()
            });

        iface.flags = entry.ifa_flags;

        if !entry.ifa_addr.is_null() {
            match unsafe { (*entry.ifa_addr).sa_family } as i32 {
                libc::AF_INET => {
                    let sa_in = unsafe { &*(entry.ifa_addr as *const libc::sockaddr_in) };
                    let octets = sa_in.sin_addr.s_addr.to_ne_bytes();
                    iface.addresses.push(IpAddr::V4(Ipv4Addr::new(
                        octets[0], octets[1], octets[2], octets[3],
                    )));
                }
                libc::AF_INET6 => {
                    let sa_in6 = unsafe { &*(entry.ifa_addr as *const libc::sockaddr_in6) };
                    iface
                        .addresses
                        .push(IpAddr::V6(Ipv6Addr::from(sa_in6.sin6_addr.s6_addr)));
                }
                _ => {}
            }
        }

        current = entry.ifa_next;
    }

    interfaces.into_values().collect()
}

/// Best-effort capture interface detection: up, not loopback, addressed,
/// and not an obvious container/virtual device.
pub fn usable_interfaces() -> Result<Vec<String>, NetWatchError> {
    let all = list_interfaces()?;
    let mut usable: Vec<String> = all
        .into_iter()
        .filter(|iface| {
            iface.is_up()
                && !iface.is_loopback()
                && !iface.addresses.is_empty()
                && !VIRTUAL_PREFIXES
                    .iter()
                    .any(|prefix| iface.name.starts_with(prefix))
        })
        .map(|iface| iface.name)
        .collect();
    usable.sort();
    Ok(usable)
}

/// Validate a caller-named interface list: every entry must exist and be up.
/// An unknown or down interface is a configuration error.
pub fn validate_interfaces(names: &[String]) -> Result<(), NetWatchError> {
    let all = list_interfaces()?;
    for name in names {
        let Some(iface) = all.iter().find(|i| &i.name == name) else {
            return Err(NetWatchError::NoInterface(name.clone()));
        };
        if !iface.is_up() {
            return Err(NetWatchError::Config(format!("interface {name} is down")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_is_enumerated_but_not_usable() {
        let all = list_interfaces().expect("getifaddrs failed");
        let lo = all.iter().find(|i| i.is_loopback());
        if let Some(lo) = lo {
            assert!(!usable_interfaces().unwrap().contains(&lo.name));
        }
    }

    #[test]
    fn unknown_interface_fails_validation() {
        let err = validate_interfaces(&["definitely-not-a-nic0".to_string()]).unwrap_err();
        assert!(matches!(err, NetWatchError::NoInterface(_)));
    }

    #[test]
    fn empty_list_validates() {
        assert!(validate_interfaces(&[]).is_ok());
    }

    #[test]
    fn virtual_prefixes_are_filtered() {
        for name in ["docker0", "br-12ab", "veth99"] {
            assert!(VIRTUAL_PREFIXES.iter().any(|p| name.starts_with(p)));
        }
        assert!(!VIRTUAL_PREFIXES.iter().any(|p| "eth0".starts_with(p)));
    }
}
