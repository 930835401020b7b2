//! Linux-only capture integration tests.
//!
//! These require root or cap_net_raw; they skip themselves otherwise.
//! Run with: `sudo cargo test --test capture_linux`

#![cfg(target_os = "linux")]

use netwatcher::capture::{AfPacketCapture, RingConfig};
use netwatcher::error::NetWatchError;

fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[test]
fn open_on_loopback_succeeds_with_privilege() {
    if !is_root() {
        eprintln!("skipping: requires root or CAP_NET_RAW");
        return;
    }

    let mut capture =
        AfPacketCapture::open("lo", &RingConfig::default()).expect("open on lo failed");
    assert_eq!(capture.interface(), "lo");

    // Stats are readable immediately after open.
    let stats = capture.stats();
    assert_eq!(stats.drops, 0);
}

#[test]
fn open_unknown_interface_is_no_interface_error() {
    if !is_root() {
        eprintln!("skipping: requires root or CAP_NET_RAW");
        return;
    }

    let err = AfPacketCapture::open("definitely-not-a-nic0", &RingConfig::default()).unwrap_err();
    assert!(matches!(err, NetWatchError::NoInterface(_)), "got {err:?}");
}

#[test]
fn open_without_privilege_is_permission_error() {
    if is_root() {
        eprintln!("skipping: running as root");
        return;
    }

    // Without CAP_NET_RAW the socket call itself must fail with a
    // permission error, before the interface name is even considered.
    match AfPacketCapture::open("lo", &RingConfig::default()) {
        Err(NetWatchError::InsufficientPermission(_)) => {}
        other => panic!("expected InsufficientPermission, got {other:?}"),
    }
}

#[test]
fn capability_probe_matches_socket_behavior() {
    let probe = netwatcher::privilege::check_capture_access();
    let open = AfPacketCapture::open("lo", &RingConfig::default());
    assert_eq!(
        probe.is_ok(),
        !matches!(open, Err(NetWatchError::InsufficientPermission(_)))
    );
}
