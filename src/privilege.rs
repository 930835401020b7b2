// Raw-socket capability probe.

use std::io;

use crate::error::NetWatchError;

/// Check that the process can open AF_PACKET sockets. Root always passes;
/// otherwise a test socket decides. The recorder never attempts to escalate.
pub fn check_capture_access() -> Result<(), NetWatchError> {
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }

    let fd = unsafe {
        libc::socket(
            libc::AF_PACKET,
            libc::SOCK_RAW,
            (0x0003u16 as u32).to_be() as i32, // ETH_P_ALL
        )
    };
    if fd >= 0 {
        unsafe { libc::close(fd) };
        return Ok(());
    }

    let err = io::Error::last_os_error();
    Err(NetWatchError::InsufficientPermission(format!(
        "raw socket access denied ({err}); run as root or grant cap_net_raw"
    )))
}
