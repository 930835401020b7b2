// Linux capture implementation — AF_PACKET raw sockets.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use crate::error::NetWatchError;
use crate::store::now_ms;

use super::{CaptureStats, RingConfig};

// ---------------------------------------------------------------------------
// AF_PACKET constants
// ---------------------------------------------------------------------------

const ETH_P_ALL: u16 = 0x0003;
const SOL_PACKET: i32 = 263;
const PACKET_ADD_MEMBERSHIP: i32 = 1;
const PACKET_STATISTICS: i32 = 6;
const PACKET_MR_PROMISC: u16 = 1;

// BPF filter opcodes
const BPF_LD: u16 = 0x00;
const BPF_H: u16 = 0x08;
const BPF_B: u16 = 0x10;
const BPF_ABS: u16 = 0x20;
const BPF_JMP: u16 = 0x05;
const BPF_JEQ: u16 = 0x10;
const BPF_RET: u16 = 0x06;
const BPF_K: u16 = 0x00;

#[repr(C)]
#[derive(Clone, Copy)]
struct sock_filter {
    code: u16,
    jt: u8,
    jf: u8,
    k: u32,
}

#[repr(C)]
struct sock_fprog {
    len: u16,
    filter: *mut sock_filter,
}

#[repr(C)]
struct packet_mreq {
    mr_ifindex: i32,
    mr_type: u16,
    mr_alen: u16,
    mr_address: [u8; 8],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct tpacket_stats {
    tp_packets: u32,
    tp_drops: u32,
}

/// AF_PACKET capture device bound to one interface.
///
/// Dropping the handle closes the socket; a blocked reader unblocks at the
/// next 500 ms receive timeout.
#[derive(Debug)]
pub struct AfPacketCapture {
    fd: OwnedFd,
    buffer: Vec<u8>,
    interface: String,
    totals: CaptureStats,
}

impl AfPacketCapture {
    /// Open a capture socket on `interface` with the given ring sizing.
    pub fn open(interface: &str, ring: &RingConfig) -> Result<Self, NetWatchError> {
        // 1. Raw socket. EPERM/EACCES here means the process lacks
        //    CAP_NET_RAW; surface that distinctly.
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW,
                (ETH_P_ALL as u32).to_be() as i32,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EPERM) | Some(libc::EACCES) => NetWatchError::InsufficientPermission(
                    format!("socket(AF_PACKET) on {interface}: {err}"),
                ),
                _ => NetWatchError::CaptureDevice(format!("socket(AF_PACKET) failed: {err}")),
            });
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        // 2. Interface index.
        let if_index = if_nametoindex(interface)?;

        // 3. Bind to the interface.
        let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as u16;
        sll.sll_protocol = ETH_P_ALL.to_be();
        sll.sll_ifindex = if_index as i32;

        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(NetWatchError::RingAlloc {
                interface: interface.to_string(),
                detail: format!("bind: {}", io::Error::last_os_error()),
            });
        }

        // 4. Install the traffic filter.
        install_filter(&fd, &traffic_filter_ethernet()).map_err(|detail| {
            NetWatchError::RingAlloc {
                interface: interface.to_string(),
                detail,
            }
        })?;

        // 5. Read timeout so capture loops can poll shutdown.
        let timeout = libc::timeval {
            tv_sec: 0,
            tv_usec: 500_000,
        };
        let ret = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &timeout as *const libc::timeval as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            log::warn!(
                "SO_RCVTIMEO failed on {interface}: {}",
                io::Error::last_os_error()
            );
        }

        // 6. Kernel receive buffer sized from the ring parameters. The ring
        //    must be drained faster than line rate or the kernel drops.
        let buf_size = ring.buffer_bytes().min(i32::MAX as u64) as i32;
        let ret = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &buf_size as *const i32 as *const libc::c_void,
                std::mem::size_of::<i32>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(NetWatchError::RingAlloc {
                interface: interface.to_string(),
                detail: format!("SO_RCVBUF({buf_size}): {}", io::Error::last_os_error()),
            });
        }

        // 7. Promiscuous mode; best-effort.
        let mreq = packet_mreq {
            mr_ifindex: if_index as i32,
            mr_type: PACKET_MR_PROMISC,
            mr_alen: 0,
            mr_address: [0u8; 8],
        };
        let ret = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                SOL_PACKET,
                PACKET_ADD_MEMBERSHIP,
                &mreq as *const packet_mreq as *const libc::c_void,
                std::mem::size_of::<packet_mreq>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            log::warn!(
                "PACKET_MR_PROMISC failed on {interface}: {} (continuing without promiscuous mode)",
                io::Error::last_os_error()
            );
        }

        log::info!(
            "AF_PACKET capture on {interface} (if_index={if_index}, buffer={buf_size})"
        );

        Ok(Self {
            fd,
            buffer: vec![0u8; ring.frame_size.max(2048) as usize],
            interface: interface.to_string(),
            totals: CaptureStats::default(),
        })
    }

    /// Blocking read of one frame. Returns the frame bytes and arrival time
    /// in ms, or `None` on the read timeout.
    pub fn read_frame(&mut self) -> Result<Option<(&[u8], i64)>, NetWatchError> {
        let n = unsafe {
            libc::recvfrom(
                self.fd.as_raw_fd(),
                self.buffer.as_mut_ptr() as *mut libc::c_void,
                self.buffer.len(),
                0,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => Ok(None),
                _ => Err(NetWatchError::CaptureDevice(format!(
                    "recvfrom on {} failed: {err}",
                    self.interface
                ))),
            };
        }
        if n == 0 {
            return Ok(None);
        }

        Ok(Some((&self.buffer[..n as usize], now_ms())))
    }

    /// Cumulative (packets, drops) counters.
    ///
    /// `PACKET_STATISTICS` resets in the kernel on every read, so the handle
    /// accumulates the deltas.
    pub fn stats(&mut self) -> CaptureStats {
        let mut raw = tpacket_stats::default();
        let mut len = std::mem::size_of::<tpacket_stats>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.fd.as_raw_fd(),
                SOL_PACKET,
                PACKET_STATISTICS,
                &mut raw as *mut tpacket_stats as *mut libc::c_void,
                &mut len,
            )
        };
        if ret == 0 {
            self.totals.packets += raw.tp_packets as u64;
            self.totals.drops += raw.tp_drops as u64;
        } else {
            log::warn!(
                "PACKET_STATISTICS failed on {}: {}",
                self.interface,
                io::Error::last_os_error()
            );
        }
        self.totals
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }
}

fn if_nametoindex(name: &str) -> Result<u32, NetWatchError> {
    let c_name = std::ffi::CString::new(name)
        .map_err(|_| NetWatchError::NoInterface(name.to_string()))?;
    let idx = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if idx == 0 {
        return Err(NetWatchError::NoInterface(name.to_string()));
    }
    Ok(idx)
}

fn install_filter(fd: &OwnedFd, filter: &[sock_filter]) -> Result<(), String> {
    let mut insns = filter.to_vec();
    let prog = sock_fprog {
        len: insns.len() as u16,
        filter: insns.as_mut_ptr(),
    };

    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ATTACH_FILTER,
            &prog as *const sock_fprog as *const libc::c_void,
            std::mem::size_of::<sock_fprog>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(format!(
            "SO_ATTACH_FILTER: {}",
            io::Error::last_os_error()
        ));
    }
    Ok(())
}

fn insn(code: u16, jt: u8, jf: u8, k: u32) -> sock_filter {
    sock_filter { code, jt, jf, k }
}

/// Traffic filter: accept IPv4 TCP/UDP/ICMP and IPv6 TCP/UDP/ICMPv6,
/// reject everything else.
fn traffic_filter_ethernet() -> Vec<sock_filter> {
    vec![
        // 0: load EtherType at offset 12
        insn(BPF_LD | BPF_H | BPF_ABS, 0, 0, 12),
        // 1: IPv4? -> 2, else -> 6
        insn(BPF_JMP | BPF_JEQ | BPF_K, 0, 4, 0x0800),
        // 2: load IPv4 protocol at offset 23 (14 + 9)
        insn(BPF_LD | BPF_B | BPF_ABS, 0, 0, 23),
        // 3: TCP -> accept
        insn(BPF_JMP | BPF_JEQ | BPF_K, 7, 0, 6),
        // 4: UDP -> accept
        insn(BPF_JMP | BPF_JEQ | BPF_K, 6, 0, 17),
        // 5: ICMP -> accept, else reject
        insn(BPF_JMP | BPF_JEQ | BPF_K, 5, 6, 1),
        // 6: IPv6? -> 7, else reject
        insn(BPF_JMP | BPF_JEQ | BPF_K, 0, 5, 0x86DD),
        // 7: load IPv6 next header at offset 20 (14 + 6)
        insn(BPF_LD | BPF_B | BPF_ABS, 0, 0, 20),
        // 8: TCP -> accept
        insn(BPF_JMP | BPF_JEQ | BPF_K, 2, 0, 6),
        // 9: UDP -> accept
        insn(BPF_JMP | BPF_JEQ | BPF_K, 1, 0, 17),
        // 10: ICMPv6 -> accept, else reject
        insn(BPF_JMP | BPF_JEQ | BPF_K, 0, 1, 58),
        // 11: accept
        insn(BPF_RET | BPF_K, 0, 0, 0x40000),
        // 12: reject
        insn(BPF_RET | BPF_K, 0, 0, 0),
    ]
}
