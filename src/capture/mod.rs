// Packet capture via kernel raw sockets.
//
// Linux only: AF_PACKET sockets with a classic BPF filter restricting the
// feed to IPv4/IPv6 TCP/UDP/ICMP. The kernel receive buffer is sized from
// the ring parameters; reads carry a 500 ms timeout so capture loops can
// poll for shutdown.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::AfPacketCapture;

/// Kernel ring sizing for one capture socket.
#[derive(Debug, Clone, Copy)]
pub struct RingConfig {
    /// Per-frame read buffer size in bytes.
    pub frame_size: u32,
    /// Ring block size in bytes.
    pub block_size: u32,
    /// Number of ring blocks.
    pub block_count: u32,
}

impl Default for RingConfig {
    fn default() -> Self {
        RingConfig {
            frame_size: 4096,
            block_size: 4096 * 128,
            block_count: 128,
        }
    }
}

impl RingConfig {
    /// Total kernel receive buffer the ring requests.
    pub fn buffer_bytes(&self) -> u64 {
        self.block_size as u64 * self.block_count as u64
    }
}

/// Cumulative capture counters, as sampled by the drop monitor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub packets: u64,
    pub drops: u64,
}
