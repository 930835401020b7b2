// Per-flow session tracking: turns decoded packets into lifecycle events.
//
// One SessionManager is shared by every capture thread. Flow state lives
// behind a single mutex; emission goes through a lossy bounded channel so a
// slow writer can never stall the decode path.

pub mod filter;

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use rustc_hash::FxHashMap;

use crate::dns;
use crate::packet::{PacketView, TcpFlags, Transport};
use crate::store::{EndReason, EventType, NetworkEvent};
use crate::tls;

use filter::{FilterPolicy, IcmpId};

/// Bounded event channel capacity between session manager and writer.
pub const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Flows idle longer than this are retired by the sweeper.
pub const TCP_IDLE_MS: i64 = 120_000;
pub const UDP_IDLE_MS: i64 = 30_000;

/// DNS resolution cache bounds.
const DNS_CACHE_CAPACITY: usize = 4096;
const DNS_CACHE_MAX_AGE_MS: i64 = 600_000; // 10 minutes

// ---------------------------------------------------------------------------
// Lossy event channel
// ---------------------------------------------------------------------------

/// Sender half of the event channel. When the channel is full the oldest
/// queued event is discarded so recent state is preserved.
#[derive(Clone)]
pub struct EventSender {
    tx: Sender<NetworkEvent>,
    rx: Receiver<NetworkEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    /// Non-blocking send with oldest-drop overflow policy.
    pub fn send(&self, event: NetworkEvent) {
        let mut event = event;
        loop {
            match self.tx.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    // Drop from the head of the queue, then retry.
                    let _ = self.rx.try_recv();
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if dropped == 1 || dropped % 256 == 0 {
                        log::warn!("event channel full: {dropped} events dropped so far");
                    }
                    event = back;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Total events discarded due to channel overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Create the bounded event channel used between the session manager and
/// the store writer.
pub fn event_channel(capacity: usize) -> (EventSender, Receiver<NetworkEvent>) {
    let (tx, rx) = bounded(capacity);
    (
        EventSender {
            tx,
            rx: rx.clone(),
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

// ---------------------------------------------------------------------------
// Flow state
// ---------------------------------------------------------------------------

/// Direction-sensitive flow identity: (A→B) and (B→A) are distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FlowKey {
    interface: String,
    ip_version: u8,
    src_ip: IpAddr,
    src_port: u16,
    dst_ip: IpAddr,
    dst_port: u16,
}

#[derive(Debug)]
struct FlowEntry {
    first_seen: i64,
    last_seen: i64,
    bytes: i64,
    hostname: String,
    dns_age_ms: i64,
    sni_emitted: bool,
    /// UDP service hint carried onto END rows.
    protocol: &'static str,
}

struct DnsCacheEntry {
    hostname: String,
    learned_at: i64,
}

#[derive(Default)]
struct Inner {
    tcp_flows: FxHashMap<FlowKey, FlowEntry>,
    udp_flows: FxHashMap<FlowKey, FlowEntry>,
    dns_cache: FxHashMap<IpAddr, DnsCacheEntry>,
}

/// Flow-keyed state machine shared by all capture threads.
pub struct SessionManager {
    inner: Mutex<Inner>,
    filters: FilterPolicy,
    sink: EventSender,
}

impl SessionManager {
    pub fn new(filters: FilterPolicy, sink: EventSender) -> Self {
        SessionManager {
            inner: Mutex::new(Inner::default()),
            filters,
            sink,
        }
    }

    /// Current (tcp, udp) flow counts, for periodic stats logging.
    pub fn flow_counts(&self) -> (usize, usize) {
        let inner = self.inner.lock().expect("session mutex poisoned");
        (inner.tcp_flows.len(), inner.udp_flows.len())
    }

    /// Feed one decoded packet through the state machine.
    pub fn handle_packet(&self, interface: &str, view: &PacketView<'_>, now_ms: i64) {
        match &view.transport {
            Transport::Tcp {
                src_port,
                dst_port,
                flags,
                payload,
            } => self.handle_tcp(interface, view, *src_port, *dst_port, *flags, payload, now_ms),
            Transport::Udp {
                src_port,
                dst_port,
                payload,
            } => self.handle_udp(interface, view, *src_port, *dst_port, payload, now_ms),
            Transport::Icmp {
                icmp_type,
                icmp_code,
            } => self.handle_icmp(interface, view, *icmp_type, *icmp_code, now_ms),
        }
    }

    fn handle_tcp(
        &self,
        interface: &str,
        view: &PacketView<'_>,
        src_port: u16,
        dst_port: u16,
        flags: TcpFlags,
        payload: &[u8],
        now_ms: i64,
    ) {
        if self
            .filters
            .excludes_packet(&view.src_ip, &view.dst_ip, src_port, dst_port, None)
        {
            return;
        }

        let key = FlowKey {
            interface: interface.to_string(),
            ip_version: view.ip_version,
            src_ip: view.src_ip,
            src_port,
            dst_ip: view.dst_ip,
            dst_port,
        };
        let len = view.captured_len as i64;

        let mut inner = self.inner.lock().expect("session mutex poisoned");

        let syn_only = flags.syn && !flags.ack;
        if syn_only && !inner.tcp_flows.contains_key(&key) {
            let (hostname, dns_age_ms) = lookup_dns_cache(&mut inner, &view.dst_ip, now_ms);
            inner.tcp_flows.insert(
                key.clone(),
                FlowEntry {
                    first_seen: now_ms,
                    last_seen: now_ms,
                    bytes: len,
                    hostname: hostname.clone(),
                    dns_age_ms,
                    sni_emitted: false,
                    protocol: "",
                },
            );
            let mut event = self.base_event(EventType::TcpStart, interface, view, now_ms);
            event.src_port = src_port;
            event.dst_port = dst_port;
            event.hostname = hostname;
            event.dns_age_ms = dns_age_ms;
            self.emit(event);
        } else if let Some(entry) = inner.tcp_flows.get_mut(&key) {
            entry.bytes += len;
            entry.last_seen = now_ms;
        }

        // TLS ClientHello sniffing, at most one SNI per flow.
        if !payload.is_empty() && payload[0] == 0x16 {
            if let Some(entry) = inner.tcp_flows.get_mut(&key) {
                if !entry.sni_emitted {
                    if let Some(sni) = tls::parse_client_hello_sni(payload) {
                        entry.sni_emitted = true;
                        let hostname = entry.hostname.clone();
                        let mut event =
                            self.base_event(EventType::TlsSni, interface, view, now_ms);
                        event.src_port = src_port;
                        event.dst_port = dst_port;
                        event.tls_sni = sni;
                        event.hostname = hostname;
                        self.emit(event);
                    }
                }
            }
        }

        if flags.fin || flags.rst {
            let reason = if flags.rst {
                EndReason::Rst
            } else {
                EndReason::Fin
            };
            let (duration_ms, byte_count, hostname, dns_age_ms) =
                match inner.tcp_flows.remove(&key) {
                    Some(entry) => (
                        entry.last_seen - entry.first_seen,
                        entry.bytes,
                        entry.hostname,
                        entry.dns_age_ms,
                    ),
                    // FIN/RST for a flow whose SYN predates this recorder:
                    // emit an END anyway; compaction treats it as an orphan.
                    None => (0, len, String::new(), 0),
                };
            let mut event = self.base_event(EventType::TcpEnd, interface, view, now_ms);
            event.src_port = src_port;
            event.dst_port = dst_port;
            event.duration_ms = duration_ms;
            event.byte_count = byte_count;
            event.reason = reason;
            event.hostname = hostname;
            event.dns_age_ms = dns_age_ms;
            self.emit(event);
        }
    }

    fn handle_udp(
        &self,
        interface: &str,
        view: &PacketView<'_>,
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
        now_ms: i64,
    ) {
        if self
            .filters
            .excludes_packet(&view.src_ip, &view.dst_ip, src_port, dst_port, None)
        {
            return;
        }

        let key = FlowKey {
            interface: interface.to_string(),
            ip_version: view.ip_version,
            src_ip: view.src_ip,
            src_port,
            dst_ip: view.dst_ip,
            dst_port,
        };
        let len = view.captured_len as i64;

        {
            let mut inner = self.inner.lock().expect("session mutex poisoned");
            match inner.udp_flows.get_mut(&key) {
                Some(entry) => {
                    entry.bytes += len;
                    entry.last_seen = now_ms;
                }
                None => {
                    let protocol = udp_service_hint(src_port, dst_port);
                    inner.udp_flows.insert(
                        key,
                        FlowEntry {
                            first_seen: now_ms,
                            last_seen: now_ms,
                            bytes: len,
                            hostname: String::new(),
                            dns_age_ms: 0,
                            sni_emitted: false,
                            protocol,
                        },
                    );
                    let mut event = self.base_event(EventType::UdpStart, interface, view, now_ms);
                    event.src_port = src_port;
                    event.dst_port = dst_port;
                    event.protocol = protocol.to_string();
                    self.emit(event);
                }
            }
        }

        if src_port == 53 || dst_port == 53 {
            self.handle_dns_payload(interface, view, src_port, dst_port, payload, now_ms);
        }
    }

    fn handle_dns_payload(
        &self,
        interface: &str,
        view: &PacketView<'_>,
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
        now_ms: i64,
    ) {
        let msg = match dns::parse_dns(payload) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!(
                    "DNS parse failed on {interface} ({} -> {}): {e}",
                    view.src_ip,
                    view.dst_ip
                );
                return;
            }
        };
        if msg.questions.is_empty() {
            return;
        }

        let question = &msg.questions[0];

        // Learn answer addresses for flow hostname tagging.
        if msg.is_response && !msg.answers.is_empty() {
            let mut inner = self.inner.lock().expect("session mutex poisoned");
            for answer in &msg.answers {
                if let Ok(addr) = answer.parse::<IpAddr>() {
                    insert_dns_cache(&mut inner, addr, question.name.clone(), now_ms);
                }
            }
        }

        let mut event = self.base_event(EventType::Dns, interface, view, now_ms);
        event.src_port = src_port;
        event.dst_port = dst_port;
        event.dns_type = if msg.is_response { "RESPONSE" } else { "QUERY" }.to_string();
        event.dns_query = question.name.clone();
        event.protocol = question.qtype.clone();
        event.dns_answers = msg.answers.join(",");
        event.dns_cnames = msg.cnames.join(",");
        self.emit(event);
    }

    fn handle_icmp(
        &self,
        interface: &str,
        view: &PacketView<'_>,
        icmp_type: u8,
        icmp_code: u8,
        now_ms: i64,
    ) {
        let v6 = view.ip_version == 6;
        if self.filters.excludes_packet(
            &view.src_ip,
            &view.dst_ip,
            0,
            0,
            Some(IcmpId { v6, icmp_type }),
        ) {
            return;
        }

        let mut event = self.base_event(EventType::Icmp, interface, view, now_ms);
        event.icmp_type = icmp_type;
        event.icmp_code = icmp_code;
        event.icmp_desc = icmp_description(v6, icmp_type).to_string();
        event.byte_count = view.captured_len as i64;
        self.emit(event);
    }

    /// Retire idle flows: TCP flows produce TIMEOUT events, UDP flows
    /// produce UDP_END events. Called from the sweeper ticker.
    pub fn sweep(&self, now_ms: i64) {
        self.retire_idle(now_ms, TCP_IDLE_MS, UDP_IDLE_MS);
    }

    /// Retire every outstanding flow so the store reflects a clean snapshot
    /// on shutdown.
    pub fn flush_all(&self, now_ms: i64) {
        self.retire_idle(now_ms, -1, -1);
    }

    fn retire_idle(&self, now_ms: i64, tcp_idle_ms: i64, udp_idle_ms: i64) {
        let mut expired: Vec<NetworkEvent> = Vec::new();
        {
            let mut inner = self.inner.lock().expect("session mutex poisoned");

            let tcp_keys: Vec<FlowKey> = inner
                .tcp_flows
                .iter()
                .filter(|(_, e)| now_ms - e.last_seen > tcp_idle_ms)
                .map(|(k, _)| k.clone())
                .collect();
            for key in tcp_keys {
                if let Some(entry) = inner.tcp_flows.remove(&key) {
                    let mut event = flow_event(EventType::Timeout, &key, now_ms);
                    event.duration_ms = entry.last_seen - entry.first_seen;
                    event.byte_count = entry.bytes;
                    event.reason = EndReason::Timeout;
                    event.hostname = entry.hostname;
                    event.dns_age_ms = entry.dns_age_ms;
                    expired.push(event);
                }
            }

            let udp_keys: Vec<FlowKey> = inner
                .udp_flows
                .iter()
                .filter(|(_, e)| now_ms - e.last_seen > udp_idle_ms)
                .map(|(k, _)| k.clone())
                .collect();
            for key in udp_keys {
                if let Some(entry) = inner.udp_flows.remove(&key) {
                    let mut event = flow_event(EventType::UdpEnd, &key, now_ms);
                    event.duration_ms = entry.last_seen - entry.first_seen;
                    event.byte_count = entry.bytes;
                    event.protocol = entry.protocol.to_string();
                    expired.push(event);
                }
            }

            // Expire stale DNS cache entries on the same cadence.
            inner
                .dns_cache
                .retain(|_, e| now_ms - e.learned_at <= DNS_CACHE_MAX_AGE_MS);
        }

        for event in expired {
            self.emit(event);
        }
    }

    fn base_event(
        &self,
        event_type: EventType,
        interface: &str,
        view: &PacketView<'_>,
        now_ms: i64,
    ) -> NetworkEvent {
        NetworkEvent {
            timestamp: now_ms,
            event_type,
            interface: interface.to_string(),
            ip_version: view.ip_version,
            src_ip: view.src_ip.to_string(),
            dst_ip: view.dst_ip.to_string(),
            ..Default::default()
        }
    }

    fn emit(&self, event: NetworkEvent) {
        if !self.filters.allows_event(event.event_type) {
            return;
        }
        self.sink.send(event);
    }
}

fn flow_event(event_type: EventType, key: &FlowKey, now_ms: i64) -> NetworkEvent {
    NetworkEvent {
        timestamp: now_ms,
        event_type,
        interface: key.interface.clone(),
        ip_version: key.ip_version,
        src_ip: key.src_ip.to_string(),
        dst_ip: key.dst_ip.to_string(),
        src_port: key.src_port,
        dst_port: key.dst_port,
        ..Default::default()
    }
}

/// Look up `addr` in the DNS cache, evicting the entry if it aged out.
/// Returns (hostname, age_ms) or empty values on a miss.
fn lookup_dns_cache(inner: &mut Inner, addr: &IpAddr, now_ms: i64) -> (String, i64) {
    match inner.dns_cache.get(addr) {
        Some(entry) => {
            let age = now_ms - entry.learned_at;
            if age > DNS_CACHE_MAX_AGE_MS {
                inner.dns_cache.remove(addr);
                (String::new(), 0)
            } else {
                (entry.hostname.clone(), age)
            }
        }
        None => (String::new(), 0),
    }
}

fn insert_dns_cache(inner: &mut Inner, addr: IpAddr, hostname: String, now_ms: i64) {
    if inner.dns_cache.len() >= DNS_CACHE_CAPACITY && !inner.dns_cache.contains_key(&addr) {
        // Evict the oldest entry to stay within the cap.
        if let Some(oldest) = inner
            .dns_cache
            .iter()
            .min_by_key(|(_, e)| e.learned_at)
            .map(|(k, _)| *k)
        {
            inner.dns_cache.remove(&oldest);
        }
    }
    inner.dns_cache.insert(
        addr,
        DnsCacheEntry {
            hostname,
            learned_at: now_ms,
        },
    );
}

/// Service hint for UDP flows on well-known ports.
fn udp_service_hint(src_port: u16, dst_port: u16) -> &'static str {
    let port = if dst_port < src_port { dst_port } else { src_port };
    match port {
        53 => "DNS",
        67 | 68 => "DHCP",
        69 => "TFTP",
        123 => "NTP",
        161 => "SNMP",
        443 => "QUIC",
        514 => "Syslog",
        1900 => "SSDP",
        5353 => "mDNS",
        _ => "",
    }
}

/// Short human-readable ICMP description.
fn icmp_description(v6: bool, icmp_type: u8) -> &'static str {
    if v6 {
        match icmp_type {
            1 => "destination unreachable",
            2 => "packet too big",
            3 => "time exceeded",
            4 => "parameter problem",
            128 => "echo request",
            129 => "echo reply",
            133 => "router solicitation",
            134 => "router advertisement",
            135 => "neighbor solicitation",
            136 => "neighbor advertisement",
            137 => "redirect",
            _ => "icmpv6",
        }
    } else {
        match icmp_type {
            0 => "echo reply",
            3 => "destination unreachable",
            5 => "redirect",
            8 => "echo request",
            11 => "time exceeded",
            12 => "parameter problem",
            _ => "icmp",
        }
    }
}
