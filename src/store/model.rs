// Persisted event model shared by the session manager, store, and compactor.

use serde::Serialize;

/// Current UTC time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Variant tag of a persisted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventType {
    #[serde(rename = "TCP_START")]
    TcpStart,
    #[serde(rename = "TCP_END")]
    TcpEnd,
    #[serde(rename = "UDP_START")]
    UdpStart,
    #[serde(rename = "UDP_END")]
    UdpEnd,
    #[serde(rename = "DNS")]
    Dns,
    #[serde(rename = "TLS_SNI")]
    TlsSni,
    #[serde(rename = "ICMP")]
    Icmp,
    #[serde(rename = "TIMEOUT")]
    Timeout,
    /// Compacted TCP pair (has both timestamp and end_time).
    #[serde(rename = "TCP")]
    Tcp,
    /// Compacted UDP pair.
    #[serde(rename = "UDP")]
    Udp,
    /// Post-compaction roll-up bucket.
    #[serde(rename = "HOURLY")]
    Hourly,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TcpStart => "TCP_START",
            EventType::TcpEnd => "TCP_END",
            EventType::UdpStart => "UDP_START",
            EventType::UdpEnd => "UDP_END",
            EventType::Dns => "DNS",
            EventType::TlsSni => "TLS_SNI",
            EventType::Icmp => "ICMP",
            EventType::Timeout => "TIMEOUT",
            EventType::Tcp => "TCP",
            EventType::Udp => "UDP",
            EventType::Hourly => "HOURLY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "TCP_START" => EventType::TcpStart,
            "TCP_END" => EventType::TcpEnd,
            "UDP_START" => EventType::UdpStart,
            "UDP_END" => EventType::UdpEnd,
            "DNS" => EventType::Dns,
            "TLS_SNI" => EventType::TlsSni,
            "ICMP" => EventType::Icmp,
            "TIMEOUT" => EventType::Timeout,
            "TCP" => EventType::Tcp,
            "UDP" => EventType::Udp,
            "HOURLY" => EventType::Hourly,
            _ => return None,
        })
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Termination reason on END-style rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum EndReason {
    #[default]
    #[serde(rename = "")]
    None,
    #[serde(rename = "FIN")]
    Fin,
    #[serde(rename = "RST")]
    Rst,
    #[serde(rename = "TIMEOUT")]
    Timeout,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::None => "",
            EndReason::Fin => "FIN",
            EndReason::Rst => "RST",
            EndReason::Timeout => "TIMEOUT",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "FIN" => EndReason::Fin,
            "RST" => EndReason::Rst,
            "TIMEOUT" => EndReason::Timeout,
            _ => EndReason::None,
        }
    }
}

/// One recorded network event. Field semantics vary by `event_type`; unused
/// fields hold their zero value so every row shares one schema.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkEvent {
    /// Assigned by the store at append time; 0 before insertion.
    pub id: i64,
    /// UTC milliseconds since epoch.
    pub timestamp: i64,
    /// UTC milliseconds; 0 for open or atomic events.
    pub end_time: i64,
    pub event_type: EventType,
    pub interface: String,
    /// 4 or 6.
    pub ip_version: u8,
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    /// QUERY | RESPONSE | COMPLETE | empty.
    pub dns_type: String,
    pub dns_query: String,
    /// Comma-joined address list.
    pub dns_answers: String,
    /// Comma-joined CNAME chain.
    pub dns_cnames: String,
    pub tls_sni: String,
    /// Hostname tagged from the DNS cache at flow start; may be empty.
    pub hostname: String,
    /// Age of the DNS cache hit backing `hostname`, in milliseconds.
    pub dns_age_ms: i64,
    pub duration_ms: i64,
    pub byte_count: i64,
    pub reason: EndReason,
    pub icmp_type: u8,
    pub icmp_code: u8,
    pub icmp_desc: String,
    /// UDP service hint, DNS question type tag, or the per-class breakdown
    /// string on HOURLY rows.
    pub protocol: String,
    pub compacted: bool,
    /// Comma-joined ids of the rows a compacted row replaced.
    pub original_ids: String,
    /// Number of source rows represented by an HOURLY row.
    pub event_count: i64,
}

impl Default for NetworkEvent {
    fn default() -> Self {
        NetworkEvent {
            id: 0,
            timestamp: 0,
            end_time: 0,
            event_type: EventType::Dns,
            interface: String::new(),
            ip_version: 4,
            src_ip: String::new(),
            dst_ip: String::new(),
            src_port: 0,
            dst_port: 0,
            dns_type: String::new(),
            dns_query: String::new(),
            dns_answers: String::new(),
            dns_cnames: String::new(),
            tls_sni: String::new(),
            hostname: String::new(),
            dns_age_ms: 0,
            duration_ms: 0,
            byte_count: 0,
            reason: EndReason::None,
            icmp_type: 0,
            icmp_code: 0,
            icmp_desc: String::new(),
            protocol: String::new(),
            compacted: false,
            original_ids: String::new(),
            event_count: 0,
        }
    }
}

/// Filter for [`crate::store::EventStore::query`]. All fields are ANDed;
/// unset fields do not constrain the result.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Inclusive lower bound, ms since epoch.
    pub since_ms: Option<i64>,
    /// Exclusive upper bound, ms since epoch.
    pub until_ms: Option<i64>,
    /// Match any of these event types.
    pub event_types: Vec<EventType>,
    /// Substring matched against src_ip or dst_ip.
    pub address: Option<String>,
    /// Substring matched against dns_query.
    pub domain: Option<String>,
    pub interface: Option<String>,
    /// Row cap; defaults to 50 when unset.
    pub limit: Option<usize>,
    pub offset: usize,
}

/// Default query row cap when the caller does not specify one.
pub const DEFAULT_QUERY_LIMIT: usize = 50;

/// Aggregate store statistics.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StoreStats {
    pub total_events: i64,
    /// Timestamp of the oldest row, ms; 0 when empty.
    pub first_event_ms: i64,
    /// Timestamp of the newest row, ms; 0 when empty.
    pub last_event_ms: i64,
    pub size_bytes: i64,
}
