// Embedded event store: one SQLite file holding the network_events table.
//
// Writers serialize on the connection mutex; SQLite WAL journaling keeps
// concurrent readers (the out-of-scope query API) unblocked.

mod compact;
mod model;

pub use compact::{CompactPreview, CompactStats};
pub use model::{
    now_ms, EndReason, EventFilter, EventType, NetworkEvent, StoreStats, DEFAULT_QUERY_LIMIT,
};

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};

use crate::error::NetWatchError;
use crate::publisher;

/// Rows per prepared-statement flush inside a batch transaction.
pub const BATCH_CHUNK_SIZE: usize = 100;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS network_events (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp    INTEGER NOT NULL,
    end_time     INTEGER NOT NULL DEFAULT 0,
    event_type   TEXT NOT NULL,
    interface    TEXT NOT NULL DEFAULT '',
    ip_version   INTEGER NOT NULL DEFAULT 4,
    src_ip       TEXT NOT NULL DEFAULT '',
    dst_ip       TEXT NOT NULL DEFAULT '',
    src_port     INTEGER NOT NULL DEFAULT 0,
    dst_port     INTEGER NOT NULL DEFAULT 0,
    dns_type     TEXT NOT NULL DEFAULT '',
    dns_query    TEXT NOT NULL DEFAULT '',
    dns_answers  TEXT NOT NULL DEFAULT '',
    dns_cnames   TEXT NOT NULL DEFAULT '',
    tls_sni      TEXT NOT NULL DEFAULT '',
    hostname     TEXT NOT NULL DEFAULT '',
    dns_age_ms   INTEGER NOT NULL DEFAULT 0,
    duration_ms  INTEGER NOT NULL DEFAULT 0,
    byte_count   INTEGER NOT NULL DEFAULT 0,
    reason       TEXT NOT NULL DEFAULT '',
    icmp_type    INTEGER NOT NULL DEFAULT 0,
    icmp_code    INTEGER NOT NULL DEFAULT 0,
    icmp_desc    TEXT NOT NULL DEFAULT '',
    protocol     TEXT NOT NULL DEFAULT '',
    compacted    INTEGER NOT NULL DEFAULT 0,
    original_ids TEXT NOT NULL DEFAULT '',
    event_count  INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_events_timestamp  ON network_events(timestamp);
CREATE INDEX IF NOT EXISTS idx_events_event_type ON network_events(event_type);
CREATE INDEX IF NOT EXISTS idx_events_interface  ON network_events(interface);
CREATE INDEX IF NOT EXISTS idx_events_ip_version ON network_events(ip_version);
CREATE INDEX IF NOT EXISTS idx_events_src_ip     ON network_events(src_ip);
CREATE INDEX IF NOT EXISTS idx_events_dst_ip     ON network_events(dst_ip);
CREATE INDEX IF NOT EXISTS idx_events_dns_query  ON network_events(dns_query);
CREATE INDEX IF NOT EXISTS idx_events_tls_sni    ON network_events(tls_sni);
";

const INSERT_SQL: &str = "INSERT INTO network_events (
    timestamp, end_time, event_type, interface, ip_version,
    src_ip, dst_ip, src_port, dst_port,
    dns_type, dns_query, dns_answers, dns_cnames, tls_sni,
    hostname, dns_age_ms, duration_ms, byte_count, reason,
    icmp_type, icmp_code, icmp_desc, protocol,
    compacted, original_ids, event_count
) VALUES (
    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
    ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26
)";

const SELECT_COLUMNS: &str = "id, timestamp, end_time, event_type, interface, ip_version, \
    src_ip, dst_ip, src_port, dst_port, dns_type, dns_query, dns_answers, dns_cnames, \
    tls_sni, hostname, dns_age_ms, duration_ms, byte_count, reason, icmp_type, icmp_code, \
    icmp_desc, protocol, compacted, original_ids, event_count";

pub struct EventStore {
    pub(crate) conn: Mutex<Connection>,
}

impl EventStore {
    /// Open (creating if absent) the store at `path` and run the idempotent
    /// migration: missing table/indexes are added, existing columns are never
    /// altered.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, NetWatchError> {
        let conn = Connection::open(&path)
            .map_err(|e| NetWatchError::StoreFatal(format!("open {:?}: {e}", path.as_ref())))?;
        apply_pragmas(&conn)?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| NetWatchError::StoreFatal(format!("migrate schema: {e}")))?;
        Ok(EventStore {
            conn: Mutex::new(conn),
        })
    }

    /// Append one event; returns the assigned id. The publisher hook is
    /// invoked after the insert commits.
    pub fn append(&self, event: &NetworkEvent) -> Result<i64, NetWatchError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        bind_insert(&conn, event)?;
        let id = conn.last_insert_rowid();
        drop(conn);

        let mut published = event.clone();
        published.id = id;
        publisher::publish(&published);
        Ok(id)
    }

    /// Append many events in one transaction (all rows commit or none),
    /// flushing the prepared statement every [`BATCH_CHUNK_SIZE`] rows.
    /// Returns the number of rows written.
    pub fn append_batch(&self, events: &[NetworkEvent]) -> Result<usize, NetWatchError> {
        if events.is_empty() {
            return Ok(0);
        }

        let mut ids = Vec::with_capacity(events.len());
        {
            let mut conn = self.conn.lock().expect("store mutex poisoned");
            let tx = conn.transaction().map_err(NetWatchError::from)?;
            for chunk in events.chunks(BATCH_CHUNK_SIZE) {
                let mut stmt = tx.prepare_cached(INSERT_SQL).map_err(NetWatchError::from)?;
                for event in chunk {
                    bind_insert_stmt(&mut stmt, event)?;
                    ids.push(tx.last_insert_rowid());
                }
            }
            tx.commit().map_err(NetWatchError::from)?;
        }

        for (event, id) in events.iter().zip(&ids) {
            let mut published = event.clone();
            published.id = *id;
            publisher::publish(&published);
        }
        Ok(events.len())
    }

    /// Filtered query, newest first (`timestamp DESC, id DESC`).
    pub fn query(&self, filter: &EventFilter) -> Result<Vec<NetworkEvent>, NetWatchError> {
        let mut sql = format!("SELECT {SELECT_COLUMNS} FROM network_events WHERE 1=1");
        let mut values: Vec<rusqlite::types::Value> = Vec::new();

        if let Some(since) = filter.since_ms {
            sql.push_str(&format!(" AND timestamp >= ?{}", values.len() + 1));
            values.push(since.into());
        }
        if let Some(until) = filter.until_ms {
            sql.push_str(&format!(" AND timestamp < ?{}", values.len() + 1));
            values.push(until.into());
        }
        if !filter.event_types.is_empty() {
            let placeholders: Vec<String> = filter
                .event_types
                .iter()
                .enumerate()
                .map(|(i, _)| format!("?{}", values.len() + 1 + i))
                .collect();
            sql.push_str(&format!(" AND event_type IN ({})", placeholders.join(",")));
            for et in &filter.event_types {
                values.push(et.as_str().to_string().into());
            }
        }
        if let Some(addr) = &filter.address {
            let pattern = format!("%{addr}%");
            sql.push_str(&format!(
                " AND (src_ip LIKE ?{} OR dst_ip LIKE ?{})",
                values.len() + 1,
                values.len() + 2
            ));
            values.push(pattern.clone().into());
            values.push(pattern.into());
        }
        if let Some(domain) = &filter.domain {
            sql.push_str(&format!(" AND dns_query LIKE ?{}", values.len() + 1));
            values.push(format!("%{domain}%").into());
        }
        if let Some(iface) = &filter.interface {
            sql.push_str(&format!(" AND interface = ?{}", values.len() + 1));
            values.push(iface.clone().into());
        }

        let limit = filter.limit.unwrap_or(DEFAULT_QUERY_LIMIT);
        sql.push_str(&format!(
            " ORDER BY timestamp DESC, id DESC LIMIT {} OFFSET {}",
            limit, filter.offset
        ));

        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(&sql).map_err(NetWatchError::from)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(values), row_to_event)
            .map_err(NetWatchError::from)?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row.map_err(NetWatchError::from)?);
        }
        Ok(events)
    }

    /// Aggregate statistics: row count, first/last timestamps, file size.
    pub fn stats(&self) -> Result<StoreStats, NetWatchError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let (total, first, last) = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(MIN(timestamp), 0), COALESCE(MAX(timestamp), 0)
                 FROM network_events",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .map_err(NetWatchError::from)?;
        let size_bytes: i64 = conn
            .query_row(
                "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
                [],
                |r| r.get(0),
            )
            .unwrap_or(0);
        Ok(StoreStats {
            total_events: total,
            first_event_ms: first,
            last_event_ms: last,
            size_bytes,
        })
    }

    /// Retention sweep: delete rows older than `cutoff_ms`, then reclaim
    /// file space. Caller-driven; never triggered internally.
    pub fn sweep_older_than(&self, cutoff_ms: i64) -> Result<usize, NetWatchError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let removed = conn
            .execute(
                "DELETE FROM network_events WHERE timestamp < ?1",
                params![cutoff_ms],
            )
            .map_err(NetWatchError::from)?;
        if removed > 0 {
            log::info!("retention sweep removed {removed} events");
            if let Err(e) = conn.execute_batch("VACUUM") {
                log::warn!("vacuum after retention sweep failed: {e}");
            }
        }
        Ok(removed)
    }

    /// Flush the WAL into the main file. Safe to call more than once; also
    /// happens implicitly when the store is dropped.
    pub fn close(&self) {
        let conn = self.conn.lock().expect("store mutex poisoned");
        if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)") {
            log::warn!("wal checkpoint on close failed: {e}");
        }
    }
}

fn apply_pragmas(conn: &Connection) -> Result<(), NetWatchError> {
    let mut set = |name: &str, value: &dyn rusqlite::ToSql| {
        conn.pragma_update(None, name, value)
            .map_err(|e| NetWatchError::StoreFatal(format!("pragma {name}: {e}")))
    };
    set("journal_mode", &"WAL")?;
    set("synchronous", &"NORMAL")?;
    // Negative cache_size is KiB: ~2 MB page cache.
    set("cache_size", &-2048i64)?;
    set("mmap_size", &268_435_456i64)?; // 256 MiB read window
    set("foreign_keys", &"ON")?;
    Ok(())
}

fn bind_insert(conn: &Connection, event: &NetworkEvent) -> Result<(), NetWatchError> {
    let mut stmt = conn.prepare_cached(INSERT_SQL).map_err(NetWatchError::from)?;
    bind_insert_stmt(&mut stmt, event)
}

fn bind_insert_stmt(
    stmt: &mut rusqlite::CachedStatement<'_>,
    event: &NetworkEvent,
) -> Result<(), NetWatchError> {
    stmt.execute(params![
        event.timestamp,
        event.end_time,
        event.event_type.as_str(),
        event.interface,
        event.ip_version,
        event.src_ip,
        event.dst_ip,
        event.src_port,
        event.dst_port,
        event.dns_type,
        event.dns_query,
        event.dns_answers,
        event.dns_cnames,
        event.tls_sni,
        event.hostname,
        event.dns_age_ms,
        event.duration_ms,
        event.byte_count,
        event.reason.as_str(),
        event.icmp_type,
        event.icmp_code,
        event.icmp_desc,
        event.protocol,
        event.compacted,
        event.original_ids,
        event.event_count,
    ])
    .map_err(NetWatchError::from)?;
    Ok(())
}

pub(crate) fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<NetworkEvent> {
    let event_type: String = row.get(3)?;
    let reason: String = row.get(19)?;
    Ok(NetworkEvent {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        end_time: row.get(2)?,
        event_type: EventType::parse(&event_type).unwrap_or(EventType::Dns),
        interface: row.get(4)?,
        ip_version: row.get(5)?,
        src_ip: row.get(6)?,
        dst_ip: row.get(7)?,
        src_port: row.get(8)?,
        dst_port: row.get(9)?,
        dns_type: row.get(10)?,
        dns_query: row.get(11)?,
        dns_answers: row.get(12)?,
        dns_cnames: row.get(13)?,
        tls_sni: row.get(14)?,
        hostname: row.get(15)?,
        dns_age_ms: row.get(16)?,
        duration_ms: row.get(17)?,
        byte_count: row.get(18)?,
        reason: EndReason::parse(&reason),
        icmp_type: row.get(20)?,
        icmp_code: row.get(21)?,
        icmp_desc: row.get(22)?,
        protocol: row.get(23)?,
        compacted: row.get(24)?,
        original_ids: row.get(25)?,
        event_count: row.get(26)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, EventStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::open(dir.path().join("events.db")).unwrap();
        (dir, store)
    }

    fn event_at(ts: i64, event_type: EventType) -> NetworkEvent {
        NetworkEvent {
            timestamp: ts,
            event_type,
            interface: "eth0".to_string(),
            src_ip: "10.0.0.1".to_string(),
            dst_ip: "8.8.8.8".to_string(),
            src_port: 40000,
            dst_port: 443,
            ..Default::default()
        }
    }

    #[test]
    fn open_creates_missing_file_and_is_reopenable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.db");
        {
            let store = EventStore::open(&path).unwrap();
            store.append(&event_at(1000, EventType::TcpStart)).unwrap();
        }
        // Reopen: migration is idempotent, data survives.
        let store = EventStore::open(&path).unwrap();
        assert_eq!(store.stats().unwrap().total_events, 1);
    }

    #[test]
    fn append_assigns_monotonic_ids() {
        let (_dir, store) = open_temp();
        let a = store.append(&event_at(1000, EventType::TcpStart)).unwrap();
        let b = store.append(&event_at(2000, EventType::TcpEnd)).unwrap();
        assert!(b > a);
    }

    #[test]
    fn append_batch_commits_all_rows() {
        let (_dir, store) = open_temp();
        // More than two chunks to exercise the chunked flush.
        let events: Vec<NetworkEvent> = (0..250)
            .map(|i| event_at(1000 + i, EventType::Dns))
            .collect();
        assert_eq!(store.append_batch(&events).unwrap(), 250);
        assert_eq!(store.stats().unwrap().total_events, 250);
    }

    #[test]
    fn query_orders_newest_first() {
        let (_dir, store) = open_temp();
        for ts in [3000, 1000, 2000] {
            store.append(&event_at(ts, EventType::Dns)).unwrap();
        }
        let events = store.query(&EventFilter::default()).unwrap();
        let stamps: Vec<i64> = events.iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, vec![3000, 2000, 1000]);
    }

    #[test]
    fn query_limit_defaults_to_50() {
        let (_dir, store) = open_temp();
        let events: Vec<NetworkEvent> =
            (0..60).map(|i| event_at(i, EventType::Dns)).collect();
        store.append_batch(&events).unwrap();
        assert_eq!(store.query(&EventFilter::default()).unwrap().len(), 50);
        let filter = EventFilter {
            limit: Some(10),
            offset: 55,
            ..Default::default()
        };
        assert_eq!(store.query(&filter).unwrap().len(), 5);
    }

    #[test]
    fn query_filters_compose() {
        let (_dir, store) = open_temp();
        let mut dns = event_at(1000, EventType::Dns);
        dns.dns_query = "api.example.com".to_string();
        store.append(&dns).unwrap();
        let mut other = event_at(2000, EventType::TcpStart);
        other.src_ip = "192.168.1.5".to_string();
        other.interface = "wlan0".to_string();
        store.append(&other).unwrap();

        let filter = EventFilter {
            domain: Some("example".to_string()),
            ..Default::default()
        };
        let hits = store.query(&filter).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].dns_query, "api.example.com");

        let filter = EventFilter {
            address: Some("192.168".to_string()),
            interface: Some("wlan0".to_string()),
            event_types: vec![EventType::TcpStart],
            ..Default::default()
        };
        assert_eq!(store.query(&filter).unwrap().len(), 1);

        let filter = EventFilter {
            since_ms: Some(1500),
            until_ms: Some(2500),
            ..Default::default()
        };
        assert_eq!(store.query(&filter).unwrap().len(), 1);
    }

    #[test]
    fn roundtrip_preserves_dns_fields() {
        let (_dir, store) = open_temp();
        let mut ev = event_at(1234, EventType::Dns);
        ev.dns_type = "RESPONSE".to_string();
        ev.dns_query = "example.com".to_string();
        ev.dns_answers = "93.184.216.34,93.184.216.35".to_string();
        ev.dns_cnames = "edge.example.com".to_string();
        ev.protocol = "A".to_string();
        store.append(&ev).unwrap();

        let filter = EventFilter {
            domain: Some("example.com".to_string()),
            ..Default::default()
        };
        let got = &store.query(&filter).unwrap()[0];
        assert_eq!(got.dns_query, "example.com");
        assert_eq!(got.dns_answers, "93.184.216.34,93.184.216.35");
        assert_eq!(got.dns_cnames, "edge.example.com");
        assert_eq!(got.protocol, "A");
        assert_eq!(got.dns_type, "RESPONSE");
    }

    #[test]
    fn stats_reports_bounds_and_size() {
        let (_dir, store) = open_temp();
        assert_eq!(store.stats().unwrap().total_events, 0);
        store.append(&event_at(500, EventType::Dns)).unwrap();
        store.append(&event_at(9000, EventType::Dns)).unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.total_events, 2);
        assert_eq!(stats.first_event_ms, 500);
        assert_eq!(stats.last_event_ms, 9000);
        assert!(stats.size_bytes > 0);
    }

    #[test]
    fn retention_sweep_removes_old_rows() {
        let (_dir, store) = open_temp();
        store.append(&event_at(1000, EventType::Dns)).unwrap();
        store.append(&event_at(5000, EventType::Dns)).unwrap();
        assert_eq!(store.sweep_older_than(3000).unwrap(), 1);
        let left = store.query(&EventFilter::default()).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].timestamp, 5000);
    }
}
