// Offline compaction: merges START/END pairs, deduplicates DNS, removes
// orphaned ENDs, optionally rolls old rows into hourly summaries.
//
// Atomicity is pair-level: each merged pair is one insert-plus-delete
// transaction, and a failed pair is logged and skipped. Already-compacted
// rows (`compacted = 1`) are never re-selected, which makes a rerun with the
// same cutoff a no-op.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::model::{EndReason, EventType, NetworkEvent};
use crate::error::NetWatchError;

const HOUR_MS: i64 = 3_600_000;

/// Window within which an END may match its START (guards against pairing
/// across unrelated reuses of the same 4-tuple).
const PAIR_MATCH_WINDOW_MS: i64 = 24 * HOUR_MS;

/// Window within which a RESPONSE may match its QUERY.
const DNS_PAIR_WINDOW_MS: i64 = 5_000;

/// Per-phase counters returned by [`super::EventStore::compact`].
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CompactStats {
    pub tcp_pairs: i64,
    pub udp_pairs: i64,
    pub dns_pairs: i64,
    pub duplicates_removed: i64,
    pub orphans_removed: i64,
    pub hourly_summaries: i64,
    pub events_removed: i64,
    pub events_created: i64,
    pub total_bytes: i64,
    pub tcp_bytes: i64,
    pub udp_bytes: i64,
}

/// Counts produced by a dry run. Pair counts are upper bounds (min of starts
/// and ends); duplicate and orphan counts are exact.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CompactPreview {
    pub tcp_starts: i64,
    pub tcp_ends: i64,
    pub udp_starts: i64,
    pub udp_ends: i64,
    pub dns_queries: i64,
    pub dns_responses: i64,
    pub duplicates: i64,
    pub orphans: i64,
    pub hourly_buckets: i64,
}

struct StartRow {
    id: i64,
    timestamp: i64,
    interface: String,
    ip_version: u8,
    src_ip: String,
    dst_ip: String,
    src_port: u16,
    dst_port: u16,
    hostname: String,
    dns_age_ms: i64,
    protocol: String,
}

struct EndRow {
    id: i64,
    timestamp: i64,
    duration_ms: i64,
    byte_count: i64,
    reason: String,
}

impl super::EventStore {
    /// Run all compaction phases against rows older than `older_than_ms`.
    /// `dedupe_window_ms == 0` disables DNS deduplication; `hourly_summary`
    /// enables the destructive roll-up phase.
    pub fn compact(
        &self,
        older_than_ms: i64,
        dedupe_window_ms: i64,
        hourly_summary: bool,
    ) -> Result<CompactStats, NetWatchError> {
        let mut stats = CompactStats::default();
        let mut conn = self.conn.lock().expect("store mutex poisoned");

        merge_pairs(&mut conn, PairKind::Tcp, older_than_ms, &mut stats)?;
        merge_pairs(&mut conn, PairKind::Udp, older_than_ms, &mut stats)?;
        merge_dns_pairs(&mut conn, older_than_ms, &mut stats)?;
        if dedupe_window_ms > 0 {
            dedupe_dns(&conn, older_than_ms, dedupe_window_ms, &mut stats)?;
        }
        remove_orphaned_ends(&conn, older_than_ms, &mut stats)?;
        if hourly_summary {
            create_hourly_summaries(&mut conn, older_than_ms, &mut stats)?;
        }
        collect_transfer_stats(&conn, &mut stats);

        if let Err(e) = conn.execute_batch("VACUUM") {
            log::warn!("vacuum after compaction failed: {e}");
        }
        Ok(stats)
    }

    /// Dry run: report what a compaction with the same arguments would touch
    /// without inserting or deleting anything.
    pub fn compact_preview(
        &self,
        older_than_ms: i64,
        dedupe_window_ms: i64,
        hourly_summary: bool,
    ) -> Result<CompactPreview, NetWatchError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let count = |sql: &str| -> Result<i64, NetWatchError> {
            conn.query_row(sql, params![older_than_ms], |r| r.get(0))
                .map_err(NetWatchError::from)
        };

        let mut preview = CompactPreview {
            tcp_starts: count(
                "SELECT COUNT(*) FROM network_events
                 WHERE event_type = 'TCP_START' AND timestamp < ?1 AND compacted = 0",
            )?,
            tcp_ends: count(
                "SELECT COUNT(*) FROM network_events
                 WHERE event_type IN ('TCP_END', 'TIMEOUT') AND timestamp < ?1 AND compacted = 0",
            )?,
            udp_starts: count(
                "SELECT COUNT(*) FROM network_events
                 WHERE event_type = 'UDP_START' AND timestamp < ?1 AND compacted = 0",
            )?,
            udp_ends: count(
                "SELECT COUNT(*) FROM network_events
                 WHERE event_type = 'UDP_END' AND timestamp < ?1 AND compacted = 0",
            )?,
            dns_queries: count(
                "SELECT COUNT(*) FROM network_events
                 WHERE event_type = 'DNS' AND dns_type = 'QUERY' AND timestamp < ?1
                 AND compacted = 0",
            )?,
            dns_responses: count(
                "SELECT COUNT(*) FROM network_events
                 WHERE event_type = 'DNS' AND dns_type = 'RESPONSE' AND timestamp < ?1
                 AND compacted = 0",
            )?,
            ..Default::default()
        };

        if dedupe_window_ms > 0 {
            preview.duplicates =
                collect_dns_duplicates(&conn, older_than_ms, dedupe_window_ms)?.len() as i64;
        }
        preview.orphans = conn
            .query_row(
                &format!(
                    "SELECT (SELECT COUNT(*) FROM network_events e WHERE {tcp})
                          + (SELECT COUNT(*) FROM network_events e WHERE {udp})",
                    tcp = orphan_predicate("TCP_END", "TCP_START"),
                    udp = orphan_predicate("UDP_END", "UDP_START"),
                ),
                params![older_than_ms],
                |r| r.get(0),
            )
            .map_err(NetWatchError::from)?;
        if hourly_summary {
            preview.hourly_buckets = conn
                .query_row(
                    "SELECT COUNT(*) FROM (
                         SELECT DISTINCT timestamp - (timestamp % 3600000), interface, ip_version
                         FROM network_events
                         WHERE event_type != 'HOURLY'
                           AND timestamp - (timestamp % 3600000) + 3600000 <= ?1
                     )",
                    params![older_than_ms],
                    |r| r.get(0),
                )
                .map_err(NetWatchError::from)?;
        }
        Ok(preview)
    }
}

#[derive(Clone, Copy)]
enum PairKind {
    Tcp,
    Udp,
}

impl PairKind {
    fn start_type(self) -> &'static str {
        match self {
            PairKind::Tcp => "TCP_START",
            PairKind::Udp => "UDP_START",
        }
    }

    /// SQL list of event types that may terminate a flow of this kind.
    fn end_types(self) -> &'static str {
        match self {
            PairKind::Tcp => "'TCP_END', 'TIMEOUT'",
            PairKind::Udp => "'UDP_END'",
        }
    }

    fn merged_type(self) -> EventType {
        match self {
            PairKind::Tcp => EventType::Tcp,
            PairKind::Udp => EventType::Udp,
        }
    }
}

/// Phase 1/2: merge START rows older than the cutoff with their earliest
/// matching END on the same 4-tuple.
fn merge_pairs(
    conn: &mut Connection,
    kind: PairKind,
    older_than_ms: i64,
    stats: &mut CompactStats,
) -> Result<(), NetWatchError> {
    let starts = select_starts(conn, kind.start_type(), older_than_ms)?;
    let total = starts.len();
    log::info!("compacting {} {} rows", total, kind.start_type());

    for (i, start) in starts.into_iter().enumerate() {
        if (i + 1) % 1000 == 0 {
            log::info!(
                "{} progress: {}/{} processed",
                kind.start_type(),
                i + 1,
                total
            );
        }

        let end_sql = format!(
            "SELECT id, timestamp, duration_ms, byte_count, reason FROM network_events
             WHERE event_type IN ({}) AND compacted = 0
               AND src_ip = ?1 AND src_port = ?2 AND dst_ip = ?3 AND dst_port = ?4
               AND timestamp > ?5 AND timestamp < ?6
             ORDER BY timestamp ASC LIMIT 1",
            kind.end_types()
        );
        let end = conn
            .query_row(
                &end_sql,
                params![
                    start.src_ip,
                    start.src_port,
                    start.dst_ip,
                    start.dst_port,
                    start.timestamp,
                    start.timestamp + PAIR_MATCH_WINDOW_MS,
                ],
                |r| {
                    Ok(EndRow {
                        id: r.get(0)?,
                        timestamp: r.get(1)?,
                        duration_ms: r.get(2)?,
                        byte_count: r.get(3)?,
                        reason: r.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(NetWatchError::from)?;

        let Some(end) = end else { continue };

        let merged = NetworkEvent {
            timestamp: start.timestamp,
            end_time: end.timestamp,
            event_type: kind.merged_type(),
            interface: start.interface.clone(),
            ip_version: start.ip_version,
            src_ip: start.src_ip.clone(),
            dst_ip: start.dst_ip.clone(),
            src_port: start.src_port,
            dst_port: start.dst_port,
            hostname: start.hostname.clone(),
            dns_age_ms: start.dns_age_ms,
            protocol: start.protocol.clone(),
            duration_ms: end.duration_ms,
            byte_count: end.byte_count,
            reason: EndReason::parse(&end.reason),
            compacted: true,
            original_ids: format!("{},{}", start.id, end.id),
            ..Default::default()
        };

        // One transaction per pair: merged row appears and sources vanish
        // together, or the pair is skipped.
        if let Err(e) = merge_pair_tx(conn, &merged, start.id, end.id) {
            log::warn!(
                "{} pair merge failed for ids {},{}: {e}",
                kind.start_type(),
                start.id,
                end.id
            );
            continue;
        }

        match kind {
            PairKind::Tcp => stats.tcp_pairs += 1,
            PairKind::Udp => stats.udp_pairs += 1,
        }
        stats.events_removed += 2;
        stats.events_created += 1;
    }
    Ok(())
}

/// Phase 3: merge DNS QUERY rows with the earliest RESPONSE for the same
/// query name within the pairing window.
fn merge_dns_pairs(
    conn: &mut Connection,
    older_than_ms: i64,
    stats: &mut CompactStats,
) -> Result<(), NetWatchError> {
    let queries = {
        let mut stmt = conn
            .prepare(
                "SELECT id, timestamp, interface, ip_version, src_ip, dst_ip,
                        src_port, dst_port, dns_query, protocol
                 FROM network_events
                 WHERE event_type = 'DNS' AND dns_type = 'QUERY'
                   AND timestamp < ?1 AND compacted = 0
                 ORDER BY timestamp ASC",
            )
            .map_err(NetWatchError::from)?;
        let rows = stmt
            .query_map(params![older_than_ms], |r| {
                Ok(StartRow {
                    id: r.get(0)?,
                    timestamp: r.get(1)?,
                    interface: r.get(2)?,
                    ip_version: r.get(3)?,
                    src_ip: r.get(4)?,
                    dst_ip: r.get(5)?,
                    src_port: r.get(6)?,
                    dst_port: r.get(7)?,
                    hostname: r.get(8)?, // dns_query rides in this slot
                    dns_age_ms: 0,
                    protocol: r.get(9)?,
                })
            })
            .map_err(NetWatchError::from)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(NetWatchError::from)?);
        }
        out
    };

    log::info!("compacting {} DNS QUERY rows", queries.len());

    for query in queries {
        let dns_query = query.hostname; // see the SELECT above
        let response = conn
            .query_row(
                "SELECT id, timestamp, dns_answers, dns_cnames FROM network_events
                 WHERE event_type = 'DNS' AND dns_type = 'RESPONSE' AND dns_query = ?1
                   AND timestamp > ?2 AND timestamp < ?3 AND compacted = 0
                 ORDER BY timestamp ASC LIMIT 1",
                params![
                    dns_query,
                    query.timestamp,
                    query.timestamp + DNS_PAIR_WINDOW_MS
                ],
                |r| {
                    Ok((
                        r.get::<_, i64>(0)?,
                        r.get::<_, i64>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(NetWatchError::from)?;

        let Some((resp_id, resp_ts, answers, cnames)) = response else {
            continue;
        };

        let merged = NetworkEvent {
            timestamp: query.timestamp,
            end_time: resp_ts,
            event_type: EventType::Dns,
            interface: query.interface.clone(),
            ip_version: query.ip_version,
            src_ip: query.src_ip.clone(),
            dst_ip: query.dst_ip.clone(),
            src_port: query.src_port,
            dst_port: query.dst_port,
            dns_type: "COMPLETE".to_string(),
            dns_query: dns_query.clone(),
            dns_answers: answers,
            dns_cnames: cnames,
            protocol: query.protocol.clone(),
            duration_ms: resp_ts - query.timestamp,
            compacted: true,
            original_ids: format!("{},{}", query.id, resp_id),
            ..Default::default()
        };

        if let Err(e) = merge_pair_tx(conn, &merged, query.id, resp_id) {
            log::warn!("DNS pair merge failed for ids {},{}: {e}", query.id, resp_id);
            continue;
        }
        stats.dns_pairs += 1;
        stats.events_removed += 2;
        stats.events_created += 1;
    }
    Ok(())
}

fn merge_pair_tx(
    conn: &mut Connection,
    merged: &NetworkEvent,
    first_id: i64,
    second_id: i64,
) -> Result<(), NetWatchError> {
    let tx = conn.transaction().map_err(NetWatchError::from)?;
    super::bind_insert(&tx, merged)?;
    tx.execute(
        "DELETE FROM network_events WHERE id IN (?1, ?2)",
        params![first_id, second_id],
    )
    .map_err(NetWatchError::from)?;
    tx.commit().map_err(NetWatchError::from)
}

fn select_starts(
    conn: &Connection,
    start_type: &str,
    older_than_ms: i64,
) -> Result<Vec<StartRow>, NetWatchError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, timestamp, interface, ip_version, src_ip, dst_ip,
                    src_port, dst_port, hostname, dns_age_ms, protocol
             FROM network_events
             WHERE event_type = ?1 AND timestamp < ?2 AND compacted = 0
             ORDER BY timestamp ASC",
        )
        .map_err(NetWatchError::from)?;
    let rows = stmt
        .query_map(params![start_type, older_than_ms], |r| {
            Ok(StartRow {
                id: r.get(0)?,
                timestamp: r.get(1)?,
                interface: r.get(2)?,
                ip_version: r.get(3)?,
                src_ip: r.get(4)?,
                dst_ip: r.get(5)?,
                src_port: r.get(6)?,
                dst_port: r.get(7)?,
                hostname: r.get(8)?,
                dns_age_ms: r.get(9)?,
                protocol: r.get(10)?,
            })
        })
        .map_err(NetWatchError::from)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(NetWatchError::from)?);
    }
    Ok(out)
}

/// Phase 4: walk DNS rows in (dns_query, timestamp) order and collect every
/// row whose predecessor on the same query is within the window.
fn collect_dns_duplicates(
    conn: &Connection,
    older_than_ms: i64,
    window_ms: i64,
) -> Result<Vec<i64>, NetWatchError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, dns_query, timestamp FROM network_events
             WHERE event_type = 'DNS' AND timestamp < ?1
             ORDER BY dns_query, timestamp, id",
        )
        .map_err(NetWatchError::from)?;
    let rows = stmt
        .query_map(params![older_than_ms], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
            ))
        })
        .map_err(NetWatchError::from)?;

    let mut duplicates = Vec::new();
    let mut last_query = String::new();
    let mut last_ts = i64::MIN;
    let mut first = true;
    for row in rows {
        let (id, query, ts) = row.map_err(NetWatchError::from)?;
        if !first && query == last_query && ts - last_ts < window_ms {
            duplicates.push(id);
        } else {
            last_query = query;
            last_ts = ts;
        }
        first = false;
    }
    Ok(duplicates)
}

fn dedupe_dns(
    conn: &Connection,
    older_than_ms: i64,
    window_ms: i64,
    stats: &mut CompactStats,
) -> Result<(), NetWatchError> {
    let duplicates = collect_dns_duplicates(conn, older_than_ms, window_ms)?;
    for chunk in duplicates.chunks(500) {
        let placeholders: Vec<String> = (1..=chunk.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "DELETE FROM network_events WHERE id IN ({})",
            placeholders.join(",")
        );
        conn.execute(&sql, rusqlite::params_from_iter(chunk.iter()))
            .map_err(NetWatchError::from)?;
    }
    stats.duplicates_removed += duplicates.len() as i64;
    stats.events_removed += duplicates.len() as i64;
    Ok(())
}

fn orphan_predicate(end_type: &str, start_type: &str) -> String {
    format!(
        "e.event_type = '{end_type}' AND e.timestamp < ?1 AND NOT EXISTS (
             SELECT 1 FROM network_events s
             WHERE s.event_type = '{start_type}'
               AND s.src_ip = e.src_ip AND s.src_port = e.src_port
               AND s.dst_ip = e.dst_ip AND s.dst_port = e.dst_port
               AND s.timestamp < e.timestamp
         )"
    )
}

/// Phase 5: delete END rows with no earlier matching START on the same
/// 4-tuple.
fn remove_orphaned_ends(
    conn: &Connection,
    older_than_ms: i64,
    stats: &mut CompactStats,
) -> Result<(), NetWatchError> {
    for (end_type, start_type) in [("TCP_END", "TCP_START"), ("UDP_END", "UDP_START")] {
        let sql = format!(
            "DELETE FROM network_events AS e WHERE {}",
            orphan_predicate(end_type, start_type)
        );
        let removed = conn
            .execute(&sql, params![older_than_ms])
            .map_err(NetWatchError::from)?;
        stats.orphans_removed += removed as i64;
        stats.events_removed += removed as i64;
    }
    Ok(())
}

/// Phase 6: roll every fully-elapsed (hour, interface, ip_version) bucket
/// older than the cutoff into one HOURLY row.
fn create_hourly_summaries(
    conn: &mut Connection,
    older_than_ms: i64,
    stats: &mut CompactStats,
) -> Result<(), NetWatchError> {
    let buckets: Vec<(i64, String, u8)> = {
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT timestamp - (timestamp % 3600000) AS hour_ms,
                        interface, ip_version
                 FROM network_events
                 WHERE event_type != 'HOURLY'
                   AND timestamp - (timestamp % 3600000) + 3600000 <= ?1
                 ORDER BY hour_ms",
            )
            .map_err(NetWatchError::from)?;
        let rows = stmt
            .query_map(params![older_than_ms], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?))
            })
            .map_err(NetWatchError::from)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(NetWatchError::from)?);
        }
        out
    };

    for (hour_ms, interface, ip_version) in buckets {
        let (tcp, udp, dns, tls, icmp): (i64, i64, i64, i64, i64) = conn
            .query_row(
                "SELECT
                     SUM(CASE WHEN event_type LIKE 'TCP%' THEN 1 ELSE 0 END),
                     SUM(CASE WHEN event_type LIKE 'UDP%' THEN 1 ELSE 0 END),
                     SUM(CASE WHEN event_type = 'DNS' THEN 1 ELSE 0 END),
                     SUM(CASE WHEN event_type = 'TLS_SNI' THEN 1 ELSE 0 END),
                     SUM(CASE WHEN event_type = 'ICMP' THEN 1 ELSE 0 END)
                 FROM network_events
                 WHERE timestamp >= ?1 AND timestamp < ?2
                   AND interface = ?3 AND ip_version = ?4 AND event_type != 'HOURLY'",
                params![hour_ms, hour_ms + HOUR_MS, interface, ip_version],
                |r| {
                    Ok((
                        r.get::<_, Option<i64>>(0)?.unwrap_or(0),
                        r.get::<_, Option<i64>>(1)?.unwrap_or(0),
                        r.get::<_, Option<i64>>(2)?.unwrap_or(0),
                        r.get::<_, Option<i64>>(3)?.unwrap_or(0),
                        r.get::<_, Option<i64>>(4)?.unwrap_or(0),
                    ))
                },
            )
            .map_err(NetWatchError::from)?;

        let total = tcp + udp + dns + tls + icmp;
        if total == 0 {
            continue;
        }

        let summary = NetworkEvent {
            timestamp: hour_ms,
            event_type: EventType::Hourly,
            interface: interface.clone(),
            ip_version,
            event_count: total,
            protocol: format!("TCP:{tcp},UDP:{udp},DNS:{dns},TLS:{tls},ICMP:{icmp}"),
            compacted: true,
            ..Default::default()
        };

        let result: Result<usize, NetWatchError> = (|| {
            let tx = conn.transaction().map_err(NetWatchError::from)?;
            super::bind_insert(&tx, &summary)?;
            let removed = tx
                .execute(
                    "DELETE FROM network_events
                     WHERE timestamp >= ?1 AND timestamp < ?2
                       AND interface = ?3 AND ip_version = ?4 AND event_type != 'HOURLY'",
                    params![hour_ms, hour_ms + HOUR_MS, interface, ip_version],
                )
                .map_err(NetWatchError::from)?;
            tx.commit().map_err(NetWatchError::from)?;
            Ok(removed)
        })();

        match result {
            Ok(removed) => {
                stats.hourly_summaries += 1;
                stats.events_created += 1;
                stats.events_removed += removed as i64;
            }
            Err(e) => {
                log::warn!("hourly summary failed for bucket {hour_ms}/{interface}: {e}");
            }
        }
    }
    Ok(())
}

/// Phase 7 bookkeeping: byte totals remaining in the store, split by class.
fn collect_transfer_stats(conn: &Connection, stats: &mut CompactStats) {
    let sum = |sql: &str| -> i64 {
        conn.query_row(sql, [], |r| r.get::<_, Option<i64>>(0))
            .ok()
            .flatten()
            .unwrap_or(0)
    };
    stats.total_bytes = sum("SELECT SUM(byte_count) FROM network_events");
    stats.tcp_bytes = sum(
        "SELECT SUM(byte_count) FROM network_events
         WHERE event_type IN ('TCP', 'TCP_START', 'TCP_END')",
    );
    stats.udp_bytes = sum(
        "SELECT SUM(byte_count) FROM network_events
         WHERE event_type IN ('UDP', 'UDP_START', 'UDP_END')",
    );
}
