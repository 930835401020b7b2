// Pipeline orchestration: one capture thread per interface feeding a shared
// SessionManager, a writer thread draining the event channel into the store,
// and a sweeper thread retiring idle flows.
//
// Graceful-stop order: capture threads stop reading, the sweeper stops, the
// session manager emits synthetic END/TIMEOUT events for outstanding flows,
// the writer flushes its final batch (bounded by a 5 s drain deadline), and
// the store closes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, tick, Receiver};

use crate::capture::{AfPacketCapture, CaptureStats, RingConfig};
use crate::error::NetWatchError;
use crate::packet;
use crate::session::filter::FilterPolicy;
use crate::session::{event_channel, SessionManager, EVENT_CHANNEL_CAPACITY};
use crate::store::{now_ms, EventStore, NetworkEvent, BATCH_CHUNK_SIZE};

/// Interval between kernel drop-counter samples.
const DROP_SAMPLE_INTERVAL: Duration = Duration::from_secs(30);

/// Interval between flow sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(15);

/// Interval between periodic batch flushes.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Interval between retention sweeps.
const RETENTION_INTERVAL: Duration = Duration::from_secs(3600);

/// Reopen backoff bounds for transient capture errors.
const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(8);

/// Deadline for the writer to drain remaining events on shutdown.
const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

pub struct WatcherConfig {
    pub db_path: String,
    pub interfaces: Vec<String>,
    pub filters: FilterPolicy,
    pub ring: RingConfig,
    /// 0 disables the periodic retention sweep.
    pub retention_days: u32,
}

/// Run the capture pipeline until `shutdown` is set.
pub fn run(config: WatcherConfig, shutdown: &'static AtomicBool) -> Result<(), NetWatchError> {
    let store = Arc::new(EventStore::open(&config.db_path)?);
    let (sink, events_rx) = event_channel(EVENT_CHANNEL_CAPACITY);
    let session = Arc::new(SessionManager::new(config.filters.clone(), sink.clone()));

    // Capture threads. A single failed interface is skipped; permission
    // failures end the run since no interface can work without the
    // capability.
    let mut capture_handles = Vec::new();
    for interface in &config.interfaces {
        match AfPacketCapture::open(interface, &config.ring) {
            Ok(capture) => {
                let session = Arc::clone(&session);
                let name = interface.clone();
                let ring = config.ring;
                let handle = thread::Builder::new()
                    .name(format!("netwatcher-cap-{name}"))
                    .spawn(move || capture_loop(capture, ring, &name, &session, shutdown))
                    .map_err(|e| NetWatchError::Fatal(format!("spawn capture thread: {e}")))?;
                capture_handles.push(handle);
                log::info!("capture started on {interface}");
            }
            Err(e @ NetWatchError::InsufficientPermission(_)) => return Err(e),
            Err(e) => log::warn!("skipping interface {interface}: {e}"),
        }
    }
    if capture_handles.is_empty() {
        return Err(NetWatchError::CaptureDevice(
            "failed to open any capture interface".to_string(),
        ));
    }

    // Writer thread. Reports a fatal store failure back through the
    // completion channel and requests shutdown.
    let (writer_done_tx, writer_done_rx) = bounded::<Option<NetWatchError>>(1);
    let writer_store = Arc::clone(&store);
    let writer_handle = thread::Builder::new()
        .name("netwatcher-writer".into())
        .spawn(move || {
            let failure = writer_loop(&writer_store, &events_rx, shutdown);
            let _ = writer_done_tx.send(failure);
        })
        .map_err(|e| NetWatchError::Fatal(format!("spawn writer thread: {e}")))?;

    // Sweeper thread: flow idle sweep plus the hourly retention sweep.
    let sweeper_session = Arc::clone(&session);
    let sweeper_store = Arc::clone(&store);
    let retention_days = config.retention_days;
    let sweeper_handle = thread::Builder::new()
        .name("netwatcher-sweeper".into())
        .spawn(move || sweeper_loop(&sweeper_session, &sweeper_store, retention_days, shutdown))
        .map_err(|e| NetWatchError::Fatal(format!("spawn sweeper thread: {e}")))?;

    log::info!(
        "recording on {} interface(s) into {}",
        capture_handles.len(),
        config.db_path
    );

    // Block until cancellation.
    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(200));
    }
    log::info!("shutting down");

    // 1-2. Capture threads stop reading and the decode tail drains.
    for handle in capture_handles {
        let _ = handle.join();
    }
    let _ = sweeper_handle.join();

    // 3. Synthetic END/TIMEOUT for every outstanding flow.
    session.flush_all(now_ms());

    // 4. Drop the remaining senders so the writer drains and exits.
    drop(session);
    drop(sink);

    let writer_failure = match writer_done_rx.recv_timeout(DRAIN_DEADLINE) {
        Ok(failure) => {
            let _ = writer_handle.join();
            failure
        }
        Err(_) => {
            // Hard timeout: leave the writer detached rather than block
            // shutdown on it.
            log::warn!("writer did not drain within {DRAIN_DEADLINE:?}");
            None
        }
    };

    // 5. Store closes.
    store.close();

    match writer_failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Per-interface capture loop: read, decode, track; reopen with backoff on
/// transient errors; sample kernel drop counters every 30 s.
fn capture_loop(
    mut capture: AfPacketCapture,
    ring: RingConfig,
    interface: &str,
    session: &SessionManager,
    shutdown: &AtomicBool,
) {
    let mut backoff = BACKOFF_INITIAL;
    let mut last_sample = Instant::now();
    let mut last_totals = CaptureStats::default();

    loop {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }

        let mut need_reopen = false;
        match capture.read_frame() {
            Ok(Some((frame, arrival_ms))) => {
                backoff = BACKOFF_INITIAL;
                match packet::decode(frame) {
                    Ok(Some(view)) => session.handle_packet(interface, &view, arrival_ms),
                    Ok(None) => {}
                    Err(e) => log::debug!(
                        "undecodable frame on {interface}: {e} len={} hex={}",
                        frame.len(),
                        packet::hex_dump(frame)
                    ),
                }
            }
            Ok(None) => {} // read timeout; loop to poll shutdown
            Err(e) => {
                log::warn!("capture error on {interface}: {e}; reopening in {backoff:?}");
                need_reopen = true;
            }
        }

        if need_reopen {
            sleep_with_shutdown(backoff, shutdown);
            backoff = (backoff * 2).min(BACKOFF_MAX);
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            match AfPacketCapture::open(interface, &ring) {
                Ok(reopened) => {
                    capture = reopened;
                    last_totals = CaptureStats::default();
                    log::info!("capture reopened on {interface}");
                }
                Err(e) => log::warn!("reopen of {interface} failed: {e}"),
            }
        }

        if last_sample.elapsed() >= DROP_SAMPLE_INTERVAL {
            last_totals = sample_drops(&mut capture, interface, last_totals);
            last_sample = Instant::now();
        }
    }
}

/// Log kernel drop counters: WARN with the delta and the drop ratio when
/// anything was dropped in the window, INFO totals every sample.
fn sample_drops(
    capture: &mut AfPacketCapture,
    interface: &str,
    last: CaptureStats,
) -> CaptureStats {
    let totals = capture.stats();
    let new_packets = totals.packets.saturating_sub(last.packets);
    let new_drops = totals.drops.saturating_sub(last.drops);

    if new_drops > 0 {
        let rate = new_drops as f64 / (new_drops + new_packets) as f64 * 100.0;
        log::warn!(
            "capture drops interface={interface} drops={new_drops} total_drops={} drop_rate={rate:.2}%",
            totals.drops,
        );
    }
    log::info!(
        "capture stats timeframe=30s interface={interface} total_packets={} total_drops={}",
        totals.packets,
        totals.drops,
    );
    totals
}

/// Writer: drain the event channel into the store. Flushes when the batch
/// reaches [`BATCH_CHUNK_SIZE`] or on the 1 s tick; flushes the remainder
/// exactly once when every sender is gone. Returns the fatal store error
/// that stopped it, if any.
fn writer_loop(
    store: &EventStore,
    events: &Receiver<NetworkEvent>,
    shutdown: &AtomicBool,
) -> Option<NetWatchError> {
    let flush_tick = tick(FLUSH_INTERVAL);
    let mut batch: Vec<NetworkEvent> = Vec::with_capacity(BATCH_CHUNK_SIZE);

    loop {
        select! {
            recv(events) -> msg => match msg {
                Ok(event) => {
                    batch.push(event);
                    if batch.len() >= BATCH_CHUNK_SIZE {
                        if let Some(fatal) = flush_batch(store, &mut batch, shutdown) {
                            return Some(fatal);
                        }
                    }
                }
                Err(_) => {
                    // All senders gone: final flush, exactly once.
                    return flush_batch(store, &mut batch, shutdown);
                }
            },
            recv(flush_tick) -> _ => {
                if let Some(fatal) = flush_batch(store, &mut batch, shutdown) {
                    return Some(fatal);
                }
            }
        }
    }
}

/// Write and clear the batch. A transient failure loses this batch and
/// keeps going; a fatal failure requests process shutdown and is returned.
fn flush_batch(
    store: &EventStore,
    batch: &mut Vec<NetworkEvent>,
    shutdown: &AtomicBool,
) -> Option<NetWatchError> {
    if batch.is_empty() {
        return None;
    }
    let result = store.append_batch(batch);
    let len = batch.len();
    batch.clear();
    match result {
        Ok(_) => None,
        Err(e) if e.is_store_fatal() => {
            log::error!("fatal store failure, stopping writer: {e}");
            shutdown.store(true, Ordering::Relaxed);
            Some(e)
        }
        Err(e) => {
            log::warn!("batch insert failed, {len} events lost: {e}");
            None
        }
    }
}

/// Sweeper: retire idle flows every 15 s; run the caller-driven retention
/// sweep hourly when enabled.
fn sweeper_loop(
    session: &SessionManager,
    store: &EventStore,
    retention_days: u32,
    shutdown: &AtomicBool,
) {
    let sweep_tick = tick(SWEEP_INTERVAL);
    let retention_tick = tick(RETENTION_INTERVAL);

    loop {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        select! {
            recv(sweep_tick) -> _ => {
                session.sweep(now_ms());
                let (tcp, udp) = session.flow_counts();
                log::debug!("flow sweep complete: {tcp} tcp, {udp} udp flows active");
            }
            recv(retention_tick) -> _ => {
                if retention_days > 0 {
                    let cutoff = now_ms() - retention_days as i64 * 86_400_000;
                    if let Err(e) = store.sweep_older_than(cutoff) {
                        log::warn!("retention sweep failed: {e}");
                    }
                }
            }
            default(Duration::from_millis(500)) => {}
        }
    }
}

fn sleep_with_shutdown(duration: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::event_channel;
    use crate::store::EventType;

    fn event_at(ts: i64) -> NetworkEvent {
        NetworkEvent {
            timestamp: ts,
            event_type: EventType::Dns,
            interface: "eth0".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn writer_flushes_remainder_on_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::open(dir.path().join("w.db")).unwrap();
        let (sink, rx) = event_channel(EVENT_CHANNEL_CAPACITY);
        let shutdown = AtomicBool::new(false);

        for i in 0..5 {
            sink.send(event_at(i));
        }
        drop(sink);

        let failure = writer_loop(&store, &rx, &shutdown);
        assert!(failure.is_none());
        assert_eq!(store.stats().unwrap().total_events, 5);
        assert!(!shutdown.load(Ordering::Relaxed));
    }

    #[test]
    fn writer_flushes_full_batches_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::open(dir.path().join("w.db")).unwrap();
        let (sink, rx) = event_channel(2000);
        let shutdown = AtomicBool::new(false);

        for i in 0..(BATCH_CHUNK_SIZE as i64 * 2 + 7) {
            sink.send(event_at(i));
        }
        drop(sink);

        let failure = writer_loop(&store, &rx, &shutdown);
        assert!(failure.is_none());
        assert_eq!(
            store.stats().unwrap().total_events,
            BATCH_CHUNK_SIZE as i64 * 2 + 7
        );
    }

    #[test]
    fn oldest_events_drop_when_channel_overflows() {
        // Channel capacity N, N+K sends: the K oldest are gone and the most
        // recent N survive to be written.
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::open(dir.path().join("w.db")).unwrap();
        let capacity = 100;
        let (sink, rx) = event_channel(capacity);
        let shutdown = AtomicBool::new(false);

        let extra = 30i64;
        for i in 0..(capacity as i64 + extra) {
            sink.send(event_at(i));
        }
        assert_eq!(sink.dropped(), extra as u64);
        drop(sink);

        writer_loop(&store, &rx, &shutdown);

        let persisted = store
            .query(&crate::store::EventFilter {
                limit: Some(1000),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(persisted.len(), capacity);
        let min_ts = persisted.iter().map(|e| e.timestamp).min().unwrap();
        assert_eq!(min_ts, extra); // 0..extra were dropped from the oldest side
    }
}
