use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;

use netwatcher::cli::{self, Cli, Command};
use netwatcher::error::NetWatchError;
use netwatcher::store::{now_ms, EventStore};

/// Global shutdown flag, set by signal handlers.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGTERM, signal_handler as libc::sighandler_t);
        libc::signal(libc::SIGINT, signal_handler as libc::sighandler_t);
    }
}

fn exit_code(err: &NetWatchError) -> i32 {
    match err {
        NetWatchError::Config(_)
        | NetWatchError::NoInterface(_)
        | NetWatchError::InsufficientPermission(_) => 1,
        NetWatchError::CaptureDevice(_) | NetWatchError::RingAlloc { .. } => 2,
        NetWatchError::StoreTransient(_) | NetWatchError::StoreFatal(_) => 3,
        _ => 4,
    }
}

fn main() {
    let cli = Cli::parse();

    let debug = matches!(cli.command, Command::Start { debug: true, .. });
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if debug { "debug" } else { "info" }),
    )
    .init();

    match run(cli) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(exit_code(&e));
        }
    }
}

fn run(cli: Cli) -> Result<(), NetWatchError> {
    match cli.command {
        Command::Start {
            interface,
            db,
            debug: _,
            only,
            exclude,
            exclude_ports,
            retention_days,
        } => run_start(
            interface,
            db,
            &only,
            &exclude,
            &exclude_ports,
            retention_days,
        ),
        Command::Compact {
            db,
            older_than,
            dedupe_window,
            hourly_summary,
            dry_run,
        } => run_compact(
            &db,
            older_than.as_millis() as i64,
            dedupe_window.as_millis() as i64,
            hourly_summary,
            dry_run,
        ),
    }
}

#[cfg(target_os = "linux")]
fn run_start(
    interface: Option<String>,
    db: String,
    only: &str,
    exclude: &str,
    exclude_ports: &str,
    retention_days: u32,
) -> Result<(), NetWatchError> {
    use netwatcher::session::filter::FilterPolicy;
    use netwatcher::system::interface as sysiface;
    use netwatcher::watcher::{self, WatcherConfig};

    install_signal_handlers();

    netwatcher::privilege::check_capture_access()?;

    let filters = FilterPolicy::parse(only, exclude, exclude_ports)?;

    let interfaces = match interface {
        Some(list) => {
            let names = cli::split_comma_list(&list);
            if names.is_empty() {
                return Err(NetWatchError::Config("empty interface list".to_string()));
            }
            sysiface::validate_interfaces(&names)?;
            names
        }
        None => {
            log::info!("no interface given, using best-effort detection");
            let names = sysiface::usable_interfaces()?;
            if names.is_empty() {
                return Err(NetWatchError::Config(
                    "no usable network interfaces found".to_string(),
                ));
            }
            names
        }
    };

    log::info!(
        "starting netwatcher version={} interfaces={} db={db} only='{only}' exclude='{exclude}' exclude-ports='{exclude_ports}'",
        env!("CARGO_PKG_VERSION"),
        interfaces.join(","),
    );

    watcher::run(
        WatcherConfig {
            db_path: db,
            interfaces,
            filters,
            ring: Default::default(),
            retention_days,
        },
        &SHUTDOWN_REQUESTED,
    )
}

#[cfg(not(target_os = "linux"))]
fn run_start(
    _interface: Option<String>,
    _db: String,
    _only: &str,
    _exclude: &str,
    _exclude_ports: &str,
    _retention_days: u32,
) -> Result<(), NetWatchError> {
    Err(NetWatchError::Config(
        "packet capture requires Linux AF_PACKET support".to_string(),
    ))
}

fn run_compact(
    db: &str,
    older_than_ms: i64,
    dedupe_window_ms: i64,
    hourly_summary: bool,
    dry_run: bool,
) -> Result<(), NetWatchError> {
    let cutoff_ms = now_ms() - older_than_ms;
    log::info!(
        "compacting db={db} cutoff={cutoff_ms} dedupe_window_ms={dedupe_window_ms} hourly_summary={hourly_summary} dry_run={dry_run}"
    );

    let store = EventStore::open(db)?;

    if dry_run {
        let preview = store.compact_preview(cutoff_ms, dedupe_window_ms, hourly_summary)?;
        log::info!(
            "dry run: tcp pairs ~{}, udp pairs ~{}, dns pairs ~{}",
            preview.tcp_starts.min(preview.tcp_ends),
            preview.udp_starts.min(preview.udp_ends),
            preview.dns_queries.min(preview.dns_responses),
        );
        log::info!(
            "dry run: {} dns duplicates, {} orphaned ends, {} hourly buckets",
            preview.duplicates,
            preview.orphans,
            preview.hourly_buckets,
        );
        log::info!("no changes made (dry run)");
        return Ok(());
    }

    let stats = store.compact(cutoff_ms, dedupe_window_ms, hourly_summary)?;
    log::info!(
        "compaction complete: tcp_pairs={} udp_pairs={} dns_pairs={} duplicates_removed={} orphans_removed={} hourly_summaries={} removed={} created={}",
        stats.tcp_pairs,
        stats.udp_pairs,
        stats.dns_pairs,
        stats.duplicates_removed,
        stats.orphans_removed,
        stats.hourly_summaries,
        stats.events_removed,
        stats.events_created,
    );
    log::info!(
        "bytes remaining: total={} tcp={} udp={}",
        stats.total_bytes,
        stats.tcp_bytes,
        stats.udp_bytes,
    );
    store.close();
    Ok(())
}
