use std::time::Duration;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "netwatcher",
    version,
    about = "Passive network traffic recorder with an embedded event store"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the capture pipeline until interrupted
    Start {
        /// Interfaces to monitor (comma list); best-effort detection when omitted
        #[arg(long)]
        interface: Option<String>,

        /// Path to the event database
        #[arg(long, default_value = "netwatcher.db")]
        db: String,

        /// Enable debug logs
        #[arg(long)]
        debug: bool,

        /// Only record these event classes (comma list of tcp,udp,icmp,dns,tls)
        #[arg(long, default_value = "")]
        only: String,

        /// Exclude traffic classes (comma list of multicast,broadcast,linklocal,
        /// bittorrent,mdns,ssdp,metadata,ndp,unreachable)
        #[arg(long, default_value = "")]
        exclude: String,

        /// Exclude traffic touching these ports (comma list)
        #[arg(long = "exclude-ports", default_value = "")]
        exclude_ports: String,

        /// Delete events older than this many days (hourly sweep; 0 disables)
        #[arg(long = "retention-days", default_value_t = 30)]
        retention_days: u32,
    },

    /// Compact the database by merging event pairs
    Compact {
        /// Path to the event database
        #[arg(long, default_value = "netwatcher.db")]
        db: String,

        /// Compact events older than this (e.g. 1h, 24h, 7d)
        #[arg(long = "older-than", default_value = "24h", value_parser = parse_duration_arg)]
        older_than: Duration,

        /// Window for DNS deduplication (0 disables)
        #[arg(long = "dedupe-window", default_value = "5s", value_parser = parse_duration_arg)]
        dedupe_window: Duration,

        /// Also roll old rows into hourly summaries (destructive)
        #[arg(long = "hourly-summary")]
        hourly_summary: bool,

        /// Report what would be compacted without changing anything
        #[arg(long = "dry-run")]
        dry_run: bool,
    },
}

/// Parse durations in the `<n>{ms|s|m|h|d}` grammar; bare `0` disables.
pub fn parse_duration_arg(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let (number, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => return Err(format!("'{s}' is missing a unit (ms, s, m, h, d)")),
    };
    let value: u64 = number
        .parse()
        .map_err(|_| format!("'{s}' is not a valid duration"))?;

    let millis = match unit {
        "ms" => value,
        "s" => value * 1_000,
        "m" => value * 60_000,
        "h" => value * 3_600_000,
        "d" => value * 86_400_000,
        other => return Err(format!("unknown duration unit '{other}' in '{s}'")),
    };
    Ok(Duration::from_millis(millis))
}

/// Split a comma list into trimmed, non-empty items.
pub fn split_comma_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(args)
    }

    #[test]
    fn start_defaults() {
        let cli = parse(&["netwatcher", "start"]).unwrap();
        match cli.command {
            Command::Start {
                interface,
                db,
                debug,
                only,
                exclude,
                exclude_ports,
                retention_days,
            } => {
                assert!(interface.is_none());
                assert_eq!(db, "netwatcher.db");
                assert!(!debug);
                assert!(only.is_empty());
                assert!(exclude.is_empty());
                assert!(exclude_ports.is_empty());
                assert_eq!(retention_days, 30);
            }
            other => panic!("expected start, got {other:?}"),
        }
    }

    #[test]
    fn start_with_filters() {
        let cli = parse(&[
            "netwatcher",
            "start",
            "--interface",
            "eth0,wlan0",
            "--only",
            "tcp,dns",
            "--exclude",
            "multicast,mdns",
            "--exclude-ports",
            "8080,9090",
            "--debug",
        ])
        .unwrap();
        match cli.command {
            Command::Start {
                interface,
                only,
                exclude,
                exclude_ports,
                debug,
                ..
            } => {
                assert_eq!(interface.as_deref(), Some("eth0,wlan0"));
                assert_eq!(only, "tcp,dns");
                assert_eq!(exclude, "multicast,mdns");
                assert_eq!(exclude_ports, "8080,9090");
                assert!(debug);
            }
            other => panic!("expected start, got {other:?}"),
        }
    }

    #[test]
    fn compact_defaults() {
        let cli = parse(&["netwatcher", "compact"]).unwrap();
        match cli.command {
            Command::Compact {
                db,
                older_than,
                dedupe_window,
                hourly_summary,
                dry_run,
            } => {
                assert_eq!(db, "netwatcher.db");
                assert_eq!(older_than, Duration::from_secs(24 * 3600));
                assert_eq!(dedupe_window, Duration::from_secs(5));
                assert!(!hourly_summary);
                assert!(!dry_run);
            }
            other => panic!("expected compact, got {other:?}"),
        }
    }

    #[test]
    fn compact_with_day_durations() {
        let cli = parse(&[
            "netwatcher",
            "compact",
            "--older-than",
            "7d",
            "--dedupe-window",
            "0",
            "--hourly-summary",
            "--dry-run",
        ])
        .unwrap();
        match cli.command {
            Command::Compact {
                older_than,
                dedupe_window,
                hourly_summary,
                dry_run,
                ..
            } => {
                assert_eq!(older_than, Duration::from_secs(7 * 86400));
                assert_eq!(dedupe_window, Duration::ZERO);
                assert!(hourly_summary);
                assert!(dry_run);
            }
            other => panic!("expected compact, got {other:?}"),
        }
    }

    #[test]
    fn duration_grammar() {
        assert_eq!(parse_duration_arg("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration_arg("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration_arg("90m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration_arg("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration_arg("2d").unwrap(), Duration::from_secs(172_800));
        assert_eq!(parse_duration_arg("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn bad_durations_are_rejected() {
        assert!(parse_duration_arg("").is_err());
        assert!(parse_duration_arg("5").is_err());
        assert!(parse_duration_arg("h").is_err());
        assert!(parse_duration_arg("5w").is_err());
        assert!(parse_duration_arg("five-s").is_err());
        assert!(parse(&["netwatcher", "compact", "--older-than", "nope"]).is_err());
    }

    #[test]
    fn comma_list_splitting() {
        assert_eq!(
            split_comma_list(" eth0, wlan0 ,,"),
            vec!["eth0".to_string(), "wlan0".to_string()]
        );
        assert!(split_comma_list("").is_empty());
    }

    #[test]
    fn unknown_subcommand_is_error() {
        assert!(parse(&["netwatcher", "report"]).is_err());
    }
}
