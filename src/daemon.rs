//! `tclockd run` — the forwarding loop.
//!
//! Opens every configured port, brings the ports to LISTENING, and then
//! sits in a single-threaded poll loop feeding ready descriptors through
//! the per-port dispatcher. Optionally appends per-port metrics snapshots
//! to a JSONL log on a fixed interval. SIGINT/SIGTERM drain the pending
//! state and exit cleanly.

use anyhow::Result;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tc_core::{Clock, PortSnapshot};

use crate::config::TcConfig;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_signal(_: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

/// Poll granularity. Short enough that shutdown and the stats interval
/// stay responsive; all real work is fd-driven.
const POLL_TIMEOUT_MS: i32 = 100;

#[derive(Serialize)]
struct LogEntry {
    ts: u64,
    started_at: u64,
    pool_descriptors: usize,
    ports: Vec<PortSnapshot>,
}

pub fn run(config: &TcConfig) -> Result<()> {
    if config.ports.is_empty() {
        anyhow::bail!("no ports configured — run `tclockd init` for an example config");
    }

    let opts: Vec<_> = config.ports.iter().map(|p| p.to_options(config.domain)).collect();
    let mut clock = Clock::open(&opts)?;
    clock.init();

    eprintln!(
        "tclockd — {} port(s), domain {}",
        config.ports.len(),
        config.domain
    );

    RUNNING.store(true, Ordering::SeqCst);
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as *const () as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as *const () as libc::sighandler_t);
    }

    let started_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let stats = config.stats.as_ref().filter(|s| s.enabled);
    let stats_interval = stats.map(|s| Duration::from_secs(s.interval_secs));
    let mut last_stats = Instant::now();

    while RUNNING.load(Ordering::SeqCst) {
        clock.poll(POLL_TIMEOUT_MS)?;

        if let (Some(cfg), Some(interval)) = (stats, stats_interval) {
            if last_stats.elapsed() >= interval {
                last_stats = Instant::now();
                write_snapshot(&cfg.path, &clock, started_at);
            }
        }
    }

    tracing::info!("shutting down");
    clock.cleanup();
    Ok(())
}

fn write_snapshot(path: &str, clock: &Clock, started_at: u64) {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let entry = LogEntry {
        ts,
        started_at,
        pool_descriptors: clock.pool().allocated(),
        ports: clock.snapshots(),
    };
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        if let Ok(line) = serde_json::to_string(&entry) {
            let _ = writeln!(file, "{}", line);
        }
    }
}
