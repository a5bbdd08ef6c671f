//! Wall-clock and monotonic time, plus the NTP-sync predicate.
//!
//! The gateway often boots with a wrong wall clock (no RTC on the board), so
//! pending-report timestamps are corrected once the clock is known good. The
//! sync predicate asks `timedatectl`; on platforms without it, the first
//! successful upstream HTTPS round-trip counts as proof of a sane clock
//! (the publisher calls [`Clock::mark_synced`]).
//!
//! No other component consults the OS for time directly.

use chrono::{DateTime, Utc};
use log::debug;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

pub struct Clock {
    upstream_ok: AtomicBool,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            upstream_ok: AtomicBool::new(false),
        }
    }

    pub fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    pub fn now_monotonic(&self) -> Instant {
        Instant::now()
    }

    /// Record that an upstream HTTPS round-trip succeeded. Used as the sync
    /// signal on platforms without a time-sync daemon.
    pub fn mark_synced(&self) {
        if !self.upstream_ok.swap(true, Ordering::Relaxed) {
            debug!("clock: upstream round-trip observed, clock considered sane");
        }
    }

    /// Whether the system clock can be trusted. Prefers the OS time-sync
    /// daemon's verdict; falls back to the upstream round-trip flag when the
    /// daemon is unavailable.
    pub fn is_time_synced(&self) -> bool {
        match timedatectl_synchronized() {
            Some(v) => v,
            None => self.upstream_ok.load(Ordering::Relaxed),
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Scrape `timedatectl` for the "System clock synchronized" line.
/// Returns None when the command cannot be run (non-systemd platform).
fn timedatectl_synchronized() -> Option<bool> {
    let output = Command::new("timedatectl").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    for line in stdout.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("System clock synchronized:") {
            return Some(rest.trim().eq_ignore_ascii_case("yes"));
        }
    }
    None
}
