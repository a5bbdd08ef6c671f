//! Background flush of the pending-report queue.
//!
//! A 30 s cooperative loop: correct clock skew once the system clock is
//! trusted (one-shot per process), drain a page of pending reports through
//! the publisher, announce promotions, and, when enabled, advertise the
//! gateway once per calendar day. The worker observes shutdown between
//! ticks and between rows; an in-flight upload completes before the loop
//! exits.

use anyhow::Result;
use chrono::Local;
use log::{debug, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::clock::Clock;
use crate::commands::templates;
use crate::notify::Notifier;
use crate::osm::{Publisher, PublishOutcome};
use crate::radio::{payload_preview, RadioAdapter};
use crate::storage::{Report, Store, StoreResult};

/// Rows attempted per tick. Bounded so one tick cannot monopolize the
/// publisher's rate budget.
const FLUSH_PAGE_SIZE: u32 = 10;

/// Clock offsets below this are jitter, not skew.
const SKEW_THRESHOLD_SECS: i64 = 60;

pub struct FlushWorker {
    store: Arc<Store>,
    publisher: Arc<Publisher>,
    notifier: Arc<Notifier>,
    clock: Arc<Clock>,
    radio: RadioAdapter,
    interval: Duration,
    daily_broadcast: bool,
    dry_run: bool,
}

impl FlushWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        publisher: Arc<Publisher>,
        notifier: Arc<Notifier>,
        clock: Arc<Clock>,
        radio: RadioAdapter,
        interval: Duration,
        daily_broadcast: bool,
        dry_run: bool,
    ) -> Self {
        Self {
            store,
            publisher,
            notifier,
            clock,
            radio,
            interval,
            daily_broadcast,
            dry_run,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("flush worker started (period {:?})", self.interval);
        let row_shutdown = shutdown.clone();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut first_cycle = true;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(&row_shutdown, first_cycle).await {
                        warn!("flush worker tick failed: {}", e);
                    }
                    first_cycle = false;
                    if *row_shutdown.borrow() {
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("flush worker stopped");
    }

    async fn tick(&self, shutdown: &watch::Receiver<bool>, first_cycle: bool) -> Result<()> {
        self.apply_clock_correction()?;

        let page = self.store.pending_page(FLUSH_PAGE_SIZE)?;
        let sent = flush_page(&self.store, &self.clock, &page, shutdown, |lat, lon, text| {
            let publisher = Arc::clone(&self.publisher);
            async move { publisher.publish(lat, lon, &text).await }
        })
        .await?;
        if sent > 0 {
            info!("flush worker: sent {} queued reports", sent);
        }

        self.notifier.announce_sent().await?;

        // Skipped on the very first cycle so a restart cannot re-broadcast.
        if self.daily_broadcast && !first_cycle {
            self.maybe_daily_broadcast().await?;
        }
        Ok(())
    }

    /// One-shot correction of timestamps written before the clock synced.
    /// Boards without an RTC boot with a stale wall clock; once the sync
    /// daemon reports a good clock, pending rows are shifted by the
    /// observed offset. SENT rows are never touched.
    fn apply_clock_correction(&self) -> Result<()> {
        if self.store.time_correction_applied()? {
            return Ok(());
        }
        if !self.clock.is_time_synced() {
            return Ok(());
        }
        let now = self.clock.now_utc();
        if let Some(boot) = self.store.boot_wallclock()? {
            let delta = now - boot;
            if delta.num_seconds().abs() > SKEW_THRESHOLD_SECS {
                let rows = self.store.pending_created_before(now)?;
                let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
                let shifted = self.store.shift_created_at(&ids, delta)?;
                info!(
                    "clock correction: shifted {} pending rows by {} s",
                    shifted,
                    delta.num_seconds()
                );
            } else {
                debug!(
                    "clock correction: offset {} s within tolerance, nothing to shift",
                    delta.num_seconds()
                );
            }
        }
        self.store.set_time_correction_applied(true)?;
        Ok(())
    }

    async fn maybe_daily_broadcast(&self) -> StoreResult<()> {
        let today = Local::now().format("%Y-%m-%d").to_string();
        if self.store.last_broadcast_date()?.as_deref() == Some(today.as_str()) {
            return Ok(());
        }
        let message = templates::daily_broadcast();
        let sent = if self.dry_run {
            info!("[dry-run] broadcast: {}", payload_preview(&message));
            true
        } else {
            self.radio.send_broadcast(&message).await
        };
        if sent {
            self.store.set_last_broadcast_date(&today)?;
            info!("daily broadcast sent for {}", today);
        } else {
            warn!("daily broadcast transmit failed, will retry next tick");
        }
        Ok(())
    }
}

/// Drain one page of pending reports through `publish`, oldest first.
///
/// A transient failure stops the page (the uplink looks down; burning
/// through the rest would only spend the rate budget on more failures). A
/// permanent failure records the tag and moves on. Shutdown is observed
/// between rows.
pub async fn flush_page<F, Fut>(
    store: &Store,
    clock: &Clock,
    page: &[Report],
    shutdown: &watch::Receiver<bool>,
    mut publish: F,
) -> StoreResult<usize>
where
    F: FnMut(f64, f64, String) -> Fut,
    Fut: Future<Output = PublishOutcome>,
{
    let mut sent = 0usize;
    for report in page {
        if *shutdown.borrow() {
            break;
        }
        match publish(report.lat, report.lon, report.text_normalized.clone()).await {
            PublishOutcome::Ok { id, url } => {
                store.mark_sent(&report.queue_id, id, &url, clock.now_utc())?;
                sent += 1;
            }
            PublishOutcome::Transient(tag) => {
                store.record_error(&report.queue_id, &tag)?;
                debug!(
                    "flush: transient failure on {} ({}), stopping page",
                    report.queue_id, tag
                );
                break;
            }
            PublishOutcome::Permanent(tag) => {
                store.record_error(&report.queue_id, &tag)?;
                warn!(
                    "flush: permanent failure on {} ({}), leaving for operator",
                    report.queue_id, tag
                );
            }
        }
    }
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn setup() -> (Arc<Store>, Clock, watch::Receiver<bool>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("worker.db")).unwrap());
        let (_tx, rx) = watch::channel(false);
        (store, Clock::new(), rx, dir)
    }

    #[tokio::test]
    async fn transient_failure_stops_the_page() {
        let (store, clock, shutdown, _dir) = setup();
        let now = Utc::now();
        for i in 0..3 {
            store
                .append("!a", 1.0, 2.0, &format!("r{i}"), &format!("r{i}"), now)
                .unwrap();
        }
        let page = store.pending_page(10).unwrap();
        let mut calls = 0;
        let sent = flush_page(&store, &clock, &page, &shutdown, |_lat, _lon, _text| {
            calls += 1;
            let outcome = if calls == 2 {
                PublishOutcome::Transient("timeout".to_string())
            } else {
                PublishOutcome::Ok {
                    id: calls as i64,
                    url: format!("https://www.openstreetmap.org/note/{calls}"),
                }
            };
            async move { outcome }
        })
        .await
        .unwrap();

        assert_eq!(sent, 1);
        assert_eq!(calls, 2, "third row must not be attempted");
        let remaining = store.pending_page(10).unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn permanent_failure_continues_the_page() {
        let (store, clock, shutdown, _dir) = setup();
        let now = Utc::now();
        for i in 0..3 {
            store
                .append("!a", 1.0, 2.0, &format!("r{i}"), &format!("r{i}"), now)
                .unwrap();
        }
        let page = store.pending_page(10).unwrap();
        let mut calls = 0;
        let sent = flush_page(&store, &clock, &page, &shutdown, |_lat, _lon, _text| {
            calls += 1;
            let outcome = if calls == 1 {
                PublishOutcome::Permanent("http-400".to_string())
            } else {
                PublishOutcome::Ok {
                    id: calls as i64,
                    url: "u".to_string(),
                }
            };
            async move { outcome }
        })
        .await
        .unwrap();

        assert_eq!(sent, 2);
        assert_eq!(calls, 3);
        let remaining = store.pending_page(10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].last_error.as_deref(), Some("http-400"));
    }

    #[tokio::test]
    async fn shutdown_stops_between_rows() {
        let (store, clock, _unused, _dir) = setup();
        let (tx, shutdown) = watch::channel(false);
        let now = Utc::now();
        for i in 0..3 {
            store
                .append("!a", 1.0, 2.0, &format!("r{i}"), &format!("r{i}"), now)
                .unwrap();
        }
        let page = store.pending_page(10).unwrap();
        let mut calls = 0;
        let sent = flush_page(&store, &clock, &page, &shutdown, |_lat, _lon, _text| {
            calls += 1;
            // Signal shutdown while the first publish is "in flight".
            tx.send(true).ok();
            async move {
                PublishOutcome::Ok {
                    id: 1,
                    url: "u".to_string(),
                }
            }
        })
        .await
        .unwrap();

        // The in-flight publish completed and was recorded, then the loop
        // observed the signal.
        assert_eq!(sent, 1);
        assert_eq!(calls, 1);
    }
}
