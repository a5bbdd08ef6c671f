//! Directed acknowledgements, anti-spam budgets, and promotion announcements.
//!
//! Every reply the gateway owes a mesh node funnels through the
//! [`Notifier`] so one place enforces the anti-spam budget: at most three
//! directed acks per origin per rolling 60 s window. Beyond that, pending
//! announcements collapse into a single summary per window and the rest are
//! dropped; the mesh is a shared, slow medium and a chatty gateway would
//! crowd out the very reports it exists for.
//!
//! Transmission is best-effort. A failed transmit is never retried: for
//! promotions the row is marked announced anyway, so one report produces at
//! most one announcement attempt for its lifetime.

use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::commands::templates;
use crate::radio::{payload_preview, RadioAdapter};
use crate::storage::{Store, StoreResult};

const ACK_WINDOW: Duration = Duration::from_secs(60);
const ACK_MAX_PER_WINDOW: usize = 3;

const REPORT_WINDOW: Duration = Duration::from_secs(60);
const REPORT_MAX_PER_WINDOW: usize = 5;

/// Every 5th successful report per origin repeats the privacy reminder.
const PRIVACY_SUFFIX_EVERY: u64 = 5;

/// Per-origin inbound throttle for report commands, checked before the
/// policy engine runs.
pub struct ReportRateLimiter {
    window: Duration,
    max_per_window: usize,
    recent: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl ReportRateLimiter {
    pub fn new() -> Self {
        Self::with_limits(REPORT_WINDOW, REPORT_MAX_PER_WINDOW)
    }

    pub fn with_limits(window: Duration, max_per_window: usize) -> Self {
        Self {
            window,
            max_per_window,
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// Whether another report from `origin` is admitted right now.
    /// Admitted reports are counted; rejected ones are not.
    pub fn allow(&self, origin: &str) -> bool {
        let mut map = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let times = map.entry(origin.to_string()).or_default();
        while let Some(front) = times.front() {
            if now.duration_since(*front) >= self.window {
                times.pop_front();
            } else {
                break;
            }
        }
        if times.len() >= self.max_per_window {
            return false;
        }
        times.push_back(now);
        true
    }
}

impl Default for ReportRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct AckBudget {
    sends: VecDeque<Instant>,
    suppressed: usize,
    summary_at: Option<Instant>,
}

enum Verdict {
    Send,
    Summary(usize),
    Drop,
}

pub struct Notifier {
    radio: RadioAdapter,
    store: Arc<Store>,
    dry_run: bool,
    window: Duration,
    max_per_window: usize,
    budgets: Mutex<HashMap<String, AckBudget>>,
}

impl Notifier {
    pub fn new(radio: RadioAdapter, store: Arc<Store>, dry_run: bool) -> Self {
        Self::with_budget(radio, store, dry_run, ACK_WINDOW, ACK_MAX_PER_WINDOW)
    }

    pub fn with_budget(
        radio: RadioAdapter,
        store: Arc<Store>,
        dry_run: bool,
        window: Duration,
        max_per_window: usize,
    ) -> Self {
        Self {
            radio,
            store,
            dry_run,
            window,
            max_per_window,
            budgets: Mutex::new(HashMap::new()),
        }
    }

    /// Acceptance ack when the report could not be sent right away.
    pub async fn ack_queued(&self, origin: &str, queue_id: &str) -> bool {
        let text = with_privacy(templates::ack_queued(queue_id));
        self.send_directed(origin, text).await
    }

    /// Same-tick success ack, replacing the queued ack entirely.
    pub async fn ack_success(
        &self,
        origin: &str,
        upstream_id: i64,
        url: &str,
        location: Option<&str>,
    ) -> bool {
        let mut text = templates::ack_success(upstream_id, url, location);
        if self.privacy_due(origin) {
            text = with_privacy(text);
        }
        self.send_directed(origin, text).await
    }

    pub async fn ack_duplicate(&self, origin: &str) -> bool {
        self.send_directed(origin, with_privacy(templates::duplicate()))
            .await
    }

    /// Category-specific rejection (missing text, stale GPS, ...).
    pub async fn ack_reject(&self, origin: &str, message: String) -> bool {
        self.send_directed(origin, with_privacy(message)).await
    }

    /// Reply to an informational command (#osmhelp, #osmlist, ...).
    pub async fn send_command_response(&self, origin: &str, message: String) -> bool {
        self.send_directed(origin, message).await
    }

    /// Announce queue promotions: every SENT row not yet acknowledged gets
    /// one `Q -> #id` message. The row is marked announced whether or not
    /// the transmit succeeded, so announcements can never repeat.
    pub async fn announce_sent(&self) -> StoreResult<usize> {
        let due = self.store.unannounced_sent()?;
        let mut announced = 0usize;
        for report in &due {
            let (Some(upstream_id), Some(url)) = (report.upstream_id, report.upstream_url.as_deref())
            else {
                // Cannot happen per the store invariant, but a malformed row
                // must not wedge the announcement loop.
                warn!("notify: sent row {} lacks upstream identity", report.queue_id);
                self.store.mark_announced(&report.queue_id)?;
                continue;
            };
            let text = templates::promoted(&report.queue_id, upstream_id, url);
            let delivered = self.send_directed(&report.origin, text).await;
            if !delivered {
                debug!(
                    "notify: promotion for {} not delivered, will not retry",
                    report.queue_id
                );
            }
            self.store.mark_announced(&report.queue_id)?;
            announced += 1;
        }
        Ok(announced)
    }

    /// Whether this origin's success ack should carry the privacy reminder.
    fn privacy_due(&self, origin: &str) -> bool {
        match self.store.sent_count(origin) {
            Ok(count) => count > 0 && count % PRIVACY_SUFFIX_EVERY == 0,
            Err(e) => {
                warn!("notify: sent_count failed for {}: {}", origin, e);
                false
            }
        }
    }

    async fn send_directed(&self, origin: &str, text: String) -> bool {
        match self.consume_budget(origin) {
            Verdict::Send => self.transmit(origin, text).await,
            Verdict::Summary(suppressed) => {
                info!(
                    "notify: ack budget exhausted for {}, collapsing {} into summary",
                    origin, suppressed
                );
                self.transmit(origin, templates::flush_summary(suppressed))
                    .await
            }
            Verdict::Drop => {
                debug!("notify: ack budget exhausted for {}, dropping", origin);
                false
            }
        }
    }

    fn consume_budget(&self, origin: &str) -> Verdict {
        let mut budgets = self.budgets.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let budget = budgets.entry(origin.to_string()).or_default();
        while let Some(front) = budget.sends.front() {
            if now.duration_since(*front) >= self.window {
                budget.sends.pop_front();
            } else {
                break;
            }
        }
        if budget.sends.len() < self.max_per_window {
            budget.sends.push_back(now);
            budget.suppressed = 0;
            return Verdict::Send;
        }
        budget.suppressed += 1;
        let summary_due = match budget.summary_at {
            Some(at) => now.duration_since(at) >= self.window,
            None => true,
        };
        if summary_due {
            budget.summary_at = Some(now);
            Verdict::Summary(budget.suppressed)
        } else {
            Verdict::Drop
        }
    }

    async fn transmit(&self, origin: &str, text: String) -> bool {
        if self.dry_run {
            info!("[dry-run] DM to {}: {}", origin, payload_preview(&text));
            return true;
        }
        self.radio.send_direct(origin, &text).await
    }
}

fn with_privacy(text: String) -> String {
    format!("{}\n{}", text, templates::PRIVACY_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::{ModemReader, ModemSender, ModemTransport, RadioAdapter, RadioConfig};
    use chrono::Utc;
    use tempfile::tempdir;

    /// Transport that never connects; fine for dry-run notifier tests.
    struct DeadTransport;
    impl ModemTransport for DeadTransport {
        fn connect(
            &self,
        ) -> anyhow::Result<(Box<dyn ModemReader>, Box<dyn ModemSender>)> {
            Err(anyhow::anyhow!("no modem in tests"))
        }
    }

    fn build_notifier(window: Duration, max: usize) -> (Notifier, Arc<Store>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("notify.db")).unwrap());
        let (radio, _rx) = RadioAdapter::new(Box::new(DeadTransport), RadioConfig::default());
        let notifier = Notifier::with_budget(radio, Arc::clone(&store), true, window, max);
        (notifier, store, dir)
    }

    #[tokio::test]
    async fn budget_allows_three_then_collapses() {
        let (notifier, _store, _dir) = build_notifier(Duration::from_secs(60), 3);
        for _ in 0..3 {
            assert!(notifier.ack_duplicate("!a").await);
        }
        // Fourth becomes the single summary for this window.
        assert!(notifier.ack_duplicate("!a").await);
        // Fifth and later are dropped outright.
        assert!(!notifier.ack_duplicate("!a").await);
        assert!(!notifier.ack_duplicate("!a").await);
        // A different origin has its own budget.
        assert!(notifier.ack_duplicate("!b").await);
    }

    #[tokio::test]
    async fn budget_window_slides() {
        let (notifier, _store, _dir) = build_notifier(Duration::from_millis(50), 1);
        assert!(notifier.ack_duplicate("!a").await);
        // Summary takes the overflow slot.
        assert!(notifier.ack_duplicate("!a").await);
        assert!(!notifier.ack_duplicate("!a").await);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(notifier.ack_duplicate("!a").await);
    }

    #[tokio::test]
    async fn announce_marks_rows_even_without_delivery() {
        let (notifier, store, _dir) = build_notifier(Duration::from_secs(60), 3);
        let now = Utc::now();
        let qid = store.append("!a", 1.0, 2.0, "t", "t", now).unwrap();
        store
            .mark_sent(&qid, 321, "https://www.openstreetmap.org/note/321", now)
            .unwrap();
        let announced = notifier.announce_sent().await.unwrap();
        assert_eq!(announced, 1);
        assert!(store.get_by_queue_id(&qid).unwrap().unwrap().notified_sent);
        // Second pass finds nothing.
        assert_eq!(notifier.announce_sent().await.unwrap(), 0);
    }

    #[test]
    fn report_rate_limiter_caps_per_window() {
        let limiter = ReportRateLimiter::with_limits(Duration::from_secs(60), 5);
        for _ in 0..5 {
            assert!(limiter.allow("!a"));
        }
        assert!(!limiter.allow("!a"));
        assert!(limiter.allow("!b"));
    }

    #[test]
    fn report_rate_limiter_window_expires() {
        let limiter = ReportRateLimiter::with_limits(Duration::from_millis(30), 1);
        assert!(limiter.allow("!a"));
        assert!(!limiter.allow("!a"));
        std::thread::sleep(Duration::from_millis(40));
        assert!(limiter.allow("!a"));
    }
}
