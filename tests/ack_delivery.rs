//! Acknowledgement delivery over the radio: templates on the wire, the
//! anti-spam budget, the privacy-suffix cadence, and the no-retry rule for
//! promotions while the link is down.

mod common;

use chrono::Utc;
use common::{frames_snapshot, wait_connected, RadioGuard, ScriptedTransport};
use meshnotes::notify::Notifier;
use meshnotes::radio::{RadioAdapter, RadioConfig};
use meshnotes::storage::Store;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn fast_radio_config() -> RadioConfig {
    RadioConfig {
        frame_gap: Duration::from_millis(10),
        mtu: 200,
        reconnect_max: Duration::from_secs(1),
    }
}

/// Keep the returned event sender alive for the duration of the test; the
/// scripted reader treats a dropped sender as a pulled cable.
async fn connected_setup() -> (
    Notifier,
    Arc<Store>,
    common::Frames,
    RadioGuard,
    std::sync::mpsc::Sender<meshnotes::radio::ModemEvent>,
    tempfile::TempDir,
) {
    let dir = tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path().join("ack.db")).unwrap());
    let (transport, events, frames) = ScriptedTransport::new();
    let (radio, _packets) = RadioAdapter::new(transport, fast_radio_config());
    let guard = RadioGuard::start(&radio);
    wait_connected(&radio).await;
    let notifier = Notifier::new(radio, Arc::clone(&store), false);
    (notifier, store, frames, guard, events, dir)
}

#[tokio::test]
async fn queued_ack_carries_queue_id_and_privacy_suffix() {
    let (notifier, _store, frames, _guard, _events, _dir) = connected_setup().await;

    assert!(notifier.ack_queued("!a1b2", "Q-0001").await);

    let sent = frames_snapshot(&frames);
    assert_eq!(sent.len(), 1);
    let (dest, payload) = &sent[0];
    assert_eq!(dest.as_deref(), Some("!a1b2"));
    assert!(payload.contains("Q-0001"));
    assert!(payload.contains("Do not send personal data"));
}

#[tokio::test]
async fn success_ack_suffix_appears_every_fifth_sent_report() {
    let (notifier, store, frames, _guard, _events, _dir) = connected_setup().await;
    let now = Utc::now();

    // Four sent reports: counts 1-4, no suffix due.
    for i in 1..=4 {
        let qid = store
            .append("!a", 1.0, 2.0, &format!("r{i}"), &format!("r{i}"), now)
            .unwrap();
        store.mark_sent(&qid, i, "u", now).unwrap();
    }
    assert!(notifier.ack_success("!a", 4, "https://osm/4", None).await);

    // Fifth sent report: the reminder is due again.
    let qid = store.append("!a", 1.0, 2.0, "r5", "r5", now).unwrap();
    store.mark_sent(&qid, 5, "u", now).unwrap();
    assert!(notifier.ack_success("!a", 5, "https://osm/5", None).await);

    let sent = frames_snapshot(&frames);
    assert_eq!(sent.len(), 2);
    assert!(!sent[0].1.contains("Do not send personal data"));
    assert!(sent[1].1.contains("Do not send personal data"));
}

#[tokio::test]
async fn ack_budget_collapses_into_single_summary() {
    let (notifier, _store, frames, _guard, _events, _dir) = connected_setup().await;

    // Three acks pass, the fourth becomes the summary, later ones drop.
    for _ in 0..6 {
        notifier.ack_duplicate("!chatty").await;
    }

    let sent = frames_snapshot(&frames);
    assert_eq!(sent.len(), 4);
    assert!(sent[3].1.contains("#osmlist"), "summary points at #osmlist");
    // Another origin is unaffected.
    notifier.ack_duplicate("!quiet").await;
    assert_eq!(frames_snapshot(&frames).len(), 5);
}

#[tokio::test]
async fn promotion_announcement_on_flushed_report() {
    let (notifier, store, frames, _guard, _events, _dir) = connected_setup().await;
    let now = Utc::now();

    let qid = store.append("!a", 1.0, 2.0, "t", "t", now).unwrap();
    store
        .mark_sent(&qid, 654, "https://www.openstreetmap.org/note/654", now)
        .unwrap();
    assert_eq!(notifier.announce_sent().await.unwrap(), 1);

    let sent = frames_snapshot(&frames);
    assert_eq!(sent.len(), 1);
    assert!(sent[0].1.contains("Q-0001"));
    assert!(sent[0].1.contains("#654"));
    assert!(store.get_by_queue_id(&qid).unwrap().unwrap().notified_sent);
}

#[tokio::test]
async fn promotion_while_disconnected_is_marked_and_never_retried() {
    // No RadioGuard::start here: the adapter never connects, so the
    // directed transmit fails exactly like a dead serial link.
    let dir = tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path().join("ack.db")).unwrap());
    let (transport, _events, frames) = ScriptedTransport::new();
    let (radio, _packets) = RadioAdapter::new(transport, fast_radio_config());
    let notifier = Notifier::new(radio, Arc::clone(&store), false);
    let now = Utc::now();

    let qid = store.append("!a", 1.0, 2.0, "t", "t", now).unwrap();
    store.mark_sent(&qid, 99, "u", now).unwrap();
    assert_eq!(notifier.announce_sent().await.unwrap(), 1);

    // Nothing reached the wire, but the row is acknowledged forever.
    assert!(frames_snapshot(&frames).is_empty());
    assert!(store.get_by_queue_id(&qid).unwrap().unwrap().notified_sent);
    assert_eq!(notifier.announce_sent().await.unwrap(), 0);
}

#[tokio::test]
async fn long_ack_is_chunked_with_all_bytes_delivered() {
    let (notifier, _store, frames, _guard, _events, _dir) = connected_setup().await;

    let long_reason = "x".repeat(450);
    assert!(notifier.ack_reject("!a", long_reason.clone()).await);

    let sent = frames_snapshot(&frames);
    assert!(sent.len() >= 3, "450+ bytes must span several 200-byte frames");
    let reassembled: String = sent.iter().map(|(_, p)| p.as_str()).collect();
    assert!(reassembled.contains(&long_reason));
    assert!(sent.iter().all(|(_, p)| p.len() <= 200));
}
