//! Informational command replies on the wire: #osmhelp, #osmcount,
//! #osmlist, #osmqueue, #osmnodes. These handlers are read-only; the store
//! is seeded directly where counters matter.

mod common;

use chrono::Utc;
use common::{frames_snapshot, test_config, wait_connected, RadioGuard, ScriptedTransport};
use meshnotes::gateway::Gateway;
use meshnotes::radio::{RadioConfig, RadioPacket};
use std::time::Duration;
use tempfile::tempdir;

fn fast_config() -> RadioConfig {
    RadioConfig {
        frame_gap: Duration::from_millis(10),
        mtu: 500,
        reconnect_max: Duration::from_secs(1),
    }
}

/// The returned event sender must stay alive for the whole test; the
/// scripted reader treats a dropped sender as a pulled cable.
async fn connected_gateway(
    dir: &std::path::Path,
) -> (
    Gateway,
    common::Frames,
    RadioGuard,
    std::sync::mpsc::Sender<meshnotes::radio::ModemEvent>,
) {
    let (transport, events, frames) = ScriptedTransport::new();
    // dry_run=false so replies actually hit the (scripted) radio; none of
    // the informational handlers touch the upstream API.
    let mut config = test_config(dir, false);
    config.serial_port = "scripted".to_string();
    let gateway = Gateway::with_transport(config, transport, fast_config()).unwrap();
    let guard = RadioGuard::start(gateway.radio());
    wait_connected(gateway.radio()).await;
    (gateway, frames, guard, events)
}

fn text(origin: &str, body: &str) -> RadioPacket {
    RadioPacket::Text {
        origin: origin.to_string(),
        text: body.to_string(),
        received_at: Utc::now(),
    }
}

#[tokio::test]
async fn help_reply_lists_the_report_command() {
    let dir = tempdir().unwrap();
    let (mut gateway, frames, _guard, _events) = connected_gateway(dir.path()).await;

    gateway.handle_packet(text("!a", "#osmhelp")).await;

    let sent = frames_snapshot(&frames);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.as_deref(), Some("!a"));
    assert!(sent[0].1.contains("#osmnote"));
}

#[tokio::test]
async fn count_reflects_store_contents() {
    let dir = tempdir().unwrap();
    let (mut gateway, frames, _guard, _events) = connected_gateway(dir.path()).await;

    let now = Utc::now();
    gateway
        .store()
        .append("!a", 1.0, 2.0, "one", "one", now)
        .unwrap();
    gateway
        .store()
        .append("!a", 1.0, 2.0, "two", "two", now)
        .unwrap();
    gateway
        .store()
        .append("!other", 1.0, 2.0, "three", "three", now)
        .unwrap();

    gateway.handle_packet(text("!a", "#osmcount")).await;

    let sent = frames_snapshot(&frames);
    assert_eq!(sent.len(), 1);
    assert!(sent[0].1.contains("Total: 2"));
}

#[tokio::test]
async fn queue_distinguishes_total_and_own() {
    let dir = tempdir().unwrap();
    let (mut gateway, frames, _guard, _events) = connected_gateway(dir.path()).await;

    let now = Utc::now();
    gateway
        .store()
        .append("!a", 1.0, 2.0, "mine", "mine", now)
        .unwrap();
    let other = gateway
        .store()
        .append("!b", 1.0, 2.0, "theirs", "theirs", now)
        .unwrap();
    gateway.store().mark_sent(&other, 1, "u", now).unwrap();

    gateway.handle_packet(text("!a", "#osmqueue")).await;

    let sent = frames_snapshot(&frames);
    assert_eq!(sent.len(), 1);
    assert!(sent[0].1.contains("Total: 1"));
    assert!(sent[0].1.contains("Yours: 1"));
}

#[tokio::test]
async fn list_shows_queue_ids_until_sent() {
    let dir = tempdir().unwrap();
    let (mut gateway, frames, _guard, _events) = connected_gateway(dir.path()).await;

    let now = Utc::now();
    let pending = gateway
        .store()
        .append("!a", 1.0, 2.0, "first report", "first report", now)
        .unwrap();
    let sent = gateway
        .store()
        .append("!a", 1.0, 2.0, "second report", "second report", now)
        .unwrap();
    gateway
        .store()
        .mark_sent(&sent, 88, "https://www.openstreetmap.org/note/88", now)
        .unwrap();

    gateway.handle_packet(text("!a", "#osmlist")).await;

    let sent_frames = frames_snapshot(&frames);
    assert_eq!(sent_frames.len(), 1);
    let body = &sent_frames[0].1;
    assert!(body.contains(&format!("[{pending}]")));
    assert!(body.contains("https://www.openstreetmap.org/note/88"));
}

#[tokio::test]
async fn list_on_empty_store_says_so() {
    let dir = tempdir().unwrap();
    let (mut gateway, frames, _guard, _events) = connected_gateway(dir.path()).await;

    gateway.handle_packet(text("!a", "#osmlist 7")).await;

    let sent = frames_snapshot(&frames);
    assert_eq!(sent.len(), 1);
    assert!(sent[0].1.contains("No notes registered"));
}

#[tokio::test]
async fn nodes_lists_recently_heard_origins() {
    let dir = tempdir().unwrap();
    let (mut gateway, frames, _guard, _events) = connected_gateway(dir.path()).await;

    gateway
        .handle_packet(RadioPacket::Position {
            origin: "!n1".to_string(),
            lat: 4.6,
            lon: -74.0,
            received_at: Utc::now(),
        })
        .await;
    gateway
        .handle_packet(RadioPacket::Position {
            origin: "!n2".to_string(),
            lat: 4.7,
            lon: -74.1,
            received_at: Utc::now(),
        })
        .await;

    gateway.handle_packet(text("!a", "#osmnodes")).await;

    let sent = frames_snapshot(&frames);
    assert_eq!(sent.len(), 1);
    assert!(sent[0].1.contains("!n1"));
    assert!(sent[0].1.contains("!n2"));
}
