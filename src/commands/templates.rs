//! Response template set.
//!
//! Every user-facing message the gateway transmits lives here so wording is
//! reviewable in one place. The privacy reminder is appended by the notifier
//! (success acks only carry it every 5th sent report per origin).

/// Privacy reminder appended to user-facing acknowledgements.
pub const PRIVACY_SUFFIX: &str = "⚠️ Do not send personal data or medical emergencies.";

pub fn missing_text() -> String {
    "❌ Missing report text.\nUse: #osmnote <your message>".to_string()
}

pub fn too_long(max_chars: usize) -> String {
    format!("❌ Message too long (max {max_chars} characters).\nShorten it and resend.")
}

pub fn reject_no_gps() -> String {
    "❌ Report received, but there is no recent GPS fix for your device.\n\
     Keep it outdoors for 30–60 s and resend."
        .to_string()
}

pub fn reject_stale_gps(max_age_secs: u64) -> String {
    format!(
        "❌ Report received, but your last position is older than {max_age_secs} s.\n\
         Wait for a GPS update and resend."
    )
}

pub fn reject_invalid_coords() -> String {
    "❌ The GPS coordinates received are invalid.\nCheck that GPS is working and resend."
        .to_string()
}

pub fn rate_limited() -> String {
    "⏳ Too many reports in a short time. Wait a minute and resend.".to_string()
}

pub fn duplicate() -> String {
    "✅ Report received (already registered).".to_string()
}

pub fn ack_success(upstream_id: i64, url: &str, location: Option<&str>) -> String {
    let mut msg = format!("✅ Report received, note created on OSM.\n📝 Note: #{upstream_id}\n{url}");
    if let Some(place) = location {
        msg.push_str(&format!("\n📍 {place}"));
    }
    msg
}

pub fn ack_queued(queue_id: &str) -> String {
    format!(
        "✅ Report received. Queued until the Internet link is back.\n📦 Queued: {queue_id}"
    )
}

pub fn promoted(queue_id: &str, upstream_id: i64, url: &str) -> String {
    format!("✅ Sent from queue: {queue_id} → OSM note #{upstream_id}\n{url}")
}

pub fn flush_summary(count: usize) -> String {
    format!("📦 {count} queued reports were sent. Use #osmlist to see them.")
}

pub fn help() -> String {
    "ℹ️ To create a mapping note send:\n\
     #osmnote <your message>\n\n\
     Other commands:\n\
     #osmstatus  gateway + queue state\n\
     #osmcount   your note counters\n\
     #osmlist [n] your latest notes\n\
     #osmqueue   queue sizes\n\
     #osmnodes   recently heard devices\n\n\
     Keep your device outdoors so it has a fresh GPS fix."
        .to_string()
}

pub fn status(internet_ok: bool, total_queue: u64, node_queue: u64) -> String {
    format!(
        "ℹ️ Gateway active\nInternet: {}\nTotal queue: {}\nYour queue: {}",
        if internet_ok { "✅ OK" } else { "❌ DOWN" },
        total_queue,
        node_queue
    )
}

pub fn count(today: u64, total: u64) -> String {
    format!("📊 Notes created:\nToday: {today}\nTotal: {total}")
}

pub fn queue(total: u64, node_queue: u64) -> String {
    format!("📦 Queue:\nTotal: {total}\nYours: {node_queue}")
}

pub fn list_empty() -> String {
    "📝 No notes registered.".to_string()
}

pub fn nodes_empty() -> String {
    "📡 No devices heard yet.".to_string()
}

pub fn daily_broadcast() -> String {
    "ℹ️ OSM notes gateway active.\nUse:\n#osmnote <message>\n#osmhelp".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_ack_carries_id_and_url() {
        let msg = ack_success(12345, "https://www.openstreetmap.org/note/12345", None);
        assert!(msg.contains("#12345"));
        assert!(msg.contains("https://www.openstreetmap.org/note/12345"));
        assert!(!msg.contains("📍"));
    }

    #[test]
    fn success_ack_with_location_line() {
        let msg = ack_success(1, "u", Some("Suba, Bogotá, Colombia"));
        assert!(msg.contains("📍 Suba, Bogotá, Colombia"));
    }

    #[test]
    fn queued_ack_carries_queue_id() {
        assert!(ack_queued("Q-0001").contains("Q-0001"));
    }

    #[test]
    fn promoted_carries_both_identities() {
        let msg = promoted("Q-0003", 777, "https://www.openstreetmap.org/note/777");
        assert!(msg.contains("Q-0003"));
        assert!(msg.contains("#777"));
    }
}
