//! # Upstream Publisher - OSM Notes API Client
//!
//! Rate-limited HTTPS client creating notes on the public OpenStreetMap
//! notes API. One note per accepted report; an attribution line in the
//! configured language is appended to the note text.
//!
//! Failures are classified for the store-and-forward queue: timeouts,
//! connection errors, HTTP 5xx and 429 are transient (the row stays pending
//! and is retried on the next flush tick); other 4xx are permanent (the row
//! stays pending for operator inspection, but retrying cannot help).
//!
//! A global minimum spacing between uploads (default 3 s) is enforced here,
//! under the publisher's own lock, so neither the immediate-send path nor
//! the flush worker needs to cooperate.

pub mod geocode;

use anyhow::Result;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::config::Config;
use crate::radio::payload_preview;

pub const OSM_API_URL: &str = "https://api.openstreetmap.org/api/0.6/notes.json";
pub const OSM_NOTE_URL_BASE: &str = "https://www.openstreetmap.org/note";

/// Outcome of one publish attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    Ok { id: i64, url: String },
    Transient(String),
    Permanent(String),
}

#[derive(Serialize)]
struct NotePayload {
    lat: f64,
    lon: f64,
    text: String,
}

#[derive(Deserialize)]
struct NoteResponse {
    properties: NoteProperties,
}

#[derive(Deserialize)]
struct NoteProperties {
    id: i64,
}

pub struct Publisher {
    client: reqwest::Client,
    api_url: String,
    rate_limit: Duration,
    last_send: tokio::sync::Mutex<Option<Instant>>,
    dry_run: bool,
    attribution: String,
    clock: Arc<Clock>,
}

impl Publisher {
    pub fn new(config: &Config, clock: Arc<Clock>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(concat!("meshnotes/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            api_url: OSM_API_URL.to_string(),
            rate_limit: Duration::from_secs(config.osm_rate_limit_secs),
            last_send: tokio::sync::Mutex::new(None),
            dry_run: config.dry_run,
            attribution: attribution_line(&config.language),
            clock,
        })
    }

    /// Create one note. Never returns an error: every failure mode maps onto
    /// a [`PublishOutcome`] the caller can act on.
    pub async fn publish(&self, lat: f64, lon: f64, text: &str) -> PublishOutcome {
        let body = format!("{}\n\n{}", text, self.attribution);

        if self.dry_run {
            let id = synthetic_note_id(&body);
            info!(
                "[dry-run] would create note at ({:.5}, {:.5}): {}",
                lat,
                lon,
                payload_preview(text)
            );
            return PublishOutcome::Ok {
                id,
                url: format!("{OSM_NOTE_URL_BASE}/{id}"),
            };
        }

        // Hold the pacing lock through the request: uploads are serialized
        // globally, never merely spaced per caller.
        let mut last_send = self.last_send.lock().await;
        if let Some(prev) = *last_send {
            let since = prev.elapsed();
            if since < self.rate_limit {
                let wait = self.rate_limit - since;
                debug!("publisher: rate limiting, sleeping {:?}", wait);
                tokio::time::sleep(wait).await;
            }
        }

        info!(
            "publisher: creating note at ({:.5}, {:.5}): {}",
            lat,
            lon,
            payload_preview(text)
        );
        let result = self
            .client
            .post(&self.api_url)
            .json(&NotePayload { lat, lon, text: body })
            .send()
            .await;
        *last_send = Some(Instant::now());
        drop(last_send);

        let response = match result {
            Ok(resp) => resp,
            Err(e) => {
                let tag = if e.is_timeout() {
                    "timeout"
                } else if e.is_connect() {
                    "connect"
                } else {
                    "request"
                };
                warn!("publisher: note upload failed ({}): {}", tag, e);
                return PublishOutcome::Transient(tag.to_string());
            }
        };

        let code = response.status().as_u16();
        match status_class(code) {
            StatusClass::Success => match response.json::<NoteResponse>().await {
                Ok(note) => {
                    let id = note.properties.id;
                    let url = format!("{OSM_NOTE_URL_BASE}/{id}");
                    info!("publisher: note created #{} - {}", id, url);
                    self.clock.mark_synced();
                    PublishOutcome::Ok { id, url }
                }
                Err(e) => {
                    warn!("publisher: unparseable success response: {}", e);
                    PublishOutcome::Transient("bad-response".to_string())
                }
            },
            StatusClass::Transient => {
                warn!("publisher: upstream answered {}", code);
                PublishOutcome::Transient(format!("http-{code}"))
            }
            StatusClass::Permanent => {
                warn!("publisher: upstream rejected note with {}", code);
                PublishOutcome::Permanent(format!("http-{code}"))
            }
        }
    }

    /// Cheap reachability probe for `#osmstatus`. Any HTTP answer counts;
    /// only transport-level failure means offline.
    pub async fn probe(&self) -> bool {
        if self.dry_run {
            return true;
        }
        self.client
            .head("https://api.openstreetmap.org/")
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusClass {
    Success,
    Transient,
    Permanent,
}

fn status_class(code: u16) -> StatusClass {
    match code {
        200..=299 => StatusClass::Success,
        429 => StatusClass::Transient,
        500..=599 => StatusClass::Transient,
        400..=499 => StatusClass::Permanent,
        _ => StatusClass::Transient,
    }
}

fn attribution_line(language: &str) -> String {
    match language {
        "es" => "Enviado desde la red de radio mesh vía meshnotes.".to_string(),
        _ => "Sent from the mesh radio network via meshnotes.".to_string(),
    }
}

/// Deterministic six-digit id for dry-run mode (FNV-1a over the note body).
fn synthetic_note_id(text: &str) -> i64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in text.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (hash % 900_000 + 100_000) as i64
}
