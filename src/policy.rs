//! Report gatekeeping: freshness, validity, and deduplication.
//!
//! A report is only worth publishing if the gateway knows where the sender
//! was when they typed it. The policy engine turns (origin, remaining text,
//! now) into a [`Decision`], consulting the position cache for the freshness
//! checks and the store for the dedup probe. Nothing here writes state.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::commands::normalize;
use crate::position::PositionCache;
use crate::storage::{Store, StoreResult, DEDUP_BUCKET_SECONDS};

/// Longest report text accepted, in characters. Anything longer would be
/// chopped by the mesh anyway; better to tell the user than to truncate.
pub const MAX_REPORT_CHARS: usize = 200;

/// Marker prefixed to reports whose position fix was usable but aging.
pub const APPROXIMATE_MARKER: &str = "[approximate position]";

/// Outcome of evaluating one report.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    MissingText,
    TooLong,
    NoGps,
    StaleGps,
    InvalidCoords,
    Duplicate,
    Accept {
        lat: f64,
        lon: f64,
        approximate: bool,
        /// Normalized text, with the approximate-position marker when the
        /// fix aged past the "good" threshold. This is what gets stored as
        /// `text_normalized` and published upstream.
        text_final: String,
    },
}

pub struct PolicyEngine {
    pos_good: Duration,
    pos_max: Duration,
}

impl PolicyEngine {
    pub fn new(pos_good: Duration, pos_max: Duration) -> Self {
        Self { pos_good, pos_max }
    }

    pub fn pos_max(&self) -> Duration {
        self.pos_max
    }

    /// Evaluate one report. `text_remaining` is the payload after hashtag
    /// strip; `now` is the gateway receive instant used for the dedup bucket.
    pub fn evaluate_report(
        &self,
        origin: &str,
        text_remaining: &str,
        now: DateTime<Utc>,
        cache: &PositionCache,
        store: &Store,
    ) -> StoreResult<Decision> {
        // Length is judged on the raw text, before whitespace collapsing: a
        // report bloated past the limit by repeated whitespace is still too
        // long on the air.
        if text_remaining.trim().chars().count() > MAX_REPORT_CHARS {
            return Ok(Decision::TooLong);
        }
        let normalized = normalize(text_remaining);
        if normalized.is_empty() {
            return Ok(Decision::MissingText);
        }

        let Some(position) = cache.get(origin) else {
            return Ok(Decision::NoGps);
        };
        if !coordinates_valid(position.lat, position.lon) {
            return Ok(Decision::InvalidCoords);
        }

        // A fix from "the future" can only be scheduler jitter; clamp to zero.
        let age = cache.age(origin).unwrap_or(Duration::ZERO);
        if age > self.pos_max {
            return Ok(Decision::StaleGps);
        }
        let approximate = age > self.pos_good;

        let text_final = if approximate {
            format!("{APPROXIMATE_MARKER} {normalized}")
        } else {
            normalized
        };

        let bucket = dedup_bucket(now);
        if store.check_duplicate(
            origin,
            &text_final,
            round4(position.lat),
            round4(position.lon),
            bucket,
        )? {
            return Ok(Decision::Duplicate);
        }

        Ok(Decision::Accept {
            lat: position.lat,
            lon: position.lon,
            approximate,
            text_final,
        })
    }
}

/// (0, 0) is the classic cold-GPS default and never a real report site.
fn coordinates_valid(lat: f64, lon: f64) -> bool {
    if lat == 0.0 && lon == 0.0 {
        return false;
    }
    (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)
}

/// Round to 4 decimal places (about 11 m), half away from zero.
pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// 120-second tumbling dedup bucket.
pub fn dedup_bucket(now: DateTime<Utc>) -> i64 {
    now.timestamp() / DEDUP_BUCKET_SECONDS
}
