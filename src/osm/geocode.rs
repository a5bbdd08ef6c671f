//! Reverse geocoding via Nominatim, for the locality line in success acks.
//!
//! Strictly best-effort: any failure degrades to "no locality line" and a
//! report is never delayed or rejected because of geocoding. Nominatim's
//! usage policy caps us at one request per second; results are cached by
//! rounded coordinate so repeated reports from the same block cost nothing.

use log::debug;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const NOMINATIM_API_URL: &str = "https://nominatim.openstreetmap.org/reverse";
const NOMINATIM_MIN_GAP: Duration = Duration::from_secs(1);
const NOMINATIM_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Deserialize)]
struct ReverseResponse {
    #[serde(default)]
    address: Address,
}

#[derive(Deserialize, Default)]
struct Address {
    neighbourhood: Option<String>,
    suburb: Option<String>,
    quarter: Option<String>,
    village: Option<String>,
    residential: Option<String>,
    city_district: Option<String>,
    district: Option<String>,
    locality: Option<String>,
    subdistrict: Option<String>,
    city: Option<String>,
    town: Option<String>,
    municipality: Option<String>,
    state: Option<String>,
    region: Option<String>,
    country: Option<String>,
}

pub struct Geocoder {
    client: reqwest::Client,
    language: String,
    enabled: bool,
    last_request: tokio::sync::Mutex<Option<Instant>>,
    cache: Mutex<HashMap<(i64, i64), Option<String>>>,
}

impl Geocoder {
    /// `enabled = false` (dry-run) turns every lookup into an instant None.
    pub fn new(language: &str, enabled: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(NOMINATIM_TIMEOUT)
            .user_agent(concat!("meshnotes/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            language: language.to_string(),
            enabled,
            last_request: tokio::sync::Mutex::new(None),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve coordinates to a short locality string, or None.
    pub async fn locate(&self, lat: f64, lon: f64) -> Option<String> {
        if !self.enabled {
            return None;
        }
        let key = cache_key(lat, lon);
        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(hit) = cache.get(&key) {
                return hit.clone();
            }
        }

        // Politeness gap, serialized across callers.
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let since = prev.elapsed();
            if since < NOMINATIM_MIN_GAP {
                tokio::time::sleep(NOMINATIM_MIN_GAP - since).await;
            }
        }
        let result = self
            .client
            .get(NOMINATIM_API_URL)
            .query(&[
                ("lat", lat.to_string()),
                ("lon", lon.to_string()),
                ("format", "json".to_string()),
                ("addressdetails", "1".to_string()),
                ("accept-language", self.language.clone()),
            ])
            .send()
            .await;
        *last = Some(Instant::now());
        drop(last);

        let located = match result {
            Ok(resp) if resp.status().is_success() => match resp.json::<ReverseResponse>().await {
                Ok(body) => format_address(&body.address),
                Err(e) => {
                    debug!("geocode: unparseable response: {}", e);
                    None
                }
            },
            Ok(resp) => {
                debug!("geocode: api answered {}", resp.status());
                None
            }
            Err(e) => {
                debug!("geocode: request failed: {}", e);
                None
            }
        };

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(key, located.clone());
        located
    }
}

fn cache_key(lat: f64, lon: f64) -> (i64, i64) {
    ((lat * 10_000.0).round() as i64, (lon * 10_000.0).round() as i64)
}

/// Build "neighbourhood, district, city, state, country" from whatever
/// levels Nominatim returned, skipping duplicates between levels.
fn format_address(address: &Address) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();

    let neighbourhood = address
        .neighbourhood
        .as_deref()
        .or(address.suburb.as_deref())
        .or(address.quarter.as_deref())
        .or(address.village.as_deref())
        .or(address.residential.as_deref())
        .or(address.city_district.as_deref());
    if let Some(n) = neighbourhood {
        parts.push(n);
    }

    let district = address
        .district
        .as_deref()
        .or(address.locality.as_deref())
        .or(address.city_district.as_deref())
        .or(address.subdistrict.as_deref());
    let city = address
        .city
        .as_deref()
        .or(address.town.as_deref())
        .or(address.municipality.as_deref());
    if let Some(d) = district {
        if Some(d) != neighbourhood && Some(d) != city {
            parts.push(d);
        }
    }
    if let Some(c) = city {
        if Some(c) != neighbourhood && Some(c) != district {
            parts.push(c);
        }
    }
    if let Some(s) = address.state.as_deref().or(address.region.as_deref()) {
        parts.push(s);
    }
    if let Some(c) = address.country.as_deref() {
        parts.push(c);
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_formatting_prefers_specific_levels() {
        let address = Address {
            suburb: Some("Prado Veraniego".to_string()),
            district: Some("Suba".to_string()),
            city: Some("Bogotá".to_string()),
            country: Some("Colombia".to_string()),
            ..Default::default()
        };
        assert_eq!(
            format_address(&address).unwrap(),
            "Prado Veraniego, Suba, Bogotá, Colombia"
        );
    }

    #[test]
    fn duplicate_levels_collapse() {
        let address = Address {
            city_district: Some("Chapinero".to_string()),
            city: Some("Bogotá".to_string()),
            ..Default::default()
        };
        // city_district serves as the neighbourhood; the district fallback
        // must not repeat it.
        assert_eq!(format_address(&address).unwrap(), "Chapinero, Bogotá");
    }

    #[test]
    fn empty_address_yields_none() {
        assert_eq!(format_address(&Address::default()), None);
    }

    #[test]
    fn cache_keys_round_to_eleven_meters() {
        assert_eq!(cache_key(4.60971, -74.08172), cache_key(4.60969, -74.08168));
        assert_ne!(cache_key(4.6097, -74.0817), cache_key(4.6099, -74.0817));
    }
}
