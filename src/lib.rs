//! # Meshnotes - Meshtastic to OpenStreetMap Notes Gateway
//!
//! Meshnotes is an offline-tolerant gateway for low-bandwidth packet-radio
//! meshes. Field devices send short `#osmnote` reports over the mesh; the
//! gateway geo-locates them from each device's recent position broadcasts,
//! queues them durably, and publishes them as notes on the public
//! OpenStreetMap API whenever the Internet uplink cooperates.
//!
//! ## Features
//!
//! - **Store and forward**: accepted reports land in a single-file sqlite
//!   queue and survive power loss; a background worker drains the queue when
//!   connectivity returns.
//! - **Position freshness policy**: reports are only accepted against a
//!   recent GPS fix (60 s by default), with an "approximate position" marker
//!   for aging fixes.
//! - **Deduplication**: identical reports from the same device at the same
//!   spot within a 120 s window collapse into one note.
//! - **Directed acknowledgements**: every report gets exactly one ack
//!   (created / queued / rejected), under a per-device anti-spam budget.
//! - **Clock skew correction**: boards without an RTC get their pre-sync
//!   queue timestamps corrected once NTP settles, one-shot per boot.
//! - **Unattended operation**: environment-driven configuration, serial
//!   reconnect supervision, and rate-limited upstream access suitable for a
//!   single-board computer in the field.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshnotes::config::Config;
//! use meshnotes::gateway::Gateway;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let mut gateway = Gateway::new(config)?;
//!     gateway.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`gateway`] - Orchestrator wiring all components and owning lifecycle
//! - [`radio`] - Modem packet boundary: serial link, framing, reconnect
//! - [`commands`] - Inbound command grammar and response templates
//! - [`policy`] - Report gatekeeping: freshness, validity, deduplication
//! - [`storage`] - Durable report queue (sqlite)
//! - [`osm`] - Upstream notes publisher and reverse geocoder
//! - [`worker`] - Periodic queue flush and clock skew correction
//! - [`notify`] - Directed acks and anti-spam budgets
//! - [`position`] - Per-origin GPS position cache
//! - [`clock`] - Wall/monotonic time and the NTP-sync predicate
//! - [`config`] - Environment-sourced configuration
//!
//! ## Data Flow
//!
//! ```text
//! ┌────────┐  RX/POS   ┌───────────┐  report  ┌────────┐
//! │ modem  │──────────▶│ orchestr. │─────────▶│ policy │
//! └────────┘           └───────────┘          └────────┘
//!     ▲                      │                     │ accept
//!     │ acks                 │ info cmds           ▼
//! ┌────────┐           ┌───────────┐         ┌─────────┐
//! │notifier│◀──────────│ handlers  │         │  store  │
//! └────────┘           └───────────┘         └─────────┘
//!                                                 │ pending
//!                                                 ▼
//!                                            ┌─────────┐  HTTPS  ┌─────┐
//!                                            │ worker  │────────▶│ OSM │
//!                                            └─────────┘         └─────┘
//! ```

pub mod clock;
pub mod commands;
pub mod config;
pub mod gateway;
pub mod notify;
pub mod osm;
pub mod policy;
pub mod position;
pub mod radio;
pub mod storage;
pub mod worker;
