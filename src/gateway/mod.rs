//! # Gateway Orchestrator
//!
//! Wires every component together and owns the process lifecycle: the radio
//! adapter feeds inbound packets into the dispatch loop, reports run through
//! the policy engine into the store (with an immediate best-effort upload),
//! informational commands get read-only answers, and the flush worker drains
//! whatever the immediate path could not send.
//!
//! Ordering guarantee: the acknowledgement for an inbound packet is only
//! emitted after the store write for that packet has committed.

use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::clock::Clock;
use crate::commands::{templates, Command, CommandParser};
use crate::config::Config;
use crate::notify::{Notifier, ReportRateLimiter};
use crate::osm::geocode::Geocoder;
use crate::osm::{PublishOutcome, Publisher};
use crate::policy::{Decision, PolicyEngine, MAX_REPORT_CHARS};
use crate::position::PositionCache;
use crate::radio::{
    payload_preview, ModemTransport, RadioAdapter, RadioConfig, RadioPacket, SerialTransport,
};
use crate::storage::{Report, ReportStatus, Store, StoreResult};
use crate::worker::FlushWorker;

/// Origins shown by `#osmnodes`.
const NODES_SHOWN: usize = 8;

/// Characters of report text shown per `#osmlist` line.
const LIST_PREVIEW_CHARS: usize = 30;

pub struct Gateway {
    config: Config,
    clock: Arc<Clock>,
    cache: Arc<PositionCache>,
    store: Arc<Store>,
    parser: CommandParser,
    policy: PolicyEngine,
    radio: RadioAdapter,
    publisher: Arc<Publisher>,
    geocoder: Arc<Geocoder>,
    notifier: Arc<Notifier>,
    rate_limiter: ReportRateLimiter,
    packet_rx: mpsc::UnboundedReceiver<RadioPacket>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Gateway {
    /// Production constructor: serial modem on the configured port.
    pub fn new(config: Config) -> Result<Self> {
        let transport = Box::new(SerialTransport::new(
            &config.serial_port,
            config.serial_baud,
        ));
        Self::with_transport(config, transport, RadioConfig::default())
    }

    /// Constructor with an injected modem transport (tests substitute an
    /// in-memory pair here).
    pub fn with_transport(
        config: Config,
        transport: Box<dyn ModemTransport>,
        radio_cfg: RadioConfig,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let clock = Arc::new(Clock::new());
        let store = Arc::new(Store::open(config.db_path())?);
        // Re-arm the one-shot clock correction for this process.
        store.record_boot(clock.now_utc())?;

        let (radio, packet_rx) = RadioAdapter::new(transport, radio_cfg);
        let publisher = Arc::new(Publisher::new(&config, Arc::clone(&clock))?);
        let geocoder = Arc::new(Geocoder::new(&config.language, !config.dry_run));
        let notifier = Arc::new(Notifier::new(
            radio.clone(),
            Arc::clone(&store),
            config.dry_run,
        ));
        let policy = PolicyEngine::new(
            Duration::from_secs(config.pos_good_secs),
            Duration::from_secs(config.pos_max_secs),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            clock,
            cache: Arc::new(PositionCache::new()),
            store,
            parser: CommandParser::new(),
            policy,
            radio,
            publisher,
            geocoder,
            notifier,
            rate_limiter: ReportRateLimiter::new(),
            packet_rx,
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn position_cache(&self) -> &Arc<PositionCache> {
        &self.cache
    }

    pub fn radio(&self) -> &RadioAdapter {
        &self.radio
    }

    /// Run until ctrl-c (or the packet channel closes), then shut down in
    /// order: stop the worker, drain in-flight work, close the radio.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            "gateway starting (serial={}, data_dir={}, dry_run={})",
            self.config.serial_port,
            self.config.data_dir.display(),
            self.config.dry_run
        );

        self.radio.start(self.shutdown_rx.clone());

        let worker = FlushWorker::new(
            Arc::clone(&self.store),
            Arc::clone(&self.publisher),
            Arc::clone(&self.notifier),
            Arc::clone(&self.clock),
            self.radio.clone(),
            Duration::from_secs(self.config.worker_interval_secs),
            self.config.daily_broadcast_enabled,
            self.config.dry_run,
        );
        let worker_handle = tokio::spawn(worker.run(self.shutdown_rx.clone()));

        loop {
            tokio::select! {
                packet = self.packet_rx.recv() => {
                    match packet {
                        Some(packet) => self.handle_packet(packet).await,
                        None => {
                            warn!("radio packet channel closed");
                            break;
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("received shutdown signal");
                    break;
                }
            }
        }

        let _ = self.shutdown_tx.send(true);
        if let Err(e) = worker_handle.await {
            warn!("flush worker join failed: {}", e);
        }
        info!("gateway shutdown complete");
        Ok(())
    }

    /// Dispatch one inbound packet. Position packets only feed the cache;
    /// text packets run through the command grammar.
    pub async fn handle_packet(&mut self, packet: RadioPacket) {
        match packet {
            RadioPacket::Position {
                origin, lat, lon, ..
            } => {
                self.cache.update(&origin, lat, lon);
            }
            RadioPacket::Text {
                origin,
                text,
                received_at,
            } => {
                info!("radio: text from {}: {}", origin, payload_preview(&text));
                self.handle_text(origin, text, received_at).await;
            }
        }
    }

    async fn handle_text(&mut self, origin: String, text: String, received_at: DateTime<Utc>) {
        match self.parser.parse(&text) {
            Command::Ignore => {}
            Command::Report(remaining) => {
                self.handle_report(origin, remaining, received_at).await;
            }
            Command::Help => {
                self.notifier
                    .send_command_response(&origin, templates::help())
                    .await;
            }
            Command::Status => match self.render_status(&origin).await {
                Ok(reply) => {
                    self.notifier.send_command_response(&origin, reply).await;
                }
                Err(e) => error!("status query failed: {}", e),
            },
            Command::Count => match self.render_count(&origin) {
                Ok(reply) => {
                    self.notifier.send_command_response(&origin, reply).await;
                }
                Err(e) => error!("count query failed: {}", e),
            },
            Command::List(limit) => match self.render_list(&origin, limit as u32) {
                Ok(reply) => {
                    self.notifier.send_command_response(&origin, reply).await;
                }
                Err(e) => error!("list query failed: {}", e),
            },
            Command::Queue => match self.render_queue(&origin) {
                Ok(reply) => {
                    self.notifier.send_command_response(&origin, reply).await;
                }
                Err(e) => error!("queue query failed: {}", e),
            },
            Command::Nodes => {
                let reply = self.render_nodes();
                self.notifier.send_command_response(&origin, reply).await;
            }
        }
    }

    async fn handle_report(&mut self, origin: String, remaining: String, received_at: DateTime<Utc>) {
        if !self.rate_limiter.allow(&origin) {
            self.notifier
                .ack_reject(&origin, templates::rate_limited())
                .await;
            return;
        }

        let decision = match self.policy.evaluate_report(
            &origin,
            &remaining,
            received_at,
            &self.cache,
            &self.store,
        ) {
            Ok(decision) => decision,
            Err(e) => {
                error!("policy evaluation failed for {}: {}", origin, e);
                return;
            }
        };

        match decision {
            Decision::MissingText => {
                self.notifier
                    .ack_reject(&origin, templates::missing_text())
                    .await;
            }
            Decision::TooLong => {
                self.notifier
                    .ack_reject(&origin, templates::too_long(MAX_REPORT_CHARS))
                    .await;
            }
            Decision::NoGps => {
                self.notifier
                    .ack_reject(&origin, templates::reject_no_gps())
                    .await;
            }
            Decision::StaleGps => {
                self.notifier
                    .ack_reject(
                        &origin,
                        templates::reject_stale_gps(self.policy.pos_max().as_secs()),
                    )
                    .await;
            }
            Decision::InvalidCoords => {
                self.notifier
                    .ack_reject(&origin, templates::reject_invalid_coords())
                    .await;
            }
            Decision::Duplicate => {
                self.notifier.ack_duplicate(&origin).await;
            }
            Decision::Accept {
                lat,
                lon,
                text_final,
                ..
            } => {
                let queue_id = match self.store.append(
                    &origin,
                    lat,
                    lon,
                    remaining.trim(),
                    &text_final,
                    received_at,
                ) {
                    Ok(queue_id) => queue_id,
                    Err(e) => {
                        error!("store append failed for {}: {}", origin, e);
                        return;
                    }
                };

                // Best-effort immediate upload; a failure just leaves the
                // row queued for the flush worker.
                match self.try_immediate_send(&queue_id).await {
                    Some((upstream_id, url)) => {
                        let location = self.geocoder.locate(lat, lon).await;
                        self.notifier
                            .ack_success(&origin, upstream_id, &url, location.as_deref())
                            .await;
                        // The success ack replaces the promotion announcement.
                        if let Err(e) = self.store.mark_announced(&queue_id) {
                            warn!("failed to mark {} announced: {}", queue_id, e);
                        }
                    }
                    None => {
                        self.notifier.ack_queued(&origin, &queue_id).await;
                    }
                }
            }
        }
    }

    async fn try_immediate_send(&self, queue_id: &str) -> Option<(i64, String)> {
        let report = match self.store.get_by_queue_id(queue_id) {
            Ok(Some(report)) => report,
            Ok(None) => return None,
            Err(e) => {
                error!("immediate send lookup failed for {}: {}", queue_id, e);
                return None;
            }
        };
        if report.status != ReportStatus::Pending {
            return None;
        }
        match self
            .publisher
            .publish(report.lat, report.lon, &report.text_normalized)
            .await
        {
            PublishOutcome::Ok { id, url } => {
                if let Err(e) = self
                    .store
                    .mark_sent(queue_id, id, &url, self.clock.now_utc())
                {
                    // The upstream note exists; the row will be caught by a
                    // later flush, but the user still gets their success ack.
                    error!("mark_sent failed for {}: {}", queue_id, e);
                }
                Some((id, url))
            }
            PublishOutcome::Transient(tag) | PublishOutcome::Permanent(tag) => {
                if let Err(e) = self.store.record_error(queue_id, &tag) {
                    warn!("record_error failed for {}: {}", queue_id, e);
                }
                None
            }
        }
    }

    // --- informational command handlers (read-only) -----------------------

    async fn render_status(&self, origin: &str) -> StoreResult<String> {
        let internet_ok = self.publisher.probe().await;
        let total_queue = self.store.total_queue_size()?;
        let stats = self.store.node_stats(origin)?;
        Ok(templates::status(internet_ok, total_queue, stats.queue))
    }

    fn render_count(&self, origin: &str) -> StoreResult<String> {
        let stats = self.store.node_stats(origin)?;
        Ok(templates::count(stats.today, stats.total))
    }

    fn render_queue(&self, origin: &str) -> StoreResult<String> {
        let total = self.store.total_queue_size()?;
        let stats = self.store.node_stats(origin)?;
        Ok(templates::queue(total, stats.queue))
    }

    fn render_list(&self, origin: &str, limit: u32) -> StoreResult<String> {
        let notes = self.store.recent_notes(origin, limit)?;
        if notes.is_empty() {
            return Ok(templates::list_empty());
        }
        let mut lines = vec![format!("📝 Last {} notes:", notes.len())];
        for note in &notes {
            lines.push(format_list_line(note));
        }
        Ok(lines.join("\n"))
    }

    fn render_nodes(&self) -> String {
        let snapshot = self.cache.snapshot();
        if snapshot.is_empty() {
            return templates::nodes_empty();
        }
        let mut lines = vec!["📡 Recently heard:".to_string()];
        for (origin, position) in snapshot.iter().take(NODES_SHOWN) {
            lines.push(format!(
                "{}: {} s ago, {} fixes",
                origin,
                position.received_at.elapsed().as_secs(),
                position.seen_count
            ));
        }
        lines.join("\n")
    }
}

fn format_list_line(note: &Report) -> String {
    let icon = match note.status {
        ReportStatus::Pending => "⏳",
        ReportStatus::Sent => "✅",
    };
    let created = note
        .created_at
        .with_timezone(&Local)
        .format("%Y-%m-%d %H:%M");
    let preview = preview_text(&note.text_original, LIST_PREVIEW_CHARS);
    match (&note.status, &note.upstream_url) {
        (ReportStatus::Sent, Some(url)) => {
            format!("{icon} {created}: {preview} → {url}")
        }
        _ => format!("{icon} {created}: {preview} [{}]", note.queue_id),
    }
}

fn preview_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{truncated}...")
}
