//! # Radio Adapter - Modem Packet Boundary
//!
//! Bidirectional packet boundary to the radio modem on the serial link. The
//! modem firmware decodes mesh traffic and surfaces it as newline-delimited
//! ASCII event lines; this module turns those into typed [`RadioPacket`]s
//! for the orchestrator and provides the paced transmit primitives for
//! directed acks and broadcasts.
//!
//! ## Modem line protocol
//!
//! Inbound (modem -> gateway):
//!
//! ```text
//! RX <origin> <text...>        text packet from a mesh node
//! POS <origin> <lat> <lon>     position packet (decimal degrees)
//! ```
//!
//! Outbound (gateway -> modem):
//!
//! ```text
//! TX <origin> <text...>        directed message
//! BC <text...>                 channel broadcast
//! ```
//!
//! Malformed lines are logged at debug level and dropped.
//!
//! ## Connection supervision
//!
//! `start()` spawns a supervisor on a blocking thread: it opens the serial
//! endpoint, runs the read loop, and on any I/O fault re-opens with
//! exponential backoff capped at 30 s. Transmits while disconnected return
//! `false`; acks are best-effort and never block report acceptance.
//!
//! Frames never exceed the modem MTU: long payloads are split on UTF-8-safe
//! boundaries, and consecutive frames are spaced at least 2 s apart to
//! reduce mesh collision loss.

pub mod framer;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serialport::SerialPort;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

use framer::LineFramer;

/// Compact single-line preview of a radio payload for logging. Control
/// characters collapse to `·`; anything longer than roughly half a modem
/// frame is cut, with the full character count appended so log readers can
/// tell a short report from a chunked wall of text.
pub fn payload_preview(text: &str) -> String {
    const PREVIEW_CHARS: usize = 80;
    let total = text.chars().count();
    let mut out: String = text
        .chars()
        .take(PREVIEW_CHARS)
        .map(|c| if c.is_control() { '·' } else { c })
        .collect();
    if total > PREVIEW_CHARS {
        out.push_str(&format!("… ({total} chars)"));
    }
    out
}

/// Inbound packet as seen by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioPacket {
    Text {
        origin: String,
        text: String,
        received_at: DateTime<Utc>,
    },
    Position {
        origin: String,
        lat: f64,
        lon: f64,
        received_at: DateTime<Utc>,
    },
}

/// Decoded modem event, before receive-time stamping.
#[derive(Debug, Clone, PartialEq)]
pub enum ModemEvent {
    Text { origin: String, text: String },
    Position { origin: String, lat: f64, lon: f64 },
}

/// Read half of a modem connection. `Ok(None)` is an idle poll tick; `Err`
/// means the link is gone and the supervisor should reconnect.
pub trait ModemReader: Send {
    fn next_event(&mut self) -> io::Result<Option<ModemEvent>>;
}

/// Write half of a modem connection. One call transmits one frame.
pub trait ModemSender: Send {
    fn send_frame(&mut self, destination: Option<&str>, payload: &str) -> io::Result<()>;
}

/// Factory for modem connections; the production implementation opens the
/// serial port, tests substitute an in-memory pair.
pub trait ModemTransport: Send + Sync {
    fn connect(&self) -> Result<(Box<dyn ModemReader>, Box<dyn ModemSender>)>;
}

#[derive(Debug, Clone)]
pub struct RadioConfig {
    /// Minimum spacing between any two transmitted frames.
    pub frame_gap: Duration,
    /// Largest payload per frame, in bytes.
    pub mtu: usize,
    /// Ceiling for the reconnect backoff.
    pub reconnect_max: Duration,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            frame_gap: Duration::from_secs(2),
            mtu: 200,
            reconnect_max: Duration::from_secs(30),
        }
    }
}

struct RadioInner {
    transport: Box<dyn ModemTransport>,
    cfg: RadioConfig,
    connected: AtomicBool,
    sender: Mutex<Option<Box<dyn ModemSender>>>,
    last_tx: tokio::sync::Mutex<Option<Instant>>,
    packet_tx: mpsc::UnboundedSender<RadioPacket>,
}

#[derive(Clone)]
pub struct RadioAdapter {
    inner: Arc<RadioInner>,
}

impl RadioAdapter {
    /// Build the adapter; the returned receiver is the orchestrator's inbound
    /// packet stream.
    pub fn new(
        transport: Box<dyn ModemTransport>,
        cfg: RadioConfig,
    ) -> (Self, mpsc::UnboundedReceiver<RadioPacket>) {
        let (packet_tx, packet_rx) = mpsc::unbounded_channel();
        let adapter = Self {
            inner: Arc::new(RadioInner {
                transport,
                cfg,
                connected: AtomicBool::new(false),
                sender: Mutex::new(None),
                last_tx: tokio::sync::Mutex::new(None),
                packet_tx,
            }),
        };
        (adapter, packet_rx)
    }

    /// Spawn the reader task and its reconnect supervisor.
    pub fn start(&self, shutdown: watch::Receiver<bool>) {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || supervisor_loop(inner, shutdown));
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Relaxed)
    }

    /// Transmit a directed message. Returns `false` if the modem is
    /// disconnected or rejects the frame; callers drop the message silently.
    pub async fn send_direct(&self, origin: &str, text: &str) -> bool {
        self.transmit(Some(origin), text).await
    }

    pub async fn send_broadcast(&self, text: &str) -> bool {
        self.transmit(None, text).await
    }

    async fn transmit(&self, destination: Option<&str>, text: &str) -> bool {
        if !self.is_connected() {
            debug!(
                "radio: dropping {} while disconnected: {}",
                destination.unwrap_or("broadcast"),
                payload_preview(text)
            );
            return false;
        }
        let segments = chunk_utf8(text, self.inner.cfg.mtu);
        // The pacing lock serializes every transmission in the process, so
        // the inter-frame gap holds across concurrent callers too.
        let mut last_tx = self.inner.last_tx.lock().await;
        for segment in &segments {
            if let Some(prev) = *last_tx {
                let since = prev.elapsed();
                if since < self.inner.cfg.frame_gap {
                    tokio::time::sleep(self.inner.cfg.frame_gap - since).await;
                }
            }
            let sent = {
                let mut guard = self.inner.sender.lock().unwrap_or_else(|e| e.into_inner());
                match guard.as_mut() {
                    Some(sender) => match sender.send_frame(destination, segment) {
                        Ok(()) => true,
                        Err(e) => {
                            warn!("radio: frame transmit failed: {}", e);
                            false
                        }
                    },
                    None => false,
                }
            };
            if !sent {
                return false;
            }
            *last_tx = Some(Instant::now());
        }
        true
    }
}

fn supervisor_loop(inner: Arc<RadioInner>, shutdown: watch::Receiver<bool>) {
    let mut backoff = Duration::from_secs(1);
    loop {
        if *shutdown.borrow() {
            break;
        }
        match inner.transport.connect() {
            Ok((reader, sender)) => {
                {
                    let mut guard = inner.sender.lock().unwrap_or_else(|e| e.into_inner());
                    *guard = Some(sender);
                }
                inner.connected.store(true, Ordering::Relaxed);
                info!("radio: modem link up");
                backoff = Duration::from_secs(1);

                let why = read_loop(reader, &inner, &shutdown);
                inner.connected.store(false, Ordering::Relaxed);
                {
                    let mut guard = inner.sender.lock().unwrap_or_else(|e| e.into_inner());
                    *guard = None;
                }
                match why {
                    ReadLoopEnd::Shutdown => break,
                    ReadLoopEnd::Fault(e) => {
                        warn!("radio: modem link lost: {}", e);
                    }
                }
            }
            Err(e) => {
                warn!(
                    "radio: modem connect failed ({}), retrying in {:?}",
                    e, backoff
                );
            }
        }
        if !sleep_interruptible(backoff, &shutdown) {
            break;
        }
        backoff = (backoff * 2).min(inner.cfg.reconnect_max);
    }
    debug!("radio: supervisor stopped");
}

enum ReadLoopEnd {
    Shutdown,
    Fault(io::Error),
}

fn read_loop(
    mut reader: Box<dyn ModemReader>,
    inner: &RadioInner,
    shutdown: &watch::Receiver<bool>,
) -> ReadLoopEnd {
    loop {
        if *shutdown.borrow() {
            return ReadLoopEnd::Shutdown;
        }
        match reader.next_event() {
            Ok(Some(event)) => {
                let received_at = Utc::now();
                let packet = match event {
                    ModemEvent::Text { origin, text } => RadioPacket::Text {
                        origin,
                        text,
                        received_at,
                    },
                    ModemEvent::Position { origin, lat, lon } => RadioPacket::Position {
                        origin,
                        lat,
                        lon,
                        received_at,
                    },
                };
                if inner.packet_tx.send(packet).is_err() {
                    // Orchestrator is gone; nothing left to feed.
                    return ReadLoopEnd::Shutdown;
                }
            }
            Ok(None) => {}
            Err(e) => return ReadLoopEnd::Fault(e),
        }
    }
}

/// Sleep in small slices so shutdown is observed promptly. Returns `false`
/// when shutdown fired during the wait.
fn sleep_interruptible(total: Duration, shutdown: &watch::Receiver<bool>) -> bool {
    let slice = Duration::from_millis(250);
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if *shutdown.borrow() {
            return false;
        }
        let step = remaining.min(slice);
        std::thread::sleep(step);
        remaining -= step;
    }
    !*shutdown.borrow()
}

/// Parse one modem event line. Returns None on anything malformed.
pub fn parse_event_line(line: &str) -> Option<ModemEvent> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("RX ") {
        let mut parts = rest.splitn(2, ' ');
        let origin = parts.next()?.trim();
        if origin.is_empty() {
            return None;
        }
        let text = parts.next().unwrap_or("").to_string();
        return Some(ModemEvent::Text {
            origin: origin.to_string(),
            text,
        });
    }
    if let Some(rest) = line.strip_prefix("POS ") {
        let mut parts = rest.split_whitespace();
        let origin = parts.next()?.to_string();
        let lat: f64 = parts.next()?.parse().ok()?;
        let lon: f64 = parts.next()?.parse().ok()?;
        return Some(ModemEvent::Position { origin, lat, lon });
    }
    None
}

/// Split `text` into chunks of at most `max_bytes` bytes without breaking
/// UTF-8 sequences.
pub fn chunk_utf8(text: &str, max_bytes: usize) -> Vec<String> {
    if text.len() <= max_bytes {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if current.len() + ch.len_utf8() > max_bytes && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

// --- serial transport -----------------------------------------------------

/// Production transport: the modem on a serial port, 8N1.
pub struct SerialTransport {
    port_name: String,
    baud_rate: u32,
}

impl SerialTransport {
    pub fn new(port_name: &str, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.to_string(),
            baud_rate,
        }
    }
}

impl ModemTransport for SerialTransport {
    fn connect(&self) -> Result<(Box<dyn ModemReader>, Box<dyn ModemSender>)> {
        let mut builder = serialport::new(&self.port_name, self.baud_rate)
            .timeout(Duration::from_millis(500));
        // Some USB serial adapters need explicit settings
        builder = builder
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None);
        let mut port = builder
            .open()
            .map_err(|e| anyhow!("failed to open serial port {}: {}", self.port_name, e))?;
        // Toggle DTR/RTS so ESP32-style boards wake from their boot prompt.
        let _ = port.write_data_terminal_ready(true);
        let _ = port.write_request_to_send(true);

        let mut writer = port
            .try_clone()
            .map_err(|e| anyhow!("failed to clone serial handle: {}", e))?;
        // Serial writes carry their own, longer timeout.
        writer
            .set_timeout(Duration::from_secs(2))
            .map_err(|e| anyhow!("failed to set write timeout: {}", e))?;

        info!(
            "radio: serial modem open on {} @ {} baud",
            self.port_name, self.baud_rate
        );
        Ok((
            Box::new(SerialModemReader {
                port,
                framer: LineFramer::new(),
            }),
            Box::new(SerialModemSender { port: writer }),
        ))
    }
}

struct SerialModemReader {
    port: Box<dyn SerialPort>,
    framer: LineFramer,
}

impl ModemReader for SerialModemReader {
    fn next_event(&mut self) -> io::Result<Option<ModemEvent>> {
        loop {
            while let Some(line) = self.framer.next_line() {
                match parse_event_line(&line) {
                    Some(event) => return Ok(Some(event)),
                    None => {
                        if !line.trim().is_empty() {
                            debug!("radio: unparsed modem line: {}", payload_preview(&line));
                        }
                    }
                }
            }
            let mut buf = [0u8; 512];
            match self.port.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(n) => self.framer.push(&buf[..n]),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    return Ok(None)
                }
                Err(e) => return Err(e),
            }
        }
    }
}

struct SerialModemSender {
    port: Box<dyn SerialPort>,
}

impl ModemSender for SerialModemSender {
    fn send_frame(&mut self, destination: Option<&str>, payload: &str) -> io::Result<()> {
        let line = match destination {
            Some(dest) => format!("TX {} {}\r\n", dest, payload),
            None => format!("BC {}\r\n", payload),
        };
        self.port.write_all(line.as_bytes())?;
        self.port.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_and_position_lines() {
        assert_eq!(
            parse_event_line("RX !9e7878a4 #osmnote tree down"),
            Some(ModemEvent::Text {
                origin: "!9e7878a4".to_string(),
                text: "#osmnote tree down".to_string(),
            })
        );
        assert_eq!(
            parse_event_line("POS !9e7878a4 4.6097 -74.0817"),
            Some(ModemEvent::Position {
                origin: "!9e7878a4".to_string(),
                lat: 4.6097,
                lon: -74.0817,
            })
        );
    }

    #[test]
    fn rejects_malformed_lines() {
        assert_eq!(parse_event_line(""), None);
        assert_eq!(parse_event_line("RX "), None);
        assert_eq!(parse_event_line("POS !a 4.6"), None);
        assert_eq!(parse_event_line("POS !a north west"), None);
        assert_eq!(parse_event_line("NOISE xyz"), None);
    }

    #[test]
    fn text_payload_may_be_empty() {
        for line in ["RX !a1b2", "RX !a1b2 "] {
            assert_eq!(
                parse_event_line(line),
                Some(ModemEvent::Text {
                    origin: "!a1b2".to_string(),
                    text: String::new(),
                }),
                "line {line:?}"
            );
        }
    }

    #[test]
    fn chunking_respects_utf8_boundaries() {
        let text = "á".repeat(150); // 2 bytes each, 300 bytes total
        let chunks = chunk_utf8(&text, 200);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 200);
        assert!(chunks.iter().all(|c| c.len() <= 200));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn short_payload_is_single_chunk() {
        assert_eq!(chunk_utf8("hello", 200), vec!["hello".to_string()]);
    }

    #[test]
    fn payload_preview_flattens_and_counts() {
        assert_eq!(payload_preview("tree down"), "tree down");
        assert_eq!(payload_preview("line1\nline2\ttab"), "line1·line2·tab");
        let long = "x".repeat(200);
        let preview = payload_preview(&long);
        assert!(preview.ends_with("… (200 chars)"));
        assert!(preview.starts_with(&"x".repeat(80)));
    }
}
