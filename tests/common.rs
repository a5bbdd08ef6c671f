//! Test utilities & fixtures.
//!
//! Provides a scripted in-memory modem (events in, captured frames out) and
//! a config builder pointed at a temp data directory.

use std::io;
use std::path::Path;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use meshnotes::config::Config;
use meshnotes::radio::{
    ModemEvent, ModemReader, ModemSender, ModemTransport, RadioAdapter,
};
use tokio::sync::watch;

/// A captured outbound frame: (destination, payload); destination None is a
/// broadcast.
pub type Frames = Arc<Mutex<Vec<(Option<String>, String)>>>;

/// In-memory modem: the test feeds [`ModemEvent`]s through a channel and
/// inspects every frame the adapter transmits. `connect()` succeeds once;
/// dropping the event sender simulates a serial fault.
pub struct ScriptedTransport {
    reader_rx: Mutex<Option<Receiver<ModemEvent>>>,
    frames: Frames,
}

impl ScriptedTransport {
    pub fn new() -> (Box<Self>, Sender<ModemEvent>, Frames) {
        let (tx, rx) = std::sync::mpsc::channel();
        let frames: Frames = Arc::new(Mutex::new(Vec::new()));
        let transport = Box::new(Self {
            reader_rx: Mutex::new(Some(rx)),
            frames: Arc::clone(&frames),
        });
        (transport, tx, frames)
    }
}

impl ModemTransport for ScriptedTransport {
    fn connect(&self) -> anyhow::Result<(Box<dyn ModemReader>, Box<dyn ModemSender>)> {
        let rx = self
            .reader_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow::anyhow!("scripted modem already consumed"))?;
        Ok((
            Box::new(ScriptedReader { rx }),
            Box::new(CapturingSender {
                frames: Arc::clone(&self.frames),
            }),
        ))
    }
}

struct ScriptedReader {
    rx: Receiver<ModemEvent>,
}

impl ModemReader for ScriptedReader {
    fn next_event(&mut self) -> io::Result<Option<ModemEvent>> {
        match self.rx.recv_timeout(Duration::from_millis(20)) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "scripted modem script ended",
            )),
        }
    }
}

struct CapturingSender {
    frames: Frames,
}

impl ModemSender for CapturingSender {
    fn send_frame(&mut self, destination: Option<&str>, payload: &str) -> io::Result<()> {
        self.frames
            .lock()
            .unwrap()
            .push((destination.map(str::to_string), payload.to_string()));
        Ok(())
    }
}

/// Sends shutdown on drop so the radio supervisor thread always exits, even
/// when an assertion panics mid-test.
pub struct RadioGuard {
    tx: watch::Sender<bool>,
}

impl RadioGuard {
    pub fn start(radio: &RadioAdapter) -> Self {
        let (tx, rx) = watch::channel(false);
        radio.start(rx);
        Self { tx }
    }
}

impl Drop for RadioGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(true);
    }
}

/// Poll until the adapter reports the modem link up.
#[allow(dead_code)]
pub async fn wait_connected(radio: &RadioAdapter) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if radio.is_connected() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("modem link never came up");
}

/// Config rooted in a temp dir. `dry_run` controls whether the publisher
/// fabricates uploads (true) and whether the notifier logs instead of
/// transmitting (true).
#[allow(dead_code)]
pub fn test_config(data_dir: &Path, dry_run: bool) -> Config {
    Config {
        data_dir: data_dir.to_path_buf(),
        dry_run,
        ..Config::default()
    }
}

/// Frames snapshot helper.
#[allow(dead_code)]
pub fn frames_snapshot(frames: &Frames) -> Vec<(Option<String>, String)> {
    frames.lock().unwrap().clone()
}
