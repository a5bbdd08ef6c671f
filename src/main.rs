//! Binary entrypoint for the meshnotes CLI.
//!
//! Commands:
//! - `start` - run the gateway until interrupted
//! - `status` - print store counters as JSON and exit
//! - `check-device [--port <path>] [--timeout <s>]` - verify the modem talks
//!
//! Configuration comes from the environment (see the `config` module docs);
//! `--port` overrides `SERIAL_PORT` where offered.

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;

use meshnotes::config::Config;
use meshnotes::gateway::Gateway;
use meshnotes::radio::{ModemReader as _, ModemTransport, SerialTransport};
use meshnotes::storage::Store;

#[derive(Parser)]
#[command(name = "meshnotes")]
#[command(about = "Meshtastic to OpenStreetMap notes gateway")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging (-v, -vv for more; overrides LOG_LEVEL)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Start {
        /// Modem serial port (overrides SERIAL_PORT)
        #[arg(short, long)]
        port: Option<String>,
    },
    /// Print store counters and exit
    Status,
    /// Check modem connectivity over serial
    CheckDevice {
        /// Modem serial port (overrides SERIAL_PORT)
        #[arg(short, long)]
        port: Option<String>,
        /// Seconds to wait for modem traffic before giving up
        #[arg(short, long, default_value_t = 10)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    init_logging(&config, cli.verbose);

    match cli.command {
        Commands::Start { port } => {
            if let Some(port) = port {
                config.serial_port = port;
            }
            info!("starting meshnotes v{}", env!("CARGO_PKG_VERSION"));
            let mut gateway = Gateway::new(config)?;
            gateway.run().await?;
        }
        Commands::Status => {
            let store = Store::open(config.db_path())?;
            let payload = serde_json::json!({
                "db_path": config.db_path(),
                "pending": store.total_queue_size()?,
                "sent": store.total_sent()?,
                "time_correction_applied": store.time_correction_applied()?,
                "last_broadcast_date": store.last_broadcast_date()?,
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        Commands::CheckDevice { port, timeout } => {
            let port = port.unwrap_or(config.serial_port);
            let ok = check_device(&port, config.serial_baud, timeout)?;
            std::process::exit(if ok { 0 } else { 1 });
        }
    }

    Ok(())
}

/// Open the modem and wait for any decoded event line. Prints a JSON verdict.
fn check_device(port: &str, baud: u32, timeout_secs: u64) -> Result<bool> {
    use std::time::{Duration, Instant};

    info!("checking modem on {} @ {} baud", port, baud);
    let transport = SerialTransport::new(port, baud);
    let (mut reader, _sender) = transport.connect()?;

    let deadline = Instant::now() + Duration::from_secs(timeout_secs);
    let mut events_seen = 0u32;
    while Instant::now() < deadline {
        match reader.next_event() {
            Ok(Some(_)) => {
                events_seen += 1;
                break;
            }
            Ok(None) => std::thread::sleep(Duration::from_millis(50)),
            Err(e) => {
                eprintln!("serial read failed: {e}");
                break;
            }
        }
    }

    let ok = events_seen > 0;
    let payload = serde_json::json!({
        "status": if ok { "ok" } else { "silent" },
        "port": port,
        "baud": baud,
        "events_seen": events_seen,
        "timeout_seconds": timeout_secs,
    });
    println!("{}", payload);
    Ok(ok)
}

fn init_logging(config: &Config, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    let level = match verbosity {
        0 => config
            .log_level
            .parse::<log::LevelFilter>()
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(level);
    builder.format(|fmt, record| {
        writeln!(
            fmt,
            "{} [{}] {}",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
            record.level(),
            record.args()
        )
    });
    let _ = builder.try_init();
}
