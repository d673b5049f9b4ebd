//! Chronos Operator Console
//!
//! Entry point for driving a Chronos stimulator over BLE.
//!
//! # Usage
//!
//! ```bash
//! # Interactive console (default)
//! chronos
//!
//! # Interactive console against the simulated device
//! chronos --simulate
//!
//! # Look for a device and exit
//! chronos scan
//!
//! # Send one command, hold it for 30 s, then stop
//! chronos send --amplitude 1000 --pulse-width 500 --frequency 100 --enable --hold 30
//! ```

mod console;

use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use chronos_core::StimulationParameters;
use chronos_native::{CommandDispatcher, OperatorPanel, SessionConfig, SimulatedLink, StatusEvent};

/// Chronos Operator Console
#[derive(Parser, Debug)]
#[command(name = "chronos")]
#[command(author, version, about = "Operator console for the Chronos BLE neurostimulator", long_about = None)]
struct Cli {
    /// Logging verbosity level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Use the built-in simulated device instead of Bluetooth
    #[arg(long)]
    simulate: bool,

    /// Substring the advertised device name must contain
    #[arg(long)]
    name_filter: Option<String>,

    /// Scan window in seconds
    #[arg(long)]
    scan_window: Option<u64>,

    /// Connect timeout in seconds
    #[arg(long)]
    connect_timeout: Option<u64>,

    /// Command timeout in milliseconds
    #[arg(long)]
    command_timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Interactive operator console (default if no subcommand)
    Console,

    /// Scan for a Chronos device
    Scan,

    /// Connect, send one set of parameters, then stop and disconnect
    Send {
        /// Amplitude in µA
        #[arg(short, long, allow_negative_numbers = true)]
        amplitude: i64,

        /// Pulse width in µs
        #[arg(short, long, default_value = "500")]
        pulse_width: i64,

        /// Frequency in Hz
        #[arg(short, long, default_value = "100")]
        frequency: i64,

        /// Enable stimulation output; without it zero output is sent
        #[arg(long)]
        enable: bool,

        /// Seconds to keep the output before stopping
        #[arg(long, default_value = "0")]
        hold: u64,
    },

    /// Connect, send a stop command and disconnect
    Stop {
        /// Pulse width in µs
        #[arg(short, long, default_value = "500")]
        pulse_width: i64,

        /// Frequency in Hz
        #[arg(short, long, default_value = "100")]
        frequency: i64,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Status events go to stdout, logs to stderr
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Chronos Stim v{}", env!("CARGO_PKG_VERSION"));

    let rt = Runtime::new()?;
    let result = rt.block_on(run(cli));
    // stdin reads may still be parked on a blocking thread
    rt.shutdown_timeout(Duration::from_millis(250));
    result
}

fn session_config(cli: &Cli) -> SessionConfig {
    let mut config = SessionConfig::default();
    if let Some(filter) = &cli.name_filter {
        config.name_filter.clone_from(filter);
    }
    if let Some(secs) = cli.scan_window {
        config.scan_window = Duration::from_secs(secs);
    }
    if let Some(secs) = cli.connect_timeout {
        config.connect_timeout = Duration::from_secs(secs);
    }
    if let Some(ms) = cli.command_timeout_ms {
        config.command_timeout = Duration::from_millis(ms);
    }
    config
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = session_config(&cli);
    let (dispatcher, events) = spawn_dispatcher(cli.simulate, config).await?;
    let printer = spawn_event_printer(events);

    let result = match cli.command {
        None | Some(Commands::Console) => console::run(OperatorPanel::new(dispatcher)).await,
        Some(Commands::Scan) => scan(dispatcher).await,
        Some(Commands::Send {
            amplitude,
            pulse_width,
            frequency,
            enable,
            hold,
        }) => {
            let params = StimulationParameters::new(amplitude, pulse_width, frequency);
            send_once(dispatcher, params, enable, Duration::from_secs(hold)).await
        }
        Some(Commands::Stop { pulse_width, frequency }) => stop_once(dispatcher, pulse_width, frequency).await,
    };

    // Every sink is gone once the worker exits; drain what is left
    if tokio::time::timeout(Duration::from_millis(500), printer).await.is_err() {
        warn!("Status events still pending at exit");
    }
    result
}

async fn spawn_dispatcher(
    simulate: bool,
    config: SessionConfig,
) -> anyhow::Result<(CommandDispatcher, mpsc::Receiver<StatusEvent>)> {
    #[cfg(feature = "ble")]
    {
        if !simulate {
            let link = chronos_native::BtleplugLink::new().await?;
            info!("Using Bluetooth adapter");
            return Ok(CommandDispatcher::spawn(link, config));
        }
    }

    #[cfg(not(feature = "ble"))]
    {
        if !simulate {
            warn!("Bluetooth support not enabled, falling back to the simulated device");
        }
    }

    let (link, _device) = SimulatedLink::new();
    info!("Using simulated Chronos device");
    Ok(CommandDispatcher::spawn(link, config))
}

fn spawn_event_printer(mut events: mpsc::Receiver<StatusEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("{event}");
        }
    })
}

async fn scan(dispatcher: CommandDispatcher) -> anyhow::Result<()> {
    let found = dispatcher.scan().await;
    dispatcher.shutdown(
        StimulationParameters::DEFAULT_PULSE_WIDTH_US,
        StimulationParameters::DEFAULT_FREQUENCY_HZ,
    )
    .await;

    match found? {
        Some(device) => {
            let rssi = device.rssi.map_or_else(|| "n/a".to_string(), |r| format!("{r} dBm"));
            println!("{}  {}  RSSI {rssi}", device.name, device.id);
        }
        None => println!("No Chronos device found"),
    }
    Ok(())
}

async fn send_once(
    dispatcher: CommandDispatcher,
    params: StimulationParameters,
    enable: bool,
    hold: Duration,
) -> anyhow::Result<()> {
    let sent = async {
        dispatcher.scan_and_connect().await?;
        dispatcher.send_parameters(params, enable).await?;
        if !hold.is_zero() {
            info!("Holding output for {hold:?}");
            tokio::select! {
                () = tokio::time::sleep(hold) => {}
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            }
        }
        anyhow::Ok(())
    }
    .await;

    // Stops the output with the same timing before disconnecting
    dispatcher.shutdown(params.pulse_width_us, params.frequency_hz).await;
    sent
}

async fn stop_once(dispatcher: CommandDispatcher, pulse_width_us: i64, frequency_hz: i64) -> anyhow::Result<()> {
    let sent = async {
        dispatcher.scan_and_connect().await?;
        dispatcher.force_stop(pulse_width_us, frequency_hz).await?;
        dispatcher.disconnect().await?;
        anyhow::Ok(())
    }
    .await;

    dispatcher.shutdown(pulse_width_us, frequency_hz).await;
    sent
}
