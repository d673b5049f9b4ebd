//! Interactive operator console
//!
//! Reads one command per line from stdin. Status events are printed by the
//! event printer as they arrive; this module only prints help and status.

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

use chronos_native::OperatorPanel;

const HELP: &str = "\
Commands:
  connect              scan for a Chronos device and connect
  disconnect           close the connection
  scan                 scan without connecting
  enable | disable     toggle stimulation output (disable sends STOP)
  set amp <uA>         set amplitude
  set pw <us>          set pulse width
  set freq <hz>        set frequency
  send                 send the current parameters
  stop                 send a STOP command
  start                enable and send (quick start)
  estop                emergency stop
  status               show connection and parameters
  help                 show this text
  quit                 stop output, disconnect and exit";

/// Parameter field addressed by `set`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Field {
    Amplitude,
    PulseWidth,
    Frequency,
}

/// One console line.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Command {
    Connect,
    Disconnect,
    Scan,
    Enable(bool),
    Set(Field, String),
    Send,
    Stop,
    Start,
    EmergencyStop,
    Status,
    Help,
    Quit,
}

impl Command {
    fn parse(line: &str) -> Result<Option<Self>, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };

        let command = match verb.to_lowercase().as_str() {
            "connect" => Self::Connect,
            "disconnect" => Self::Disconnect,
            "scan" => Self::Scan,
            "enable" => Self::Enable(true),
            "disable" => Self::Enable(false),
            "send" => Self::Send,
            "stop" => Self::Stop,
            "start" => Self::Start,
            "estop" => Self::EmergencyStop,
            "status" => Self::Status,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            "set" => {
                let field = match words.next().map(str::to_lowercase).as_deref() {
                    Some("amp" | "amplitude") => Field::Amplitude,
                    Some("pw" | "pulse" | "pulse_width") => Field::PulseWidth,
                    Some("freq" | "frequency") => Field::Frequency,
                    Some(other) => return Err(format!("Unknown field '{other}' (amp, pw, freq)")),
                    None => return Err("Usage: set <amp|pw|freq> <value>".to_string()),
                };
                // Kept as text; the panel validates when sending
                let value = words.collect::<Vec<_>>().join(" ");
                Self::Set(field, value)
            }
            other => return Err(format!("Unknown command '{other}', type 'help'")),
        };
        Ok(Some(command))
    }
}

/// Run the console until `quit`, end of input, or Ctrl-C.
///
/// Always tears the session down before returning.
pub async fn run(mut panel: OperatorPanel) -> anyhow::Result<()> {
    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let result = loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break Ok(());
            }
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e.into()),
        };

        match Command::parse(&line) {
            Ok(Some(Command::Quit)) => break Ok(()),
            Ok(Some(command)) => execute(&mut panel, command).await,
            Ok(None) => {}
            Err(message) => println!("{message}"),
        }
    };

    info!("Closing session");
    panel.shutdown().await;
    result
}

async fn execute(panel: &mut OperatorPanel, command: Command) {
    // Failures are already reported as status events
    let outcome = match command {
        Command::Connect => panel.dispatcher().scan_and_connect().await.map(drop),
        Command::Disconnect => panel.dispatcher().disconnect().await,
        Command::Scan => match panel.dispatcher().scan().await {
            Ok(None) => {
                println!("No Chronos device found");
                Ok(())
            }
            other => other.map(drop),
        },
        Command::Enable(enabled) => panel.set_enabled(enabled).await.transpose().map(drop),
        Command::Set(field, value) => {
            let slot = match field {
                Field::Amplitude => &mut panel.form.amplitude_ua,
                Field::PulseWidth => &mut panel.form.pulse_width_us,
                Field::Frequency => &mut panel.form.frequency_hz,
            };
            *slot = value;
            Ok(())
        }
        Command::Send => panel.send().await.map(drop),
        Command::Stop => panel.stop().await.map(drop),
        Command::Start => panel.quick_start().await.transpose().map(drop),
        Command::EmergencyStop => panel.emergency_stop().await.transpose().map(drop),
        Command::Status => {
            print_status(panel);
            Ok(())
        }
        Command::Help => {
            println!("{HELP}");
            Ok(())
        }
        Command::Quit => Ok(()),
    };

    if let Err(e) = outcome {
        debug!("Command failed: {e}");
    }
}

fn print_status(panel: &OperatorPanel) {
    let snapshot = panel.dispatcher().snapshot();
    let device = snapshot.device.as_deref().unwrap_or("-");
    let session = snapshot.session.map_or_else(|| "-".to_string(), |s| s.to_string());
    let output = if panel.is_enabled() { "ENABLED" } else { "disabled" };

    println!("State:       {}", snapshot.state);
    println!("Device:      {device} ({session})");
    println!("Stimulation: {output}");
    println!(
        "Parameters:  amplitude={}µA pulse={}µs freq={}Hz",
        panel.form.amplitude_ua, panel.form.pulse_width_us, panel.form.frequency_hz
    );
}
