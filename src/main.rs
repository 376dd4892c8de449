use std::time::Duration;

use clap::{Parser, Subcommand};
use log::info;
use tokio::sync::mpsc;

use jkread::ble::BleCentral;
use jkread::{
    jk02, Control, Decoder, DeviceEvents, DeviceIdentity, DeviceSession, DisconnectReason, Record,
    RecordKind, SessionError, Status,
};

/// How long a toggle command waits for the refreshed settings broadcast
/// before closing the session.
const TOGGLE_LINGER: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(name = "jkread", about = "JK BMS monitor and switch control over BLE")]
struct Cli {
    /// Reconnect to a previously used device id without prompting; falls
    /// back to scanning when the device is unknown.
    #[arg(long, global = true)]
    previous: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect and print decoded records until Ctrl-C
    Monitor,
    /// Switch charging on or off, then print the refreshed settings
    Charging {
        #[arg(value_parser = parse_switch)]
        state: bool,
    },
    /// Switch discharging on or off, then print the refreshed settings
    Discharging {
        #[arg(value_parser = parse_switch)]
        state: bool,
    },
}

fn parse_switch(value: &str) -> Result<bool, String> {
    match value {
        "on" => Ok(true),
        "off" => Ok(false),
        other => Err(format!("expected 'on' or 'off', got {other:?}")),
    }
}

/// Prints session events to stdout.
struct Console;

impl DeviceEvents for Console {
    fn on_status_change(&mut self, status: Status) {
        info!("status: {status:?}");
    }

    fn on_connected(&mut self, identity: &DeviceIdentity) {
        println!("connected to {identity}");
    }

    fn on_disconnected(&mut self, reason: DisconnectReason) {
        println!("disconnected ({reason:?})");
    }

    fn on_previous_unavailable(&mut self, device: Option<&DeviceIdentity>) {
        match device {
            Some(device) => println!("{device} is paired but not in range"),
            None => println!("previous device is not known to this host"),
        }
    }

    fn on_request_device_error(&mut self, error: &SessionError) {
        eprintln!("device request failed: {error}");
    }

    fn on_data(&mut self, kind: RecordKind, record: &Record) {
        println!("{kind:?}");
        for (key, value) in record {
            println!("  {key}: {value}");
        }
    }

    fn on_error(&mut self, error: &SessionError) {
        eprintln!("error: {error}");
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let transport = BleCentral::new().await?;
    let decoder = Decoder::new(jk02::protocol())?;
    let mut session = DeviceSession::new(decoder, transport, Console);

    let previous = cli.previous.map(|id| DeviceIdentity { id, name: None });
    if session.connect(previous.as_ref()).await?.is_none() {
        // Console already reported why.
        return Ok(());
    }

    let (tx, mut controls) = mpsc::channel(4);
    match cli.command {
        Command::Monitor => {
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    let _ = tx.send(Control::Disconnect).await;
                }
            });
        }
        Command::Charging { state } => {
            session.toggle_charging(state).await?;
            linger_then_disconnect(tx);
        }
        Command::Discharging { state } => {
            session.toggle_discharging(state).await?;
            linger_then_disconnect(tx);
        }
    }

    let reason = session.run(&mut controls).await?;
    info!("session ended: {reason:?}");
    Ok(())
}

fn linger_then_disconnect(tx: mpsc::Sender<Control>) {
    tokio::spawn(async move {
        tokio::time::sleep(TOGGLE_LINGER).await;
        let _ = tx.send(Control::Disconnect).await;
    });
}
