//! Voice Room
//!
//! Joins or hosts a small voice call on the local network. Commands are
//! read from stdin, one per line:
//!
//! ```text
//! connect <ip[:port]>   join a room
//! mute | unmute         stop or resume rendering peers
//! status                print call status as JSON
//! quit                  leave
//! ```

use anyhow::{bail, Context, Result};
use crossbeam_channel::{unbounded, Receiver};
use std::io::BufRead;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use lan_voice_room::{audio::device::list_devices, call::CallController, config::AppConfig, logging};

/// Interval between status log lines
const STATUS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    participants: Option<usize>,
    connect: Option<String>,
    list_devices: bool,
    muted: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => args.config = Some(iter.next().context("--config needs a path")?.into()),
            "--participants" => {
                let n = iter.next().context("--participants needs a number")?;
                let count = n
                    .parse()
                    .with_context(|| format!("bad participant count '{}'", n))?;
                args.participants = Some(count);
            }
            "--connect" => args.connect = Some(iter.next().context("--connect needs ip[:port]")?),
            "--list-devices" => args.list_devices = true,
            "--mute" => args.muted = true,
            other => bail!("unknown argument '{}'", other),
        }
    }
    Ok(args)
}

fn print_devices() {
    println!("\n=== Available Audio Devices ===");
    for device in list_devices() {
        let device_type = match (device.is_input, device.is_output) {
            (true, true) => "Input/Output",
            (true, false) => "Input",
            (false, true) => "Output",
            _ => "Unknown",
        };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        let format_marker = if device.supports_voice_format { "" } else { " (no 48 kHz mono)" };
        println!("  {} ({}){}{}", device.name, device_type, default_marker, format_marker);
        println!("    ID: {}", device.id);
    }
    println!();
}

enum Command {
    Connect(String),
    Mute(bool),
    Status,
    Quit,
}

/// Read commands from stdin on a separate thread
fn spawn_stdin_reader() -> Result<Receiver<Command>> {
    let (tx, rx) = unbounded();
    std::thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                let mut words = line.split_whitespace();
                let command = match (words.next(), words.next()) {
                    (Some("connect"), Some(target)) => Command::Connect(target.to_string()),
                    (Some("mute"), _) => Command::Mute(true),
                    (Some("unmute"), _) => Command::Mute(false),
                    (Some("status"), _) => Command::Status,
                    (Some("quit"), _) | (Some("exit"), _) => Command::Quit,
                    (None, _) => continue,
                    _ => {
                        eprintln!("commands: connect <ip[:port]> | mute | unmute | status | quit");
                        continue;
                    }
                };
                if tx.send(command).is_err() {
                    break;
                }
            }
            let _ = tx.send(Command::Quit);
        })
        .context("failed to spawn stdin reader")?;
    Ok(rx)
}

fn main() -> Result<()> {
    let args = parse_args()?;

    let config_path = args.config.clone().or_else(AppConfig::default_path);
    let mut config = match &config_path {
        Some(path) => AppConfig::load_or_default(path)?,
        None => AppConfig::default(),
    };
    if let Some(n) = args.participants {
        config.room.expected_participants = n;
    }
    config.validate()?;

    logging::init(&config.logging)?;
    tracing::info!("=== Voice Room starting ===");

    if args.list_devices {
        print_devices();
        return Ok(());
    }

    let call = CallController::new(config);
    call.set_muted(args.muted);
    call.start().context("failed to open network sockets")?;

    let status = call.status();
    tracing::info!(
        "Hosting on {:?}, media on {:?}, waiting for {} participants",
        status.listen_addr,
        status.media_addr,
        status.expected_participants
    );

    if let Some(target) = args.connect {
        call.request_connect(target);
    }

    let commands = spawn_stdin_reader()?;
    let mut last_status = Instant::now();

    'main: loop {
        for command in commands.try_iter() {
            match command {
                Command::Connect(target) => call.request_connect(target),
                Command::Mute(muted) => call.set_muted(muted),
                Command::Status => println!("{}", serde_json::to_string_pretty(&call.status())?),
                Command::Quit => break 'main,
            }
        }

        call.process_cycle();

        if last_status.elapsed() >= STATUS_INTERVAL {
            let status = call.status();
            tracing::info!(
                "{} | peers {}/{} | sent {} recv {} | rendered {} underrun {}",
                status.status,
                status.connected_peers,
                status.expected_participants - 1,
                status.transport.packets_sent,
                status.transport.packets_received,
                status.audio.frames_rendered,
                status.audio.underrun_samples
            );
            last_status = Instant::now();
        }

        std::thread::sleep(call.cycle_interval());
    }

    call.shutdown();
    tracing::info!("=== Voice Room ended ===");
    Ok(())
}
