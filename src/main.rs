use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::{error, info, warn};
use tokio::sync::mpsc;

use shio_rs::prelude::*;

/// Line-oriented control console for shio sensors.
#[derive(Parser, Debug)]
#[command(name = "shio", version, about)]
struct Args {
    /// Use synthetic devices instead of Bluetooth.
    #[arg(long)]
    simulate: bool,

    /// Number of synthetic devices in --simulate mode.
    #[arg(long, default_value_t = 2)]
    sim_devices: usize,

    /// Directory for sample logs and ML output.
    #[arg(long, env = "SHIO_LOG_DIR", default_value = ".")]
    log_dir: PathBuf,

    /// Scan duration for the `scan` command, in seconds.
    #[arg(long, default_value_t = 10)]
    scan_secs: u64,

    /// Only accept devices whose advertised name starts with this prefix.
    #[arg(long)]
    name_prefix: Option<String>,

    /// Samples per channel in one model input.
    #[arg(long, default_value_t = 1024)]
    samples_per_channel: usize,

    /// Channels in one model input.
    #[arg(long, default_value_t = 2)]
    channels: usize,

    /// Samples per channel collected before a plot update.
    #[arg(long, default_value_t = 20)]
    plot_fill: usize,

    /// Samples per channel kept in the plot window.
    #[arg(long, default_value_t = 1000)]
    plot_window: usize,

    /// Upper bound on one model call, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    inference_timeout_ms: u64,

    /// Completed windows allowed to wait for the model before new ones are
    /// dropped.
    #[arg(long, default_value_t = 2)]
    max_pending_inference: usize,

    /// Flush log files on mode exit only, not after every packet.
    #[arg(long)]
    buffered: bool,

    /// Return to idle after every completed inference.
    #[arg(long)]
    fallback_to_idle: bool,
}

impl Args {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            plot_fill: self.plot_fill,
            plot_window: self.plot_window,
            samples_per_channel: self.samples_per_channel,
            channel_count: self.channels,
            log_dir: self.log_dir.clone(),
            flush_policy: if self.buffered {
                FlushPolicy::Buffered
            } else {
                FlushPolicy::PerPacket
            },
            inference_timeout: Duration::from_millis(self.inference_timeout_ms),
            max_pending_inference: self.max_pending_inference,
            fallback_to_idle_after_inference: self.fallback_to_idle,
        }
    }
}

// ── Console input ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Input {
    Session(Command),
    Scan,
    ConnectAll,
    DisconnectAll,
    Devices,
    Help,
    Quit,
}

fn parse_line(line: &str) -> Option<Input> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let mode = |cmd| Some(Input::Session(Command::Mode(cmd)));
    match words.as_slice() {
        ["q"] | ["quit"] => Some(Input::Quit),
        ["h"] | ["help"] | ["?"] => Some(Input::Help),
        ["scan"] => Some(Input::Scan),
        ["connect"] | ["connect", "all"] => Some(Input::ConnectAll),
        ["disconnect"] | ["disconnect", "all"] => Some(Input::DisconnectAll),
        ["devices"] => Some(Input::Devices),
        ["start", "logging"] => mode(ModeCommand::StartLogging),
        ["stop", "logging"] => mode(ModeCommand::StopLogging),
        ["start", "plotting"] => mode(ModeCommand::StartPlotting),
        ["stop", "plotting"] => mode(ModeCommand::StopPlotting),
        ["start", "predicting"] => mode(ModeCommand::StartPredicting),
        ["stop", "predicting"] => mode(ModeCommand::StopPredicting),
        ["reset"] => mode(ModeCommand::Reset),
        [role @ ("master" | "slave"), channel] => {
            let channel = channel.parse().ok()?;
            let role = if *role == "master" {
                Role::Master
            } else {
                Role::Slave
            };
            Some(Input::Session(Command::SetRole { channel, role }))
        }
        _ => None,
    }
}

fn print_help() {
    info!("Commands (type + Enter):");
    info!("  scan                      – scan for shio devices");
    info!("  connect all               – stop scanning and connect every device");
    info!("  disconnect all            – disconnect every device");
    info!("  devices                   – list known devices");
    info!("  start|stop logging        – per-channel sample logs");
    info!("  start|stop plotting       – live plot windows");
    info!("  start|stop predicting     – inference on full windows");
    info!("  reset                     – back to idle");
    info!("  master <N> | slave <N>    – set the role of channel N");
    info!("  q                         – quit");
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=shio_rs=debug cargo run
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.session_config();

    // ── Transport ─────────────────────────────────────────────────────────────
    let (events, link_tx, handle) = if args.simulate {
        info!("Simulating {} shio device(s).", args.sim_devices);
        let (event_tx, event_rx) = mpsc::channel(1024);
        let (link_tx, link_rx) = mpsc::channel(64);
        spawn_simulator(args.sim_devices, event_tx, link_rx);
        (event_rx, link_tx, None)
    } else {
        let client = ShioClient::new(ShioClientConfig {
            scan_timeout_secs: args.scan_secs,
            name_prefix: args.name_prefix.clone(),
            ..ShioClientConfig::default()
        });
        let (event_rx, handle, link_tx) = client.start().await?;
        (event_rx, link_tx, Some(Arc::new(handle)))
    };

    // ── Session ───────────────────────────────────────────────────────────────
    let (ui_tx, mut ui_rx) = mpsc::channel::<UiEvent>(256);
    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(16);
    let sinks = Box::new(FileSinkFactory::new(&config.log_dir));
    info!("Writing logs to {}", sinks.dir().display());
    let session = Session::new(config, sinks, Box::new(MeanModel), link_tx, ui_tx)?;
    let session_task = tokio::spawn(session.run(events, cmd_rx));

    print_help();

    // ── Stdin command loop ────────────────────────────────────────────────────
    // Lines are read on a dedicated OS thread (to avoid holding a non-Send
    // StdinLock across await points), then relayed to an async task.
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();

    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) => {
                    if line_tx.send(l.trim().to_owned()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let handle_cmd = handle.clone();
    tokio::spawn(async move {
        while let Some(line) = line_rx.recv().await {
            if line.is_empty() {
                continue;
            }
            let Some(input) = parse_line(&line) else {
                warn!("Unknown command: '{line}' (type 'help')");
                continue;
            };
            match input {
                Input::Quit => {
                    info!("Quit requested.");
                    break;
                }
                Input::Help => print_help(),
                Input::Session(cmd) => {
                    if cmd_tx.send(cmd).await.is_err() {
                        break;
                    }
                }
                transport => {
                    let Some(h) = handle_cmd.as_deref() else {
                        info!("Simulated devices are always connected.");
                        continue;
                    };
                    let result = match transport {
                        Input::Scan => h.scan().await.map(|ids| {
                            for id in ids {
                                info!("  {id}");
                            }
                        }),
                        Input::ConnectAll => h
                            .connect_all()
                            .await
                            .map(|n| info!("{n} device(s) connected")),
                        Input::DisconnectAll => h.disconnect_all().await,
                        Input::Devices => {
                            for id in h.devices().await {
                                info!("  {id}");
                            }
                            Ok(())
                        }
                        _ => Ok(()),
                    };
                    if let Err(e) = result {
                        error!("{line}: {e}");
                    }
                }
            }
        }
        // Dropping `cmd_tx` ends the session loop.
    });

    // ── Main event loop ───────────────────────────────────────────────────────
    while let Some(event) = ui_rx.recv().await {
        match event {
            UiEvent::DeviceDiscovered { channel, device } => {
                println!("[DEVICE] shio no. {channel} = {device}");
            }
            UiEvent::Connected { channel } => println!("[LINK] shio no. {channel} connected"),
            UiEvent::Disconnected { channel } => {
                println!("[LINK] shio no. {channel} disconnected")
            }
            UiEvent::ModeChanged(mode) => println!("[MODE] {mode}"),
            UiEvent::Plot(flush) => {
                let last = flush.samples.last().copied().unwrap_or(0);
                println!(
                    "[PLOT] ch={} start={:8} len={:5} last={last:+6}",
                    flush.channel,
                    flush.start,
                    flush.samples.len()
                );
            }
            UiEvent::InferenceCompleted { output } => println!("[ML] {output:?}"),
            UiEvent::InferenceFailed(reason) => println!("[ML] failed: {reason}"),
            UiEvent::RoleWriteFailed { channel, reason } => {
                println!("[ROLE] shio no. {channel}: {reason}")
            }
        }
    }

    session_task.await.ok();
    if let Some(h) = handle {
        h.disconnect_all().await.ok();
    }
    info!("Event loop finished – exiting.");
    Ok(())
}
