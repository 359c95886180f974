//! The single event-processing path.
//!
//! A [`Session`] consumes transport events and UI commands one at a time
//! from two `mpsc` channels, so every piece of routing state is owned by one
//! task and never locked.  Model calls are the only blocking work: each
//! completed window is handed to `spawn_blocking` under a timeout and its
//! result re-enters the loop as a message, so packet intake keeps running
//! while the model computes.
//!
//! ```no_run
//! use shio_rs::prelude::*;
//! use tokio::sync::mpsc;
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let (link_tx, _link_rx) = mpsc::channel(64);
//! let (ui_tx, mut ui_rx) = mpsc::channel(256);
//! let (event_tx, event_rx) = mpsc::channel(1024);
//! let (cmd_tx, cmd_rx) = mpsc::channel(16);
//!
//! let config = SessionConfig::default();
//! let sinks = Box::new(FileSinkFactory::new(&config.log_dir));
//! let session = Session::new(config, sinks, Box::new(MeanModel), link_tx, ui_tx)?;
//! tokio::spawn(session.run(event_rx, cmd_rx));
//!
//! cmd_tx.send(Command::Mode(ModeCommand::StartPredicting)).await?;
//! # drop(event_tx);
//! while let Some(ev) = ui_rx.recv().await {
//!     println!("{ev:?}");
//! }
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Result, ShioError};
use crate::inference::InferenceModel;
use crate::protocol::{
    DEFAULT_INFERENCE_CHANNELS, DEFAULT_PLOT_FILL, DEFAULT_PLOT_WINDOW,
    DEFAULT_SAMPLES_PER_CHANNEL,
};
use crate::router::{Completion, InferenceJob, SampleRouter};
use crate::sink::{FlushPolicy, SinkFactory};
use crate::types::{
    CharacteristicKind, Command, DeviceId, LinkCommand, Role, ShioEvent, UiEvent,
};

// ── SessionConfig ─────────────────────────────────────────────────────────────

/// Sizing and policy for a [`Session`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Samples collected per channel before the plot window flushes.
    /// Default: [`DEFAULT_PLOT_FILL`].
    pub plot_fill: usize,
    /// Samples kept per channel in the plot window.
    /// Default: [`DEFAULT_PLOT_WINDOW`].
    pub plot_window: usize,
    /// Samples per channel in one model input.
    /// Default: [`DEFAULT_SAMPLES_PER_CHANNEL`].
    pub samples_per_channel: usize,
    /// Channels in one model input; channels 1..=N feed it.
    /// Default: [`DEFAULT_INFERENCE_CHANNELS`].
    pub channel_count: usize,
    /// Directory for `shio_log_ch<N>.txt` and `shio_ml_output.txt`.
    /// Default: the current directory.
    pub log_dir: PathBuf,
    /// Default: [`FlushPolicy::PerPacket`].
    pub flush_policy: FlushPolicy,
    /// Upper bound on one model call, measured from the moment the call
    /// holds the model.  Time spent queued behind another call is not
    /// counted.  Default: 5 s.
    pub inference_timeout: Duration,
    /// Completed windows allowed to wait for or occupy the model.  Further
    /// windows are dropped and counted until a call returns.  Default: `2`.
    pub max_pending_inference: usize,
    /// Return to Idle after every completed inference instead of staying in
    /// Predicting.  Default: `false`.
    pub fallback_to_idle_after_inference: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            plot_fill: DEFAULT_PLOT_FILL,
            plot_window: DEFAULT_PLOT_WINDOW,
            samples_per_channel: DEFAULT_SAMPLES_PER_CHANNEL,
            channel_count: DEFAULT_INFERENCE_CHANNELS,
            log_dir: PathBuf::from("."),
            flush_policy: FlushPolicy::PerPacket,
            inference_timeout: Duration::from_secs(5),
            max_pending_inference: 2,
            fallback_to_idle_after_inference: false,
        }
    }
}

impl SessionConfig {
    /// Reject sizes that would make a buffer unusable.  All buffers are
    /// allocated up front, so this is the only place sizing can fail.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("plot_fill", self.plot_fill),
            ("plot_window", self.plot_window),
            ("samples_per_channel", self.samples_per_channel),
            ("channel_count", self.channel_count),
            ("max_pending_inference", self.max_pending_inference),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(ShioError::InvalidConfig(format!("{name} must be at least 1")));
            }
        }
        if self.inference_timeout.is_zero() {
            return Err(ShioError::InvalidConfig(
                "inference_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// Result of one model call, fed back into the session loop.
struct InferenceDone {
    generation: u64,
    result: Result<Vec<i32>>,
}

/// Serialised coordinator between the transport, the UI and the model.
///
/// Owns the [`SampleRouter`]; all state changes happen on the task running
/// [`Session::run`] (or on the caller of [`Session::handle_event`] /
/// [`Session::handle_command`] in tests).
pub struct Session {
    router: SampleRouter,
    model: Arc<Mutex<Box<dyn InferenceModel>>>,
    timeout: Duration,
    max_pending: usize,
    dropped_windows: u64,
    link_tx: mpsc::Sender<LinkCommand>,
    ui_tx: mpsc::Sender<UiEvent>,
    done_tx: mpsc::UnboundedSender<InferenceDone>,
    done_rx: mpsc::UnboundedReceiver<InferenceDone>,
    in_flight: usize,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        sinks: Box<dyn SinkFactory>,
        model: Box<dyn InferenceModel>,
        link_tx: mpsc::Sender<LinkCommand>,
        ui_tx: mpsc::Sender<UiEvent>,
    ) -> Result<Self> {
        config.validate()?;
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Ok(Self {
            router: SampleRouter::new(&config, sinks),
            model: Arc::new(Mutex::new(model)),
            timeout: config.inference_timeout,
            max_pending: config.max_pending_inference,
            dropped_windows: 0,
            link_tx,
            ui_tx,
            done_tx,
            done_rx,
            in_flight: 0,
        })
    }

    pub fn router(&self) -> &SampleRouter {
        &self.router
    }

    /// Model calls dispatched but not yet answered.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Completed windows discarded because the model backlog was full.
    pub fn dropped_windows(&self) -> u64 {
        self.dropped_windows
    }

    /// Process events, commands and model results until either input
    /// channel closes.  On exit every known device is unsubscribed.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<ShioEvent>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        info!("session started");
        loop {
            tokio::select! {
                ev = events.recv() => match ev {
                    Some(ev) => self.handle_event(ev),
                    None => break,
                },
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                Some(done) = self.done_rx.recv() => self.handle_inference_done(done),
            }
        }

        let registry = self.router.registry();
        let devices: Vec<DeviceId> = registry
            .channels()
            .filter_map(|channel| registry.identity(channel).cloned())
            .collect();
        for id in devices {
            self.link(LinkCommand::Unsubscribe(id));
        }
        info!("session finished");
    }

    // ── Transport events ──────────────────────────────────────────────────────

    pub fn handle_event(&mut self, event: ShioEvent) {
        match event {
            ShioEvent::Discovered(id) => {
                let (channel, is_new) = self.router.discover(&id);
                if is_new {
                    self.emit(UiEvent::DeviceDiscovered { channel, device: id });
                }
            }
            ShioEvent::Connected(id) => {
                let (channel, is_new) = self.router.discover(&id);
                if is_new {
                    self.emit(UiEvent::DeviceDiscovered {
                        channel,
                        device: id.clone(),
                    });
                }
                info!("connected to shio no. {channel}");
                self.emit(UiEvent::Connected { channel });
                self.link(LinkCommand::Subscribe(id));
            }
            ShioEvent::Disconnected(id) => match self.router.lookup(&id) {
                Ok(channel) => {
                    info!("disconnected from shio no. {channel}");
                    self.emit(UiEvent::Disconnected { channel });
                }
                Err(e) => debug!("disconnect: {e}"),
            },
            ShioEvent::Packet { device, kind, data } => {
                match kind {
                    CharacteristicKind::MicData => {}
                    CharacteristicKind::Role => {
                        match data.first().copied().and_then(Role::from_byte) {
                            Some(role) => info!("{device} reports role {role:?}"),
                            None => debug!("{device}: unrecognised role payload {data:?}"),
                        }
                        return;
                    }
                    CharacteristicKind::Other(uuid) => {
                        debug!("unhandled characteristic {uuid} from {device}");
                        return;
                    }
                }
                match self.router.route_packet(&device, &data) {
                    Ok(routed) => {
                        for flush in routed.plots {
                            self.emit(UiEvent::Plot(flush));
                        }
                        for job in routed.jobs {
                            self.dispatch(job);
                        }
                    }
                    Err(e) => debug!("packet dropped: {e}"),
                }
            }
            ShioEvent::RoleWriteFailed { device, reason } => {
                warn!("role write to {device} failed: {reason}");
                if let Ok(channel) = self.router.lookup(&device) {
                    self.emit(UiEvent::RoleWriteFailed { channel, reason });
                }
            }
        }
    }

    // ── UI commands ───────────────────────────────────────────────────────────

    pub fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Mode(mode_cmd) => {
                if let Some(t) = self.router.apply_mode(mode_cmd) {
                    self.emit(UiEvent::ModeChanged(t.to));
                }
            }
            Command::SetRole { channel, role } => match self.router.set_role(channel, role) {
                Ok(write) => {
                    info!("channel {channel} → {role:?}");
                    self.link(LinkCommand::WriteRole {
                        device: write.device,
                        byte: write.byte,
                    });
                }
                Err(e) => {
                    warn!("set role: {e}");
                    self.emit(UiEvent::RoleWriteFailed {
                        channel,
                        reason: e.to_string(),
                    });
                }
            },
        }
    }

    // ── Inference ─────────────────────────────────────────────────────────────

    /// Run the model on a blocking thread.
    ///
    /// Calls are serialised by the model lock.  The timeout starts once the
    /// call holds the lock, so a window queued behind a slow call keeps its
    /// full budget.  A call that outlives the timeout keeps its thread until
    /// the model returns, but its result is never used.
    fn dispatch(&mut self, job: InferenceJob) {
        if self.in_flight >= self.max_pending {
            self.dropped_windows += 1;
            warn!(
                "model busy ({} pending), window of generation {} dropped ({} so far)",
                self.in_flight, job.generation, self.dropped_windows
            );
            return;
        }

        let model = Arc::clone(&self.model);
        let done_tx = self.done_tx.clone();
        let timeout = self.timeout;
        self.in_flight += 1;

        tokio::spawn(async move {
            let InferenceJob { generation, input } = job;
            let (started_tx, started_rx) = oneshot::channel::<()>();
            let mut call = tokio::task::spawn_blocking(move || {
                let mut model = model
                    .lock()
                    .map_err(|_| ShioError::Inference("model lock poisoned".into()))?;
                let _ = started_tx.send(());
                model.infer(&input)
            });

            let result = if started_rx.await.is_ok() {
                match tokio::time::timeout(timeout, &mut call).await {
                    Ok(joined) => joined,
                    Err(_) => Ok(Err(ShioError::InferenceTimeout(timeout.as_millis()))),
                }
            } else {
                // The call never got the model; its error is already final.
                call.await
            };
            let result = result.unwrap_or_else(|join| {
                Err(ShioError::Inference(format!("model task failed: {join}")))
            });
            let _ = done_tx.send(InferenceDone { generation, result });
        });
    }

    fn handle_inference_done(&mut self, done: InferenceDone) {
        self.in_flight = self.in_flight.saturating_sub(1);
        match done.result {
            Ok(output) => match self.router.record_inference_output(done.generation, &output) {
                Completion::Stale => debug!("late inference result ignored"),
                Completion::Recorded(transition) => {
                    info!("inference output: {output:?}");
                    self.emit(UiEvent::InferenceCompleted { output });
                    if let Some(t) = transition {
                        self.emit(UiEvent::ModeChanged(t.to));
                    }
                }
            },
            Err(e) => {
                warn!("inference failed: {e}");
                if let Some(t) = self.router.abort_inference(done.generation) {
                    self.emit(UiEvent::InferenceFailed(e.to_string()));
                    self.emit(UiEvent::ModeChanged(t.to));
                }
            }
        }
    }

    // ── Outputs ───────────────────────────────────────────────────────────────

    fn emit(&self, event: UiEvent) {
        if let Err(e) = self.ui_tx.try_send(event) {
            debug!("UI event not delivered: {e}");
        }
    }

    fn link(&self, cmd: LinkCommand) {
        if let Err(e) = self.link_tx.try_send(cmd) {
            warn!("link command not delivered: {e}");
        }
    }
}
