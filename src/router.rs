//! The synchronous routing core.
//!
//! [`SampleRouter`] owns the device registry, the operating mode, one plot
//! window per channel, the log router and the inference session.  Every
//! decoded packet goes through [`SampleRouter::route_packet`], which looks up
//! the channel and hands the samples to exactly one consumer, chosen by the
//! current mode.
//!
//! The router does no I/O besides writing sinks and never blocks on the
//! model: completed inference windows are returned to the caller as
//! [`InferenceJob`]s and their results come back through
//! [`SampleRouter::record_inference_output`] or
//! [`SampleRouter::abort_inference`].

use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::{debug, info, warn};

use crate::error::Result;
use crate::inference::{InferenceInput, InferenceSession};
use crate::mode::{ModeCommand, ModeMachine, OperatingMode, Transition};
use crate::parse::decode_samples;
use crate::plot::{PlotFlush, PlotWindow};
use crate::protocol::{log_file_name, ML_OUTPUT_FILE};
use crate::registry::{DeviceRegistry, RoleWrite};
use crate::session::SessionConfig;
use crate::sink::{FlushPolicy, LineSink, SinkFactory};
use crate::types::{DeviceId, Role};

// ── Log router ────────────────────────────────────────────────────────────────

/// Writes decoded samples, one decimal value per line, to one sink per
/// channel while Logging is active.
pub struct LogRouter {
    sinks: BTreeMap<usize, Box<dyn LineSink>>,
    /// Channels whose sink could not be created in this logging run.
    unavailable: BTreeSet<usize>,
    policy: FlushPolicy,
}

impl LogRouter {
    pub fn new(policy: FlushPolicy) -> Self {
        Self {
            sinks: BTreeMap::new(),
            unavailable: BTreeSet::new(),
            policy,
        }
    }

    /// Recreate a fresh sink for every channel in `channels`.
    ///
    /// Creation failures are logged; the affected channel is skipped until
    /// the next start.
    pub fn start(&mut self, factory: &mut dyn SinkFactory, channels: impl IntoIterator<Item = usize>) {
        self.stop();
        for channel in channels {
            self.open(factory, channel);
        }
    }

    /// Flush and close every sink.
    pub fn stop(&mut self) {
        for (channel, sink) in &mut self.sinks {
            if let Err(e) = sink.flush() {
                warn!("log ch{channel}: flush on stop failed: {e}");
            }
        }
        self.sinks.clear();
        self.unavailable.clear();
    }

    /// Append `samples` to the channel's sink, creating it on first use.
    pub fn route(&mut self, factory: &mut dyn SinkFactory, channel: usize, samples: &[i16]) {
        if !self.sinks.contains_key(&channel) && !self.open(factory, channel) {
            return;
        }
        let Some(sink) = self.sinks.get_mut(&channel) else {
            return;
        };
        for s in samples {
            if let Err(e) = sink.write_line(&s.to_string()) {
                warn!("log ch{channel}: write failed: {e}");
                return;
            }
        }
        if self.policy == FlushPolicy::PerPacket {
            if let Err(e) = sink.flush() {
                warn!("log ch{channel}: flush failed: {e}");
            }
        }
    }

    fn open(&mut self, factory: &mut dyn SinkFactory, channel: usize) -> bool {
        if self.unavailable.contains(&channel) {
            return false;
        }
        match factory.create(&log_file_name(channel)) {
            Ok(sink) => {
                self.sinks.insert(channel, sink);
                true
            }
            Err(e) => {
                warn!("log ch{channel}: cannot create sink: {e}");
                self.unavailable.insert(channel);
                false
            }
        }
    }
}

// ── Routing results ───────────────────────────────────────────────────────────

/// A completed inference window waiting for the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceJob {
    /// Predicting session the window belongs to.  Results for a session that
    /// has since ended are discarded.
    pub generation: u64,
    pub input: InferenceInput,
}

/// What one packet produced.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Routed {
    pub channel: usize,
    pub samples: usize,
    pub plots: Vec<PlotFlush>,
    pub jobs: Vec<InferenceJob>,
}

/// Outcome of handing a model result back to the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The Predicting session that produced the job is gone.
    Stale,
    /// Written to the ML sink.  Carries the transition to Idle when the
    /// router is configured to fall back after each cycle.
    Recorded(Option<Transition>),
}

// ── Router ────────────────────────────────────────────────────────────────────

/// Routing state for one session: registry, mode, plot windows, log router,
/// inference session and the ML sink.
///
/// Nothing here blocks or awaits.  The owner feeds it packets and commands
/// one at a time and runs the returned [`InferenceJob`]s elsewhere.
pub struct SampleRouter {
    registry: DeviceRegistry,
    mode: ModeMachine,
    plots: Vec<PlotWindow>,
    log: LogRouter,
    inference: InferenceSession,
    generation: u64,
    ml_sink: Option<Box<dyn LineSink>>,
    sinks: Box<dyn SinkFactory>,
    packet_counts: HashMap<usize, u64>,
    plot_fill: usize,
    plot_window: usize,
    fallback_to_idle: bool,
}

impl SampleRouter {
    pub fn new(config: &SessionConfig, sinks: Box<dyn SinkFactory>) -> Self {
        Self {
            registry: DeviceRegistry::new(),
            mode: ModeMachine::new(),
            plots: Vec::new(),
            log: LogRouter::new(config.flush_policy),
            inference: InferenceSession::new(config.channel_count, config.samples_per_channel),
            generation: 0,
            ml_sink: None,
            sinks,
            packet_counts: HashMap::new(),
            plot_fill: config.plot_fill,
            plot_window: config.plot_window,
            fallback_to_idle: config.fallback_to_idle_after_inference,
        }
    }

    // ── Devices ───────────────────────────────────────────────────────────────

    /// Register a device.  Returns its channel and whether it is new.
    pub fn discover(&mut self, id: &DeviceId) -> (usize, bool) {
        let known = self.registry.len();
        let channel = self.registry.discover(id);
        let is_new = self.registry.len() > known;
        if is_new {
            self.plots
                .push(PlotWindow::new(channel, self.plot_fill, self.plot_window));
        }
        (channel, is_new)
    }

    pub fn lookup(&self, id: &DeviceId) -> Result<usize> {
        self.registry.lookup(id)
    }

    pub fn set_role(&mut self, channel: usize, role: Role) -> Result<RoleWrite> {
        self.registry.set_role(channel, role)
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    // ── Mode ──────────────────────────────────────────────────────────────────

    pub fn mode(&self) -> OperatingMode {
        self.mode.current()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn inference(&self) -> &InferenceSession {
        &self.inference
    }

    pub fn plot(&self, channel: usize) -> Option<&PlotWindow> {
        channel.checked_sub(1).and_then(|i| self.plots.get(i))
    }

    /// Apply a mode command and run the exit/entry effects of the resulting
    /// transition.
    pub fn apply_mode(&mut self, cmd: ModeCommand) -> Option<Transition> {
        let transition = self.mode.apply(cmd)?;
        let from = transition.from;

        if from == OperatingMode::Logging {
            self.log.stop();
        }
        if from == OperatingMode::Predicting {
            // Partial windows are discarded, never flushed to the model.
            self.inference.reset();
            self.close_ml_sink();
        }

        match transition.to {
            OperatingMode::Logging => {
                let channels: Vec<usize> = self.registry.channels().collect();
                self.log.start(self.sinks.as_mut(), channels);
            }
            OperatingMode::Plotting => {
                for p in &mut self.plots {
                    p.reset();
                }
            }
            OperatingMode::Predicting => {
                self.generation += 1;
                self.inference.reset();
                match self.sinks.create(ML_OUTPUT_FILE) {
                    Ok(sink) => self.ml_sink = Some(sink),
                    Err(e) => warn!("ML output sink unavailable: {e}"),
                }
            }
            OperatingMode::Idle => {}
        }

        info!("mode: {} → {}", transition.from, transition.to);
        Some(transition)
    }

    // ── Packets ───────────────────────────────────────────────────────────────

    /// Decode one microphone packet and route its samples according to the
    /// current mode.
    ///
    /// Fails only when the device is unknown; callers drop such packets.
    pub fn route_packet(&mut self, id: &DeviceId, data: &[u8]) -> Result<Routed> {
        let channel = self.registry.lookup(id)?;

        let count = self.packet_counts.entry(channel).or_insert(0);
        *count += 1;
        if *count <= 3 || *count % 500 == 0 {
            debug!("ch{channel}: packet #{count} len={}", data.len());
        }

        let samples = decode_samples(data);
        let mut routed = Routed {
            channel,
            samples: samples.len(),
            ..Routed::default()
        };

        match self.mode.current() {
            OperatingMode::Idle => {}
            OperatingMode::Logging => {
                self.log.route(self.sinks.as_mut(), channel, &samples);
            }
            OperatingMode::Plotting => {
                if let Some(window) = self.plots.get_mut(channel - 1) {
                    routed
                        .plots
                        .extend(samples.iter().filter_map(|&s| window.push(s)));
                }
            }
            OperatingMode::Predicting => {
                let index = channel - 1;
                if index >= self.inference.channels() {
                    debug!("ch{channel}: outside the model input, dropped");
                }
                for &s in &samples {
                    if let Some(input) = self.inference.push(index, s) {
                        info!(
                            "inference window #{} complete (generation {})",
                            self.inference.cycles(),
                            self.generation
                        );
                        routed.jobs.push(InferenceJob {
                            generation: self.generation,
                            input,
                        });
                    }
                }
            }
        }

        Ok(routed)
    }

    // ── Inference results ─────────────────────────────────────────────────────

    fn is_current(&self, generation: u64) -> bool {
        generation == self.generation && self.mode.current() == OperatingMode::Predicting
    }

    /// Write a model result, one value per line, to the ML sink.
    pub fn record_inference_output(&mut self, generation: u64, output: &[i32]) -> Completion {
        if !self.is_current(generation) {
            debug!("discarding inference result from generation {generation}");
            return Completion::Stale;
        }
        if let Some(sink) = self.ml_sink.as_mut() {
            let written = output
                .iter()
                .try_for_each(|v| sink.write_line(&v.to_string()))
                .and_then(|_| sink.flush());
            if let Err(e) = written {
                warn!("ML output write failed: {e}");
            }
        }
        let transition = if self.fallback_to_idle {
            self.apply_mode(ModeCommand::Reset)
        } else {
            None
        };
        Completion::Recorded(transition)
    }

    /// Handle a failed or timed-out model call: reset the session and fall
    /// back to Idle.  Failures from a superseded session are ignored.
    pub fn abort_inference(&mut self, generation: u64) -> Option<Transition> {
        if !self.is_current(generation) {
            return None;
        }
        self.inference.reset();
        self.apply_mode(ModeCommand::Reset)
    }

    fn close_ml_sink(&mut self) {
        if let Some(mut sink) = self.ml_sink.take() {
            if let Err(e) = sink.flush() {
                warn!("ML output flush failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::BufferState;
    use crate::parse::encode_samples;
    use crate::sink::testing::MemorySinkFactory;

    fn config() -> SessionConfig {
        SessionConfig {
            plot_fill: 2,
            plot_window: 4,
            samples_per_channel: 4,
            channel_count: 2,
            ..SessionConfig::default()
        }
    }

    fn router_with(config: SessionConfig) -> (SampleRouter, MemorySinkFactory) {
        let sinks = MemorySinkFactory::new();
        let mut r = SampleRouter::new(&config, Box::new(sinks.clone()));
        r.discover(&"a".into());
        r.discover(&"b".into());
        (r, sinks)
    }

    fn router() -> (SampleRouter, MemorySinkFactory) {
        router_with(config())
    }

    fn packet(samples: &[i16]) -> Vec<u8> {
        encode_samples(samples)
    }

    #[test]
    fn idle_routes_nowhere() {
        let (mut r, sinks) = router();
        let routed = r.route_packet(&"a".into(), &packet(&[1, 2, 3, 4])).unwrap();
        assert_eq!(routed.samples, 4);
        assert!(routed.plots.is_empty());
        assert!(routed.jobs.is_empty());
        assert_eq!(r.plot(1).unwrap().cursor(), 0);
        assert_eq!(r.inference().buffer(0).unwrap().state(), BufferState::Empty);
        assert!(sinks.created().is_empty());
    }

    #[test]
    fn unknown_device_is_an_error() {
        let (mut r, _) = router();
        assert!(r.route_packet(&"ghost".into(), &packet(&[1])).is_err());
    }

    #[test]
    fn logging_writes_one_sample_per_line_per_channel() {
        let (mut r, sinks) = router();
        r.apply_mode(ModeCommand::StartLogging);
        assert_eq!(sinks.created(), vec!["shio_log_ch1.txt", "shio_log_ch2.txt"]);

        r.route_packet(&"a".into(), &[0x01, 0x00, 0xFF, 0xFF, 0x07]).unwrap();
        r.route_packet(&"b".into(), &packet(&[-32768])).unwrap();
        assert_eq!(sinks.lines("shio_log_ch1.txt"), vec!["1", "-1"]);
        assert_eq!(sinks.lines("shio_log_ch2.txt"), vec!["-32768"]);
    }

    #[test]
    fn buffered_logging_becomes_visible_on_stop() {
        let (mut r, sinks) = router_with(SessionConfig {
            flush_policy: FlushPolicy::Buffered,
            ..config()
        });
        r.apply_mode(ModeCommand::StartLogging);
        r.route_packet(&"a".into(), &packet(&[5, 6])).unwrap();
        r.route_packet(&"b".into(), &packet(&[-7])).unwrap();
        assert!(sinks.lines("shio_log_ch1.txt").is_empty());
        assert!(sinks.lines("shio_log_ch2.txt").is_empty());

        r.apply_mode(ModeCommand::StopLogging);
        assert_eq!(sinks.lines("shio_log_ch1.txt"), vec!["5", "6"]);
        assert_eq!(sinks.lines("shio_log_ch2.txt"), vec!["-7"]);
    }

    #[test]
    fn per_packet_logging_is_visible_immediately() {
        let (mut r, sinks) = router();
        r.apply_mode(ModeCommand::StartLogging);
        r.route_packet(&"a".into(), &packet(&[5, 6])).unwrap();
        assert_eq!(sinks.lines("shio_log_ch1.txt"), vec!["5", "6"]);
    }

    #[test]
    fn logging_restart_recreates_sinks() {
        let (mut r, sinks) = router();
        r.apply_mode(ModeCommand::StartLogging);
        r.route_packet(&"a".into(), &packet(&[5])).unwrap();
        r.apply_mode(ModeCommand::StopLogging);
        r.route_packet(&"a".into(), &packet(&[6])).unwrap();
        r.apply_mode(ModeCommand::StartLogging);
        assert!(sinks.lines("shio_log_ch1.txt").is_empty());
        r.route_packet(&"a".into(), &packet(&[7])).unwrap();
        assert_eq!(sinks.lines("shio_log_ch1.txt"), vec!["7"]);
    }

    #[test]
    fn device_discovered_during_logging_gets_a_sink() {
        let (mut r, sinks) = router();
        r.apply_mode(ModeCommand::StartLogging);
        let (ch, new) = r.discover(&"c".into());
        assert_eq!((ch, new), (3, true));
        r.route_packet(&"c".into(), &packet(&[9])).unwrap();
        assert_eq!(sinks.lines("shio_log_ch3.txt"), vec!["9"]);
    }

    #[test]
    fn sink_failure_is_not_fatal() {
        let mut r = SampleRouter::new(&config(), Box::new(MemorySinkFactory::failing()));
        r.discover(&"a".into());
        r.apply_mode(ModeCommand::StartLogging);
        assert!(r.route_packet(&"a".into(), &packet(&[1])).is_ok());
        r.apply_mode(ModeCommand::StartPredicting);
        for s in 0..4 {
            r.route_packet(&"a".into(), &packet(&[s])).unwrap();
        }
        assert_eq!(r.mode(), OperatingMode::Predicting);
    }

    #[test]
    fn plotting_keeps_channels_separate() {
        let (mut r, _) = router();
        r.apply_mode(ModeCommand::StartPlotting);
        let routed = r.route_packet(&"a".into(), &packet(&[1, 2, 3, 4, 5, 6])).unwrap();
        assert_eq!(routed.plots.len(), 3);
        assert_eq!(routed.plots[2].samples, vec![3, 4, 5, 6]);
        assert_eq!(routed.plots[2].start, 2);
        assert!(routed.plots.iter().all(|p| p.channel == 1));

        let routed = r.route_packet(&"b".into(), &packet(&[9])).unwrap();
        assert!(routed.plots.is_empty());
        assert_eq!(r.plot(2).unwrap().fill_len(), 1);
    }

    #[test]
    fn entering_plotting_starts_a_fresh_view() {
        let (mut r, _) = router();
        r.apply_mode(ModeCommand::StartPlotting);
        r.route_packet(&"a".into(), &packet(&[1, 2, 3])).unwrap();
        r.apply_mode(ModeCommand::StartPlotting);
        assert_eq!(r.plot(1).unwrap().cursor(), 0);
    }

    #[test]
    fn predicting_fires_barrier_once_per_cycle() {
        let (mut r, sinks) = router();
        r.apply_mode(ModeCommand::StartPredicting);
        assert_eq!(sinks.created(), vec![ML_OUTPUT_FILE]);

        assert!(r.route_packet(&"a".into(), &packet(&[1, 2, 3])).unwrap().jobs.is_empty());
        assert!(r.route_packet(&"b".into(), &packet(&[5, 6, 7, 8])).unwrap().jobs.is_empty());
        let routed = r.route_packet(&"a".into(), &packet(&[4])).unwrap();
        assert_eq!(routed.jobs.len(), 1);
        let job = &routed.jobs[0];
        assert_eq!(job.generation, 1);
        assert_eq!(job.input.data(), &[1, 2, 3, 4, 5, 6, 7, 8]);

        r.route_packet(&"b".into(), &packet(&[9])).unwrap();
        assert_eq!(r.inference().buffer(1).unwrap().state(), BufferState::Filling);
        assert_eq!(r.inference().buffer(0).unwrap().state(), BufferState::Empty);
    }

    #[test]
    fn channels_beyond_model_input_are_dropped() {
        let (mut r, _) = router();
        r.discover(&"c".into());
        r.apply_mode(ModeCommand::StartPredicting);
        let routed = r.route_packet(&"c".into(), &packet(&[1, 2, 3, 4])).unwrap();
        assert!(routed.jobs.is_empty());
        assert_eq!(r.inference().buffer(0).unwrap().write_index(), 0);
        assert_eq!(r.inference().buffer(1).unwrap().write_index(), 0);
    }

    #[test]
    fn leaving_predicting_discards_partial_windows() {
        let (mut r, _) = router();
        r.apply_mode(ModeCommand::StartPredicting);
        r.route_packet(&"a".into(), &packet(&[1, 2])).unwrap();
        r.apply_mode(ModeCommand::StopPredicting);
        assert_eq!(r.inference().buffer(0).unwrap().state(), BufferState::Empty);
    }

    #[test]
    fn results_are_written_and_session_stays_predicting() {
        let (mut r, sinks) = router();
        r.apply_mode(ModeCommand::StartPredicting);
        let g = r.generation();
        assert_eq!(r.record_inference_output(g, &[7, -3]), Completion::Recorded(None));
        assert_eq!(r.mode(), OperatingMode::Predicting);
        assert_eq!(sinks.lines(ML_OUTPUT_FILE), vec!["7", "-3"]);
    }

    #[test]
    fn fallback_to_idle_is_opt_in() {
        let (mut r, _) = router_with(SessionConfig {
            fallback_to_idle_after_inference: true,
            ..config()
        });
        r.apply_mode(ModeCommand::StartPredicting);
        let g = r.generation();
        match r.record_inference_output(g, &[1]) {
            Completion::Recorded(Some(t)) => assert_eq!(t.to, OperatingMode::Idle),
            other => panic!("unexpected completion {other:?}"),
        }
        assert_eq!(r.mode(), OperatingMode::Idle);
    }

    #[test]
    fn stale_results_are_discarded() {
        let (mut r, sinks) = router();
        r.apply_mode(ModeCommand::StartPredicting);
        let old = r.generation();
        r.apply_mode(ModeCommand::StartPredicting);
        assert_eq!(r.record_inference_output(old, &[1]), Completion::Stale);
        assert!(sinks.lines(ML_OUTPUT_FILE).is_empty());

        r.apply_mode(ModeCommand::StopPredicting);
        let current = r.generation();
        assert_eq!(r.record_inference_output(current, &[1]), Completion::Stale);
    }

    #[test]
    fn failed_inference_resets_and_reverts_to_idle() {
        let (mut r, _) = router();
        r.apply_mode(ModeCommand::StartPredicting);
        r.route_packet(&"a".into(), &packet(&[1, 2])).unwrap();
        let t = r.abort_inference(r.generation()).unwrap();
        assert_eq!(t.to, OperatingMode::Idle);
        assert_eq!(r.inference().buffer(0).unwrap().write_index(), 0);
        assert_eq!(r.abort_inference(r.generation()), None);
    }

    #[test]
    fn set_role_goes_through_registry() {
        let (mut r, _) = router();
        let write = r.set_role(1, Role::Master).unwrap();
        assert_eq!(write.device, DeviceId::from("a"));
        assert_eq!(write.byte, 0x6D);
        assert!(r.set_role(9, Role::Master).is_err());
    }
}
