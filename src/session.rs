//! Session controller
//!
//! The state machine between the UI layer and the audio graphs. One
//! control thread owns every stream; `SessionHandle` marshals commands to
//! it over a channel and blocks for the typed reply, so each transition is
//! synchronous from the caller's view and completes only once resource
//! acquisition has succeeded or failed. Route-watcher notifications are
//! posted into the same stream and never interleave with a transition.
//!
//! Busy policy: start-type requests (`activate`, `test_tone`,
//! `trigger_alarm`) are rejected with `SessionError::Busy` while another
//! start-type request is in flight; stop-type requests (`deactivate`,
//! `acknowledge_alarm`) always queue behind the in-flight operation, which
//! is what lets a deactivate interrupt an activate and still settle in
//! `Idle`.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

use crate::audio::alarm::AlarmEngine;
use crate::audio::device::AudioConfig;
use crate::audio::engine::{PlaybackGraph, ToneGraph};
use crate::audio::route::{self, RouteEvent, RouteShared, RouteWatcher};
use crate::audio::spectrum::NUM_BANDS;

/// Session lifecycle state. Exactly one is current at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Active,
    Alarming,
}

/// Events pushed to the UI layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged { state: SessionState },
    RouteLost { reason: RouteEvent },
    RouteLabelChanged { label: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("another request is in flight")]
    Busy,
    #[error("audio error: {0}")]
    Audio(String),
    #[error("session controller is shut down")]
    Disconnected,
}

/// Seam to the keep-alive graph. The real implementation is
/// `audio::engine::PlaybackGraph`; tests substitute a recording fake.
pub trait KeepAlive {
    fn start(&mut self, level: u8) -> Result<(), String>;
    fn update_volume(&mut self, level: u8);
    fn stop(&mut self);
    fn is_live(&self) -> bool;
    fn spectrum(&mut self) -> Option<[f32; NUM_BANDS]>;
}

/// Seam to the siren.
pub trait Siren {
    fn start(&mut self) -> Result<(), String>;
    fn stop(&mut self);
    fn is_live(&self) -> bool;
}

/// Seam to the one-shot tone graph.
pub trait TonePlayer {
    fn is_busy(&self) -> bool;
    fn play(&mut self) -> Result<(), String>;
}

/// Seam to the route watcher.
pub trait RouteControl {
    fn arm(&mut self);
    fn disarm(&mut self);
    fn refresh(&mut self) -> String;
}

impl KeepAlive for PlaybackGraph {
    fn start(&mut self, level: u8) -> Result<(), String> {
        PlaybackGraph::start(self, level)
    }
    fn update_volume(&mut self, level: u8) {
        PlaybackGraph::update_volume(self, level)
    }
    fn stop(&mut self) {
        PlaybackGraph::stop(self)
    }
    fn is_live(&self) -> bool {
        PlaybackGraph::is_live(self)
    }
    fn spectrum(&mut self) -> Option<[f32; NUM_BANDS]> {
        PlaybackGraph::spectrum(self)
    }
}

impl Siren for AlarmEngine {
    fn start(&mut self) -> Result<(), String> {
        AlarmEngine::start(self)
    }
    fn stop(&mut self) {
        AlarmEngine::stop(self)
    }
    fn is_live(&self) -> bool {
        AlarmEngine::is_live(self)
    }
}

impl TonePlayer for ToneGraph {
    fn is_busy(&self) -> bool {
        self.is_playing()
    }
    fn play(&mut self) -> Result<(), String> {
        self.play_test_tone()
    }
}

impl RouteControl for RouteWatcher {
    fn arm(&mut self) {
        RouteWatcher::arm(self)
    }
    fn disarm(&mut self) {
        RouteWatcher::disarm(self)
    }
    fn refresh(&mut self) -> String {
        RouteWatcher::refresh(self)
    }
}

/// Inbound commands, mirrored one-to-one by `SessionHandle` methods.
#[derive(Debug, Clone, Copy)]
enum Command {
    Activate(u8),
    Deactivate,
    SetLevel(u8),
    TestTone,
    AcknowledgeAlarm,
    TriggerAlarm,
    RefreshRoute,
    Spectrum,
    Shutdown,
}

enum Outcome {
    Done,
    Label(String),
    Spectrum(Option<[f32; NUM_BANDS]>),
}

enum Msg {
    Command {
        command: Command,
        reply: Sender<Result<Outcome, SessionError>>,
    },
    Route(RouteEvent),
}

/// State mirror readable without a round-trip to the control thread.
struct SharedStatus {
    state: RwLock<SessionState>,
    start_in_flight: AtomicBool,
}

impl SharedStatus {
    fn new() -> Self {
        Self {
            state: RwLock::new(SessionState::Idle),
            start_in_flight: AtomicBool::new(false),
        }
    }
}

/// The state machine. Owns the audio graphs through the seam traits and
/// mutates them only from `run`'s thread.
pub struct SessionController<G, A, T, W>
where
    G: KeepAlive,
    A: Siren,
    T: TonePlayer,
    W: RouteControl,
{
    graph: G,
    alarm: A,
    tone: T,
    watcher: W,
    state: SessionState,
    status: Arc<SharedStatus>,
    events: Sender<SessionEvent>,
}

impl<G, A, T, W> SessionController<G, A, T, W>
where
    G: KeepAlive,
    A: Siren,
    T: TonePlayer,
    W: RouteControl,
{
    fn with_dependencies(
        graph: G,
        alarm: A,
        tone: T,
        watcher: W,
        status: Arc<SharedStatus>,
        events: Sender<SessionEvent>,
    ) -> Self {
        Self {
            graph,
            alarm,
            tone,
            watcher,
            state: SessionState::Idle,
            status,
            events,
        }
    }

    /// Process messages until shutdown. Consumes the controller; graphs are
    /// released on this thread when the loop ends.
    fn run(mut self, rx: Receiver<Msg>) {
        for msg in rx {
            match msg {
                Msg::Command {
                    command: Command::Shutdown,
                    reply,
                } => {
                    self.shutdown();
                    let _ = reply.send(Ok(Outcome::Done));
                    break;
                }
                Msg::Command { command, reply } => {
                    let result = self.handle_command(command);
                    let _ = reply.send(result);
                }
                Msg::Route(event) => self.handle_route_event(event),
            }
        }
        log::debug!("Session control thread exiting");
    }

    fn handle_command(&mut self, command: Command) -> Result<Outcome, SessionError> {
        match command {
            Command::Activate(level) => self.activate(level).map(|_| Outcome::Done),
            Command::Deactivate => self.deactivate().map(|_| Outcome::Done),
            Command::SetLevel(level) => self.set_level(level).map(|_| Outcome::Done),
            Command::TestTone => self.test_tone().map(|_| Outcome::Done),
            Command::AcknowledgeAlarm => self.acknowledge_alarm().map(|_| Outcome::Done),
            Command::TriggerAlarm => self.trigger_alarm().map(|_| Outcome::Done),
            Command::RefreshRoute => Ok(Outcome::Label(self.refresh_route())),
            Command::Spectrum => Ok(Outcome::Spectrum(self.spectrum())),
            Command::Shutdown => Ok(Outcome::Done),
        }
    }

    fn set_state(&mut self, next: SessionState) {
        if next == self.state {
            return;
        }
        log::info!("Session state: {:?} -> {:?}", self.state, next);
        self.state = next;
        *self.status.state.write() = next;
        let _ = self.events.send(SessionEvent::StateChanged { state: next });
    }

    fn activate(&mut self, level: u8) -> Result<(), SessionError> {
        match self.state {
            SessionState::Idle => {
                self.graph.start(level).map_err(SessionError::Audio)?;
                self.watcher.arm();
                self.set_state(SessionState::Active);
                Ok(())
            }
            // Already holding the route: apply the level to the live graph
            // instead of tearing down a healthy stream.
            SessionState::Active => {
                self.graph.update_volume(level);
                Ok(())
            }
            SessionState::Alarming => Ok(()),
        }
    }

    fn deactivate(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Active {
            self.watcher.disarm();
            self.graph.stop();
            self.set_state(SessionState::Idle);
        }
        Ok(())
    }

    fn set_level(&mut self, level: u8) -> Result<(), SessionError> {
        if self.state == SessionState::Active {
            self.graph.update_volume(level);
        }
        Ok(())
    }

    fn test_tone(&mut self) -> Result<(), SessionError> {
        // The siren owns the output while alarming.
        if self.state == SessionState::Alarming {
            return Ok(());
        }
        if self.tone.is_busy() {
            return Err(SessionError::Busy);
        }
        self.tone.play().map_err(SessionError::Audio)
    }

    fn acknowledge_alarm(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Alarming {
            self.alarm.stop();
            self.set_state(SessionState::Idle);
        }
        Ok(())
    }

    fn trigger_alarm(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Active {
            self.raise_alarm();
        }
        Ok(())
    }

    fn refresh_route(&mut self) -> String {
        let label = self.watcher.refresh();
        let _ = self.events.send(SessionEvent::RouteLabelChanged {
            label: label.clone(),
        });
        label
    }

    fn spectrum(&mut self) -> Option<[f32; NUM_BANDS]> {
        if self.state == SessionState::Active {
            self.graph.spectrum()
        } else {
            None
        }
    }

    fn handle_route_event(&mut self, event: RouteEvent) {
        if self.state != SessionState::Active {
            log::debug!("Ignoring route event outside Active: {:?}", event);
            return;
        }
        log::warn!("Route lost: {:?}", event);
        let _ = self.events.send(SessionEvent::RouteLost { reason: event });
        self.raise_alarm();
    }

    /// Active -> Alarming: the keep-alive graph is always stopped before
    /// the siren starts, so the two handles are never live together. If
    /// the siren's stream cannot be acquired, settle in Idle rather than
    /// claim an alarm that is not sounding.
    fn raise_alarm(&mut self) {
        self.watcher.disarm();
        self.graph.stop();
        match self.alarm.start() {
            Ok(()) => self.set_state(SessionState::Alarming),
            Err(e) => {
                log::error!("Siren failed to start: {}", e);
                self.set_state(SessionState::Idle);
            }
        }
    }

    fn shutdown(&mut self) {
        self.watcher.disarm();
        self.graph.stop();
        self.alarm.stop();
        self.set_state(SessionState::Idle);
    }
}

/// Clonable handle the UI layer drives the session through.
#[derive(Clone)]
pub struct SessionHandle {
    tx: Sender<Msg>,
    status: Arc<SharedStatus>,
    route: Arc<RouteShared>,
}

impl SessionHandle {
    /// Current session state, without a control-thread round trip.
    pub fn state(&self) -> SessionState {
        *self.status.state.read()
    }

    /// Latest route label from the watcher snapshot.
    pub fn route_label(&self) -> String {
        self.route.label()
    }

    pub fn activate(&self, level: u8) -> Result<(), SessionError> {
        self.exclusive_request(Command::Activate(level)).map(|_| ())
    }

    pub fn deactivate(&self) -> Result<(), SessionError> {
        self.request(Command::Deactivate).map(|_| ())
    }

    pub fn set_level(&self, level: u8) -> Result<(), SessionError> {
        self.request(Command::SetLevel(level)).map(|_| ())
    }

    pub fn test_tone(&self) -> Result<(), SessionError> {
        self.exclusive_request(Command::TestTone).map(|_| ())
    }

    pub fn acknowledge_alarm(&self) -> Result<(), SessionError> {
        self.request(Command::AcknowledgeAlarm).map(|_| ())
    }

    /// Manually drive Active -> Alarming (the UI's "simulate" action).
    pub fn trigger_alarm(&self) -> Result<(), SessionError> {
        self.exclusive_request(Command::TriggerAlarm).map(|_| ())
    }

    /// On-demand route re-enumeration; returns the refreshed label.
    pub fn refresh_route(&self) -> Result<String, SessionError> {
        match self.request(Command::RefreshRoute)? {
            Outcome::Label(label) => Ok(label),
            _ => Ok(self.route_label()),
        }
    }

    /// Frequency-magnitude snapshot from the analysis tap; `None` unless
    /// Active.
    pub fn spectrum(&self) -> Result<Option<[f32; NUM_BANDS]>, SessionError> {
        match self.request(Command::Spectrum)? {
            Outcome::Spectrum(bands) => Ok(bands),
            _ => Ok(None),
        }
    }

    /// Stop all graphs and end the control thread.
    pub fn shutdown(&self) -> Result<(), SessionError> {
        self.request(Command::Shutdown).map(|_| ())
    }

    fn request(&self, command: Command) -> Result<Outcome, SessionError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(Msg::Command {
                command,
                reply: reply_tx,
            })
            .map_err(|_| SessionError::Disconnected)?;
        reply_rx.recv().map_err(|_| SessionError::Disconnected)?
    }

    /// Start-type requests: reject instead of queue while another
    /// start-type request is in flight.
    fn exclusive_request(&self, command: Command) -> Result<Outcome, SessionError> {
        if self
            .status
            .start_in_flight
            .swap(true, Ordering::SeqCst)
        {
            return Err(SessionError::Busy);
        }
        let result = self.request(command);
        self.status.start_in_flight.store(false, Ordering::SeqCst);
        result
    }
}

/// Session construction parameters.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub audio: AudioConfig,
    pub watcher_poll: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            watcher_poll: route::DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Spawn the control thread with real audio dependencies and return the
/// handle plus the UI event stream.
///
/// The graphs are constructed on the control thread itself - cpal streams
/// never cross threads - and released there when the loop ends.
pub fn spawn(config: SessionConfig) -> Result<(SessionHandle, Receiver<SessionEvent>), String> {
    let (msg_tx, msg_rx) = mpsc::channel::<Msg>();
    let (event_tx, event_rx) = mpsc::channel::<SessionEvent>();
    let status = Arc::new(SharedStatus::new());
    let route_shared = Arc::new(RouteShared::new());

    let handle = SessionHandle {
        tx: msg_tx.clone(),
        status: Arc::clone(&status),
        route: Arc::clone(&route_shared),
    };

    let thread_status = Arc::clone(&status);
    let thread_route = Arc::clone(&route_shared);
    thread::Builder::new()
        .name("auxguard-session".to_string())
        .spawn(move || {
            let interrupt_tx = msg_tx.clone();
            let graph = PlaybackGraph::new(
                config.audio.clone(),
                Arc::new(move || {
                    let _ = interrupt_tx.send(Msg::Route(RouteEvent::PlaybackInterrupted));
                }),
            );
            let alarm = AlarmEngine::new(config.audio.clone());
            let tone = ToneGraph::new(config.audio.clone());

            let watcher_tx = msg_tx.clone();
            let watcher = RouteWatcher::spawn(
                thread_route,
                config.watcher_poll,
                Arc::new(move |event| {
                    let _ = watcher_tx.send(Msg::Route(event));
                }),
            );

            let controller =
                SessionController::with_dependencies(graph, alarm, tone, watcher, thread_status, event_tx);
            controller.run(msg_rx);
        })
        .map_err(|e| format!("Failed to spawn session thread: {}", e))?;

    Ok((handle, event_rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Recording fakes sharing their observable state with the test body.
    #[derive(Default)]
    struct FakeAudioState {
        graph_live: bool,
        graph_level: Option<u8>,
        graph_starts: usize,
        graph_start_began: bool,
        graph_start_delay: Option<Duration>,
        graph_fail_start: bool,
        alarm_live: bool,
        alarm_starts: usize,
        alarm_fail_start: bool,
        alarm_live_while_graph: bool,
        graph_live_while_alarm: bool,
        tone_plays: usize,
        tone_busy: bool,
        watcher_armed: bool,
        watcher_refreshes: usize,
    }

    type SharedFake = Arc<Mutex<FakeAudioState>>;

    struct FakeGraph(SharedFake);
    struct FakeSiren(SharedFake);
    struct FakeTone(SharedFake);
    struct FakeWatcher(SharedFake);

    impl KeepAlive for FakeGraph {
        fn start(&mut self, level: u8) -> Result<(), String> {
            let delay = {
                let mut state = self.0.lock();
                state.graph_start_began = true;
                state.graph_start_delay
            };
            if let Some(delay) = delay {
                thread::sleep(delay);
            }
            let mut state = self.0.lock();
            if state.graph_fail_start {
                return Err("no output device".to_string());
            }
            if state.alarm_live {
                state.alarm_live_while_graph = true;
            }
            state.graph_live = true;
            state.graph_level = Some(level);
            state.graph_starts += 1;
            Ok(())
        }
        fn update_volume(&mut self, level: u8) {
            let mut state = self.0.lock();
            if state.graph_live {
                state.graph_level = Some(level);
            }
        }
        fn stop(&mut self) {
            self.0.lock().graph_live = false;
        }
        fn is_live(&self) -> bool {
            self.0.lock().graph_live
        }
        fn spectrum(&mut self) -> Option<[f32; NUM_BANDS]> {
            if self.0.lock().graph_live {
                Some([0.5; NUM_BANDS])
            } else {
                None
            }
        }
    }

    impl Siren for FakeSiren {
        fn start(&mut self) -> Result<(), String> {
            let mut state = self.0.lock();
            if state.alarm_fail_start {
                return Err("no output device".to_string());
            }
            if state.graph_live {
                state.graph_live_while_alarm = true;
            }
            state.alarm_live = true;
            state.alarm_starts += 1;
            Ok(())
        }
        fn stop(&mut self) {
            self.0.lock().alarm_live = false;
        }
        fn is_live(&self) -> bool {
            self.0.lock().alarm_live
        }
    }

    impl TonePlayer for FakeTone {
        fn is_busy(&self) -> bool {
            self.0.lock().tone_busy
        }
        fn play(&mut self) -> Result<(), String> {
            self.0.lock().tone_plays += 1;
            Ok(())
        }
    }

    impl RouteControl for FakeWatcher {
        fn arm(&mut self) {
            self.0.lock().watcher_armed = true;
        }
        fn disarm(&mut self) {
            self.0.lock().watcher_armed = false;
        }
        fn refresh(&mut self) -> String {
            self.0.lock().watcher_refreshes += 1;
            "2 Output(s) Available".to_string()
        }
    }

    struct Harness {
        controller: SessionController<FakeGraph, FakeSiren, FakeTone, FakeWatcher>,
        fake: SharedFake,
        events: Receiver<SessionEvent>,
    }

    fn harness() -> Harness {
        let fake: SharedFake = Arc::new(Mutex::new(FakeAudioState::default()));
        let (event_tx, events) = mpsc::channel();
        let controller = SessionController::with_dependencies(
            FakeGraph(Arc::clone(&fake)),
            FakeSiren(Arc::clone(&fake)),
            FakeTone(Arc::clone(&fake)),
            FakeWatcher(Arc::clone(&fake)),
            Arc::new(SharedStatus::new()),
            event_tx,
        );
        Harness {
            controller,
            fake,
            events,
        }
    }

    fn drain(events: &Receiver<SessionEvent>) -> Vec<SessionEvent> {
        events.try_iter().collect()
    }

    #[test]
    fn activate_from_idle_starts_graph_and_arms_watcher() {
        let mut h = harness();
        assert_eq!(h.controller.state, SessionState::Idle);

        h.controller.activate(40).expect("activate");

        assert_eq!(h.controller.state, SessionState::Active);
        let state = h.fake.lock();
        assert!(state.graph_live);
        assert!(!state.alarm_live);
        assert_eq!(state.graph_level, Some(40));
        assert!(state.watcher_armed);
        drop(state);
        assert_eq!(
            drain(&h.events),
            vec![SessionEvent::StateChanged {
                state: SessionState::Active
            }]
        );
    }

    #[test]
    fn only_activate_leaves_idle() {
        let mut h = harness();
        h.controller.deactivate().expect("deactivate");
        h.controller.set_level(50).expect("set_level");
        h.controller.acknowledge_alarm().expect("acknowledge");
        h.controller.trigger_alarm().expect("trigger");
        h.controller
            .handle_route_event(RouteEvent::PlaybackInterrupted);

        assert_eq!(h.controller.state, SessionState::Idle);
        let state = h.fake.lock();
        assert!(!state.graph_live);
        assert!(!state.alarm_live);
    }

    #[test]
    fn deactivate_releases_graph_and_disarms() {
        let mut h = harness();
        h.controller.activate(40).expect("activate");
        h.controller.deactivate().expect("deactivate");

        assert_eq!(h.controller.state, SessionState::Idle);
        let state = h.fake.lock();
        assert!(!state.graph_live);
        assert!(!state.watcher_armed);
    }

    #[test]
    fn deactivate_is_idempotent() {
        let mut h = harness();
        h.controller.activate(40).expect("activate");
        h.controller.deactivate().expect("first");
        h.controller.deactivate().expect("second");

        assert_eq!(h.controller.state, SessionState::Idle);
        assert!(!h.fake.lock().graph_live);
        // One Active and one Idle transition; the repeat was silent.
        assert_eq!(drain(&h.events).len(), 2);
    }

    #[test]
    fn reactivate_applies_level_without_second_handle() {
        let mut h = harness();
        h.controller.activate(50).expect("first");
        h.controller.activate(70).expect("second");

        assert_eq!(h.controller.state, SessionState::Active);
        let state = h.fake.lock();
        assert_eq!(state.graph_starts, 1);
        assert!(state.graph_live);
        assert_eq!(state.graph_level, Some(70));
    }

    #[test]
    fn route_loss_while_active_alarms_and_never_overlaps_handles() {
        let mut h = harness();
        h.controller.activate(40).expect("activate");
        let _ = drain(&h.events);

        h.controller.handle_route_event(RouteEvent::DeviceCountDropped {
            previous: 2,
            current: 1,
        });

        assert_eq!(h.controller.state, SessionState::Alarming);
        let state = h.fake.lock();
        assert!(state.alarm_live);
        assert!(!state.graph_live);
        assert!(!state.watcher_armed);
        // The graph was never live while the siren was, and vice versa.
        assert!(!state.graph_live_while_alarm);
        assert!(!state.alarm_live_while_graph);
        drop(state);

        assert_eq!(
            drain(&h.events),
            vec![
                SessionEvent::RouteLost {
                    reason: RouteEvent::DeviceCountDropped {
                        previous: 2,
                        current: 1
                    }
                },
                SessionEvent::StateChanged {
                    state: SessionState::Alarming
                },
            ]
        );
    }

    #[test]
    fn route_loss_outside_active_is_ignored() {
        let mut h = harness();
        h.controller.handle_route_event(RouteEvent::DeviceCountDropped {
            previous: 2,
            current: 1,
        });

        assert_eq!(h.controller.state, SessionState::Idle);
        assert!(!h.fake.lock().alarm_live);
        assert!(drain(&h.events).is_empty());
    }

    #[test]
    fn interruption_while_active_alarms() {
        let mut h = harness();
        h.controller.activate(40).expect("activate");
        h.controller
            .handle_route_event(RouteEvent::PlaybackInterrupted);

        assert_eq!(h.controller.state, SessionState::Alarming);
        assert!(h.fake.lock().alarm_live);
    }

    #[test]
    fn acknowledge_stops_alarm_and_returns_to_idle() {
        let mut h = harness();
        h.controller.activate(40).expect("activate");
        h.controller
            .handle_route_event(RouteEvent::PlaybackInterrupted);
        h.controller.acknowledge_alarm().expect("acknowledge");

        assert_eq!(h.controller.state, SessionState::Idle);
        let state = h.fake.lock();
        assert!(!state.alarm_live);
        assert!(!state.graph_live);
    }

    #[test]
    fn acknowledge_while_idle_is_a_noop() {
        let mut h = harness();
        h.controller.acknowledge_alarm().expect("acknowledge");

        assert_eq!(h.controller.state, SessionState::Idle);
        assert!(drain(&h.events).is_empty());
    }

    #[test]
    fn set_level_ramps_only_while_active() {
        let mut h = harness();
        h.controller.set_level(80).expect("idle set_level");
        assert_eq!(h.fake.lock().graph_level, None);

        h.controller.activate(40).expect("activate");
        h.controller.set_level(80).expect("active set_level");
        assert_eq!(h.fake.lock().graph_level, Some(80));
    }

    #[test]
    fn test_tone_plays_from_idle_and_active_without_state_change() {
        let mut h = harness();
        h.controller.test_tone().expect("idle tone");
        assert_eq!(h.controller.state, SessionState::Idle);

        h.controller.activate(40).expect("activate");
        h.controller.test_tone().expect("active tone");
        assert_eq!(h.controller.state, SessionState::Active);
        assert!(h.fake.lock().graph_live);
        assert_eq!(h.fake.lock().tone_plays, 2);
    }

    #[test]
    fn overlapping_tone_is_busy() {
        let mut h = harness();
        h.fake.lock().tone_busy = true;
        assert_eq!(h.controller.test_tone(), Err(SessionError::Busy));
        assert_eq!(h.fake.lock().tone_plays, 0);
    }

    #[test]
    fn activate_failure_keeps_idle() {
        let mut h = harness();
        h.fake.lock().graph_fail_start = true;

        let result = h.controller.activate(40);
        assert_eq!(
            result,
            Err(SessionError::Audio("no output device".to_string()))
        );
        assert_eq!(h.controller.state, SessionState::Idle);
        let state = h.fake.lock();
        assert!(!state.graph_live);
        assert!(!state.watcher_armed);
        drop(state);
        assert!(drain(&h.events).is_empty());
    }

    #[test]
    fn alarm_start_failure_settles_idle_with_route_lost_event() {
        let mut h = harness();
        h.controller.activate(40).expect("activate");
        let _ = drain(&h.events);
        h.fake.lock().alarm_fail_start = true;

        h.controller
            .handle_route_event(RouteEvent::PlaybackInterrupted);

        assert_eq!(h.controller.state, SessionState::Idle);
        let state = h.fake.lock();
        assert!(!state.graph_live);
        assert!(!state.alarm_live);
        drop(state);
        let events = drain(&h.events);
        assert_eq!(
            events[0],
            SessionEvent::RouteLost {
                reason: RouteEvent::PlaybackInterrupted
            }
        );
        assert_eq!(
            events[1],
            SessionEvent::StateChanged {
                state: SessionState::Idle
            }
        );
    }

    #[test]
    fn trigger_alarm_follows_the_route_loss_path() {
        let mut h = harness();
        h.controller.activate(40).expect("activate");
        h.controller.trigger_alarm().expect("trigger");

        assert_eq!(h.controller.state, SessionState::Alarming);
        let state = h.fake.lock();
        assert!(state.alarm_live);
        assert!(!state.graph_live);
        assert_eq!(state.alarm_starts, 1);
    }

    #[test]
    fn spectrum_is_none_unless_active() {
        let mut h = harness();
        assert!(h.controller.spectrum().is_none());

        h.controller.activate(40).expect("activate");
        assert!(h.controller.spectrum().is_some());

        h.controller.deactivate().expect("deactivate");
        assert!(h.controller.spectrum().is_none());
    }

    #[test]
    fn refresh_route_reports_label_and_emits_event() {
        let mut h = harness();
        let label = h.controller.refresh_route();
        assert_eq!(label, "2 Output(s) Available");
        assert_eq!(h.fake.lock().watcher_refreshes, 1);
        assert_eq!(
            drain(&h.events),
            vec![SessionEvent::RouteLabelChanged {
                label: "2 Output(s) Available".to_string()
            }]
        );
    }

    // Threaded tests exercising the handle's serialization and busy
    // policy against a controller running on its own thread.

    fn spawn_harness(fake: SharedFake) -> (SessionHandle, Receiver<SessionEvent>) {
        let (msg_tx, msg_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();
        let status = Arc::new(SharedStatus::new());
        let handle = SessionHandle {
            tx: msg_tx,
            status: Arc::clone(&status),
            route: Arc::new(RouteShared::new()),
        };
        let controller = SessionController::with_dependencies(
            FakeGraph(Arc::clone(&fake)),
            FakeSiren(Arc::clone(&fake)),
            FakeTone(Arc::clone(&fake)),
            FakeWatcher(fake),
            status,
            event_tx,
        );
        thread::spawn(move || controller.run(msg_rx));
        (handle, event_rx)
    }

    #[test]
    fn deactivate_during_slow_activate_lands_idle() {
        let fake: SharedFake = Arc::new(Mutex::new(FakeAudioState {
            graph_start_delay: Some(Duration::from_millis(50)),
            ..Default::default()
        }));
        let (handle, _events) = spawn_harness(Arc::clone(&fake));

        let activator = {
            let handle = handle.clone();
            thread::spawn(move || handle.activate(30))
        };
        // Wait until the activate is mid-acquisition, then request a stop;
        // it queues behind the acquisition and runs as soon as the graph is
        // live.
        while !fake.lock().graph_start_began {
            thread::sleep(Duration::from_millis(1));
        }
        handle.deactivate().expect("deactivate");

        activator.join().expect("join").expect("activate");
        assert_eq!(handle.state(), SessionState::Idle);
        let state = fake.lock();
        assert!(!state.graph_live);
        assert!(!state.alarm_live);
        assert_eq!(state.graph_starts, 1);
        drop(state);
        let _ = handle.shutdown();
    }

    #[test]
    fn concurrent_activate_is_rejected_busy() {
        let fake: SharedFake = Arc::new(Mutex::new(FakeAudioState {
            graph_start_delay: Some(Duration::from_millis(50)),
            ..Default::default()
        }));
        let (handle, _events) = spawn_harness(Arc::clone(&fake));

        let first = {
            let handle = handle.clone();
            thread::spawn(move || handle.activate(30))
        };
        while !fake.lock().graph_start_began {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(handle.activate(70), Err(SessionError::Busy));

        first.join().expect("join").expect("first activate");
        assert_eq!(handle.state(), SessionState::Active);
        assert_eq!(fake.lock().graph_starts, 1);
        let _ = handle.shutdown();
    }

    #[test]
    fn shutdown_releases_everything() {
        let fake: SharedFake = Arc::new(Mutex::new(FakeAudioState::default()));
        let (handle, _events) = spawn_harness(Arc::clone(&fake));

        handle.activate(40).expect("activate");
        handle.shutdown().expect("shutdown");

        let state = fake.lock();
        assert!(!state.graph_live);
        assert!(!state.alarm_live);
        drop(state);
        // The control thread is gone; further requests disconnect.
        assert_eq!(handle.deactivate(), Err(SessionError::Disconnected));
    }
}
