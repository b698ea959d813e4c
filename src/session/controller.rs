//! Mimic session controller.
//!
//! One task owns all session state and handles commands and internal events
//! one at a time. Timers, the socket pump, the connect attempt and the frame
//! encoder run as separate tasks that only post events back, so no two
//! handlers ever touch the state at once. Events from an abandoned connect
//! attempt carry an old `attempt` number and are ignored.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, trace, warn};

use super::drift::{self, ReferenceClock};
use super::scores::ScoreSnapshot;
use super::state::{transition, PhaseEvent, SessionPhase};
use super::timers::{spawn_after, spawn_posting, spawn_ticker, SessionTimers};
use super::view::ViewState;
use crate::api::{results_route, EndOutcome, SessionApi, SessionId};
use crate::camera::{CameraBinding, CaptureDevice, FrameEncoder, Resolution, Surface};
use crate::config::{Config, OverlayConfig, SessionConfig};
use crate::error::{DeviceError, TransportError};
use crate::pose::{Landmark, PoseFrame};
use crate::protocol::{self, ClientMessage, MimicUpdate, ServerMessage, WirePose};
use crate::render::skeleton::connections_owned;
use crate::render::{DisplayMode, Overlay, OverlayRenderer};
use crate::socket::{SocketConnector, SocketEvent, SocketLink};

/// Encodes allowed in flight before capture ticks start dropping frames.
const MAX_IN_FLIGHT_ENCODES: usize = 2;

const NO_CAMERA: &str = "No camera found. Allow camera access and try again.";
const CONNECTION_LOST: &str = "Connection to the session server was lost. Start the session again.";

/// Capabilities the controller depends on.
pub struct ControllerParts {
    pub camera: Arc<dyn CaptureDevice>,
    pub encoder: Arc<dyn FrameEncoder>,
    pub api: Arc<dyn SessionApi>,
    pub connector: Arc<dyn SocketConnector>,
    pub clock: Box<dyn ReferenceClock>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SelectDevice(String),
    Start,
    End,
    SetDisplayMode(DisplayMode),
    /// Leave the session screen. An open session is ended first.
    Shutdown,
}

/// Cloneable command side of a running controller.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ControllerHandle {
    /// False once the controller has finished.
    pub fn send(&self, command: Command) -> bool {
        self.tx.send(command).is_ok()
    }

    pub fn select_device(&self, device_id: impl Into<String>) -> bool {
        self.send(Command::SelectDevice(device_id.into()))
    }

    pub fn start(&self) -> bool {
        self.send(Command::Start)
    }

    pub fn end(&self) -> bool {
        self.send(Command::End)
    }

    pub fn set_display_mode(&self, mode: DisplayMode) -> bool {
        self.send(Command::SetDisplayMode(mode))
    }

    pub fn shutdown(&self) -> bool {
        self.send(Command::Shutdown)
    }
}

/// What the controller leaves behind once it is done.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    pub session_id: Option<SessionId>,
    pub report: Option<serde_json::Value>,
    /// Results route; `None` when no session was created
    pub route: Option<String>,
    pub scores: ScoreSnapshot,
}

enum Event {
    Command(Command),
    SessionCreated {
        attempt: u64,
        result: Result<SessionId, String>,
    },
    SocketConnected {
        attempt: u64,
        result: Result<SocketLink, String>,
    },
    ConnectDeadline {
        attempt: u64,
    },
    Socket {
        attempt: u64,
        event: SocketEvent,
    },
    CaptureTick {
        attempt: u64,
    },
    ElapsedTick {
        attempt: u64,
    },
    KeepAliveTick {
        attempt: u64,
    },
    /// Serialized `frame` message, or why there is none
    FrameEncoded {
        attempt: u64,
        result: Result<String, String>,
    },
    EndCallFinished {
        session_id: SessionId,
        result: Result<EndOutcome, String>,
    },
}

/// Send side of the open socket.
struct SocketSender {
    frames: mpsc::Sender<String>,
    control: mpsc::UnboundedSender<String>,
}

pub struct MimicController {
    challenge_id: String,
    preferred_device: Option<String>,
    settings: SessionConfig,

    camera: CameraBinding,
    encoder: Arc<dyn FrameEncoder>,
    api: Arc<dyn SessionApi>,
    connector: Arc<dyn SocketConnector>,
    clock: Box<dyn ReferenceClock>,

    renderer: OverlayRenderer,
    overlay: Overlay,
    overlay_tx: watch::Sender<Arc<Overlay>>,

    view: ViewState,
    view_tx: watch::Sender<ViewState>,

    commands_tx: Option<mpsc::UnboundedSender<Command>>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    /// Every handle is gone; only internal events wake the loop.
    commands_closed: bool,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,

    attempt: u64,
    socket: Option<SocketSender>,
    timers: SessionTimers,
    /// HTTP end fallback; not part of teardown
    end_call: Option<JoinHandle<()>>,
    started_at: Option<Instant>,
    in_flight: usize,
    pings_sent: u64,
    shutdown_requested: bool,
    outcome: Option<SessionOutcome>,
}

impl MimicController {
    pub fn new(parts: ControllerParts, challenge_id: impl Into<String>, config: &Config) -> Self {
        let request = Resolution::new(config.camera.width, config.camera.height);
        let OverlayConfig {
            visibility_threshold,
            display_mode,
            joint_radius,
        } = config.overlay.clone();

        let view = ViewState {
            display_mode,
            ..Default::default()
        };
        let (view_tx, _) = watch::channel(view.clone());
        let overlay = Overlay::new(request.width as usize, request.height as usize);
        let (overlay_tx, _) = watch::channel(Arc::new(overlay.clone()));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            challenge_id: challenge_id.into(),
            preferred_device: config.camera.device.clone(),
            settings: config.session.clone(),
            camera: CameraBinding::new(parts.camera, request),
            encoder: parts.encoder,
            api: parts.api,
            connector: parts.connector,
            clock: parts.clock,
            renderer: OverlayRenderer::new(visibility_threshold, joint_radius),
            overlay,
            overlay_tx,
            view,
            view_tx,
            commands_tx: Some(commands_tx),
            commands_rx,
            commands_closed: false,
            events_tx,
            events_rx,
            attempt: 0,
            socket: None,
            timers: SessionTimers::default(),
            end_call: None,
            started_at: None,
            in_flight: 0,
            pings_sent: 0,
            shutdown_requested: false,
            outcome: None,
        }
    }

    pub fn handle(&self) -> ControllerHandle {
        let tx = match &self.commands_tx {
            Some(tx) => tx.clone(),
            // run() has started; hand out a handle that reports closed
            None => mpsc::unbounded_channel().0,
        };
        ControllerHandle { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewState> {
        self.view_tx.subscribe()
    }

    /// Latest rendered skeleton overlay, sized to the live video.
    pub fn overlay(&self) -> watch::Receiver<Arc<Overlay>> {
        self.overlay_tx.subscribe()
    }

    pub fn view(&self) -> &ViewState {
        &self.view
    }

    /// Enumerates cameras, then handles commands and events until the
    /// session is over or every handle is gone.
    pub async fn run(mut self) -> SessionOutcome {
        // only handles created before this point keep the loop alive
        self.commands_tx = None;
        self.init().await;
        while self.outcome.is_none() {
            self.turn().await;
        }
        let outcome = self.outcome.take().unwrap_or_else(|| self.outcome_now(None));
        info!(route = ?outcome.route, "controller finished");
        outcome
    }

    /// Setup entry: unlock, enumerate, bind the preferred or first camera.
    pub async fn init(&mut self) {
        match self.camera.enumerate().await {
            Ok(devices) if devices.is_empty() => {
                warn!("no cameras");
                self.view.status = Some(NO_CAMERA.to_string());
            }
            Ok(devices) => {
                let pick = self
                    .preferred_device
                    .as_ref()
                    .and_then(|want| devices.iter().find(|d| &d.id == want))
                    .unwrap_or(&devices[0])
                    .id
                    .clone();
                self.view.devices = devices;
                self.select_device(&pick).await;
            }
            Err(e) => {
                warn!("camera enumeration failed: {e}");
                self.view.status = Some(device_status(&e));
            }
        }
        self.refresh_start_enabled();
        self.publish();
    }

    async fn turn(&mut self) {
        let event = tokio::select! {
            biased;
            Some(event) = self.events_rx.recv() => event,
            command = self.commands_rx.recv(), if !self.commands_closed => match command {
                Some(command) => Event::Command(command),
                None => {
                    self.commands_closed = true;
                    Event::Command(Command::Shutdown)
                }
            },
        };
        self.step(event).await;
    }

    async fn step(&mut self, event: Event) {
        match event {
            Event::Command(command) => self.on_command(command).await,
            Event::SessionCreated { attempt, result } if attempt == self.attempt => {
                self.on_session_created(result)
            }
            Event::SocketConnected { attempt, result } if attempt == self.attempt => {
                self.on_socket_connected(result).await
            }
            Event::ConnectDeadline { attempt } if attempt == self.attempt => {
                if self.view.phase == SessionPhase::Connecting {
                    let secs = self.settings.connect_timeout_secs;
                    warn!("connect deadline passed after {secs}s");
                    self.connect_failed(format!(
                        "Could not connect to the session: {}",
                        TransportError::Timeout(secs)
                    ));
                }
            }
            Event::Socket { attempt, event } if attempt == self.attempt => {
                self.on_socket_event(event).await
            }
            Event::CaptureTick { attempt } if attempt == self.attempt => self.on_capture_tick(),
            Event::ElapsedTick { attempt } if attempt == self.attempt => {
                if let Some(started) = self.started_at {
                    self.view.elapsed_secs = started.elapsed().as_secs();
                    self.view.reference_position = self.clock.position();
                }
            }
            Event::KeepAliveTick { attempt } if attempt == self.attempt => {
                if let Some(socket) = &self.socket {
                    if socket.control.send(protocol::PING.to_string()).is_ok() {
                        self.pings_sent += 1;
                        trace!("ping");
                    }
                }
            }
            Event::FrameEncoded { attempt, result } if attempt == self.attempt => {
                self.on_frame_encoded(result)
            }
            Event::EndCallFinished { session_id, result } => {
                self.end_call = None;
                match result {
                    Ok(EndOutcome::Ended) => info!(session = %session_id, "session ended over http"),
                    Ok(EndOutcome::AlreadyEnded) => {
                        debug!(session = %session_id, "session was already ended")
                    }
                    Err(e) => warn!(session = %session_id, "http end failed: {e}"),
                }
                self.finish(Some(results_route(&session_id)));
            }
            Event::SocketConnected { result: Ok(_link), .. } => {
                debug!("dropping socket from an abandoned attempt");
            }
            _ => trace!("stale event ignored"),
        }
        self.publish();
    }

    // --- Commands ---

    async fn on_command(&mut self, command: Command) {
        debug!(?command, phase = self.view.phase.as_str(), "command");
        match command {
            Command::SelectDevice(id) => {
                if self.view.phase.is_terminal() {
                    return;
                }
                self.select_device(&id).await;
                self.refresh_start_enabled();
            }
            Command::Start => self.start(),
            Command::End => self.end().await,
            Command::SetDisplayMode(mode) => self.view.display_mode = mode,
            Command::Shutdown => {
                self.shutdown_requested = true;
                match self.view.phase {
                    SessionPhase::Connecting | SessionPhase::Active => self.end().await,
                    SessionPhase::Setup => self.finish(None),
                    // end call in flight finishes on its own
                    SessionPhase::Ended if self.end_call.is_some() => {}
                    SessionPhase::Ended => self.finish(None),
                }
            }
        }
    }

    async fn select_device(&mut self, device_id: &str) {
        self.view.selected_device = Some(device_id.to_string());
        match self.camera.select(device_id).await {
            Ok(resolution) => {
                debug!(device = device_id, ?resolution, "camera selected");
                self.view.status = None;
            }
            Err(e) => {
                warn!(device = device_id, "camera acquisition failed: {e}");
                self.view.status = Some(device_status(&e));
            }
        }
    }

    fn start(&mut self) {
        if self.view.phase != SessionPhase::Setup || !self.camera.is_active() {
            debug!("start ignored");
            return;
        }
        if !self.advance(PhaseEvent::StartRequested) {
            return;
        }
        self.attempt += 1;
        let attempt = self.attempt;
        self.view.status = None;
        self.view.session_id = None;
        self.view.report = None;
        self.view.start_enabled = false;

        let api = self.api.clone();
        let connector = self.connector.clone();
        let tx = self.events_tx.clone();
        let challenge = self.challenge_id.clone();
        self.timers.connect = Some(tokio::spawn(async move {
            let id = match api.create_session(&challenge).await {
                Ok(id) => id,
                Err(e) => {
                    let _ = tx.send(Event::SessionCreated {
                        attempt,
                        result: Err(e.to_string()),
                    });
                    return;
                }
            };
            let _ = tx.send(Event::SessionCreated {
                attempt,
                result: Ok(id.clone()),
            });
            let result = match api.socket_url(&id) {
                Ok(url) => connector.connect(&url).await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            let _ = tx.send(Event::SocketConnected { attempt, result });
        }));
        self.timers.connect_deadline = Some(spawn_after(
            self.settings.connect_timeout(),
            self.events_tx.clone(),
            Event::ConnectDeadline { attempt },
        ));
        info!(challenge = %self.challenge_id, attempt, "starting session");
    }

    async fn end(&mut self) {
        match self.view.phase {
            SessionPhase::Connecting => {
                self.advance(PhaseEvent::EndRequested);
                self.teardown();
                match self.view.session_id.clone() {
                    Some(id) => self.begin_end_call(id),
                    None => self.finish(None),
                }
            }
            SessionPhase::Active => {
                self.advance(PhaseEvent::EndRequested);
                if let Some(socket) = &self.socket {
                    match ClientMessage::EndSession.to_text() {
                        Ok(text) => {
                            let _ = socket.control.send(text);
                        }
                        Err(e) => warn!("end_session encode failed: {e}"),
                    }
                }
                // socket stays open for a late session_ended
                self.halt_capture();
                match self.view.session_id.clone() {
                    Some(id) => self.begin_end_call(id),
                    None => self.finish(None),
                }
            }
            SessionPhase::Setup | SessionPhase::Ended => debug!("end ignored"),
        }
    }

    // --- Connect ---

    fn on_session_created(&mut self, result: Result<SessionId, String>) {
        match (self.view.phase, result) {
            (SessionPhase::Connecting, Ok(id)) => {
                info!(session = %id, "session created");
                self.view.session_id = Some(id);
            }
            (SessionPhase::Connecting, Err(e)) => {
                warn!("session creation failed: {e}");
                self.connect_failed(format!("Could not create a session: {e}"));
            }
            _ => {}
        }
    }

    async fn on_socket_connected(&mut self, result: Result<SocketLink, String>) {
        if self.view.phase != SessionPhase::Connecting {
            // a late link is simply dropped, which closes it
            return;
        }
        match result {
            Ok(link) => self.activate(link).await,
            Err(e) => {
                warn!("socket failed to open: {e}");
                self.connect_failed(format!("Could not connect to the session: {e}"));
            }
        }
    }

    fn connect_failed(&mut self, status: String) {
        if !self.advance(PhaseEvent::ConnectFailed) {
            return;
        }
        self.timers.stop_all();
        self.socket = None;
        if let Some(id) = self.view.session_id.take() {
            self.abandon_remote(id);
        }
        self.view.status = Some(status);
        self.refresh_start_enabled();
    }

    /// Best-effort close of a server session the user never saw go active.
    fn abandon_remote(&self, id: SessionId) {
        let api = self.api.clone();
        tokio::spawn(async move {
            match api.end_session(&id).await {
                Ok(_) => debug!(session = %id, "abandoned session closed"),
                Err(e) => debug!(session = %id, "abandoned session close failed: {e}"),
            }
        });
    }

    async fn activate(&mut self, link: SocketLink) {
        // no session without a camera track to feed it
        if let Err(e) = self.camera.reacquire().await {
            warn!("camera lost before going live: {e}");
            self.connect_failed(device_status(&e));
            return;
        }
        if !self.camera.is_active() {
            self.connect_failed(NO_CAMERA.to_string());
            return;
        }
        if !self.advance(PhaseEvent::SocketOpened) {
            return;
        }
        self.timers.stop_connect();
        let attempt = self.attempt;
        self.camera.bind(Surface::Live);

        let SocketLink {
            frames,
            control,
            mut inbound,
        } = link;
        self.socket = Some(SocketSender { frames, control });

        let tx = self.events_tx.clone();
        self.timers.socket_pump = Some(tokio::spawn(async move {
            loop {
                let event = inbound.recv().await.unwrap_or(SocketEvent::Closed);
                let terminal = !matches!(event, SocketEvent::Text(_));
                if tx.send(Event::Socket { attempt, event }).is_err() || terminal {
                    break;
                }
            }
        }));

        self.clock.seek(0.0);
        self.clock.play();
        self.started_at = Some(Instant::now());
        self.in_flight = 0;

        // capture and elapsed always start together
        let tx = &self.events_tx;
        self.timers.capture = Some(spawn_ticker(self.settings.capture_interval(), tx.clone(), move || {
            Event::CaptureTick { attempt }
        }));
        self.timers.elapsed = Some(spawn_ticker(Duration::from_secs(1), tx.clone(), move || {
            Event::ElapsedTick { attempt }
        }));
        self.timers.keepalive = Some(spawn_ticker(self.settings.keepalive_interval(), tx.clone(), move || {
            Event::KeepAliveTick { attempt }
        }));

        self.view.elapsed_secs = 0;
        self.view.reference_position = 0.0;
        self.view.scores = ScoreSnapshot::default();
        self.view.frames_sent = 0;
        self.view.dropped_frames = 0;
        info!(session = ?self.view.session_id.as_ref().map(SessionId::as_str), "session active");
    }

    // --- Socket ---

    async fn on_socket_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Text(text) => match protocol::decode(&text) {
                Some(ServerMessage::MimicUpdate(update)) => {
                    if self.view.phase == SessionPhase::Active {
                        self.apply_update(update);
                    }
                }
                Some(ServerMessage::SessionEnded { report }) => self.on_server_ended(report),
                None => trace!(len = text.len(), "unparseable message dropped"),
            },
            SocketEvent::Closed | SocketEvent::Error(_) => {
                self.timers.socket_pump = None;
                if let SocketEvent::Error(e) = &event {
                    warn!("socket error: {e}");
                }
                if self.view.phase == SessionPhase::Active {
                    self.socket_lost().await;
                } else {
                    self.socket = None;
                }
            }
        }
    }

    fn on_server_ended(&mut self, report: serde_json::Value) {
        match self.view.phase {
            SessionPhase::Active => {
                info!("server ended the session");
                self.advance(PhaseEvent::ServerEnded);
                self.view.report = Some(report);
                let route = self.view.session_id.as_ref().map(results_route);
                self.finish(route);
            }
            // end requested; navigation waits for the http call
            SessionPhase::Ended => {
                debug!("session_ended received while ending");
                self.view.report = Some(report);
            }
            _ => {}
        }
    }

    async fn socket_lost(&mut self) {
        if !self.advance(PhaseEvent::SocketLost) {
            return;
        }
        self.teardown();
        self.view.session_id = None;
        self.view.scores = ScoreSnapshot::default();
        self.view.status = Some(CONNECTION_LOST.to_string());

        // back to the setup preview
        self.camera.bind(Surface::Preview);
        if let Err(e) = self.camera.reacquire().await {
            warn!("camera reacquire failed: {e}");
            self.view.status = Some(device_status(&e));
        }
        self.refresh_start_enabled();
    }

    fn apply_update(&mut self, update: MimicUpdate) {
        self.view.scores = ScoreSnapshot::from_update(&update);
        if update.has_pose_data() {
            self.render_overlay(update.pose, update.ref_landmarks);
        }
        if let Some(server) = update.ref_time {
            if drift::correct(self.clock.as_mut(), server, self.settings.drift_tolerance) {
                debug!(server, "reference playback resynced");
            }
            self.view.reference_position = self.clock.position();
        }
    }

    fn render_overlay(&mut self, pose: Option<WirePose>, reference: Option<Vec<Landmark>>) {
        let local = pose.filter(|p| !p.landmarks.is_empty()).map(|p| {
            let mut frame = p.into_frame();
            if frame.connections.is_empty() {
                frame.connections = connections_owned();
            }
            frame
        });
        let reference = reference
            .filter(|l| !l.is_empty())
            .map(|landmarks| PoseFrame::new(landmarks, connections_owned()));

        let size = self
            .camera
            .resolution()
            .unwrap_or_else(|| Resolution::new(self.overlay.width() as u32, self.overlay.height() as u32));
        self.renderer.render(
            &mut self.overlay,
            size,
            local.as_ref(),
            reference.as_ref(),
            self.view.display_mode,
        );
        self.overlay_tx.send_replace(Arc::new(self.overlay.clone()));
    }

    // --- Capture ---

    fn on_capture_tick(&mut self) {
        if self.view.phase != SessionPhase::Active || self.socket.is_none() {
            return;
        }
        if self.in_flight >= MAX_IN_FLIGHT_ENCODES {
            self.view.dropped_frames += 1;
            return;
        }
        let Some(frame) = self.camera.snapshot() else {
            return;
        };
        let timestamp = self
            .started_at
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or_default();

        self.in_flight += 1;
        let attempt = self.attempt;
        let encoder = self.encoder.clone();
        spawn_posting(self.events_tx.clone(), async move {
            let encoded = tokio::task::spawn_blocking(move || {
                let jpeg = encoder.encode(&frame).map_err(|e| e.to_string())?;
                ClientMessage::frame(&jpeg, timestamp)
                    .to_text()
                    .map_err(|e| e.to_string())
            })
            .await;
            let result = encoded.unwrap_or_else(|e| Err(format!("encode task failed: {e}")));
            Event::FrameEncoded { attempt, result }
        });
    }

    fn on_frame_encoded(&mut self, result: Result<String, String>) {
        self.in_flight = self.in_flight.saturating_sub(1);
        let text = match result {
            Ok(text) => text,
            Err(e) => {
                debug!("frame skipped: {e}");
                return;
            }
        };
        let Some(socket) = self.socket.as_ref().filter(|_| self.view.phase == SessionPhase::Active) else {
            return;
        };
        match socket.frames.try_send(text) {
            Ok(()) => self.view.frames_sent += 1,
            Err(_) => {
                self.view.dropped_frames += 1;
                debug!(dropped = self.view.dropped_frames, "outbound queue full, frame dropped");
            }
        }
    }

    // --- Teardown ---

    /// Stops the session clocks and the camera together, keeping the socket.
    fn halt_capture(&mut self) {
        self.timers.stop_session_clocks();
        self.camera.release();
        self.clock.pause();
        self.started_at = None;
        self.in_flight = 0;
        self.view.elapsed_secs = 0;
    }

    /// Stops every timer and task, closes the socket and releases the camera.
    /// Safe to call any number of times.
    pub fn teardown(&mut self) {
        let stopped = self.timers.stop_all();
        let closed = self.socket.take().is_some();
        let released = self.camera.release();
        self.clock.pause();
        self.started_at = None;
        self.in_flight = 0;
        self.view.elapsed_secs = 0;
        if stopped > 0 || closed || released {
            debug!(stopped, closed, released, "teardown");
        }
    }

    fn begin_end_call(&mut self, id: SessionId) {
        let api = self.api.clone();
        let delay = self.settings.end_delay();
        self.end_call = Some(spawn_posting(self.events_tx.clone(), async move {
            time::sleep(delay).await;
            let result = api.end_session(&id).await.map_err(|e| e.to_string());
            Event::EndCallFinished {
                session_id: id,
                result,
            }
        }));
    }

    fn finish(&mut self, route: Option<String>) {
        if self.outcome.is_some() {
            return;
        }
        self.teardown();
        self.view.start_enabled = false;
        self.view.navigate_to = route.clone();
        self.outcome = Some(self.outcome_now(route));
        if let Some(route) = &self.view.navigate_to {
            info!(route = route.as_str(), "navigating");
        }
    }

    fn outcome_now(&self, route: Option<String>) -> SessionOutcome {
        SessionOutcome {
            session_id: self.view.session_id.clone(),
            report: self.view.report.clone(),
            route,
            scores: self.view.scores.clone(),
        }
    }

    // --- Helpers ---

    fn advance(&mut self, event: PhaseEvent) -> bool {
        let from = self.view.phase;
        match transition(from, event) {
            Some(to) => {
                info!(from = from.as_str(), to = to.as_str(), ?event, "phase");
                self.view.phase = to;
                true
            }
            None => {
                debug!(phase = from.as_str(), ?event, "event does not apply");
                false
            }
        }
    }

    fn refresh_start_enabled(&mut self) {
        self.view.start_enabled = self.view.phase == SessionPhase::Setup
            && self.camera.is_active()
            && !self.shutdown_requested;
    }

    fn publish(&self) {
        let view = &self.view;
        self.view_tx.send_if_modified(|current| {
            if current != view {
                *current = view.clone();
                true
            } else {
                false
            }
        });
    }
}

fn device_status(error: &DeviceError) -> String {
    match error {
        DeviceError::NoDevices => NO_CAMERA.to_string(),
        DeviceError::PermissionDenied(_) => {
            "Camera access was denied. Allow camera access and try again.".to_string()
        }
        other => format!("{}. Pick another camera or try again.", capitalize(&other.to_string())),
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ConnectMode, FakeApi, FakeCamera, FakeConnector, FakeEncoder, ManualClock, FAKE_JPEG};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde_json::json;

    struct Rig {
        controller: MimicController,
        camera: FakeCamera,
        api: FakeApi,
        connector: FakeConnector,
        clock: ManualClock,
    }

    fn rig(devices: &[&str], mode: ConnectMode) -> Rig {
        let camera = FakeCamera::with_devices(devices);
        let api = FakeApi::default();
        let connector = FakeConnector::new(mode, 8);
        let clock = ManualClock::default();
        let parts = ControllerParts {
            camera: Arc::new(camera.clone()),
            encoder: Arc::new(FakeEncoder),
            api: Arc::new(api.clone()),
            connector: Arc::new(connector.clone()),
            clock: Box::new(clock.clone()),
        };
        Rig {
            controller: MimicController::new(parts, "smash-01", &Config::default()),
            camera,
            api,
            connector,
            clock,
        }
    }

    async fn drive_until(c: &mut MimicController, done: impl Fn(&MimicController) -> bool) {
        for _ in 0..10_000 {
            if done(c) {
                return;
            }
            c.turn().await;
        }
        panic!("condition not reached; view = {:?}", c.view());
    }

    async fn go_active(rig: &mut Rig) -> crate::testing::FakePeer {
        rig.controller.init().await;
        rig.controller.step(Event::Command(Command::Start)).await;
        drive_until(&mut rig.controller, |c| c.view().phase == SessionPhase::Active).await;
        rig.connector.take_peer().expect("socket opened")
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_session_end_to_end() {
        let mut rig = rig(&["cam0"], ConnectMode::Open);
        let mut peer = go_active(&mut rig).await;
        let c = &mut rig.controller;
        assert_eq!(peer.url.path(), "/ws/mimic/42");
        assert_eq!(c.view().session_id, Some(SessionId::new("42")));

        for score in [40.0, 65.0, 90.0] {
            peer.send(json!({"type": "mimic_update", "scores": {"composite": score}}));
            drive_until(c, |c| c.view().scores.display_score() == Some(score)).await;
        }
        assert_eq!(c.view().scores.display_score(), Some(90.0));

        let ended_at = Instant::now();
        c.step(Event::Command(Command::End)).await;
        assert_eq!(c.view().phase, SessionPhase::Ended);
        assert!(peer
            .drain_control()
            .contains(&r#"{"type":"end_session"}"#.to_string()));
        assert!(!c.timers.clocks_running());
        assert_eq!(rig.camera.live_tracks(), 0);

        // server answers over the socket before the http fallback fires
        peer.send(json!({"type": "session_ended", "report": {"overall": 90}}));
        drive_until(c, |c| c.view().navigate_to.is_some()).await;

        let calls = rig.api.end_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0.as_str(), "42");
        assert!(calls[0].1.duration_since(ended_at) >= Duration::from_millis(500));
        assert_eq!(c.view().navigate_to.as_deref(), Some("/results/42"));
        assert_eq!(c.view().report, Some(json!({"overall": 90})));
        assert!(c.timers.is_idle());
        assert!(c.socket.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_cameras_keeps_start_disabled() {
        let mut rig = rig(&[], ConnectMode::Open);
        let c = &mut rig.controller;
        c.init().await;
        assert_eq!(c.view().phase, SessionPhase::Setup);
        assert_eq!(c.view().status.as_deref(), Some(NO_CAMERA));
        assert!(!c.view().start_enabled);

        c.step(Event::Command(Command::Start)).await;
        assert_eq!(c.view().phase, SessionPhase::Setup);
        assert_eq!(rig.api.creates(), 0);
        assert_eq!(rig.camera.calls(), vec!["unlock", "enumerate"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_permission_is_status_text() {
        let mut rig = rig(&["cam0"], ConnectMode::Open);
        rig.camera.deny_permission();
        let c = &mut rig.controller;
        c.init().await;
        assert!(c.view().status.as_deref().unwrap().contains("denied"));
        assert!(!c.view().start_enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_camera_failure_recovers_on_reselect() {
        let mut rig = rig(&["cam0", "cam1", "broken"], ConnectMode::Open);
        rig.camera.fail_device("broken");
        let c = &mut rig.controller;
        c.init().await;
        assert!(c.view().start_enabled);
        assert_eq!(c.view().selected_device.as_deref(), Some("cam0"));

        c.step(Event::Command(Command::SelectDevice("broken".into()))).await;
        assert!(c.view().status.as_deref().unwrap().contains("broken"));
        assert!(!c.view().start_enabled);
        assert_eq!(rig.camera.live_tracks(), 0);

        c.step(Event::Command(Command::SelectDevice("cam1".into()))).await;
        assert_eq!(c.view().status, None);
        assert!(c.view().start_enabled);
        assert_eq!(rig.camera.live_tracks(), 1);
        assert_eq!(rig.camera.max_live_tracks(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_while_connecting_leaves_nothing_running() {
        let mut rig = rig(&["cam0"], ConnectMode::Hang);
        let c = &mut rig.controller;
        c.init().await;
        c.step(Event::Command(Command::Start)).await;
        drive_until(c, |c| c.view().session_id.is_some()).await;
        assert_eq!(c.view().phase, SessionPhase::Connecting);
        assert!(!c.timers.clocks_running());

        c.step(Event::Command(Command::End)).await;
        assert_eq!(c.view().phase, SessionPhase::Ended);
        assert!(c.timers.is_idle());
        assert_eq!(rig.camera.live_tracks(), 0);

        drive_until(c, |c| c.view().navigate_to.is_some()).await;
        assert_eq!(c.view().navigate_to.as_deref(), Some("/results/42"));
        assert_eq!(rig.api.end_calls().len(), 1);

        // nothing left to tick
        time::advance(Duration::from_secs(60)).await;
        assert!(c.events_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_before_session_exists_stops_everything() {
        let mut rig = rig(&["cam0"], ConnectMode::Open);
        rig.api.hang_create();
        let c = &mut rig.controller;
        c.init().await;
        c.step(Event::Command(Command::Start)).await;
        assert_eq!(c.view().phase, SessionPhase::Connecting);
        c.step(Event::Command(Command::End)).await;

        assert_eq!(c.view().phase, SessionPhase::Ended);
        assert_eq!(c.view().session_id, None);
        assert!(c.timers.is_idle());
        assert!(!c.timers.clocks_running());
        assert_eq!(rig.camera.live_tracks(), 0);
        assert_eq!(c.view().navigate_to, None);
        assert_eq!(c.outcome.as_ref().map(|o| o.route.clone()), Some(None));

        time::advance(Duration::from_secs(60)).await;
        assert!(c.events_rx.try_recv().is_err());
        assert!(rig.api.end_calls().is_empty());
        assert!(rig.connector.take_peer().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_camera_lost_while_connecting_returns_to_setup() {
        let mut rig = rig(&["cam0"], ConnectMode::Open);
        let c = &mut rig.controller;
        c.init().await;
        c.step(Event::Command(Command::Start)).await;
        c.camera.release();
        rig.camera.fail_device("cam0");

        drive_until(c, |c| c.view().phase == SessionPhase::Setup).await;
        assert!(c.view().status.as_deref().unwrap().contains("cam0"));
        assert!(!c.view().start_enabled);
        assert!(c.timers.is_idle());
        assert!(c.socket.is_none());
        assert_eq!(c.camera.surface(), Surface::Preview);
        assert_eq!(rig.camera.live_tracks(), 0);
        assert!(rig.clock.seeks().is_empty());

        // the session the server created is closed again
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(rig.api.end_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_deadline_returns_to_setup() {
        let mut rig = rig(&["cam0"], ConnectMode::Hang);
        let c = &mut rig.controller;
        c.init().await;
        let started = Instant::now();
        c.step(Event::Command(Command::Start)).await;
        drive_until(c, |c| c.view().phase == SessionPhase::Setup).await;

        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(c.view().status.as_deref().unwrap().contains("timed out"));
        assert!(c.view().start_enabled);
        assert!(c.timers.is_idle());
        assert_eq!(rig.camera.live_tracks(), 1);

        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(rig.api.end_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_socket_returns_to_setup() {
        let mut rig = rig(&["cam0"], ConnectMode::Refuse);
        let c = &mut rig.controller;
        c.init().await;
        c.step(Event::Command(Command::Start)).await;
        drive_until(c, |c| c.view().phase == SessionPhase::Setup).await;
        assert!(c.view().status.as_deref().unwrap().contains("connection refused"));
        assert_eq!(c.view().session_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_failure_returns_to_setup() {
        let mut rig = rig(&["cam0"], ConnectMode::Open);
        rig.api.fail_create();
        let c = &mut rig.controller;
        c.init().await;
        c.step(Event::Command(Command::Start)).await;
        drive_until(c, |c| c.view().phase == SessionPhase::Setup).await;
        assert!(c.view().status.as_deref().unwrap().contains("503"));
        assert!(rig.connector.take_peer().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_socket_loss_returns_to_setup_with_preview() {
        let mut rig = rig(&["cam0"], ConnectMode::Open);
        let peer = go_active(&mut rig).await;
        let c = &mut rig.controller;
        assert_eq!(c.camera.surface(), Surface::Live);

        peer.close();
        drive_until(c, |c| c.view().phase == SessionPhase::Setup).await;
        assert!(c.timers.is_idle());
        assert!(c.socket.is_none());
        assert_eq!(c.camera.surface(), Surface::Preview);
        assert_eq!(rig.camera.live_tracks(), 1);
        assert_eq!(c.view().status.as_deref(), Some(CONNECTION_LOST));
        assert!(c.view().start_enabled);
        assert!(!rig.clock.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_end_navigates_without_http_call() {
        let mut rig = rig(&["cam0"], ConnectMode::Open);
        let peer = go_active(&mut rig).await;
        let c = &mut rig.controller;
        peer.send(json!({"type": "session_ended", "report": {"shots": 12}}));
        drive_until(c, |c| c.view().navigate_to.is_some()).await;
        assert_eq!(c.view().phase, SessionPhase::Ended);
        assert_eq!(c.view().navigate_to.as_deref(), Some("/results/42"));
        assert!(rig.api.end_calls().is_empty());
        assert_eq!(rig.camera.live_tracks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_are_sent_while_active() {
        let mut rig = rig(&["cam0"], ConnectMode::Open);
        let mut peer = go_active(&mut rig).await;
        let c = &mut rig.controller;
        drive_until(c, |c| c.view().frames_sent >= 2).await;

        let text = peer.frames.try_recv().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "frame");
        assert_eq!(value["data"], STANDARD.encode(FAKE_JPEG));
        assert!(value["timestamp"].as_f64().unwrap() >= 0.1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_ping() {
        let mut rig = rig(&["cam0"], ConnectMode::Open);
        let mut peer = go_active(&mut rig).await;
        let c = &mut rig.controller;
        let started = Instant::now();
        drive_until(c, |c| c.pings_sent >= 1).await;
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(peer.drain_control().contains(&"ping".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_messages_are_swallowed() {
        let mut rig = rig(&["cam0"], ConnectMode::Open);
        let peer = go_active(&mut rig).await;
        let c = &mut rig.controller;
        peer.send_text("not json");
        peer.send(json!({"type": "unknown_kind"}));
        peer.send(json!({"type": "mimic_update", "feedback": "ok"}));
        drive_until(c, |c| c.view().scores.feedback == "ok").await;
        assert_eq!(c.view().phase, SessionPhase::Active);
        assert_eq!(c.view().status, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drift_correction_only_beyond_tolerance() {
        let mut rig = rig(&["cam0"], ConnectMode::Open);
        let peer = go_active(&mut rig).await;
        let c = &mut rig.controller;
        assert_eq!(rig.clock.seeks(), vec![0.0]);
        assert!(rig.clock.is_playing());

        rig.clock.set_position(3.0);
        peer.send(json!({"type": "mimic_update", "ref_time": 3.5, "feedback": "a"}));
        drive_until(c, |c| c.view().scores.feedback == "a").await;
        assert_eq!(rig.clock.seeks(), vec![0.0]);
        assert_eq!(c.view().reference_position, 3.0);

        peer.send(json!({"type": "mimic_update", "ref_time": 5.25, "feedback": "b"}));
        drive_until(c, |c| c.view().scores.feedback == "b").await;
        assert_eq!(rig.clock.seeks(), vec![0.0, 5.25]);
        assert_eq!(c.view().reference_position, 5.25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pose_update_redraws_overlay_at_camera_size() {
        let mut rig = rig(&["cam0"], ConnectMode::Open);
        let peer = go_active(&mut rig).await;
        let c = &mut rig.controller;
        let mut overlay = c.overlay();

        peer.send(json!({
            "type": "mimic_update",
            "pose": {
                "landmarks": [{"x": 0.25, "y": 0.25, "visibility": 0.9}, {"x": 0.75, "y": 0.75, "visibility": 0.9}],
                "connections": [[0, 1]]
            }
        }));
        drive_until(c, |_| overlay.has_changed().unwrap_or(false)).await;
        let drawn = overlay.borrow_and_update().clone();
        assert_eq!((drawn.width(), drawn.height()), (640, 480));
        assert!(!drawn.is_blank());
        // joint centres
        assert_ne!(drawn.pixel(160, 120), 0);
        assert_ne!(drawn.pixel(480, 360), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_twice_is_safe() {
        let mut rig = rig(&["cam0"], ConnectMode::Open);
        let _peer = go_active(&mut rig).await;
        let c = &mut rig.controller;
        assert!(c.timers.clocks_running());

        c.teardown();
        c.teardown();
        assert!(c.timers.is_idle());
        assert!(c.socket.is_none());
        assert_eq!(rig.camera.live_tracks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_attempt_events_are_ignored() {
        let mut rig = rig(&["cam0"], ConnectMode::Open);
        let _peer = go_active(&mut rig).await;
        let c = &mut rig.controller;
        let old = c.attempt - 1;
        c.step(Event::Socket {
            attempt: old,
            event: SocketEvent::Closed,
        })
        .await;
        assert_eq!(c.view().phase, SessionPhase::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_server_ends() {
        let rig = rig(&["cam0"], ConnectMode::Open);
        let handle = rig.controller.handle();
        let mut view = rig.controller.subscribe();
        let task = tokio::spawn(rig.controller.run());

        view.wait_for(|v| v.start_enabled).await.unwrap();
        assert!(handle.start());
        view.wait_for(|v| v.phase == SessionPhase::Active).await.unwrap();
        handle.set_display_mode(DisplayMode::Composite);

        let peer = rig.connector.take_peer().unwrap();
        peer.send(json!({"type": "session_ended", "report": {"grade": "B"}}));

        let outcome = task.await.unwrap();
        assert_eq!(outcome.route.as_deref(), Some("/results/42"));
        assert_eq!(outcome.report, Some(json!({"grade": "B"})));
        assert!(!handle.start());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_commands_wait_for_the_end_call() {
        let mut rig = rig(&["cam0"], ConnectMode::Open);
        let _peer = go_active(&mut rig).await;
        let c = &mut rig.controller;
        // as in run(): the controller keeps no sender of its own
        c.commands_tx = None;

        drive_until(c, |c| c.view().phase == SessionPhase::Ended).await;
        assert!(c.commands_closed);
        assert!(c.end_call.is_some());

        let ended_at = Instant::now();
        let mut turns = 0;
        while c.outcome.is_none() {
            c.turn().await;
            turns += 1;
            assert!(turns < 100, "loop kept waking without events");
        }
        assert!(ended_at.elapsed() >= Duration::from_millis(500));
        assert_eq!(rig.api.end_calls().len(), 1);
        assert_eq!(c.view().navigate_to.as_deref(), Some("/results/42"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_every_handle_shuts_down() {
        let rig = rig(&["cam0"], ConnectMode::Open);
        let handle = rig.controller.handle();
        let task = tokio::spawn(rig.controller.run());
        drop(handle);
        let outcome = task.await.unwrap();
        assert_eq!(outcome.route, None);
        assert_eq!(rig.camera.live_tracks(), 0);
    }
}
