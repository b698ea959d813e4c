//! In-crate fakes for the controller's capabilities.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Instant;
use url::Url;

use crate::api::{EndOutcome, SessionApi, SessionId};
use crate::camera::encode::check_layout;
use crate::camera::{CaptureDevice, CaptureTrack, DeviceInfo, FrameEncoder, RasterFrame, Resolution};
use crate::error::{ApiError, DeviceError, EncodeError, TransportError};
use crate::session::drift::ReferenceClock;
use crate::socket::{SocketConnector, SocketEvent, SocketLink};

// --- Camera ---

#[derive(Default)]
struct CameraState {
    devices: Vec<DeviceInfo>,
    failing: HashSet<String>,
    denied: bool,
    calls: Vec<&'static str>,
    live: usize,
    max_live: usize,
    acquires: usize,
}

#[derive(Clone, Default)]
pub struct FakeCamera {
    state: Arc<Mutex<CameraState>>,
}

impl FakeCamera {
    pub fn with_devices(ids: &[&str]) -> Self {
        let camera = Self::default();
        camera.state.lock().unwrap().devices = ids
            .iter()
            .map(|id| DeviceInfo {
                id: id.to_string(),
                label: format!("Fake {id}"),
            })
            .collect();
        camera
    }

    pub fn fail_device(&self, id: &str) {
        self.state.lock().unwrap().failing.insert(id.to_string());
    }

    pub fn heal_device(&self, id: &str) {
        self.state.lock().unwrap().failing.remove(id);
    }

    pub fn deny_permission(&self) {
        self.state.lock().unwrap().denied = true;
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn live_tracks(&self) -> usize {
        self.state.lock().unwrap().live
    }

    pub fn max_live_tracks(&self) -> usize {
        self.state.lock().unwrap().max_live
    }

    pub fn acquire_count(&self) -> usize {
        self.state.lock().unwrap().acquires
    }
}

#[async_trait]
impl CaptureDevice for FakeCamera {
    async fn unlock(&self) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("unlock");
        if state.denied {
            return Err(DeviceError::PermissionDenied("denied by user".to_string()));
        }
        Ok(())
    }

    async fn enumerate(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("enumerate");
        Ok(state.devices.clone())
    }

    async fn acquire(
        &self,
        device_id: &str,
        request: Resolution,
    ) -> Result<Box<dyn CaptureTrack>, DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("acquire");
        if state.failing.contains(device_id) {
            return Err(DeviceError::Unavailable(device_id.to_string()));
        }
        state.live += 1;
        state.max_live = state.max_live.max(state.live);
        state.acquires += 1;
        Ok(Box::new(FakeTrack {
            device_id: device_id.to_string(),
            resolution: request,
            state: self.state.clone(),
            stopped: false,
        }))
    }
}

struct FakeTrack {
    device_id: String,
    resolution: Resolution,
    state: Arc<Mutex<CameraState>>,
    stopped: bool,
}

impl CaptureTrack for FakeTrack {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn snapshot(&self) -> Option<RasterFrame> {
        if self.stopped {
            return None;
        }
        let Resolution { width, height } = self.resolution;
        Some(RasterFrame::new(width, height, vec![0; (width * height * 3) as usize]))
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.state.lock().unwrap().live -= 1;
        }
    }
}

// --- Encoder ---

pub const FAKE_JPEG: [u8; 4] = [0xff, 0xd8, 0xff, 0xd9];

pub struct FakeEncoder;

impl FrameEncoder for FakeEncoder {
    fn encode(&self, frame: &RasterFrame) -> Result<Vec<u8>, EncodeError> {
        check_layout(frame)?;
        Ok(FAKE_JPEG.to_vec())
    }
}

// --- HTTP ---

#[derive(Default)]
struct ApiState {
    fail_create: bool,
    hang_create: bool,
    creates: usize,
    end_calls: Vec<(SessionId, Instant)>,
}

#[derive(Clone, Default)]
pub struct FakeApi {
    state: Arc<Mutex<ApiState>>,
}

impl FakeApi {
    pub fn fail_create(&self) {
        self.state.lock().unwrap().fail_create = true;
    }

    /// Create calls never return.
    pub fn hang_create(&self) {
        self.state.lock().unwrap().hang_create = true;
    }

    pub fn creates(&self) -> usize {
        self.state.lock().unwrap().creates
    }

    pub fn end_calls(&self) -> Vec<(SessionId, Instant)> {
        self.state.lock().unwrap().end_calls.clone()
    }
}

#[async_trait]
impl SessionApi for FakeApi {
    async fn create_session(&self, _challenge_id: &str) -> Result<SessionId, ApiError> {
        let hang = {
            let mut state = self.state.lock().unwrap();
            state.creates += 1;
            if state.fail_create {
                return Err(ApiError::Status {
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
            state.hang_create
        };
        if hang {
            futures::future::pending::<()>().await;
        }
        Ok(SessionId::new("42"))
    }

    async fn end_session(&self, id: &SessionId) -> Result<EndOutcome, ApiError> {
        let mut state = self.state.lock().unwrap();
        let already = !state.end_calls.is_empty();
        state.end_calls.push((id.clone(), Instant::now()));
        Ok(if already {
            EndOutcome::AlreadyEnded
        } else {
            EndOutcome::Ended
        })
    }

    async fn fetch_reference_video(&self, _challenge_id: &str) -> Result<Bytes, ApiError> {
        Ok(Bytes::from_static(b"not really a video"))
    }

    fn socket_url(&self, id: &SessionId) -> Result<Url, ApiError> {
        Ok(Url::parse(&format!("ws://fake/ws/mimic/{id}?token=t"))?)
    }
}

// --- Socket ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    Open,
    Refuse,
    /// Never completes
    Hang,
}

/// Server end of a fake socket.
pub struct FakePeer {
    pub url: Url,
    pub frames: mpsc::Receiver<String>,
    pub control: mpsc::UnboundedReceiver<String>,
    pub inbound: mpsc::UnboundedSender<SocketEvent>,
}

impl FakePeer {
    pub fn send(&self, value: serde_json::Value) {
        self.send_text(&value.to_string());
    }

    pub fn send_text(&self, text: &str) {
        let _ = self.inbound.send(SocketEvent::Text(text.to_string()));
    }

    pub fn close(&self) {
        let _ = self.inbound.send(SocketEvent::Closed);
    }

    pub fn drain_control(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(text) = self.control.try_recv() {
            out.push(text);
        }
        out
    }
}

#[derive(Clone)]
pub struct FakeConnector {
    mode: ConnectMode,
    queue: usize,
    peers: Arc<Mutex<Vec<FakePeer>>>,
}

impl FakeConnector {
    pub fn new(mode: ConnectMode, queue: usize) -> Self {
        Self {
            mode,
            queue,
            peers: Arc::default(),
        }
    }

    pub fn take_peer(&self) -> Option<FakePeer> {
        self.peers.lock().unwrap().pop()
    }
}

#[async_trait]
impl SocketConnector for FakeConnector {
    async fn connect(&self, url: &Url) -> Result<SocketLink, TransportError> {
        match self.mode {
            ConnectMode::Refuse => Err(TransportError::Connect("connection refused".to_string())),
            ConnectMode::Hang => futures::future::pending().await,
            ConnectMode::Open => {
                let (frames_tx, frames_rx) = mpsc::channel(self.queue);
                let (control_tx, control_rx) = mpsc::unbounded_channel();
                let (in_tx, in_rx) = mpsc::unbounded_channel();
                self.peers.lock().unwrap().push(FakePeer {
                    url: url.clone(),
                    frames: frames_rx,
                    control: control_rx,
                    inbound: in_tx,
                });
                Ok(SocketLink {
                    frames: frames_tx,
                    control: control_tx,
                    inbound: in_rx,
                })
            }
        }
    }
}

// --- Reference clock ---

#[derive(Default)]
struct ClockState {
    position: f64,
    playing: bool,
    seeks: Vec<f64>,
}

/// Position only moves when a test sets it.
#[derive(Clone, Default)]
pub struct ManualClock {
    state: Arc<Mutex<ClockState>>,
}

impl ManualClock {
    pub fn set_position(&self, secs: f64) {
        self.state.lock().unwrap().position = secs;
    }

    pub fn seeks(&self) -> Vec<f64> {
        self.state.lock().unwrap().seeks.clone()
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().unwrap().playing
    }
}

impl ReferenceClock for ManualClock {
    fn position(&self) -> f64 {
        self.state.lock().unwrap().position
    }

    fn seek(&mut self, secs: f64) {
        let mut state = self.state.lock().unwrap();
        state.position = secs;
        state.seeks.push(secs);
    }

    fn play(&mut self) {
        self.state.lock().unwrap().playing = true;
    }

    fn pause(&mut self) {
        self.state.lock().unwrap().playing = false;
    }
}
