//! Session socket protocol.
//!
//! Client → server: JSON tagged by `type` (`frame`, `end_session`) and the bare
//! text `ping`. Server → client: `mimic_update` and `session_ended`.
//! Anything that fails to decode is dropped by the caller.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::pose::{Landmark, PoseFrame};

/// Liveness text. Not JSON-wrapped.
pub const PING: &str = "ping";

// --- Outbound ---

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Base64 JPEG and seconds since the session went active
    Frame { data: String, timestamp: f64 },
    EndSession,
}

impl ClientMessage {
    pub fn frame(jpeg: &[u8], timestamp: f64) -> Self {
        ClientMessage::Frame {
            data: STANDARD.encode(jpeg),
            timestamp,
        }
    }

    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// --- Inbound ---

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    MimicUpdate(MimicUpdate),
    SessionEnded {
        #[serde(default)]
        report: serde_json::Value,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Scores {
    #[serde(default)]
    pub upper_body: Option<f64>,
    #[serde(default)]
    pub lower_body: Option<f64>,
    #[serde(default, alias = "overall", alias = "total")]
    pub composite: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct WirePose {
    #[serde(default)]
    pub landmarks: Vec<Landmark>,
    #[serde(default)]
    pub connections: Vec<[usize; 2]>,
}

impl WirePose {
    pub fn into_frame(self) -> PoseFrame {
        let connections = self.connections.into_iter().map(|[a, b]| (a, b)).collect();
        PoseFrame::new(self.landmarks, connections)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MimicUpdate {
    #[serde(default)]
    pub scores: Option<Scores>,
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default)]
    pub player_detected: Option<bool>,
    /// Authoritative reference playback time (seconds)
    #[serde(default)]
    pub ref_time: Option<f64>,
    #[serde(default)]
    pub pose: Option<WirePose>,
    #[serde(default)]
    pub ref_landmarks: Option<Vec<Landmark>>,
}

impl MimicUpdate {
    pub fn has_pose_data(&self) -> bool {
        let local = self.pose.as_ref().is_some_and(|p| !p.landmarks.is_empty());
        let reference = self.ref_landmarks.as_ref().is_some_and(|l| !l.is_empty());
        local || reference
    }
}

/// `None` for anything that is not a well-formed server message.
pub fn decode(text: &str) -> Option<ServerMessage> {
    serde_json::from_str(text).ok()
}
