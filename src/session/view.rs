use serde_json::Value;

use super::scores::ScoreSnapshot;
use super::state::SessionPhase;
use crate::api::SessionId;
use crate::camera::DeviceInfo;
use crate::render::DisplayMode;

/// Everything a front end needs to draw the session screen.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewState {
    pub phase: SessionPhase,
    /// Non-fatal problem shown to the user (camera, connection)
    pub status: Option<String>,
    pub devices: Vec<DeviceInfo>,
    pub selected_device: Option<String>,
    pub start_enabled: bool,
    pub session_id: Option<SessionId>,
    pub scores: ScoreSnapshot,
    pub elapsed_secs: u64,
    /// Reference playback position after the last tick or correction
    pub reference_position: f64,
    pub display_mode: DisplayMode,
    pub frames_sent: u64,
    pub dropped_frames: u64,
    /// Final report from `session_ended`
    pub report: Option<Value>,
    /// Set once the controller is done
    pub navigate_to: Option<String>,
}

impl ViewState {
    /// One-line summary, e.g. `[active] 01:05 score 72 | Bend your knees`.
    pub fn status_line(&self) -> String {
        let mut line = format!(
            "[{}] {:02}:{:02}",
            self.phase.as_str(),
            self.elapsed_secs / 60,
            self.elapsed_secs % 60
        );
        match self.scores.display_score() {
            Some(score) => line.push_str(&format!(" score {score:.0}")),
            None => line.push_str(" score --"),
        }
        if !self.scores.feedback.is_empty() {
            line.push_str(" | ");
            line.push_str(&self.scores.feedback);
        }
        if let Some(status) = &self.status {
            line.push_str(" ! ");
            line.push_str(status);
        }
        line
    }
}
