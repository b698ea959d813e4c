use crate::protocol::MimicUpdate;

/// Latest scores and feedback. Each update replaces the previous one whole.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreSnapshot {
    pub upper_body: Option<f64>,
    pub lower_body: Option<f64>,
    pub composite: Option<f64>,
    pub feedback: String,
    pub player_detected: Option<bool>,
}

impl ScoreSnapshot {
    pub fn from_update(update: &MimicUpdate) -> Self {
        let scores = update.scores.clone().unwrap_or_default();
        Self {
            upper_body: scores.upper_body,
            lower_body: scores.lower_body,
            composite: scores.composite,
            feedback: update.feedback.clone().unwrap_or_default(),
            player_detected: update.player_detected,
        }
    }

    /// The number shown to the user.
    pub fn display_score(&self) -> Option<f64> {
        self.composite
    }
}
