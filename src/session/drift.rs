use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::Instant;

/// Playback position of the reference video.
pub trait ReferenceClock: Send {
    /// Seconds into the reference video.
    fn position(&self) -> f64;
    fn seek(&mut self, secs: f64);
    fn play(&mut self);
    fn pause(&mut self);
}

/// True when the drift is large enough to warrant a visible jump.
pub fn needs_correction(local: f64, server: f64, tolerance: f64) -> bool {
    (local - server).abs() > tolerance
}

/// Seeks to `server` only beyond `tolerance`; small drift is left alone to
/// avoid jitter. Returns whether a seek happened.
pub fn correct(clock: &mut dyn ReferenceClock, server: f64, tolerance: f64) -> bool {
    if needs_correction(clock.position(), server, tolerance) {
        clock.seek(server);
        true
    } else {
        false
    }
}

#[derive(Debug, Default)]
struct ClockState {
    /// Set while playing
    anchor: Option<Instant>,
    /// Position at `anchor` (or the paused position)
    offset: f64,
}

/// Wall-clock playback position. Clones share one position, so a display
/// thread can follow what the controller corrects.
#[derive(Debug, Clone, Default)]
pub struct PlaybackClock {
    state: Arc<Mutex<ClockState>>,
}

impl PlaybackClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_playing(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .anchor
            .is_some()
    }
}

impl ReferenceClock for PlaybackClock {
    fn position(&self) -> f64 {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.anchor {
            Some(anchor) => state.offset + anchor.elapsed().as_secs_f64(),
            None => state.offset,
        }
    }

    fn seek(&mut self, secs: f64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.offset = secs.max(0.0);
        if state.anchor.is_some() {
            state.anchor = Some(Instant::now());
        }
    }

    fn play(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.anchor.is_none() {
            state.anchor = Some(Instant::now());
        }
    }

    fn pause(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(anchor) = state.anchor.take() {
            state.offset += anchor.elapsed().as_secs_f64();
        }
    }
}
