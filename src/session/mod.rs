//! Session lifecycle: phase machine, controller and the pieces it owns.

pub mod controller;
pub mod drift;
pub mod scores;
pub mod state;
pub mod timers;
pub mod view;

pub use controller::{Command, ControllerHandle, ControllerParts, MimicController, SessionOutcome};
pub use drift::{PlaybackClock, ReferenceClock};
pub use scores::ScoreSnapshot;
pub use state::{transition, PhaseEvent, SessionPhase};
pub use view::ViewState;
