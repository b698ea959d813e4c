pub mod overlay;
#[cfg(feature = "desktop")]
pub mod reference_video;
pub mod skeleton;
#[cfg(feature = "desktop")]
pub mod window;

use serde::Deserialize;

pub use overlay::{mix_frames, Overlay, OverlayRenderer};
#[cfg(feature = "desktop")]
pub use reference_video::ReferenceVideo;
pub use skeleton::{POSE_CONNECTIONS, VISIBILITY_THRESHOLD};
#[cfg(feature = "desktop")]
pub use minifb::Key;
#[cfg(feature = "desktop")]
pub use window::SessionWindow;

/// How the live and reference videos are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayMode {
    /// Two separate views; only the local skeleton is drawn
    #[default]
    SideBySide,
    /// Reference blended onto the live view; both skeletons drawn
    Composite,
}

impl DisplayMode {
    pub fn toggled(self) -> Self {
        match self {
            DisplayMode::SideBySide => DisplayMode::Composite,
            DisplayMode::Composite => DisplayMode::SideBySide,
        }
    }
}
