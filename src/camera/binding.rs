use std::sync::Arc;
use tracing::{debug, info};

use super::{CaptureDevice, CaptureTrack, DeviceInfo, RasterFrame, Resolution};
use crate::error::DeviceError;

/// Which video view the live track feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    /// Setup screen preview
    Preview,
    /// Session view under the overlay
    Live,
}

/// At most one live track at a time.
///
/// Switching devices stops the current track before the next one is
/// requested, so two streams never hold the hardware at once.
pub struct CameraBinding {
    device: Arc<dyn CaptureDevice>,
    request: Resolution,
    track: Option<Box<dyn CaptureTrack>>,
    surface: Surface,
    selected: Option<String>,
}

impl CameraBinding {
    pub fn new(device: Arc<dyn CaptureDevice>, request: Resolution) -> Self {
        Self {
            device,
            request,
            track: None,
            surface: Surface::Preview,
            selected: None,
        }
    }

    /// Unlocks labels with a throwaway grant, then lists video inputs.
    pub async fn enumerate(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        self.device.unlock().await?;
        let devices = self.device.enumerate().await?;
        debug!(count = devices.len(), "cameras enumerated");
        Ok(devices)
    }

    /// Binds `device_id` to the current surface.
    ///
    /// The selection is remembered even when acquisition fails so that a
    /// later [`reacquire`](Self::reacquire) retries the same device.
    pub async fn select(&mut self, device_id: &str) -> Result<Resolution, DeviceError> {
        self.release();
        self.selected = Some(device_id.to_string());
        let track = self.device.acquire(device_id, self.request).await?;
        let resolution = track.resolution();
        info!(
            device = device_id,
            width = resolution.width,
            height = resolution.height,
            surface = ?self.surface,
            "camera bound"
        );
        self.track = Some(track);
        Ok(resolution)
    }

    /// Re-acquires the last selected device if nothing is live.
    pub async fn reacquire(&mut self) -> Result<Option<Resolution>, DeviceError> {
        if let Some(track) = &self.track {
            return Ok(Some(track.resolution()));
        }
        match self.selected.clone() {
            Some(id) => self.select(&id).await.map(Some),
            None => Ok(None),
        }
    }

    /// Moves the live track to another surface without re-acquiring.
    pub fn bind(&mut self, surface: Surface) {
        self.surface = surface;
    }

    pub fn surface(&self) -> Surface {
        self.surface
    }

    /// Stops and hands back the live track. Returns false when nothing was live.
    pub fn release(&mut self) -> bool {
        match self.track.take() {
            Some(track) => {
                debug!(device = track.device_id(), "camera released");
                self.device.release(track);
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.track.is_some()
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn resolution(&self) -> Option<Resolution> {
        self.track.as_ref().map(|t| t.resolution())
    }

    pub fn snapshot(&self) -> Option<RasterFrame> {
        self.track.as_ref().and_then(|t| t.snapshot())
    }
}

impl Drop for CameraBinding {
    fn drop(&mut self) {
        self.release();
    }
}
