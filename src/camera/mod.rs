//! Camera capability used by the session controller.
//!
//! Platform media APIs stay behind [`CaptureDevice`]; the controller only sees
//! device ids, tracks and raster frames.

pub mod binding;
#[cfg(feature = "desktop")]
pub mod capture;
pub mod encode;

use async_trait::async_trait;

use crate::error::DeviceError;

pub use binding::{CameraBinding, Surface};
#[cfg(feature = "desktop")]
pub use capture::{FrameTap, OpenCvCaptureDevice};
pub use encode::FrameEncoder;
#[cfg(feature = "desktop")]
pub use encode::JpegEncoder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub label: String,
}

/// 8-bit BGR, rows packed without padding.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl RasterFrame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self { width, height, data }
    }

    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

/// A live capture stream from one device.
pub trait CaptureTrack: Send + Sync {
    fn device_id(&self) -> &str;

    /// Actual resolution, which may differ from what was requested.
    fn resolution(&self) -> Resolution;

    /// Latest frame, `None` until the first one arrives or after `stop`.
    fn snapshot(&self) -> Option<RasterFrame>;

    /// Stops capture. Safe to call more than once.
    fn stop(&mut self);
}

#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Throwaway capture grant so that `enumerate` can return labels.
    async fn unlock(&self) -> Result<(), DeviceError>;

    async fn enumerate(&self) -> Result<Vec<DeviceInfo>, DeviceError>;

    /// `request` is an ideal size, not a hard constraint.
    async fn acquire(
        &self,
        device_id: &str,
        request: Resolution,
    ) -> Result<Box<dyn CaptureTrack>, DeviceError>;

    fn release(&self, mut track: Box<dyn CaptureTrack>) {
        track.stop();
    }
}
