use anyhow::{bail, Context, Result};
use opencv::core::{Mat, Size};
use opencv::imgproc;
use opencv::prelude::*;
use opencv::videoio::{self, VideoCapture, CAP_ANY};
use std::path::Path;

use crate::camera::{RasterFrame, Resolution};
use crate::session::drift::needs_correction;

/// お手本動画. Decodes forward and follows an external playback position.
pub struct ReferenceVideo {
    capture: VideoCapture,
    frame_secs: f64,
    /// Timestamp of `current`
    decoded_at: f64,
    current: Option<RasterFrame>,
    tolerance: f64,
    /// Frames are scaled to this so they line up with the live video
    size: Resolution,
}

impl ReferenceVideo {
    pub fn open<P: AsRef<Path>>(path: P, tolerance: f64, size: Resolution) -> Result<Self> {
        let path = path.as_ref();
        let capture = VideoCapture::from_file(&path.to_string_lossy(), CAP_ANY)
            .with_context(|| format!("failed to open {}", path.display()))?;
        if !capture.is_opened()? {
            bail!("{} is not a readable video", path.display());
        }
        let fps = capture.get(videoio::CAP_PROP_FPS).unwrap_or(0.0);
        let frame_secs = if fps > 0.0 { 1.0 / fps } else { 1.0 / 30.0 };
        Ok(Self {
            capture,
            frame_secs,
            decoded_at: f64::NEG_INFINITY,
            current: None,
            tolerance,
            size,
        })
    }

    /// Frame for `position` seconds. Seeks when the decoder has drifted past
    /// the tolerance, otherwise decodes forward.
    pub fn frame_at(&mut self, position: f64) -> Result<Option<&RasterFrame>> {
        if self.current.is_none() || needs_correction(self.decoded_at, position, self.tolerance) {
            self.capture
                .set(videoio::CAP_PROP_POS_MSEC, position.max(0.0) * 1000.0)?;
            self.read_next()?;
        }
        while self.current.is_some() && self.decoded_at + self.frame_secs <= position {
            if !self.read_next()? {
                break;
            }
        }
        Ok(self.current.as_ref())
    }

    fn read_next(&mut self) -> Result<bool> {
        let mut frame = Mat::default();
        if !self.capture.read(&mut frame)? || frame.empty() {
            return Ok(false);
        }
        self.decoded_at = self.capture.get(videoio::CAP_PROP_POS_MSEC)? / 1000.0;
        let mut scaled = Mat::default();
        imgproc::resize(
            &frame,
            &mut scaled,
            Size::new(self.size.width as i32, self.size.height as i32),
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )?;
        let scaled = if scaled.is_continuous() { scaled } else { scaled.try_clone()? };
        self.current = Some(RasterFrame::new(
            scaled.cols() as u32,
            scaled.rows() as u32,
            scaled.data_bytes()?.to_vec(),
        ));
        Ok(true)
    }
}
