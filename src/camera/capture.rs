use async_trait::async_trait;
use opencv::{
    core::Mat,
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture, CAP_ANY},
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{CaptureDevice, CaptureTrack, DeviceInfo, RasterFrame, Resolution};
use crate::error::DeviceError;

/// OpenCV を使用したカメラ
///
/// Device ids are capture indices ("0", "1", ...).
pub struct OpenCvCaptureDevice {
    probe_count: i32,
    probe_timeout: Duration,
    tap: FrameTap,
    closing: Closing,
}

impl OpenCvCaptureDevice {
    pub fn new(probe_count: i32, probe_timeout: Duration) -> Self {
        Self {
            probe_count,
            probe_timeout,
            tap: FrameTap::default(),
            closing: Closing::default(),
        }
    }

    /// Read side of whichever track is live, for drawing the video.
    pub fn tap(&self) -> FrameTap {
        self.tap.clone()
    }
}

/// Latest frame of the live track. Empty while nothing is bound.
#[derive(Clone, Default)]
pub struct FrameTap {
    slot: Arc<Mutex<Option<RasterFrame>>>,
}

impl FrameTap {
    pub fn latest(&self) -> Option<RasterFrame> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Capture threads that were told to stop but may still be inside `read()`.
/// `acquire` waits for them so a device is closed before it opens again.
#[derive(Clone, Default)]
struct Closing(Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>);

impl Closing {
    /// Joins on the blocking pool when a runtime is around, inline otherwise.
    fn push(&self, handle: thread::JoinHandle<()>) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let join = runtime.spawn_blocking(move || {
                    let _ = handle.join();
                });
                self.0.lock().unwrap_or_else(PoisonError::into_inner).push(join);
            }
            Err(_) => {
                let _ = handle.join();
            }
        }
    }

    async fn wait(&self) {
        let pending = std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner));
        for join in pending {
            let _ = join.await;
        }
    }
}

fn backend(device: &str, e: impl ToString) -> DeviceError {
    DeviceError::Backend {
        device: device.to_string(),
        message: e.to_string(),
    }
}

fn parse_index(device_id: &str) -> Result<i32, DeviceError> {
    device_id
        .parse::<i32>()
        .map_err(|_| DeviceError::Unavailable(device_id.to_string()))
}

/// 全indexを並列プローブしてタイムアウト内に応答したカメラを返す
fn probe_cameras(max_index: i32, timeout: Duration) -> Vec<(i32, String)> {
    let (tx, rx) = mpsc::channel();

    for i in 0..max_index {
        let tx = tx.clone();
        thread::spawn(move || {
            if let Ok(cap) = VideoCapture::new(i, CAP_ANY) {
                if cap.is_opened().unwrap_or(false) {
                    let backend = cap.get_backend_name().unwrap_or_default();
                    let _ = tx.send((i, backend));
                }
            }
        });
    }
    drop(tx);

    let deadline = Instant::now() + timeout;
    let mut found = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match rx.recv_timeout(remaining) {
            Ok(hit) => found.push(hit),
            Err(_) => break,
        }
    }
    found.sort();
    found
}

/// BGR 8UC3 の連続バッファに変換
fn to_raster(frame: &Mat) -> opencv::Result<RasterFrame> {
    let bgr = match frame.channels() {
        4 => {
            let mut out = Mat::default();
            imgproc::cvt_color_def(frame, &mut out, imgproc::COLOR_BGRA2BGR)?;
            out
        }
        1 => {
            let mut out = Mat::default();
            imgproc::cvt_color_def(frame, &mut out, imgproc::COLOR_GRAY2BGR)?;
            out
        }
        _ => frame.try_clone()?,
    };
    let bgr = if bgr.is_continuous() { bgr } else { bgr.try_clone()? };
    Ok(RasterFrame::new(
        bgr.cols() as u32,
        bgr.rows() as u32,
        bgr.data_bytes()?.to_vec(),
    ))
}

#[async_trait]
impl CaptureDevice for OpenCvCaptureDevice {
    async fn unlock(&self) -> Result<(), DeviceError> {
        // Opening once triggers the OS permission prompt; the handle is dropped right away.
        let opened = tokio::task::spawn_blocking(|| {
            VideoCapture::new(0, CAP_ANY)
                .and_then(|cap| cap.is_opened())
                .unwrap_or(false)
        })
        .await
        .map_err(|e| backend("0", e))?;
        debug!(opened, "camera grant probe");
        Ok(())
    }

    async fn enumerate(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        let max_index = self.probe_count;
        let timeout = self.probe_timeout;
        let found = tokio::task::spawn_blocking(move || probe_cameras(max_index, timeout))
            .await
            .map_err(|e| backend("probe", e))?;
        Ok(found
            .into_iter()
            .map(|(idx, backend)| DeviceInfo {
                id: idx.to_string(),
                label: if backend.is_empty() {
                    format!("camera {}", idx)
                } else {
                    format!("camera {} ({})", idx, backend)
                },
            })
            .collect())
    }

    async fn acquire(
        &self,
        device_id: &str,
        request: Resolution,
    ) -> Result<Box<dyn CaptureTrack>, DeviceError> {
        let index = parse_index(device_id)?;
        let id = device_id.to_string();
        self.closing.wait().await;
        let latest = Arc::clone(&self.tap.slot);
        let closing = self.closing.clone();
        let track = tokio::task::spawn_blocking(move || OpenCvTrack::start(id, index, request, latest, closing))
            .await
            .map_err(|e| backend(device_id, e))??;
        Ok(Box::new(track))
    }
}

/// 別スレッドでキャプチャし、最新フレームを保持するトラック
pub struct OpenCvTrack {
    device_id: String,
    resolution: Resolution,
    latest: Arc<Mutex<Option<RasterFrame>>>,
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
    closing: Closing,
}

impl OpenCvTrack {
    fn start(
        device_id: String,
        index: i32,
        request: Resolution,
        latest: Arc<Mutex<Option<RasterFrame>>>,
        closing: Closing,
    ) -> Result<Self, DeviceError> {
        let mut capture = VideoCapture::new(index, CAP_ANY).map_err(|e| backend(&device_id, e))?;
        if !capture.is_opened().map_err(|e| backend(&device_id, e))? {
            return Err(DeviceError::Unavailable(device_id));
        }

        // 解像度を設定 (ideal)
        let _ = capture.set(videoio::CAP_PROP_FRAME_WIDTH, request.width as f64);
        let _ = capture.set(videoio::CAP_PROP_FRAME_HEIGHT, request.height as f64);
        let _ = capture.set(videoio::CAP_PROP_BUFFERSIZE, 1.0);

        let width = capture.get(videoio::CAP_PROP_FRAME_WIDTH).unwrap_or(0.0) as u32;
        let height = capture.get(videoio::CAP_PROP_FRAME_HEIGHT).unwrap_or(0.0) as u32;
        let resolution = if width > 0 && height > 0 {
            Resolution::new(width, height)
        } else {
            request
        };
        info!(device = %device_id, width = resolution.width, height = resolution.height, "camera opened");

        let running = Arc::new(AtomicBool::new(true));
        let latest_ref = Arc::clone(&latest);
        let running_ref = Arc::clone(&running);
        let thread_id = device_id.clone();

        let handle = thread::spawn(move || {
            let mut frame = Mat::default();
            while running_ref.load(Ordering::Relaxed) {
                match capture.read(&mut frame) {
                    Ok(true) if !frame.empty() => match to_raster(&frame) {
                        Ok(raster) => {
                            *latest_ref.lock().unwrap_or_else(PoisonError::into_inner) = Some(raster);
                        }
                        Err(e) => warn!(device = %thread_id, "frame conversion failed: {e}"),
                    },
                    Ok(_) => thread::sleep(Duration::from_millis(5)),
                    Err(e) => {
                        warn!(device = %thread_id, "read error: {e}");
                        thread::sleep(Duration::from_millis(100));
                    }
                }
            }
            latest_ref.lock().unwrap_or_else(PoisonError::into_inner).take();
            // capture drops here and frees the device
        });

        Ok(Self {
            device_id,
            resolution,
            latest,
            running,
            handle: Some(handle),
            closing,
        })
    }
}

impl CaptureTrack for OpenCvTrack {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn snapshot(&self) -> Option<RasterFrame> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = self.handle.take() {
            self.closing.push(handle);
        }
    }
}

impl Drop for OpenCvTrack {
    fn drop(&mut self) {
        self.stop();
    }
}
