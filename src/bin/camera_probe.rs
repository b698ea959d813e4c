use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use shuttle_mimic::camera::{CaptureDevice, FrameEncoder, JpegEncoder, OpenCvCaptureDevice, Resolution};
use shuttle_mimic::config::Config;

/// Lists cameras and grabs one JPEG from each.
#[derive(Parser, Debug)]
#[command(name = "camera_probe", version = env!("MIMIC_GIT_VERSION"))]
struct Args {
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
    /// Where probe_cam<id>.jpg files go
    #[arg(long, default_value = ".")]
    out: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load_or_default(&args.config);
    let request = Resolution::new(config.camera.width, config.camera.height);
    let device = OpenCvCaptureDevice::new(
        config.camera.probe_count,
        Duration::from_millis(config.camera.probe_timeout_ms),
    );
    let encoder = JpegEncoder::new(config.session.jpeg_quality);

    println!("=== カメラプローブ ===");
    println!();

    device.unlock().await?;
    let devices = device.enumerate().await?;
    if devices.is_empty() {
        println!("カメラが見つかりません");
        return Ok(());
    }

    for info in devices {
        println!("{}: {}", info.id, info.label);
        let track = match device.acquire(&info.id, request).await {
            Ok(track) => track,
            Err(e) => {
                println!("       open err: {}", e);
                continue;
            }
        };
        let actual = track.resolution();
        println!(
            "       requested {}x{}, got {}x{}",
            request.width, request.height, actual.width, actual.height
        );

        // 最初のフレームを待つ
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut frame = None;
        while frame.is_none() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
            frame = track.snapshot();
        }

        match frame {
            Some(frame) => {
                let jpeg = encoder.encode(&frame)?;
                let path = args.out.join(format!("probe_cam{}.jpg", info.id));
                std::fs::write(&path, &jpeg)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                println!(
                    "       frame: {}x{}, jpeg {} bytes -> {}",
                    frame.width,
                    frame.height,
                    jpeg.len(),
                    path.display()
                );
            }
            None => println!("       frame: EMPTY"),
        }
        device.release(track);
        println!();
    }
    Ok(())
}
