use anyhow::{Context, Result};
use clap::Parser;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use shuttle_mimic::api::{HttpSessionApi, SessionApi};
use shuttle_mimic::camera::{FrameTap, JpegEncoder, OpenCvCaptureDevice, Resolution};
use shuttle_mimic::config::Config;
use shuttle_mimic::logging;
use shuttle_mimic::render::{mix_frames, DisplayMode, Key, Overlay, ReferenceVideo, SessionWindow};
use shuttle_mimic::session::{
    ControllerHandle, ControllerParts, MimicController, PlaybackClock, ReferenceClock, SessionOutcome,
    SessionPhase, ViewState,
};
use shuttle_mimic::socket::WsConnector;

/// Live mimic session against a reference drill video.
#[derive(Parser, Debug)]
#[command(name = "shuttle-mimic", version = env!("MIMIC_GIT_VERSION"))]
struct Args {
    /// Challenge to mimic
    #[arg(long)]
    challenge: String,
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
    /// Camera id (capture index); overrides camera.device
    #[arg(long)]
    device: Option<String>,
    /// Start in the composited display mode
    #[arg(long)]
    composite: bool,
}

const TITLE: &str = "Shuttle Mimic";
/// Reference video opacity in the composited view
const REFERENCE_ALPHA: u8 = 110;

fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = Config::load_or_default(&args.config);
    if let Some(device) = args.device.clone() {
        config.camera.device = Some(device);
    }
    if args.composite {
        config.overlay.display_mode = DisplayMode::Composite;
    }

    let log = logging::init("mimic", &config.logging)?;
    info!("Shuttle Mimic ({})", env!("MIMIC_GIT_VERSION"));
    info!(
        api = %config.server.api_base,
        fps = config.session.capture_fps,
        log = %log.path.display(),
        "config"
    );

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    let api = Arc::new(HttpSessionApi::new(&config.server)?);

    // お手本動画: missing video only disables the reference view
    let reference = match runtime.block_on(download_reference(api.as_ref(), &args.challenge)) {
        Ok(path) => {
            let size = Resolution::new(config.camera.width, config.camera.height);
            match ReferenceVideo::open(&path, config.session.drift_tolerance, size) {
                Ok(video) => Some(video),
                Err(e) => {
                    warn!("reference video unreadable: {e:#}");
                    None
                }
            }
        }
        Err(e) => {
            warn!("reference video unavailable: {e:#}");
            None
        }
    };

    let camera = Arc::new(OpenCvCaptureDevice::new(
        config.camera.probe_count,
        Duration::from_millis(config.camera.probe_timeout_ms),
    ));
    let tap = camera.tap();
    let clock = PlaybackClock::new();
    let parts = ControllerParts {
        camera,
        encoder: Arc::new(JpegEncoder::new(config.session.jpeg_quality)),
        api,
        connector: Arc::new(WsConnector::new(config.session.outbound_queue)),
        clock: Box::new(clock.clone()),
    };

    let controller = MimicController::new(parts, args.challenge.clone(), &config);
    let handle = controller.handle();
    let view = controller.subscribe();
    let overlay = controller.overlay();
    let session = runtime.spawn(controller.run());

    print_help();
    spawn_console(handle.clone(), view.clone());
    runtime.spawn(report_changes(view.clone()));

    let screen = Screen {
        width: config.camera.width as usize,
        height: config.camera.height as usize,
        handle: handle.clone(),
        view,
        overlay,
        tap,
        clock,
        reference,
    };
    let window_result = screen.run(&session);

    // Closing the window ends an open session before exiting
    handle.shutdown();
    drop(handle);
    let outcome = runtime.block_on(session).context("controller task failed")?;

    match &outcome.route {
        Some(route) => println!("結果: {}", route),
        None => println!("セッションは作成されませんでした"),
    }
    if let Some(score) = outcome.scores.display_score() {
        println!("最終スコア: {:.0}", score);
    }
    if let Some(report) = &outcome.report {
        println!("{}", serde_json::to_string_pretty(report)?);
    }
    window_result
}

async fn download_reference(api: &dyn SessionApi, challenge: &str) -> Result<PathBuf> {
    let bytes = api
        .fetch_reference_video(challenge)
        .await
        .context("failed to download reference video")?;
    let path = std::env::temp_dir().join(format!("mimic_reference_{}.mp4", sanitize(challenge)));
    tokio::fs::write(&path, &bytes)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!(bytes = bytes.len(), path = %path.display(), "reference video saved");
    Ok(path)
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn print_help() {
    println!("=== {} ({}) ===", TITLE, env!("MIMIC_GIT_VERSION"));
    println!("コマンド:");
    println!("  l          - カメラ一覧");
    println!("  d <id>     - カメラを選択");
    println!("  s          - セッション開始");
    println!("  e          - セッション終了");
    println!("  m          - 表示モード切替 (side-by-side / composite)");
    println!("  q          - 終了");
    println!("ウィンドウ: Space=開始/終了, Tab=表示モード, Esc=閉じる");
    println!();
}

/// Console commands, one per line, on a plain thread (stdin blocks).
fn spawn_console(handle: ControllerHandle, view: watch::Receiver<ViewState>) {
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let parts: Vec<&str> = line.split_whitespace().collect();
            let delivered = match parts.as_slice() {
                [] => true,
                ["l"] => {
                    let state = view.borrow().clone();
                    if state.devices.is_empty() {
                        println!("カメラが見つかりません");
                    }
                    for device in &state.devices {
                        let mark = if state.selected_device.as_deref() == Some(device.id.as_str()) {
                            "*"
                        } else {
                            " "
                        };
                        println!(" {} {:>3}  {}", mark, device.id, device.label);
                    }
                    true
                }
                ["d", id] => handle.select_device(*id),
                ["s"] => handle.start(),
                ["e"] => handle.end(),
                ["m"] => handle.set_display_mode(view.borrow().display_mode.toggled()),
                ["q"] => {
                    handle.shutdown();
                    break;
                }
                _ => {
                    println!("不明なコマンド: {}", line.trim());
                    true
                }
            };
            if !delivered {
                break;
            }
            let _ = io::stdout().flush();
        }
    });
}

/// Prints phase and status changes as they happen.
async fn report_changes(mut view: watch::Receiver<ViewState>) {
    let mut last = (SessionPhase::Setup, None::<String>);
    while view.changed().await.is_ok() {
        let state = view.borrow_and_update().clone();
        let current = (state.phase, state.status.clone());
        if current != last {
            println!("{}", state.status_line());
            last = current;
        }
    }
}

struct Screen {
    width: usize,
    height: usize,
    handle: ControllerHandle,
    view: watch::Receiver<ViewState>,
    overlay: watch::Receiver<Arc<Overlay>>,
    tap: FrameTap,
    clock: PlaybackClock,
    reference: Option<ReferenceVideo>,
}

impl Screen {
    /// Draws until the window closes or the controller finishes.
    fn run(mut self, session: &tokio::task::JoinHandle<SessionOutcome>) -> Result<()> {
        let mut window = SessionWindow::new(TITLE, self.width * 2, self.height)?;
        let mut title = String::new();

        while window.is_open() && !session.is_finished() {
            let state = self.view.borrow().clone();

            if window.is_key_pressed(Key::Space) {
                match state.phase {
                    SessionPhase::Setup => {
                        self.handle.start();
                    }
                    SessionPhase::Connecting | SessionPhase::Active => {
                        self.handle.end();
                    }
                    SessionPhase::Ended => {}
                }
            }
            if window.is_key_pressed(Key::Tab) {
                self.handle.set_display_mode(state.display_mode.toggled());
            }

            window.clear();
            let reference = match (&mut self.reference, state.phase) {
                (Some(video), SessionPhase::Active) => match video.frame_at(self.clock.position()) {
                    Ok(frame) => frame.cloned(),
                    Err(e) => {
                        warn!("reference decode failed: {e:#}");
                        None
                    }
                },
                _ => None,
            };

            if let Some(mut live) = self.tap.latest() {
                if state.display_mode == DisplayMode::Composite {
                    if let Some(reference) = &reference {
                        mix_frames(&mut live, reference, REFERENCE_ALPHA);
                    }
                }
                if state.phase == SessionPhase::Active {
                    self.overlay.borrow().composite_onto(&mut live);
                }
                window.draw_frame_at(&live, 0, 0);
            }
            if state.display_mode == DisplayMode::SideBySide {
                if let Some(reference) = &reference {
                    window.draw_frame_at(reference, self.width, 0);
                }
            }

            let line = format!("{} - {}", TITLE, state.status_line());
            if line != title {
                window.set_title(&line);
                title = line;
            }
            window.update()?;
            thread::sleep(Duration::from_millis(15));
        }
        Ok(())
    }
}
