use crate::camera::{RasterFrame, Resolution};
use crate::pose::PoseFrame;

use super::skeleton::{LOCAL_COLOR, REFERENCE_COLOR};
use super::DisplayMode;

/// Transparent ARGB drawing surface laid over the live video.
#[derive(Debug, Clone, PartialEq)]
pub struct Overlay {
    width: usize,
    height: usize,
    buffer: Vec<u32>,
}

impl Overlay {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            buffer: vec![0u32; width * height],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn buffer(&self) -> &[u32] {
        &self.buffer
    }

    /// Match the live video's native size.
    pub fn resize(&mut self, size: Resolution) {
        let (w, h) = (size.width as usize, size.height as usize);
        if w != self.width || h != self.height {
            self.width = w;
            self.height = h;
            self.buffer = vec![0u32; w * h];
        }
    }

    /// Fully transparent.
    pub fn clear(&mut self) {
        self.buffer.fill(0);
    }

    pub fn pixel(&self, x: usize, y: usize) -> u32 {
        if x < self.width && y < self.height {
            self.buffer[y * self.width + x]
        } else {
            0
        }
    }

    pub fn is_blank(&self) -> bool {
        self.buffer.iter().all(|&p| p == 0)
    }

    /// 姿勢を描画. Low-visibility joints and their bones are skipped.
    pub fn draw_pose(&mut self, pose: &PoseFrame, color: u32, threshold: f32, radius: i32) {
        let w = self.width as u32;
        let h = self.height as u32;

        let bones: Vec<_> = pose
            .visible_bones(threshold)
            .map(|(start, end)| (start.to_pixel(w, h), end.to_pixel(w, h)))
            .collect();
        for ((x1, y1), (x2, y2)) in bones {
            self.draw_line(x1, y1, x2, y2, color);
        }

        let joints: Vec<_> = pose
            .visible_joints(threshold)
            .map(|lm| lm.to_pixel(w, h))
            .collect();
        for (px, py) in joints {
            self.draw_circle(px, py, radius, color);
        }
    }

    /// Alpha-blends onto a BGR frame of the same size. Other sizes are left untouched.
    pub fn composite_onto(&self, frame: &mut RasterFrame) {
        if frame.width as usize != self.width
            || frame.height as usize != self.height
            || frame.data.len() != frame.expected_len()
        {
            return;
        }
        for (i, &argb) in self.buffer.iter().enumerate() {
            let alpha = argb >> 24;
            if alpha == 0 {
                continue;
            }
            let px = &mut frame.data[i * 3..i * 3 + 3];
            let (r, g, b) = ((argb >> 16) & 0xFF, (argb >> 8) & 0xFF, argb & 0xFF);
            px[0] = blend(px[0], b, alpha);
            px[1] = blend(px[1], g, alpha);
            px[2] = blend(px[2], r, alpha);
        }
    }

    /// Bresenhamのアルゴリズムで線を描画
    fn draw_line(&mut self, x0: i32, y0: i32, x1: i32, y1: i32, color: u32) {
        let dx = (x1 as i64 - x0 as i64).abs();
        let dy = -(y1 as i64 - y0 as i64).abs();
        let sx = if x0 < x1 { 1 } else { -1 };
        let sy = if y0 < y1 { 1 } else { -1 };
        let mut err = dx + dy;
        let (mut x, mut y) = (x0, y0);

        loop {
            self.set_pixel(x, y, color);
            if x == x1 && y == y1 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x += sx;
            }
            if e2 <= dx {
                err += dx;
                y += sy;
            }
        }
    }

    /// 円を描画（塗りつぶし）
    fn draw_circle(&mut self, cx: i32, cy: i32, radius: i32, color: u32) {
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                if dx * dx + dy * dy <= radius * radius {
                    self.set_pixel(cx + dx, cy + dy, color);
                }
            }
        }
    }

    /// ピクセルをセット（境界チェック付き）
    fn set_pixel(&mut self, x: i32, y: i32, color: u32) {
        if x >= 0 && x < self.width as i32 && y >= 0 && y < self.height as i32 {
            self.buffer[y as usize * self.width + x as usize] = color;
        }
    }
}

fn blend(base: u8, over: u32, alpha: u32) -> u8 {
    ((over * alpha + base as u32 * (255 - alpha)) / 255) as u8
}

/// Clears and redraws the whole overlay for each pose-bearing update.
#[derive(Debug, Clone, Copy)]
pub struct OverlayRenderer {
    pub threshold: f32,
    pub joint_radius: i32,
}

impl OverlayRenderer {
    pub fn new(threshold: f32, joint_radius: i32) -> Self {
        Self {
            threshold,
            joint_radius,
        }
    }

    /// The reference skeleton only appears in [`DisplayMode::Composite`].
    pub fn render(
        &self,
        overlay: &mut Overlay,
        size: Resolution,
        local: Option<&PoseFrame>,
        reference: Option<&PoseFrame>,
        mode: DisplayMode,
    ) {
        overlay.resize(size);
        overlay.clear();
        if mode == DisplayMode::Composite {
            if let Some(pose) = reference {
                overlay.draw_pose(pose, REFERENCE_COLOR, self.threshold, self.joint_radius);
            }
        }
        if let Some(pose) = local {
            overlay.draw_pose(pose, LOCAL_COLOR, self.threshold, self.joint_radius);
        }
    }
}

/// Blends `over` onto `base` with `alpha` (0-255) for the composited view.
/// Frames of different sizes are left alone.
pub fn mix_frames(base: &mut RasterFrame, over: &RasterFrame, alpha: u8) {
    if base.width != over.width || base.height != over.height || base.data.len() != over.data.len() {
        return;
    }
    let alpha = alpha as u32;
    for (b, &o) in base.data.iter_mut().zip(over.data.iter()) {
        *b = blend(*b, o as u32, alpha);
    }
}
