use anyhow::Result;
use minifb::{Key, KeyRepeat, Window, WindowOptions};

use crate::camera::RasterFrame;

/// minifbを使用したセッション表示ウィンドウ
pub struct SessionWindow {
    window: Window,
    buffer: Vec<u32>,
    width: usize,
    height: usize,
}

impl SessionWindow {
    /// ウィンドウを作成
    pub fn new(title: &str, width: usize, height: usize) -> Result<Self> {
        let window = Window::new(
            title,
            width,
            height,
            WindowOptions {
                resize: false,
                ..WindowOptions::default()
            },
        )?;

        Ok(Self {
            window,
            buffer: vec![0u32; width * height],
            width,
            height,
        })
    }

    /// ウィンドウが開いているか
    pub fn is_open(&self) -> bool {
        self.window.is_open() && !self.window.is_key_down(Key::Escape)
    }

    pub fn is_key_pressed(&self, key: Key) -> bool {
        self.window.is_key_pressed(key, KeyRepeat::No)
    }

    pub fn set_title(&mut self, title: &str) {
        self.window.set_title(title);
    }

    pub fn clear(&mut self) {
        self.buffer.fill(0);
    }

    /// BGR フレームを (x_off, y_off) にコピー. はみ出す部分はクロップ
    pub fn draw_frame_at(&mut self, frame: &RasterFrame, x_off: usize, y_off: usize) {
        if frame.data.len() != frame.expected_len() {
            return;
        }
        let fw = frame.width as usize;
        let fh = frame.height as usize;
        for y in 0..fh.min(self.height.saturating_sub(y_off)) {
            for x in 0..fw.min(self.width.saturating_sub(x_off)) {
                let i = (y * fw + x) * 3;
                // BGR -> RGB -> u32
                let b = frame.data[i] as u32;
                let g = frame.data[i + 1] as u32;
                let r = frame.data[i + 2] as u32;
                self.buffer[(y + y_off) * self.width + x + x_off] = (r << 16) | (g << 8) | b;
            }
        }
    }

    /// バッファをウィンドウに表示
    pub fn update(&mut self) -> Result<()> {
        self.window
            .update_with_buffer(&self.buffer, self.width, self.height)?;
        Ok(())
    }
}
