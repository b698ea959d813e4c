use serde::{Deserialize, Deserializer};

/// 単一ランドマーク
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Landmark {
    /// 正規化されたX座標 (0.0〜1.0)
    pub x: f32,
    /// 正規化されたY座標 (0.0〜1.0)
    pub y: f32,
    /// 可視性スコア (0.0〜1.0)
    pub visibility: f32,
}

impl Landmark {
    pub fn new(x: f32, y: f32, visibility: f32) -> Self {
        Self { x, y, visibility }
    }

    /// Visible at or above `threshold`. Anything below is treated as absent.
    pub fn is_visible(&self, threshold: f32) -> bool {
        self.visibility >= threshold
    }

    /// ピクセル座標に変換. Coordinates are clamped to one frame beyond each
    /// edge so a wild value still lands near the image.
    pub fn to_pixel(&self, width: u32, height: u32) -> (i32, i32) {
        let px = (self.x.clamp(-1.0, 2.0) * width as f32) as i32;
        let py = (self.y.clamp(-1.0, 2.0) * height as f32) as i32;
        (px, py)
    }
}

impl Default for Landmark {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            visibility: 0.0,
        }
    }
}

/// Landmarks as the server sends them: `{"x","y","visibility"}` objects or
/// `[x, y, visibility]` arrays. A missing visibility counts as fully visible.
impl<'de> Deserialize<'de> for Landmark {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Object {
                x: f32,
                y: f32,
                #[serde(default = "fully_visible")]
                visibility: f32,
            },
            Array(Vec<f32>),
        }

        fn fully_visible() -> f32 {
            1.0
        }

        match Wire::deserialize(deserializer)? {
            Wire::Object { x, y, visibility } => Ok(Landmark::new(x, y, visibility)),
            Wire::Array(values) => match values.as_slice() {
                [x, y] => Ok(Landmark::new(*x, *y, 1.0)),
                [x, y, v, ..] => Ok(Landmark::new(*x, *y, *v)),
                _ => Err(serde::de::Error::custom(format!(
                    "landmark needs at least 2 values, got {}",
                    values.len()
                ))),
            },
        }
    }
}

/// One pose: landmarks plus the bones between them.
///
/// Rebuilt from every pose-bearing message; never kept across messages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoseFrame {
    pub landmarks: Vec<Landmark>,
    pub connections: Vec<(usize, usize)>,
}

impl PoseFrame {
    pub fn new(landmarks: Vec<Landmark>, connections: Vec<(usize, usize)>) -> Self {
        Self {
            landmarks,
            connections,
        }
    }

    /// Bones whose both ends exist and are visible.
    pub fn visible_bones(&self, threshold: f32) -> impl Iterator<Item = (&Landmark, &Landmark)> + '_ {
        self.connections.iter().filter_map(move |&(a, b)| {
            let start = self.landmarks.get(a)?;
            let end = self.landmarks.get(b)?;
            (start.is_visible(threshold) && end.is_visible(threshold)).then_some((start, end))
        })
    }

    pub fn visible_joints(&self, threshold: f32) -> impl Iterator<Item = &Landmark> + '_ {
        self.landmarks.iter().filter(move |lm| lm.is_visible(threshold))
    }
}
