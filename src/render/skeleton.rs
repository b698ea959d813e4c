/// 骨格の接続定義 (33 ランドマーク)
///
/// Used for the reference pose, which arrives without its own topology, and
/// for the local pose when the server omits `connections`.
pub const POSE_CONNECTIONS: [(usize, usize); 35] = [
    // 顔
    (0, 1),
    (1, 2),
    (2, 3),
    (3, 7),
    (0, 4),
    (4, 5),
    (5, 6),
    (6, 8),
    (9, 10),
    // 上半身
    (11, 12),
    (11, 13),
    (13, 15),
    (15, 17),
    (15, 19),
    (15, 21),
    (17, 19),
    (12, 14),
    (14, 16),
    (16, 18),
    (16, 20),
    (16, 22),
    (18, 20),
    // 胴体
    (11, 23),
    (12, 24),
    (23, 24),
    // 下半身
    (23, 25),
    (24, 26),
    (25, 27),
    (26, 28),
    (27, 29),
    (28, 30),
    (29, 31),
    (30, 32),
    (27, 31),
    (28, 32),
];

/// ランドマーク数
pub const LANDMARK_COUNT: usize = 33;

/// Joints and bones under this visibility are not drawn.
pub const VISIBILITY_THRESHOLD: f32 = 0.3;

/// 自分の骨格 (ARGB, 不透明の緑)
pub const LOCAL_COLOR: u32 = 0xFF00_FF00;

/// お手本の骨格 (ARGB, 半透明のオレンジ)
pub const REFERENCE_COLOR: u32 = 0x80FF_8C00;

pub fn connections_owned() -> Vec<(usize, usize)> {
    POSE_CONNECTIONS.to_vec()
}
