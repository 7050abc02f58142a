//! 逐帧可疑度曲线
//!
//! 序列分类器对整段视频只给出一个结论，没有真正的逐帧信号。这里围绕该结论的
//! fake 概率合成一条确定性的曲线，仅用于可视化：
//!
//! `score[i] = clamp(base + 0.15 * sin(i * 0.5 + offset) + noise(hash, i), 0, 1)`
//!
//! 其中 `offset` 取自内容哈希第 8..16 位十六进制（对 100 取余），`noise` 是由
//! `(hash, i)` 经无状态哈希得到的 [-0.05, 0.05) 均匀值。它不是逐帧检测结果，
//! 不能当作帧级定位使用；同一份视频字节内容多次运行得到完全相同的曲线。

use crate::hashing::{hex_segment, unit_float};
use crate::metadata::FrameRecord;

pub const DEFAULT_AMPLITUDE: f64 = 0.15;
pub const DEFAULT_PHASE: f64 = 0.5;
pub const DEFAULT_NOISE: f64 = 0.05;
const OFFSET_MODULUS: u64 = 100;

#[derive(Debug, Clone, Copy)]
pub struct FrameScoreSynthesizer {
    amplitude: f64,
    phase: f64,
    noise: f64,
}

impl Default for FrameScoreSynthesizer {
    fn default() -> Self {
        Self {
            amplitude: DEFAULT_AMPLITUDE,
            phase: DEFAULT_PHASE,
            noise: DEFAULT_NOISE,
        }
    }
}

impl FrameScoreSynthesizer {
    /// 单帧分数，纯函数
    pub fn score(&self, content_hash: &str, base_fake_probability: f64, index: usize) -> f64 {
        let offset = (hex_segment(content_hash, 8, 16) % OFFSET_MODULUS) as f64;
        let wave = self.amplitude * (index as f64 * self.phase + offset).sin();
        let noise = (unit_float(content_hash, "frame_noise", index as u64) * 2.0 - 1.0) * self.noise;
        (base_fake_probability + wave + noise).clamp(0.0, 1.0)
    }

    /// 长度为 `len` 的完整曲线
    pub fn synthesize(&self, content_hash: &str, base_fake_probability: f64, len: usize) -> Vec<FrameRecord> {
        (0..len)
            .map(|index| FrameRecord {
                index,
                probability_fake: self.score(content_hash, base_fake_probability, index),
            })
            .collect()
    }
}
