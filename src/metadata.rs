use serde::{Deserialize, Serialize};

use crate::sequence_classifier::ClassifierOutput;

/// 可疑度曲线上的一帧
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    /// 在定长序列中的位置（不是原始视频帧号）
    #[serde(rename = "frame")]
    pub index: usize,
    pub probability_fake: f64,
}

/// 一张热力图
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatmapRecord {
    pub frame_index: usize,
    pub probability_fake: f64,
    /// 热力图文件名（位于调用方提供的输出目录中）
    #[serde(rename = "path")]
    pub image_reference: String,
}

/// 一次分析的完整结果
///
/// 这是分析核心的唯一输出，交给调用方后由调用方负责持久化和对外提供。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    #[serde(flatten)]
    pub classification: ClassifierOutput,
    pub frame_analysis: Vec<FrameRecord>,
    pub max_fake_probability: f64,
    pub avg_fake_probability: f64,
    pub frames_analyzed: usize,
    /// 例如 "29.97 fps"
    pub frame_rate: String,
    /// 时长（秒）
    pub duration: u64,
    /// 例如 "1920x1080"
    pub resolution: String,
    /// 按 frame_index 升序
    pub heatmaps: Vec<HeatmapRecord>,
    pub video_hash: String,
    /// 本次调用的标识（每次调用不同）
    pub video_id: String,
    /// RFC 3339 时间戳
    pub analyzed_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_external_field_names() {
        let result = AnalysisResult {
            classification: ClassifierOutput::from_probabilities(0.25, 0.75),
            frame_analysis: vec![FrameRecord {
                index: 0,
                probability_fake: 0.75,
            }],
            max_fake_probability: 0.75,
            avg_fake_probability: 0.75,
            frames_analyzed: 1,
            frame_rate: "30.00 fps".to_string(),
            duration: 5,
            resolution: "640x360".to_string(),
            heatmaps: vec![HeatmapRecord {
                frame_index: 0,
                probability_fake: 0.75,
                image_reference: "heatmap_frame_000.jpg".to_string(),
            }],
            video_hash: "ab".repeat(32),
            video_id: "id".to_string(),
            analyzed_at: "2024-01-01T00:00:00Z".to_string(),
        };

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["prediction"], "Deepfake");
        assert_eq!(json["confidence"], 0.75);
        assert_eq!(json["probabilities"]["real"], 0.25);
        assert_eq!(json["frame_analysis"][0]["frame"], 0);
        assert_eq!(json["heatmaps"][0]["path"], "heatmap_frame_000.jpg");
        assert_eq!(json["resolution"], "640x360");

        let back: AnalysisResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }
}
