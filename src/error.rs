use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// 分析流水线的结果类型
pub type PipelineResult<T> = Result<T, AnalysisError>;

/// 分析流水线错误
///
/// 致命错误（`VideoOpen`、`NoFramesExtracted`、`ModelInference`、`ModelLoad`、
/// `Cancelled`）会中止本次调用并原样返回给调用方；`HeatmapGeneration`
/// 只在单帧渲染内部产生，记录日志后跳过该帧，不会从 `analyze_*` 返回。
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("无法打开视频 {path}: {message}")]
    VideoOpen { path: PathBuf, message: String },

    #[error("没有提取到任何视频帧（frame_skip={frame_skip}，原始帧数={total_frames}）")]
    NoFramesExtracted { frame_skip: usize, total_frames: u64 },

    #[error("模型推理失败（{stage}）: {message}")]
    ModelInference { stage: &'static str, message: String },

    #[error("模型加载失败 {path}: {message}")]
    ModelLoad { path: PathBuf, message: String },

    #[error("热力图生成失败（帧 {frame_index}）: {message}")]
    HeatmapGeneration { frame_index: usize, message: String },

    #[error("分析已取消（阶段: {stage}）")]
    Cancelled { stage: &'static str },

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

/// 错误种类，供调用方按种类决定对外行为
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    VideoOpen,
    NoFramesExtracted,
    ModelInference,
    ModelLoad,
    HeatmapGeneration,
    Cancelled,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::VideoOpen => "VideoOpenError",
            ErrorKind::NoFramesExtracted => "NoFramesExtractedError",
            ErrorKind::ModelInference => "ModelInferenceError",
            ErrorKind::ModelLoad => "ModelLoadError",
            ErrorKind::HeatmapGeneration => "HeatmapGenerationError",
            ErrorKind::Cancelled => "CancelledError",
            ErrorKind::Io => "IoError",
        };
        f.write_str(name)
    }
}

impl AnalysisError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AnalysisError::VideoOpen { .. } => ErrorKind::VideoOpen,
            AnalysisError::NoFramesExtracted { .. } => ErrorKind::NoFramesExtracted,
            AnalysisError::ModelInference { .. } => ErrorKind::ModelInference,
            AnalysisError::ModelLoad { .. } => ErrorKind::ModelLoad,
            AnalysisError::HeatmapGeneration { .. } => ErrorKind::HeatmapGeneration,
            AnalysisError::Cancelled { .. } => ErrorKind::Cancelled,
            AnalysisError::Io(_) => ErrorKind::Io,
        }
    }

    pub fn video_open(path: impl Into<PathBuf>, message: impl fmt::Display) -> Self {
        Self::VideoOpen {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn inference(stage: &'static str, message: impl Into<String>) -> Self {
        Self::ModelInference {
            stage,
            message: message.into(),
        }
    }

    pub fn model_load(path: impl Into<PathBuf>, message: impl fmt::Display) -> Self {
        Self::ModelLoad {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn heatmap(frame_index: usize, message: impl fmt::Display) -> Self {
        Self::HeatmapGeneration {
            frame_index,
            message: message.to_string(),
        }
    }

    /// 是否为致命错误（非致命错误只降级输出，不影响分类结果）
    pub fn is_fatal(&self) -> bool {
        !matches!(self, AnalysisError::HeatmapGeneration { .. })
    }
}
