pub mod config;
pub mod error;
pub mod feature_extractor;
pub mod frame_sampler;
pub mod frame_scores;
pub mod fusion;
pub mod hashing;
pub mod heatmap;
pub mod metadata;
pub mod model;
pub mod nn;
pub mod processor;
pub mod sequence_classifier;
pub mod video_processor;

pub use config::{is_allowed_video, AnalysisConfig, ConfigLoader, ConfigOverrides, ExtendedConfig, ModelConfig};
pub use error::{AnalysisError, ErrorKind, PipelineResult};
pub use feature_extractor::{FeatureExtractor, OnnxBackbone, SpatialBackbone};
pub use frame_sampler::{FrameSampler, FrameStore, SampledFrame};
pub use metadata::{AnalysisResult, FrameRecord, HeatmapRecord};
pub use model::{ClassifierCheckpoint, ModelHandle};
pub use processor::{CancelToken, Stage, VideoAnalyzer};
pub use sequence_classifier::{ClassProbabilities, ClassifierOutput, Prediction};
pub use video_processor::{DecodedFrame, FrameSource, VideoInfo, VideoProcessor};
