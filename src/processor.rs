use chrono::Utc;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::AnalysisConfig;
use crate::error::{AnalysisError, PipelineResult};
use crate::feature_extractor::FeatureExtractor;
use crate::frame_sampler::{FrameSampler, FrameStore};
use crate::frame_scores::FrameScoreSynthesizer;
use crate::hashing::content_hash;
use crate::heatmap::HeatmapLocalizer;
use crate::metadata::{AnalysisResult, FrameRecord, HeatmapRecord};
use crate::model::ModelHandle;
use crate::sequence_classifier::ClassifierOutput;
use crate::video_processor::{FrameSource, VideoInfo, VideoProcessor};

/// 流水线阶段，严格按声明顺序推进
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Sampling,
    Embedding,
    Fusion,
    Classification,
    ScoreSynthesis,
    Localization,
    Aggregation,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Sampling => "sampling",
            Stage::Embedding => "embedding",
            Stage::Fusion => "fusion",
            Stage::Classification => "classification",
            Stage::ScoreSynthesis => "score_synthesis",
            Stage::Localization => "localization",
            Stage::Aggregation => "aggregation",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Stage::Sampling => "帧采样",
            Stage::Embedding => "特征提取",
            Stage::Fusion => "特征融合",
            Stage::Classification => "序列分类",
            Stage::ScoreSynthesis => "逐帧曲线",
            Stage::Localization => "热力图",
            Stage::Aggregation => "结果汇总",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 取消令牌
///
/// 克隆后共享同一个取消标志；可选的截止时间到达后视同已取消。
/// 流水线在每个阶段开始前检查一次。
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从现在起 `timeout` 之后自动失效；超出 `Instant` 可表示范围时视为不限时
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flag: Arc::default(),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    /// 按 `max_pipeline_secs` 构造；未配置则只能手动取消
    pub fn from_config(config: &AnalysisConfig) -> Self {
        match config.max_pipeline_secs {
            Some(secs) => Self::with_timeout(Duration::from_secs(secs)),
            None => Self::new(),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn check(&self, stage: Stage) -> PipelineResult<()> {
        if self.is_cancelled() {
            warn!("⚠️  [视频分析] 在进入{}阶段前被取消", stage.label());
            return Err(AnalysisError::Cancelled { stage: stage.name() });
        }
        Ok(())
    }
}

/// 视频分析器
///
/// 持有共享的只读模型和本次使用的分析参数。一次 `analyze_*` 调用从头到尾同步执行，
/// 并发只发生在多个调用之间。
pub struct VideoAnalyzer<'a> {
    models: &'a ModelHandle,
    config: &'a AnalysisConfig,
    temp_parent: Option<&'a Path>,
}

impl<'a> VideoAnalyzer<'a> {
    pub fn new(models: &'a ModelHandle, config: &'a AnalysisConfig) -> Self {
        Self {
            models,
            config,
            temp_parent: None,
        }
    }

    /// 临时帧目录创建在 `parent` 下，而不是系统临时目录
    pub fn with_temp_parent(mut self, parent: Option<&'a Path>) -> Self {
        self.temp_parent = parent;
        self
    }

    /// 分析本地视频文件，热力图写入 `output_dir`
    pub fn analyze_video(
        &self,
        input_path: impl AsRef<Path>,
        output_dir: impl AsRef<Path>,
        cancel: &CancelToken,
    ) -> PipelineResult<AnalysisResult> {
        let input_path = input_path.as_ref();
        info!("🎬 [视频分析] 开始分析视频: {}", input_path.display());

        let hash_start = Instant::now();
        let hash = content_hash(input_path)?;
        info!(
            "✅ [视频分析] 内容哈希计算完成，耗时: {:.2}秒 ({}…)",
            hash_start.elapsed().as_secs_f64(),
            &hash[..12]
        );

        let mut source = VideoProcessor::open(input_path)?;
        self.analyze_source(&mut source, &hash, output_dir.as_ref(), cancel)
    }

    /// 分析任意顺序帧来源；`content_hash` 由调用方基于完整视频字节计算
    pub fn analyze_source(
        &self,
        source: &mut dyn FrameSource,
        content_hash: &str,
        output_dir: &Path,
        cancel: &CancelToken,
    ) -> PipelineResult<AnalysisResult> {
        let total_start = Instant::now();
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        let info = source.info().clone();
        info!(
            "  • 分辨率: {}，帧率: {}，原始帧数: {}",
            info.resolution(),
            info.frame_rate_label(),
            info.total_frames
        );

        cancel.check(Stage::Sampling)?;
        let store = FrameStore::new(self.temp_parent)?;
        let mut timings = Vec::with_capacity(7);
        let result = self.run_stages(source, content_hash, &info, output_dir, &store, cancel, &mut timings);
        // 热力图已在上面渲染完毕，此后不再需要临时帧
        store.close();

        match &result {
            Ok(analysis) => {
                let total = total_start.elapsed();
                info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
                info!(
                    "🎉 [视频分析] 分析完成！结论: {}，置信度: {:.3}，总耗时: {:.2}秒",
                    analysis.classification.prediction,
                    analysis.classification.confidence,
                    total.as_secs_f64()
                );
                info!("📊 [视频分析] 性能统计:");
                for (stage, elapsed) in &timings {
                    let percent = if total.as_secs_f64() > 0.0 {
                        elapsed.as_secs_f64() / total.as_secs_f64() * 100.0
                    } else {
                        0.0
                    };
                    info!("   • {}: {:.2}秒 ({:.1}%)", stage.label(), elapsed.as_secs_f64(), percent);
                }
                info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
            }
            Err(e) => error!("❌ [视频分析] 分析失败（{}）: {}", e.kind(), e),
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn run_stages(
        &self,
        source: &mut dyn FrameSource,
        content_hash: &str,
        info: &VideoInfo,
        output_dir: &Path,
        store: &FrameStore,
        cancel: &CancelToken,
        timings: &mut Vec<(Stage, Duration)>,
    ) -> PipelineResult<AnalysisResult> {
        // 1. 帧采样
        let start = Instant::now();
        let sampler = FrameSampler::new(self.config.frame_skip, self.config.seq_length);
        let sequence = sampler.sample(source, store)?;
        timings.push((Stage::Sampling, start.elapsed()));

        // 2. 空间特征
        cancel.check(Stage::Embedding)?;
        let start = Instant::now();
        let embeddings = FeatureExtractor::new(self.models.backbone()).extract(&sequence.frames)?;
        timings.push((Stage::Embedding, start.elapsed()));

        // 3. 融合
        cancel.check(Stage::Fusion)?;
        let start = Instant::now();
        let fused = self.models.fusion().forward(embeddings.view())?;
        timings.push((Stage::Fusion, start.elapsed()));

        // 4. 序列分类
        cancel.check(Stage::Classification)?;
        let start = Instant::now();
        let classification = self
            .models
            .classifier()
            .classify(fused.view(), sequence.frames.len())?;
        info!(
            "✅ [序列分类] {}（real={:.4}, fake={:.4}），耗时: {:.2}秒",
            classification.prediction,
            classification.probabilities.real,
            classification.probabilities.fake,
            start.elapsed().as_secs_f64()
        );
        timings.push((Stage::Classification, start.elapsed()));

        // 5. 逐帧曲线
        cancel.check(Stage::ScoreSynthesis)?;
        let start = Instant::now();
        let curve = FrameScoreSynthesizer::default().synthesize(
            content_hash,
            classification.probabilities.fake,
            sequence.frames.len(),
        );
        timings.push((Stage::ScoreSynthesis, start.elapsed()));

        // 6. 热力图（临时帧仍在）
        cancel.check(Stage::Localization)?;
        let start = Instant::now();
        let heatmaps = HeatmapLocalizer::new(self.config.heatmap_top_k).localize(
            content_hash,
            &curve,
            &sequence.frames,
            output_dir,
        );
        timings.push((Stage::Localization, start.elapsed()));

        // 7. 汇总
        cancel.check(Stage::Aggregation)?;
        let start = Instant::now();
        let result = aggregate(classification, curve, heatmaps, info, content_hash);
        timings.push((Stage::Aggregation, start.elapsed()));
        Ok(result)
    }
}

/// 汇总各阶段输出
///
/// `max_fake_probability` 和 `avg_fake_probability` 都只从曲线计算；
/// `video_id` 与 `analyzed_at` 每次调用都不同。
pub fn aggregate(
    classification: ClassifierOutput,
    curve: Vec<FrameRecord>,
    heatmaps: Vec<HeatmapRecord>,
    info: &VideoInfo,
    content_hash: &str,
) -> AnalysisResult {
    let max_fake_probability = curve
        .iter()
        .map(|r| r.probability_fake)
        .fold(0.0_f64, f64::max);
    let avg_fake_probability = if curve.is_empty() {
        0.0
    } else {
        curve.iter().map(|r| r.probability_fake).sum::<f64>() / curve.len() as f64
    };

    AnalysisResult {
        classification,
        frames_analyzed: curve.len(),
        frame_analysis: curve,
        max_fake_probability,
        avg_fake_probability,
        frame_rate: info.frame_rate_label(),
        duration: info.duration_secs(),
        resolution: info.resolution(),
        heatmaps,
        video_hash: content_hash.to_string(),
        video_id: Uuid::new_v4().to_string(),
        analyzed_at: Utc::now().to_rfc3339(),
    }
}
