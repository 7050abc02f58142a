use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::{Array2, Array3, Array4, Axis};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::{Tensor, Value};
use rayon::prelude::*;
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, info};

use crate::error::{AnalysisError, PipelineResult};
use crate::frame_sampler::SampledFrame;

/// ResNet-50 全局池化后的特征维度
pub const RESNET50_FEATURE_DIM: usize = 2048;
/// 骨干网络输入边长
pub const DEFAULT_INPUT_SIZE: u32 = 224;
/// ImageNet 归一化参数
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// 冻结的空间骨干网络（默认 ResNet-50 去掉分类层，导出为 ONNX）
///
/// 实现必须是只读的：同一个实例会被多个分析调用并发共享。
/// 推理不含随机行为，相同像素 + 相同权重一定得到相同输出。
pub trait SpatialBackbone: Send + Sync {
    /// 输出嵌入维度
    fn feature_dim(&self) -> usize;

    /// 输入边长（正方形）
    fn input_size(&self) -> u32;

    /// 批量推理：输入 `[N, 3, H, W]`，输出 `[N, feature_dim]`，行顺序与输入一致
    fn embed_batch(&self, batch: &Array4<f32>) -> PipelineResult<Array2<f32>>;
}

/// ONNX Runtime 骨干网络
pub struct OnnxBackbone {
    session: Mutex<Session>,
    output_name: String,
    input_size: u32,
    feature_dim: usize,
}

impl OnnxBackbone {
    pub fn load(
        model_path: &Path,
        input_size: u32,
        feature_dim: usize,
        intra_threads: Option<usize>,
    ) -> PipelineResult<Self> {
        if !model_path.exists() {
            return Err(AnalysisError::model_load(model_path, "骨干网络模型文件不存在"));
        }

        let model_bytes =
            std::fs::read(model_path).map_err(|e| AnalysisError::model_load(model_path, e))?;

        let mut builder = Session::builder()
            .map_err(|e| AnalysisError::model_load(model_path, format!("ORT session builder: {e}")))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| AnalysisError::model_load(model_path, format!("ORT opt level: {e}")))?;
        if let Some(threads) = intra_threads {
            builder = builder
                .with_intra_threads(threads)
                .map_err(|e| AnalysisError::model_load(model_path, format!("ORT intra threads: {e}")))?;
        }
        let session = builder
            .commit_from_memory(model_bytes.as_slice())
            .map_err(|e| AnalysisError::model_load(model_path, format!("ORT load model: {e}")))?;

        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| AnalysisError::model_load(model_path, "模型没有定义输出"))?;

        info!(
            "🧠 [特征提取] 骨干网络已加载: {} (输入 {}x{}, 特征维度 {})",
            model_path.display(),
            input_size,
            input_size,
            feature_dim
        );

        Ok(Self {
            session: Mutex::new(session),
            output_name,
            input_size,
            feature_dim,
        })
    }
}

impl SpatialBackbone for OnnxBackbone {
    fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn embed_batch(&self, batch: &Array4<f32>) -> PipelineResult<Array2<f32>> {
        let n = batch.len_of(Axis(0));
        let shape = batch.shape().to_vec();
        let data: Vec<f32> = batch.iter().copied().collect();
        let input = Tensor::from_array((shape, data.into_boxed_slice()))
            .map(Value::from)
            .map_err(|e| AnalysisError::inference("backbone", format!("ORT tensor: {e}")))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| AnalysisError::inference("backbone", "ORT session poisoned"))?;
        let outputs = session
            .run(ort::inputs![input])
            .map_err(|e| AnalysisError::inference("backbone", format!("ORT run failed: {e}")))?;
        let output = outputs
            .get(&self.output_name)
            .ok_or_else(|| AnalysisError::inference("backbone", "ORT returned no outputs"))?;
        let (out_shape, values) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| AnalysisError::inference("backbone", format!("ORT extract: {e}")))?;

        // 接受 [N, D] 或 [N, D, 1, 1]
        let dims: Vec<usize> = out_shape.iter().map(|&d| d.max(0) as usize).collect();
        let flat_ok = dims.first() == Some(&n)
            && dims.iter().skip(2).all(|&d| d == 1)
            && dims.get(1) == Some(&self.feature_dim);
        if !flat_ok {
            return Err(AnalysisError::inference(
                "backbone",
                format!("输出形状 {:?} 与期望 [{}, {}] 不符", dims, n, self.feature_dim),
            ));
        }

        Array2::from_shape_vec((n, self.feature_dim), values.to_vec())
            .map_err(|e| AnalysisError::inference("backbone", e.to_string()))
    }
}

/// 将一张图像缩放并归一化为 `[3, size, size]` 的 CHW 张量
pub fn preprocess(img: &DynamicImage, size: u32) -> Array3<f32> {
    let resized = img.resize_exact(size, size, FilterType::Triangle).to_rgb8();
    let side = size as usize;
    let mut chw = Array3::<f32>::zeros((3, side, side));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            let v = pixel[c] as f32 / 255.0;
            chw[[c, y as usize, x as usize]] = (v - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }
    chw
}

/// 特征提取器：读取采样帧、并行预处理、一次批量推理
pub struct FeatureExtractor<'a> {
    backbone: &'a dyn SpatialBackbone,
}

impl<'a> FeatureExtractor<'a> {
    pub fn new(backbone: &'a dyn SpatialBackbone) -> Self {
        Self { backbone }
    }

    /// 返回 `[L, feature_dim]`，第 i 行对应 `frames[i]`
    pub fn extract(&self, frames: &[SampledFrame]) -> PipelineResult<Array2<f32>> {
        let start = Instant::now();
        let size = self.backbone.input_size();
        let side = size as usize;

        // par_iter + collect 保持原始帧顺序
        let tensors = frames
            .par_iter()
            .map(|frame| load_frame(&frame.path).map(|img| preprocess(&img, size)))
            .collect::<PipelineResult<Vec<_>>>()?;

        let mut batch = Array4::<f32>::zeros((tensors.len(), 3, side, side));
        for (i, tensor) in tensors.iter().enumerate() {
            batch.index_axis_mut(Axis(0), i).assign(tensor);
        }
        debug!("🧮 [特征提取] 批量输入形状: {:?}", batch.shape());

        let embeddings = self.backbone.embed_batch(&batch)?;
        let expected = (frames.len(), self.backbone.feature_dim());
        if embeddings.dim() != expected {
            return Err(AnalysisError::inference(
                "backbone",
                format!("嵌入形状 {:?} 与期望 {:?} 不符", embeddings.dim(), expected),
            ));
        }
        if embeddings.iter().any(|v| !v.is_finite()) {
            return Err(AnalysisError::inference("backbone", "嵌入中存在非有限值"));
        }

        info!(
            "✅ [特征提取] {} 帧 → {} 维嵌入，耗时: {:.2}秒",
            frames.len(),
            expected.1,
            start.elapsed().as_secs_f64()
        );
        Ok(embeddings)
    }
}

fn load_frame(path: &Path) -> PipelineResult<DynamicImage> {
    image::open(path).map_err(|e| match e {
        image::ImageError::IoError(io) => AnalysisError::Io(io),
        other => AnalysisError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{}: {}", path.display(), other),
        )),
    })
}
