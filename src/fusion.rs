use ndarray::{Array2, ArrayView2};

use crate::error::{AnalysisError, PipelineResult};
use crate::nn::Linear;

/// 特征融合层：Linear → ReLU → Dropout（推理时关闭）
///
/// 逐帧独立作用，把骨干网络的嵌入（例如 2048 维）压到工作维度（例如 512 维），
/// 输出保持帧顺序。
#[derive(Debug, Clone)]
pub struct FeatureFusion {
    projection: Linear,
}

impl FeatureFusion {
    pub fn new(projection: Linear) -> Self {
        Self { projection }
    }

    pub fn input_dim(&self) -> usize {
        self.projection.in_features()
    }

    pub fn output_dim(&self) -> usize {
        self.projection.out_features()
    }

    /// `[L, input_dim]` → `[L, output_dim]`
    pub fn forward(&self, embeddings: ArrayView2<f32>) -> PipelineResult<Array2<f32>> {
        if embeddings.ncols() != self.input_dim() {
            return Err(AnalysisError::inference(
                "fusion",
                format!(
                    "嵌入维度 {} 与融合层输入维度 {} 不符",
                    embeddings.ncols(),
                    self.input_dim()
                ),
            ));
        }
        let mut fused = self.projection.forward(embeddings);
        crate::nn::relu_inplace(&mut fused);
        Ok(fused)
    }
}
