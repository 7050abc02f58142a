use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Instant;
use tracing::info;

use crate::config::ModelConfig;
use crate::error::{AnalysisError, PipelineResult};
use crate::feature_extractor::{OnnxBackbone, SpatialBackbone};
use crate::fusion::FeatureFusion;
use crate::nn::{BiLstm, BiLstmLayer, Linear, LinearWeights, LstmDirection, ShapeError};
use crate::sequence_classifier::SequenceClassifier;

/// 分类头权重
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadWeights {
    pub hidden: LinearWeights,
    pub output: LinearWeights,
}

/// 时序部分的权重文件（JSON）：融合层 + 双向 LSTM + 分类头
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierCheckpoint {
    pub fusion: LinearWeights,
    pub lstm: Vec<crate::nn::BiLstmLayerWeights>,
    pub head: HeadWeights,
}

impl ClassifierCheckpoint {
    pub fn build(&self) -> Result<(FeatureFusion, SequenceClassifier), ShapeError> {
        let fusion = FeatureFusion::new(Linear::from_weights(&self.fusion, "fusion")?);

        let layers = self
            .lstm
            .iter()
            .enumerate()
            .map(|(n, layer)| {
                BiLstmLayer::new(
                    LstmDirection::from_weights(&layer.forward, &format!("lstm.{n}.forward"))?,
                    LstmDirection::from_weights(&layer.backward, &format!("lstm.{n}.backward"))?,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        let lstm = BiLstm::new(layers)?;

        let classifier = SequenceClassifier::new(
            lstm,
            Linear::from_weights(&self.head.hidden, "head.hidden")?,
            Linear::from_weights(&self.head.output, "head.output")?,
        )?;

        if fusion.output_dim() != classifier.input_dim() {
            return Err(ShapeError(format!(
                "融合层输出维度 {} 与 LSTM 输入维度 {} 不符",
                fusion.output_dim(),
                classifier.input_dim()
            )));
        }
        Ok((fusion, classifier))
    }

    pub fn load(path: &Path) -> PipelineResult<Self> {
        let file = File::open(path).map_err(|e| AnalysisError::model_load(path, e))?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| AnalysisError::model_load(path, e))
    }
}

/// 已加载的模型句柄
///
/// 由服务层显式构造一次，此后只读，通过 `Arc<ModelHandle>` 在多个分析调用之间共享。
pub struct ModelHandle {
    backbone: Box<dyn SpatialBackbone>,
    fusion: FeatureFusion,
    classifier: SequenceClassifier,
}

impl ModelHandle {
    pub fn new(
        backbone: Box<dyn SpatialBackbone>,
        fusion: FeatureFusion,
        classifier: SequenceClassifier,
    ) -> PipelineResult<Self> {
        if backbone.feature_dim() != fusion.input_dim() {
            return Err(AnalysisError::model_load(
                "<memory>",
                format!(
                    "骨干网络特征维度 {} 与融合层输入维度 {} 不符",
                    backbone.feature_dim(),
                    fusion.input_dim()
                ),
            ));
        }
        if fusion.output_dim() != classifier.input_dim() {
            return Err(AnalysisError::model_load(
                "<memory>",
                format!(
                    "融合层输出维度 {} 与分类器输入维度 {} 不符",
                    fusion.output_dim(),
                    classifier.input_dim()
                ),
            ));
        }
        Ok(Self {
            backbone,
            fusion,
            classifier,
        })
    }

    /// 按配置加载 ONNX 骨干网络与 JSON 时序权重
    pub fn load(config: &ModelConfig) -> PipelineResult<Self> {
        let start = Instant::now();
        let backbone = OnnxBackbone::load(
            &config.backbone_path,
            config.input_size,
            config.feature_dim,
            config.intra_threads,
        )?;

        let checkpoint = ClassifierCheckpoint::load(&config.classifier_path)?;
        let (fusion, classifier) = checkpoint
            .build()
            .map_err(|e| AnalysisError::model_load(&config.classifier_path, e))?;
        info!(
            "🧠 [模型加载] 时序权重已加载: {} (融合 {}→{}, LSTM {} 层 × 隐藏 {}，双向)",
            config.classifier_path.display(),
            fusion.input_dim(),
            fusion.output_dim(),
            classifier.num_layers(),
            classifier.hidden_size()
        );

        let handle = Self::new(Box::new(backbone), fusion, classifier)?;
        info!("✅ [模型加载] 完成，耗时: {:.2}秒", start.elapsed().as_secs_f64());
        Ok(handle)
    }

    pub fn backbone(&self) -> &dyn SpatialBackbone {
        self.backbone.as_ref()
    }

    pub fn fusion(&self) -> &FeatureFusion {
        &self.fusion
    }

    pub fn classifier(&self) -> &SequenceClassifier {
        &self.classifier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{BiLstmLayerWeights, LstmDirectionWeights};

    fn direction(input: usize, hidden: usize) -> LstmDirectionWeights {
        LstmDirectionWeights {
            w_ih: vec![vec![0.01; input]; 4 * hidden],
            w_hh: vec![vec![0.02; hidden]; 4 * hidden],
            b_ih: vec![0.0; 4 * hidden],
            b_hh: vec![0.0; 4 * hidden],
        }
    }

    fn checkpoint(embed: usize, fused: usize, hidden: usize) -> ClassifierCheckpoint {
        ClassifierCheckpoint {
            fusion: LinearWeights {
                weight: vec![vec![0.1; embed]; fused],
                bias: vec![0.0; fused],
            },
            lstm: vec![
                BiLstmLayerWeights {
                    forward: direction(fused, hidden),
                    backward: direction(fused, hidden),
                },
                BiLstmLayerWeights {
                    forward: direction(2 * hidden, hidden),
                    backward: direction(2 * hidden, hidden),
                },
            ],
            head: HeadWeights {
                hidden: LinearWeights {
                    weight: vec![vec![0.1; 2 * hidden]; hidden],
                    bias: vec![0.0; hidden],
                },
                output: LinearWeights {
                    weight: vec![vec![0.1; hidden]; 2],
                    bias: vec![0.0, 0.3],
                },
            },
        }
    }

    #[test]
    fn checkpoint_round_trips_through_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("classifier.json");
        std::fs::write(&path, serde_json::to_vec(&checkpoint(6, 4, 3)).unwrap()).unwrap();

        let (fusion, classifier) = ClassifierCheckpoint::load(&path).unwrap().build().unwrap();
        assert_eq!((fusion.input_dim(), fusion.output_dim()), (6, 4));
        assert_eq!(classifier.num_layers(), 2);
        assert_eq!(classifier.hidden_size(), 3);
    }

    #[test]
    fn mismatched_fusion_and_lstm_are_rejected() {
        let mut ckpt = checkpoint(6, 4, 3);
        ckpt.fusion.weight = vec![vec![0.1; 6]; 5];
        ckpt.fusion.bias = vec![0.0; 5];
        assert!(ckpt.build().is_err());
    }

    #[test]
    fn malformed_file_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let err = ClassifierCheckpoint::load(&path).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ModelLoad);
    }
}
