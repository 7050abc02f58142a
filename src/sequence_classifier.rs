use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, error};

use crate::error::{AnalysisError, PipelineResult};
use crate::nn::{relu_inplace, softmax, BiLstm, Linear, ShapeError};

/// 分类结论
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Prediction {
    Real,
    Deepfake,
}

impl fmt::Display for Prediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prediction::Real => f.write_str("Real"),
            Prediction::Deepfake => f.write_str("Deepfake"),
        }
    }
}

/// 两类概率，`real + fake == 1`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassProbabilities {
    pub real: f64,
    pub fake: f64,
}

/// 序列分类器输出
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassifierOutput {
    pub prediction: Prediction,
    pub confidence: f64,
    pub probabilities: ClassProbabilities,
}

impl ClassifierOutput {
    /// 由两类概率构造；仅当 `fake > real` 时判为 Deepfake
    pub fn from_probabilities(real: f64, fake: f64) -> Self {
        let prediction = if fake > real {
            Prediction::Deepfake
        } else {
            Prediction::Real
        };
        Self {
            prediction,
            confidence: real.max(fake),
            probabilities: ClassProbabilities { real, fake },
        }
    }
}

/// 时序分类器：多层双向 LSTM + 分类头（Linear → ReLU → Dropout → Linear）
///
/// 取最后一层在最后一个时间步的输出（前向、后向拼接）作为序列摘要，
/// 整段视频只产生一个结论，不直接给出逐帧或区域信息。
#[derive(Debug, Clone)]
pub struct SequenceClassifier {
    lstm: BiLstm,
    hidden: Linear,
    output: Linear,
}

impl SequenceClassifier {
    pub fn new(lstm: BiLstm, hidden: Linear, output: Linear) -> Result<Self, ShapeError> {
        let summary = 2 * lstm.hidden_size();
        if hidden.in_features() != summary {
            return Err(ShapeError(format!(
                "分类头输入维度 {} 应为 {}",
                hidden.in_features(),
                summary
            )));
        }
        if output.in_features() != hidden.out_features() || output.out_features() != 2 {
            return Err(ShapeError(format!(
                "输出层形状应为 [2, {}]，实际 [{}, {}]",
                hidden.out_features(),
                output.out_features(),
                output.in_features()
            )));
        }
        Ok(Self {
            lstm,
            hidden,
            output,
        })
    }

    pub fn input_dim(&self) -> usize {
        self.lstm.input_size()
    }

    pub fn hidden_size(&self) -> usize {
        self.lstm.hidden_size()
    }

    pub fn num_layers(&self) -> usize {
        self.lstm.num_layers()
    }

    /// 对长度为 `expected_len` 的融合特征序列做二分类
    pub fn classify(
        &self,
        fused: ArrayView2<f32>,
        expected_len: usize,
    ) -> PipelineResult<ClassifierOutput> {
        let (len, dim) = fused.dim();
        if len == 0 || len != expected_len || dim != self.input_dim() {
            let message = format!(
                "输入形状 [{}, {}] 与期望 [{}, {}] 不符",
                len,
                dim,
                expected_len,
                self.input_dim()
            );
            error!("❌ [序列分类] {}", message);
            return Err(AnalysisError::inference("classifier", message));
        }

        let sequence = self.lstm.forward(fused);
        let summary = sequence.row(len - 1);
        if summary.iter().any(|v| !v.is_finite()) {
            let message = "LSTM 序列摘要含非有限值".to_string();
            error!("❌ [序列分类] {}", message);
            return Err(AnalysisError::inference("classifier", message));
        }
        let mut hidden = self.hidden.forward_vec(summary);
        relu_inplace(&mut hidden);
        let logits = self.output.forward_vec(hidden.view());

        if logits.iter().any(|v| !v.is_finite()) {
            let message = format!("logits 含非有限值: {:?}", logits.to_vec());
            error!("❌ [序列分类] {}", message);
            return Err(AnalysisError::inference("classifier", message));
        }

        let probs = softmax(logits.view());
        let (real, fake) = (probs[0], probs[1]);
        if !real.is_finite() || !fake.is_finite() {
            return Err(AnalysisError::inference("classifier", "softmax 输出非有限值"));
        }
        debug!(
            "🔎 [序列分类] logits=[{:.4}, {:.4}], real={:.4}, fake={:.4}",
            logits[0], logits[1], real, fake
        );

        Ok(ClassifierOutput::from_probabilities(real, fake))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{BiLstmLayer, LstmDirection};
    use ndarray::{array, Array1, Array2};

    fn classifier(fake_bias: f32) -> SequenceClassifier {
        let dir = LstmDirection::new(
            Array2::from_elem((8, 3), 0.1),
            Array2::from_elem((8, 2), 0.05),
            Array1::zeros(8),
            Array1::zeros(8),
        )
        .unwrap();
        let lstm = BiLstm::new(vec![BiLstmLayer::new(dir.clone(), dir).unwrap()]).unwrap();
        let hidden = Linear::new(Array2::from_elem((3, 4), 0.2), Array1::zeros(3)).unwrap();
        let output = Linear::new(Array2::zeros((2, 3)), array![0.0, fake_bias]).unwrap();
        SequenceClassifier::new(lstm, hidden, output).unwrap()
    }

    #[test]
    fn probabilities_are_consistent() {
        let out = classifier(1.5).classify(Array2::ones((5, 3)).view(), 5).unwrap();
        let p = out.probabilities;
        assert!((p.real + p.fake - 1.0).abs() < 1e-6);
        assert_eq!(out.prediction, Prediction::Deepfake);
        assert_eq!(out.confidence, p.real.max(p.fake));
    }

    #[test]
    fn negative_bias_predicts_real() {
        let out = classifier(-2.0).classify(Array2::ones((5, 3)).view(), 5).unwrap();
        assert_eq!(out.prediction, Prediction::Real);
        assert!(out.probabilities.real > out.probabilities.fake);
    }

    #[test]
    fn tie_is_real() {
        let out = ClassifierOutput::from_probabilities(0.5, 0.5);
        assert_eq!(out.prediction, Prediction::Real);
        assert_eq!(out.confidence, 0.5);
    }

    #[test]
    fn wrong_length_or_dimension_is_inference_error() {
        let c = classifier(0.0);
        let wrong_len = c.classify(Array2::ones((4, 3)).view(), 5).unwrap_err();
        assert_eq!(wrong_len.kind(), crate::error::ErrorKind::ModelInference);
        let wrong_dim = c.classify(Array2::ones((5, 2)).view(), 5).unwrap_err();
        assert_eq!(wrong_dim.kind(), crate::error::ErrorKind::ModelInference);
    }

    #[test]
    fn non_finite_input_is_inference_error() {
        let mut x = Array2::<f32>::ones((5, 3));
        x[[2, 1]] = f32::NAN;
        let err = classifier(0.0).classify(x.view(), 5).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ModelInference);
    }

    #[test]
    fn head_shape_is_validated() {
        let dir = LstmDirection::new(
            Array2::zeros((8, 3)),
            Array2::zeros((8, 2)),
            Array1::zeros(8),
            Array1::zeros(8),
        )
        .unwrap();
        let lstm = BiLstm::new(vec![BiLstmLayer::new(dir.clone(), dir).unwrap()]).unwrap();
        let hidden = Linear::new(Array2::zeros((3, 5)), Array1::zeros(3)).unwrap();
        let output = Linear::new(Array2::zeros((2, 3)), Array1::zeros(2)).unwrap();
        assert!(SequenceClassifier::new(lstm, hidden, output).is_err());
    }
}
