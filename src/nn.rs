use ndarray::{concatenate, s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct ShapeError(pub String);

fn to_matrix(rows: &[Vec<f32>], name: &str) -> Result<Array2<f32>, ShapeError> {
    let n_rows = rows.len();
    let n_cols = rows.first().map(|r| r.len()).unwrap_or(0);
    if n_rows == 0 || n_cols == 0 {
        return Err(ShapeError(format!("{name} 为空")));
    }
    if rows.iter().any(|r| r.len() != n_cols) {
        return Err(ShapeError(format!("{name} 各行长度不一致")));
    }
    let flat: Vec<f32> = rows.iter().flatten().copied().collect();
    Array2::from_shape_vec((n_rows, n_cols), flat).map_err(|e| ShapeError(format!("{name}: {e}")))
}

/// 全连接层权重，布局与 PyTorch 一致：`weight` 为 `[out, in]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearWeights {
    pub weight: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct Linear {
    weight: Array2<f32>,
    bias: Array1<f32>,
}

impl Linear {
    pub fn new(weight: Array2<f32>, bias: Array1<f32>) -> Result<Self, ShapeError> {
        if weight.nrows() != bias.len() {
            return Err(ShapeError(format!(
                "Linear: weight {:?} 与 bias {} 不匹配",
                weight.dim(),
                bias.len()
            )));
        }
        Ok(Self { weight, bias })
    }

    pub fn from_weights(w: &LinearWeights, name: &str) -> Result<Self, ShapeError> {
        Self::new(to_matrix(&w.weight, name)?, Array1::from(w.bias.clone()))
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    /// `[N, in]` → `[N, out]`
    pub fn forward(&self, x: ArrayView2<f32>) -> Array2<f32> {
        x.dot(&self.weight.t()) + &self.bias
    }

    /// `[in]` → `[out]`
    pub fn forward_vec(&self, x: ArrayView1<f32>) -> Array1<f32> {
        self.weight.dot(&x) + &self.bias
    }
}

pub fn relu_inplace<D: ndarray::Dimension>(x: &mut ndarray::Array<f32, D>) {
    x.mapv_inplace(|v| v.max(0.0));
}

fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

/// 数值稳定的 softmax（f64 计算）
pub fn softmax(logits: ArrayView1<f32>) -> Vec<f64> {
    let max = logits.iter().fold(f64::NEG_INFINITY, |m, &v| m.max(v as f64));
    let exps: Vec<f64> = logits.iter().map(|&v| (v as f64 - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// 单方向 LSTM 权重，门顺序为 i, f, g, o（PyTorch 布局）
///
/// 只用于推理，dropout 不建模。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LstmDirectionWeights {
    pub w_ih: Vec<Vec<f32>>,
    pub w_hh: Vec<Vec<f32>>,
    pub b_ih: Vec<f32>,
    pub b_hh: Vec<f32>,
}

/// 双向 LSTM 单层权重
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BiLstmLayerWeights {
    pub forward: LstmDirectionWeights,
    pub backward: LstmDirectionWeights,
}

#[derive(Debug, Clone)]
pub struct LstmDirection {
    w_ih: Array2<f32>,
    w_hh: Array2<f32>,
    bias: Array1<f32>,
    hidden: usize,
}

impl LstmDirection {
    pub fn new(
        w_ih: Array2<f32>,
        w_hh: Array2<f32>,
        b_ih: Array1<f32>,
        b_hh: Array1<f32>,
    ) -> Result<Self, ShapeError> {
        let hidden = w_hh.ncols();
        let gates = 4 * hidden;
        if hidden == 0
            || w_ih.nrows() != gates
            || w_hh.nrows() != gates
            || b_ih.len() != gates
            || b_hh.len() != gates
        {
            return Err(ShapeError(format!(
                "LSTM: w_ih {:?}, w_hh {:?}, b_ih {}, b_hh {} 形状不一致",
                w_ih.dim(),
                w_hh.dim(),
                b_ih.len(),
                b_hh.len()
            )));
        }
        Ok(Self {
            w_ih,
            w_hh,
            bias: b_ih + b_hh,
            hidden,
        })
    }

    pub fn from_weights(w: &LstmDirectionWeights, name: &str) -> Result<Self, ShapeError> {
        Self::new(
            to_matrix(&w.w_ih, &format!("{name}.w_ih"))?,
            to_matrix(&w.w_hh, &format!("{name}.w_hh"))?,
            Array1::from(w.b_ih.clone()),
            Array1::from(w.b_hh.clone()),
        )
    }

    pub fn input_size(&self) -> usize {
        self.w_ih.ncols()
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden
    }

    /// 输入 `[T, I]`，输出 `[T, H]`；`reverse` 时从最后一个时间步往前处理，
    /// 输出仍按原时间位置排列
    pub fn run(&self, input: ArrayView2<f32>, reverse: bool) -> Array2<f32> {
        let steps = input.nrows();
        let h_size = self.hidden;
        let mut h = Array1::<f32>::zeros(h_size);
        let mut c = Array1::<f32>::zeros(h_size);
        let mut out = Array2::<f32>::zeros((steps, h_size));

        // 输入投影与时间步无关，一次算完
        let projected = input.dot(&self.w_ih.t()) + &self.bias;

        let order: Box<dyn Iterator<Item = usize>> = if reverse {
            Box::new((0..steps).rev())
        } else {
            Box::new(0..steps)
        };

        for t in order {
            let gates = &projected.row(t) + &self.w_hh.dot(&h);
            let i = gates.slice(s![0..h_size]).mapv(sigmoid);
            let f = gates.slice(s![h_size..2 * h_size]).mapv(sigmoid);
            let g = gates.slice(s![2 * h_size..3 * h_size]).mapv(f32::tanh);
            let o = gates.slice(s![3 * h_size..4 * h_size]).mapv(sigmoid);
            c = &f * &c + &i * &g;
            h = &o * &c.mapv(f32::tanh);
            out.row_mut(t).assign(&h);
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct BiLstmLayer {
    forward: LstmDirection,
    backward: LstmDirection,
}

impl BiLstmLayer {
    pub fn new(forward: LstmDirection, backward: LstmDirection) -> Result<Self, ShapeError> {
        if forward.input_size() != backward.input_size()
            || forward.hidden_size() != backward.hidden_size()
        {
            return Err(ShapeError("双向 LSTM 两个方向的形状不一致".to_string()));
        }
        Ok(Self { forward, backward })
    }

    /// `[T, I]` → `[T, 2H]`（前向在前，后向在后）
    pub fn forward(&self, input: ArrayView2<f32>) -> Array2<f32> {
        let fwd = self.forward.run(input, false);
        let bwd = self.backward.run(input, true);
        // 两个输出行数相同，拼接不会失败
        concatenate(Axis(1), &[fwd.view(), bwd.view()]).unwrap_or_else(|_| Array2::zeros((0, 0)))
    }
}

/// 多层双向 LSTM（层间 dropout 推理时关闭）
#[derive(Debug, Clone)]
pub struct BiLstm {
    layers: Vec<BiLstmLayer>,
}

impl BiLstm {
    pub fn new(layers: Vec<BiLstmLayer>) -> Result<Self, ShapeError> {
        let first = layers
            .first()
            .ok_or_else(|| ShapeError("LSTM 至少需要一层".to_string()))?;
        let hidden = first.forward.hidden_size();
        for (n, layer) in layers.iter().enumerate().skip(1) {
            if layer.forward.input_size() != 2 * hidden || layer.forward.hidden_size() != hidden {
                return Err(ShapeError(format!("LSTM 第 {n} 层输入维度应为 {}", 2 * hidden)));
            }
        }
        Ok(Self { layers })
    }

    pub fn input_size(&self) -> usize {
        self.layers[0].forward.input_size()
    }

    pub fn hidden_size(&self) -> usize {
        self.layers[0].forward.hidden_size()
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// `[T, I]` → 最后一层全部时间步输出 `[T, 2H]`
    pub fn forward(&self, input: ArrayView2<f32>) -> Array2<f32> {
        let mut x = self.layers[0].forward(input);
        for layer in &self.layers[1..] {
            x = layer.forward(x.view());
        }
        x
    }
}
