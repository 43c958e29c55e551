use tch::{nn, Tensor};

use super::leaky_relu;

const ESTIMATOR_CHS: [i64; 5] = [128, 128, 96, 64, 32];
const CONTEXT_CHS: [(i64, i64); 6] = [(128, 1), (128, 2), (128, 4), (96, 8), (64, 16), (32, 1)];

fn conv3x3(vs: nn::Path, in_ch: i64, out_ch: i64, dilation: i64) -> nn::Conv2D {
    nn::conv2d(
        vs,
        in_ch,
        out_ch,
        3,
        nn::ConvConfig {
            padding: dilation,
            dilation,
            ..Default::default()
        },
    )
}

/// Per-level flow estimator: a conv stack that predicts a flow residual.
#[derive(Debug)]
pub struct FlowEstimator {
    convs: Vec<nn::Conv2D>,
    predict: nn::Conv2D,
}

impl FlowEstimator {
    pub fn new(vs: &nn::Path, in_ch: i64) -> Self {
        let mut convs = Vec::with_capacity(ESTIMATOR_CHS.len());
        let mut ch = in_ch;
        for (i, &out_ch) in ESTIMATOR_CHS.iter().enumerate() {
            convs.push(conv3x3(vs / i, ch, out_ch, 1));
            ch = out_ch;
        }
        let predict = conv3x3(vs / "predict", ch, 2, 1);
        Self { convs, predict }
    }

    pub fn hidden_channels() -> i64 {
        ESTIMATOR_CHS[ESTIMATOR_CHS.len() - 1]
    }

    /// Returns `(last hidden features, flow residual)`.
    pub fn forward(&self, x: &Tensor) -> (Tensor, Tensor) {
        let mut x = x.shallow_clone();
        for conv in &self.convs {
            x = leaky_relu(&x.apply(conv));
        }
        let flow = x.apply(&self.predict);
        (x, flow)
    }
}

/// Dilated conv stack that refines the finest flow from estimator features.
#[derive(Debug)]
pub struct ContextNetwork {
    convs: Vec<nn::Conv2D>,
    predict: nn::Conv2D,
}

impl ContextNetwork {
    pub fn new(vs: &nn::Path, in_ch: i64) -> Self {
        let mut convs = Vec::with_capacity(CONTEXT_CHS.len());
        let mut ch = in_ch;
        for (i, &(out_ch, dilation)) in CONTEXT_CHS.iter().enumerate() {
            convs.push(conv3x3(vs / i, ch, out_ch, dilation));
            ch = out_ch;
        }
        let predict = conv3x3(vs / "predict", ch, 2, 1);
        Self { convs, predict }
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        let mut x = x.shallow_clone();
        for conv in &self.convs {
            x = leaky_relu(&x.apply(conv));
        }
        x.apply(&self.predict)
    }
}
