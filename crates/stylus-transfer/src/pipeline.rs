// ─────────────────────────────────────────────────────────────────────
// Stylus Kernel — Style Pipeline
// ─────────────────────────────────────────────────────────────────────
//! Ordered stage list: normalization, then feature layers interleaved
//! with loss probes, ending at the deepest probe.
//!
//! Forward records every intermediate activation on a tape; backward
//! walks the tape in reverse, injecting each probe's weighted loss
//! gradient where the probe sits. The result is ∂L_total/∂image.

use stylus_net::{BatchNorm2d, Conv2d, MaxPool2d, Normalization, Relu, Tensor};
use stylus_types::{LossWeights, StyleError, StyleResult};

use crate::probe::{ContentProbe, LossProbe, StyleProbe};

/// What a stage does. Probe variants index into the model's probe lists.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOp {
    Normalize(Normalization),
    Convolution(Conv2d),
    Activation(Relu),
    SpatialPool(MaxPool2d),
    BatchNormalize(BatchNorm2d),
    ContentProbe(usize),
    StyleProbe(usize),
}

impl StageOp {
    pub fn is_probe(&self) -> bool {
        matches!(self, StageOp::ContentProbe(_) | StageOp::StyleProbe(_))
    }

    /// Transformed activation, or `None` for probes (which pass data through).
    pub(crate) fn apply(&self, x: &Tensor) -> StyleResult<Option<Tensor>> {
        let y = match self {
            StageOp::Normalize(norm) => norm.forward(x)?,
            StageOp::Convolution(conv) => conv.forward(x)?,
            StageOp::Activation(relu) => relu.forward(x)?,
            StageOp::SpatialPool(pool) => pool.forward(x)?,
            StageOp::BatchNormalize(bn) => bn.forward(x)?,
            StageOp::ContentProbe(_) | StageOp::StyleProbe(_) => return Ok(None),
        };
        Ok(Some(y))
    }

    fn input_gradient(&self, x: &Tensor, grad_out: &Tensor) -> StyleResult<Tensor> {
        match self {
            StageOp::Normalize(norm) => norm.backward(x, grad_out),
            StageOp::Convolution(conv) => conv.backward(x, grad_out),
            StageOp::Activation(relu) => relu.backward(x, grad_out),
            StageOp::SpatialPool(pool) => pool.backward(x, grad_out),
            StageOp::BatchNormalize(bn) => bn.backward(x, grad_out),
            StageOp::ContentProbe(_) | StageOp::StyleProbe(_) => Ok(grad_out.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub name: String,
    pub op: StageOp,
}

/// Named stage sequence with unique names.
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    /// Pipeline holding only the normalization stage.
    pub fn new(normalization: Normalization) -> Self {
        Self {
            stages: vec![Stage {
                name: "normalization".to_string(),
                op: StageOp::Normalize(normalization),
            }],
        }
    }

    /// Append a stage. Names must be unique within the pipeline.
    pub fn push(&mut self, name: String, op: StageOp) -> StyleResult<()> {
        if self.contains(&name) {
            return Err(StyleError::Pipeline(format!("duplicate stage name '{name}'")));
        }
        self.stages.push(Stage { name, op });
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stages.iter().any(|s| s.name == name)
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Drop every stage after the last probe; returns how many were removed.
    ///
    /// A pipeline without probes keeps only its first stage.
    pub fn truncate_after_last_probe(&mut self) -> usize {
        let keep = self
            .stages
            .iter()
            .rposition(|s| s.op.is_probe())
            .map_or(1, |i| i + 1)
            .min(self.stages.len());
        let removed = self.stages.len() - keep;
        self.stages.truncate(keep);
        removed
    }
}

/// Losses measured by one forward pass plus the tape backward needs.
#[derive(Debug, Clone)]
pub struct ForwardPass {
    /// Input image followed by the output of every transforming stage.
    activations: Vec<Tensor>,
    /// Raw (unweighted) loss of each style probe, in pipeline order.
    pub style_losses: Vec<f64>,
    /// Raw (unweighted) loss of each content probe, in pipeline order.
    pub content_losses: Vec<f64>,
}

impl ForwardPass {
    pub fn output(&self) -> Option<&Tensor> {
        self.activations.last()
    }
}

/// Built pipeline together with the probes it references.
#[derive(Debug, Clone)]
pub struct StyleModel {
    pub(crate) pipeline: Pipeline,
    pub(crate) style_probes: Vec<StyleProbe>,
    pub(crate) content_probes: Vec<ContentProbe>,
}

impl StyleModel {
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn style_probes(&self) -> &[StyleProbe] {
        &self.style_probes
    }

    pub fn content_probes(&self) -> &[ContentProbe] {
        &self.content_probes
    }

    fn content_probe(&self, idx: usize) -> StyleResult<&ContentProbe> {
        self.content_probes.get(idx).ok_or_else(|| {
            StyleError::Pipeline(format!("content probe {idx} missing from model"))
        })
    }

    fn style_probe(&self, idx: usize) -> StyleResult<&StyleProbe> {
        self.style_probes
            .get(idx)
            .ok_or_else(|| StyleError::Pipeline(format!("style probe {idx} missing from model")))
    }

    /// Push `x` through every stage, collecting probe losses.
    pub fn forward(&self, x: &Tensor) -> StyleResult<ForwardPass> {
        let mut activations = vec![x.clone()];
        let mut style_losses = Vec::with_capacity(self.style_probes.len());
        let mut content_losses = Vec::with_capacity(self.content_probes.len());

        for stage in self.pipeline.stages() {
            let current = activations
                .last()
                .ok_or_else(|| StyleError::Pipeline("empty activation tape".to_string()))?;
            match &stage.op {
                StageOp::ContentProbe(idx) => {
                    let (_, loss) = self.content_probe(*idx)?.forward(current)?;
                    content_losses.push(loss);
                }
                StageOp::StyleProbe(idx) => {
                    let (_, loss) = self.style_probe(*idx)?.forward(current)?;
                    style_losses.push(loss);
                }
                op => {
                    if let Some(next) = op.apply(current)? {
                        activations.push(next);
                    }
                }
            }
        }

        Ok(ForwardPass {
            activations,
            style_losses,
            content_losses,
        })
    }

    /// ∂/∂x of `weights.style · Σ style + weights.content · Σ content`,
    /// where x is the input of the pass.
    pub fn backward(&self, pass: &ForwardPass, weights: LossWeights) -> StyleResult<Tensor> {
        let tape = &pass.activations;
        let mut k = tape.len() - 1;
        let mut grad = Tensor::zeros(tape[k].shape().to_vec());

        for stage in self.pipeline.stages().iter().rev() {
            match &stage.op {
                StageOp::ContentProbe(idx) => {
                    let g = self.content_probe(*idx)?.backward(&tape[k], weights.content)?;
                    grad.add_scaled(&g, 1.0)?;
                }
                StageOp::StyleProbe(idx) => {
                    let g = self.style_probe(*idx)?.backward(&tape[k], weights.style)?;
                    grad.add_scaled(&g, 1.0)?;
                }
                op => {
                    if k == 0 {
                        return Err(StyleError::Pipeline(
                            "activation tape shorter than pipeline".to_string(),
                        ));
                    }
                    grad = op.input_gradient(&tape[k - 1], &grad)?;
                    k -= 1;
                }
            }
        }
        Ok(grad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm() -> Normalization {
        Normalization::new(&[0.5], &[0.5]).unwrap()
    }

    fn probe_model() -> StyleModel {
        // normalization → conv → style probe → relu → content probe
        let conv = Conv2d::new(
            1,
            2,
            3,
            1,
            1,
            (0..18).map(|i| ((i as f64) * 0.45).cos() * 0.5).collect(),
            vec![0.1, -0.1],
        )
        .unwrap();
        let mut pipeline = Pipeline::new(norm());
        pipeline
            .push("conv_1".into(), StageOp::Convolution(conv))
            .unwrap();
        pipeline
            .push("style_loss_conv_1".into(), StageOp::StyleProbe(0))
            .unwrap();
        pipeline
            .push("relu_1".into(), StageOp::Activation(Relu::out_of_place()))
            .unwrap();
        pipeline
            .push("content_loss_relu_1".into(), StageOp::ContentProbe(0))
            .unwrap();

        let style_target = Tensor::new(
            vec![1, 2, 4, 4],
            (0..32).map(|i| ((i as f64) * 0.9).sin()).collect(),
        )
        .unwrap();
        let content_target = Tensor::new(
            vec![1, 2, 4, 4],
            (0..32).map(|i| ((i as f64) * 0.4).cos().max(0.0)).collect(),
        )
        .unwrap();
        StyleModel {
            pipeline,
            style_probes: vec![StyleProbe::new(&style_target).unwrap()],
            content_probes: vec![ContentProbe::new(&content_target)],
        }
    }

    fn image() -> Tensor {
        Tensor::new(
            vec![1, 1, 4, 4],
            (0..16).map(|i| 0.5 + 0.4 * ((i as f64) * 1.7).sin()).collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_push_rejects_duplicates() {
        let mut p = Pipeline::new(norm());
        p.push("relu_0".into(), StageOp::Activation(Relu::out_of_place()))
            .unwrap();
        let err = p
            .push("relu_0".into(), StageOp::Activation(Relu::out_of_place()))
            .unwrap_err();
        assert!(matches!(err, StyleError::Pipeline(_)));
        assert_eq!(p.len(), 2);
    }

    #[test]
    fn test_truncate_after_last_probe() {
        let mut p = Pipeline::new(norm());
        p.push("relu_0".into(), StageOp::Activation(Relu::out_of_place()))
            .unwrap();
        p.push("style_loss_relu_0".into(), StageOp::StyleProbe(0))
            .unwrap();
        p.push("pool_0".into(), StageOp::SpatialPool(MaxPool2d::new(2, 2)))
            .unwrap();
        p.push("relu_x".into(), StageOp::Activation(Relu::out_of_place()))
            .unwrap();
        assert_eq!(p.truncate_after_last_probe(), 2);
        assert_eq!(p.names(), ["normalization", "relu_0", "style_loss_relu_0"]);
    }

    #[test]
    fn test_truncate_without_probes_keeps_normalization() {
        let mut p = Pipeline::new(norm());
        p.push("relu_0".into(), StageOp::Activation(Relu::out_of_place()))
            .unwrap();
        assert_eq!(p.truncate_after_last_probe(), 1);
        assert_eq!(p.names(), ["normalization"]);
    }

    #[test]
    fn test_forward_collects_losses_in_order() {
        let model = probe_model();
        let pass = model.forward(&image()).unwrap();
        assert_eq!(pass.style_losses.len(), 1);
        assert_eq!(pass.content_losses.len(), 1);
        assert!(pass.style_losses[0] > 0.0);
        assert!(pass.content_losses[0] > 0.0);
        // normalization, conv, relu
        assert_eq!(pass.output().unwrap().shape(), &[1, 2, 4, 4]);
    }

    #[test]
    fn test_backward_matches_fd() {
        let model = probe_model();
        let weights = LossWeights {
            style: 100.0,
            content: 1.0,
        };
        let total = |x: &Tensor| -> f64 {
            let pass = model.forward(x).unwrap();
            weights.style * pass.style_losses.iter().sum::<f64>()
                + weights.content * pass.content_losses.iter().sum::<f64>()
        };
        let x = image();
        let grad = model.backward(&model.forward(&x).unwrap(), weights).unwrap();
        assert_eq!(grad.shape(), x.shape());

        let eps = 1e-6;
        for i in 0..x.numel() {
            let mut plus = x.clone();
            plus.data_mut()[i] += eps;
            let mut minus = x.clone();
            minus.data_mut()[i] -= eps;
            let fd = (total(&plus) - total(&minus)) / (2.0 * eps);
            let a = grad.data()[i];
            assert!(
                (a - fd).abs() < 1e-4 * (1.0 + fd.abs()),
                "component {i}: analytic={a:.8}, fd={fd:.8}"
            );
        }
    }

    #[test]
    fn test_missing_probe_index_is_error() {
        let mut model = probe_model();
        model.content_probes.clear();
        assert!(matches!(
            model.forward(&image()),
            Err(StyleError::Pipeline(_))
        ));
    }
}
