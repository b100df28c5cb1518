// ─────────────────────────────────────────────────────────────────────
// Stylus Kernel — Transfer Engine (Optimization Loop)
// ─────────────────────────────────────────────────────────────────────
//! Pixel-space optimization of one image against a style model.
//!
//! Per evaluation:
//!   1. Clamp the image to [0, 1]
//!   2. Forward through the pipeline, collecting probe losses
//!   3. Weight and sum: style · Σ style + content · Σ content
//!   4. Backward to ∂total/∂image (extractor weights stay frozen)
//!
//! The optimizer reports every evaluation it made; the loop appends one
//! history entry and advances the iteration counter per evaluation, then
//! stops once the counter exceeds the budget. A final clamp follows.

use std::sync::Arc;

use log::{debug, error, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use stylus_net::{clamp_slice, slice_min_max, FeatureExtractor, Normalization, Tensor};
use stylus_types::{
    LossHistory, LossWeights, SharedLossHistory, StyleError, StyleResult, TransferConfig,
};

use crate::builder::{build_style_model, ProbePlan};
use crate::lbfgs::{Evaluation, Lbfgs};
use crate::pipeline::StyleModel;

/// Weighted loss terms of one evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossTerms {
    pub style: f64,
    pub content: f64,
}

impl LossTerms {
    pub fn total(&self) -> f64 {
        self.style + self.content
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Done,
}

/// Running pixel extent over every image a run observed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelRange {
    pub min: f64,
    pub max: f64,
}

impl PixelRange {
    fn empty() -> Self {
        Self {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn include(&mut self, extent: Option<(f64, f64)>) {
        if let Some((lo, hi)) = extent {
            self.min = self.min.min(lo);
            self.max = self.max.max(hi);
        }
    }

    /// True when every observed pixel lies in [lo, hi]. Vacuously true
    /// when nothing was observed.
    pub fn within(&self, lo: f64, hi: f64) -> bool {
        self.min >= lo && self.max <= hi
    }
}

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct TransferOutput {
    /// Final image, clamped to [0, 1], batch dimension removed.
    pub image: Tensor,
    pub history: LossHistory,
    /// Closure evaluations performed.
    pub iterations: usize,
    /// Optimizer `step` calls performed.
    pub optimizer_steps: usize,
    /// Extent of the images handed to the loss.
    pub evaluated_range: PixelRange,
    /// Extent of the image after each optimizer step.
    pub stepped_range: PixelRange,
}

/// Weighted losses and image gradient at `image`. Pure.
pub fn evaluate(
    model: &StyleModel,
    image: &Tensor,
    weights: LossWeights,
) -> StyleResult<Evaluation<LossTerms>> {
    let pass = model.forward(image)?;
    let terms = LossTerms {
        style: weights.style * pass.style_losses.iter().sum::<f64>(),
        content: weights.content * pass.content_losses.iter().sum::<f64>(),
    };
    let grad = model.backward(&pass, weights)?;
    Ok(Evaluation {
        loss: terms.total(),
        grad: grad.into_data(),
        info: terms,
    })
}

/// Whether iteration `iteration` emits a progress line.
///
/// Fires on every multiple of `every`; `every == 0` disables reporting.
/// This intentionally replaces the older fixed residue-10 gate, which
/// never fires for periods that do not divide into it.
#[inline]
pub fn should_report(iteration: usize, every: usize) -> bool {
    every != 0 && iteration % every == 0
}

/// Starting point: a copy of the content image, or seeded standard
/// normal noise of the same shape.
pub fn initial_image(content: &Tensor, random_start: bool, seed: u64) -> StyleResult<Tensor> {
    if !random_start {
        return Ok(content.clone());
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let data = (0..content.numel())
        .map(|_| rng.sample::<f64, _>(StandardNormal))
        .collect();
    content.with_data(data)
}

/// Style-transfer runner over a shared, read-only extractor.
#[derive(Debug, Clone)]
pub struct StyleTransfer {
    extractor: Arc<FeatureExtractor>,
    config: TransferConfig,
}

impl StyleTransfer {
    pub fn new(extractor: Arc<FeatureExtractor>, config: TransferConfig) -> StyleResult<Self> {
        config.validate()?;
        Ok(Self { extractor, config })
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn extractor(&self) -> &Arc<FeatureExtractor> {
        &self.extractor
    }

    /// Build the probe-instrumented model for one image pair.
    pub fn build_model(&self, content: &Tensor, style: &Tensor) -> StyleResult<StyleModel> {
        let normalization = Normalization::new(
            &self.config.normalization_mean,
            &self.config.normalization_std,
        )?;
        build_style_model(
            &self.extractor,
            &normalization,
            style,
            content,
            &ProbePlan::from_config(&self.config),
        )
    }

    /// Run to completion. `content` and `style` are (1, C, H, W) in [0, 1].
    pub fn run(&self, content: &Tensor, style: &Tensor) -> StyleResult<TransferOutput> {
        self.run_with_history(content, style, &SharedLossHistory::new())
    }

    /// Like [`run`](Self::run), also appending every history entry to
    /// `shared` as soon as the optimizer step that produced it returns.
    pub fn run_with_history(
        &self,
        content: &Tensor,
        style: &Tensor,
        shared: &SharedLossHistory,
    ) -> StyleResult<TransferOutput> {
        let cfg = &self.config;
        let model = self.build_model(content, style)?;
        let weights = cfg.loss_weights();
        let halt_on_non_finite = cfg.halt_on_non_finite;

        let start = initial_image(content, cfg.random_start, cfg.seed)?;
        let shape = start.shape().to_vec();
        let mut x = start.into_data();

        let mut optimizer = Lbfgs::new(cfg.optimizer.clone())?;
        let mut history = LossHistory::new();
        let mut iteration = 0usize;
        let mut optimizer_steps = 0usize;
        let mut state = RunState::Running;
        let mut evaluated = PixelRange::empty();
        let mut stepped = PixelRange::empty();

        info!(
            "Optimizing {:?} image for {} steps (style weight {}, content weight {})",
            shape, cfg.num_steps, weights.style, weights.content
        );

        while state == RunState::Running {
            let report = optimizer.step(&mut x, |pixels| {
                clamp_slice(pixels, 0.0, 1.0);
                let image = Tensor::new(shape.clone(), pixels.to_vec())?;
                evaluated.include(image.min_max());
                let eval = evaluate(&model, &image, weights)?;
                if halt_on_non_finite && !eval.loss.is_finite() {
                    error!(
                        "Non-finite loss (style {}, content {})",
                        eval.info.style, eval.info.content
                    );
                    return Err(StyleError::Numerical(format!(
                        "total loss became {}",
                        eval.loss
                    )));
                }
                Ok(eval)
            })?;
            optimizer_steps += 1;

            for terms in &report.evaluations {
                iteration += 1;
                history.record(terms.style, terms.content);
                shared.record(terms.style, terms.content);
                if should_report(iteration, cfg.progress_every) {
                    info!(
                        "run [{iteration}]: Style Loss : {:.4} Content Loss: {:.4}",
                        terms.style, terms.content
                    );
                }
            }
            debug!(
                "Optimizer step {optimizer_steps}: {} evaluations, loss {:.6} -> {:.6}",
                report.evaluations.len(),
                report.loss,
                report.final_loss
            );

            clamp_slice(&mut x, 0.0, 1.0);
            if let Some((lo, hi)) = slice_min_max(&x) {
                debug!("Optimizer step {optimizer_steps}: pixels in [{lo:.4}, {hi:.4}]");
                stepped.include(Some((lo, hi)));
            }
            if iteration > cfg.num_steps {
                state = RunState::Done;
            }
        }

        clamp_slice(&mut x, 0.0, 1.0);
        let image = Tensor::new(shape, x)?.squeeze_batch()?;
        info!(
            "Optimization finished after {iteration} evaluations in {optimizer_steps} optimizer steps"
        );

        Ok(TransferOutput {
            image,
            history,
            iterations: iteration,
            optimizer_steps,
            evaluated_range: evaluated,
            stepped_range: stepped,
        })
    }
}
