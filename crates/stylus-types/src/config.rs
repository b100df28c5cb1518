// ─────────────────────────────────────────────────────────────────────
// Stylus Kernel — Run Configuration
// ─────────────────────────────────────────────────────────────────────

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{StyleError, StyleResult};

/// Per-channel mean of the extractor's training distribution (RGB).
pub const IMAGENET_MEAN: [f64; 3] = [0.485, 0.456, 0.406];
/// Per-channel standard deviation of the extractor's training distribution (RGB).
pub const IMAGENET_STD: [f64; 3] = [0.229, 0.224, 0.225];

/// Step-length policy for the quasi-Newton optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineSearch {
    /// Fixed step of `lr` along the search direction.
    None,
    /// Armijo backtracking: halve the step until sufficient decrease.
    Backtracking,
}

/// L-BFGS optimizer parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LbfgsConfig {
    /// Base step length.
    pub lr: f64,
    /// Inner iterations per `step` call.
    pub max_iter: usize,
    /// Closure evaluations per `step` call.
    pub max_eval: usize,
    /// Stop when max |g| falls below this.
    pub tolerance_grad: f64,
    /// Stop when the step or the loss change falls below this.
    pub tolerance_change: f64,
    /// Number of curvature pairs kept.
    pub history_size: usize,
    pub line_search: LineSearch,
    /// Armijo sufficient-decrease constant.
    pub armijo_c1: f64,
    /// Trials before the backtracking search settles for its best point.
    pub max_line_search: usize,
}

impl Default for LbfgsConfig {
    fn default() -> Self {
        Self {
            lr: 1.0,
            max_iter: 20,
            max_eval: 25,
            tolerance_grad: 1e-7,
            tolerance_change: 1e-9,
            history_size: 100,
            line_search: LineSearch::Backtracking,
            armijo_c1: 1e-4,
            max_line_search: 10,
        }
    }
}

impl LbfgsConfig {
    pub fn validate(&self) -> StyleResult<()> {
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(StyleError::Config(format!(
                "optimizer.lr must be finite and > 0, got {}",
                self.lr
            )));
        }
        if self.max_iter == 0 {
            return Err(StyleError::Config("optimizer.max_iter must be >= 1".to_string()));
        }
        if self.max_eval == 0 {
            return Err(StyleError::Config("optimizer.max_eval must be >= 1".to_string()));
        }
        if self.history_size == 0 {
            return Err(StyleError::Config("optimizer.history_size must be >= 1".to_string()));
        }
        if !(0.0..1.0).contains(&self.armijo_c1) {
            return Err(StyleError::Config(format!(
                "optimizer.armijo_c1 must be in [0, 1), got {}",
                self.armijo_c1
            )));
        }
        if self.line_search == LineSearch::Backtracking && self.max_line_search == 0 {
            return Err(StyleError::Config(
                "optimizer.max_line_search must be >= 1 with backtracking".to_string(),
            ));
        }
        Ok(())
    }
}

/// Relative weight of the two loss families in the total loss.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossWeights {
    pub style: f64,
    pub content: f64,
}

/// Configuration for one style-transfer run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Canonical names that receive a content probe.
    /// Default: {conv_4}.
    pub content_layers: BTreeSet<String>,

    /// Canonical names that receive a style probe.
    /// Default: {conv_1, ..., conv_5}.
    pub style_layers: BTreeSet<String>,

    /// Multiplier on the summed style losses. Default: 1e6.
    pub style_weight: f64,

    /// Multiplier on the summed content losses. Default: 1.
    pub content_weight: f64,

    /// Evaluation budget; the loop stops once the counter exceeds it.
    pub num_steps: usize,

    /// Seed the image from Gaussian noise instead of the content image.
    pub random_start: bool,

    /// Seed for the noise start.
    pub seed: u64,

    pub normalization_mean: [f64; 3],
    pub normalization_std: [f64; 3],

    /// Log progress every N evaluations; 0 disables.
    pub progress_every: usize,

    /// Abort with a numerical error when the total loss is NaN/Inf.
    pub halt_on_non_finite: bool,

    pub optimizer: LbfgsConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            content_layers: ["conv_4"].iter().map(|s| s.to_string()).collect(),
            style_layers: (1..=5).map(|i| format!("conv_{i}")).collect(),
            style_weight: 1_000_000.0,
            content_weight: 1.0,
            num_steps: 300,
            random_start: false,
            seed: 42,
            normalization_mean: IMAGENET_MEAN,
            normalization_std: IMAGENET_STD,
            progress_every: 50,
            halt_on_non_finite: true,
            optimizer: LbfgsConfig::default(),
        }
    }
}

impl TransferConfig {
    /// Validate configuration parameters.
    pub fn validate(&self) -> StyleResult<()> {
        if !(self.style_weight.is_finite() && self.style_weight > 0.0) {
            return Err(StyleError::Config(format!(
                "style_weight must be finite and > 0, got {}",
                self.style_weight
            )));
        }
        if !(self.content_weight.is_finite() && self.content_weight > 0.0) {
            return Err(StyleError::Config(format!(
                "content_weight must be finite and > 0, got {}",
                self.content_weight
            )));
        }
        if self.num_steps == 0 {
            return Err(StyleError::Config("num_steps must be >= 1".to_string()));
        }
        if self.content_layers.is_empty() && self.style_layers.is_empty() {
            return Err(StyleError::Config(
                "content_layers and style_layers are both empty".to_string(),
            ));
        }
        if self.normalization_mean.iter().any(|m| !m.is_finite()) {
            return Err(StyleError::Config(format!(
                "normalization_mean must be finite, got {:?}",
                self.normalization_mean
            )));
        }
        if self
            .normalization_std
            .iter()
            .any(|s| !(s.is_finite() && *s > 0.0))
        {
            return Err(StyleError::Config(format!(
                "normalization_std must be finite and > 0, got {:?}",
                self.normalization_std
            )));
        }
        self.optimizer.validate()
    }

    pub fn loss_weights(&self) -> LossWeights {
        LossWeights {
            style: self.style_weight,
            content: self.content_weight,
        }
    }

    /// Load from JSON string. Missing fields take their defaults.
    pub fn from_json(json: &str) -> StyleResult<Self> {
        let cfg: Self = serde_json::from_str(json)
            .map_err(|e| StyleError::Config(format!("JSON parse error: {e}")))?;
        log::debug!(
            "Loaded transfer config: {} content layers, {} style layers, {} steps",
            cfg.content_layers.len(),
            cfg.style_layers.len(),
            cfg.num_steps
        );
        Ok(cfg)
    }
}
