// ─────────────────────────────────────────────────────────────────────
// Stylus Kernel — Input Normalization Stage
// ─────────────────────────────────────────────────────────────────────

use serde::{Deserialize, Serialize};

use stylus_types::{StyleError, StyleResult};

use crate::tensor::{ensure_same_shape, Tensor};

/// Per-channel `(x - mean) / std`, broadcast over the spatial dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    mean: Vec<f64>,
    std: Vec<f64>,
}

impl Normalization {
    pub fn new(mean: &[f64], std: &[f64]) -> StyleResult<Self> {
        if mean.len() != std.len() || mean.is_empty() {
            return Err(StyleError::Config(format!(
                "normalization needs equal, non-empty mean/std, got {} and {}",
                mean.len(),
                std.len()
            )));
        }
        if std.iter().any(|&s| !(s.is_finite() && s > 0.0)) {
            return Err(StyleError::Config(format!(
                "normalization std must be finite and > 0, got {std:?}"
            )));
        }
        Ok(Self {
            mean: mean.to_vec(),
            std: std.to_vec(),
        })
    }

    pub fn channels(&self) -> usize {
        self.mean.len()
    }

    fn plane(&self, x: &Tensor) -> StyleResult<usize> {
        let (_, c, h, w) = x.dims4()?;
        if c != self.channels() {
            return Err(StyleError::Shape(format!(
                "normalization expects {} channels, got {c}",
                self.channels()
            )));
        }
        Ok(h * w)
    }

    pub fn forward(&self, x: &Tensor) -> StyleResult<Tensor> {
        let plane = self.plane(x)?;
        let c = self.channels();
        x.with_data(
            x.data()
                .iter()
                .enumerate()
                .map(|(i, &v)| {
                    let ch = (i / plane) % c;
                    (v - self.mean[ch]) / self.std[ch]
                })
                .collect(),
        )
    }

    pub fn backward(&self, x: &Tensor, grad_out: &Tensor) -> StyleResult<Tensor> {
        let plane = self.plane(x)?;
        ensure_same_shape(x, grad_out, "normalization backward")?;
        let c = self.channels();
        x.with_data(
            grad_out
                .data()
                .iter()
                .enumerate()
                .map(|(i, &g)| g / self.std[(i / plane) % c])
                .collect(),
        )
    }
}
