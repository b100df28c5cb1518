// ─────────────────────────────────────────────────────────────────────
// Stylus Kernel — Dense Tensor
// ─────────────────────────────────────────────────────────────────────
//! Row-major `f64` tensor with an explicit shape.
//!
//! Images and feature maps use NCHW layout: element (b, c, y, x) lives at
//! `((b * C + c) * H + y) * W + x`.

use serde::{Deserialize, Serialize};

use stylus_types::{StyleError, StyleResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl Tensor {
    /// Build a tensor, checking that `data` fills `shape` exactly.
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> StyleResult<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(StyleError::Shape(format!(
                "shape {shape:?} needs {expected} elements, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let n = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; n],
        }
    }

    pub fn full(shape: Vec<usize>, value: f64) -> Self {
        let n = shape.iter().product();
        Self {
            shape,
            data: vec![value; n],
        }
    }

    /// Tensor of the same shape as `self` with different contents.
    pub fn with_data(&self, data: Vec<f64>) -> StyleResult<Self> {
        Self::new(self.shape.clone(), data)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f64> {
        self.data
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Split a rank-4 shape into (batch, channels, height, width).
    pub fn dims4(&self) -> StyleResult<(usize, usize, usize, usize)> {
        match self.shape.as_slice() {
            &[n, c, h, w] => Ok((n, c, h, w)),
            other => Err(StyleError::Shape(format!("expected NCHW tensor, got shape {other:?}"))),
        }
    }

    /// Clamp every element into [lo, hi] in place.
    pub fn clamp_(&mut self, lo: f64, hi: f64) {
        clamp_slice(&mut self.data, lo, hi);
    }

    /// Prepend a singleton batch dimension.
    pub fn unsqueeze_batch(mut self) -> Self {
        self.shape.insert(0, 1);
        self
    }

    /// Drop a leading singleton batch dimension.
    pub fn squeeze_batch(mut self) -> StyleResult<Self> {
        match self.shape.first() {
            Some(1) => {
                self.shape.remove(0);
                Ok(self)
            }
            _ => Err(StyleError::Shape(format!(
                "cannot squeeze batch dimension of shape {:?}",
                self.shape
            ))),
        }
    }

    /// Element-wise `self += alpha * other`.
    pub fn add_scaled(&mut self, other: &Tensor, alpha: f64) -> StyleResult<()> {
        ensure_same_shape(self, other, "add_scaled")?;
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += alpha * b;
        }
        Ok(())
    }

    pub fn min_max(&self) -> Option<(f64, f64)> {
        slice_min_max(&self.data)
    }
}

/// Smallest and largest element of a raw buffer; `None` when empty.
pub fn slice_min_max(data: &[f64]) -> Option<(f64, f64)> {
    let first = *data.first()?;
    Some(
        data.iter()
            .fold((first, first), |(lo, hi), &v| (lo.min(v), hi.max(v))),
    )
}

/// Clamp a raw buffer into [lo, hi] in place.
#[inline]
pub fn clamp_slice(data: &mut [f64], lo: f64, hi: f64) {
    for v in data.iter_mut() {
        *v = v.clamp(lo, hi);
    }
}

pub(crate) fn ensure_same_shape(a: &Tensor, b: &Tensor, what: &str) -> StyleResult<()> {
    if a.shape != b.shape {
        return Err(StyleError::Shape(format!(
            "{what}: shapes {:?} and {:?} differ",
            a.shape, b.shape
        )));
    }
    Ok(())
}

/// Mean of squared element-wise differences.
pub fn mse(input: &Tensor, target: &Tensor) -> StyleResult<f64> {
    ensure_same_shape(input, target, "mse")?;
    if input.numel() == 0 {
        return Ok(0.0);
    }
    let sum: f64 = input
        .data
        .iter()
        .zip(target.data.iter())
        .map(|(a, b)| (a - b) * (a - b))
        .sum();
    Ok(sum / input.numel() as f64)
}

/// Gradient of `mse(input, target)` with respect to `input`, scaled by `scale`.
pub fn mse_grad(input: &Tensor, target: &Tensor, scale: f64) -> StyleResult<Tensor> {
    ensure_same_shape(input, target, "mse_grad")?;
    let k = 2.0 * scale / input.numel().max(1) as f64;
    let data = input
        .data
        .iter()
        .zip(target.data.iter())
        .map(|(a, b)| k * (a - b))
        .collect();
    input.with_data(data)
}
