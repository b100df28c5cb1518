// ─────────────────────────────────────────────────────────────────────
// Stylus Kernel — Frozen Layers
// ─────────────────────────────────────────────────────────────────────
//! The four layer kinds a feature extractor may contain.
//!
//! Each layer has a forward pass and an input-gradient pass. Parameters are
//! frozen: `backward` returns ∂L/∂input only, never ∂L/∂weights.
//!
//! All layers expect NCHW input.

use serde::{Deserialize, Serialize};

use stylus_types::{StyleError, StyleResult};

use crate::tensor::{ensure_same_shape, Tensor};

#[inline]
fn idx4(c: usize, h: usize, w: usize, b: usize, ch: usize, y: usize, x: usize) -> usize {
    ((b * c + ch) * h + y) * w + x
}

/// Output length of a sliding window along one axis.
fn window_out(len: usize, kernel: usize, stride: usize, padding: usize) -> StyleResult<usize> {
    let padded = len + 2 * padding;
    if stride == 0 {
        return Err(StyleError::Shape("stride must be >= 1".to_string()));
    }
    if padded < kernel {
        return Err(StyleError::Shape(format!(
            "input extent {len} (+2×{padding} padding) is smaller than kernel {kernel}"
        )));
    }
    Ok((padded - kernel) / stride + 1)
}

// ── Convolution ──────────────────────────────────────────────────────

/// 2-D convolution with square kernel, zero padding and bias.
///
/// `weight` is `[out_channels, in_channels, kernel, kernel]` row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conv2d {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
    pub weight: Vec<f64>,
    pub bias: Vec<f64>,
}

impl Conv2d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        weight: Vec<f64>,
        bias: Vec<f64>,
    ) -> StyleResult<Self> {
        let conv = Self {
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
            weight,
            bias,
        };
        conv.validate()?;
        Ok(conv)
    }

    /// Check parameter lengths against the declared geometry.
    pub fn validate(&self) -> StyleResult<()> {
        let expected = self.out_channels * self.in_channels * self.kernel * self.kernel;
        if self.weight.len() != expected {
            return Err(StyleError::Shape(format!(
                "conv weight needs {expected} values, got {}",
                self.weight.len()
            )));
        }
        if self.bias.len() != self.out_channels {
            return Err(StyleError::Shape(format!(
                "conv bias needs {} values, got {}",
                self.out_channels,
                self.bias.len()
            )));
        }
        if self.kernel == 0 || self.stride == 0 {
            return Err(StyleError::Shape("conv kernel and stride must be >= 1".to_string()));
        }
        Ok(())
    }

    #[inline]
    fn w(&self, o: usize, i: usize, ky: usize, kx: usize) -> f64 {
        let k = self.kernel;
        self.weight[((o * self.in_channels + i) * k + ky) * k + kx]
    }

    fn check_input(&self, x: &Tensor) -> StyleResult<(usize, usize, usize, usize, usize)> {
        let (n, c, h, w) = x.dims4()?;
        if c != self.in_channels {
            return Err(StyleError::Shape(format!(
                "conv expects {} input channels, got {c}",
                self.in_channels
            )));
        }
        let oh = window_out(h, self.kernel, self.stride, self.padding)?;
        let ow = window_out(w, self.kernel, self.stride, self.padding)?;
        Ok((n, h, w, oh, ow))
    }

    pub fn forward(&self, x: &Tensor) -> StyleResult<Tensor> {
        let (n, h, w, oh, ow) = self.check_input(x)?;
        let (ci, co, k, s) = (self.in_channels, self.out_channels, self.kernel, self.stride);
        let p = self.padding as isize;
        let src = x.data();
        let mut out = vec![0.0; n * co * oh * ow];

        for b in 0..n {
            for o in 0..co {
                let bias = self.bias[o];
                for y in 0..oh {
                    for xx in 0..ow {
                        out[idx4(co, oh, ow, b, o, y, xx)] = bias;
                    }
                }
                for i in 0..ci {
                    for ky in 0..k {
                        for kx in 0..k {
                            let wv = self.w(o, i, ky, kx);
                            for y in 0..oh {
                                let iy = (y * s + ky) as isize - p;
                                if iy < 0 || iy >= h as isize {
                                    continue;
                                }
                                for xx in 0..ow {
                                    let ix = (xx * s + kx) as isize - p;
                                    if ix < 0 || ix >= w as isize {
                                        continue;
                                    }
                                    out[idx4(co, oh, ow, b, o, y, xx)] +=
                                        wv * src[idx4(ci, h, w, b, i, iy as usize, ix as usize)];
                                }
                            }
                        }
                    }
                }
            }
        }
        Tensor::new(vec![n, co, oh, ow], out)
    }

    /// ∂L/∂x given ∂L/∂y. Transposed convolution of `grad_out` with the kernel.
    pub fn backward(&self, x: &Tensor, grad_out: &Tensor) -> StyleResult<Tensor> {
        let (n, h, w, oh, ow) = self.check_input(x)?;
        let (ci, co, k, s) = (self.in_channels, self.out_channels, self.kernel, self.stride);
        if grad_out.shape() != [n, co, oh, ow] {
            return Err(StyleError::Shape(format!(
                "conv grad_out shape {:?} does not match output [{n}, {co}, {oh}, {ow}]",
                grad_out.shape()
            )));
        }
        let p = self.padding as isize;
        let g = grad_out.data();
        let mut dx = vec![0.0; x.numel()];

        for b in 0..n {
            for o in 0..co {
                for i in 0..ci {
                    for ky in 0..k {
                        for kx in 0..k {
                            let wv = self.w(o, i, ky, kx);
                            for y in 0..oh {
                                let iy = (y * s + ky) as isize - p;
                                if iy < 0 || iy >= h as isize {
                                    continue;
                                }
                                for xx in 0..ow {
                                    let ix = (xx * s + kx) as isize - p;
                                    if ix < 0 || ix >= w as isize {
                                        continue;
                                    }
                                    dx[idx4(ci, h, w, b, i, iy as usize, ix as usize)] +=
                                        wv * g[idx4(co, oh, ow, b, o, y, xx)];
                                }
                            }
                        }
                    }
                }
            }
        }
        x.with_data(dx)
    }
}

// ── Activation ───────────────────────────────────────────────────────

/// Rectified linear unit.
///
/// With `inplace` set, [`Relu::forward_inplace`] overwrites its input
/// buffer. Anything that keeps the pre-activation tensor around (loss
/// probes, the backward tape) must use the out-of-place variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Relu {
    pub inplace: bool,
}

impl Relu {
    pub fn out_of_place() -> Self {
        Self { inplace: false }
    }

    pub fn forward(&self, x: &Tensor) -> StyleResult<Tensor> {
        x.with_data(x.data().iter().map(|&v| v.max(0.0)).collect())
    }

    pub fn forward_inplace(&self, x: &mut Tensor) {
        for v in x.data_mut() {
            *v = v.max(0.0);
        }
    }

    pub fn backward(&self, x: &Tensor, grad_out: &Tensor) -> StyleResult<Tensor> {
        ensure_same_shape(x, grad_out, "relu backward")?;
        x.with_data(
            x.data()
                .iter()
                .zip(grad_out.data().iter())
                .map(|(&v, &g)| if v > 0.0 { g } else { 0.0 })
                .collect(),
        )
    }
}

// ── Spatial pooling ──────────────────────────────────────────────────

/// Max pooling over square windows, no padding, floor output size.
///
/// Ties resolve to the first maximum in row-major window order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaxPool2d {
    pub kernel: usize,
    pub stride: usize,
}

impl MaxPool2d {
    pub fn new(kernel: usize, stride: usize) -> Self {
        Self { kernel, stride }
    }

    fn geometry(&self, x: &Tensor) -> StyleResult<(usize, usize, usize, usize, usize, usize)> {
        let (n, c, h, w) = x.dims4()?;
        if self.kernel == 0 {
            return Err(StyleError::Shape("pool kernel must be >= 1".to_string()));
        }
        let oh = window_out(h, self.kernel, self.stride, 0)?;
        let ow = window_out(w, self.kernel, self.stride, 0)?;
        Ok((n, c, h, w, oh, ow))
    }

    /// Flat input index of the window maximum for output (b, ch, y, x).
    #[inline]
    fn argmax(
        &self,
        src: &[f64],
        dims: (usize, usize, usize),
        b: usize,
        ch: usize,
        y: usize,
        x: usize,
    ) -> usize {
        let (c, h, w) = dims;
        let mut best = idx4(c, h, w, b, ch, y * self.stride, x * self.stride);
        for ky in 0..self.kernel {
            for kx in 0..self.kernel {
                let i = idx4(c, h, w, b, ch, y * self.stride + ky, x * self.stride + kx);
                if src[i] > src[best] {
                    best = i;
                }
            }
        }
        best
    }

    pub fn forward(&self, x: &Tensor) -> StyleResult<Tensor> {
        let (n, c, h, w, oh, ow) = self.geometry(x)?;
        let src = x.data();
        let mut out = Vec::with_capacity(n * c * oh * ow);
        for b in 0..n {
            for ch in 0..c {
                for y in 0..oh {
                    for xx in 0..ow {
                        out.push(src[self.argmax(src, (c, h, w), b, ch, y, xx)]);
                    }
                }
            }
        }
        Tensor::new(vec![n, c, oh, ow], out)
    }

    pub fn backward(&self, x: &Tensor, grad_out: &Tensor) -> StyleResult<Tensor> {
        let (n, c, h, w, oh, ow) = self.geometry(x)?;
        if grad_out.shape() != [n, c, oh, ow] {
            return Err(StyleError::Shape(format!(
                "pool grad_out shape {:?} does not match output [{n}, {c}, {oh}, {ow}]",
                grad_out.shape()
            )));
        }
        let src = x.data();
        let g = grad_out.data();
        let mut dx = vec![0.0; x.numel()];
        for b in 0..n {
            for ch in 0..c {
                for y in 0..oh {
                    for xx in 0..ow {
                        let i = self.argmax(src, (c, h, w), b, ch, y, xx);
                        dx[i] += g[idx4(c, oh, ow, b, ch, y, xx)];
                    }
                }
            }
        }
        x.with_data(dx)
    }
}

// ── Batch normalization ──────────────────────────────────────────────

/// Inference-mode batch normalization: running statistics plus affine.
///
/// y = (x - running_mean) / sqrt(running_var + eps) · weight + bias
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchNorm2d {
    pub num_features: usize,
    pub running_mean: Vec<f64>,
    pub running_var: Vec<f64>,
    pub weight: Vec<f64>,
    pub bias: Vec<f64>,
    pub eps: f64,
}

impl BatchNorm2d {
    /// Identity-initialised layer (zero mean, unit variance, unit scale).
    pub fn identity(num_features: usize) -> Self {
        Self {
            num_features,
            running_mean: vec![0.0; num_features],
            running_var: vec![1.0; num_features],
            weight: vec![1.0; num_features],
            bias: vec![0.0; num_features],
            eps: 1e-5,
        }
    }

    pub fn validate(&self) -> StyleResult<()> {
        let n = self.num_features;
        for (name, v) in [
            ("running_mean", &self.running_mean),
            ("running_var", &self.running_var),
            ("weight", &self.weight),
            ("bias", &self.bias),
        ] {
            if v.len() != n {
                return Err(StyleError::Shape(format!(
                    "batchnorm {name} needs {n} values, got {}",
                    v.len()
                )));
            }
        }
        if self.running_var.iter().any(|&v| v + self.eps <= 0.0) {
            return Err(StyleError::Shape("batchnorm running_var + eps must be > 0".to_string()));
        }
        Ok(())
    }

    /// Per-channel multiplier and offset of the affine map.
    fn scale_shift(&self) -> Vec<(f64, f64)> {
        (0..self.num_features)
            .map(|c| {
                let scale = self.weight[c] / (self.running_var[c] + self.eps).sqrt();
                (scale, self.bias[c] - self.running_mean[c] * scale)
            })
            .collect()
    }

    fn check_input(&self, x: &Tensor) -> StyleResult<(usize, usize)> {
        let (_, c, h, w) = x.dims4()?;
        if c != self.num_features {
            return Err(StyleError::Shape(format!(
                "batchnorm expects {} channels, got {c}",
                self.num_features
            )));
        }
        Ok((c, h * w))
    }

    pub fn forward(&self, x: &Tensor) -> StyleResult<Tensor> {
        let (c, plane) = self.check_input(x)?;
        let ss = self.scale_shift();
        let data = x
            .data()
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                let (scale, shift) = ss[(i / plane) % c];
                v * scale + shift
            })
            .collect();
        x.with_data(data)
    }

    pub fn backward(&self, x: &Tensor, grad_out: &Tensor) -> StyleResult<Tensor> {
        let (c, plane) = self.check_input(x)?;
        ensure_same_shape(x, grad_out, "batchnorm backward")?;
        let ss = self.scale_shift();
        let data = grad_out
            .data()
            .iter()
            .enumerate()
            .map(|(i, &g)| g * ss[(i / plane) % c].0)
            .collect();
        x.with_data(data)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Central-difference check of `backward` against `forward`, using the
    /// scalar objective L = Σ r ⊙ forward(x) for a fixed weighting r.
    pub(crate) fn check_input_gradient<F, B>(x: &Tensor, forward: F, backward: B)
    where
        F: Fn(&Tensor) -> Tensor,
        B: Fn(&Tensor, &Tensor) -> Tensor,
    {
        let y = forward(x);
        let r: Vec<f64> = (0..y.numel()).map(|i| ((i as f64) * 0.37).sin()).collect();
        let r = y.with_data(r).unwrap();
        let objective = |t: &Tensor| -> f64 {
            forward(t)
                .data()
                .iter()
                .zip(r.data().iter())
                .map(|(a, b)| a * b)
                .sum()
        };
        let analytic = backward(x, &r);
        let eps = 1e-6;
        for i in 0..x.numel() {
            let mut plus = x.clone();
            plus.data_mut()[i] += eps;
            let mut minus = x.clone();
            minus.data_mut()[i] -= eps;
            let fd = (objective(&plus) - objective(&minus)) / (2.0 * eps);
            let a = analytic.data()[i];
            assert!(
                (a - fd).abs() < 1e-5 * (1.0 + fd.abs()),
                "gradient component {i}: analytic={a:.8}, fd={fd:.8}"
            );
        }
    }

    fn ramp(shape: Vec<usize>) -> Tensor {
        let n: usize = shape.iter().product();
        Tensor::new(shape, (0..n).map(|i| ((i as f64) * 0.71).sin()).collect()).unwrap()
    }

    #[test]
    fn test_conv_rejects_bad_params() {
        assert!(Conv2d::new(2, 3, 3, 1, 1, vec![0.0; 10], vec![0.0; 3]).is_err());
        assert!(Conv2d::new(2, 3, 3, 1, 1, vec![0.0; 54], vec![0.0; 2]).is_err());
    }

    #[test]
    fn test_conv_identity_kernel() {
        // 1×1 kernel with weight 1 and bias 0.5 copies the input plus 0.5.
        let conv = Conv2d::new(1, 1, 1, 1, 0, vec![1.0], vec![0.5]).unwrap();
        let x = ramp(vec![1, 1, 3, 3]);
        let y = conv.forward(&x).unwrap();
        assert_eq!(y.shape(), x.shape());
        for (a, b) in y.data().iter().zip(x.data().iter()) {
            assert!((a - (b + 0.5)).abs() < 1e-12);
        }
    }

    #[test]
    fn test_conv_same_padding_shape() {
        let conv = Conv2d::new(3, 4, 3, 1, 1, vec![0.1; 4 * 3 * 9], vec![0.0; 4]).unwrap();
        let y = conv.forward(&ramp(vec![1, 3, 5, 6])).unwrap();
        assert_eq!(y.shape(), &[1, 4, 5, 6]);
    }

    #[test]
    fn test_conv_box_sum() {
        // All-ones 3×3 kernel without padding sums each window.
        let conv = Conv2d::new(1, 1, 3, 1, 0, vec![1.0; 9], vec![0.0]).unwrap();
        let x = Tensor::full(vec![1, 1, 4, 4], 2.0);
        let y = conv.forward(&x).unwrap();
        assert_eq!(y.shape(), &[1, 1, 2, 2]);
        assert!(y.data().iter().all(|&v| (v - 18.0).abs() < 1e-12));
    }

    #[test]
    fn test_conv_wrong_channels() {
        let conv = Conv2d::new(3, 1, 1, 1, 0, vec![1.0; 3], vec![0.0]).unwrap();
        assert!(matches!(
            conv.forward(&ramp(vec![1, 2, 2, 2])),
            Err(StyleError::Shape(_))
        ));
    }

    #[test]
    fn test_conv_gradient() {
        let weight: Vec<f64> = (0..3 * 2 * 9).map(|i| ((i as f64) * 0.29).cos()).collect();
        let conv = Conv2d::new(2, 3, 3, 2, 1, weight, vec![0.1, -0.2, 0.3]).unwrap();
        let x = ramp(vec![1, 2, 5, 4]);
        check_input_gradient(
            &x,
            |t| conv.forward(t).unwrap(),
            |t, g| conv.backward(t, g).unwrap(),
        );
    }

    #[test]
    fn test_relu_variants_agree() {
        let x = ramp(vec![1, 2, 3, 3]);
        let relu = Relu { inplace: true };
        let out = relu.forward(&x).unwrap();
        let mut inplace = x.clone();
        relu.forward_inplace(&mut inplace);
        assert_eq!(out, inplace);
        assert!(out.data().iter().all(|&v| v >= 0.0));
        // The out-of-place call leaves its input untouched.
        assert!(x.data().iter().any(|&v| v < 0.0));
    }

    #[test]
    fn test_relu_gradient_masks_negatives() {
        let x = Tensor::new(vec![1, 1, 1, 3], vec![-1.0, 0.5, 2.0]).unwrap();
        let g = Tensor::full(vec![1, 1, 1, 3], 3.0);
        let dx = Relu::out_of_place().backward(&x, &g).unwrap();
        assert_eq!(dx.data(), &[0.0, 3.0, 3.0]);
    }

    #[test]
    fn test_maxpool_forward() {
        let x = Tensor::new(
            vec![1, 1, 2, 4],
            vec![1.0, 5.0, 2.0, 0.0, 3.0, 4.0, 7.0, 1.0],
        )
        .unwrap();
        let y = MaxPool2d::new(2, 2).forward(&x).unwrap();
        assert_eq!(y.shape(), &[1, 1, 1, 2]);
        assert_eq!(y.data(), &[5.0, 7.0]);
    }

    #[test]
    fn test_maxpool_backward_routes_to_argmax() {
        let x = Tensor::new(
            vec![1, 1, 2, 4],
            vec![1.0, 5.0, 2.0, 0.0, 3.0, 4.0, 7.0, 1.0],
        )
        .unwrap();
        let g = Tensor::new(vec![1, 1, 1, 2], vec![10.0, 20.0]).unwrap();
        let dx = MaxPool2d::new(2, 2).backward(&x, &g).unwrap();
        assert_eq!(dx.data(), &[0.0, 10.0, 0.0, 0.0, 0.0, 0.0, 20.0, 0.0]);
    }

    #[test]
    fn test_maxpool_floor_and_gradient() {
        let pool = MaxPool2d::new(2, 2);
        let x = ramp(vec![1, 2, 5, 5]);
        assert_eq!(pool.forward(&x).unwrap().shape(), &[1, 2, 2, 2]);
        check_input_gradient(
            &x,
            |t| pool.forward(t).unwrap(),
            |t, g| pool.backward(t, g).unwrap(),
        );
    }

    #[test]
    fn test_maxpool_too_small() {
        assert!(MaxPool2d::new(2, 2).forward(&ramp(vec![1, 1, 1, 4])).is_err());
    }

    #[test]
    fn test_batchnorm_identity() {
        let bn = BatchNorm2d {
            eps: 0.0,
            ..BatchNorm2d::identity(2)
        };
        let x = ramp(vec![1, 2, 2, 2]);
        assert_eq!(bn.forward(&x).unwrap(), x);
    }

    #[test]
    fn test_batchnorm_affine_and_gradient() {
        let bn = BatchNorm2d {
            num_features: 2,
            running_mean: vec![0.5, -1.0],
            running_var: vec![4.0, 0.25],
            weight: vec![2.0, 1.0],
            bias: vec![0.0, 1.0],
            eps: 0.0,
        };
        assert!(bn.validate().is_ok());
        let x = Tensor::new(vec![1, 2, 1, 1], vec![2.5, 0.0]).unwrap();
        let y = bn.forward(&x).unwrap();
        // (2.5 - 0.5) / 2 * 2 + 0 = 2 ; (0 + 1) / 0.5 * 1 + 1 = 3
        assert!((y.data()[0] - 2.0).abs() < 1e-12);
        assert!((y.data()[1] - 3.0).abs() < 1e-12);

        let x = ramp(vec![1, 2, 3, 2]);
        check_input_gradient(
            &x,
            |t| bn.forward(t).unwrap(),
            |t, g| bn.backward(t, g).unwrap(),
        );
    }

    #[test]
    fn test_batchnorm_validate_lengths() {
        let bn = BatchNorm2d {
            bias: vec![0.0],
            ..BatchNorm2d::identity(2)
        };
        assert!(bn.validate().is_err());
    }
}
