// ─────────────────────────────────────────────────────────────────────
// Stylus Kernel — Network Substrate
// (C) 1998-2026 Miroslav Sotek. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
#![deny(unsafe_code)]
//! Dense NCHW tensors, the frozen layer kinds of a pretrained
//! convolutional feature extractor, input normalization, and Gram
//! texture statistics.
//!
//! Every differentiable operation exposes `forward` and an input-gradient
//! `backward`. Nothing here updates parameters.

pub mod extractor;
pub mod gram;
pub mod layers;
pub mod normalization;
pub mod tensor;

pub use extractor::{ExtractorLayer, FeatureExtractor, LayerKind};
pub use gram::{gram_backward, gram_matrix};
pub use layers::{BatchNorm2d, Conv2d, MaxPool2d, Relu};
pub use normalization::Normalization;
pub use tensor::{clamp_slice, mse, mse_grad, slice_min_max, Tensor};
