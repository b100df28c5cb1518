// ─────────────────────────────────────────────────────────────────────
// Stylus Kernel — Style Transfer Engine
// (C) 1998-2026 Miroslav Sotek. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
#![deny(unsafe_code)]
//! Neural style transfer by pixel-space optimization.
//!
//! Architecture:
//!   - Probes: content (raw MSE) and style (Gram MSE) loss observers
//!   - Pipeline: normalization + extractor layers + probes, with a
//!     forward tape and reverse-mode input gradient
//!   - Builder: canonical naming, out-of-place activations, probe
//!     insertion, truncation after the deepest probe
//!   - Lbfgs: limited-memory quasi-Newton optimizer with line search
//!   - StyleTransfer: clamped optimization loop with loss history

pub mod builder;
pub mod engine;
pub mod lbfgs;
pub mod pipeline;
pub mod probe;

pub use builder::{build_style_model, check_image_pair, CanonicalNamer, ProbePlan};
pub use engine::{
    evaluate, initial_image, should_report, LossTerms, PixelRange, RunState, StyleTransfer,
    TransferOutput,
};
pub use lbfgs::{Evaluation, Lbfgs, StepReport};
pub use pipeline::{ForwardPass, Pipeline, Stage, StageOp, StyleModel};
pub use probe::{ContentProbe, LossProbe, StyleProbe};
