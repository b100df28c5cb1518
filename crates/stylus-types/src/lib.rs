// ─────────────────────────────────────────────────────────────────────
// Stylus Kernel — Types
// (C) 1998-2026 Miroslav Sotek. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
#![deny(unsafe_code)]
//! Type definitions, configuration, and error hierarchy for the
//! Stylus style-transfer kernel.

pub mod config;
pub mod error;
pub mod history;

pub use config::{LbfgsConfig, LineSearch, LossWeights, TransferConfig};
pub use error::{StyleError, StyleResult};
pub use history::{LossHistory, SharedLossHistory};
