// ─────────────────────────────────────────────────────────────────────
// Stylus Kernel — Loss History Telemetry
// ─────────────────────────────────────────────────────────────────────
//! Per-evaluation record of weighted style and content loss.
//!
//! The two sequences are parallel: every `record` call appends exactly
//! one value to each, so their lengths are always equal.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{StyleError, StyleResult};

/// Weighted style and content loss, one entry per closure evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LossHistory {
    pub style: Vec<f64>,
    pub content: Vec<f64>,
}

impl LossHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, style: f64, content: f64) {
        self.style.push(style);
        self.content.push(content);
    }

    pub fn len(&self) -> usize {
        self.style.len()
    }

    pub fn is_empty(&self) -> bool {
        self.style.is_empty()
    }

    /// Most recent `(style, content)` pair.
    pub fn last(&self) -> Option<(f64, f64)> {
        Some((*self.style.last()?, *self.content.last()?))
    }

    /// Serialize as `{"style": [...], "content": [...]}`.
    pub fn to_json(&self) -> StyleResult<String> {
        serde_json::to_string(self)
            .map_err(|e| StyleError::Config(format!("JSON encode error: {e}")))
    }
}

/// Cloneable handle to a history that another owner may read while a run
/// is still writing to it.
#[derive(Debug, Clone, Default)]
pub struct SharedLossHistory {
    inner: Arc<Mutex<LossHistory>>,
}

impl SharedLossHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, style: f64, content: f64) {
        self.inner.lock().record(style, content);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn last(&self) -> Option<(f64, f64)> {
        self.inner.lock().last()
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> LossHistory {
        self.inner.lock().clone()
    }

    pub fn clear(&self) {
        let mut h = self.inner.lock();
        h.style.clear();
        h.content.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_keeps_sequences_parallel() {
        let mut h = LossHistory::new();
        assert!(h.is_empty());
        assert_eq!(h.last(), None);
        h.record(3.0, 1.0);
        h.record(2.0, 0.5);
        assert_eq!(h.len(), 2);
        assert_eq!(h.style.len(), h.content.len());
        assert_eq!(h.last(), Some((2.0, 0.5)));
    }

    #[test]
    fn test_to_json() {
        let mut h = LossHistory::new();
        h.record(1.5, 0.25);
        let json = h.to_json().unwrap();
        assert_eq!(json, r#"{"style":[1.5],"content":[0.25]}"#);
        let back: LossHistory = serde_json::from_str(&json).unwrap();
        assert_eq!(back, h);
    }

    #[test]
    fn test_shared_handle_sees_writes() {
        let writer = SharedLossHistory::new();
        let reader = writer.clone();
        writer.record(4.0, 2.0);
        assert_eq!(reader.len(), 1);
        assert_eq!(reader.last(), Some((4.0, 2.0)));

        let snap = reader.snapshot();
        writer.record(1.0, 1.0);
        assert_eq!(snap.len(), 1);
        assert_eq!(reader.len(), 2);

        reader.clear();
        assert!(writer.is_empty());
    }

    #[test]
    fn test_shared_across_threads() {
        let shared = SharedLossHistory::new();
        let handle = {
            let shared = shared.clone();
            std::thread::spawn(move || {
                for i in 0..10 {
                    shared.record(i as f64, 0.0);
                }
            })
        };
        handle.join().unwrap();
        assert_eq!(shared.len(), 10);
    }
}
