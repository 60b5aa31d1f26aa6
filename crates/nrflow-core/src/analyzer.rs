//! Analyzer seam between the transport and protocol decoding.
//!
//! A worker hands every dequeued block to its analyzer and records the
//! result; the transport never interprets payload bytes itself.

use thiserror::Error;

use crate::pool::BlockView;
use crate::stats::CLASS_COUNT;

/// Protocol class reported by an analyzer (`0..CLASS_COUNT`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Classification(pub u8);

impl Classification {
    /// Class index clamped into the statistics range
    #[must_use]
    pub fn index(self) -> usize {
        (self.0 as usize).min(CLASS_COUNT - 1)
    }
}

/// Analyzer failure for a single message
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// Payload could not be parsed
    #[error("malformed message: {0}")]
    Malformed(&'static str),

    /// Any other analyzer-specific failure
    #[error("{0}")]
    Other(String),
}

/// Result of analyzing one block
pub type AnalysisResult = Result<Classification, AnalysisError>;

/// Per-message analysis run inside a worker
///
/// One analyzer instance belongs to one worker, so implementations may keep
/// mutable per-worker state without synchronization.
pub trait Analyzer: Send {
    /// Analyze one message
    fn analyze(&mut self, block: BlockView<'_>) -> AnalysisResult;
}

impl<F> Analyzer for F
where
    F: FnMut(BlockView<'_>) -> AnalysisResult + Send,
{
    fn analyze(&mut self, block: BlockView<'_>) -> AnalysisResult {
        self(block)
    }
}

/// Analyzer that classifies every message as class 0
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAnalyzer;

impl Analyzer for NullAnalyzer {
    fn analyze(&mut self, _block: BlockView<'_>) -> AnalysisResult {
        Ok(Classification(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(data: &[u8]) -> BlockView<'_> {
        BlockView {
            index: 0,
            ring: 0,
            seq: 1,
            enqueued_at_ns: 0,
            data,
        }
    }

    #[test]
    fn test_closure_analyzer() {
        let mut by_length = |block: BlockView<'_>| -> AnalysisResult {
            if block.is_empty() {
                Err(AnalysisError::Malformed("empty"))
            } else {
                Ok(Classification((block.len() % 3) as u8))
            }
        };
        assert_eq!(by_length.analyze(view(b"abcd")).unwrap(), Classification(1));
        assert!(by_length.analyze(view(b"")).is_err());
    }

    #[test]
    fn test_classification_index_clamped() {
        assert_eq!(Classification(3).index(), 3);
        assert_eq!(Classification(250).index(), CLASS_COUNT - 1);
    }

    #[test]
    fn test_null_analyzer() {
        assert_eq!(NullAnalyzer.analyze(view(b"x")).unwrap(), Classification(0));
    }
}
