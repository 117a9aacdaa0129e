//! Remote candidate buffering
//!
//! Candidates that arrive before the remote description is applied wait
//! here and are replayed in arrival order exactly once.

use std::collections::VecDeque;

/// One remote ICE candidate as signaled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedCandidate {
    pub candidate: String,
    pub mid: Option<String>,
}

#[derive(Debug, Default)]
pub struct CandidateQueue {
    items: VecDeque<QueuedCandidate>,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, candidate: impl Into<String>, mid: Option<String>) {
        self.items.push_back(QueuedCandidate {
            candidate: candidate.into(),
            mid,
        });
    }

    /// Empties the queue, oldest first
    pub fn drain(&mut self) -> Vec<QueuedCandidate> {
        self.items.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
