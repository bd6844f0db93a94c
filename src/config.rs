use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::transition::{StateTransition, DEFAULT_STATE_TRANSITIONS};

/// Configuration for `State::update`
///
/// Sets the iteration budget, an optional wall-clock budget, the checkpoint
/// interval for diagnostics, and the kernel schedule. The update stops at
/// whichever budget trips first; the wall clock is checked between kernel
/// applications, so a kernel in flight always completes.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StateUpdateConfig {
    /// Maximum number of iterations to run.
    pub n_iters: usize,
    /// Timeout in seconds.
    pub timeout: Option<u64>,
    /// Record diagnostics every `checkpoint` iterations.
    pub checkpoint: Option<usize>,
    /// Which transitions to run
    pub transitions: Vec<StateTransition>,
}

impl StateUpdateConfig {
    pub fn new() -> Self {
        StateUpdateConfig {
            n_iters: 1,
            timeout: None,
            checkpoint: None,
            transitions: DEFAULT_STATE_TRANSITIONS.into(),
        }
    }

    pub fn with_iters(n_iters: usize) -> Self {
        StateUpdateConfig {
            n_iters,
            ..Self::new()
        }
    }

    // Check whether we've exceeded the allotted number of iterations
    pub fn check_over_iters(&self, iter: usize) -> bool {
        iter >= self.n_iters
    }

    // Check whether we've exceeded the allotted wall-clock budget
    pub fn check_over_time(&self, started: Instant) -> bool {
        self.timeout
            .map_or(false, |secs| started.elapsed().as_secs() >= secs)
    }

    pub fn checkpoint_due(&self, iter: usize) -> bool {
        self.checkpoint
            .map_or(false, |every| every > 0 && (iter + 1) % every == 0)
    }
}

impl Default for StateUpdateConfig {
    fn default() -> Self {
        StateUpdateConfig::new()
    }
}
