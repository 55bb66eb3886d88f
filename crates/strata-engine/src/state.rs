//! Per-node execution state machine
//!
//! `Pending -> Blocked -> Ready -> Running -> Done`. Every transition goes
//! through [`NodeStates`], which checks the expected current state under a
//! lock, so a node can be claimed for running exactly once.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::result::RunStatus;

/// Why a node was not executed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// A provider ended in error or fail
    UpstreamFailed { upstream: String },

    /// Dispatch stopped after the first failure
    FailFast,

    /// The run was interrupted
    Interrupted,

    /// The invocation timeout expired
    TimedOut,

    /// Dispatch ended without reaching the node
    NotDispatched,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UpstreamFailed { upstream } => write!(f, "Skipped because upstream {} failed", upstream),
            Self::FailFast => write!(f, "Skipped due to fail-fast"),
            Self::Interrupted => write!(f, "Skipped because the run was interrupted"),
            Self::TimedOut => write!(f, "Skipped because the invocation timed out"),
            Self::NotDispatched => write!(f, "Skipped because it was never dispatched"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Not yet evaluated
    Pending,
    /// Waiting for providers
    Blocked,
    Ready,
    Running,
    Done(RunStatus),
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{node_id}: expected {expected:?}, found {found:?}")]
pub struct TransitionError {
    pub node_id: String,
    pub expected: NodeState,
    pub found: NodeState,
}

/// Guarded state of every node in a run
#[derive(Debug, Default)]
pub struct NodeStates {
    inner: Mutex<HashMap<String, NodeState>>,
}

impl NodeStates {
    pub fn new<I: IntoIterator<Item = String>>(ids: I) -> Self {
        Self {
            inner: Mutex::new(ids.into_iter().map(|id| (id, NodeState::Pending)).collect()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, NodeState>> {
        // A panic while holding the lock cannot leave a half-written state
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, node_id: &str) -> Option<NodeState> {
        self.lock().get(node_id).copied()
    }

    /// Move `node_id` from `expected` to `next`
    pub fn transition(&self, node_id: &str, expected: NodeState, next: NodeState) -> Result<(), TransitionError> {
        let mut states = self.lock();
        let found = states.get(node_id).copied().unwrap_or(NodeState::Pending);

        if found != expected {
            return Err(TransitionError {
                node_id: node_id.to_string(),
                expected,
                found,
            });
        }

        states.insert(node_id.to_string(), next);
        Ok(())
    }

    /// Finish a node that has not started; returns false if it already
    /// reached a terminal state or is running
    pub fn finish_unstarted(&self, node_id: &str, status: RunStatus) -> bool {
        let mut states = self.lock();
        match states.get(node_id) {
            Some(NodeState::Pending | NodeState::Blocked | NodeState::Ready) => {
                states.insert(node_id.to_string(), NodeState::Done(status));
                true
            }
            _ => false,
        }
    }

    /// Ids of nodes not yet in a terminal state
    pub fn unfinished(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|(_, state)| !state.is_terminal())
            .map(|(id, _)| id.clone())
            .collect()
    }
}
