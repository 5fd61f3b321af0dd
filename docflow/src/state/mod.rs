//! Lifecycle state machines.
//!
//! Each persisted entity (document, job, stage execution, tenant) carries a
//! current state and a static transition table. [`check_transition`] is the
//! single gate every entity goes through before mutating its state, so a
//! rejected transition never leaves partial side effects behind.

mod document;
mod execution;
mod job;

pub use document::{Document, DocumentState, HistoryEntry, NewDocument};
pub use execution::{ResourceUsage, StageExecution, StageExecutionState};
pub use job::{Job, JobErrorEntry, JobState};

use crate::errors::TransitionError;
use std::fmt::{Debug, Display};

/// A finite set of states with a fixed transition table.
pub trait Lifecycle: Copy + Eq + Debug + Display + Send + Sync + 'static {
    /// Name of the entity, used in error messages.
    const ENTITY: &'static str;

    /// Every state, in declaration order.
    fn all() -> &'static [Self];

    /// States reachable from `self` in one step.
    fn allowed_transitions(self) -> &'static [Self];

    /// Returns true if no transition leaves this state.
    fn is_terminal(self) -> bool {
        self.allowed_transitions().is_empty()
    }

    /// Returns true if `to` is in the transition table for `self`.
    fn can_transition_to(self, to: Self) -> bool {
        self.allowed_transitions().contains(&to)
    }
}

/// Checks a transition against the table.
///
/// # Errors
///
/// Returns [`TransitionError`] if `to` is not reachable from `from`.
pub fn check_transition<S: Lifecycle>(from: S, to: S) -> Result<(), TransitionError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(TransitionError::new(S::ENTITY, from, to))
    }
}

/// Every `(from, to)` pair, split into legal and illegal ones.
///
/// Used by tests that sweep the whole table.
#[must_use]
pub fn transition_pairs<S: Lifecycle>() -> (Vec<(S, S)>, Vec<(S, S)>) {
    let mut legal = Vec::new();
    let mut illegal = Vec::new();
    for &from in S::all() {
        for &to in S::all() {
            if from.can_transition_to(to) {
                legal.push((from, to));
            } else {
                illegal.push((from, to));
            }
        }
    }
    (legal, illegal)
}
