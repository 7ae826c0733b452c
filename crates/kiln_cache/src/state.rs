//! Per-module build state machine.

use std::fmt;

use kiln_common::{InternalError, KilnResult};
use serde::{Deserialize, Serialize};

/// Where a module is in its build.
///
/// `Pending → Classifying → Propagating → Recompiling → Succeeded`, and any
/// non-terminal state may go to `Failed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    /// Waiting for dependencies.
    Pending,
    /// Comparing units against the cache store.
    Classifying,
    /// Expanding dirtiness across references.
    Propagating,
    /// Compiling dirty units.
    Recompiling,
    /// Built and persisted.
    Succeeded,
    /// Failed, skipped or cancelled; nothing persisted.
    Failed,
}

impl ModuleState {
    /// Returns `true` for `Succeeded` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, ModuleState::Succeeded | ModuleState::Failed)
    }

    /// Moves to `next`, rejecting transitions the machine does not allow.
    pub fn transition(self, next: ModuleState) -> KilnResult<ModuleState> {
        use ModuleState::*;
        let allowed = matches!(
            (self, next),
            (Pending, Classifying)
                | (Classifying, Propagating)
                | (Propagating, Recompiling)
                | (Recompiling, Succeeded)
        ) || (next == Failed && !self.is_terminal());

        if allowed {
            Ok(next)
        } else {
            Err(InternalError::IllegalTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModuleState::Pending => "pending",
            ModuleState::Classifying => "classifying",
            ModuleState::Propagating => "propagating",
            ModuleState::Recompiling => "recompiling",
            ModuleState::Succeeded => "succeeded",
            ModuleState::Failed => "failed",
        };
        f.write_str(name)
    }
}
