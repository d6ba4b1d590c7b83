//! Reconciliation policy for idle entities.

use std::fmt;

use crate::{runnable::Discovered, state::EntityState};

/// What the poller does with an idle entity this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Run the current implementation.
    StartCurrent,
    /// Keep serving from the origin the entity already fell back to.
    RestartOrigin,
    /// Reset both counters and switch to the origin.
    FallbackToOrigin,
    /// No fallback left; wait for an operator to clear the placeholder.
    ParkDummy,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::StartCurrent => "start-current",
            Decision::RestartOrigin => "restart-origin",
            Decision::FallbackToOrigin => "fallback-to-origin",
            Decision::ParkDummy => "park-dummy",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First matching rule wins. `state` must carry the timestamps observed by
/// the previous reconciliation, `discovered` is this poll's snapshot.
pub fn decide(state: &EntityState, discovered: &Discovered) -> Decision {
    let script_changed = discovered.current().modified != state.observed_current;
    let origin_finished = state.is_running_origin() && state.exit_code == Some(0);
    if script_changed || origin_finished {
        return Decision::StartCurrent;
    }
    if state.is_running_origin() {
        return match discovered.origin() {
            Some(_) => Decision::RestartOrigin,
            None => Decision::StartCurrent,
        };
    }
    match state.exit_code {
        None | Some(0) => Decision::StartCurrent,
        Some(_) if discovered.origin().is_some() => Decision::FallbackToOrigin,
        Some(_) => Decision::ParkDummy,
    }
}
