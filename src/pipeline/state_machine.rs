use anyhow::{bail, Result};
use std::fmt;
use std::sync::Mutex;
use tracing::{debug, warn};

use super::error::Stage;

/// Lifecycle of a single pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Received,
    Ingesting,
    Extracting,
    Validating,
    Building,
    Publishing,
    Done,
    Failed(Stage),
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Received => f.write_str("Received"),
            PipelineState::Ingesting => f.write_str("Ingesting"),
            PipelineState::Extracting => f.write_str("Extracting"),
            PipelineState::Validating => f.write_str("Validating"),
            PipelineState::Building => f.write_str("Building"),
            PipelineState::Publishing => f.write_str("Publishing"),
            PipelineState::Done => f.write_str("Done"),
            PipelineState::Failed(stage) => write!(f, "Failed({})", stage),
        }
    }
}

impl PipelineState {
    /// Stage the pipeline is working on while in this state
    pub fn stage(&self) -> Stage {
        match self {
            PipelineState::Received => Stage::Identity,
            PipelineState::Ingesting => Stage::Ingest,
            PipelineState::Extracting => Stage::Extract,
            PipelineState::Validating => Stage::Validate,
            PipelineState::Building => Stage::Build,
            PipelineState::Publishing | PipelineState::Done => Stage::Publish,
            PipelineState::Failed(stage) => *stage,
        }
    }
}

/// Check if a state is terminal (cleanup runs, no further transitions)
pub fn is_terminal(state: &PipelineState) -> bool {
    matches!(state, PipelineState::Done | PipelineState::Failed(_))
}

/// Check if a state transition is valid
pub fn is_valid_transition(from: &PipelineState, to: &PipelineState) -> bool {
    use PipelineState::*;

    match (from, to) {
        (from, _) if is_terminal(from) => false,

        // Strictly linear happy path
        (Received, Ingesting) => true,
        (Ingesting, Extracting) => true,
        (Extracting, Validating) => true,
        (Validating, Building) => true,
        (Building, Publishing) => true,
        (Publishing, Done) => true,

        // Any live state may fail
        (_, Failed(_)) => true,

        _ => false,
    }
}

/// Validate a state transition and return an error if invalid
pub fn validate_transition(from: &PipelineState, to: &PipelineState) -> Result<()> {
    if !is_valid_transition(from, to) {
        bail!(
            "Invalid pipeline state transition from '{}' to '{}'",
            from,
            to
        );
    }
    Ok(())
}

/// Current state of one run, shareable between the pipeline and its cancellation branch
#[derive(Debug)]
pub struct StateTracker {
    state: Mutex<PipelineState>,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self {
            state: Mutex::new(PipelineState::Received),
        }
    }
}

impl StateTracker {
    pub fn current(&self) -> PipelineState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to `to`; invalid transitions are logged and ignored
    pub fn advance(&self, to: PipelineState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match validate_transition(&state, &to) {
            Ok(()) => {
                debug!(from = %*state, to = %to, "Pipeline state transition");
                *state = to;
            }
            Err(e) => warn!("{}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PipelineState::*;

    #[test]
    fn test_terminal_states() {
        assert!(is_terminal(&Done));
        assert!(is_terminal(&Failed(Stage::Build)));

        assert!(!is_terminal(&Received));
        assert!(!is_terminal(&Publishing));
    }

    #[test]
    fn test_happy_path() {
        let path = [
            Received, Ingesting, Extracting, Validating, Building, Publishing, Done,
        ];
        for pair in path.windows(2) {
            assert!(
                is_valid_transition(&pair[0], &pair[1]),
                "{} -> {} should be valid",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_any_live_state_can_fail() {
        for state in [Received, Ingesting, Extracting, Validating, Building, Publishing] {
            assert!(is_valid_transition(&state, &Failed(state.stage())));
        }
    }

    #[test]
    fn test_terminal_states_no_transitions() {
        assert!(!is_valid_transition(&Done, &Failed(Stage::Publish)));
        assert!(!is_valid_transition(&Failed(Stage::Ingest), &Ingesting));
        assert!(!is_valid_transition(&Failed(Stage::Build), &Done));
    }

    #[test]
    fn test_invalid_transitions() {
        // Cannot skip stages
        assert!(!is_valid_transition(&Received, &Building));
        assert!(!is_valid_transition(&Extracting, &Publishing));
        assert!(!is_valid_transition(&Validating, &Done));

        // Cannot go back
        assert!(!is_valid_transition(&Building, &Extracting));
        assert!(validate_transition(&Publishing, &Ingesting).is_err());
    }

    #[test]
    fn test_tracker_ignores_invalid_transition() {
        let tracker = StateTracker::default();
        tracker.advance(Ingesting);
        tracker.advance(Done);
        assert_eq!(tracker.current(), Ingesting);

        tracker.advance(Failed(Stage::Ingest));
        tracker.advance(Extracting);
        assert_eq!(tracker.current(), Failed(Stage::Ingest));
    }
}
