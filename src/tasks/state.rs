use std::collections::HashMap;

use super::types::RunStatus;

pub fn valid_state_transition(src: &RunStatus, dst: &RunStatus) -> bool {
    let state_transition_map: HashMap<RunStatus, Vec<RunStatus>> = {
        let mut map = HashMap::new();
        map.insert(
            RunStatus::Created,
            vec![
                RunStatus::SnapshotReset,
                RunStatus::Initializing,
                RunStatus::TornDown,
            ],
        );
        map.insert(
            RunStatus::SnapshotReset,
            vec![RunStatus::Initializing, RunStatus::TornDown],
        );
        map.insert(
            RunStatus::Initializing,
            vec![RunStatus::ReadyForAgent, RunStatus::TornDown],
        );
        map.insert(
            RunStatus::ReadyForAgent,
            vec![RunStatus::Evaluating, RunStatus::TornDown],
        );
        map.insert(
            RunStatus::Evaluating,
            vec![RunStatus::Evaluating, RunStatus::TornDown],
        );
        map.insert(RunStatus::TornDown, vec![]);
        map
    };

    if let Some(valid_states) = state_transition_map.get(src) {
        valid_states.contains(dst)
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluation_requires_completed_initialization() {
        assert!(!valid_state_transition(&RunStatus::Created, &RunStatus::Evaluating));
        assert!(!valid_state_transition(&RunStatus::SnapshotReset, &RunStatus::Evaluating));
        assert!(!valid_state_transition(&RunStatus::Initializing, &RunStatus::Evaluating));
        assert!(valid_state_transition(&RunStatus::ReadyForAgent, &RunStatus::Evaluating));
    }

    #[test]
    fn evaluation_may_repeat_and_every_live_state_can_tear_down() {
        assert!(valid_state_transition(&RunStatus::Evaluating, &RunStatus::Evaluating));
        for status in [
            RunStatus::Created,
            RunStatus::SnapshotReset,
            RunStatus::Initializing,
            RunStatus::ReadyForAgent,
            RunStatus::Evaluating,
        ] {
            assert!(valid_state_transition(&status, &RunStatus::TornDown));
        }
    }

    #[test]
    fn torn_down_is_terminal() {
        assert!(!valid_state_transition(&RunStatus::TornDown, &RunStatus::Created));
        assert!(!valid_state_transition(&RunStatus::TornDown, &RunStatus::TornDown));
    }
}
