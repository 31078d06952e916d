//! Operator control enable map

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::session::CoordinatorState;

/// Operator-facing controls
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Control {
    /// Operator name, batch number and batch info fields
    SessionFields,
    NewSession,
    FinishSession,
    SelectMethod,
    FunctionList,
    StartFullCycle,
    StartCommand,
    DutSelection,
}

impl Control {
    pub const ALL: [Control; 8] = [
        Control::SessionFields,
        Control::NewSession,
        Control::FinishSession,
        Control::SelectMethod,
        Control::FunctionList,
        Control::StartFullCycle,
        Control::StartCommand,
        Control::DutSelection,
    ];
}

impl std::fmt::Display for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Control::SessionFields => "session fields",
            Control::NewSession => "new session",
            Control::FinishSession => "finish session",
            Control::SelectMethod => "select method",
            Control::FunctionList => "function list",
            Control::StartFullCycle => "start full cycle",
            Control::StartCommand => "start command",
            Control::DutSelection => "DUT selection",
        };
        write!(f, "{}", name)
    }
}

/// Which controls are enabled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Controls(BTreeMap<Control, bool>);

impl Controls {
    /// Enable map for a coordinator state; `busy` disables everything
    pub fn for_state(state: CoordinatorState, busy: bool) -> Self {
        let enabled = |control: Control| -> bool {
            if busy {
                return false;
            }
            match state {
                CoordinatorState::Idle => {
                    matches!(control, Control::SessionFields | Control::NewSession)
                }
                CoordinatorState::SessionActive => {
                    !matches!(control, Control::SessionFields | Control::NewSession)
                }
                CoordinatorState::Testing => false,
            }
        };

        Self(Control::ALL.iter().map(|c| (*c, enabled(*c))).collect())
    }

    pub fn is_enabled(&self, control: Control) -> bool {
        self.0.get(&control).copied().unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Control, bool)> + '_ {
        self.0.iter().map(|(c, e)| (*c, *e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_only_allows_new_session() {
        let controls = Controls::for_state(CoordinatorState::Idle, false);
        assert!(controls.is_enabled(Control::NewSession));
        assert!(controls.is_enabled(Control::SessionFields));
        assert!(!controls.is_enabled(Control::StartFullCycle));
        assert!(!controls.is_enabled(Control::FinishSession));
    }

    #[test]
    fn test_session_active_locks_session_fields() {
        let controls = Controls::for_state(CoordinatorState::SessionActive, false);
        assert!(!controls.is_enabled(Control::NewSession));
        assert!(!controls.is_enabled(Control::SessionFields));
        assert!(controls.is_enabled(Control::StartFullCycle));
        assert!(controls.is_enabled(Control::DutSelection));
    }

    #[test]
    fn test_testing_or_busy_disables_everything() {
        for controls in [
            Controls::for_state(CoordinatorState::Testing, false),
            Controls::for_state(CoordinatorState::SessionActive, true),
            Controls::for_state(CoordinatorState::Idle, true),
        ] {
            assert!(controls.iter().all(|(_, enabled)| !enabled));
        }
    }
}
