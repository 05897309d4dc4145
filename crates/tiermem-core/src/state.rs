//! Agent loop state, used only as a policy selector by paging operations.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::MemoryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Thinking,
    Executing,
    Evaluating,
    Paging,
}

impl AgentState {
    pub const ALL: [AgentState; 4] = [
        AgentState::Thinking,
        AgentState::Executing,
        AgentState::Evaluating,
        AgentState::Paging,
    ];

    /// Upper-case label used in rendered prompts.
    pub fn label(self) -> &'static str {
        match self {
            Self::Thinking => "THINKING",
            Self::Executing => "EXECUTING",
            Self::Evaluating => "EVALUATING",
            Self::Paging => "PAGING",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Thinking => "Analyzing situation and planning actions",
            Self::Executing => "Executing planned actions and tasks",
            Self::Evaluating => "Evaluating results and outcomes",
            Self::Paging => "Managing memory context and paging",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thinking => write!(f, "thinking"),
            Self::Executing => write!(f, "executing"),
            Self::Evaluating => write!(f, "evaluating"),
            Self::Paging => write!(f, "paging"),
        }
    }
}

impl FromStr for AgentState {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.to_string().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| MemoryError::invalid(format!("unknown agent state: {s}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("Paging".parse::<AgentState>().unwrap(), AgentState::Paging);
        assert_eq!(" thinking ".parse::<AgentState>().unwrap(), AgentState::Thinking);
        assert!("sleeping".parse::<AgentState>().is_err());
    }
}
