use serde::{Deserialize, Serialize};

/// Structured next-action choice a node hands to the orchestrator.
///
/// Recorded either through the `workflow_decision` tool (preferred) or an
/// embedded `[WORKFLOW_DECISION]{…}[/WORKFLOW_DECISION]` text marker (legacy
/// fallback).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub next_action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Concrete task for the next node; overrides its default prompt on
    /// backtracks and loops.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction_for_next: Option<String>,
}

impl Decision {
    pub fn new(next_action: impl Into<String>) -> Self {
        Self {
            next_action: next_action.into(),
            reason: None,
            instruction_for_next: None,
        }
    }

    /// Normalise empty instruction strings away.
    pub fn normalised(mut self) -> Self {
        if self
            .instruction_for_next
            .as_deref()
            .is_some_and(|s| s.trim().is_empty())
        {
            self.instruction_for_next = None;
        }
        self
    }
}
