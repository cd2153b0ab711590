//! Shared blackboard passed between graph nodes.

use serde::{Deserialize, Serialize};

use crate::decision::Decision;
use crate::message::Message;
use crate::session::Framework;

/// Workflow stage of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Requirement,
    Design,
    Development,
    Testing,
    Completed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Requirement => "requirement",
            Stage::Design => "design",
            Stage::Development => "development",
            Stage::Testing => "testing",
            Stage::Completed => "completed",
        }
    }
}

/// Per-role document slots filled as the team progresses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Documents {
    pub requirements: Option<String>,
    pub prd: Option<String>,
    pub design: Option<String>,
    pub tasks: Option<String>,
    pub test_report: Option<String>,
}

/// State shared across one graph execution; discarded on `finish`.
#[derive(Debug, Clone)]
pub struct TeamState {
    /// Running message list, append-only within one run.
    pub messages: Vec<Message>,
    pub stage: Stage,
    pub framework: Framework,
    pub workspace_id: String,
    pub documents: Documents,
    /// Total node transitions taken so far.
    pub iterations: u32,
    pub last_decision: Option<Decision>,
    /// Instruction the previous node left for the next one.
    pub next_instruction: Option<String>,
}

impl TeamState {
    pub fn new(workspace_id: impl Into<String>, framework: Framework) -> Self {
        Self {
            messages: Vec::new(),
            stage: Stage::Requirement,
            framework,
            workspace_id: workspace_id.into(),
            documents: Documents::default(),
            iterations: 0,
            last_decision: None,
            next_instruction: None,
        }
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.messages = history;
        self
    }

    /// Take the pending instruction, leaving the slot empty.
    pub fn take_instruction(&mut self) -> Option<String> {
        self.next_instruction.take()
    }
}
