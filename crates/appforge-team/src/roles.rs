//! Role definitions: prompts, models, tool subsets, stage mapping.

use appforge_agent_loop::AgentDefinition;
use appforge_contract::{Framework, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeName {
    Boss,
    ProductManager,
    Architect,
    ProjectManager,
    Engineer,
    Qa,
}

pub const ALL_NODES: [NodeName; 6] = [
    NodeName::Boss,
    NodeName::ProductManager,
    NodeName::Architect,
    NodeName::ProjectManager,
    NodeName::Engineer,
    NodeName::Qa,
];

impl NodeName {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeName::Boss => "boss",
            NodeName::ProductManager => "product_manager",
            NodeName::Architect => "architect",
            NodeName::ProjectManager => "project_manager",
            NodeName::Engineer => "engineer",
            NodeName::Qa => "qa",
        }
    }
}

impl std::fmt::Display for NodeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage the team enters when this node runs, if the node owns one.
pub fn node_stage(node: NodeName) -> Option<Stage> {
    match node {
        NodeName::Boss => Some(Stage::Requirement),
        NodeName::ProductManager => Some(Stage::Design),
        NodeName::Engineer => Some(Stage::Development),
        NodeName::Qa => Some(Stage::Testing),
        NodeName::Architect | NodeName::ProjectManager => None,
    }
}

const DECISION_GUIDE: &str = "\nWhen you are done, call the workflow_decision tool exactly once: \
next_action=\"continue\" to hand off to the next role, \"end\" if the request is unclear and \
needs the user, or a back_to_* action when an earlier document must be fixed (always pass \
instruction_for_next describing what to change).";

fn boss_prompt() -> String {
    format!(
        "You are the Boss of a web application team. Distil the user's request into clear, \
         testable requirements and write them to requirements.md in the workspace. Keep scope \
         minimal and unambiguous; list what is in and out of scope.{DECISION_GUIDE}"
    )
}

fn pm_prompt() -> String {
    format!(
        "You are the Product Manager. Read requirements.md and author a detailed PRD in prd.md: \
         user stories, page-level behaviour, data shown on each screen, and acceptance criteria. \
         If requirements.md is missing information you need, back-track to the Boss.{DECISION_GUIDE}"
    )
}

fn architect_prompt() -> String {
    format!(
        "You are the Architect. Read prd.md and design the technical solution in design.md: \
         module layout, data model, API routes, and the choices the Engineer must follow for the \
         target framework. Stay within the framework's conventions.{DECISION_GUIDE}"
    )
}

fn pjm_prompt() -> String {
    format!(
        "You are the Project Manager. Read prd.md and design.md and break the work into small, \
         ordered, independently verifiable tasks in tasks.md. Each task names the files it \
         touches and its done-criteria.{DECISION_GUIDE}"
    )
}

fn engineer_prompt() -> String {
    format!(
        "You are the Engineer. Implement the tasks from tasks.md following design.md, one task \
         at a time. Write code with the workspace tools, run checks with exec_command, and manage \
         the app with the dev_server tools. Use next_action=\"continue_development\" while tasks \
         remain, and hand off to QA when the implementation is complete.{DECISION_GUIDE}"
    )
}

fn qa_prompt() -> String {
    format!(
        "You are QA. Write and run tests against the implementation, observe the dev server, and \
         record findings in test_report.md. If tests fail, back-track to the Engineer with a \
         summary of the failures and suggested fixes.{DECISION_GUIDE}"
    )
}

const WORKSPACE_TOOLS: &[&str] = &["read_file", "write_file", "list_files", "make_dir"];

fn tool_subset(node: NodeName) -> Vec<String> {
    let extra: &[&str] = match node {
        NodeName::Boss | NodeName::ProductManager | NodeName::ProjectManager => &[],
        NodeName::Architect => &["grep_files"],
        NodeName::Engineer => &[
            "delete_file",
            "grep_files",
            "exec_command",
            "dev_server_start",
            "dev_server_status",
            "dev_server_stop",
        ],
        NodeName::Qa => &["grep_files", "exec_command", "dev_server_status"],
    };
    WORKSPACE_TOOLS
        .iter()
        .chain(extra)
        .chain(["workflow_decision"].iter())
        .map(|s| s.to_string())
        .collect()
}

/// Build the agent bound to a node.
pub fn agent_for(node: NodeName, model: &str) -> AgentDefinition {
    let prompt = match node {
        NodeName::Boss => boss_prompt(),
        NodeName::ProductManager => pm_prompt(),
        NodeName::Architect => architect_prompt(),
        NodeName::ProjectManager => pjm_prompt(),
        NodeName::Engineer => engineer_prompt(),
        NodeName::Qa => qa_prompt(),
    };
    AgentDefinition::new(node.as_str(), prompt, model).with_tools(tool_subset(node))
}

/// Default task prompt used when the previous node left no instruction.
pub fn default_task_prompt(node: NodeName, framework: Framework) -> String {
    match node {
        NodeName::Boss => format!(
            "Analyse the user's request and create requirements.md. Target framework: {}.",
            framework.as_str()
        ),
        NodeName::ProductManager => {
            "Read requirements.md and write a detailed PRD to prd.md.".to_string()
        }
        NodeName::Architect => format!(
            "Read prd.md and design the technical architecture in design.md. Target framework: {}.",
            framework.as_str()
        ),
        NodeName::ProjectManager => {
            "Read prd.md and design.md and break the work into concrete tasks in tasks.md."
                .to_string()
        }
        NodeName::Engineer => format!(
            "Implement the code per design.md and tasks.md. Target framework: {}. Complete one \
             task at a time and verify it before moving on.",
            framework.as_str()
        ),
        NodeName::Qa => {
            "Write test cases, run them, and produce the test report in test_report.md.".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_role_carries_the_decision_tool() {
        for node in ALL_NODES {
            let agent = agent_for(node, "test-model");
            assert!(
                agent.tools.iter().any(|t| t == "workflow_decision"),
                "{node} lacks workflow_decision"
            );
        }
    }

    #[test]
    fn engineer_owns_dev_server_lifecycle() {
        let agent = agent_for(NodeName::Engineer, "test-model");
        for tool in ["exec_command", "dev_server_start", "dev_server_stop"] {
            assert!(agent.tools.iter().any(|t| t == tool));
        }
        let qa = agent_for(NodeName::Qa, "test-model");
        assert!(!qa.tools.iter().any(|t| t == "dev_server_start"));
    }

    #[test]
    fn default_prompts_mention_their_artifact() {
        let framework = Framework::Nextjs;
        assert!(default_task_prompt(NodeName::Boss, framework).contains("requirements.md"));
        assert!(default_task_prompt(NodeName::ProductManager, framework).contains("prd.md"));
        assert!(default_task_prompt(NodeName::Architect, framework).contains("design.md"));
        assert!(default_task_prompt(NodeName::ProjectManager, framework).contains("tasks.md"));
        assert!(default_task_prompt(NodeName::Qa, framework).contains("test_report.md"));
    }
}
