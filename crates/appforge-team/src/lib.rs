//! The web-app team as a directed graph of role-specialised agents.
//!
//! Six roles hand work to each other along a fixed routing table with
//! cyclic edges (Engineer↔QA, backtracks to earlier roles). Each node's
//! next hop is decided dynamically from the workflow decision its agent
//! recorded.

mod decision_parse;
mod graph;
mod roles;
mod routing;

pub use decision_parse::parse_decision;
pub use graph::{GraphConfig, GraphItem, TeamGraph};
pub use roles::{agent_for, default_task_prompt, node_stage, NodeName, ALL_NODES};
pub use routing::{resolve_route, Route};
