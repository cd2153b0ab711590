use serde::{Deserialize, Serialize};

use crate::clock::monotonic_now;
use crate::message::gen_id;

/// Target framework for the generated application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framework {
    Nextjs,
    FastapiVite,
}

impl Framework {
    pub fn as_str(&self) -> &'static str {
        match self {
            Framework::Nextjs => "nextjs",
            Framework::FastapiVite => "fastapi-vite",
        }
    }
}

impl std::str::FromStr for Framework {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nextjs" => Ok(Framework::Nextjs),
            "fastapi-vite" => Ok(Framework::FastapiVite),
            other => Err(format!("unknown framework: {other}")),
        }
    }
}

/// Identity of a user-app pair.
///
/// Created on the first request and mutated only by the task orchestrator
/// (`is_running` transitions); never destroyed by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub framework: Framework,
    pub workspace_id: String,
    pub created_by: String,
    pub created_at: f64,
    pub updated_at: f64,
    #[serde(default)]
    pub is_running: bool,
}

impl Session {
    pub fn new(
        name: impl Into<String>,
        framework: Framework,
        created_by: impl Into<String>,
    ) -> Self {
        let now = monotonic_now();
        Self {
            id: gen_id("sess"),
            name: name.into(),
            framework,
            workspace_id: gen_id("ws"),
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
            is_running: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framework_round_trip() {
        for f in [Framework::Nextjs, Framework::FastapiVite] {
            let parsed: Framework = f.as_str().parse().unwrap();
            assert_eq!(parsed, f);
        }
        assert!("rails".parse::<Framework>().is_err());
    }

    #[test]
    fn framework_wire_value() {
        assert_eq!(
            serde_json::to_string(&Framework::FastapiVite).unwrap(),
            "\"fastapi-vite\""
        );
    }
}
