//! Pipeline stage definitions.

use serde::{Deserialize, Serialize};

/// Pipeline stages in their fixed execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Build,
    Test,
    Deploy,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 3] = [Stage::Build, Stage::Test, Stage::Deploy];

    /// Get the stage name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Build => "build",
            Stage::Test => "test",
            Stage::Deploy => "deploy",
        }
    }

    /// The stage that follows this one, if any.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Build => Some(Stage::Test),
            Stage::Test => Some(Stage::Deploy),
            Stage::Deploy => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::Build.name(), "build");
        assert_eq!(Stage::Test.name(), "test");
        assert_eq!(Stage::Deploy.name(), "deploy");
    }

    #[test]
    fn test_stage_order() {
        assert_eq!(Stage::Build.next(), Some(Stage::Test));
        assert_eq!(Stage::Test.next(), Some(Stage::Deploy));
        assert_eq!(Stage::Deploy.next(), None);
        assert_eq!(Stage::ALL, [Stage::Build, Stage::Test, Stage::Deploy]);
    }

    #[test]
    fn test_stage_serde() {
        let json = serde_json::to_string(&Stage::Deploy).unwrap();
        assert_eq!(json, "\"deploy\"");
    }
}
