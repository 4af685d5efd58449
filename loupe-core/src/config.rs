// Debugger configuration
//
// Engine-level settings, embedded in the server configuration file.

use crate::substitute::SubstituteRule;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebuggerConfig {
    pub substitute_path: Vec<SubstituteRule>,
    /// Attach to child processes spawned by the target.
    pub follow_exec: bool,
    /// Only follow children whose command line matches.
    pub follow_exec_regex: Option<String>,
    pub case_insensitive_paths: bool,
    /// Launch under the record/replay backend.
    pub record: bool,
    pub working_dir: Option<String>,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            substitute_path: Vec::new(),
            follow_exec: false,
            follow_exec_regex: None,
            case_insensitive_paths: cfg!(windows),
            record: false,
            working_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let cfg: DebuggerConfig = serde_json::from_str(
            r#"{"follow_exec": true, "substitute_path": [{"from": "/build", "to": "/src"}]}"#,
        )
        .unwrap();
        assert!(cfg.follow_exec);
        assert!(!cfg.record);
        assert_eq!(cfg.substitute_path, vec![SubstituteRule::new("/build", "/src")]);
    }
}
