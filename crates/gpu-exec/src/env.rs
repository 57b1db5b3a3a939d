use std::env;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

static ENABLE_RUNTIME_EXECUTABLE: OnceLock<Option<bool>> = OnceLock::new();
static FORCE_SYNCHRONOUS: OnceLock<Option<bool>> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn read_flag(name: &str) -> Option<bool> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(parse_bool(&value)),
        _ => None,
    }
}

fn enable_runtime_executable_override() -> Option<bool> {
    *ENABLE_RUNTIME_EXECUTABLE.get_or_init(|| read_flag("GPU_EXEC_ENABLE_RUNTIME_EXECUTABLE"))
}

fn force_synchronous_override() -> Option<bool> {
    *FORCE_SYNCHRONOUS.get_or_init(|| read_flag("GPU_EXEC_FORCE_SYNCHRONOUS"))
}

fn default_true() -> bool {
    true
}

/// Options that influence how an executable is selected and run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugOptions {
    /// Prefer the runtime program over the thunk sequence when both are available.
    #[serde(default)]
    pub enable_runtime_executable: bool,
    /// Block the host on the main stream after every invocation.
    #[serde(default)]
    pub force_synchronous: bool,
    /// Attach the buffer-assignment description to allocation failures.
    #[serde(default = "default_true")]
    pub dump_buffer_assignment_on_oom: bool,
}

impl Default for DebugOptions {
    fn default() -> Self {
        Self {
            enable_runtime_executable: false,
            force_synchronous: false,
            dump_buffer_assignment_on_oom: true,
        }
    }
}

impl DebugOptions {
    /// Defaults with process environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(enabled) = enable_runtime_executable_override() {
            self.enable_runtime_executable = enabled;
        }
        if let Some(forced) = force_synchronous_override() {
            self.force_synchronous = forced;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_truthy_spellings() {
        for value in ["1", "true", "TRUE", " yes ", "On"] {
            assert!(parse_bool(value), "{value:?} should parse as true");
        }
        for value in ["0", "false", "off", "nope"] {
            assert!(!parse_bool(value), "{value:?} should parse as false");
        }
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let options: DebugOptions = serde_json::from_str("{\"force_synchronous\": true}")
            .expect("debug options should deserialize");
        assert!(options.force_synchronous);
        assert!(!options.enable_runtime_executable);
        assert!(options.dump_buffer_assignment_on_oom);
    }
}
