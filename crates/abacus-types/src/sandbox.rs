use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SandboxErrorKind {
    /// Code failed to parse. The orchestrator may retry with fenced-code
    /// extraction before reporting this one.
    Syntax,
    Runtime,
    /// A sandbox resource cap (time, memory, output, allocations) tripped.
    Limit,
}

/// Outcome of one sandbox execution, as reported by the interpreter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SandboxResult {
    Success {
        /// Value of the final expression, when the program ended with one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        #[serde(default)]
        ended_with_expression: bool,
        #[serde(default)]
        continue_thinking_called: bool,
        #[serde(default)]
        prints: Vec<String>,
    },
    Failure {
        error_kind: SandboxErrorKind,
        message: String,
        #[serde(default)]
        is_timeout: bool,
    },
}

impl SandboxResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_syntax_error(&self) -> bool {
        matches!(
            self,
            Self::Failure {
                error_kind: SandboxErrorKind::Syntax,
                ..
            }
        )
    }

    /// True when the run produced something worth showing: a print or a
    /// final expression that evaluated to a value.
    pub fn has_observable_output(&self) -> bool {
        match self {
            Self::Success {
                value,
                ended_with_expression,
                prints,
                ..
            } => !prints.is_empty() || (*ended_with_expression && value.is_some()),
            Self::Failure { .. } => false,
        }
    }
}

/// Resource caps forwarded to the interpreter unmodified. The cumulative
/// turn-level wall clock is tracked by the orchestrator, not here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxOptions {
    #[serde(default = "default_max_list_files")]
    pub max_list_files: u32,
    #[serde(default = "default_max_records_per_read")]
    pub max_records_per_read: u32,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: u64,
    #[serde(default = "default_max_read_bytes")]
    pub max_read_bytes: u64,
    #[serde(default = "default_max_write_bytes")]
    pub max_write_bytes: u64,
    #[serde(default = "default_max_duration_ms")]
    pub max_duration_ms: u64,
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: u64,
    #[serde(default = "default_max_allocations")]
    pub max_allocations: u64,
}

fn default_max_list_files() -> u32 {
    256
}

fn default_max_records_per_read() -> u32 {
    10_000
}

fn default_max_output_bytes() -> u64 {
    1024 * 1024
}

fn default_max_read_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_max_write_bytes() -> u64 {
    16 * 1024 * 1024
}

fn default_max_duration_ms() -> u64 {
    30_000
}

fn default_max_memory_bytes() -> u64 {
    512 * 1024 * 1024
}

fn default_max_allocations() -> u64 {
    50_000_000
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            max_list_files: default_max_list_files(),
            max_records_per_read: default_max_records_per_read(),
            max_output_bytes: default_max_output_bytes(),
            max_read_bytes: default_max_read_bytes(),
            max_write_bytes: default_max_write_bytes(),
            max_duration_ms: default_max_duration_ms(),
            max_memory_bytes: default_max_memory_bytes(),
            max_allocations: default_max_allocations(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn observable_output_needs_prints_or_expression_value() {
        let silent = SandboxResult::Success {
            value: None,
            ended_with_expression: false,
            continue_thinking_called: false,
            prints: vec![],
        };
        assert!(!silent.has_observable_output());

        let statement_only = SandboxResult::Success {
            value: Some(json!(42)),
            ended_with_expression: false,
            continue_thinking_called: false,
            prints: vec![],
        };
        assert!(!statement_only.has_observable_output());

        let printed = SandboxResult::Success {
            value: None,
            ended_with_expression: false,
            continue_thinking_called: false,
            prints: vec!["hello".into()],
        };
        assert!(printed.has_observable_output());

        let expression = SandboxResult::Success {
            value: Some(json!(42)),
            ended_with_expression: true,
            continue_thinking_called: false,
            prints: vec![],
        };
        assert!(expression.has_observable_output());
    }

    #[test]
    fn failure_tags_parse() {
        let raw = r#"{"status":"failure","error_kind":"syntax","message":"unexpected token"}"#;
        let result: SandboxResult = serde_json::from_str(raw).expect("deserialize");
        assert!(result.is_syntax_error());
        assert!(!result.has_observable_output());
    }

    #[test]
    fn options_fill_defaults_from_partial_json() {
        let opts: SandboxOptions =
            serde_json::from_str(r#"{"max_duration_ms": 5000}"#).expect("deserialize");
        assert_eq!(opts.max_duration_ms, 5000);
        assert_eq!(opts.max_list_files, 256);
        assert_eq!(opts.max_memory_bytes, 512 * 1024 * 1024);
    }
}
