use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Ok,
    Error,
}

/// One conversation entry. Execution feedback travels as a user entry so the
/// model sees it as input, with `is_execution_result` separating it from
/// text the person actually typed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum HistoryEntry {
    User {
        content: String,
        #[serde(default)]
        is_execution_result: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        execution_status: Option<ExecutionStatus>,
    },
    Assistant {
        content: String,
    },
}

impl HistoryEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
            is_execution_result: false,
            execution_status: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: content.into(),
        }
    }

    pub fn execution_feedback(content: impl Into<String>, status: ExecutionStatus) -> Self {
        Self::User {
            content: content.into(),
            is_execution_result: true,
            execution_status: Some(status),
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Self::User { content, .. } => content,
            Self::Assistant { content } => content,
        }
    }

    pub fn is_assistant(&self) -> bool {
        matches!(self, Self::Assistant { .. })
    }

    /// Feedback entry for a round whose execution failed.
    pub fn is_error_feedback(&self) -> bool {
        matches!(
            self,
            Self::User {
                is_execution_result: true,
                execution_status: Some(ExecutionStatus::Error),
                ..
            }
        )
    }
}
