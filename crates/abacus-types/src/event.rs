use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sandbox::SandboxResult;

/// Notification published on the chat event bus. The host renders these;
/// nothing in the turn loop depends on anyone listening.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEvent {
    pub event_type: String,
    pub properties: Value,
}

impl ChatEvent {
    pub fn new(event_type: impl Into<String>, properties: Value) -> Self {
        Self {
            event_type: event_type.into(),
            properties,
        }
    }
}

/// One executed round: the code the model sent and what the sandbox said.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub code: String,
    pub result: SandboxResult,
}

/// Final product of a turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnResult {
    pub text: String,
    pub steps: Vec<Step>,
}
