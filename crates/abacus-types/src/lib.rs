pub mod config;
pub mod event;
pub mod fact;
pub mod history;
pub mod sandbox;

pub use config::AiChatConfig;
pub use event::{ChatEvent, Step, TurnResult};
pub use fact::{Fact, FactKey, FactKind};
pub use history::{ExecutionStatus, HistoryEntry};
pub use sandbox::{SandboxErrorKind, SandboxOptions, SandboxResult};
