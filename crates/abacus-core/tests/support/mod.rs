use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::broadcast;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use abacus_core::sandbox::{ExecutionLock, Sandbox};
use abacus_core::turn_loop::ChatOrchestrator;
use abacus_types::{AiChatConfig, ChatEvent, SandboxErrorKind, SandboxOptions, SandboxResult};

/// Plays back a scripted sequence of execution results and records every
/// program it was asked to run. Exhausting the script is an error so a
/// test that executes more rounds than it planned fails loudly.
pub struct ScriptedSandbox {
    script: Mutex<VecDeque<anyhow::Result<SandboxResult>>>,
    calls: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl ScriptedSandbox {
    pub fn new(script: Vec<anyhow::Result<SandboxResult>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn with_delay(script: Vec<anyhow::Result<SandboxResult>>, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new(script)
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    async fn execute(
        &self,
        code: &str,
        _allowed_dir: &Path,
        _options: &SandboxOptions,
    ) -> anyhow::Result<SandboxResult> {
        self.calls.lock().expect("calls lock").push(code.to_string());
        let next = self.script.lock().expect("script lock").pop_front();
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        next.unwrap_or_else(|| Err(anyhow!("sandbox script exhausted")))
    }
}

pub fn expression_success(value: Value) -> SandboxResult {
    SandboxResult::Success {
        value: Some(value),
        ended_with_expression: true,
        continue_thinking_called: false,
        prints: Vec::new(),
    }
}

pub fn print_success(prints: &[&str]) -> SandboxResult {
    SandboxResult::Success {
        value: None,
        ended_with_expression: false,
        continue_thinking_called: false,
        prints: prints.iter().map(|p| p.to_string()).collect(),
    }
}

pub fn silent_success() -> SandboxResult {
    SandboxResult::Success {
        value: None,
        ended_with_expression: false,
        continue_thinking_called: false,
        prints: Vec::new(),
    }
}

pub fn continue_thinking(prints: &[&str]) -> SandboxResult {
    SandboxResult::Success {
        value: None,
        ended_with_expression: false,
        continue_thinking_called: true,
        prints: prints.iter().map(|p| p.to_string()).collect(),
    }
}

pub fn runtime_failure(message: &str) -> SandboxResult {
    SandboxResult::Failure {
        error_kind: SandboxErrorKind::Runtime,
        message: message.to_string(),
        is_timeout: false,
    }
}

pub fn syntax_failure(message: &str) -> SandboxResult {
    SandboxResult::Failure {
        error_kind: SandboxErrorKind::Syntax,
        message: message.to_string(),
        is_timeout: false,
    }
}

pub fn completion_body(content: &str) -> Value {
    json!({
        "choices": [{
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }]
    })
}

pub fn truncated_body(content: &str) -> Value {
    json!({
        "choices": [{
            "message": {"role": "assistant", "content": content},
            "finish_reason": "length"
        }]
    })
}

/// Queues one completion response. Mount calls stack: each mock answers
/// exactly once, in mount order.
pub async fn mount_completion(server: &MockServer, body: Value) {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .up_to_n_times(1)
        .mount(server)
        .await;
}

pub async fn mount_status(server: &MockServer, status: u16) {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(status))
        .up_to_n_times(1)
        .mount(server)
        .await;
}

pub struct TestHarness {
    pub server: MockServer,
    pub workdir: TempDir,
    pub sandbox: Arc<ScriptedSandbox>,
    pub orchestrator: ChatOrchestrator,
}

impl TestHarness {
    pub async fn new(script: Vec<anyhow::Result<SandboxResult>>) -> Self {
        Self::build(ScriptedSandbox::new(script), |_| {}).await
    }

    pub async fn with_config(
        script: Vec<anyhow::Result<SandboxResult>>,
        tweak: impl FnOnce(&mut AiChatConfig),
    ) -> Self {
        Self::build(ScriptedSandbox::new(script), tweak).await
    }

    pub async fn with_sandbox(
        sandbox: ScriptedSandbox,
        tweak: impl FnOnce(&mut AiChatConfig),
    ) -> Self {
        Self::build(sandbox, tweak).await
    }

    async fn build(sandbox: ScriptedSandbox, tweak: impl FnOnce(&mut AiChatConfig)) -> Self {
        let server = MockServer::start().await;
        let workdir = tempfile::tempdir().expect("create workdir");
        let mut config = AiChatConfig::new(server.uri(), "test-model");
        config.max_retries = 1;
        tweak(&mut config);
        let sandbox = Arc::new(sandbox);
        let orchestrator = ChatOrchestrator::new(
            config,
            workdir.path(),
            sandbox.clone() as Arc<dyn Sandbox>,
            Arc::new(ExecutionLock::new()),
        );
        Self {
            server,
            workdir,
            sandbox,
            orchestrator,
        }
    }
}

pub fn drain_events(rx: &mut broadcast::Receiver<ChatEvent>) -> Vec<ChatEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
