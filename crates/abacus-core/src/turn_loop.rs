use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use regex::Regex;
use serde_json::json;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::Level;
use uuid::Uuid;

use abacus_client::{ChatClient, ChatMessage, ClientError, CompletionResponse};
use abacus_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use abacus_types::{
    AiChatConfig, ChatEvent, ExecutionStatus, Fact, HistoryEntry, SandboxResult, Step, TurnResult,
};

use crate::cancellation::{link_parent, with_timeout, TurnCancellation};
use crate::context::transform_history;
use crate::event_bus::EventBus;
use crate::facts::{add_fact, evict_facts, extract_facts, render_facts_block};
use crate::output::{
    collect_terminal_output, handle_overflow, render_feedback_payload, resolve_output_dir,
};
use crate::prompts;
use crate::sandbox::{ExecutionLock, Sandbox, SandboxGuard};

const COMPONENT: &str = "turn_loop";

#[derive(Debug, Clone, Copy)]
enum ExhaustionCause {
    Rounds,
    SandboxBudget,
}

fn exhaustion_fallback(cause: ExhaustionCause) -> &'static str {
    match cause {
        ExhaustionCause::Rounds => prompts::ROUND_LIMIT_FALLBACK,
        ExhaustionCause::SandboxBudget => prompts::TIME_BUDGET_FALLBACK,
    }
}

/// Drives one conversation: bounded rounds of request, execute, classify,
/// feed back, until a terminal answer or exhaustion. Owns the session's
/// history and fact store; a new message supersedes the turn in flight.
pub struct ChatOrchestrator {
    session_id: String,
    config: AiChatConfig,
    allowed_dir: PathBuf,
    client: ChatClient,
    guard: SandboxGuard,
    event_bus: EventBus,
    history: RwLock<Vec<HistoryEntry>>,
    facts: RwLock<Vec<Fact>>,
    last_sent: RwLock<Option<Vec<ChatMessage>>>,
    turn_generation: AtomicU64,
    turns: TurnCancellation,
}

impl ChatOrchestrator {
    pub fn new(
        config: AiChatConfig,
        allowed_dir: impl Into<PathBuf>,
        sandbox: Arc<dyn Sandbox>,
        lock: Arc<ExecutionLock>,
    ) -> Self {
        let client = ChatClient::from_config(&config);
        Self {
            session_id: Uuid::new_v4().to_string(),
            config,
            allowed_dir: allowed_dir.into(),
            client,
            guard: SandboxGuard::new(sandbox, lock),
            event_bus: EventBus::new(),
            history: RwLock::new(Vec::new()),
            facts: RwLock::new(Vec::new()),
            last_sent: RwLock::new(None),
            turn_generation: AtomicU64::new(0),
            turns: TurnCancellation::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.event_bus.subscribe()
    }

    pub async fn history_snapshot(&self) -> Vec<HistoryEntry> {
        self.history.read().await.clone()
    }

    pub async fn facts_snapshot(&self) -> Vec<Fact> {
        self.facts.read().await.clone()
    }

    /// Clears history and facts. The only way either is emptied.
    pub async fn reset(&self) {
        self.turns.cancel_current().await;
        self.history.write().await.clear();
        self.facts.write().await.clear();
        *self.last_sent.write().await = None;
    }

    /// Cancels the in-flight turn, if any, without starting a new one.
    pub async fn cancel(&self) {
        self.turns.cancel_current().await;
    }

    /// Writes the most recent outgoing payload under the session output
    /// directory. `None` when no request has been sent yet. The snapshot
    /// is taken before each request, so it survives request failures.
    pub async fn dump_last_sent_messages(&self) -> anyhow::Result<Option<PathBuf>> {
        let Some(messages) = self.last_sent.read().await.clone() else {
            return Ok(None);
        };
        let dir = resolve_output_dir(&self.allowed_dir, &self.session_id).await?;
        let path = dir.join(format!("sent_messages_{}.json", Uuid::new_v4()));
        let body = serde_json::to_string_pretty(&messages).context("serialize sent messages")?;
        tokio::fs::write(&path, body)
            .await
            .context("write sent-messages dump")?;
        Ok(Some(path))
    }

    /// Processes one user message to a terminal answer. A second call while
    /// this one is suspended cancels it; the superseded turn stops at its
    /// next checkpoint and never commits stale state.
    pub async fn handle_user_message(
        &self,
        text: &str,
        caller_cancel: &CancellationToken,
    ) -> anyhow::Result<TurnResult> {
        let turn_token = self.turns.begin_turn().await;
        let generation = self.turn_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (cancel, _timeout_guard) = with_timeout(
            &turn_token,
            Duration::from_millis(self.config.turn_timeout_ms),
        );
        let _caller_guard = link_parent(&cancel, caller_cancel);
        self.run_turn(text, generation, &cancel).await
    }

    async fn run_turn(
        &self,
        text: &str,
        generation: u64,
        cancel: &CancellationToken,
    ) -> anyhow::Result<TurnResult> {
        self.commit_history(generation, HistoryEntry::user(text))
            .await?;
        self.publish(
            "turn.start",
            json!({"session_id": self.session_id, "text": text}),
        );
        self.emit(Level::INFO, "turn.start", None, None, None);

        let mut steps: Vec<Step> = Vec::new();
        let mut sandbox_ms: u64 = 0;
        let mut cause = ExhaustionCause::Rounds;
        let mut round: u32 = 0;

        while round < self.config.max_rounds {
            if cancel.is_cancelled() {
                bail!("turn cancelled");
            }
            if sandbox_ms > self.config.sandbox_budget_ms {
                cause = ExhaustionCause::SandboxBudget;
                break;
            }
            round += 1;

            let response = self.request_completion(generation, round, cancel).await?;
            if response.is_truncated() {
                // partial text is never committed or executed
                self.commit_history(
                    generation,
                    HistoryEntry::execution_feedback(
                        prompts::truncated_response_feedback(),
                        ExecutionStatus::Error,
                    ),
                )
                .await?;
                continue;
            }

            let raw = response.content().to_string();
            let (step, elapsed) = self.execute_round(&raw, round, cancel).await?;
            sandbox_ms += elapsed.as_millis() as u64;
            if cancel.is_cancelled() {
                bail!("turn cancelled");
            }

            match &step.result {
                SandboxResult::Failure {
                    error_kind,
                    message,
                    is_timeout,
                } => {
                    let feedback =
                        prompts::execution_error_feedback(*error_kind, message, *is_timeout);
                    self.commit_history(generation, HistoryEntry::assistant(&raw))
                        .await?;
                    self.commit_history(
                        generation,
                        HistoryEntry::execution_feedback(feedback, ExecutionStatus::Error),
                    )
                    .await?;
                    steps.push(step);
                }
                SandboxResult::Success {
                    continue_thinking_called,
                    ..
                } => {
                    self.record_facts(generation, &step, round).await?;
                    if *continue_thinking_called {
                        let payload = render_feedback_payload(&step.result);
                        self.commit_history(generation, HistoryEntry::assistant(&raw))
                            .await?;
                        self.commit_history(
                            generation,
                            HistoryEntry::execution_feedback(
                                prompts::execution_ok_feedback(&payload),
                                ExecutionStatus::Ok,
                            ),
                        )
                        .await?;
                        steps.push(step);
                    } else if !step.result.has_observable_output() {
                        // ran fine but showed nothing; error status on
                        // purpose so pruning treats it like a failed round
                        self.commit_history(generation, HistoryEntry::assistant(&raw))
                            .await?;
                        self.commit_history(
                            generation,
                            HistoryEntry::execution_feedback(
                                prompts::no_output_feedback(),
                                ExecutionStatus::Error,
                            ),
                        )
                        .await?;
                        steps.push(step);
                    } else {
                        let shown = self.present_output(&step.result).await;
                        steps.push(step);
                        return self.finish_turn(generation, shown, steps).await;
                    }
                }
            }
        }

        self.forced_final_round(generation, cancel, round + 1, cause, steps)
            .await
    }

    /// One last request after the round or time budget ran out. Anything
    /// textual the model gives back becomes the answer; only an unusable
    /// response falls through to the fixed fallback strings.
    async fn forced_final_round(
        &self,
        generation: u64,
        cancel: &CancellationToken,
        final_round: u32,
        cause: ExhaustionCause,
        mut steps: Vec<Step>,
    ) -> anyhow::Result<TurnResult> {
        self.commit_history(
            generation,
            HistoryEntry::execution_feedback(prompts::final_nudge(), ExecutionStatus::Ok),
        )
        .await?;

        let final_text = match self
            .request_completion(generation, final_round, cancel)
            .await
        {
            Err(ClientError::Cancelled) => bail!("turn cancelled"),
            Err(err) => {
                tracing::warn!(error = %err, "final request failed, using fallback text");
                prompts::NO_USABLE_RESPONSE_FALLBACK.to_string()
            }
            Ok(response) if response.is_truncated() => {
                prompts::NO_USABLE_RESPONSE_FALLBACK.to_string()
            }
            Ok(response) => {
                let raw = response.content().to_string();
                if raw.trim().is_empty() {
                    prompts::NO_USABLE_RESPONSE_FALLBACK.to_string()
                } else {
                    let (step, _elapsed) = self.execute_round(&raw, final_round, cancel).await?;
                    if cancel.is_cancelled() {
                        bail!("turn cancelled");
                    }
                    let text = match &step.result {
                        SandboxResult::Success { .. } if step.result.has_observable_output() => {
                            self.record_facts(generation, &step, final_round).await?;
                            self.present_output(&step.result).await
                        }
                        SandboxResult::Success { .. } => {
                            self.record_facts(generation, &step, final_round).await?;
                            exhaustion_fallback(cause).to_string()
                        }
                        // the model answered in prose; show it as-is
                        SandboxResult::Failure { .. } => raw,
                    };
                    steps.push(step);
                    text
                }
            }
        };

        self.finish_turn(generation, final_text, steps).await
    }

    async fn finish_turn(
        &self,
        generation: u64,
        text: String,
        steps: Vec<Step>,
    ) -> anyhow::Result<TurnResult> {
        self.commit_history(generation, HistoryEntry::assistant(&text))
            .await?;
        self.publish("turn.end", json!({"text": &text, "steps": &steps}));
        self.emit(Level::INFO, "turn.end", None, Some("ok"), None);
        Ok(TurnResult { text, steps })
    }

    async fn request_completion(
        &self,
        generation: u64,
        round: u32,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse, ClientError> {
        let messages = self.build_messages().await;
        // a superseded turn must not clobber its successor's snapshot
        if self.is_current(generation) {
            *self.last_sent.write().await = Some(messages.clone());
        }
        self.publish(
            "request.start",
            json!({"round": round, "messages": messages.len()}),
        );
        self.emit(Level::INFO, "request.start", Some(round), None, None);

        let result = self
            .client
            .fetch_completion(
                &messages,
                self.config.max_retries,
                cancel,
                self.config.temperature,
            )
            .await;

        match &result {
            Ok(response) => {
                self.publish(
                    "request.end",
                    json!({"round": round, "finish_reason": response.finish_reason()}),
                );
            }
            Err(err) => {
                let detail = err.to_string();
                self.publish("request.end", json!({"round": round, "error": detail}));
                self.emit(
                    Level::ERROR,
                    "request.error",
                    Some(round),
                    Some("error"),
                    Some(&detail),
                );
            }
        }
        result
    }

    async fn build_messages(&self) -> Vec<ChatMessage> {
        let mut system = prompts::SYSTEM_PROMPT.to_string();
        {
            let facts = self.facts.read().await;
            let block = render_facts_block(&facts);
            if !block.is_empty() {
                system.push_str("\n\n");
                system.push_str(&block);
            }
        }

        let history = self.history.read().await;
        let windowed = transform_history(&history, self.config.context_window_tokens);
        let mut messages = Vec::with_capacity(windowed.len() + 1);
        messages.push(ChatMessage::system(system));
        for entry in &windowed {
            messages.push(match entry {
                HistoryEntry::Assistant { content } => ChatMessage::assistant(content.clone()),
                HistoryEntry::User { content, .. } => ChatMessage::user(content.clone()),
            });
        }
        messages
    }

    /// Runs the response body through the guard. A syntax failure earns one
    /// fence-extraction retry when the raw text actually contained fences;
    /// events fire once per round regardless.
    async fn execute_round(
        &self,
        raw: &str,
        round: u32,
        cancel: &CancellationToken,
    ) -> anyhow::Result<(Step, Duration)> {
        self.publish("execution.start", json!({"round": round, "code": raw}));
        let redacted = redact_text(raw);
        self.emit(
            Level::INFO,
            "execution.start",
            Some(round),
            None,
            Some(&redacted),
        );

        let (mut result, mut elapsed) = self
            .guard
            .run_guarded(raw, &self.allowed_dir, &self.config.sandbox, cancel)
            .await?;
        let mut code = raw.to_string();

        if result.is_syntax_error() {
            if let Some(extracted) = extract_fenced_code(raw) {
                if extracted != raw {
                    let (second, more) = self
                        .guard
                        .run_guarded(&extracted, &self.allowed_dir, &self.config.sandbox, cancel)
                        .await?;
                    result = second;
                    elapsed += more;
                    code = extracted;
                }
            }
        }

        self.publish(
            "execution.end",
            json!({"round": round, "code": &code, "result": &result}),
        );
        self.emit(
            Level::INFO,
            "execution.end",
            Some(round),
            Some(if result.is_success() { "ok" } else { "error" }),
            None,
        );

        Ok((Step { code, result }, elapsed))
    }

    /// Spills or truncates the collected output when it is too large to show.
    async fn present_output(&self, result: &SandboxResult) -> String {
        let collected = collect_terminal_output(result);
        let shown = handle_overflow(&collected, &self.allowed_dir, &self.session_id).await;
        if shown != collected {
            self.emit(Level::WARN, "output.overflow", None, None, None);
        }
        shown
    }

    async fn record_facts(&self, generation: u64, step: &Step, round: u32) -> anyhow::Result<()> {
        let extracted = extract_facts(&step.code, &step.result, round);
        if extracted.is_empty() {
            return Ok(());
        }
        self.check_generation(generation)?;
        let mut facts = self.facts.write().await;
        for fact in extracted {
            add_fact(&mut facts, fact);
        }
        let before = facts.len();
        evict_facts(&mut facts);
        if facts.len() < before {
            self.emit(Level::INFO, "facts.evicted", Some(round), None, None);
        }
        Ok(())
    }

    async fn commit_history(&self, generation: u64, entry: HistoryEntry) -> anyhow::Result<()> {
        self.check_generation(generation)?;
        self.history.write().await.push(entry);
        Ok(())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.turn_generation.load(Ordering::SeqCst) == generation
    }

    /// Superseded turns may still be running when their successor starts;
    /// every commit re-checks so their late results are dropped.
    fn check_generation(&self, generation: u64) -> anyhow::Result<()> {
        if !self.is_current(generation) {
            self.emit(Level::WARN, "turn.superseded", None, None, None);
            bail!("turn superseded");
        }
        Ok(())
    }

    fn publish(&self, event_type: &str, properties: serde_json::Value) {
        self.event_bus.publish(ChatEvent::new(event_type, properties));
    }

    fn emit(
        &self,
        level: Level,
        event: &str,
        round: Option<u32>,
        status: Option<&str>,
        detail: Option<&str>,
    ) {
        emit_event(
            level,
            ProcessKind::Orchestrator,
            ObservabilityEvent {
                event,
                component: COMPONENT,
                session_id: Some(&self.session_id),
                round,
                model_id: Some(self.client.model()),
                status,
                error_code: None,
                detail,
            },
        );
    }
}

/// Joins every fenced block in the text with a blank line. `None` when the
/// text has no complete fence.
fn extract_fenced_code(raw: &str) -> Option<String> {
    let Ok(re) = Regex::new(r"(?s)```[^\n]*\n(.*?)```") else {
        return None;
    };
    let blocks: Vec<&str> = re
        .captures_iter(raw)
        .map(|c| c.get(1).map(|m| m.as_str().trim_end()).unwrap_or(""))
        .collect();
    if blocks.is_empty() {
        return None;
    }
    Some(blocks.join("\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::Path;

    use abacus_types::SandboxOptions;

    #[test]
    fn unfenced_text_extracts_nothing() {
        assert!(extract_fenced_code("print(1)").is_none());
        assert!(extract_fenced_code("```unterminated\nprint(1)").is_none());
    }

    #[test]
    fn single_fence_is_stripped() {
        let raw = "Here you go:\n```\nprint(1)\n```\nHope that helps!";
        assert_eq!(extract_fenced_code(raw).as_deref(), Some("print(1)"));
    }

    #[test]
    fn language_tag_is_dropped() {
        let raw = "```python\ntotal = 1 + 1\ntotal\n```";
        assert_eq!(
            extract_fenced_code(raw).as_deref(),
            Some("total = 1 + 1\ntotal")
        );
    }

    #[test]
    fn multiple_fences_join_with_a_blank_line() {
        let raw = "```\na = 1\n```\nand then\n```\nprint(a)\n```";
        assert_eq!(
            extract_fenced_code(raw).as_deref(),
            Some("a = 1\n\nprint(a)")
        );
    }

    #[test]
    fn exhaustion_fallbacks_are_distinct() {
        assert_ne!(
            exhaustion_fallback(ExhaustionCause::Rounds),
            exhaustion_fallback(ExhaustionCause::SandboxBudget)
        );
    }

    struct IdleSandbox;

    #[async_trait]
    impl Sandbox for IdleSandbox {
        async fn execute(
            &self,
            _code: &str,
            _allowed_dir: &Path,
            _options: &SandboxOptions,
        ) -> anyhow::Result<SandboxResult> {
            bail!("no execution in this test");
        }
    }

    fn orchestrator_without_server() -> ChatOrchestrator {
        // nothing listens on port 1, so every request fails fast
        let mut config = AiChatConfig::new("http://127.0.0.1:1", "test-model");
        config.max_retries = 0;
        ChatOrchestrator::new(
            config,
            "/tmp",
            Arc::new(IdleSandbox),
            Arc::new(ExecutionLock::new()),
        )
    }

    #[tokio::test]
    async fn a_superseded_turn_cannot_overwrite_the_snapshot() {
        let orchestrator = orchestrator_without_server();
        let cancel = CancellationToken::new();

        // turn 1 is current and records its payload
        orchestrator.turn_generation.store(1, Ordering::SeqCst);
        let _ = orchestrator.request_completion(1, 1, &cancel).await;
        assert!(orchestrator.last_sent.read().await.is_some());

        // turn 2 took over; a late request from turn 1 must not clobber
        orchestrator.turn_generation.store(2, Ordering::SeqCst);
        *orchestrator.last_sent.write().await = None;
        let _ = orchestrator.request_completion(1, 1, &cancel).await;
        assert!(orchestrator.last_sent.read().await.is_none());
    }
}
