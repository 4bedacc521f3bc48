mod client;
mod dispatch;
mod prompt;
mod registry;
mod shortcut;

pub use client::{
    CancelFlag, ChatBackend, ChatRequest, ClientError, ContentPart, ImageRef, LlmClient, LlmEvent,
    LlmReply, Message, MessageContent, Role, TokenUsage, ToolCallBatch, ToolCallRequest,
    ToolChoice,
};
pub use dispatch::{CompletedCall, Dispatcher, UndoScope};
pub use prompt::{ContextSource, PendingCapture, PromptBuilder};
pub use registry::{Tool, ToolExecutionResult, ToolRegistry, ToolSchema};
pub use shortcut::{ShortcutMatch, ShortcutTable};

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::ResponseCache;
use crate::config::{ChatConfig, Config};
use crate::history::HistoryStore;

/// Where the controller currently is in a turn. Purely observational;
/// transitions are driven by `submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingLlm,
    AwaitingConfirmation,
    ExecutingTools,
}

/// The user's answer to a tool confirmation prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmDecision {
    Approve,
    /// Approve and stop asking for the rest of this session.
    ApproveSession,
    Deny,
}

/// How one submitted turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The model produced a final text reply.
    Completed,
    /// A shortcut phrase ran a tool directly, no model involved.
    Shortcut,
    /// The reply came from the local cache.
    CachedReply,
    /// The user declined the requested tool calls.
    Denied,
    /// The tool round limit ended the loop.
    CapReached,
    /// The user stopped generation; partial text was kept.
    Stopped,
    Failed(String),
}

/// Receives everything the user should see while a turn runs: streamed
/// text, notices, tool activity and the confirmation prompt.
pub trait ChatSink {
    fn text_delta(&mut self, text: &str);
    fn reasoning_delta(&mut self, text: &str);
    /// Out-of-band line: retry notices, cache hits, termination notices.
    fn notice(&mut self, text: &str);
    fn tool_activity(&mut self, name: &str, result: &ToolExecutionResult);
    fn usage(&mut self, usage: &TokenUsage, session_total: u64);
    fn confirm_tools(&mut self, calls: &[ToolCallRequest]) -> ConfirmDecision;
}

enum Terminal {
    Finished(LlmReply),
    Calls(ToolCallBatch),
    Error(ClientError),
}

/// Drives the conversation: shortcut and cache layers in front, then the
/// model loop with confirmation-gated tool execution behind it.
///
/// The conversation is owned here exclusively. Every mutation commits a
/// whole turn or nothing; an assistant message carrying tool calls is
/// always followed by one tool message per call id before anything else
/// is appended.
pub struct Controller {
    backend: Box<dyn ChatBackend>,
    registry: Arc<ToolRegistry>,
    prompt: PromptBuilder,
    dispatcher: Dispatcher,
    shortcuts: ShortcutTable,
    cache: ResponseCache,
    history: HistoryStore,
    chat: ChatConfig,
    conversation: Vec<Message>,
    round: usize,
    auto_approve: bool,
    phase: Phase,
    cancel: CancelFlag,
    session_tokens: u64,
}

impl Controller {
    pub fn new(
        backend: Box<dyn ChatBackend>,
        registry: Arc<ToolRegistry>,
        context: Arc<dyn ContextSource>,
        undo: Arc<dyn UndoScope>,
        cache: ResponseCache,
        history: HistoryStore,
        config: &Config,
    ) -> Self {
        let prompt = PromptBuilder::new(
            registry.clone(),
            context,
            config.chat.window_rounds,
            config.chat.max_history,
        );
        Self {
            backend,
            registry: registry.clone(),
            prompt,
            dispatcher: Dispatcher::new(undo),
            shortcuts: ShortcutTable::new(&config.shortcuts),
            cache,
            history,
            chat: config.chat.clone(),
            conversation: Vec::new(),
            round: 0,
            auto_approve: false,
            phase: Phase::Idle,
            cancel: CancelFlag::new(),
            session_tokens: 0,
        }
    }

    /// Run one user turn to completion. Returns once the turn has fully
    /// settled; the sink sees everything in between.
    pub async fn submit(&mut self, input: &str, sink: &mut dyn ChatSink) -> Result<TurnOutcome> {
        let outcome = self.submit_inner(input, sink).await;
        self.phase = Phase::Idle;
        outcome
    }

    async fn submit_inner(
        &mut self,
        input: &str,
        sink: &mut dyn ChatSink,
    ) -> Result<TurnOutcome> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(TurnOutcome::Completed);
        }
        self.cancel.reset();
        self.round = 0;

        if let Some(shortcut) = self.shortcuts.try_match(input, &self.registry) {
            return self.run_shortcut(input, shortcut, sink).await;
        }

        if let Some(reply) = self.cache.lookup(input, &mut self.history) {
            info!("cache hit, skipping model request");
            sink.text_delta(&reply);
            sink.notice("(served from local cache)");
            self.conversation.push(Message::user(input));
            self.conversation.push(Message::assistant(reply.clone()));
            self.history.append(input, &reply, &[], false);
            return Ok(TurnOutcome::CachedReply);
        }

        self.conversation.push(Message::user(input));
        self.drive_model(input, sink).await
    }

    async fn drive_model(
        &mut self,
        user_input: &str,
        sink: &mut dyn ChatSink,
    ) -> Result<TurnOutcome> {
        let mut tools_used: Vec<String> = Vec::new();

        loop {
            if self.cancel.is_cancelled() {
                sink.notice("(stopped)");
                return Ok(TurnOutcome::Stopped);
            }

            // On the last permitted round the model may only answer in
            // text; tool schemas stay attached so it can reference them.
            let force_text = self.round + 1 >= self.chat.max_tool_rounds;
            let request = ChatRequest {
                messages: self.prompt.build(&self.conversation),
                tools: self.registry.schemas(),
                tool_choice: if force_text {
                    ToolChoice::None
                } else {
                    ToolChoice::Auto
                },
                stream: self.chat.stream,
            };

            self.phase = Phase::AwaitingLlm;
            let mut rx = self.backend.request(request, self.cancel.clone());

            let mut streamed = String::new();
            let mut streamed_reasoning = String::new();
            let mut terminal: Option<Terminal> = None;
            while let Some(event) = rx.recv().await {
                match event {
                    LlmEvent::Chunk(text) => {
                        streamed.push_str(&text);
                        sink.text_delta(&text);
                    }
                    LlmEvent::Reasoning(text) => {
                        streamed_reasoning.push_str(&text);
                        sink.reasoning_delta(&text);
                    }
                    LlmEvent::Retrying {
                        attempt,
                        max_attempts,
                        delay,
                    } => sink.notice(&format!(
                        "(request failed, retrying {}/{} in {:.1}s)",
                        attempt,
                        max_attempts,
                        delay.as_secs_f64()
                    )),
                    LlmEvent::Usage(usage) => {
                        self.session_tokens += usage.total_tokens;
                        sink.usage(&usage, self.session_tokens);
                    }
                    LlmEvent::Finished(reply) => {
                        terminal = Some(Terminal::Finished(reply));
                        break;
                    }
                    LlmEvent::ToolCalls(batch) => {
                        terminal = Some(Terminal::Calls(batch));
                        break;
                    }
                    LlmEvent::Error(err) => {
                        terminal = Some(Terminal::Error(err));
                        break;
                    }
                }
            }

            match terminal {
                None => {
                    // Channel closed without a terminal event: either the
                    // user stopped the request or the worker died.
                    if self.cancel.is_cancelled() {
                        if !streamed.is_empty() {
                            self.conversation.push(
                                Message::assistant(streamed).with_reasoning(&streamed_reasoning),
                            );
                        }
                        sink.notice("(stopped)");
                        return Ok(TurnOutcome::Stopped);
                    }
                    warn!("model request ended without a terminal event");
                    return Ok(TurnOutcome::Failed(
                        "model request ended without a reply".to_string(),
                    ));
                }
                Some(Terminal::Error(err)) => {
                    // Partial text is discarded; nothing of this turn
                    // beyond the user message is committed.
                    warn!("model request failed: {err}");
                    return Ok(TurnOutcome::Failed(err.to_string()));
                }
                Some(Terminal::Finished(reply)) => {
                    // Non-streamed replies never went through the sink as
                    // deltas; emit them now, once per lane.
                    if streamed_reasoning.is_empty() && !reply.reasoning.is_empty() {
                        sink.reasoning_delta(&reply.reasoning);
                    }
                    if streamed.is_empty() && !reply.content.is_empty() {
                        sink.text_delta(&reply.content);
                    }
                    let text = reply.content;
                    self.conversation
                        .push(Message::assistant(text.clone()).with_reasoning(&reply.reasoning));
                    if tools_used.is_empty() {
                        self.cache.store(user_input, &text);
                    }
                    self.history.append(user_input, &text, &tools_used, false);
                    return Ok(TurnOutcome::Completed);
                }
                Some(Terminal::Calls(batch)) => {
                    debug!(
                        "model requested {} tool call(s): {}",
                        batch.calls.len(),
                        batch
                            .calls
                            .iter()
                            .map(|c| c.name.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                    if streamed_reasoning.is_empty() && !batch.reasoning.is_empty() {
                        sink.reasoning_delta(&batch.reasoning);
                    }
                    if streamed.is_empty() && !batch.content.is_empty() {
                        sink.text_delta(&batch.content);
                    }
                    self.conversation.push(
                        Message::assistant_tool_calls(
                            (!batch.content.is_empty()).then(|| batch.content.clone()),
                            batch.calls.clone(),
                        )
                        .with_reasoning(&batch.reasoning),
                    );

                    if !self.auto_approve {
                        self.phase = Phase::AwaitingConfirmation;
                        match sink.confirm_tools(&batch.calls) {
                            ConfirmDecision::Approve => {}
                            ConfirmDecision::ApproveSession => {
                                self.auto_approve = true;
                            }
                            ConfirmDecision::Deny => {
                                // Every pending call id still gets a tool
                                // message; the round does not advance.
                                for call in &batch.calls {
                                    let declined = ToolExecutionResult::failure(
                                        "user declined this tool call",
                                    );
                                    self.conversation.push(Message::tool(
                                        call.id.clone(),
                                        serde_json::to_string(&declined)?,
                                    ));
                                }
                                sink.notice("(tool calls declined)");
                                return Ok(TurnOutcome::Denied);
                            }
                        }
                    }

                    self.phase = Phase::ExecutingTools;
                    let completed = self.dispatcher.execute(&self.registry, &batch.calls).await;
                    for done in &completed {
                        sink.tool_activity(&done.name, &done.result);
                        tools_used.push(done.name.clone());
                        self.conversation.push(Message::tool(
                            done.call_id.clone(),
                            serde_json::to_string(&done.result)?,
                        ));
                    }

                    self.round += 1;
                    if self.round >= self.chat.max_tool_rounds {
                        sink.notice(&format!("(stopping after {} tool rounds)", self.round));
                        return Ok(TurnOutcome::CapReached);
                    }
                }
            }
        }
    }

    async fn run_shortcut(
        &mut self,
        input: &str,
        shortcut: ShortcutMatch,
        sink: &mut dyn ChatSink,
    ) -> Result<TurnOutcome> {
        info!(
            "shortcut matched: {:?} -> {}",
            shortcut.matched_input, shortcut.tool_name
        );
        let suffix: String = Uuid::new_v4().simple().to_string().chars().take(6).collect();
        let call = ToolCallRequest {
            id: format!("shortcut_{suffix}"),
            name: shortcut.tool_name.clone(),
            arguments: serde_json::to_string(&shortcut.arguments)?,
        };

        self.phase = Phase::ExecutingTools;
        let completed = self.dispatcher.execute(&self.registry, &[call]).await;
        let Some(done) = completed.first() else {
            return Ok(TurnOutcome::Failed(
                "shortcut produced no result".to_string(),
            ));
        };
        sink.tool_activity(&done.name, &done.result);

        let reply = if done.result.success {
            format!("Executed {}: {}", done.name, done.result.message)
        } else {
            format!("Tool {} failed: {}", done.name, done.result.message)
        };
        sink.text_delta(&reply);

        self.conversation.push(Message::user(input));
        self.conversation.push(Message::assistant(reply.clone()));
        self.history
            .append(input, &reply, &[shortcut.tool_name], true);
        Ok(TurnOutcome::Shortcut)
    }

    /// Start over: fresh conversation, fresh history session, confirmation
    /// prompts re-armed. Returns the new session id.
    pub fn new_session(&mut self) -> String {
        self.conversation.clear();
        self.round = 0;
        self.auto_approve = false;
        self.session_tokens = 0;
        self.prompt.invalidate();
        self.history.begin_session()
    }

    /// Rebuild the conversation from a logged session so it can continue.
    /// Tool traffic is not replayed, only the user/assistant exchanges.
    /// Returns how many exchanges were restored.
    pub fn resume_session(&mut self, session_id: &str) -> usize {
        let records = self.history.session_records(session_id);
        if records.is_empty() {
            return 0;
        }
        self.conversation.clear();
        self.round = 0;
        self.auto_approve = false;
        self.session_tokens = 0;
        for record in &records {
            self.conversation
                .push(Message::user(record.user_input.clone()));
            if !record.assistant_reply.is_empty() {
                self.conversation
                    .push(Message::assistant(record.assistant_reply.clone()));
            }
        }
        self.history.resume_session(session_id);
        records.len()
    }

    /// Clone of the cancellation flag, for a ctrl-c handler or stop
    /// button to trip while `submit` runs.
    pub fn stop_handle(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn set_auto_approve(&mut self, on: bool) {
        self.auto_approve = on;
    }

    pub fn auto_approve(&self) -> bool {
        self.auto_approve
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn round(&self) -> usize {
        self.round
    }

    pub fn session_tokens(&self) -> u64 {
        self.session_tokens
    }

    pub fn conversation_len(&self) -> usize {
        self.conversation.len()
    }

    pub fn last_assistant_text(&self) -> Option<&str> {
        self.conversation
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant && !m.content_text().is_empty())
            .map(Message::content_text)
    }

    pub fn history(&mut self) -> &mut HistoryStore {
        &mut self.history
    }

    pub fn cache(&mut self) -> &mut ResponseCache {
        &mut self.cache
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }
}
