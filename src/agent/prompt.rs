use std::sync::Arc;

use anyhow::Result;

use super::client::{ContentPart, ImageRef, Message, MessageContent, Role};
use super::registry::ToolRegistry;

/// A viewport capture waiting to ride along with the next request.
#[derive(Debug, Clone)]
pub struct PendingCapture {
    /// `data:image/...;base64,` URI ready for the wire.
    pub data_uri: String,
    pub detail: Option<String>,
    /// Human-readable capture context, appended to the message text.
    pub metadata: Option<String>,
}

/// Read side of the host environment: current scene state plus any
/// pending viewport capture.
pub trait ContextSource: Send + Sync {
    fn scene_context(&self) -> Result<String>;

    /// Hand over the pending capture, clearing it. Each capture is
    /// consumed by exactly one outgoing request.
    fn take_pending_capture(&self) -> Option<PendingCapture>;
}

/// Assembles the message list for each model request: cached system
/// prompt, a sliding window over the conversation, and the latest user
/// turn augmented with fresh scene context and any pending capture.
pub struct PromptBuilder {
    registry: Arc<ToolRegistry>,
    context: Arc<dyn ContextSource>,
    window_rounds: usize,
    max_history: usize,
    cached_system: Option<String>,
}

impl PromptBuilder {
    pub fn new(
        registry: Arc<ToolRegistry>,
        context: Arc<dyn ContextSource>,
        window_rounds: usize,
        max_history: usize,
    ) -> Self {
        Self {
            registry,
            context,
            window_rounds,
            max_history,
            cached_system: None,
        }
    }

    /// Drop the cached system prompt so the next build re-renders it.
    /// Call after the tool registry changes or a new session starts.
    pub fn invalidate(&mut self) {
        self.cached_system = None;
    }

    pub fn system_prompt(&mut self) -> &str {
        if self.cached_system.is_none() {
            self.cached_system = Some(self.render_system_prompt());
        }
        self.cached_system.as_deref().unwrap_or("")
    }

    /// Build the outgoing message list. The stored conversation is not
    /// modified; augmentation happens on copies.
    pub fn build(&mut self, conversation: &[Message]) -> Vec<Message> {
        let system = self.system_prompt().to_string();
        let window = window_slice(conversation, self.window_rounds, self.max_history);

        let mut messages = Vec::with_capacity(window.len() + 1);
        messages.push(Message::system(system));

        let last_user = window.iter().rposition(|m| m.role == Role::User);
        // Fresh scene context goes in only when the window ends on the
        // user turn itself; tool-loop continuations keep the history
        // byte-stable for provider-side prompt caching.
        let fresh_turn = window.last().is_some_and(|m| m.role == Role::User);
        let mut capture = if last_user.is_some() {
            self.context.take_pending_capture()
        } else {
            None
        };

        for (i, message) in window.iter().enumerate() {
            if Some(i) == last_user {
                messages.push(self.augment_user_message(message, fresh_turn, capture.take()));
            } else {
                messages.push(message.clone());
            }
        }
        messages
    }

    fn augment_user_message(
        &self,
        message: &Message,
        with_context: bool,
        capture: Option<PendingCapture>,
    ) -> Message {
        let text = message.content_text();
        let mut body = if with_context {
            format!(
                "[Scene state]\n{}\n\n[User request]\n{}",
                self.dynamic_context(),
                text
            )
        } else {
            text.to_string()
        };

        match capture {
            Some(capture) => {
                if let Some(metadata) = capture.metadata {
                    body.push_str("\n\n[Capture info]\n");
                    body.push_str(&metadata);
                }
                Message {
                    role: Role::User,
                    content: Some(MessageContent::Parts(vec![
                        ContentPart::Text { text: body },
                        ContentPart::ImageUrl {
                            image_url: ImageRef {
                                url: capture.data_uri,
                                detail: capture.detail,
                            },
                        },
                    ])),
                    tool_calls: None,
                    tool_call_id: None,
                    reasoning: None,
                }
            }
            None => Message::user(body),
        }
    }

    /// Context fetch failures never abort prompt construction; the model
    /// just sees a placeholder where the scene state would be.
    fn dynamic_context(&self) -> String {
        match self.context.scene_context() {
            Ok(context) => context,
            Err(err) => format!("(scene context unavailable: {err:#})"),
        }
    }

    fn render_system_prompt(&self) -> String {
        let mut prompt = String::from(
            "You are a scene assistant embedded in a 3D authoring application. \
             You help artists inspect and modify the open scene: transforms, \
             keyframes, selection, cleanup and general scene hygiene. Keep \
             replies short and concrete.\n",
        );

        if !self.registry.is_empty() {
            prompt.push_str(
                "\nRules for tool use:\n\
                 - When the user asks for a scene operation, perform it by calling a tool. \
                 Never paste script code or manual steps instead of calling a tool.\n\
                 - Call tools only when the request needs to touch the scene; answer \
                 plain questions directly.\n\
                 - After tool results arrive, tell the user what happened in plain \
                 language. Do not repeat a call that already succeeded.\n\
                 - If the request is ambiguous about which objects to modify, ask \
                 instead of guessing.\n",
            );
            prompt.push_str(&format!(
                "\nAvailable tools: {}\n",
                self.registry.names().join(", ")
            ));
            let catalog = serde_json::to_string_pretty(&self.registry.schemas())
                .unwrap_or_else(|_| "[]".to_string());
            prompt.push_str("\nTool catalog:\n");
            prompt.push_str(&catalog);
            prompt.push('\n');
        }

        prompt
    }
}

/// Sliding window over the conversation: keep the most recent
/// `window_rounds` user rounds, then clamp to `max_history` messages.
/// Either bound set to zero disables that bound. The cut never lands on
/// a tool message, so no tool reply is separated from the assistant
/// turn that requested it.
fn window_slice(conversation: &[Message], window_rounds: usize, max_history: usize) -> &[Message] {
    let mut slice = round_window(conversation, window_rounds);
    if max_history > 0 && slice.len() > max_history {
        let mut start = slice.len() - max_history;
        while start > 0 && slice[start].role == Role::Tool {
            start -= 1;
        }
        slice = &slice[start..];
    }
    slice
}

fn round_window(conversation: &[Message], window_rounds: usize) -> &[Message] {
    if window_rounds == 0 {
        return conversation;
    }
    let user_starts: Vec<usize> = conversation
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == Role::User)
        .map(|(i, _)| i)
        .collect();
    if user_starts.len() <= window_rounds {
        return conversation;
    }
    let mut cut = user_starts[user_starts.len() - window_rounds];
    while cut > 0 && conversation[cut].role == Role::Tool {
        cut -= 1;
    }
    &conversation[cut..]
}
