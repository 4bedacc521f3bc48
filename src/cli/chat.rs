use anyhow::Result;
use clap::Args;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::io::{self, Write};
use std::sync::Arc;

use crate::agent::{
    ChatSink, ConfirmDecision, Controller, LlmClient, TokenUsage, ToolCallRequest,
    ToolExecutionResult, ToolRegistry, TurnOutcome,
};
use crate::cache::ResponseCache;
use crate::config::Config;
use crate::history::HistoryStore;
use crate::host::{self, SceneContext, SceneDoc, SceneUndo, SharedScene, lock_scene};

#[derive(Args)]
pub struct ChatArgs {
    /// Model to use (overrides config)
    #[arg(short, long, env = "SCENEPILOT_MODEL")]
    pub model: Option<String>,

    /// Session ID to resume
    #[arg(short, long)]
    pub session: Option<String>,

    /// Resume the most recent session
    #[arg(long)]
    pub resume: bool,
}

/// Everything a chat-like command needs: the controller and the scene
/// document its tools operate on.
pub(crate) struct ChatStack {
    pub controller: Controller,
    pub scene: SharedScene,
}

pub(crate) fn build_stack(config: &Config) -> Result<ChatStack> {
    let scene = host::shared(SceneDoc::sample());

    let mut registry = ToolRegistry::new();
    for tool in host::create_scene_tools(&scene, &config.vision) {
        registry.register(tool);
    }
    let registry = Arc::new(registry);

    let backend = LlmClient::new(config.api.clone())?;
    let cache = ResponseCache::new(config.paths.response_cache_file(), config.cache.clone());
    let history = HistoryStore::new(config.paths.history_file(), config.history.clone());

    let controller = Controller::new(
        Box::new(backend),
        registry,
        Arc::new(SceneContext::new(scene.clone())),
        Arc::new(SceneUndo::new(scene.clone())),
        cache,
        history,
        config,
    );

    Ok(ChatStack { controller, scene })
}

pub async fn run(args: ChatArgs) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(model) = args.model {
        config.api.model = model;
    }

    let ChatStack {
        mut controller,
        scene,
    } = build_stack(&config)?;

    // Determine session to use
    let session_id = if let Some(id) = args.session {
        Some(id)
    } else if args.resume {
        controller.history().sessions().last().map(|s| s.id.clone())
    } else {
        None
    };

    // Resume or create session
    if let Some(session_id) = session_id {
        let restored = controller.resume_session(&session_id);
        if restored > 0 {
            println!("Resumed session {} ({} turns)\n", session_id, restored);
        } else {
            eprintln!(
                "No records for session {}. Starting new session.\n",
                session_id
            );
            controller.new_session();
        }
    } else {
        controller.new_session();
    }

    let cache_state = if controller.cache().enabled() {
        "on"
    } else {
        "off"
    };
    println!(
        "Scenepilot v{} | Model: {} | Tools: {} | Cache: {}\n",
        env!("CARGO_PKG_VERSION"),
        config.api.model,
        controller.registry().len(),
        cache_state
    );
    println!("Type /help for commands, /quit to exit\n");

    let mut rl = DefaultEditor::new()?;

    loop {
        let readline = rl.readline("You: ");

        let input = match readline {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                break; // Ctrl+D
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        };

        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        // Add to history
        let _ = rl.add_history_entry(input);

        // Handle commands
        if input.starts_with('/') {
            match handle_command(input, &mut controller, &scene) {
                CommandResult::Continue => continue,
                CommandResult::Quit => break,
                CommandResult::Error(e) => {
                    eprintln!("Error: {}", e);
                    continue;
                }
            }
        }

        print!("\nScenepilot: ");
        io::stdout().flush()?;

        // Ctrl-C while a reply runs stops generation instead of killing the
        // process; the watcher is dropped once the turn settles.
        let stop = controller.stop_handle();
        let watcher = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                stop.cancel();
            }
        });

        let mut sink = CliSink::new(true);
        let outcome = controller.submit(input, &mut sink).await;
        watcher.abort();

        match outcome {
            Ok(TurnOutcome::Failed(reason)) => eprintln!("\nError: {}\n", reason),
            Ok(_) => println!("\n"),
            Err(e) => eprintln!("\nError: {:#}\n", e),
        }
    }

    println!("Goodbye!");
    Ok(())
}

/// Streams a turn to the terminal and answers confirmation prompts from
/// stdin. With `echo` off it only collects the reply (for json output).
pub(crate) struct CliSink {
    echo: bool,
    reply: String,
    in_reasoning: bool,
}

impl CliSink {
    pub(crate) fn new(echo: bool) -> Self {
        Self {
            echo,
            reply: String::new(),
            in_reasoning: false,
        }
    }

    pub(crate) fn reply(&self) -> &str {
        &self.reply
    }

    fn close_reasoning(&mut self) {
        if self.in_reasoning {
            println!();
            self.in_reasoning = false;
        }
    }
}

impl ChatSink for CliSink {
    fn text_delta(&mut self, text: &str) {
        self.reply.push_str(text);
        if self.echo {
            self.close_reasoning();
            print!("{}", text);
            let _ = io::stdout().flush();
        }
    }

    fn reasoning_delta(&mut self, text: &str) {
        if self.echo {
            if !self.in_reasoning {
                print!("[thinking] ");
                self.in_reasoning = true;
            }
            print!("{}", text);
            let _ = io::stdout().flush();
        }
    }

    fn notice(&mut self, text: &str) {
        if self.echo {
            self.close_reasoning();
            println!("\n{}", text);
        }
    }

    fn tool_activity(&mut self, name: &str, result: &ToolExecutionResult) {
        if self.echo {
            self.close_reasoning();
            if result.success {
                println!("\n[{}] {}", name, result.message);
            } else {
                println!("\n[{} failed] {}", name, result.message);
            }
        }
    }

    fn usage(&mut self, usage: &TokenUsage, session_total: u64) {
        tracing::debug!(
            prompt = usage.prompt_tokens,
            completion = usage.completion_tokens,
            session_total,
            "token usage"
        );
    }

    fn confirm_tools(&mut self, calls: &[ToolCallRequest]) -> ConfirmDecision {
        self.close_reasoning();
        println!();
        for call in calls {
            let detail = summarize_args(&call.arguments);
            if detail.is_empty() {
                println!("  [{}]", call.name);
            } else {
                println!("  [{}: {}]", call.name, detail);
            }
        }
        print!("Execute {} tool call(s)? [y/N/a]: ", calls.len());
        let _ = io::stdout().flush();

        let mut answer = String::new();
        if io::stdin().read_line(&mut answer).is_err() {
            return ConfirmDecision::Deny;
        }
        match answer.trim().to_lowercase().as_str() {
            "y" | "yes" => ConfirmDecision::Approve,
            "a" | "all" | "always" => ConfirmDecision::ApproveSession,
            _ => ConfirmDecision::Deny,
        }
    }
}

/// One-line argument preview for the confirmation prompt.
fn summarize_args(arguments: &str) -> String {
    let flat: String = arguments.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat == "{}" || flat.is_empty() {
        return String::new();
    }
    if flat.chars().count() > 72 {
        let cut: String = flat.chars().take(72).collect();
        format!("{}...", cut)
    } else {
        flat
    }
}

enum CommandResult {
    Continue,
    Quit,
    Error(String),
}

fn handle_command(input: &str, controller: &mut Controller, scene: &SharedScene) -> CommandResult {
    let parts: Vec<&str> = input.split_whitespace().collect();
    let cmd = parts[0];

    match cmd {
        "/quit" | "/exit" | "/q" => CommandResult::Quit,

        "/help" | "/h" | "/?" => {
            println!("\nCommands:");
            println!("  /help              Show this help");
            println!("  /new               Start a new session");
            println!("  /status            Session, cache and scene status");
            println!("  /sessions          List recorded sessions");
            println!("  /resume <id>       Resume a recorded session");
            println!("  /search <keyword>  Search conversation history");
            println!("  /scene             Print the current scene state");
            println!("  /undo              Undo the last tool change");
            println!("  /quit              Exit");
            println!("\nAnything else is sent to the assistant. Ctrl-C stops a running reply.\n");
            CommandResult::Continue
        }

        "/new" => {
            let id = controller.new_session();
            println!("\nStarted session {}.\n", id);
            CommandResult::Continue
        }

        "/status" => {
            let messages = controller.conversation_len();
            let auto = controller.auto_approve();
            let tokens = controller.session_tokens();
            let stats = controller.history().stats();
            println!("\nSession Status:");
            println!("  Session: {}", stats.current_session);
            println!("  Messages in context: {}", messages);
            println!("  Auto-approve tools: {}", if auto { "on" } else { "off" });
            if tokens > 0 {
                println!("  Tokens this session: {}", tokens);
            }

            let cache = controller.cache().stats();
            println!("\nCache:");
            println!("  Entries: {} / {}", cache.entries, cache.max_entries);
            println!("  Hits: {}", cache.total_hits);

            let doc = lock_scene(scene);
            println!("\nScene:");
            println!("  Nodes: {}", doc.node_count());
            println!("  Selected: {}", doc.selection().len());
            println!("  Frame: {}", doc.current_frame());
            println!("  Undo steps: {}", doc.undo_depth());
            println!();
            CommandResult::Continue
        }

        "/sessions" => {
            let sessions = controller.history().sessions();
            if sessions.is_empty() {
                println!("\nNo recorded sessions.\n");
            } else {
                println!("\nRecorded sessions:");
                for (i, session) in sessions.iter().rev().take(10).enumerate() {
                    println!(
                        "  {}. {} ({} records, started {})",
                        i + 1,
                        session.id,
                        session.records,
                        timestamp_brief(&session.started)
                    );
                }
                if sessions.len() > 10 {
                    println!("  ... and {} more", sessions.len() - 10);
                }
                println!("\nUse /resume <id> to continue one.\n");
            }
            CommandResult::Continue
        }

        "/resume" => {
            if parts.len() < 2 {
                return CommandResult::Error("Usage: /resume <session-id>".into());
            }
            let wanted = parts[1];

            // Find session by prefix match
            let matching: Vec<String> = controller
                .history()
                .sessions()
                .into_iter()
                .filter(|s| s.id.starts_with(wanted))
                .map(|s| s.id)
                .collect();

            match matching.len() {
                0 => CommandResult::Error(format!("No session found matching '{}'", wanted)),
                1 => {
                    let restored = controller.resume_session(&matching[0]);
                    println!("\nResumed session {} ({} turns)\n", matching[0], restored);
                    CommandResult::Continue
                }
                _ => CommandResult::Error(format!(
                    "Multiple sessions match '{}'. Please be more specific.",
                    wanted
                )),
            }
        }

        "/search" => {
            if parts.len() < 2 {
                return CommandResult::Error("Usage: /search <keyword>".into());
            }
            let keyword = parts[1..].join(" ");
            let records = controller.history().search(&keyword, 10);
            if records.is_empty() {
                println!("\nNo history matching '{}'.\n", keyword);
            } else {
                println!("\nHistory matching '{}':", keyword);
                for record in &records {
                    let reply: String = record.assistant_reply.chars().take(80).collect();
                    println!(
                        "  [{}] {} -> {}",
                        timestamp_brief(&record.timestamp),
                        record.user_input,
                        reply.replace('\n', " ")
                    );
                }
                println!();
            }
            CommandResult::Continue
        }

        "/scene" => {
            println!("\n{}\n", lock_scene(scene).context_text());
            CommandResult::Continue
        }

        "/undo" => {
            match lock_scene(scene).undo() {
                Some(label) => println!("\nUndid: {}\n", label),
                None => println!("\nNothing to undo.\n"),
            }
            CommandResult::Continue
        }

        _ => CommandResult::Error(format!(
            "Unknown command: {}. Type /help for commands.",
            cmd
        )),
    }
}

/// RFC 3339 timestamps down to seconds, no zone suffix.
fn timestamp_brief(timestamp: &str) -> &str {
    timestamp.get(..19).unwrap_or(timestamp)
}
