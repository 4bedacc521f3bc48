use anyhow::Result;
use clap::Args;

use super::chat::{ChatStack, CliSink, build_stack};
use crate::agent::TurnOutcome;
use crate::config::Config;

#[derive(Args)]
pub struct AskArgs {
    /// The question or instruction
    pub question: String,

    /// Model to use (overrides config)
    #[arg(short, long, env = "SCENEPILOT_MODEL")]
    pub model: Option<String>,

    /// Output format: text (default) or json
    #[arg(short, long, default_value = "text")]
    pub format: String,

    /// Approve tool calls without prompting
    #[arg(short, long)]
    pub yes: bool,
}

pub async fn run(args: AskArgs) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(model) = args.model {
        config.api.model = model;
    }

    let ChatStack {
        mut controller, ..
    } = build_stack(&config)?;
    controller.new_session();
    controller.set_auto_approve(args.yes);

    // Ctrl-C stops generation; partial output is still printed.
    let stop = controller.stop_handle();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.cancel();
        }
    });

    let echo = args.format != "json";
    let mut sink = CliSink::new(echo);
    let outcome = controller.submit(&args.question, &mut sink).await?;
    watcher.abort();

    if let TurnOutcome::Failed(reason) = outcome {
        anyhow::bail!(reason);
    }

    match args.format.as_str() {
        "json" => {
            let output = serde_json::json!({
                "question": args.question,
                "response": sink.reply(),
                "model": config.api.model,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        _ => {
            println!();
        }
    }

    Ok(())
}
