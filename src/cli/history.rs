use anyhow::Result;
use clap::{Args, Subcommand};
use std::io::{self, Write};

use crate::config::Config;
use crate::history::HistoryStore;

#[derive(Args)]
pub struct HistoryArgs {
    #[command(subcommand)]
    pub command: HistoryCommands,
}

#[derive(Subcommand)]
pub enum HistoryCommands {
    /// Search past conversations
    Search {
        /// Keyword to look for (matches questions and replies)
        keyword: String,

        /// Maximum number of results
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show the most recent records
    Recent {
        /// Number of records to show
        #[arg(short, long, default_value = "10")]
        count: usize,
    },

    /// List recorded sessions
    Sessions,

    /// Show history statistics
    Stats,

    /// Delete all history records
    Clear {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
}

pub async fn run(args: HistoryArgs) -> Result<()> {
    let config = Config::load()?;
    let mut history = HistoryStore::new(config.paths.history_file(), config.history.clone());

    match args.command {
        HistoryCommands::Search { keyword, limit } => show_records(&mut history, &keyword, limit),
        HistoryCommands::Recent { count } => show_records(&mut history, "", count),
        HistoryCommands::Sessions => show_sessions(&mut history),
        HistoryCommands::Stats => show_stats(&mut history),
        HistoryCommands::Clear { force } => clear(&mut history, force),
    }
}

fn show_records(history: &mut HistoryStore, keyword: &str, limit: usize) -> Result<()> {
    let records = history.search(keyword, limit);

    if records.is_empty() {
        if keyword.is_empty() {
            println!("No history recorded yet.");
        } else {
            println!("No records matching '{}'.", keyword);
        }
        return Ok(());
    }

    for record in &records {
        let marker = if record.is_shortcut {
            " [shortcut]"
        } else if !record.tools_used.is_empty() {
            " [tools]"
        } else {
            ""
        };
        println!(
            "[{}]{} {}",
            brief(&record.timestamp),
            marker,
            record.user_input
        );

        let preview: String = record.assistant_reply.chars().take(200).collect();
        let preview = preview.replace('\n', " ");
        println!(
            "  {}{}\n",
            preview,
            if record.assistant_reply.chars().count() > 200 {
                "..."
            } else {
                ""
            }
        );
    }

    Ok(())
}

fn show_sessions(history: &mut HistoryStore) -> Result<()> {
    let sessions = history.sessions();

    if sessions.is_empty() {
        println!("No recorded sessions.");
        return Ok(());
    }

    println!("Recorded sessions:\n");
    for session in sessions.iter().rev() {
        println!(
            "  {} ({} records, started {})",
            session.id,
            session.records,
            brief(&session.started)
        );
    }

    Ok(())
}

fn show_stats(history: &mut HistoryStore) -> Result<()> {
    let stats = history.stats();

    println!("Conversation History");
    println!("--------------------");
    println!("File: {}", history.path().display());
    println!("Records: {}", stats.total_records);
    println!("Sessions: {}", stats.total_sessions);
    println!("Shortcut turns: {}", stats.shortcut_records);
    println!("Turns with tools: {}", stats.tool_records);
    println!("Current session: {}", stats.current_session);

    Ok(())
}

fn clear(history: &mut HistoryStore, force: bool) -> Result<()> {
    if !force {
        print!("Delete all history records? [y/N]: ");
        io::stdout().flush()?;

        let mut answer = String::new();
        io::stdin().read_line(&mut answer)?;
        if !matches!(answer.trim().to_lowercase().as_str(), "y" | "yes") {
            println!("Aborted.");
            return Ok(());
        }
    }

    let removed = history.clear_all();
    println!("Removed {} record(s).", removed);
    Ok(())
}

fn brief(timestamp: &str) -> &str {
    timestamp.get(..19).unwrap_or(timestamp)
}
