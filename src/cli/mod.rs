pub mod ask;
pub mod cache;
pub mod chat;
pub mod config;
pub mod history;
pub mod paths;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "scenepilot")]
#[command(author, version, about = "Chat-driven assistant for 3D scene authoring")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start an interactive chat session
    Chat(chat::ChatArgs),

    /// Ask a single question
    Ask(ask::AskArgs),

    /// Conversation history operations
    History(history::HistoryArgs),

    /// Response cache operations
    Cache(cache::CacheArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Show resolved XDG directory paths
    Paths,
}
