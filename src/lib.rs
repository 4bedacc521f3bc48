//! Scenepilot - a chat assistant engine for 3D scene authoring
//!
//! This crate provides the core functionality for Scenepilot, including:
//! - Conversation controller with a confirmation-gated tool loop
//! - OpenAI-compatible streaming client with retry and cancellation
//! - Scene tool registry, shortcut phrases and a local response cache
//! - Append-only conversation history with session resume

pub mod agent;
pub mod cache;
pub mod cli;
pub mod config;
pub mod history;
pub mod host;
pub mod paths;

pub use config::Config;
