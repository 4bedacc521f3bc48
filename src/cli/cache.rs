use anyhow::Result;
use clap::{Args, Subcommand};

use crate::cache::ResponseCache;
use crate::config::Config;

#[derive(Args)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommands,
}

#[derive(Subcommand)]
pub enum CacheCommands {
    /// Show cache statistics
    Stats,

    /// Remove all cached responses
    Clear,
}

pub async fn run(args: CacheArgs) -> Result<()> {
    let config = Config::load()?;
    let mut cache = ResponseCache::new(config.paths.response_cache_file(), config.cache.clone());

    match args.command {
        CacheCommands::Stats => {
            let stats = cache.stats();
            println!("Response Cache");
            println!("--------------");
            println!("File: {}", cache.path().display());
            println!("Enabled: {}", cache.enabled());
            println!("Entries: {} / {}", stats.entries, stats.max_entries);
            println!("Hits served: {}", stats.total_hits);
            println!("TTL: {:.1} days", stats.ttl_days);
        }
        CacheCommands::Clear => {
            let removed = cache.clear();
            println!("Removed {} cached response(s).", removed);
        }
    }

    Ok(())
}
