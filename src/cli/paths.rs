//! CLI subcommand: `scenepilot paths`
//!
//! Prints all resolved XDG-compliant paths for debugging and scripting.

use anyhow::Result;

use crate::paths::Paths;

pub fn run() -> Result<()> {
    let paths = Paths::resolve()?;

    println!("Scenepilot Paths (XDG Base Directory)");
    println!("=====================================");
    println!();
    println!("Config:  {}", paths.config_dir.display());
    println!("  config.toml:     {}", paths.config_file().display());
    println!();
    println!("Data:    {}", paths.data_dir.display());
    println!();
    println!("State:   {}", paths.state_dir.display());
    println!("  history:         {}", paths.history_file().display());
    println!();
    println!("Cache:   {}", paths.cache_dir.display());
    println!(
        "  response cache:  {}",
        paths.response_cache_file().display()
    );

    Ok(())
}
