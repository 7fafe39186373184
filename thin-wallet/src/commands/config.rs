//! Configuration display command

use anyhow::{Context, Result};

use super::{print_success, CliContext};

/// Run the config command
pub async fn run(ctx: &CliContext, write: bool) -> Result<()> {
    let rendered = toml::to_string_pretty(&ctx.config).context("Failed to serialize config")?;

    println!("# {}", ctx.config_path.display());
    println!("# credential: {}", ctx.credential_path.display());
    println!();
    println!("{}", rendered);

    if write {
        ctx.config.save(&ctx.config_path)?;
        print_success(&format!("Config written to {}", ctx.config_path.display()));
    }

    Ok(())
}
