//! Address display command

use anyhow::{anyhow, Result};

use super::{unlock, CliContext};

/// Run the address command
pub async fn run(ctx: &CliContext) -> Result<()> {
    let session = ctx.offline_session();
    unlock(&session, ctx)?;

    let address = session
        .public_key()
        .ok_or_else(|| anyhow!("credential not loaded"))?;

    println!();
    println!("Your address:");
    println!("  {}", address);

    Ok(())
}
