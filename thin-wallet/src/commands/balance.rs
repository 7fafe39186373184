//! Balance check command

use anyhow::Result;

use super::{format_sol, format_token_amount, print_success, unlock, CliContext};

/// Run the balance command
pub async fn run(ctx: &CliContext) -> Result<()> {
    let session = ctx.ledger_session(false)?;
    unlock(&session, ctx)?;

    println!();
    println!("Querying {}...", ctx.config.rpc_endpoint);

    session.refresh().await?;
    session.queue().run_pending();

    let balance = session.balance();
    let holdings = session.holdings();

    if balance.epoch() == 0 {
        return Err(anyhow::anyhow!("Balance query failed; see the log for details"));
    }

    println!();
    print_success(&format!("Balance: {}", format_sol(*balance.value())));

    if !holdings.value().is_empty() {
        println!();
        println!("Token accounts ({}):", holdings.value().len());
        for (i, holding) in holdings.value().iter().enumerate() {
            println!(
                "  {}. {} {}",
                i + 1,
                format_token_amount(holding.amount, holding.decimals),
                holding.mint
            );
        }
    }

    session.unload();
    Ok(())
}
