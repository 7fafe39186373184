//! Live balance watch command

use anyhow::{Context, Result};
use std::time::Duration;
use tracing::warn;

use thin_wallet::{CacheKey, WalletEvent};

use super::{format_sol, print_success, unlock, CliContext};

/// How often queued wallet updates are applied
const TICK: Duration = Duration::from_millis(50);

/// Run the watch command
pub async fn run(ctx: &CliContext) -> Result<()> {
    let session = ctx.ledger_session(true)?;

    let printer = session.downgrade();
    session.events().add_listener(move |event| {
        let Some(printer) = printer.upgrade() else {
            return;
        };
        match event {
            WalletEvent::Loaded => {
                if let Some(address) = printer.public_key() {
                    println!("Watching {}", address);
                }
            }
            WalletEvent::Unloaded => println!("Stopped watching"),
            WalletEvent::CachedValueRefreshed(CacheKey::Balance) => {
                let balance = printer.balance();
                print_success(&format!(
                    "Balance: {} (update #{})",
                    format_sol(*balance.value()),
                    balance.epoch()
                ));
            }
            WalletEvent::CachedValueRefreshed(CacheKey::TokenHoldings) => {
                println!("Token accounts: {}", printer.holdings().value().len());
            }
        }
    });

    unlock(&session, ctx)?;

    if let Some(channel) = session.subscription_channel() {
        if let Err(e) = channel.connect(&ctx.config.ws_endpoint).await {
            warn!("Push updates unavailable: {}", e);
        }
    }

    let daemon = if ctx.config.auto_refresh {
        Some(session.spawn_refresh_daemon(ctx.config.refresh_interval())?)
    } else {
        None
    };

    println!("Press Ctrl-C to stop.");
    let mut ticker = tokio::time::interval(TICK);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result.context("Failed to listen for Ctrl-C")?;
                break;
            }
            _ = ticker.tick() => {
                session.queue().run_pending();
            }
        }
    }

    if let Some(daemon) = daemon {
        daemon.abort();
    }
    session.unload();
    session.queue().run_pending();

    Ok(())
}
