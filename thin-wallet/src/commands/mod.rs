//! CLI Commands
//!
//! Each command is a thin host over [`WalletSession`].

pub mod address;
pub mod balance;
pub mod change_password;
pub mod config;
pub mod init;
pub mod watch;

use anyhow::{anyhow, Context, Result};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;
use zeroize::Zeroizing;

use thin_wallet::config::{default_config_path, WalletConfig};
use thin_wallet::transport::{HttpTransport, WsConnector};
use thin_wallet::{BatchComposer, FileStore, LedgerLink, SubscriptionChannel, WalletError, WalletSession};

/// Lamports per SOL
const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

/// Minimum accepted length for a new password
const MIN_PASSWORD_LEN: usize = 8;

/// Resolved configuration shared by all commands
pub struct CliContext {
    pub config: WalletConfig,
    pub config_path: PathBuf,
    pub credential_path: PathBuf,
}

impl CliContext {
    pub fn load(config_path: Option<PathBuf>, credential_path: Option<PathBuf>) -> Result<Self> {
        let config_path = match config_path {
            Some(path) => path,
            None => default_config_path()?,
        };
        let config = WalletConfig::load_or_default(&config_path)?;
        let credential_path =
            credential_path.unwrap_or_else(|| config.resolve_credential_path(&config_path));

        Ok(Self {
            config,
            config_path,
            credential_path,
        })
    }

    fn store(&self) -> Arc<FileStore> {
        Arc::new(FileStore::new(&self.credential_path))
    }

    /// Session that never talks to the ledger
    pub fn offline_session(&self) -> WalletSession {
        WalletSession::new(self.store(), self.config.encryption.scheme())
    }

    /// Session wired to the configured endpoints. The subscription channel
    /// is created but not connected.
    pub fn ledger_session(&self, with_subscriptions: bool) -> Result<WalletSession> {
        let runtime = Handle::current();
        let transport = HttpTransport::new(&self.config.rpc_endpoint)
            .context("Failed to create RPC client")?;
        let batch = BatchComposer::new(Arc::new(transport), self.config.batch.policy(), runtime.clone());

        let channel = with_subscriptions.then(|| {
            SubscriptionChannel::new(
                Arc::new(WsConnector),
                self.config.commitment,
                self.config.max_message_bytes,
            )
        });

        let ledger = LedgerLink {
            batch,
            channel,
            runtime,
            commitment: self.config.commitment,
        };
        Ok(WalletSession::with_ledger(
            self.store(),
            self.config.encryption.scheme(),
            ledger,
        ))
    }
}

/// Prompt for the password and load the credential.
pub fn unlock(session: &WalletSession, ctx: &CliContext) -> Result<()> {
    if !session.exists() {
        return Err(anyhow!(
            "No credential found at {}. Run 'thin-wallet init' first.",
            ctx.credential_path.display()
        ));
    }

    let password = prompt_password("Enter wallet password: ")?;
    match session.load(&password) {
        Ok(()) => Ok(()),
        Err(WalletError::LoadFailed) => {
            print_error("Unable to unlock the credential - wrong password?");
            Err(anyhow!("unlock failed"))
        }
        Err(e) => Err(e.into()),
    }
}

/// Prompt for password input (hidden)
pub fn prompt_password(prompt: &str) -> Result<Zeroizing<String>> {
    print!("{}", prompt);
    io::stdout().flush()?;

    let password = rpassword::read_password()?;
    Ok(Zeroizing::new(password))
}

/// Prompt for a new password until it is long enough and confirmed
pub fn prompt_new_password(prompt: &str) -> Result<Zeroizing<String>> {
    loop {
        let password = prompt_password(prompt)?;

        if password.len() < MIN_PASSWORD_LEN {
            print_error(&format!(
                "Password must be at least {} characters",
                MIN_PASSWORD_LEN
            ));
            continue;
        }

        let confirm = prompt_password("Confirm password: ")?;

        if *password != *confirm {
            print_error("Passwords do not match");
            continue;
        }

        return Ok(password);
    }
}

/// Prompt for confirmation
pub fn prompt_confirm(message: &str) -> Result<bool> {
    print!("{} [y/N]: ", message);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    Ok(input.trim().eq_ignore_ascii_case("y") || input.trim().eq_ignore_ascii_case("yes"))
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("\x1b[31mError:\x1b[0m {}", message);
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("\x1b[32m{}\x1b[0m", message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("\x1b[33mWarning:\x1b[0m {}", message);
}

/// Format lamports as SOL
pub fn format_sol(lamports: u64) -> String {
    format!(
        "{}.{:09} SOL",
        lamports / LAMPORTS_PER_SOL,
        lamports % LAMPORTS_PER_SOL
    )
}

/// Format a raw token amount with its decimals
pub fn format_token_amount(amount: u64, decimals: u8) -> String {
    if decimals == 0 {
        return amount.to_string();
    }
    let scale = 10u128.pow(u32::from(decimals));
    let amount = u128::from(amount);
    format!(
        "{}.{:0width$}",
        amount / scale,
        amount % scale,
        width = usize::from(decimals)
    )
}
