//! Password change command

use anyhow::{anyhow, Result};

use thin_wallet::WalletError;

use super::{print_error, print_success, prompt_new_password, prompt_password, CliContext};

/// Run the change-password command
pub async fn run(ctx: &CliContext) -> Result<()> {
    let session = ctx.offline_session();
    if !session.exists() {
        print_error("No credential found. Run 'thin-wallet init' first.");
        return Ok(());
    }

    let current = prompt_password("Enter current password: ")?;
    println!();
    let new_password = prompt_new_password("Enter new password: ")?;

    match session.change_password(&current, &new_password) {
        Ok(()) => {
            print_success("Password changed.");
            Ok(())
        }
        Err(WalletError::CryptoVerification) => {
            print_error("Current password is incorrect");
            Err(anyhow!("password change failed"))
        }
        Err(e) => Err(e.into()),
    }
}
