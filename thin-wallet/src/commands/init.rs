//! Credential initialization command

use anyhow::{anyhow, Result};
use zeroize::Zeroizing;

use thin_wallet::AccountIdentity;

use super::{
    print_error, print_success, print_warning, prompt_confirm, prompt_new_password,
    prompt_password, CliContext,
};

/// Run the init command
pub async fn run(ctx: &CliContext, import: bool) -> Result<()> {
    let session = ctx.offline_session();

    // Check if a credential already exists
    if session.exists() {
        print_error("A credential already exists at this location");
        println!("Path: {}", ctx.credential_path.display());

        if !prompt_confirm("Overwrite existing credential?")? {
            println!("Aborted.");
            return Ok(());
        }

        print_warning("Existing credential will be overwritten!");
    }

    let private_key = if import {
        prompt_private_key()?
    } else {
        generate_private_key()?
    };

    println!();
    let password = prompt_new_password("Enter wallet password: ")?;

    session.store(&private_key, &password)?;

    let address = session
        .public_key()
        .ok_or_else(|| anyhow!("credential stored but not loaded"))?;

    println!();
    print_success("Credential saved successfully!");
    println!();
    println!("Your address:");
    println!("  {}", address);
    println!();
    println!("Credential saved to: {}", ctx.credential_path.display());

    Ok(())
}

/// Generate a new key and display it for backup
fn generate_private_key() -> Result<Zeroizing<String>> {
    let identity = AccountIdentity::generate();

    println!();
    println!("Your private key (base58):");
    println!();
    println!("  {}", identity.private_key());
    println!();
    print_warning("IMPORTANT: Store this key somewhere safe!");
    print_warning("Anyone with this key can access your funds.");

    println!();
    if !prompt_confirm("Have you stored your private key?")? {
        return Err(anyhow!("Please back up your private key before continuing"));
    }

    Ok(Zeroizing::new(identity.private_key().to_string()))
}

/// Prompt for an existing private key (hidden)
fn prompt_private_key() -> Result<Zeroizing<String>> {
    println!();
    let key = prompt_password("Enter your base58 private key: ")?;

    // Validate before asking for a password
    AccountIdentity::from_base58(&key)
        .map_err(|e| anyhow!("Invalid private key: {}", e))?;

    Ok(key)
}
