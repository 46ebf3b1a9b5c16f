//! Minimal example: one user's vault across two sessions and a rotation.
//!
//! Uses the in-process remote and a file-backed local store.
//! Run with: `RUST_LOG=lockbox=debug cargo run --example session_demo`
//!
//! - First session: log in, add two secrets, reveal one
//! - Second session: restore from the Envelope without the Masterkey
//! - Rotate the Masterkey and read everything back

use std::sync::Arc;

use lockbox::sync::spawn;
use lockbox::{
    AuditAction, EntryKey, ExposeSecret, FileStore, Masterkey, MemoryRemote, SecretString, VaultConfig,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lockbox=info")))
        .init();

    // 1. Setup
    let remote = Arc::new(MemoryRemote::new());
    let dir = std::env::temp_dir().join("lockbox_demo_store");
    let store = Arc::new(FileStore::new(&dir)?);
    let config = VaultConfig::insecure_fast();
    let password = || SecretString::from("hunter2".to_string());

    // 2. First session
    let vault = spawn(config.clone(), remote.clone(), store.clone())?;
    vault.login("alice", password(), Masterkey::from("correct-horse")).await?;
    vault
        .add_secret("example.com", "alice", SecretString::from("p@ss!".to_string()))
        .await?;
    vault
        .add_secret("mail.example", "alice", SecretString::from("s3cret".to_string()))
        .await?;

    let key = EntryKey::new("example.com", "alice");
    if let Some(secret) = vault.reveal_secret(key.clone(), AuditAction::Copy).await?.done() {
        println!("{key}: {} characters", secret.expose_secret().len());
    }
    vault.logout().await?;

    // 3. Second session: the Envelope restores the Capability.
    let vault = spawn(config, remote.clone(), store.clone())?;
    let restored = vault.restore_session("alice", password()).await?;
    println!("restored without masterkey: {restored}");

    // 4. Rotate
    let report = vault
        .rotate_masterkey(Masterkey::from("correct-horse"), Masterkey::from("new-horse"))
        .await?;
    println!("re-encrypted {} entries", report.reencrypted);

    for entry in vault.state().entries() {
        let key = entry.key();
        if let Some(secret) = vault.reveal_secret(key.clone(), AuditAction::Decrypt).await?.done() {
            println!("  {key}: {} characters", secret.expose_secret().len());
        }
    }

    // 5. Audit window
    vault.refresh().await?;
    for record in vault.state().audit() {
        println!("  {:?} {}/{} @ {}", record.action, record.platform, record.login, record.timestamp);
    }
    vault.logout().await?;
    println!("local store at: {}", dir.display());

    Ok(())
}
