//! Recovery list/show command handler.

use anyhow::{Context, Result};

use parley::config::Config;
use parley::recovery::{JsonFileStore, RecoveryStore};

use super::RecoveryAction;

pub(crate) async fn cmd_recovery(config: &Config, action: RecoveryAction) -> Result<()> {
    let dir = config.recovery_dir();
    let store = JsonFileStore::new(&dir)
        .with_context(|| format!("Failed to open recovery store at {}", dir.display()))?;

    match action {
        RecoveryAction::List => {
            let ids = store.list().await?;
            if ids.is_empty() {
                println!("No recovery records in {}", dir.display());
                return Ok(());
            }
            for id in &ids {
                match store.load(id).await {
                    Ok(Some(record)) => println!(
                        "  {:<38} {:<15} {}",
                        id,
                        record.reason,
                        record.saved_at.format("%Y-%m-%d %H:%M:%S UTC")
                    ),
                    Ok(None) => {}
                    Err(e) => println!("  {:<38} unreadable: {}", id, e),
                }
            }
            println!();
            println!("{} record(s).", ids.len());
        }
        RecoveryAction::Show { session_id } => match store.load(&session_id).await? {
            Some(record) => {
                println!("{}", serde_json::to_string_pretty(&record)?);
                println!();
                println!("Seed message:");
                println!("{}", record.seed_message());
            }
            None => {
                println!("No recovery record for '{}'.", session_id);
                println!();
                println!("Try: parley recovery list");
            }
        },
    }
    Ok(())
}
