//! Queue command implementation.

use super::open_store;
use harbor_core::{MutationOperation, MutationQueue, StoreConfig};
use std::path::Path;

/// Runs the queue command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let operations = pending(path)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&operations)?),
        _ => {
            if operations.is_empty() {
                println!("Queue is empty");
                return Ok(());
            }
            println!(
                "{:>6}  {:<8} {:<24} {:>8}  {:<8} LAST ERROR",
                "SEQ", "KIND", "ID", "ATTEMPTS", "STATE"
            );
            for op in &operations {
                println!(
                    "{:>6}  {:<8} {:<24} {:>8}  {:<8} {}",
                    op.seq,
                    op.kind,
                    op.id,
                    op.attempts,
                    if op.blocked { "blocked" } else { "pending" },
                    op.last_error.as_deref().unwrap_or("-")
                );
            }
        }
    }
    Ok(())
}

/// Returns the queued operations of the store under `path`, in order.
pub fn pending(path: &Path) -> Result<Vec<MutationOperation>, Box<dyn std::error::Error>> {
    let opened = open_store(path, &StoreConfig::new().dir(path))?;
    Ok(MutationQueue::load(opened.store)?.peek_all())
}
