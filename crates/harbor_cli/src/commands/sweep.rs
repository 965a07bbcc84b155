//! Sweep command implementation.

use super::open_store;
use harbor_core::{Clock, StoreConfig, TtlCache};
use std::path::Path;

/// Runs the sweep command, removing expired cache entries.
pub fn run(path: &Path, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    let opened = open_store(path, &StoreConfig::new().dir(path))?;
    let now = opened.store.clock().now_millis();
    let cache = TtlCache::new(opened.store);

    if dry_run {
        let expired = cache
            .entries()?
            .into_iter()
            .filter(|entry| entry.is_expired(now))
            .count();
        println!("{} expired cache entries (dry run, nothing removed)", expired);
        return Ok(());
    }

    let removed = cache.sweep_expired()?;
    println!("Removed {} expired cache entries", removed);
    Ok(())
}
