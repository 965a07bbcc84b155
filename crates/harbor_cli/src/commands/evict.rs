//! Evict command implementation.

use super::{format_size, open_store};
use harbor_core::StoreConfig;
use std::path::Path;
use std::time::Duration;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Runs the evict command over the flat backend.
///
/// Records and the mutation queue are never evicted.
pub fn run(path: &Path, days: u64) -> Result<(), Box<dyn std::error::Error>> {
    let config = StoreConfig::new().dir(path).eviction_age(Duration::from_secs(days.saturating_mul(SECS_PER_DAY)));
    let opened = open_store(path, &config)?;

    let before = opened.flat.bytes_used();
    let evicted = opened.store.evict_aged()?;
    let after = opened.flat.bytes_used();

    println!("Evicted {} flat entries older than {} day(s)", evicted, days);
    println!(
        "  Flat size: {} -> {}",
        format_size(before),
        format_size(after)
    );
    Ok(())
}
