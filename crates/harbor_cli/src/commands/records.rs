//! Records command implementation.

use super::open_store;
use harbor_core::{Record, RecordFilter, RecordStatus, RecordStore, StoreConfig};
use std::path::Path;

/// Runs the records command.
pub fn run(
    path: &Path,
    status: Option<&str>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let records = list(path, status)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&records)?),
        _ => {
            println!("{:<24} {:<14} {:<8} UPDATED", "ID", "STATUS", "OFFLINE");
            for record in &records {
                println!(
                    "{:<24} {:<14} {:<8} {}",
                    record.id, record.status, record.offline, record.updated_at
                );
            }
            println!();
            println!("{} record(s)", records.len());
        }
    }
    Ok(())
}

/// Lists records, optionally only those with `status`.
///
/// A status filter is answered from the status index.
pub fn list(path: &Path, status: Option<&str>) -> Result<Vec<Record>, Box<dyn std::error::Error>> {
    let opened = open_store(path, &StoreConfig::new().dir(path))?;
    let records = RecordStore::load(opened.store)?;
    match status {
        Some(name) => {
            let status =
                RecordStatus::parse(name).ok_or_else(|| format!("Unknown status {:?}", name))?;
            Ok(records.query_status(status)?)
        }
        None => Ok(records.list(&RecordFilter::new().include_deleted())),
    }
}
