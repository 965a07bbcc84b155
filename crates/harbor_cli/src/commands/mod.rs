//! CLI command implementations.

pub mod evict;
pub mod inspect;
pub mod queue;
pub mod records;
pub mod sweep;

use harbor_core::{StoreConfig, FLAT_FILE, STRUCTURED_DIR};
use harbor_storage::{Clock, DurableStore, FlatBackend, StructuredBackend, SystemClock};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// A store opened from a directory, with its backends kept for reporting.
pub struct OpenedStore {
    /// The composed store.
    pub store: Arc<DurableStore>,
    /// The structured backend, if its directory exists.
    pub structured: Option<Arc<StructuredBackend>>,
    /// The flat backend.
    pub flat: Arc<FlatBackend>,
}

/// Opens the store under `dir` with the given configuration.
pub fn open_store(
    dir: &Path,
    config: &StoreConfig,
) -> Result<OpenedStore, Box<dyn std::error::Error>> {
    let structured_dir = dir.join(STRUCTURED_DIR);
    let flat_file = dir.join(FLAT_FILE);
    if !structured_dir.exists() && !flat_file.exists() {
        return Err(format!("No harbor store found at {:?}", dir).into());
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let structured = if structured_dir.exists() {
        Some(Arc::new(StructuredBackend::open(&structured_dir)?))
    } else {
        None
    };
    let flat = Arc::new(FlatBackend::open(&flat_file, Arc::clone(&clock))?);
    let store = Arc::new(config.assemble(structured.clone(), Arc::clone(&flat), clock));
    debug!(dir = %dir.display(), backend = %store.kind(), "opened store");

    Ok(OpenedStore {
        store,
        structured,
        flat,
    })
}

/// Formats a byte count for text output.
pub fn format_size(bytes: usize) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
