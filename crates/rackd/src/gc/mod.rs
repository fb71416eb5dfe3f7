//! Garbage collectors for expired rows and unreferenced boot resources

pub mod rows;
pub mod storage;

pub use rows::RowCollector;
pub use storage::{link_into_snapshot, snapshot_name, DirRemover, GcReport, StorageCollector};

use std::path::PathBuf;

use crate::store::StoreError;

/// Collector errors
#[derive(Debug, thiserror::Error)]
pub enum GcError {
    #[error("storage root {path} is not a readable directory")]
    StorageRoot { path: PathBuf },

    #[error("row store: {0}")]
    Store(#[from] StoreError),
}
