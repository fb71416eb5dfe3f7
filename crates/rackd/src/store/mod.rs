//! External stores consumed by the maintenance loops

pub mod rows;
pub mod settings;

pub use rows::{format_timestamp, RowStore, SqliteRowStore};
pub use settings::{ConfigStore, Settings, SqliteConfigStore, StaticConfigStore};

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid SQL identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}
