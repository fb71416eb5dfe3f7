//! Shared vocabulary for the rack maintenance daemon and its readers.

pub mod packaging;
pub mod paths;
pub mod service_state;
pub mod state_files;

pub use packaging::PackagingMode;
pub use service_state::{ExpectedState, ObservedState, ServiceState, StatusInfo, StatusKind};
