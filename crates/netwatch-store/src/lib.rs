//! netwatch-store: persistence collaborators for the scan pipeline.
//!
//! The pipeline only ever talks to the [`DeviceStore`] and [`HistoryStore`]
//! traits. [`FileStore`] is the bundled backend: a single JSON document on
//! disk, or purely in memory for tests.

pub mod file;
pub mod store;

pub use file::FileStore;
pub use store::{DeviceStore, HistoryQuery, HistoryStore, StoreError};
