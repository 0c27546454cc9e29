//! Persisted documents of a folio project: the image catalog, the usage ledger,
//! settings, the prompt table, generation receipts and the activity log.

pub mod activity;
mod atomic;
pub mod catalog;
mod error;
pub mod prompts;
pub mod receipts;
pub mod settings;
pub mod usage;

pub use atomic::{read_json, write_atomic, write_json_atomic};
pub use error::{StoreError, StoreResult};
