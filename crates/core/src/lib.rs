//! Duet Core Library
//!
//! Conversation models, the fetch/local merge, invariants and settings
//! shared by the Duet client, host and terminal app.

pub mod error;
pub mod invariants;
pub mod merge;
pub mod models;
pub mod settings;

pub use error::{Error, Result};
pub use merge::{merge_fetched, reconciles};
pub use models::*;
pub use settings::{ClientSettings, ServerSettings, Settings, SyncSettings, UserRecord};
