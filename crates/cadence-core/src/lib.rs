//! # Cadence Core
//!
//! Shared vocabulary for the routine scheduling core: the domain model,
//! the error taxonomy, configuration, and the two collaborator traits
//! (durable store, notification sender) the scheduler is written against.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::CadenceConfig;
pub use error::{CadenceError, Result};
pub use traits::{DurableStore, NotificationSender, ReceiptWrite, UpsertOutcome};
