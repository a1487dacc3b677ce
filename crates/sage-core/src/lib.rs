//! # sage-core
//!
//! Core types, traits, and abstractions for sage-supervisor.
//!
//! This crate provides the change records and domain events shared by the
//! queue, persistence, and monitoring crates, along with the collaborator
//! traits they implement.

pub mod defaults;
pub mod error;
pub mod events;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use events::{ChangeEnvelope, EventBus};
pub use models::*;
pub use traits::*;

pub use bigdecimal::BigDecimal;
