//! Order-conversion pipeline on the desk side.
//!
//! - [`order_store`]: typed orders and their stage lifecycle
//! - [`state`]: per-attempt state machine, progress events, failure taxonomy
//! - [`coordinator`]: Render → retry checkpoint → Upload → Server-Finalize
//!
//! Handler identity is an explicit argument on every pipeline call.

pub mod coordinator;
pub mod order_store;
pub mod state;

pub use coordinator::{ConversionCoordinator, ConversionOutcome, ResumeReport};
pub use order_store::{OrderStore, StageError};
pub use state::{ConversionError, ConversionEvent, ConversionState};
