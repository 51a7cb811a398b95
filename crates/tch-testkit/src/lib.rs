//! Test support for the conversion pipeline.
//!
//! - [`InProcessOrderService`]: the server side without HTTP, with injectable faults
//! - [`TestDesk`]: coordinator + queue + renderer on temp files, restartable
//! - scripted layout engines and order fixtures

mod desk;
mod engines;
mod fixtures;
mod remote;

pub use desk::{EngineKind, TestDesk};
pub use engines::{fast_render_options, SilentEngine};
pub use fixtures::{intent_with_items, jade_vase_target, scarlett};
pub use remote::{FinalizeFault, FinalizeHold, InProcessOrderService};
