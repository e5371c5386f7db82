//! Time-bounded card authorization sessions.
//!
//! Domain types, the session state machine, provider event planning, and the
//! store/provider/timer traits the engine is built on.

pub mod clock;
pub mod db;
pub mod error;
pub mod events;
pub mod memory;
pub mod provider;
pub mod state;
pub mod store;
pub mod test_helpers;
pub mod timer;
pub mod types;
