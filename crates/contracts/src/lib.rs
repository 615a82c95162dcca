//! # Contracts
//!
//! Shared interface contracts: the data structures and traits exchanged
//! between the detector, the measurement channel and the sync engine.
//! Every other crate depends on this one; the reverse is prohibited.
//!
//! ## Time Model
//! - Sample and command timestamps are wall-clock seconds since the Unix epoch (f64)
//! - Liveness bookkeeping inside the engine uses monotonic `Instant`s
//!
//! ## Sign Convention
//! - Positive drift means the node's audible output trails the reference
//! - Positive offset means the node delays its playback more

mod audio;
mod command;
mod config;
mod device;
mod device_id;
mod drift;
mod error;
mod group;

pub use audio::*;
pub use command::*;
pub use config::*;
pub use device::*;
pub use device_id::{is_valid_segment, DeviceId, BROADCAST_SEGMENT};
pub use drift::*;
pub use error::*;
pub use group::*;
