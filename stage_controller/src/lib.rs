//! Motion service for a GRBL-driven microscope stage.
//!
//! All hardware access is serialized onto one worker thread
//! ([`motion_thread::MotionThread`]); callers talk to it through a
//! cloneable handle. The worker drives the controller through a
//! [`hal::MotionHal`] adapter that applies per-axis scaling, soft limits
//! and backlash compensation before anything reaches the wire.

pub mod config;
pub mod hal;
pub mod logging;
pub mod models;
pub mod motion_thread;

pub use config::{init_config, AxisConfig, StageConfig};
pub use hal::{MotionError, MotionHal};
pub use models::{CommandResponse, CommandResult, MotionCommand};
pub use motion_thread::{HalBuilder, MotionThread};
