//! Testing utilities for crabstream
//!
//! A scriptable capability provider and synthetic frames, so the full
//! lifecycle can be exercised without camera hardware.

pub mod provider;
pub mod synthetic_data;

pub use provider::{AcceptRule, SyntheticProvider, SyntheticSession};
pub use synthetic_data::{laptop_devices, synthetic_video_frame, video_devices};
