//! Backend implementations for the render module
//!
//! Only the headless recording backend ships with the crate; hardware
//! backends implement [`GraphicsDevice`](crate::render::api::GraphicsDevice)
//! outside of it.

/// Headless backend that records every call
pub mod recording;

pub use recording::{DeviceCall, RecordingDevice, RecordingFactory};
