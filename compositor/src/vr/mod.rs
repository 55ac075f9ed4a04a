//! VR subsystem — layer negotiation, shared render configuration and the
//! immersive session controller.
//!
//! Provides:
//! - `layer_config`: capability negotiation for the compositor layer
//! - `render_config`: lock-free configuration shared with the render thread
//! - `immersion`: session state machine driven by UI toggles
//! - `space_manager`: headless open/dismiss service
//! - `OpenXrCapabilityProbe`: runtime capability query (gated behind `openxr` feature)

pub mod frame_timing;
pub mod immersion;
pub mod layer_config;
pub mod render_config;
pub mod space_manager;

#[cfg(feature = "openxr")]
pub mod openxr_probe;

#[cfg(feature = "openxr")]
pub use openxr_probe::OpenXrCapabilityProbe;

#[cfg(not(feature = "openxr"))]
pub mod stub;

#[cfg(not(feature = "openxr"))]
pub use stub::OpenXrCapabilityProbe;
