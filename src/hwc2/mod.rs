//! HWC2 object model
//!
//! [`Device`] owns the [`Display`]s; each display tracks its [`Layer`]s by weak
//! handle. Layers keep a weak link back to their display and refuse to touch
//! the server once it is gone.

pub mod device;
pub mod display;
pub mod layer;

pub use device::Device;
pub use display::{Config, ConfigBuilder, Display};
pub use layer::Layer;
