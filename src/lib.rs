//! HWC2 compatibility shim for Android hardware composers
//!
//! This library exposes the small `hwc2_compat_*` C interface used by
//! Halium/Droidian compositors and drives whichever composer generation the
//! device ships: the legacy command-queue HAL (2.1 to 2.4) or the structured
//! RPC interface.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Compositor (C, via hwc2_compat_*)              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │  hwc2::Device ── hwc2::Display ── hwc2::Layer               │
//! │  (object model, state caching, capability gating)           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Composer facade                         │
//! │  ┌──────────────────────────┐  ┌──────────────────────────┐ │
//! │  │ legacy                   │  │ structured               │ │
//! │  │ word stream + queues     │  │ typed command batches    │ │
//! │  └──────────────────────────┘  └──────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                    ServiceManager (platform RPC)
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use hwc2_compat::{Composer, Device};
//!
//! let composer = Composer::create("default", &service_manager);
//! let device = Device::new(composer);
//! device.on_hotplug(0, true);
//!
//! let display = device.get_display_by_id(0).unwrap();
//! let layer = display.create_layer()?;
//! layer.set_plane_alpha(1.0)?;
//! display.validate(0)?;
//! let fence = display.present()?;
//! ```

pub mod c_api;
pub mod composer;
pub mod config;
pub mod error;
pub mod ffi;
pub mod hal;
pub mod hwc2;
pub mod legacy;
pub mod loopback;
pub mod structured;

pub use c_api::hwc2_compat_register_service_manager;
pub use composer::{Composer, ComposerCallback, ServiceManager};
pub use config::ShimConfig;
pub use error::Error;
pub use hwc2::{Config, Device, Display, Layer};

/// Result type for this crate
pub type Result<T> = std::result::Result<T, Error>;
