//! C-side types of the hwc2_compat ABI
//!
//! Plain `repr(C)` values and constants shared with C callers. The functions
//! themselves live in [`crate::c_api`].

use std::os::raw::c_int;

/// Hardware composer display ID type
pub type Hwc2DisplayT = u64;

/// Hardware composer config ID type
pub type Hwc2ConfigT = u32;

/// Hardware composer error type
pub type Hwc2ErrorT = i32;

/// Android dataspace type
pub type AndroidDataspaceT = i32;

/// HWC2 error codes
pub const HWC2_ERROR_NONE: Hwc2ErrorT = 0;
pub const HWC2_ERROR_BAD_CONFIG: Hwc2ErrorT = 1;
pub const HWC2_ERROR_BAD_DISPLAY: Hwc2ErrorT = 2;
pub const HWC2_ERROR_BAD_LAYER: Hwc2ErrorT = 3;
pub const HWC2_ERROR_BAD_PARAMETER: Hwc2ErrorT = 4;
pub const HWC2_ERROR_HAS_CHANGES: Hwc2ErrorT = 5;
pub const HWC2_ERROR_NO_RESOURCES: Hwc2ErrorT = 6;
pub const HWC2_ERROR_NOT_VALIDATED: Hwc2ErrorT = 7;
pub const HWC2_ERROR_UNSUPPORTED: Hwc2ErrorT = 8;
pub const HWC2_ERROR_SEAMLESS_NOT_ALLOWED: Hwc2ErrorT = 9;
pub const HWC2_ERROR_SEAMLESS_NOT_POSSIBLE: Hwc2ErrorT = 10;

/// Power mode constants
pub const HWC2_POWER_MODE_ON: c_int = 2;

/// VSync constants
pub const HWC2_VSYNC_ENABLE: c_int = 1;
pub const HWC2_VSYNC_DISABLE: c_int = 2;

/// Composition type constants
pub const HWC2_COMPOSITION_DEVICE: c_int = 2;

/// Blend mode constants
pub const HWC2_BLEND_MODE_NONE: c_int = 1;
pub const HWC2_BLEND_MODE_PREMULTIPLIED: c_int = 2;

pub const HAL_DATASPACE_UNKNOWN: AndroidDataspaceT = 0;

/// Native handle type (opaque)
#[repr(C)]
pub struct NativeHandle {
    _data: [u8; 0],
}

/// buffer_handle_t is a pointer to a native handle
pub type BufferHandleT = *const NativeHandle;

/// HWC color structure
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwcColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

/// Display config handed out by `hwc2_compat_display_get_active_config`
#[repr(C)]
#[derive(Debug, Clone, PartialEq)]
pub struct HWC2DisplayConfig {
    pub id: Hwc2ConfigT,
    pub display: Hwc2DisplayT,
    pub width: i32,
    pub height: i32,
    pub vsync_period: i64,
    pub dpi_x: f32,
    pub dpi_y: f32,
}

/// HWC2 event listener structure
///
/// C callers usually embed this as the first member of a larger struct and
/// cast the `listener` pointer back in the callbacks.
#[repr(C)]
pub struct HWC2EventListener {
    pub on_vsync_received: Option<
        extern "C" fn(
            listener: *mut HWC2EventListener,
            sequence_id: i32,
            display: Hwc2DisplayT,
            timestamp: i64,
        ),
    >,
    pub on_hotplug_received: Option<
        extern "C" fn(
            listener: *mut HWC2EventListener,
            sequence_id: i32,
            display: Hwc2DisplayT,
            connected: bool,
            primary_display: bool,
        ),
    >,
    pub on_refresh_received: Option<
        extern "C" fn(listener: *mut HWC2EventListener, sequence_id: i32, display: Hwc2DisplayT),
    >,
}
