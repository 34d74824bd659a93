//! C API matching hwc2_compatibility_layer.h
//!
//! Every `hwc2_compat_*` handle is a boxed Rust object owning a reference to
//! the shared device, display or layer. Errors come back as HWC2 codes; see
//! [`crate::ffi`] for the constants.
//!
//! The transport behind `hwc2_compat_device_new` is whatever was handed to
//! [`hwc2_compat_register_service_manager`] beforehand.

#![allow(non_camel_case_types)]

use crate::composer::{Composer, ComposerCallback, ServiceManager};
use crate::config::{self, ShimConfig};
use crate::error::to_code;
use crate::ffi::*;
use crate::hal::{
    BlendMode, BufferHandle, ChangeCounts, Color, Composition, Dataspace, DisplayId, FRect,
    LayerId, PowerMode, PresentOrValidate, Rect, Transform, Vsync,
};
use crate::hwc2::{Device, Display, Layer};
use std::collections::HashMap;
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd};
use std::os::raw::c_int;
use std::ptr;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

static SERVICE_MANAGER: Mutex<Option<Arc<dyn ServiceManager>>> = Mutex::new(None);

/// Opaque hwc2_compat_device_t
pub struct hwc2_compat_device {
    inner: Arc<Device>,
}

/// Opaque hwc2_compat_display_t
pub struct hwc2_compat_display {
    inner: Arc<Display>,
}

/// Opaque hwc2_compat_layer_t
pub struct hwc2_compat_layer {
    inner: Arc<Layer>,
}

/// Opaque hwc2_compat_out_fences_t
pub struct hwc2_compat_out_fences {
    fences: HashMap<LayerId, OwnedFd>,
}

pub type hwc2_compat_device_t = hwc2_compat_device;
pub type hwc2_compat_display_t = hwc2_compat_display;
pub type hwc2_compat_layer_t = hwc2_compat_layer;
pub type hwc2_compat_out_fences_t = hwc2_compat_out_fences;

/// Set the service registry `hwc2_compat_device_new` connects through.
/// A later registration replaces the earlier one.
pub fn hwc2_compat_register_service_manager(manager: Arc<dyn ServiceManager>) {
    *SERVICE_MANAGER.lock().unwrap_or_else(PoisonError::into_inner) = Some(manager);
}

fn service_manager() -> Option<Arc<dyn ServiceManager>> {
    SERVICE_MANAGER
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Install the logger configured by `HWC2_COMPAT_LOG`
#[no_mangle]
pub extern "C" fn hwc2_compat_init_logging() {
    config::init_logging(&ShimConfig::from_env().log_filter);
}

// =============================================================================
// Listener bridge
// =============================================================================

/// Forwards composer events to a C `HWC2EventListener`
struct ListenerBridge {
    listener: *mut HWC2EventListener,
    sequence_id: i32,
    /// First display reported connected
    primary: Mutex<Option<DisplayId>>,
}

// SAFETY: the C caller keeps the listener alive and callable from any thread
// for as long as the device exists
unsafe impl Send for ListenerBridge {}
unsafe impl Sync for ListenerBridge {}

impl ComposerCallback for ListenerBridge {
    fn on_hotplug(&self, display_id: DisplayId, connected: bool) {
        let primary = {
            let mut primary = self.primary.lock().unwrap_or_else(PoisonError::into_inner);
            if connected && primary.is_none() {
                *primary = Some(display_id);
            }
            *primary == Some(display_id)
        };
        debug!("hotplug display={} connected={} primary={}", display_id, connected, primary);
        // SAFETY: see the Send/Sync impls
        if let Some(cb) = unsafe { (*self.listener).on_hotplug_received } {
            cb(self.listener, self.sequence_id, display_id, connected, primary);
        }
    }

    fn on_refresh(&self, display: DisplayId) {
        if let Some(cb) = unsafe { (*self.listener).on_refresh_received } {
            cb(self.listener, self.sequence_id, display);
        }
    }

    fn on_vsync(&self, display: DisplayId, timestamp: i64, _vsync_period_nanos: Option<u32>) {
        if let Some(cb) = unsafe { (*self.listener).on_vsync_received } {
            cb(self.listener, self.sequence_id, display, timestamp);
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn status(result: &crate::Result<()>) -> Hwc2ErrorT {
    to_code(result)
}

/// Validate outcome as the C ABI reports it: counts on success, and
/// HAS_CHANGES when there is anything to accept
unsafe fn validate_status(
    result: crate::Result<ChangeCounts>,
    out_num_types: *mut u32,
    out_num_requests: *mut u32,
) -> Hwc2ErrorT {
    match result {
        Ok(counts) => {
            *out_num_types = counts.num_types;
            *out_num_requests = counts.num_requests;
            if counts.has_changes() {
                HWC2_ERROR_HAS_CHANGES
            } else {
                HWC2_ERROR_NONE
            }
        }
        Err(e) => e.code(),
    }
}

fn buffer_handle(buffer: BufferHandleT) -> Option<BufferHandle> {
    if buffer.is_null() {
        None
    } else {
        Some(BufferHandle(buffer as usize))
    }
}

/// Take ownership of a fence descriptor passed in by C. Negative means none.
unsafe fn adopt_fence(fd: c_int) -> Option<OwnedFd> {
    if fd < 0 {
        None
    } else {
        Some(OwnedFd::from_raw_fd(fd))
    }
}

fn release_fence(fence: Option<OwnedFd>) -> i32 {
    fence.map(IntoRawFd::into_raw_fd).unwrap_or(-1)
}

// =============================================================================
// Device
// =============================================================================

/// Connect to the composer and create a device.
///
/// Returns null when no service manager has been registered. Failing to
/// reach the composer service is fatal.
#[no_mangle]
pub extern "C" fn hwc2_compat_device_new(use_vr_composer: bool) -> *mut hwc2_compat_device_t {
    let config = ShimConfig::from_env();
    config::init_logging(&config.log_filter);

    let Some(manager) = service_manager() else {
        error!("hwc2_compat_device_new: no service manager registered");
        return ptr::null_mut();
    };

    let service_name = config.service_for(use_vr_composer);
    info!("hwc2_compat_device_new: connecting to composer '{}'", service_name);
    let composer = Composer::create(service_name, manager.as_ref());
    let device = Box::new(hwc2_compat_device {
        inner: Arc::new(Device::new(composer)),
    });
    Box::into_raw(device)
}

/// Destroy a device and every display it still tracks
#[no_mangle]
pub unsafe extern "C" fn hwc2_compat_device_destroy(device: *mut hwc2_compat_device_t) {
    if device.is_null() {
        return;
    }
    debug!("hwc2_compat_device_destroy");
    let _ = Box::from_raw(device);
}

#[no_mangle]
pub unsafe extern "C" fn hwc2_compat_device_register_callback(
    device: *mut hwc2_compat_device_t,
    listener: *mut HWC2EventListener,
    composer_sequence_id: c_int,
) {
    if device.is_null() || listener.is_null() {
        warn!("hwc2_compat_device_register_callback: null argument");
        return;
    }
    let bridge = Arc::new(ListenerBridge {
        listener,
        sequence_id: composer_sequence_id,
        primary: Mutex::new(None),
    });
    (*device).inner.register_callback(bridge);
}

#[no_mangle]
pub unsafe extern "C" fn hwc2_compat_device_on_hotplug(
    device: *mut hwc2_compat_device_t,
    display_id: Hwc2DisplayT,
    connected: bool,
) {
    if device.is_null() {
        return;
    }
    (*device).inner.on_hotplug(display_id, connected);
}

/// Look up a display. The returned handle must be released with
/// `hwc2_compat_device_destroy_display`.
#[no_mangle]
pub unsafe extern "C" fn hwc2_compat_device_get_display_by_id(
    device: *mut hwc2_compat_device_t,
    id: Hwc2DisplayT,
) -> *mut hwc2_compat_display_t {
    if device.is_null() {
        return ptr::null_mut();
    }
    match (*device).inner.get_display_by_id(id) {
        Some(display) => Box::into_raw(Box::new(hwc2_compat_display { inner: display })),
        None => ptr::null_mut(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn hwc2_compat_device_destroy_display(
    device: *mut hwc2_compat_device_t,
    display: *mut hwc2_compat_display_t,
) {
    if display.is_null() {
        return;
    }
    let display = Box::from_raw(display);
    if !device.is_null() {
        (*device).inner.destroy_display(display.inner.id());
    }
}

// =============================================================================
// Display
// =============================================================================

/// Active config, allocated with `malloc` for the caller to `free`. Null
/// when no config is active or the query fails.
#[no_mangle]
pub unsafe extern "C" fn hwc2_compat_display_get_active_config(
    display: *mut hwc2_compat_display_t,
) -> *mut HWC2DisplayConfig {
    if display.is_null() {
        return ptr::null_mut();
    }
    let display_ref = &(*display).inner;
    let config = match display_ref.get_active_config() {
        Ok(Some(config)) => config,
        Ok(None) => {
            warn!("getActiveConfig: no config active on display {}", display_ref.id());
            return ptr::null_mut();
        }
        Err(e) => {
            error!("getActiveConfig failed for display {}: {}", display_ref.id(), e);
            return ptr::null_mut();
        }
    };

    let out = libc::malloc(std::mem::size_of::<HWC2DisplayConfig>()) as *mut HWC2DisplayConfig;
    if out.is_null() {
        return ptr::null_mut();
    }
    out.write(HWC2DisplayConfig {
        id: config.id(),
        display: config.display_id(),
        width: config.width(),
        height: config.height(),
        vsync_period: config.vsync_period() as i64,
        dpi_x: config.dpi_x(),
        dpi_y: config.dpi_y(),
    });
    out
}

#[no_mangle]
pub unsafe extern "C" fn hwc2_compat_display_accept_changes(
    display: *mut hwc2_compat_display_t,
) -> Hwc2ErrorT {
    if display.is_null() {
        return HWC2_ERROR_BAD_DISPLAY;
    }
    status(&(*display).inner.accept_changes())
}

#[no_mangle]
pub unsafe extern "C" fn hwc2_compat_display_create_layer(
    display: *mut hwc2_compat_display_t,
) -> *mut hwc2_compat_layer_t {
    if display.is_null() {
        return ptr::null_mut();
    }
    match (*display).inner.create_layer() {
        Ok(layer) => Box::into_raw(Box::new(hwc2_compat_layer { inner: layer })),
        Err(e) => {
            error!("createLayer failed: {}", e);
            ptr::null_mut()
        }
    }
}

/// Stop tracking `layer` and release the handle. The server-side layer is
/// destroyed once nothing else holds it.
#[no_mangle]
pub unsafe extern "C" fn hwc2_compat_display_destroy_layer(
    display: *mut hwc2_compat_display_t,
    layer: *mut hwc2_compat_layer_t,
) {
    if layer.is_null() {
        return;
    }
    let layer = Box::from_raw(layer);
    if !display.is_null() {
        (*display).inner.destroy_layer(&layer.inner);
    }
}

#[no_mangle]
pub unsafe extern "C" fn hwc2_compat_display_get_release_fences(
    display: *mut hwc2_compat_display_t,
    out_fences: *mut *mut hwc2_compat_out_fences_t,
) -> Hwc2ErrorT {
    if display.is_null() {
        return HWC2_ERROR_BAD_DISPLAY;
    }
    if out_fences.is_null() {
        return HWC2_ERROR_BAD_PARAMETER;
    }
    match (*display).inner.get_release_fences() {
        Ok(fences) => {
            *out_fences = Box::into_raw(Box::new(hwc2_compat_out_fences { fences }));
            HWC2_ERROR_NONE
        }
        Err(e) => e.code(),
    }
}

/// Present the validated frame. `out_present_fence` receives an owned fd or
/// -1.
#[no_mangle]
pub unsafe extern "C" fn hwc2_compat_display_present(
    display: *mut hwc2_compat_display_t,
    out_present_fence: *mut i32,
) -> Hwc2ErrorT {
    if display.is_null() {
        return HWC2_ERROR_BAD_DISPLAY;
    }
    if out_present_fence.is_null() {
        return HWC2_ERROR_BAD_PARAMETER;
    }
    match (*display).inner.present() {
        Ok(fence) => {
            *out_present_fence = release_fence(fence);
            HWC2_ERROR_NONE
        }
        Err(e) => {
            *out_present_fence = -1;
            e.code()
        }
    }
}

/// Set the client target. Ownership of `acquire_fence_fd` passes to the
/// callee. The target always goes to slot 0 with an unknown dataspace.
#[no_mangle]
pub unsafe extern "C" fn hwc2_compat_display_set_client_target(
    display: *mut hwc2_compat_display_t,
    slot: u32,
    buffer: BufferHandleT,
    acquire_fence_fd: i32,
    dataspace: AndroidDataspaceT,
) -> Hwc2ErrorT {
    let fence = adopt_fence(acquire_fence_fd);
    if display.is_null() {
        return HWC2_ERROR_BAD_DISPLAY;
    }
    debug!("setClientTarget(slot={}, dataspace={})", slot, dataspace);
    status(&(*display).inner.set_client_target(
        0,
        buffer_handle(buffer),
        fence,
        Dataspace::UNKNOWN,
    ))
}

#[no_mangle]
pub unsafe extern "C" fn hwc2_compat_display_set_power_mode(
    display: *mut hwc2_compat_display_t,
    mode: c_int,
) -> Hwc2ErrorT {
    if display.is_null() {
        return HWC2_ERROR_BAD_DISPLAY;
    }
    let Some(mode) = PowerMode::from_raw(mode) else {
        return HWC2_ERROR_BAD_PARAMETER;
    };
    status(&(*display).inner.set_power_mode(mode))
}

#[no_mangle]
pub unsafe extern "C" fn hwc2_compat_display_set_vsync_enabled(
    display: *mut hwc2_compat_display_t,
    enabled: c_int,
) -> Hwc2ErrorT {
    if display.is_null() {
        return HWC2_ERROR_BAD_DISPLAY;
    }
    let Some(enabled) = Vsync::from_raw(enabled) else {
        return HWC2_ERROR_BAD_PARAMETER;
    };
    status(&(*display).inner.set_vsync_enabled(enabled))
}

/// Validate the queued frame. Returns HAS_CHANGES when the counts are
/// non-zero.
#[no_mangle]
pub unsafe extern "C" fn hwc2_compat_display_validate(
    display: *mut hwc2_compat_display_t,
    out_num_types: *mut u32,
    out_num_requests: *mut u32,
) -> Hwc2ErrorT {
    if display.is_null() {
        return HWC2_ERROR_BAD_DISPLAY;
    }
    if out_num_types.is_null() || out_num_requests.is_null() {
        return HWC2_ERROR_BAD_PARAMETER;
    }
    validate_status((*display).inner.validate(0), out_num_types, out_num_requests)
}

/// Present, or validate if the server cannot present directly.
/// `out_state` is 1 when presented (and `out_present_fence` is set) and 0
/// when validated (and the counts are set).
#[no_mangle]
pub unsafe extern "C" fn hwc2_compat_display_present_or_validate(
    display: *mut hwc2_compat_display_t,
    out_num_types: *mut u32,
    out_num_requests: *mut u32,
    out_present_fence: *mut i32,
    out_state: *mut u32,
) -> Hwc2ErrorT {
    if display.is_null() {
        return HWC2_ERROR_BAD_DISPLAY;
    }
    if out_num_types.is_null()
        || out_num_requests.is_null()
        || out_present_fence.is_null()
        || out_state.is_null()
    {
        return HWC2_ERROR_BAD_PARAMETER;
    }

    *out_present_fence = -1;
    match (*display).inner.present_or_validate(0) {
        Ok(outcome) => {
            *out_state = outcome.state();
            match outcome {
                PresentOrValidate::Presented(fence) => {
                    *out_present_fence = release_fence(fence);
                    HWC2_ERROR_NONE
                }
                PresentOrValidate::Validated(counts) => {
                    validate_status(Ok(counts), out_num_types, out_num_requests)
                }
            }
        }
        Err(e) => e.code(),
    }
}

// =============================================================================
// Layer
// =============================================================================

/// Bind `buffer` to the layer. Ownership of `acquire_fence_fd` passes to the
/// callee. Buffers always go to slot 0.
#[no_mangle]
pub unsafe extern "C" fn hwc2_compat_layer_set_buffer(
    layer: *mut hwc2_compat_layer_t,
    slot: u32,
    buffer: BufferHandleT,
    acquire_fence_fd: i32,
) -> Hwc2ErrorT {
    let fence = adopt_fence(acquire_fence_fd);
    if layer.is_null() {
        return HWC2_ERROR_BAD_LAYER;
    }
    let Some(buffer) = buffer_handle(buffer) else {
        return HWC2_ERROR_BAD_PARAMETER;
    };
    debug!("setBuffer(slot={})", slot);
    status(&(*layer).inner.set_buffer(0, buffer, fence))
}

#[no_mangle]
pub unsafe extern "C" fn hwc2_compat_layer_set_blend_mode(
    layer: *mut hwc2_compat_layer_t,
    mode: c_int,
) -> Hwc2ErrorT {
    if layer.is_null() {
        return HWC2_ERROR_BAD_LAYER;
    }
    let Some(mode) = BlendMode::from_raw(mode) else {
        return HWC2_ERROR_BAD_PARAMETER;
    };
    status(&(*layer).inner.set_blend_mode(mode))
}

#[no_mangle]
pub unsafe extern "C" fn hwc2_compat_layer_set_color(
    layer: *mut hwc2_compat_layer_t,
    color: HwcColor,
) -> Hwc2ErrorT {
    if layer.is_null() {
        return HWC2_ERROR_BAD_LAYER;
    }
    let color = Color::from_rgba8(color.r, color.g, color.b, color.a);
    status(&(*layer).inner.set_color(color))
}

#[no_mangle]
pub unsafe extern "C" fn hwc2_compat_layer_set_composition_type(
    layer: *mut hwc2_compat_layer_t,
    composition: c_int,
) -> Hwc2ErrorT {
    if layer.is_null() {
        return HWC2_ERROR_BAD_LAYER;
    }
    let Some(composition) = Composition::from_raw(composition) else {
        return HWC2_ERROR_BAD_PARAMETER;
    };
    status(&(*layer).inner.set_composition_type(composition))
}

#[no_mangle]
pub unsafe extern "C" fn hwc2_compat_layer_set_dataspace(
    layer: *mut hwc2_compat_layer_t,
    dataspace: AndroidDataspaceT,
) -> Hwc2ErrorT {
    if layer.is_null() {
        return HWC2_ERROR_BAD_LAYER;
    }
    status(&(*layer).inner.set_dataspace(Dataspace(dataspace)))
}

#[no_mangle]
pub unsafe extern "C" fn hwc2_compat_layer_set_display_frame(
    layer: *mut hwc2_compat_layer_t,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
) -> Hwc2ErrorT {
    if layer.is_null() {
        return HWC2_ERROR_BAD_LAYER;
    }
    status(&(*layer).inner.set_display_frame(&Rect::new(left, top, right, bottom)))
}

#[no_mangle]
pub unsafe extern "C" fn hwc2_compat_layer_set_plane_alpha(
    layer: *mut hwc2_compat_layer_t,
    alpha: f32,
) -> Hwc2ErrorT {
    if layer.is_null() {
        return HWC2_ERROR_BAD_LAYER;
    }
    status(&(*layer).inner.set_plane_alpha(alpha))
}

#[no_mangle]
pub unsafe extern "C" fn hwc2_compat_layer_set_sideband_stream(
    layer: *mut hwc2_compat_layer_t,
    stream: BufferHandleT,
) -> Hwc2ErrorT {
    if layer.is_null() {
        return HWC2_ERROR_BAD_LAYER;
    }
    let Some(stream) = buffer_handle(stream) else {
        return HWC2_ERROR_BAD_PARAMETER;
    };
    status(&(*layer).inner.set_sideband_stream(stream))
}

#[no_mangle]
pub unsafe extern "C" fn hwc2_compat_layer_set_source_crop(
    layer: *mut hwc2_compat_layer_t,
    left: f32,
    top: f32,
    right: f32,
    bottom: f32,
) -> Hwc2ErrorT {
    if layer.is_null() {
        return HWC2_ERROR_BAD_LAYER;
    }
    let crop = FRect { left, top, right, bottom };
    status(&(*layer).inner.set_source_crop(&crop))
}

#[no_mangle]
pub unsafe extern "C" fn hwc2_compat_layer_set_transform(
    layer: *mut hwc2_compat_layer_t,
    transform: c_int,
) -> Hwc2ErrorT {
    if layer.is_null() {
        return HWC2_ERROR_BAD_LAYER;
    }
    status(&(*layer).inner.set_transform(Transform(transform)))
}

/// Replace the visible region with the single rectangle given
#[no_mangle]
pub unsafe extern "C" fn hwc2_compat_layer_set_visible_region(
    layer: *mut hwc2_compat_layer_t,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
) -> Hwc2ErrorT {
    if layer.is_null() {
        return HWC2_ERROR_BAD_LAYER;
    }
    status(&(*layer).inner.set_visible_region(&[Rect::new(left, top, right, bottom)]))
}

// =============================================================================
// Release fences
// =============================================================================

/// Duplicate of the release fence for `layer`, or -1. The caller owns the
/// returned fd.
#[no_mangle]
pub unsafe extern "C" fn hwc2_compat_out_fences_get_fence(
    fences: *mut hwc2_compat_out_fences_t,
    layer: *mut hwc2_compat_layer_t,
) -> i32 {
    if fences.is_null() || layer.is_null() {
        return -1;
    }
    let id = (*layer).inner.id();
    match (*fences).fences.get(&id).map(OwnedFd::try_clone) {
        Some(Ok(fd)) => fd.into_raw_fd(),
        Some(Err(e)) => {
            error!("failed to dup release fence for layer {}: {}", id, e);
            -1
        }
        None => -1,
    }
}

#[no_mangle]
pub unsafe extern "C" fn hwc2_compat_out_fences_destroy(fences: *mut hwc2_compat_out_fences_t) {
    if fences.is_null() {
        return;
    }
    let _ = Box::from_raw(fences);
}
