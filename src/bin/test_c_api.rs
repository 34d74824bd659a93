//! Test binary for the C API
//!
//! Walks the hwc2_compat_* functions the way a C compositor would, against a
//! loopback composer registered as the service manager.

use hwc2_compat::c_api::*;
use hwc2_compat::ffi::*;
use hwc2_compat::legacy::LegacyVersion;
use hwc2_compat::loopback::{LoopbackComposer, LoopbackDisplay};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

/// Listener with the C struct first so callbacks can cast back
#[repr(C)]
struct DemoListener {
    base: HWC2EventListener,
    device: AtomicPtr<hwc2_compat_device_t>,
    vsyncs: AtomicUsize,
}

extern "C" fn on_vsync(listener: *mut HWC2EventListener, _seq: i32, display: Hwc2DisplayT, timestamp: i64) {
    let this = unsafe { &*(listener as *const DemoListener) };
    this.vsyncs.fetch_add(1, Ordering::SeqCst);
    println!("  vsync display={} ts={}", display, timestamp);
}

extern "C" fn on_hotplug(
    listener: *mut HWC2EventListener,
    _seq: i32,
    display: Hwc2DisplayT,
    connected: bool,
    primary: bool,
) {
    let this = unsafe { &*(listener as *const DemoListener) };
    println!("  hotplug display={} connected={} primary={}", display, connected, primary);
    unsafe { hwc2_compat_device_on_hotplug(this.device.load(Ordering::SeqCst), display, connected) };
}

extern "C" fn on_refresh(_listener: *mut HWC2EventListener, _seq: i32, display: Hwc2DisplayT) {
    println!("  refresh display={}", display);
}

fn main() {
    hwc2_compat_init_logging();

    println!("=== C API Compatibility Test ===\n");

    let server = LoopbackComposer::legacy(LegacyVersion::V2_3);
    server.add_display(LoopbackDisplay::physical(0, 720, 1440));
    hwc2_compat_register_service_manager(Arc::new(server.clone()));

    // Test 1: device
    println!("--- Test 1: Create device ---");
    let device = hwc2_compat_device_new(false);
    if device.is_null() {
        println!("  FAILED: hwc2_compat_device_new returned NULL");
        return;
    }
    println!("  OK: device created");

    // Test 2: listener and hotplug
    println!("\n--- Test 2: Register listener ---");
    let mut listener = Box::new(DemoListener {
        base: HWC2EventListener {
            on_vsync_received: Some(on_vsync),
            on_hotplug_received: Some(on_hotplug),
            on_refresh_received: Some(on_refresh),
        },
        device: AtomicPtr::new(device),
        vsyncs: AtomicUsize::new(0),
    });
    unsafe {
        hwc2_compat_device_register_callback(device, &mut listener.base, 0);
    }
    server.hotplug(0, true);

    let display = unsafe { hwc2_compat_device_get_display_by_id(device, 0) };
    if display.is_null() {
        println!("  FAILED: display 0 not found after hotplug");
        return;
    }
    println!("  OK: display 0 connected");

    // Test 3: active config
    println!("\n--- Test 3: Active config ---");
    unsafe {
        let config = hwc2_compat_display_get_active_config(display);
        if config.is_null() {
            println!("  FAILED: no active config");
        } else {
            let c = &*config;
            println!(
                "  OK: config {} {}x{} vsync={}ns dpi={}x{}",
                c.id, c.width, c.height, c.vsync_period, c.dpi_x, c.dpi_y
            );
            libc::free(config as *mut libc::c_void);
        }
    }

    // Test 4: power and vsync
    println!("\n--- Test 4: Power and vsync ---");
    unsafe {
        let ret = hwc2_compat_display_set_power_mode(display, HWC2_POWER_MODE_ON);
        println!("  setPowerMode(ON) = {}", ret);
        let ret = hwc2_compat_display_set_vsync_enabled(display, HWC2_VSYNC_ENABLE);
        println!("  setVsyncEnabled(ENABLE) = {}", ret);
    }
    server.vsync(0, 1_000_000);
    println!("  vsyncs received: {}", listener.vsyncs.load(Ordering::SeqCst));

    // Test 5: layer setup
    println!("\n--- Test 5: Layer ---");
    let layer = unsafe { hwc2_compat_display_create_layer(display) };
    if layer.is_null() {
        println!("  FAILED: createLayer returned NULL");
        return;
    }
    unsafe {
        let fake_buffer = 0x1000usize as BufferHandleT;
        let results = [
            ("setCompositionType", hwc2_compat_layer_set_composition_type(layer, HWC2_COMPOSITION_DEVICE)),
            ("setBlendMode", hwc2_compat_layer_set_blend_mode(layer, HWC2_BLEND_MODE_PREMULTIPLIED)),
            ("setDisplayFrame", hwc2_compat_layer_set_display_frame(layer, 0, 0, 720, 1440)),
            ("setSourceCrop", hwc2_compat_layer_set_source_crop(layer, 0.0, 0.0, 720.0, 1440.0)),
            ("setVisibleRegion", hwc2_compat_layer_set_visible_region(layer, 0, 0, 720, 1440)),
            ("setPlaneAlpha", hwc2_compat_layer_set_plane_alpha(layer, 1.0)),
            ("setBuffer", hwc2_compat_layer_set_buffer(layer, 0, fake_buffer, -1)),
        ];
        for (name, ret) in results {
            println!("  {} = {}", name, ret);
        }
    }

    // Test 6: validate and present
    println!("\n--- Test 6: Present or validate ---");
    unsafe {
        let mut num_types = 0u32;
        let mut num_requests = 0u32;
        let mut present_fence = -1i32;
        let mut state = 0u32;
        let ret = hwc2_compat_display_present_or_validate(
            display,
            &mut num_types,
            &mut num_requests,
            &mut present_fence,
            &mut state,
        );
        println!("  presentOrValidate = {} state={}", ret, state);

        if state == 0 {
            if ret == HWC2_ERROR_HAS_CHANGES {
                println!("  {} type changes, accepting", num_types);
                hwc2_compat_display_accept_changes(display);
            }
            let ret = hwc2_compat_display_present(display, &mut present_fence);
            println!("  present = {}", ret);
        }
        println!("  present fence fd = {}", present_fence);
        if present_fence >= 0 {
            libc::close(present_fence);
        }

        let mut fences: *mut hwc2_compat_out_fences_t = ptr::null_mut();
        if hwc2_compat_display_get_release_fences(display, &mut fences) == HWC2_ERROR_NONE {
            let fd = hwc2_compat_out_fences_get_fence(fences, layer);
            println!("  release fence for layer = {}", fd);
            if fd >= 0 {
                libc::close(fd);
            }
            hwc2_compat_out_fences_destroy(fences);
        }
    }

    // Cleanup
    println!("\n--- Cleanup ---");
    unsafe {
        hwc2_compat_display_destroy_layer(display, layer);
        hwc2_compat_display_set_vsync_enabled(display, HWC2_VSYNC_DISABLE);
        hwc2_compat_device_destroy_display(device, display);
        hwc2_compat_device_destroy(device);
    }
    println!("  server calls: {}", server.calls().len());

    println!("\n=== C API Test Complete ===");
}
