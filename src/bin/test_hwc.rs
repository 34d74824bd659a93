//! Simple test binary for the composer core
//! Drives a loopback composer through a few frames of alternating colors
//!
//! Pass `--structured` to talk to the structured interface instead of the
//! legacy command queue.

use hwc2_compat::hal::{Color, Composition, PowerMode, Rect, Vsync};
use hwc2_compat::legacy::LegacyVersion;
use hwc2_compat::loopback::{LoopbackComposer, LoopbackDisplay};
use hwc2_compat::{config, Composer, Device, ShimConfig};

const FRAMES: usize = 6;

fn main() {
    let shim_config = ShimConfig::from_env();
    config::init_logging(&shim_config.log_filter);

    let structured = std::env::args().any(|arg| arg == "--structured");
    let server = if structured {
        LoopbackComposer::structured(Some(1))
    } else {
        LoopbackComposer::legacy(LegacyVersion::V2_4)
    }
    .with_service_name(&shim_config.service_name);
    server.add_display(LoopbackDisplay::physical(0, 1080, 2340));

    println!("=== Composer Test ===");
    let composer = Composer::create(&shim_config.service_name, &server);
    println!("Protocol: {}", if composer.is_structured() { "structured" } else { "legacy" });

    let device = Device::new(composer);
    device.on_hotplug(0, true);

    let Some(display) = device.get_display_by_id(0) else {
        println!("FAILED: display 0 not connected");
        return;
    };

    match display.get_active_config() {
        Ok(Some(config)) => println!(
            "Display: {}x{} @ {:.1} Hz",
            config.width(),
            config.height(),
            1e9 / config.vsync_period() as f64
        ),
        Ok(None) => println!("Display has no active config"),
        Err(e) => {
            println!("FAILED: getActiveConfig: {}", e);
            return;
        }
    }

    if let Err(e) = display.set_power_mode(PowerMode::On) {
        println!("FAILED: setPowerMode: {}", e);
        return;
    }
    let _ = display.set_vsync_enabled(Vsync::Enable);

    let layer = match display.create_layer() {
        Ok(layer) => layer,
        Err(e) => {
            println!("FAILED: createLayer: {}", e);
            return;
        }
    };
    let _ = layer.set_composition_type(Composition::SolidColor);
    let _ = layer.set_display_frame(&Rect::new(0, 0, 1080, 2340));

    let colors = [
        (255, 0, 0),
        (0, 255, 0),
        (0, 0, 255),
    ];

    for frame in 0..FRAMES {
        let (r, g, b) = colors[frame % colors.len()];
        if let Err(e) = layer.set_color(Color::from_rgba8(r, g, b, 255)) {
            println!("Frame {}: setColor failed: {}", frame, e);
            continue;
        }

        match display.validate(0) {
            Ok(counts) if counts.has_changes() => {
                println!("Frame {}: {} type changes, accepting", frame, counts.num_types);
                let _ = display.accept_changes();
            }
            Ok(_) => {}
            Err(e) => {
                println!("Frame {}: validate failed: {}", frame, e);
                continue;
            }
        }

        match display.present() {
            Ok(fence) => println!(
                "Frame {}: presented rgb({}, {}, {}), fence {}",
                frame,
                r,
                g,
                b,
                if fence.is_some() { "received" } else { "none" }
            ),
            Err(e) => println!("Frame {}: present failed: {}", frame, e),
        }
    }

    let _ = display.set_vsync_enabled(Vsync::Disable);
    drop(layer);
    device.destroy_display(0);
    println!("Server saw {} calls", server.calls().len());
    println!("=== Done ===");
}
