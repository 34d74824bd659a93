//! Device, display and layer lifetimes

use hwc2_compat::hal::{
    BufferHandle, Capability, Dataspace, DisplayCapability, DisplayId, DisplayType, PixelFormat,
    PowerMode, Rect, IDENTITY_MATRIX,
};
use hwc2_compat::legacy::command::Command;
use hwc2_compat::legacy::LegacyVersion;
use hwc2_compat::loopback::{LoopbackComposer, LoopbackDisplay};
use hwc2_compat::{Composer, ComposerCallback, Device, Error};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn device_with(server: &LoopbackComposer, displays: &[DisplayId]) -> Device {
    for &id in displays {
        server.add_display(LoopbackDisplay::physical(id, 1080, 1920));
    }
    let device = Device::new(Composer::create("default", server));
    for &id in displays {
        device.on_hotplug(id, true);
    }
    device
}

fn record_count(server: &LoopbackComposer, command: Command) -> usize {
    server
        .legacy_batches()
        .iter()
        .flatten()
        .filter(|record| record.command() == Some(command))
        .count()
}

#[derive(Default)]
struct Recorder {
    hotplugs: Mutex<Vec<(DisplayId, bool)>>,
    vsyncs: Mutex<Vec<(DisplayId, i64, Option<u32>)>>,
}

impl ComposerCallback for Recorder {
    fn on_hotplug(&self, display: DisplayId, connected: bool) {
        self.hotplugs.lock().unwrap().push((display, connected));
    }

    fn on_refresh(&self, _display: DisplayId) {}

    fn on_vsync(&self, display: DisplayId, timestamp: i64, vsync_period_nanos: Option<u32>) {
        self.vsyncs.lock().unwrap().push((display, timestamp, vsync_period_nanos));
    }
}

#[test]
fn test_reconnecting_a_connected_display_recreates_it() {
    let server = LoopbackComposer::legacy(LegacyVersion::V2_4);
    let device = device_with(&server, &[5]);

    let old = device.get_display_by_id(5).unwrap();
    let layer = old.create_layer().unwrap();
    let destroyed = Arc::new(AtomicUsize::new(0));
    let counter = destroyed.clone();
    layer.set_display_destroyed_listener(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    device.on_hotplug(5, true);

    let new = device.get_display_by_id(5).unwrap();
    assert!(!Arc::ptr_eq(&old, &new));
    assert!(new.is_connected());
    assert_eq!(new.layer_count(), 0);
    assert!(old.is_torn_down());
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);

    assert!(!layer.has_display());
    assert_eq!(layer.set_z_order(1), Err(Error::BadDisplay));
    assert_eq!(layer.set_plane_alpha(0.5), Err(Error::BadDisplay));
    assert!(matches!(old.create_layer(), Err(Error::BadDisplay)));
    assert_eq!(server.vsync_enabled(5), Some(false));

    // A second teardown finds nothing left to notify
    device.destroy_display(5);
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_disconnect_keeps_the_display_until_destroyed() {
    let server = LoopbackComposer::legacy(LegacyVersion::V2_4);
    let device = device_with(&server, &[0]);
    let display = device.get_display_by_id(0).unwrap();

    device.on_hotplug(0, false);
    assert!(!display.is_connected());
    assert!(!display.is_torn_down());

    device.on_hotplug(0, true);
    let again = device.get_display_by_id(0).unwrap();
    assert!(Arc::ptr_eq(&display, &again));
    assert!(again.is_connected());
    assert_eq!(server.call_count("setClientTargetSlotCount"), 2);

    device.destroy_display(0);
    assert!(device.get_display_by_id(0).is_none());
    assert!(display.is_torn_down());
}

#[test]
fn test_disconnecting_unknown_display_is_ignored() {
    let server = LoopbackComposer::legacy(LegacyVersion::V2_4);
    let device = device_with(&server, &[0]);
    device.on_hotplug(9, false);
    assert_eq!(device.display_ids(), vec![0]);
}

#[test]
fn test_physical_display_loads_configs() {
    let server = LoopbackComposer::legacy(LegacyVersion::V2_4);
    let device = device_with(&server, &[0]);
    let display = device.get_display_by_id(0).unwrap();

    let configs = display.get_configs();
    assert_eq!(configs.len(), 1);
    assert_eq!((configs[0].width(), configs[0].height()), (1080, 1920));
    assert_eq!(configs[0].vsync_period(), 16_666_666);

    let active = display.get_active_config().unwrap().unwrap();
    assert_eq!(active.id(), configs[0].id());
}

#[test]
fn test_cached_layer_setters_send_once() {
    let server = LoopbackComposer::legacy(LegacyVersion::V2_3);
    let device = device_with(&server, &[0]);
    let display = device.get_display_by_id(0).unwrap();
    let layer = display.create_layer().unwrap();

    let region = [Rect::new(0, 0, 100, 100)];
    let mut matrix = IDENTITY_MATRIX;
    matrix[0] = 0.5;
    for _ in 0..2 {
        layer.set_visible_region(&region).unwrap();
        layer.set_surface_damage(&region).unwrap();
        layer.set_dataspace(Dataspace(0x10c10000)).unwrap();
        layer.set_color_transform(&matrix).unwrap();
        layer.set_buffer(0, BufferHandle(0x40), None).unwrap();
    }
    display.validate(0).unwrap();

    assert_eq!(record_count(&server, Command::SetLayerVisibleRegion), 1);
    assert_eq!(record_count(&server, Command::SetLayerSurfaceDamage), 1);
    assert_eq!(record_count(&server, Command::SetLayerDataspace), 1);
    assert_eq!(record_count(&server, Command::SetLayerColorTransform), 1);
    // The slot is always sent; the handle only the first time
    assert_eq!(record_count(&server, Command::SetLayerBuffer), 2);
}

#[test]
fn test_unsupported_color_transform_is_not_cached() {
    let server = LoopbackComposer::legacy(LegacyVersion::V2_1);
    let device = device_with(&server, &[0]);
    let display = device.get_display_by_id(0).unwrap();
    let layer = display.create_layer().unwrap();

    let mut matrix = IDENTITY_MATRIX;
    matrix[5] = 0.25;
    assert_eq!(layer.set_color_transform(&matrix), Err(Error::Unsupported));
    assert_eq!(layer.set_color_transform(&matrix), Err(Error::Unsupported));
    // The identity matrix is what the cache starts with
    assert_eq!(layer.set_color_transform(&IDENTITY_MATRIX), Ok(()));
}

#[test]
fn test_capabilities_fall_back_when_unsupported() {
    let server = LoopbackComposer::legacy(LegacyVersion::V2_3);
    server.set_capabilities(vec![Capability::SkipClientColorTransform]);
    let mut panel = LoopbackDisplay::physical(0, 1080, 1920);
    panel.capabilities = None;
    panel.doze_support = true;
    server.add_display(panel);
    let device = Device::new(Composer::create("default", &server));
    device.on_hotplug(0, true);
    let display = device.get_display_by_id(0).unwrap();

    assert!(display.display_capabilities().is_empty());
    display.set_power_mode(PowerMode::On).unwrap();
    display.set_power_mode(PowerMode::Off).unwrap();
    display.set_power_mode(PowerMode::On).unwrap();

    let expected: HashSet<_> = [DisplayCapability::SkipClientColorTransform, DisplayCapability::Doze]
        .into_iter()
        .collect();
    assert_eq!(display.display_capabilities(), expected);
    assert!(display.has_capability(DisplayCapability::Doze));
    assert_eq!(server.call_count("getDisplayCapabilities"), 1);
    assert_eq!(server.power_mode(0), Some(PowerMode::On));
}

#[test]
fn test_doze_power_mode_does_not_load_capabilities() {
    let server = LoopbackComposer::legacy(LegacyVersion::V2_4);
    let device = device_with(&server, &[0]);
    let display = device.get_display_by_id(0).unwrap();

    display.set_power_mode(PowerMode::Doze).unwrap();
    assert_eq!(server.call_count("getDisplayCapabilities"), 0);
}

#[test]
fn test_callback_registers_once() {
    let server = LoopbackComposer::legacy(LegacyVersion::V2_4);
    let device = device_with(&server, &[0]);
    let recorder = Arc::new(Recorder::default());

    device.register_callback(recorder.clone());
    device.register_callback(recorder.clone());
    assert_eq!(server.call_count("registerCallback"), 1);

    server.hotplug(3, true);
    assert_eq!(*recorder.hotplugs.lock().unwrap(), vec![(3, true)]);
}

#[test]
fn test_vsync_period_follows_server_version() {
    for (version, expected) in [
        (LegacyVersion::V2_3, None),
        (LegacyVersion::V2_4, Some(16_666_666)),
    ] {
        let server = LoopbackComposer::legacy(version);
        let device = device_with(&server, &[0]);
        let recorder = Arc::new(Recorder::default());
        device.register_callback(recorder.clone());

        server.vsync(0, 42);
        assert_eq!(*recorder.vsyncs.lock().unwrap(), vec![(0, 42, expected)]);
    }
}

#[test]
fn test_virtual_display_lifecycle() {
    let server = LoopbackComposer::legacy(LegacyVersion::V2_4);
    let device = device_with(&server, &[0]);
    assert_eq!(device.max_virtual_display_count(), 1);

    let (display, format) = device
        .create_virtual_display(640, 480, PixelFormat::RGBA_8888)
        .unwrap();
    assert_eq!(format, PixelFormat::RGBA_8888);
    assert_eq!(display.id(), 100);
    assert_eq!(display.display_type(), DisplayType::Virtual);
    assert!(display.get_configs().is_empty());

    device.destroy_display(100);
    assert_eq!(server.call_count("destroyVirtualDisplay"), 1);
    assert!(display.is_torn_down());
}

#[test]
fn test_dropping_layer_destroys_it_on_the_server() {
    let server = LoopbackComposer::legacy(LegacyVersion::V2_4);
    let device = device_with(&server, &[0]);
    let display = device.get_display_by_id(0).unwrap();
    let layer = display.create_layer().unwrap();
    let id = layer.id();

    let dropped = Arc::new(Mutex::new(None));
    let seen = dropped.clone();
    layer.set_layer_destroyed_listener(move |id| *seen.lock().unwrap() = Some(id));

    assert_eq!(server.live_layers(0), vec![id]);
    display.destroy_layer(&layer);
    assert_eq!(display.layer_count(), 0);
    drop(layer);

    assert_eq!(server.destroyed_layers(), vec![(0, id)]);
    assert!(server.live_layers(0).is_empty());
    assert_eq!(*dropped.lock().unwrap(), Some(id));
}

#[test]
fn test_sideband_requires_device_capability() {
    let server = LoopbackComposer::legacy(LegacyVersion::V2_4);
    let device = device_with(&server, &[0]);
    let layer = device.get_display_by_id(0).unwrap().create_layer().unwrap();
    assert_eq!(layer.set_sideband_stream(BufferHandle(0x99)), Err(Error::Unsupported));

    let server = LoopbackComposer::legacy(LegacyVersion::V2_4);
    server.set_capabilities(vec![Capability::SidebandStream]);
    let device = device_with(&server, &[0]);
    let layer = device.get_display_by_id(0).unwrap().create_layer().unwrap();
    assert_eq!(layer.set_sideband_stream(BufferHandle(0x99)), Ok(()));
}

#[test]
fn test_dropping_device_tears_down_displays() {
    let server = LoopbackComposer::legacy(LegacyVersion::V2_4);
    let device = device_with(&server, &[0, 1]);
    let display = device.get_display_by_id(1).unwrap();

    drop(device);
    assert!(display.is_torn_down());
    assert_eq!(server.vsync_enabled(0), Some(false));
    assert_eq!(server.vsync_enabled(1), Some(false));
}
