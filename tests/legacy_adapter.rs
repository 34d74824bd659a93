//! Legacy command-queue adapter against the loopback server

use hwc2_compat::hal::{
    BlendMode, BufferHandle, Composition, ContentType, OptionalFeature, PerFrameMetadata,
    PerFrameMetadataKey, PowerMode, PresentOrValidate, Rect, Transform,
};
use hwc2_compat::legacy::command::Command;
use hwc2_compat::legacy::LegacyVersion;
use hwc2_compat::loopback::{LoopbackComposer, LoopbackDisplay, ValidateChanges};
use hwc2_compat::{Composer, Device, Error};
use proptest::prelude::*;

fn connect(version: LegacyVersion) -> (LoopbackComposer, Device) {
    let server = LoopbackComposer::legacy(version);
    server.add_display(LoopbackDisplay::physical(0, 1080, 1920));
    let device = Device::new(Composer::create("default", &server));
    device.on_hotplug(0, true);
    (server, device)
}

fn record_count(server: &LoopbackComposer, command: Command) -> usize {
    server
        .legacy_batches()
        .iter()
        .flatten()
        .filter(|record| record.command() == Some(command))
        .count()
}

#[test]
fn test_repeated_plane_alpha_sends_one_record() {
    let (server, device) = connect(LegacyVersion::V2_4);
    let display = device.get_display_by_id(0).unwrap();
    let layer = display.create_layer().unwrap();

    layer.set_plane_alpha(0.5).unwrap();
    layer.set_plane_alpha(0.5).unwrap();
    let counts = display.validate(0).unwrap();

    assert!(!counts.has_changes());
    assert_eq!(record_count(&server, Command::SetLayerPlaneAlpha), 1);
    assert_eq!(record_count(&server, Command::ValidateDisplay), 1);
}

#[test]
fn test_non_flush_command_error_is_swallowed() {
    let (server, device) = connect(LegacyVersion::V2_4);
    let display = device.get_display_by_id(0).unwrap();
    let layer = display.create_layer().unwrap();

    server.fail_command(Command::SetLayerZOrder, Error::BadLayer);
    layer.set_z_order(3).unwrap();
    assert_eq!(display.validate(0), Ok(Default::default()));
}

#[test]
fn test_flush_command_error_fails_the_batch() {
    let (server, device) = connect(LegacyVersion::V2_4);
    let display = device.get_display_by_id(0).unwrap();
    let layer = display.create_layer().unwrap();

    server.fail_command(Command::ValidateDisplay, Error::NotValidated);
    layer.set_z_order(3).unwrap();
    assert_eq!(display.validate(0), Err(Error::NotValidated));

    server.clear_command_failures();
    server.fail_command(Command::PresentDisplay, Error::NoResources);
    assert!(matches!(display.present(), Err(Error::NoResources)));
}

#[test]
fn test_validate_reports_changes_until_accepted() {
    let (server, device) = connect(LegacyVersion::V2_4);
    let display = device.get_display_by_id(0).unwrap();
    let layer = display.create_layer().unwrap();

    server.set_validate_changes(
        0,
        ValidateChanges {
            composition_types: vec![(layer.id(), Composition::Client)],
            display_requests: 1,
            layer_requests: vec![],
        },
    );

    let counts = display.validate(0).unwrap();
    assert_eq!(counts.num_types, 1);
    assert!(counts.has_changes());

    let changed = display.get_changed_composition_types().unwrap();
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].0.id(), layer.id());
    let (display_requests, _) = display.get_requests().unwrap();
    assert_eq!(display_requests, 1);

    display.accept_changes().unwrap();
    match display.present_or_validate(0).unwrap() {
        PresentOrValidate::Presented(fence) => assert!(fence.is_some()),
        PresentOrValidate::Validated(counts) => panic!("expected present, got {:?}", counts),
    }
}

#[test]
fn test_present_or_validate_falls_back_to_validate() {
    let (server, device) = connect(LegacyVersion::V2_2);
    let display = device.get_display_by_id(0).unwrap();
    let layer = display.create_layer().unwrap();
    server.set_validate_changes(
        0,
        ValidateChanges {
            composition_types: vec![(layer.id(), Composition::Client)],
            ..Default::default()
        },
    );

    let outcome = display.present_or_validate(0).unwrap();
    assert_eq!(outcome.state(), 0);
    assert!(matches!(outcome, PresentOrValidate::Validated(c) if c.num_types == 1));
}

#[test]
fn test_missing_present_or_validate_result() {
    let (server, device) = connect(LegacyVersion::V2_4);
    let display = device.get_display_by_id(0).unwrap();
    server.omit_present_or_validate_result(true);
    assert!(matches!(display.present_or_validate(0), Err(Error::NoResources)));
}

#[test]
fn test_transport_failure_is_no_resources() {
    let (server, device) = connect(LegacyVersion::V2_4);
    let display = device.get_display_by_id(0).unwrap();
    server.fail_transport(true);
    assert_eq!(display.validate(0), Err(Error::NoResources));

    // The failed batch is discarded
    server.fail_transport(false);
    let before = server.legacy_batches().len();
    display.validate(0).unwrap();
    let batches = server.legacy_batches();
    assert_eq!(batches.len(), before + 1);
    let last = batches.last().unwrap();
    assert_eq!(
        last.iter().filter(|r| r.command() == Some(Command::ValidateDisplay)).count(),
        1
    );
}

#[test]
fn test_input_queue_registered_once_until_it_grows() {
    let (server, device) = connect(LegacyVersion::V2_4);
    let display = device.get_display_by_id(0).unwrap();
    let layer = display.create_layer().unwrap();

    display.validate(0).unwrap();
    display.validate(0).unwrap();
    assert_eq!(server.input_queue_registrations(), 1);

    let region: Vec<Rect> = (0..5000).map(|i| Rect::new(i, 0, i + 1, 1)).collect();
    layer.set_visible_region(&region).unwrap();
    display.validate(0).unwrap();
    assert_eq!(server.input_queue_registrations(), 2);

    display.validate(0).unwrap();
    assert_eq!(server.input_queue_registrations(), 2);
}

#[test]
fn test_failed_queue_registration_is_retried() {
    let (server, device) = connect(LegacyVersion::V2_4);
    let display = device.get_display_by_id(0).unwrap();

    server.fail_queue_registration(true);
    assert_eq!(display.validate(0), Err(Error::NoResources));
    assert_eq!(server.input_queue_registrations(), 0);

    server.fail_queue_registration(false);
    assert_eq!(display.validate(0), Ok(Default::default()));
    assert_eq!(server.input_queue_registrations(), 1);
    assert_eq!(record_count(&server, Command::ValidateDisplay), 1);
}

#[test]
fn test_discarded_commands_never_reach_the_server() {
    let (server, device) = connect(LegacyVersion::V2_4);
    let display = device.get_display_by_id(0).unwrap();
    let layer = display.create_layer().unwrap();

    layer.set_z_order(3).unwrap();
    layer.set_plane_alpha(0.5).unwrap();
    display.discard_commands();
    display.validate(0).unwrap();

    assert_eq!(record_count(&server, Command::SetLayerZOrder), 0);
    assert_eq!(record_count(&server, Command::SetLayerPlaneAlpha), 0);
    assert_eq!(record_count(&server, Command::ValidateDisplay), 1);

    layer.set_z_order(4).unwrap();
    display.validate(0).unwrap();
    assert_eq!(record_count(&server, Command::SetLayerZOrder), 1);
}

#[test]
fn test_display_brightness_requires_2_3() {
    let (server, device) = connect(LegacyVersion::V2_1);
    assert_eq!(
        device.composer().set_display_brightness(0, 0.5),
        Err(Error::Unsupported)
    );
    assert_eq!(server.display_brightness(0), None);

    let (server, device) = connect(LegacyVersion::V2_3);
    device.composer().set_display_brightness(0, 0.3).unwrap();
    assert_eq!(server.display_brightness(0).map(f32::to_bits), Some(0.3f32.to_bits()));
    assert_eq!(
        device.composer().set_display_brightness(9, 0.3),
        Err(Error::BadDisplay)
    );
}

#[test]
fn test_release_fences_follow_buffers() {
    let (_server, device) = connect(LegacyVersion::V2_4);
    let display = device.get_display_by_id(0).unwrap();
    let layer = display.create_layer().unwrap();
    let idle = display.create_layer().unwrap();

    layer.set_buffer(0, BufferHandle(0x10), None).unwrap();
    display.validate(0).unwrap();
    assert!(display.present().unwrap().is_some());

    let fences = display.get_release_fences().unwrap();
    assert!(fences.contains_key(&layer.id()));
    assert!(!fences.contains_key(&idle.id()));
    assert!(display.get_release_fences().unwrap().is_empty());
}

#[test]
fn test_version_gating() {
    let (_server, device) = connect(LegacyVersion::V2_1);
    let composer = device.composer();
    let display = device.get_display_by_id(0).unwrap();
    let layer = display.create_layer().unwrap();

    assert_eq!(composer.set_power_mode(0, PowerMode::OnSuspend), Err(Error::Unsupported));
    assert_eq!(composer.get_per_frame_metadata_keys(0), Ok(Vec::new()));
    let metadata = [PerFrameMetadata { key: PerFrameMetadataKey::MaxLuminance, value: 1.0 }];
    assert_eq!(
        composer.set_layer_per_frame_metadata(0, layer.id(), &metadata),
        Err(Error::Unsupported)
    );
    assert_eq!(composer.get_display_capabilities(0), Err(Error::Unsupported));
    assert!(!composer.is_supported(OptionalFeature::RefreshRateSwitching));

    let (_server, device) = connect(LegacyVersion::V2_3);
    let composer = device.composer();
    assert_eq!(composer.get_display_capabilities(0), Ok(Vec::new()));
    assert!(composer.get_display_identification_data(0).is_ok());
    assert_eq!(composer.get_display_connection_type(0), Err(Error::Unsupported));
    assert_eq!(composer.set_content_type(0, ContentType::Game), Err(Error::Unsupported));
    assert!(matches!(composer.get_client_target_property(0), Err(Error::Unsupported)));

    let (_server, device) = connect(LegacyVersion::V2_4);
    let composer = device.composer();
    assert!(composer.is_supported(OptionalFeature::RefreshRateSwitching));
    assert_eq!(composer.get_display_vsync_period(0), Ok(16_666_666));
    assert_eq!(composer.get_supported_content_types(0), Ok(vec![ContentType::Graphics]));
    assert_eq!(composer.set_boot_display_config(0, 1), Err(Error::Unsupported));
}

#[test]
#[should_panic]
fn test_idle_timer_capability_query_is_fatal() {
    let (_server, device) = connect(LegacyVersion::V2_4);
    let _ = device.composer().has_display_idle_timer_capability(0);
}

#[test]
#[should_panic]
fn test_idle_timer_is_fatal() {
    let (_server, device) = connect(LegacyVersion::V2_4);
    let _ = device
        .composer()
        .set_idle_timer_enabled(0, std::time::Duration::from_millis(100));
}

#[test]
#[should_panic]
fn test_physical_orientation_is_fatal() {
    let (_server, device) = connect(LegacyVersion::V2_4);
    let _ = device.composer().get_physical_display_orientation(0);
}

#[test]
#[should_panic]
fn test_display_decoration_composition_is_fatal() {
    let (_server, device) = connect(LegacyVersion::V2_4);
    let layer = device.get_display_by_id(0).unwrap().create_layer().unwrap();
    let _ = layer.set_composition_type(Composition::DisplayDecoration);
}

#[test]
#[should_panic]
fn test_refused_client_is_fatal() {
    let server = LoopbackComposer::legacy(LegacyVersion::V2_4);
    server.refuse_clients(true);
    let _ = Composer::create("default", &server);
}

#[derive(Debug, Clone)]
enum LayerOp {
    PlaneAlpha(f32),
    ZOrder(u32),
    Transform(i32),
    Blend(BlendMode),
    Frame(i32, i32),
}

impl LayerOp {
    fn command(&self) -> Command {
        match self {
            LayerOp::PlaneAlpha(_) => Command::SetLayerPlaneAlpha,
            LayerOp::ZOrder(_) => Command::SetLayerZOrder,
            LayerOp::Transform(_) => Command::SetLayerTransform,
            LayerOp::Blend(_) => Command::SetLayerBlendMode,
            LayerOp::Frame(..) => Command::SetLayerDisplayFrame,
        }
    }
}

fn layer_op() -> impl Strategy<Value = LayerOp> {
    prop_oneof![
        (0.0f32..=1.0).prop_map(LayerOp::PlaneAlpha),
        any::<u32>().prop_map(LayerOp::ZOrder),
        (0i32..8).prop_map(LayerOp::Transform),
        prop_oneof![
            Just(BlendMode::None),
            Just(BlendMode::Premultiplied),
            Just(BlendMode::Coverage),
        ]
        .prop_map(LayerOp::Blend),
        (0i32..4096, 0i32..4096).prop_map(|(w, h)| LayerOp::Frame(w, h)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_batch_preserves_queue_order(ops in prop::collection::vec(layer_op(), 1..40)) {
        let server = LoopbackComposer::legacy(LegacyVersion::V2_4);
        server.add_display(LoopbackDisplay::physical(0, 1080, 1920));
        let composer = Composer::create("default", &server);
        let layer = composer.create_layer(0).unwrap();

        for op in &ops {
            let result = match *op {
                LayerOp::PlaneAlpha(alpha) => composer.set_layer_plane_alpha(0, layer, alpha),
                LayerOp::ZOrder(z) => composer.set_layer_z_order(0, layer, z),
                LayerOp::Transform(t) => composer.set_layer_transform(0, layer, Transform(t)),
                LayerOp::Blend(mode) => composer.set_layer_blend_mode(0, layer, mode),
                LayerOp::Frame(w, h) => {
                    composer.set_layer_display_frame(0, layer, &Rect::new(0, 0, w, h))
                }
            };
            prop_assert!(result.is_ok());
        }
        composer.execute_commands().unwrap();

        let batches = server.legacy_batches();
        prop_assert_eq!(batches.len(), 1);
        let seen: Vec<Command> = batches[0]
            .iter()
            .filter_map(|record| record.command())
            .filter(|c| !matches!(c, Command::SelectDisplay | Command::SelectLayer))
            .collect();
        let queued: Vec<Command> = ops.iter().map(LayerOp::command).collect();
        prop_assert_eq!(seen, queued);

        let selects = batches[0]
            .iter()
            .filter(|r| r.command() == Some(Command::SelectLayer))
            .count();
        prop_assert_eq!(selects, 1);
    }
}
