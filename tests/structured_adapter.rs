//! Structured RPC adapter against the loopback server

use hwc2_compat::hal::{
    BufferHandle, Composition, Cta8613, HdrMetadata, PerFrameMetadata, PerFrameMetadataBlob,
    PerFrameMetadataKey, PresentOrValidate, Rect, Smpte2086, XyColor,
};
use hwc2_compat::legacy::command::Command;
use hwc2_compat::loopback::{LoopbackComposer, LoopbackDisplay, ValidateChanges};
use hwc2_compat::{Composer, Device, Error};

fn connect(version: Option<i32>) -> (LoopbackComposer, Device) {
    let server = LoopbackComposer::structured(version);
    server.add_display(LoopbackDisplay::physical(0, 1080, 1920));
    let device = Device::new(Composer::create("default", &server));
    device.on_hotplug(0, true);
    (server, device)
}

#[test]
fn test_structured_service_is_preferred() {
    let (_server, device) = connect(Some(2));
    assert!(device.composer().is_structured());
    match device.composer().as_ref() {
        Composer::Structured(c) => assert_eq!(c.interface_version(), 2),
        Composer::Legacy(_) => panic!("expected structured composer"),
    }
}

#[test]
fn test_interface_version_falls_back_to_one() {
    let (_server, device) = connect(None);
    match device.composer().as_ref() {
        Composer::Structured(c) => assert_eq!(c.interface_version(), 1),
        Composer::Legacy(_) => panic!("expected structured composer"),
    }
}

#[test]
fn test_present_error_leaves_no_fence() {
    let (server, device) = connect(Some(1));
    let display = device.get_display_by_id(0).unwrap();

    server.fail_command(Command::PresentDisplay, Error::NotValidated);
    assert!(matches!(display.present(), Err(Error::NotValidated)));
    assert_eq!(server.fences_issued(), 0);

    server.clear_command_failures();
    assert!(display.present().unwrap().is_some());
    assert_eq!(server.fences_issued(), 1);
}

#[test]
fn test_layer_error_in_flush_command_fails_validate() {
    let (server, device) = connect(Some(1));
    let display = device.get_display_by_id(0).unwrap();
    let layer = display.create_layer().unwrap();

    // Plane alpha and validate land in one display command, so the failure
    // is attributed to the flush
    server.fail_command(Command::SetLayerPlaneAlpha, Error::BadLayer);
    layer.set_plane_alpha(0.25).unwrap();
    assert_eq!(display.validate(0), Err(Error::BadLayer));

    server.clear_command_failures();
    assert_eq!(display.validate(0), Ok(Default::default()));
}

#[test]
fn test_error_on_other_display_is_swallowed() {
    let (server, device) = connect(Some(1));
    let display = device.get_display_by_id(0).unwrap();

    // Display 7 is unknown to the server; its command carries no flush
    device.composer().set_layer_z_order(7, 1, 3).unwrap();
    assert_eq!(display.validate(0), Ok(Default::default()));

    let batches = server.take_structured_batches();
    let last = batches.last().unwrap();
    assert_eq!(last.len(), 2);
    assert!(last.iter().any(|c| c.display == 7 && !c.is_flush()));
}

#[test]
fn test_repeated_setters_coalesce_into_one_command() {
    let (server, device) = connect(Some(1));
    let display = device.get_display_by_id(0).unwrap();
    let layer = display.create_layer().unwrap();
    server.take_structured_batches();

    layer.set_plane_alpha(0.5).unwrap();
    layer.set_plane_alpha(0.5).unwrap();
    layer.set_visible_region(&[Rect::new(0, 0, 10, 10)]).unwrap();
    layer.set_visible_region(&[Rect::new(0, 0, 10, 10)]).unwrap();
    display.validate(0).unwrap();

    let batches = server.take_structured_batches();
    assert_eq!(batches.len(), 1);
    let commands = &batches[0];
    assert_eq!(commands.len(), 1);
    assert!(commands[0].validate_display);
    assert_eq!(commands[0].expected_present_time, Some(0));
    assert_eq!(commands[0].layers.len(), 1);
    assert_eq!(commands[0].layers[0].plane_alpha, Some(0.5));
    assert_eq!(
        commands[0].layers[0].visible_region.as_deref(),
        Some(&[Rect::new(0, 0, 10, 10)][..])
    );
}

#[test]
fn test_validate_changes_and_accept() {
    let (server, device) = connect(Some(1));
    let display = device.get_display_by_id(0).unwrap();
    let layer = display.create_layer().unwrap();
    server.set_validate_changes(
        0,
        ValidateChanges {
            composition_types: vec![(layer.id(), Composition::Client)],
            display_requests: 0,
            layer_requests: vec![(layer.id(), 1)],
        },
    );

    let counts = display.validate(0).unwrap();
    assert_eq!((counts.num_types, counts.num_requests), (1, 1));

    let outcome = display.present_or_validate(0).unwrap();
    assert_eq!(outcome.state(), 0);

    display.accept_changes().unwrap();
    let outcome = display.present_or_validate(0).unwrap();
    assert!(matches!(outcome, PresentOrValidate::Presented(Some(_))));
}

#[test]
fn test_missing_present_or_validate_result() {
    let (server, device) = connect(Some(1));
    let display = device.get_display_by_id(0).unwrap();
    server.omit_present_or_validate_result(true);
    assert!(matches!(display.present_or_validate(0), Err(Error::NoResources)));
}

#[test]
fn test_fences_are_handed_out_once() {
    let (_server, device) = connect(Some(1));
    let display = device.get_display_by_id(0).unwrap();
    let layer = display.create_layer().unwrap();

    layer.set_buffer(0, BufferHandle(0x20), None).unwrap();
    display.validate(0).unwrap();
    assert!(display.present().unwrap().is_some());

    let first = display.get_release_fences().unwrap();
    assert_eq!(first.len(), 1);
    assert!(first.contains_key(&layer.id()));
    assert!(display.get_release_fences().unwrap().is_empty());
}

#[test]
fn test_transport_failure_is_no_resources() {
    let (server, device) = connect(Some(1));
    let display = device.get_display_by_id(0).unwrap();
    server.fail_transport(true);
    assert_eq!(display.validate(0), Err(Error::NoResources));
}

#[test]
fn test_doze_support_comes_from_capabilities() {
    let server = LoopbackComposer::structured(Some(1));
    let mut panel = LoopbackDisplay::physical(0, 1080, 1920);
    panel.capabilities = Some(vec![hwc2_compat::hal::DisplayCapability::Doze]);
    server.add_display(panel);
    let device = Device::new(Composer::create("default", &server));
    device.on_hotplug(0, true);

    let display = device.get_display_by_id(0).unwrap();
    assert_eq!(display.supports_doze(), Ok(true));
    assert_eq!(device.composer().has_display_idle_timer_capability(0), Ok(false));
}

#[test]
#[should_panic]
fn test_refused_client_is_fatal() {
    let server = LoopbackComposer::structured(Some(1));
    server.refuse_clients(true);
    let _ = Composer::create("default", &server);
}

#[test]
fn test_blocking_region_is_sent_only_when_it_changes() {
    let (server, device) = connect(Some(2));
    let display = device.get_display_by_id(0).unwrap();
    let layer = display.create_layer().unwrap();
    server.take_structured_batches();

    let first = [Rect::new(0, 0, 100, 100)];
    layer.set_blocking_region(&first).unwrap();
    display.validate(0).unwrap();
    layer.set_blocking_region(&first).unwrap();
    display.validate(0).unwrap();
    let second = [Rect::new(0, 0, 50, 50)];
    layer.set_blocking_region(&second).unwrap();
    display.validate(0).unwrap();

    let sent: Vec<_> = server
        .take_structured_batches()
        .iter()
        .flatten()
        .flat_map(|c| c.layers.iter())
        .filter_map(|l| l.blocking_region.clone())
        .collect();
    assert_eq!(sent, vec![first.to_vec(), second.to_vec()]);
}

fn hdr10() -> HdrMetadata {
    HdrMetadata {
        valid_types: HdrMetadata::SMPTE2086 | HdrMetadata::CTA861_3 | HdrMetadata::HDR10PLUS,
        smpte2086: Smpte2086 {
            display_primary_red: XyColor { x: 0.708, y: 0.292 },
            display_primary_green: XyColor { x: 0.170, y: 0.797 },
            display_primary_blue: XyColor { x: 0.131, y: 0.046 },
            white_point: XyColor { x: 0.3127, y: 0.3290 },
            max_luminance: 1000.0,
            min_luminance: 0.005,
        },
        cta8613: Cta8613 {
            max_content_light_level: 800.0,
            max_frame_average_light_level: 400.0,
        },
        hdr10plus: vec![0xb5, 0x00, 0x3c],
    }
}

#[test]
fn test_hdr_metadata_fans_out_by_supported_types() {
    let (server, device) = connect(Some(2));
    let display = device.get_display_by_id(0).unwrap();
    let layer = display.create_layer().unwrap();
    server.take_structured_batches();

    let supported = HdrMetadata::SMPTE2086 | HdrMetadata::HDR10PLUS;
    layer.set_hdr_metadata(supported, &hdr10()).unwrap();
    display.validate(0).unwrap();

    let batches = server.take_structured_batches();
    let command = &batches[0][0].layers[0];
    let metadata = command.per_frame_metadata.as_ref().unwrap();
    assert_eq!(metadata.len(), 10);
    assert_eq!(
        metadata[0],
        PerFrameMetadata { key: PerFrameMetadataKey::DisplayRedPrimaryX, value: 0.708 }
    );
    assert_eq!(
        metadata[9],
        PerFrameMetadata { key: PerFrameMetadataKey::MinLuminance, value: 0.005 }
    );
    assert!(!metadata.iter().any(|m| m.key == PerFrameMetadataKey::MaxContentLightLevel));
    assert_eq!(
        command.per_frame_metadata_blobs.as_deref(),
        Some(
            &[PerFrameMetadataBlob {
                key: PerFrameMetadataKey::Hdr10PlusSei,
                blob: vec![0xb5, 0x00, 0x3c],
            }][..]
        )
    );

    // Same metadata again: nothing queued
    layer.set_hdr_metadata(supported, &hdr10()).unwrap();
    display.validate(0).unwrap();
    let batches = server.take_structured_batches();
    assert!(batches.iter().flatten().all(|c| c.layers.is_empty()));
}

#[test]
fn test_hdr_metadata_is_cached_before_it_is_sent() {
    let (server, device) = connect(Some(2));
    let display = device.get_display_by_id(0).unwrap();
    let layer = display.create_layer().unwrap();
    server.take_structured_batches();

    let mut metadata = hdr10();
    metadata.hdr10plus.clear();
    assert_eq!(
        layer.set_hdr_metadata(HdrMetadata::HDR10PLUS, &metadata),
        Err(Error::BadParameter)
    );
    // The rejected value is still cached, so repeating it is a no-op
    assert_eq!(layer.set_hdr_metadata(HdrMetadata::HDR10PLUS, &metadata), Ok(()));
    display.validate(0).unwrap();

    let batches = server.take_structured_batches();
    let layers: Vec<_> = batches.iter().flatten().flat_map(|c| c.layers.iter()).collect();
    assert_eq!(layers.len(), 1);
    assert_eq!(layers[0].per_frame_metadata.as_deref(), Some(&[][..]));
    assert!(layers[0].per_frame_metadata_blobs.is_none());
}

#[test]
fn test_discarded_commands_are_not_flushed() {
    let (server, device) = connect(Some(2));
    let display = device.get_display_by_id(0).unwrap();
    let layer = display.create_layer().unwrap();
    server.take_structured_batches();

    layer.set_z_order(2).unwrap();
    layer.set_plane_alpha(0.5).unwrap();
    display.discard_commands();
    display.validate(0).unwrap();

    let batches = server.take_structured_batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 1);
    assert!(batches[0][0].validate_display);
    assert!(batches[0][0].layers.is_empty());
}

#[test]
fn test_brightness_reaches_the_server_unchanged() {
    let (server, device) = connect(Some(2));
    let display = device.get_display_by_id(0).unwrap();
    let layer = display.create_layer().unwrap();
    server.take_structured_batches();

    let nits = 0.1f32 + 0.2f32;
    layer.set_brightness(nits).unwrap();
    display.validate(0).unwrap();
    let batches = server.take_structured_batches();
    let sent = batches[0][0].layers[0].brightness.unwrap();
    assert_eq!(sent.to_bits(), nits.to_bits());

    device.composer().set_display_brightness(0, 0.42).unwrap();
    assert_eq!(server.display_brightness(0), Some(0.42));
    assert_eq!(
        device.composer().set_display_brightness(3, 0.42),
        Err(Error::BadDisplay)
    );
}
