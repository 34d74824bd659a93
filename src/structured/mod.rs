//! Structured RPC composer adapter
//!
//! Mutations are batched as typed [`DisplayCommand`]s and flushed through one
//! `execute_commands` call. Queries go straight to the [`StructuredClient`].

pub mod client;
pub mod message;
pub mod reader;
pub mod writer;

pub use client::{StructuredClient, StructuredComposerService};
pub use message::{
    Buffer, ClientTarget, CommandError, CommandResultPayload, DisplayCommand, LayerCommand,
    PresentOrValidateResult,
};

use crate::composer::ComposerCallback;
use crate::error::{from_rpc, Error};
use crate::hal::{
    Attribute, BlendMode, BufferHandle, Capability, ChangeCounts, ClientTargetProperty, Color,
    ColorMode, Composition, ConfigId, ContentType, Dataspace, DisplayCapability,
    DisplayConnectionType, DisplayDecorationSupport, DisplayId, DisplayIdentification,
    DisplayRequests, DisplayType, FRect, HdrCapabilities, LayerId, OptionalFeature,
    PerFrameMetadata, PerFrameMetadataBlob, PerFrameMetadataKey, PixelFormat, PowerMode,
    PresentOrValidate, Rect, RenderIntent, Transform, Vsync, VsyncPeriodChangeConstraints,
    VsyncPeriodChangeTimeline, NUM_BUFFER_SLOTS,
};
use crate::Result;
use reader::ComposerClientReader;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{info, warn};
use writer::ComposerClientWriter;

/// Service descriptor the structured instance is registered under
pub const DESCRIPTOR: &str = "android.hardware.graphics.composer3.IComposer";

/// Registry name of the structured instance called `name`
pub fn instance_name(name: &str) -> String {
    format!("{}/{}", DESCRIPTOR, name)
}

struct CommandState {
    writer: ComposerClientWriter,
    reader: ComposerClientReader,
}

/// Fold per-command errors into the flush result. Only errors on flush
/// commands count; an index outside the batch is a protocol error.
fn batch_result(flushes: &[bool], errors: Vec<CommandError>) -> Result<()> {
    let mut result = Ok(());
    for command_error in errors {
        let Some(&flush) = usize::try_from(command_error.command_index)
            .ok()
            .and_then(|index| flushes.get(index))
        else {
            return Err(Error::BadParameter);
        };
        let error = match Error::check(command_error.error_code) {
            Err(error) => error,
            Ok(()) => continue,
        };
        if flush {
            result = Err(error);
        } else {
            warn!("command {} failed: {}", command_error.command_index, error);
        }
    }
    result
}

pub struct StructuredComposer {
    service: Arc<dyn StructuredComposerService>,
    client: Arc<dyn StructuredClient>,
    interface_version: i32,
    state: Mutex<CommandState>,
}

impl StructuredComposer {
    /// Connect to `service`. A service that refuses a client is fatal.
    pub fn new(service: Arc<dyn StructuredComposerService>) -> Self {
        let client = match service.create_client() {
            Ok(client) => client,
            Err(e) => panic!("failed to create structured composer client: {}", e),
        };

        let interface_version = match service.interface_version() {
            Ok(version) => version,
            Err(e) => {
                warn!("failed to read composer interface version: {}", e);
                1
            }
        };
        info!("Connected to structured composer v{}", interface_version);

        Self {
            service,
            client,
            interface_version,
            state: Mutex::new(CommandState {
                writer: ComposerClientWriter::new(),
                reader: ComposerClientReader::new(),
            }),
        }
    }

    pub fn interface_version(&self) -> i32 {
        self.interface_version
    }

    fn state(&self) -> MutexGuard<'_, CommandState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_layer(
        &self,
        display: DisplayId,
        layer: LayerId,
        f: impl FnOnce(&mut LayerCommand),
    ) -> Result<()> {
        f(self.state().writer.layer_command(display, layer));
        Ok(())
    }

    fn with_display(&self, display: DisplayId, f: impl FnOnce(&mut DisplayCommand)) -> Result<()> {
        f(self.state().writer.display_command(display));
        Ok(())
    }

    pub fn is_supported(&self, _feature: OptionalFeature) -> bool {
        true
    }

    pub fn get_capabilities(&self) -> Vec<Capability> {
        from_rpc("getCapabilities", self.service.get_capabilities()).unwrap_or_default()
    }

    pub fn dump_debug_info(&self) -> String {
        from_rpc("dumpDebugInfo", self.service.dump_debug_info()).unwrap_or_default()
    }

    pub fn register_callback(&self, callback: Arc<dyn ComposerCallback>) -> Result<()> {
        from_rpc("registerCallback", self.client.register_callback(callback))
    }

    pub fn reset_commands(&self) {
        self.state().writer.reset();
    }

    pub fn execute_commands(&self) -> Result<()> {
        let mut state = self.state();
        self.execute(&mut state)
    }

    fn execute(&self, state: &mut CommandState) -> Result<()> {
        let commands = state.writer.take_pending_commands();
        if commands.is_empty() {
            return Ok(());
        }

        let flushes: Vec<bool> = commands.iter().map(DisplayCommand::is_flush).collect();
        let results = from_rpc("executeCommands", self.client.execute_commands(commands))?;
        state.reader.parse(results);
        batch_result(&flushes, state.reader.take_errors())
    }

    pub fn get_max_virtual_display_count(&self) -> Result<u32> {
        from_rpc("getMaxVirtualDisplayCount", self.client.get_max_virtual_display_count())
    }

    pub fn create_virtual_display(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<(DisplayId, PixelFormat)> {
        from_rpc(
            "createVirtualDisplay",
            self.client.create_virtual_display(width, height, format, 1),
        )
    }

    pub fn destroy_virtual_display(&self, display: DisplayId) -> Result<()> {
        from_rpc("destroyVirtualDisplay", self.client.destroy_virtual_display(display))
    }

    pub fn accept_display_changes(&self, display: DisplayId) -> Result<()> {
        self.with_display(display, |c| c.accept_display_changes = true)
    }

    pub fn create_layer(&self, display: DisplayId) -> Result<LayerId> {
        from_rpc("createLayer", self.client.create_layer(display, NUM_BUFFER_SLOTS + 1))
    }

    pub fn destroy_layer(&self, display: DisplayId, layer: LayerId) -> Result<()> {
        from_rpc("destroyLayer", self.client.destroy_layer(display, layer))
    }

    pub fn get_active_config(&self, display: DisplayId) -> Result<ConfigId> {
        from_rpc("getActiveConfig", self.client.get_active_config(display))
    }

    pub fn get_changed_composition_types(
        &self,
        display: DisplayId,
    ) -> Result<Vec<(LayerId, Composition)>> {
        Ok(self.state().reader.take_changed_composition_types(display))
    }

    pub fn get_color_modes(&self, display: DisplayId) -> Result<Vec<ColorMode>> {
        from_rpc("getColorModes", self.client.get_color_modes(display))
    }

    pub fn get_display_attribute(
        &self,
        display: DisplayId,
        config: ConfigId,
        attribute: Attribute,
    ) -> Result<i32> {
        from_rpc(
            "getDisplayAttribute",
            self.client.get_display_attribute(display, config, attribute),
        )
    }

    pub fn get_display_configs(&self, display: DisplayId) -> Result<Vec<ConfigId>> {
        from_rpc("getDisplayConfigs", self.client.get_display_configs(display))
    }

    pub fn get_display_name(&self, display: DisplayId) -> Result<String> {
        from_rpc("getDisplayName", self.client.get_display_name(display))
    }

    pub fn get_display_requests(&self, display: DisplayId) -> Result<DisplayRequests> {
        Ok(self.state().reader.take_display_requests(display))
    }

    pub fn get_display_type(&self, display: DisplayId) -> Result<DisplayType> {
        from_rpc("getDisplayType", self.client.get_display_type(display))
    }

    /// Doze support is a display capability in this protocol
    pub fn get_doze_support(&self, display: DisplayId) -> Result<bool> {
        Ok(self
            .get_display_capabilities(display)?
            .contains(&DisplayCapability::Doze))
    }

    pub fn has_display_idle_timer_capability(&self, display: DisplayId) -> Result<bool> {
        Ok(self
            .get_display_capabilities(display)?
            .contains(&DisplayCapability::DisplayIdleTimer))
    }

    pub fn get_hdr_capabilities(&self, display: DisplayId) -> Result<HdrCapabilities> {
        from_rpc("getHdrCapabilities", self.client.get_hdr_capabilities(display))
    }

    pub fn get_release_fences(&self, display: DisplayId) -> Result<Vec<(LayerId, Option<OwnedFd>)>> {
        Ok(self.state().reader.take_release_fences(display))
    }

    pub fn present_display(&self, display: DisplayId) -> Result<Option<OwnedFd>> {
        let mut state = self.state();
        state.writer.display_command(display).present_display = true;
        self.execute(&mut state)?;
        Ok(state.reader.take_present_fence(display))
    }

    pub fn set_active_config(&self, display: DisplayId, config: ConfigId) -> Result<()> {
        from_rpc("setActiveConfig", self.client.set_active_config(display, config))
    }

    pub fn set_client_target(
        &self,
        display: DisplayId,
        slot: u32,
        target: Option<BufferHandle>,
        acquire_fence: Option<OwnedFd>,
        dataspace: Dataspace,
        damage: &[Rect],
    ) -> Result<()> {
        self.with_display(display, |c| {
            c.client_target = Some(ClientTarget {
                buffer: Buffer { slot, handle: target, fence: acquire_fence },
                dataspace,
                damage: damage.to_vec(),
            })
        })
    }

    pub fn set_color_mode(&self, display: DisplayId, mode: ColorMode, intent: RenderIntent) -> Result<()> {
        from_rpc("setColorMode", self.client.set_color_mode(display, mode, intent))
    }

    pub fn set_color_transform(&self, display: DisplayId, matrix: &[f32; 16]) -> Result<()> {
        self.with_display(display, |c| c.color_transform = Some(*matrix))
    }

    pub fn set_output_buffer(
        &self,
        display: DisplayId,
        buffer: Option<BufferHandle>,
        release_fence: Option<OwnedFd>,
    ) -> Result<()> {
        self.with_display(display, |c| {
            c.output_buffer = Some(Buffer { slot: 0, handle: buffer, fence: release_fence })
        })
    }

    pub fn set_power_mode(&self, display: DisplayId, mode: PowerMode) -> Result<()> {
        from_rpc("setPowerMode", self.client.set_power_mode(display, mode))
    }

    pub fn set_vsync_enabled(&self, display: DisplayId, enabled: Vsync) -> Result<()> {
        from_rpc(
            "setVsyncEnabled",
            self.client.set_vsync_enabled(display, enabled == Vsync::Enable),
        )
    }

    pub fn set_client_target_slot_count(&self, display: DisplayId) -> Result<()> {
        from_rpc(
            "setClientTargetSlotCount",
            self.client.set_client_target_slot_count(display, NUM_BUFFER_SLOTS),
        )
    }

    pub fn validate_display(&self, display: DisplayId, expected_present_time: i64) -> Result<ChangeCounts> {
        let mut state = self.state();
        let command = state.writer.display_command(display);
        command.expected_present_time = Some(expected_present_time);
        command.validate_display = true;

        match self.execute(&mut state) {
            Ok(()) | Err(Error::HasChanges) => Ok(state.reader.has_changes(display)),
            Err(e) => Err(e),
        }
    }

    pub fn present_or_validate_display(
        &self,
        display: DisplayId,
        expected_present_time: i64,
    ) -> Result<PresentOrValidate> {
        let mut state = self.state();
        let command = state.writer.display_command(display);
        command.expected_present_time = Some(expected_present_time);
        command.present_or_validate_display = true;

        match self.execute(&mut state) {
            Ok(()) | Err(Error::HasChanges) => {}
            Err(e) => return Err(e),
        }

        match state.reader.take_present_or_validate_result(display) {
            Some(PresentOrValidateResult::Presented) => Ok(PresentOrValidate::Presented(
                state.reader.take_present_fence(display),
            )),
            Some(PresentOrValidateResult::Validated) => {
                Ok(PresentOrValidate::Validated(state.reader.has_changes(display)))
            }
            None => Err(Error::NoResources),
        }
    }

    pub fn set_cursor_position(&self, display: DisplayId, layer: LayerId, x: i32, y: i32) -> Result<()> {
        self.with_layer(display, layer, |c| c.cursor_position = Some((x, y)))
    }

    pub fn set_layer_buffer(
        &self,
        display: DisplayId,
        layer: LayerId,
        slot: u32,
        buffer: Option<BufferHandle>,
        acquire_fence: Option<OwnedFd>,
    ) -> Result<()> {
        self.with_layer(display, layer, |c| {
            c.buffer = Some(Buffer { slot, handle: buffer, fence: acquire_fence })
        })
    }

    pub fn set_layer_surface_damage(&self, display: DisplayId, layer: LayerId, damage: &[Rect]) -> Result<()> {
        self.with_layer(display, layer, |c| c.damage = Some(damage.to_vec()))
    }

    pub fn set_layer_blend_mode(&self, display: DisplayId, layer: LayerId, mode: BlendMode) -> Result<()> {
        self.with_layer(display, layer, |c| c.blend_mode = Some(mode))
    }

    pub fn set_layer_color(&self, display: DisplayId, layer: LayerId, color: Color) -> Result<()> {
        self.with_layer(display, layer, |c| c.color = Some(color))
    }

    pub fn set_layer_composition_type(
        &self,
        display: DisplayId,
        layer: LayerId,
        composition: Composition,
    ) -> Result<()> {
        self.with_layer(display, layer, |c| c.composition = Some(composition))
    }

    pub fn set_layer_dataspace(&self, display: DisplayId, layer: LayerId, dataspace: Dataspace) -> Result<()> {
        self.with_layer(display, layer, |c| c.dataspace = Some(dataspace))
    }

    pub fn set_layer_display_frame(&self, display: DisplayId, layer: LayerId, frame: &Rect) -> Result<()> {
        self.with_layer(display, layer, |c| c.display_frame = Some(*frame))
    }

    pub fn set_layer_plane_alpha(&self, display: DisplayId, layer: LayerId, alpha: f32) -> Result<()> {
        self.with_layer(display, layer, |c| c.plane_alpha = Some(alpha))
    }

    pub fn set_layer_sideband_stream(
        &self,
        display: DisplayId,
        layer: LayerId,
        stream: BufferHandle,
    ) -> Result<()> {
        self.with_layer(display, layer, |c| c.sideband_stream = Some(stream))
    }

    pub fn set_layer_source_crop(&self, display: DisplayId, layer: LayerId, crop: &FRect) -> Result<()> {
        self.with_layer(display, layer, |c| c.source_crop = Some(*crop))
    }

    pub fn set_layer_transform(&self, display: DisplayId, layer: LayerId, transform: Transform) -> Result<()> {
        self.with_layer(display, layer, |c| c.transform = Some(transform))
    }

    pub fn set_layer_visible_region(&self, display: DisplayId, layer: LayerId, visible: &[Rect]) -> Result<()> {
        self.with_layer(display, layer, |c| c.visible_region = Some(visible.to_vec()))
    }

    pub fn set_layer_z_order(&self, display: DisplayId, layer: LayerId, z: u32) -> Result<()> {
        self.with_layer(display, layer, |c| c.z = Some(z))
    }

    pub fn set_layer_per_frame_metadata(
        &self,
        display: DisplayId,
        layer: LayerId,
        metadata: &[PerFrameMetadata],
    ) -> Result<()> {
        self.with_layer(display, layer, |c| c.per_frame_metadata = Some(metadata.to_vec()))
    }

    pub fn set_layer_per_frame_metadata_blobs(
        &self,
        display: DisplayId,
        layer: LayerId,
        blobs: &[PerFrameMetadataBlob],
    ) -> Result<()> {
        self.with_layer(display, layer, |c| c.per_frame_metadata_blobs = Some(blobs.to_vec()))
    }

    pub fn get_per_frame_metadata_keys(&self, display: DisplayId) -> Result<Vec<PerFrameMetadataKey>> {
        from_rpc(
            "getPerFrameMetadataKeys",
            self.client.get_per_frame_metadata_keys(display),
        )
    }

    pub fn set_layer_color_transform(
        &self,
        display: DisplayId,
        layer: LayerId,
        matrix: &[f32; 16],
    ) -> Result<()> {
        self.with_layer(display, layer, |c| c.color_transform = Some(*matrix))
    }

    pub fn get_display_identification_data(&self, display: DisplayId) -> Result<DisplayIdentification> {
        from_rpc(
            "getDisplayIdentificationData",
            self.client.get_display_identification_data(display),
        )
    }

    pub fn set_display_brightness(&self, display: DisplayId, brightness: f32) -> Result<()> {
        from_rpc(
            "setDisplayBrightness",
            self.client.set_display_brightness(display, brightness),
        )
    }

    pub fn get_display_capabilities(&self, display: DisplayId) -> Result<Vec<DisplayCapability>> {
        from_rpc(
            "getDisplayCapabilities",
            self.client.get_display_capabilities(display),
        )
    }

    pub fn get_display_connection_type(&self, display: DisplayId) -> Result<DisplayConnectionType> {
        from_rpc(
            "getDisplayConnectionType",
            self.client.get_display_connection_type(display),
        )
    }

    pub fn get_display_vsync_period(&self, display: DisplayId) -> Result<u32> {
        from_rpc("getDisplayVsyncPeriod", self.client.get_display_vsync_period(display))
    }

    pub fn set_active_config_with_constraints(
        &self,
        display: DisplayId,
        config: ConfigId,
        constraints: VsyncPeriodChangeConstraints,
    ) -> Result<VsyncPeriodChangeTimeline> {
        from_rpc(
            "setActiveConfigWithConstraints",
            self.client
                .set_active_config_with_constraints(display, config, constraints),
        )
    }

    pub fn set_auto_low_latency_mode(&self, display: DisplayId, on: bool) -> Result<()> {
        from_rpc("setAutoLowLatencyMode", self.client.set_auto_low_latency_mode(display, on))
    }

    pub fn get_supported_content_types(&self, display: DisplayId) -> Result<Vec<ContentType>> {
        from_rpc(
            "getSupportedContentTypes",
            self.client.get_supported_content_types(display),
        )
    }

    pub fn set_content_type(&self, display: DisplayId, content_type: ContentType) -> Result<()> {
        from_rpc("setContentType", self.client.set_content_type(display, content_type))
    }

    pub fn get_client_target_property(&self, display: DisplayId) -> Result<ClientTargetProperty> {
        Ok(self.state().reader.take_client_target_property(display))
    }

    pub fn set_layer_brightness(&self, display: DisplayId, layer: LayerId, brightness: f32) -> Result<()> {
        self.with_layer(display, layer, |c| c.brightness = Some(brightness))
    }

    pub fn set_layer_blocking_region(&self, display: DisplayId, layer: LayerId, blocking: &[Rect]) -> Result<()> {
        self.with_layer(display, layer, |c| c.blocking_region = Some(blocking.to_vec()))
    }

    pub fn set_boot_display_config(&self, display: DisplayId, config: ConfigId) -> Result<()> {
        from_rpc("setBootDisplayConfig", self.client.set_boot_display_config(display, config))
    }

    pub fn clear_boot_display_config(&self, display: DisplayId) -> Result<()> {
        from_rpc("clearBootDisplayConfig", self.client.clear_boot_display_config(display))
    }

    pub fn get_preferred_boot_display_config(&self, display: DisplayId) -> Result<ConfigId> {
        from_rpc(
            "getPreferredBootDisplayConfig",
            self.client.get_preferred_boot_display_config(display),
        )
    }

    pub fn get_display_decoration_support(
        &self,
        display: DisplayId,
    ) -> Result<Option<DisplayDecorationSupport>> {
        from_rpc(
            "getDisplayDecorationSupport",
            self.client.get_display_decoration_support(display),
        )
    }

    pub fn set_idle_timer_enabled(&self, display: DisplayId, timeout: Duration) -> Result<()> {
        let timeout_ms = i32::try_from(timeout.as_millis()).map_err(|_| Error::BadParameter)?;
        from_rpc("setIdleTimerEnabled", self.client.set_idle_timer_enabled(display, timeout_ms))
    }

    pub fn get_physical_display_orientation(&self, display: DisplayId) -> Result<Transform> {
        from_rpc(
            "getDisplayPhysicalOrientation",
            self.client.get_display_physical_orientation(display),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_name() {
        assert_eq!(
            instance_name("default"),
            "android.hardware.graphics.composer3.IComposer/default"
        );
    }

    fn error_at(command_index: i32, error: Error) -> CommandError {
        CommandError { command_index, error_code: error.code() }
    }

    #[test]
    fn test_only_flush_errors_fail_the_batch() {
        // [set layer state, validate]
        let flushes = [false, true];
        assert_eq!(batch_result(&flushes, vec![error_at(0, Error::BadLayer)]), Ok(()));
        assert_eq!(
            batch_result(&flushes, vec![error_at(1, Error::NotValidated)]),
            Err(Error::NotValidated)
        );
        assert_eq!(batch_result(&flushes, Vec::new()), Ok(()));
    }

    #[test]
    fn test_error_index_outside_batch() {
        let flushes = [true];
        assert_eq!(
            batch_result(&flushes, vec![error_at(1, Error::NoResources)]),
            Err(Error::BadParameter)
        );
        assert_eq!(
            batch_result(&flushes, vec![error_at(-1, Error::NoResources)]),
            Err(Error::BadParameter)
        );
    }
}
