//! Legacy command-queue composer adapter
//!
//! State mutations are encoded by [`CommandWriter`] into fixed-format records
//! and flushed through one `execute_commands` round trip. Queries are direct
//! RPCs on the [`LegacyClient`].

pub mod client;
pub mod command;
pub mod queue;
pub mod reader;
pub mod writer;

pub use client::{ExecuteReply, LegacyCallback, LegacyClient, LegacyComposerService, LegacyVersion};

use crate::composer::ComposerCallback;
use crate::error::{from_rpc, Error};
use crate::hal::{
    Attribute, BlendMode, BufferHandle, Capability, ChangeCounts, ClientTargetProperty, Color,
    ColorMode, ColorTransform, Composition, ConfigId, ContentType, Dataspace, DisplayCapability,
    DisplayConnectionType, DisplayDecorationSupport, DisplayId, DisplayIdentification,
    DisplayRequests, DisplayType, FRect, HdrCapabilities, LayerId, OptionalFeature,
    PerFrameMetadata, PerFrameMetadataBlob, PerFrameMetadataKey, PixelFormat, PowerMode,
    PresentOrValidate, Rect, RenderIntent, Transform, Vsync, VsyncPeriodChangeConstraints,
    VsyncPeriodChangeTimeline, IDENTITY_MATRIX, NUM_BUFFER_SLOTS,
};
use crate::Result;
use reader::CommandReader;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use writer::{CommandWriter, WRITER_INITIAL_SIZE};

/// Virtual displays render into a single output buffer
const VIRTUAL_DISPLAY_BUFFER_SLOTS: u32 = 1;

struct CommandState {
    writer: CommandWriter,
    reader: CommandReader,
}

/// Forwards legacy notifications to a [`ComposerCallback`]
struct CallbackBridge {
    callback: Arc<dyn ComposerCallback>,
    vsync_switching_supported: bool,
}

impl LegacyCallback for CallbackBridge {
    fn on_hotplug(&self, display: DisplayId, connected: bool) {
        self.callback.on_hotplug(display, connected);
    }

    fn on_refresh(&self, display: DisplayId) {
        self.callback.on_refresh(display);
    }

    fn on_vsync(&self, display: DisplayId, timestamp: i64) {
        // 2.4 servers report vsync through on_vsync_2_4 only
        if !self.vsync_switching_supported {
            self.callback.on_vsync(display, timestamp, None);
        }
    }

    fn on_vsync_2_4(&self, display: DisplayId, timestamp: i64, vsync_period_nanos: u32) {
        if self.vsync_switching_supported {
            self.callback.on_vsync(display, timestamp, Some(vsync_period_nanos));
        }
    }

    fn on_vsync_period_timing_changed(&self, display: DisplayId, timeline: VsyncPeriodChangeTimeline) {
        self.callback.on_vsync_period_timing_changed(display, timeline);
    }

    fn on_seamless_possible(&self, display: DisplayId) {
        self.callback.on_seamless_possible(display);
    }
}

pub struct LegacyComposer {
    service: Arc<dyn LegacyComposerService>,
    client: Arc<dyn LegacyClient>,
    version: LegacyVersion,
    state: Mutex<CommandState>,
}

impl LegacyComposer {
    /// Connect to `service`. A service that refuses a client is fatal.
    pub fn new(service: Arc<dyn LegacyComposerService>) -> Self {
        let version = service.version();
        let client = match service.create_client() {
            Ok(client) => client,
            Err(e) => panic!("failed to create legacy composer client: {}", e),
        };
        info!("Connected to legacy composer {:?}", version);

        Self {
            service,
            client,
            version,
            state: Mutex::new(CommandState {
                writer: CommandWriter::new(WRITER_INITIAL_SIZE),
                reader: CommandReader::new(),
            }),
        }
    }

    pub fn version(&self) -> LegacyVersion {
        self.version
    }

    fn state(&self) -> MutexGuard<'_, CommandState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn require(&self, version: LegacyVersion) -> Result<()> {
        if self.version >= version {
            Ok(())
        } else {
            Err(Error::Unsupported)
        }
    }

    /// Queue a layer record behind the right selectors
    fn with_layer(
        &self,
        display: DisplayId,
        layer: LayerId,
        f: impl FnOnce(&mut CommandWriter),
    ) -> Result<()> {
        let mut state = self.state();
        state.writer.select_display(display);
        state.writer.select_layer(layer);
        f(&mut state.writer);
        Ok(())
    }

    fn with_display(&self, display: DisplayId, f: impl FnOnce(&mut CommandWriter)) -> Result<()> {
        let mut state = self.state();
        state.writer.select_display(display);
        f(&mut state.writer);
        Ok(())
    }

    pub fn is_supported(&self, feature: OptionalFeature) -> bool {
        match feature {
            OptionalFeature::RefreshRateSwitching => self.version == LegacyVersion::V2_4,
            OptionalFeature::ExpectedPresentTime
            | OptionalFeature::DisplayBrightnessCommand
            | OptionalFeature::KernelIdleTimer
            | OptionalFeature::PhysicalDisplayOrientation => false,
        }
    }

    pub fn get_capabilities(&self) -> Vec<Capability> {
        from_rpc("getCapabilities", self.service.get_capabilities()).unwrap_or_default()
    }

    pub fn dump_debug_info(&self) -> String {
        from_rpc("dumpDebugInfo", self.service.dump_debug_info()).unwrap_or_default()
    }

    pub fn register_callback(&self, callback: Arc<dyn ComposerCallback>) -> Result<()> {
        let bridge = Arc::new(CallbackBridge {
            callback,
            vsync_switching_supported: self.is_supported(OptionalFeature::RefreshRateSwitching),
        });
        from_rpc("registerCallback", self.client.register_callback(bridge))
    }

    pub fn reset_commands(&self) {
        self.state().writer.reset();
    }

    /// Flush the queued batch
    pub fn execute_commands(&self) -> Result<()> {
        let mut state = self.state();
        let result = self.execute(&mut state);
        state.writer.reset();
        result
    }

    fn execute(&self, state: &mut CommandState) -> Result<()> {
        let CommandState { writer, reader } = state;

        let Some(written) = writer.write_queue() else {
            error!("failed to write command queue");
            return Err(Error::NoResources);
        };

        if written.changed {
            if let Some(queue) = writer.queue().cloned() {
                let registered =
                    from_rpc("setInputCommandQueue", self.client.set_input_command_queue(queue));
                if let Err(e) = registered {
                    writer.forget_queue();
                    return Err(e);
                }
            }
        }

        if written.length == 0 {
            return Ok(());
        }

        let reply = from_rpc(
            "executeCommands",
            self.client.execute_commands(written.length, written.handles),
        )?;

        if reply.out_queue_changed || !reader.has_queue() {
            let queue = from_rpc("getOutputCommandQueue", self.client.get_output_command_queue())?;
            reader.set_queue(queue);
        }

        if !reader.read_queue(reply.out_length, reply.out_handles) {
            error!("failed to read {} reply words", reply.out_length);
            return Err(Error::NoResources);
        }
        reader.parse()?;

        let mut result = Ok(());
        for command_error in reader.take_errors() {
            let command = writer.command_at(command_error.location);
            let error = match Error::check(command_error.code) {
                Err(error) => error,
                Ok(()) => continue,
            };
            match command {
                Some(command) if command.is_flush() => result = Err(error),
                _ => warn!(
                    "command {:?} at {} failed: {}",
                    command, command_error.location, error
                ),
            }
        }
        result
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
            self.client
                .create_virtual_display(width, height, format, VIRTUAL_DISPLAY_BUFFER_SLOTS),
        )
    }

    pub fn destroy_virtual_display(&self, display: DisplayId) -> Result<()> {
        from_rpc("destroyVirtualDisplay", self.client.destroy_virtual_display(display))
    }

    pub fn accept_display_changes(&self, display: DisplayId) -> Result<()> {
        self.with_display(display, |w| w.accept_display_changes())
    }

    pub fn create_layer(&self, display: DisplayId) -> Result<LayerId> {
        from_rpc(
            "createLayer",
            self.client.create_layer(display, NUM_BUFFER_SLOTS + 1),
        )
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

    pub fn get_doze_support(&self, display: DisplayId) -> Result<bool> {
        from_rpc("getDozeSupport", self.client.get_doze_support(display))
    }

    pub fn has_display_idle_timer_capability(&self, display: DisplayId) -> Result<bool> {
        panic!(
            "has_display_idle_timer_capability({}) called on a legacy composer",
            display
        );
    }

    pub fn get_hdr_capabilities(&self, display: DisplayId) -> Result<HdrCapabilities> {
        from_rpc("getHdrCapabilities", self.client.get_hdr_capabilities(display))
    }

    pub fn get_release_fences(&self, display: DisplayId) -> Result<Vec<(LayerId, Option<OwnedFd>)>> {
        Ok(self.state().reader.take_release_fences(display))
    }

    pub fn present_display(&self, display: DisplayId) -> Result<Option<OwnedFd>> {
        let mut state = self.state();
        state.writer.select_display(display);
        state.writer.present_display();
        let result = self.execute(&mut state);
        state.writer.reset();
        result?;

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
        self.with_display(display, |w| {
            w.set_client_target(slot, target, acquire_fence, dataspace, damage)
        })
    }

    pub fn set_color_mode(&self, display: DisplayId, mode: ColorMode, intent: RenderIntent) -> Result<()> {
        from_rpc("setColorMode", self.client.set_color_mode(display, mode, intent))
    }

    pub fn set_color_transform(&self, display: DisplayId, matrix: &[f32; 16]) -> Result<()> {
        let hint = if *matrix == IDENTITY_MATRIX {
            ColorTransform::Identity
        } else {
            ColorTransform::ArbitraryMatrix
        };
        self.with_display(display, |w| w.set_color_transform(matrix, hint))
    }

    pub fn set_output_buffer(
        &self,
        display: DisplayId,
        buffer: Option<BufferHandle>,
        release_fence: Option<OwnedFd>,
    ) -> Result<()> {
        self.with_display(display, |w| w.set_output_buffer(0, buffer, release_fence))
    }

    pub fn set_power_mode(&self, display: DisplayId, mode: PowerMode) -> Result<()> {
        if mode == PowerMode::OnSuspend && self.version == LegacyVersion::V2_1 {
            return Err(Error::Unsupported);
        }
        from_rpc("setPowerMode", self.client.set_power_mode(display, mode))
    }

    pub fn set_vsync_enabled(&self, display: DisplayId, enabled: Vsync) -> Result<()> {
        from_rpc("setVsyncEnabled", self.client.set_vsync_enabled(display, enabled))
    }

    pub fn set_client_target_slot_count(&self, display: DisplayId) -> Result<()> {
        from_rpc(
            "setClientTargetSlotCount",
            self.client.set_client_target_slot_count(display, NUM_BUFFER_SLOTS),
        )
    }

    /// Validate the queued state. Legacy servers take no expected present time.
    pub fn validate_display(&self, display: DisplayId, _expected_present_time: i64) -> Result<ChangeCounts> {
        let mut state = self.state();
        state.writer.select_display(display);
        state.writer.validate_display();
        let result = self.execute(&mut state);
        state.writer.reset();
        match result {
            Ok(()) | Err(Error::HasChanges) => Ok(state.reader.has_changes(display)),
            Err(e) => Err(e),
        }
    }

    pub fn present_or_validate_display(
        &self,
        display: DisplayId,
        _expected_present_time: i64,
    ) -> Result<PresentOrValidate> {
        let mut state = self.state();
        state.writer.select_display(display);
        state.writer.present_or_validate_display();
        let result = self.execute(&mut state);
        state.writer.reset();
        match result {
            Ok(()) | Err(Error::HasChanges) => {}
            Err(e) => return Err(e),
        }

        match state.reader.take_present_or_validate_state(display) {
            Some(1) => Ok(PresentOrValidate::Presented(
                state.reader.take_present_fence(display),
            )),
            Some(_) => Ok(PresentOrValidate::Validated(state.reader.has_changes(display))),
            None => Err(Error::NoResources),
        }
    }

    pub fn set_cursor_position(&self, display: DisplayId, layer: LayerId, x: i32, y: i32) -> Result<()> {
        self.with_layer(display, layer, |w| w.set_layer_cursor_position(x, y))
    }

    pub fn set_layer_buffer(
        &self,
        display: DisplayId,
        layer: LayerId,
        slot: u32,
        buffer: Option<BufferHandle>,
        acquire_fence: Option<OwnedFd>,
    ) -> Result<()> {
        self.with_layer(display, layer, |w| w.set_layer_buffer(slot, buffer, acquire_fence))
    }

    pub fn set_layer_surface_damage(&self, display: DisplayId, layer: LayerId, damage: &[Rect]) -> Result<()> {
        self.with_layer(display, layer, |w| w.set_layer_surface_damage(damage))
    }

    pub fn set_layer_blend_mode(&self, display: DisplayId, layer: LayerId, mode: BlendMode) -> Result<()> {
        self.with_layer(display, layer, |w| w.set_layer_blend_mode(mode))
    }

    pub fn set_layer_color(&self, display: DisplayId, layer: LayerId, color: Color) -> Result<()> {
        self.with_layer(display, layer, |w| w.set_layer_color(color.to_rgba8()))
    }

    pub fn set_layer_composition_type(
        &self,
        display: DisplayId,
        layer: LayerId,
        composition: Composition,
    ) -> Result<()> {
        if composition.raw() > Composition::Sideband.raw() {
            panic!("composition type {:?} is not supported by a legacy composer", composition);
        }
        self.with_layer(display, layer, |w| w.set_layer_composition_type(composition))
    }

    pub fn set_layer_dataspace(&self, display: DisplayId, layer: LayerId, dataspace: Dataspace) -> Result<()> {
        self.with_layer(display, layer, |w| w.set_layer_dataspace(dataspace))
    }

    pub fn set_layer_display_frame(&self, display: DisplayId, layer: LayerId, frame: &Rect) -> Result<()> {
        self.with_layer(display, layer, |w| w.set_layer_display_frame(frame))
    }

    pub fn set_layer_plane_alpha(&self, display: DisplayId, layer: LayerId, alpha: f32) -> Result<()> {
        self.with_layer(display, layer, |w| w.set_layer_plane_alpha(alpha))
    }

    pub fn set_layer_sideband_stream(
        &self,
        display: DisplayId,
        layer: LayerId,
        stream: BufferHandle,
    ) -> Result<()> {
        self.with_layer(display, layer, |w| w.set_layer_sideband_stream(stream))
    }

    pub fn set_layer_source_crop(&self, display: DisplayId, layer: LayerId, crop: &FRect) -> Result<()> {
        self.with_layer(display, layer, |w| w.set_layer_source_crop(crop))
    }

    pub fn set_layer_transform(&self, display: DisplayId, layer: LayerId, transform: Transform) -> Result<()> {
        self.with_layer(display, layer, |w| w.set_layer_transform(transform))
    }

    pub fn set_layer_visible_region(&self, display: DisplayId, layer: LayerId, visible: &[Rect]) -> Result<()> {
        self.with_layer(display, layer, |w| w.set_layer_visible_region(visible))
    }

    pub fn set_layer_z_order(&self, display: DisplayId, layer: LayerId, z: u32) -> Result<()> {
        self.with_layer(display, layer, |w| w.set_layer_z_order(z))
    }

    pub fn set_layer_per_frame_metadata(
        &self,
        display: DisplayId,
        layer: LayerId,
        metadata: &[PerFrameMetadata],
    ) -> Result<()> {
        self.require(LegacyVersion::V2_2)?;
        self.with_layer(display, layer, |w| w.set_layer_per_frame_metadata(metadata))
    }

    pub fn set_layer_per_frame_metadata_blobs(
        &self,
        display: DisplayId,
        layer: LayerId,
        blobs: &[PerFrameMetadataBlob],
    ) -> Result<()> {
        self.require(LegacyVersion::V2_3)?;
        self.with_layer(display, layer, |w| w.set_layer_per_frame_metadata_blobs(blobs))
    }

    pub fn get_per_frame_metadata_keys(&self, display: DisplayId) -> Result<Vec<PerFrameMetadataKey>> {
        if self.version < LegacyVersion::V2_2 {
            return Ok(Vec::new());
        }
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
        self.require(LegacyVersion::V2_3)?;
        self.with_layer(display, layer, |w| w.set_layer_color_transform(matrix))
    }

    pub fn get_display_identification_data(&self, display: DisplayId) -> Result<DisplayIdentification> {
        self.require(LegacyVersion::V2_3)?;
        from_rpc(
            "getDisplayIdentificationData",
            self.client.get_display_identification_data(display),
        )
    }

    pub fn set_display_brightness(&self, display: DisplayId, brightness: f32) -> Result<()> {
        self.require(LegacyVersion::V2_3)?;
        from_rpc(
            "setDisplayBrightness",
            self.client.set_display_brightness(display, brightness),
        )
    }

    pub fn get_display_capabilities(&self, display: DisplayId) -> Result<Vec<DisplayCapability>> {
        self.require(LegacyVersion::V2_3)?;
        from_rpc(
            "getDisplayCapabilities",
            self.client.get_display_capabilities(display),
        )
    }

    pub fn get_display_connection_type(&self, display: DisplayId) -> Result<DisplayConnectionType> {
        self.require(LegacyVersion::V2_4)?;
        from_rpc(
            "getDisplayConnectionType",
            self.client.get_display_connection_type(display),
        )
    }

    pub fn get_display_vsync_period(&self, display: DisplayId) -> Result<u32> {
        self.require(LegacyVersion::V2_4)?;
        from_rpc("getDisplayVsyncPeriod", self.client.get_display_vsync_period(display))
    }

    pub fn set_active_config_with_constraints(
        &self,
        display: DisplayId,
        config: ConfigId,
        constraints: VsyncPeriodChangeConstraints,
    ) -> Result<VsyncPeriodChangeTimeline> {
        self.require(LegacyVersion::V2_4)?;
        from_rpc(
            "setActiveConfigWithConstraints",
            self.client
                .set_active_config_with_constraints(display, config, constraints),
        )
    }

    pub fn set_auto_low_latency_mode(&self, display: DisplayId, on: bool) -> Result<()> {
        self.require(LegacyVersion::V2_4)?;
        from_rpc("setAutoLowLatencyMode", self.client.set_auto_low_latency_mode(display, on))
    }

    pub fn get_supported_content_types(&self, display: DisplayId) -> Result<Vec<ContentType>> {
        self.require(LegacyVersion::V2_4)?;
        from_rpc(
            "getSupportedContentTypes",
            self.client.get_supported_content_types(display),
        )
    }

    pub fn set_content_type(&self, display: DisplayId, content_type: ContentType) -> Result<()> {
        self.require(LegacyVersion::V2_4)?;
        from_rpc("setContentType", self.client.set_content_type(display, content_type))
    }

    pub fn get_client_target_property(&self, display: DisplayId) -> Result<ClientTargetProperty> {
        self.require(LegacyVersion::V2_4)?;
        Ok(self.state().reader.take_client_target_property(display))
    }

    pub fn set_layer_brightness(&self, _display: DisplayId, _layer: LayerId, _brightness: f32) -> Result<()> {
        Ok(())
    }

    pub fn set_layer_blocking_region(&self, _display: DisplayId, _layer: LayerId, _blocking: &[Rect]) -> Result<()> {
        Ok(())
    }

    pub fn set_boot_display_config(&self, _display: DisplayId, _config: ConfigId) -> Result<()> {
        Err(Error::Unsupported)
    }

    pub fn clear_boot_display_config(&self, _display: DisplayId) -> Result<()> {
        Err(Error::Unsupported)
    }

    pub fn get_preferred_boot_display_config(&self, _display: DisplayId) -> Result<ConfigId> {
        Err(Error::Unsupported)
    }

    pub fn get_display_decoration_support(
        &self,
        _display: DisplayId,
    ) -> Result<Option<DisplayDecorationSupport>> {
        Err(Error::Unsupported)
    }

    pub fn set_idle_timer_enabled(&self, display: DisplayId, timeout: Duration) -> Result<()> {
        panic!(
            "set_idle_timer_enabled({}, {:?}) called on a legacy composer",
            display, timeout
        );
    }

    pub fn get_physical_display_orientation(&self, display: DisplayId) -> Result<Transform> {
        panic!(
            "get_physical_display_orientation({}) called on a legacy composer",
            display
        );
    }
}

impl Drop for LegacyComposer {
    fn drop(&mut self) {
        debug!("Dropping legacy composer {:?}", self.version);
    }
}
