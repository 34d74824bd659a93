//! Transport traits for the structured composer service

use super::message::{CommandResultPayload, DisplayCommand};
use crate::composer::ComposerCallback;
use crate::error::RpcResult;
use crate::hal::{
    Attribute, Capability, ColorMode, ConfigId, ContentType, DisplayCapability,
    DisplayConnectionType, DisplayDecorationSupport, DisplayId, DisplayIdentification,
    DisplayType, HdrCapabilities, LayerId, PerFrameMetadataKey, PixelFormat, PowerMode,
    RenderIntent, Transform, VsyncPeriodChangeConstraints, VsyncPeriodChangeTimeline,
};
use std::sync::Arc;

/// Entry point of the structured service
pub trait StructuredComposerService: Send + Sync {
    fn interface_version(&self) -> RpcResult<i32>;
    fn create_client(&self) -> RpcResult<Arc<dyn StructuredClient>>;
    fn get_capabilities(&self) -> RpcResult<Vec<Capability>>;
    fn dump_debug_info(&self) -> RpcResult<String>;
}

/// Per-connection RPCs of the structured service
///
/// Notifications already match [`ComposerCallback`], so the callback is
/// handed to the transport as is.
pub trait StructuredClient: Send + Sync {
    fn register_callback(&self, callback: Arc<dyn ComposerCallback>) -> RpcResult<()>;
    fn execute_commands(&self, commands: Vec<DisplayCommand>)
        -> RpcResult<Vec<CommandResultPayload>>;

    fn get_max_virtual_display_count(&self) -> RpcResult<u32>;
    fn create_virtual_display(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        buffer_slot_count: u32,
    ) -> RpcResult<(DisplayId, PixelFormat)>;
    fn destroy_virtual_display(&self, display: DisplayId) -> RpcResult<()>;
    fn create_layer(&self, display: DisplayId, buffer_slot_count: u32) -> RpcResult<LayerId>;
    fn destroy_layer(&self, display: DisplayId, layer: LayerId) -> RpcResult<()>;

    fn get_active_config(&self, display: DisplayId) -> RpcResult<ConfigId>;
    fn get_color_modes(&self, display: DisplayId) -> RpcResult<Vec<ColorMode>>;
    fn get_display_attribute(
        &self,
        display: DisplayId,
        config: ConfigId,
        attribute: Attribute,
    ) -> RpcResult<i32>;
    fn get_display_configs(&self, display: DisplayId) -> RpcResult<Vec<ConfigId>>;
    fn get_display_name(&self, display: DisplayId) -> RpcResult<String>;
    fn get_display_type(&self, display: DisplayId) -> RpcResult<DisplayType>;
    fn get_hdr_capabilities(&self, display: DisplayId) -> RpcResult<HdrCapabilities>;
    fn get_display_capabilities(&self, display: DisplayId) -> RpcResult<Vec<DisplayCapability>>;
    fn get_display_identification_data(&self, display: DisplayId)
        -> RpcResult<DisplayIdentification>;
    fn get_display_connection_type(&self, display: DisplayId)
        -> RpcResult<DisplayConnectionType>;
    fn get_display_vsync_period(&self, display: DisplayId) -> RpcResult<u32>;
    fn get_per_frame_metadata_keys(&self, display: DisplayId) -> RpcResult<Vec<PerFrameMetadataKey>>;
    fn get_supported_content_types(&self, display: DisplayId) -> RpcResult<Vec<ContentType>>;

    fn set_active_config(&self, display: DisplayId, config: ConfigId) -> RpcResult<()>;
    fn set_active_config_with_constraints(
        &self,
        display: DisplayId,
        config: ConfigId,
        constraints: VsyncPeriodChangeConstraints,
    ) -> RpcResult<VsyncPeriodChangeTimeline>;
    fn set_color_mode(
        &self,
        display: DisplayId,
        mode: ColorMode,
        intent: RenderIntent,
    ) -> RpcResult<()>;
    fn set_power_mode(&self, display: DisplayId, mode: PowerMode) -> RpcResult<()>;
    fn set_vsync_enabled(&self, display: DisplayId, enabled: bool) -> RpcResult<()>;
    fn set_client_target_slot_count(&self, display: DisplayId, count: u32) -> RpcResult<()>;
    fn set_display_brightness(&self, display: DisplayId, brightness: f32) -> RpcResult<()>;
    fn set_auto_low_latency_mode(&self, display: DisplayId, on: bool) -> RpcResult<()>;
    fn set_content_type(&self, display: DisplayId, content_type: ContentType) -> RpcResult<()>;

    fn set_boot_display_config(&self, display: DisplayId, config: ConfigId) -> RpcResult<()>;
    fn clear_boot_display_config(&self, display: DisplayId) -> RpcResult<()>;
    fn get_preferred_boot_display_config(&self, display: DisplayId) -> RpcResult<ConfigId>;
    fn get_display_decoration_support(
        &self,
        display: DisplayId,
    ) -> RpcResult<Option<DisplayDecorationSupport>>;
    fn set_idle_timer_enabled(&self, display: DisplayId, timeout_ms: i32) -> RpcResult<()>;
    fn get_display_physical_orientation(&self, display: DisplayId) -> RpcResult<Transform>;
}
