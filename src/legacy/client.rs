//! Transport traits for the legacy composer service
//!
//! A binding to the real HIDL service implements these. The crate ships an
//! in-process implementation in [`crate::loopback`].

use super::command::WireHandle;
use super::queue::MessageQueue;
use crate::error::RpcResult;
use crate::hal::{
    Attribute, Capability, ColorMode, ConfigId, ContentType, DisplayCapability,
    DisplayConnectionType, DisplayId, DisplayIdentification, DisplayType, HdrCapabilities,
    LayerId, PerFrameMetadataKey, PixelFormat, PowerMode, RenderIntent, Vsync,
    VsyncPeriodChangeConstraints, VsyncPeriodChangeTimeline,
};
use std::sync::Arc;

/// Client interface generation negotiated at connect time
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LegacyVersion {
    V2_1,
    V2_2,
    V2_3,
    V2_4,
}

/// Reply of one `execute_commands` round trip
#[derive(Debug, Default)]
pub struct ExecuteReply {
    pub out_queue_changed: bool,
    pub out_length: u32,
    pub out_handles: Vec<WireHandle>,
}

/// Server-initiated notifications in legacy form
pub trait LegacyCallback: Send + Sync {
    fn on_hotplug(&self, display: DisplayId, connected: bool);
    fn on_refresh(&self, display: DisplayId);
    /// Pre-2.4 vsync
    fn on_vsync(&self, display: DisplayId, timestamp: i64);
    fn on_vsync_2_4(&self, display: DisplayId, timestamp: i64, vsync_period_nanos: u32);
    fn on_vsync_period_timing_changed(&self, display: DisplayId, timeline: VsyncPeriodChangeTimeline);
    fn on_seamless_possible(&self, display: DisplayId);
}

/// Entry point of the legacy service
pub trait LegacyComposerService: Send + Sync {
    fn version(&self) -> LegacyVersion;
    fn create_client(&self) -> RpcResult<Arc<dyn LegacyClient>>;
    fn get_capabilities(&self) -> RpcResult<Vec<Capability>>;
    fn dump_debug_info(&self) -> RpcResult<String>;
}

/// Per-connection RPCs of the legacy service
///
/// Methods a generation lacks are never called by the adapter on a server
/// reporting that generation.
pub trait LegacyClient: Send + Sync {
    fn register_callback(&self, callback: Arc<dyn LegacyCallback>) -> RpcResult<()>;
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
    fn get_doze_support(&self, display: DisplayId) -> RpcResult<bool>;
    fn get_hdr_capabilities(&self, display: DisplayId) -> RpcResult<HdrCapabilities>;
    fn set_active_config(&self, display: DisplayId, config: ConfigId) -> RpcResult<()>;
    fn set_color_mode(
        &self,
        display: DisplayId,
        mode: ColorMode,
        intent: RenderIntent,
    ) -> RpcResult<()>;
    fn set_power_mode(&self, display: DisplayId, mode: PowerMode) -> RpcResult<()>;
    fn set_vsync_enabled(&self, display: DisplayId, enabled: Vsync) -> RpcResult<()>;
    fn set_client_target_slot_count(&self, display: DisplayId, count: u32) -> RpcResult<()>;

    // command queue plumbing
    fn set_input_command_queue(&self, queue: MessageQueue) -> RpcResult<()>;
    fn get_output_command_queue(&self) -> RpcResult<MessageQueue>;
    fn execute_commands(&self, in_length: u32, in_handles: Vec<WireHandle>)
        -> RpcResult<ExecuteReply>;

    // 2.2
    fn get_per_frame_metadata_keys(&self, display: DisplayId) -> RpcResult<Vec<PerFrameMetadataKey>>;

    // 2.3
    fn get_display_identification_data(&self, display: DisplayId)
        -> RpcResult<DisplayIdentification>;
    fn get_display_capabilities(&self, display: DisplayId) -> RpcResult<Vec<DisplayCapability>>;
    fn set_display_brightness(&self, display: DisplayId, brightness: f32) -> RpcResult<()>;

    // 2.4
    fn get_display_connection_type(&self, display: DisplayId)
        -> RpcResult<DisplayConnectionType>;
    fn get_display_vsync_period(&self, display: DisplayId) -> RpcResult<u32>;
    fn set_active_config_with_constraints(
        &self,
        display: DisplayId,
        config: ConfigId,
        constraints: VsyncPeriodChangeConstraints,
    ) -> RpcResult<VsyncPeriodChangeTimeline>;
    fn set_auto_low_latency_mode(&self, display: DisplayId, on: bool) -> RpcResult<()>;
    fn get_supported_content_types(&self, display: DisplayId) -> RpcResult<Vec<ContentType>>;
    fn set_content_type(&self, display: DisplayId, content_type: ContentType) -> RpcResult<()>;
}
