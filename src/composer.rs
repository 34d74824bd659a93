//! Composer facade
//!
//! One operation set over whichever protocol adapter the service registry
//! offers. The structured service wins when it is declared.

use crate::hal::{
    Attribute, BlendMode, BufferHandle, Capability, ChangeCounts, ClientTargetProperty, Color,
    ColorMode, Composition, ConfigId, ContentType, Dataspace, DisplayCapability,
    DisplayConnectionType, DisplayDecorationSupport, DisplayId, DisplayIdentification,
    DisplayRequests, DisplayType, FRect, HdrCapabilities, LayerId, OptionalFeature,
    PerFrameMetadata, PerFrameMetadataBlob, PerFrameMetadataKey, PixelFormat, PowerMode,
    PresentOrValidate, Rect, RenderIntent, Transform, Vsync, VsyncPeriodChangeConstraints,
    VsyncPeriodChangeTimeline,
};
use crate::legacy::{LegacyComposer, LegacyComposerService};
use crate::structured::{self, StructuredComposer, StructuredComposerService};
use crate::Result;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Server-initiated notifications, normalized across both protocols
pub trait ComposerCallback: Send + Sync {
    fn on_hotplug(&self, display: DisplayId, connected: bool);
    fn on_refresh(&self, display: DisplayId);
    /// `vsync_period_nanos` is `None` when the server predates refresh-rate
    /// switching
    fn on_vsync(&self, display: DisplayId, timestamp: i64, vsync_period_nanos: Option<u32>);

    fn on_vsync_period_timing_changed(
        &self,
        _display: DisplayId,
        _timeline: VsyncPeriodChangeTimeline,
    ) {
    }

    fn on_seamless_possible(&self, _display: DisplayId) {}

    fn on_vsync_idle(&self, _display: DisplayId) {}
}

/// Platform service registry
pub trait ServiceManager: Send + Sync {
    /// Whether a structured instance is declared under `instance`
    fn is_declared(&self, instance: &str) -> bool;
    fn get_structured(&self, instance: &str) -> Option<Arc<dyn StructuredComposerService>>;
    fn get_legacy(&self, name: &str) -> Option<Arc<dyn LegacyComposerService>>;
}

pub enum Composer {
    Legacy(LegacyComposer),
    Structured(StructuredComposer),
}

impl Composer {
    /// Connect to the composer service called `service_name`.
    ///
    /// A composer without a working backend cannot run, so failing to reach
    /// the chosen service panics.
    pub fn create(service_name: &str, services: &dyn ServiceManager) -> Composer {
        let instance = structured::instance_name(service_name);
        if services.is_declared(&instance) {
            let Some(service) = services.get_structured(&instance) else {
                panic!("structured composer {} is declared but unavailable", instance);
            };
            info!("Using structured composer {}", instance);
            return Composer::Structured(StructuredComposer::new(service));
        }

        let Some(service) = services.get_legacy(service_name) else {
            panic!("failed to get legacy composer service {}", service_name);
        };
        info!("Using legacy composer {}", service_name);
        Composer::Legacy(LegacyComposer::new(service))
    }

    pub fn is_structured(&self) -> bool {
        matches!(self, Composer::Structured(_))
    }
}

macro_rules! delegate {
    ($(fn $name:ident(&self $(, $arg:ident: $ty:ty)* $(,)?) -> $ret:ty;)+) => {
        impl Composer {
            $(
                pub fn $name(&self $(, $arg: $ty)*) -> $ret {
                    match self {
                        Composer::Legacy(c) => c.$name($($arg),*),
                        Composer::Structured(c) => c.$name($($arg),*),
                    }
                }
            )+
        }
    };
}

delegate! {
    fn is_supported(&self, feature: OptionalFeature) -> bool;
    fn get_capabilities(&self) -> Vec<Capability>;
    fn dump_debug_info(&self) -> String;
    fn register_callback(&self, callback: Arc<dyn ComposerCallback>) -> Result<()>;
    fn reset_commands(&self) -> ();
    fn execute_commands(&self) -> Result<()>;

    fn get_max_virtual_display_count(&self) -> Result<u32>;
    fn create_virtual_display(&self, width: u32, height: u32, format: PixelFormat) -> Result<(DisplayId, PixelFormat)>;
    fn destroy_virtual_display(&self, display: DisplayId) -> Result<()>;

    fn accept_display_changes(&self, display: DisplayId) -> Result<()>;
    fn create_layer(&self, display: DisplayId) -> Result<LayerId>;
    fn destroy_layer(&self, display: DisplayId, layer: LayerId) -> Result<()>;
    fn get_active_config(&self, display: DisplayId) -> Result<ConfigId>;
    fn get_changed_composition_types(&self, display: DisplayId) -> Result<Vec<(LayerId, Composition)>>;
    fn get_color_modes(&self, display: DisplayId) -> Result<Vec<ColorMode>>;
    fn get_display_attribute(&self, display: DisplayId, config: ConfigId, attribute: Attribute) -> Result<i32>;
    fn get_display_configs(&self, display: DisplayId) -> Result<Vec<ConfigId>>;
    fn get_display_name(&self, display: DisplayId) -> Result<String>;
    fn get_display_requests(&self, display: DisplayId) -> Result<DisplayRequests>;
    fn get_display_type(&self, display: DisplayId) -> Result<DisplayType>;
    fn get_doze_support(&self, display: DisplayId) -> Result<bool>;
    fn has_display_idle_timer_capability(&self, display: DisplayId) -> Result<bool>;
    fn get_hdr_capabilities(&self, display: DisplayId) -> Result<HdrCapabilities>;
    fn get_release_fences(&self, display: DisplayId) -> Result<Vec<(LayerId, Option<OwnedFd>)>>;
    fn present_display(&self, display: DisplayId) -> Result<Option<OwnedFd>>;
    fn set_active_config(&self, display: DisplayId, config: ConfigId) -> Result<()>;
    fn set_client_target(
        &self,
        display: DisplayId,
        slot: u32,
        target: Option<BufferHandle>,
        acquire_fence: Option<OwnedFd>,
        dataspace: Dataspace,
        damage: &[Rect]
    ) -> Result<()>;
    fn set_color_mode(&self, display: DisplayId, mode: ColorMode, intent: RenderIntent) -> Result<()>;
    fn set_color_transform(&self, display: DisplayId, matrix: &[f32; 16]) -> Result<()>;
    fn set_output_buffer(&self, display: DisplayId, buffer: Option<BufferHandle>, release_fence: Option<OwnedFd>) -> Result<()>;
    fn set_power_mode(&self, display: DisplayId, mode: PowerMode) -> Result<()>;
    fn set_vsync_enabled(&self, display: DisplayId, enabled: Vsync) -> Result<()>;
    fn set_client_target_slot_count(&self, display: DisplayId) -> Result<()>;
    fn validate_display(&self, display: DisplayId, expected_present_time: i64) -> Result<ChangeCounts>;
    fn present_or_validate_display(&self, display: DisplayId, expected_present_time: i64) -> Result<PresentOrValidate>;

    fn set_cursor_position(&self, display: DisplayId, layer: LayerId, x: i32, y: i32) -> Result<()>;
    fn set_layer_buffer(
        &self,
        display: DisplayId,
        layer: LayerId,
        slot: u32,
        buffer: Option<BufferHandle>,
        acquire_fence: Option<OwnedFd>
    ) -> Result<()>;
    fn set_layer_surface_damage(&self, display: DisplayId, layer: LayerId, damage: &[Rect]) -> Result<()>;
    fn set_layer_blend_mode(&self, display: DisplayId, layer: LayerId, mode: BlendMode) -> Result<()>;
    fn set_layer_color(&self, display: DisplayId, layer: LayerId, color: Color) -> Result<()>;
    fn set_layer_composition_type(&self, display: DisplayId, layer: LayerId, composition: Composition) -> Result<()>;
    fn set_layer_dataspace(&self, display: DisplayId, layer: LayerId, dataspace: Dataspace) -> Result<()>;
    fn set_layer_display_frame(&self, display: DisplayId, layer: LayerId, frame: &Rect) -> Result<()>;
    fn set_layer_plane_alpha(&self, display: DisplayId, layer: LayerId, alpha: f32) -> Result<()>;
    fn set_layer_sideband_stream(&self, display: DisplayId, layer: LayerId, stream: BufferHandle) -> Result<()>;
    fn set_layer_source_crop(&self, display: DisplayId, layer: LayerId, crop: &FRect) -> Result<()>;
    fn set_layer_transform(&self, display: DisplayId, layer: LayerId, transform: Transform) -> Result<()>;
    fn set_layer_visible_region(&self, display: DisplayId, layer: LayerId, visible: &[Rect]) -> Result<()>;
    fn set_layer_z_order(&self, display: DisplayId, layer: LayerId, z: u32) -> Result<()>;
    fn set_layer_per_frame_metadata(&self, display: DisplayId, layer: LayerId, metadata: &[PerFrameMetadata]) -> Result<()>;
    fn set_layer_per_frame_metadata_blobs(&self, display: DisplayId, layer: LayerId, blobs: &[PerFrameMetadataBlob]) -> Result<()>;
    fn get_per_frame_metadata_keys(&self, display: DisplayId) -> Result<Vec<PerFrameMetadataKey>>;
    fn set_layer_color_transform(&self, display: DisplayId, layer: LayerId, matrix: &[f32; 16]) -> Result<()>;

    fn get_display_identification_data(&self, display: DisplayId) -> Result<DisplayIdentification>;
    fn set_display_brightness(&self, display: DisplayId, brightness: f32) -> Result<()>;
    fn get_display_capabilities(&self, display: DisplayId) -> Result<Vec<DisplayCapability>>;
    fn get_display_connection_type(&self, display: DisplayId) -> Result<DisplayConnectionType>;
    fn get_display_vsync_period(&self, display: DisplayId) -> Result<u32>;
    fn set_active_config_with_constraints(
        &self,
        display: DisplayId,
        config: ConfigId,
        constraints: VsyncPeriodChangeConstraints
    ) -> Result<VsyncPeriodChangeTimeline>;
    fn set_auto_low_latency_mode(&self, display: DisplayId, on: bool) -> Result<()>;
    fn get_supported_content_types(&self, display: DisplayId) -> Result<Vec<ContentType>>;
    fn set_content_type(&self, display: DisplayId, content_type: ContentType) -> Result<()>;
    fn get_client_target_property(&self, display: DisplayId) -> Result<ClientTargetProperty>;

    fn set_layer_brightness(&self, display: DisplayId, layer: LayerId, brightness: f32) -> Result<()>;
    fn set_layer_blocking_region(&self, display: DisplayId, layer: LayerId, blocking: &[Rect]) -> Result<()>;

    fn set_boot_display_config(&self, display: DisplayId, config: ConfigId) -> Result<()>;
    fn clear_boot_display_config(&self, display: DisplayId) -> Result<()>;
    fn get_preferred_boot_display_config(&self, display: DisplayId) -> Result<ConfigId>;
    fn get_display_decoration_support(&self, display: DisplayId) -> Result<Option<DisplayDecorationSupport>>;

    fn set_idle_timer_enabled(&self, display: DisplayId, timeout: Duration) -> Result<()>;
    fn get_physical_display_orientation(&self, display: DisplayId) -> Result<Transform>;
}
