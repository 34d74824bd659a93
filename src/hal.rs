//! HWC2 value types shared by both protocol adapters
//!
//! Enum discriminants match the composer HAL so values can be put on the wire
//! with a plain cast.

/// Display identifier assigned by the composition server
pub type DisplayId = u64;

/// Layer identifier assigned by the composition server
pub type LayerId = u64;

/// Display config identifier
pub type ConfigId = u32;

/// Buffer slots a client target or layer may cycle through
pub const NUM_BUFFER_SLOTS: u32 = 64;

/// Row-major 4x4 identity, the "no color transform" matrix
pub const IDENTITY_MATRIX: [f32; 16] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

macro_rules! hal_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($variant:ident = $value:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[repr(i32)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant = $value),+
        }

        impl $name {
            /// Decode a raw HAL value
            pub fn from_raw(raw: i32) -> Option<Self> {
                match raw {
                    $($value => Some($name::$variant),)+
                    _ => None,
                }
            }

            pub fn raw(self) -> i32 {
                self as i32
            }
        }
    };
}

hal_enum! {
    /// Kind of composition target
    pub enum DisplayType {
        Invalid = 0,
        Physical = 1,
        Virtual = 2,
    }
}

hal_enum! {
    /// How a layer is composited
    pub enum Composition {
        Invalid = 0,
        Client = 1,
        Device = 2,
        SolidColor = 3,
        Cursor = 4,
        Sideband = 5,
        DisplayDecoration = 6,
        RefreshRateIndicator = 7,
    }
}

hal_enum! {
    pub enum BlendMode {
        Invalid = 0,
        None = 1,
        Premultiplied = 2,
        Coverage = 3,
    }
}

hal_enum! {
    pub enum PowerMode {
        Off = 0,
        Doze = 1,
        On = 2,
        DozeSuspend = 3,
        OnSuspend = 4,
    }
}

hal_enum! {
    pub enum Vsync {
        Invalid = 0,
        Enable = 1,
        Disable = 2,
    }
}

hal_enum! {
    /// Device-wide capabilities reported by the composer service
    pub enum Capability {
        Invalid = 0,
        SidebandStream = 1,
        SkipClientColorTransform = 2,
        PresentFenceIsNotReliable = 3,
        SkipValidate = 4,
        BootDisplayConfig = 5,
        LayerLifecycleBatchCommand = 6,
    }
}

hal_enum! {
    /// Per-display capabilities
    pub enum DisplayCapability {
        Invalid = 0,
        SkipClientColorTransform = 1,
        Doze = 2,
        Brightness = 3,
        ProtectedContents = 4,
        AutoLowLatencyMode = 5,
        Suspend = 6,
        DisplayIdleTimer = 7,
    }
}

hal_enum! {
    /// Per-config display attribute
    pub enum Attribute {
        Invalid = 0,
        Width = 1,
        Height = 2,
        VsyncPeriod = 3,
        DpiX = 4,
        DpiY = 5,
        ConfigGroup = 7,
    }
}

hal_enum! {
    pub enum DisplayConnectionType {
        Internal = 0,
        External = 1,
    }
}

hal_enum! {
    pub enum ContentType {
        None = 0,
        Graphics = 1,
        Photo = 2,
        Cinema = 3,
        Game = 4,
    }
}

hal_enum! {
    /// Hint sent alongside a display color transform
    pub enum ColorTransform {
        Identity = 0,
        ArbitraryMatrix = 1,
    }
}

hal_enum! {
    pub enum PerFrameMetadataKey {
        DisplayRedPrimaryX = 0,
        DisplayRedPrimaryY = 1,
        DisplayGreenPrimaryX = 2,
        DisplayGreenPrimaryY = 3,
        DisplayBluePrimaryX = 4,
        DisplayBluePrimaryY = 5,
        WhitePointX = 6,
        WhitePointY = 7,
        MaxLuminance = 8,
        MinLuminance = 9,
        MaxContentLightLevel = 10,
        MaxFrameAverageLightLevel = 11,
        Hdr10PlusSei = 12,
    }
}

/// Layer transform bits (flip and rotation)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Transform(pub i32);

impl Transform {
    pub const NONE: Transform = Transform(0);
    pub const FLIP_H: Transform = Transform(1);
    pub const FLIP_V: Transform = Transform(2);
    pub const ROT_90: Transform = Transform(4);
    pub const ROT_180: Transform = Transform(3);
    pub const ROT_270: Transform = Transform(7);
}

/// Android dataspace value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Dataspace(pub i32);

impl Dataspace {
    pub const UNKNOWN: Dataspace = Dataspace(0);
}

/// Android pixel format value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PixelFormat(pub i32);

impl PixelFormat {
    pub const RGBA_8888: PixelFormat = PixelFormat(1);
    pub const RGBX_8888: PixelFormat = PixelFormat(2);
    pub const RGB_888: PixelFormat = PixelFormat(3);
    pub const RGB_565: PixelFormat = PixelFormat(4);
    pub const BGRA_8888: PixelFormat = PixelFormat(5);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ColorMode(pub i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RenderIntent(pub i32);

impl RenderIntent {
    pub const COLORIMETRIC: RenderIntent = RenderIntent(0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hdr(pub i32);

/// Opaque native buffer handle owned by the caller's allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    /// Upstream marker for "whole surface" damage
    pub const INVALID: Rect = Rect { left: 0, top: 0, right: -1, bottom: -1 };

    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self { left, top, right, bottom }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FRect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

/// Float RGBA color, each channel in 0.0..=1.0
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub fn from_rgba8(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self {
            r: r as f32 / 255.0,
            g: g as f32 / 255.0,
            b: b as f32 / 255.0,
            a: a as f32 / 255.0,
        }
    }

    /// Quantize to 8 bits per channel, clamping out-of-range input
    pub fn to_rgba8(self) -> [u8; 4] {
        fn channel(v: f32) -> u8 {
            (255.0 * v).round().clamp(0.0, 255.0) as u8
        }
        [channel(self.r), channel(self.g), channel(self.b), channel(self.a)]
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerFrameMetadata {
    pub key: PerFrameMetadataKey,
    pub value: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PerFrameMetadataBlob {
    pub key: PerFrameMetadataKey,
    pub blob: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct XyColor {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Smpte2086 {
    pub display_primary_red: XyColor,
    pub display_primary_green: XyColor,
    pub display_primary_blue: XyColor,
    pub white_point: XyColor,
    pub max_luminance: f32,
    pub min_luminance: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Cta8613 {
    pub max_content_light_level: f32,
    pub max_frame_average_light_level: f32,
}

/// HDR static and dynamic metadata attached to a layer
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HdrMetadata {
    pub valid_types: u32,
    pub smpte2086: Smpte2086,
    pub cta8613: Cta8613,
    pub hdr10plus: Vec<u8>,
}

impl HdrMetadata {
    pub const SMPTE2086: u32 = 1 << 0;
    pub const CTA861_3: u32 = 1 << 1;
    pub const HDR10PLUS: u32 = 1 << 2;
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct HdrCapabilities {
    pub types: Vec<Hdr>,
    pub max_luminance: f32,
    pub max_average_luminance: f32,
    pub min_luminance: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VsyncPeriodChangeConstraints {
    pub desired_time_nanos: i64,
    pub seamless_required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VsyncPeriodChangeTimeline {
    pub new_vsync_applied_time_nanos: i64,
    pub refresh_required: bool,
    pub refresh_time_nanos: i64,
}

/// Format the server would like the client target rendered in
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClientTargetProperty {
    pub pixel_format: PixelFormat,
    pub dataspace: Dataspace,
    pub brightness: f32,
}

impl Default for ClientTargetProperty {
    fn default() -> Self {
        Self {
            pixel_format: PixelFormat::RGBA_8888,
            dataspace: Dataspace::UNKNOWN,
            brightness: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayDecorationSupport {
    pub format: PixelFormat,
    pub alpha_interpretation: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DisplayIdentification {
    pub port: u8,
    pub data: Vec<u8>,
}

/// Number of changed composition types and layer requests left by validate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangeCounts {
    pub num_types: u32,
    pub num_requests: u32,
}

impl ChangeCounts {
    pub fn has_changes(&self) -> bool {
        self.num_types > 0 || self.num_requests > 0
    }
}

/// Display and per-layer requests produced by validate
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DisplayRequests {
    pub display_requests: u32,
    pub layer_requests: Vec<(LayerId, u32)>,
}

/// Outcome of a present-or-validate flush
#[derive(Debug)]
pub enum PresentOrValidate {
    /// The frame was presented. Carries the present fence, if the server sent one.
    Presented(Option<std::os::fd::OwnedFd>),
    /// The server fell back to validation.
    Validated(ChangeCounts),
}

impl PresentOrValidate {
    /// State value used by the C ABI: 1 presented, 0 validated
    pub fn state(&self) -> u32 {
        match self {
            PresentOrValidate::Presented(_) => 1,
            PresentOrValidate::Validated(_) => 0,
        }
    }
}

/// Optional composer features gated per adapter generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionalFeature {
    RefreshRateSwitching,
    ExpectedPresentTime,
    DisplayBrightnessCommand,
    KernelIdleTimer,
    PhysicalDisplayOrientation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_quantization_clamps() {
        let c = Color { r: 1.5, g: -0.2, b: 0.5, a: 1.0 };
        assert_eq!(c.to_rgba8(), [255, 0, 128, 255]);
    }

    #[test]
    fn test_from_raw() {
        assert_eq!(Composition::from_raw(5), Some(Composition::Sideband));
        assert_eq!(Composition::from_raw(99), None);
        assert_eq!(PowerMode::from_raw(4), Some(PowerMode::OnSuspend));
        assert_eq!(Attribute::from_raw(6), None);
    }
}
