//! Typed command and result messages of the structured composer protocol

use crate::hal::{
    BlendMode, BufferHandle, ClientTargetProperty, Color, Composition, Dataspace, DisplayId,
    FRect, LayerId, PerFrameMetadata, PerFrameMetadataBlob, Rect, Transform,
};
use std::os::fd::OwnedFd;

/// A buffer bound to a slot, optionally with its acquire/release fence
#[derive(Debug, Default)]
pub struct Buffer {
    pub slot: u32,
    /// `None` reuses whatever is cached in `slot`
    pub handle: Option<BufferHandle>,
    pub fence: Option<OwnedFd>,
}

#[derive(Debug, Default)]
pub struct ClientTarget {
    pub buffer: Buffer,
    pub dataspace: Dataspace,
    pub damage: Vec<Rect>,
}

/// Every change queued for one layer between two selector changes
#[derive(Debug, Default)]
pub struct LayerCommand {
    pub layer: LayerId,
    pub cursor_position: Option<(i32, i32)>,
    pub buffer: Option<Buffer>,
    pub damage: Option<Vec<Rect>>,
    pub blend_mode: Option<BlendMode>,
    pub color: Option<Color>,
    pub composition: Option<Composition>,
    pub dataspace: Option<Dataspace>,
    pub display_frame: Option<Rect>,
    pub plane_alpha: Option<f32>,
    pub sideband_stream: Option<BufferHandle>,
    pub source_crop: Option<FRect>,
    pub transform: Option<Transform>,
    pub visible_region: Option<Vec<Rect>>,
    pub z: Option<u32>,
    pub color_transform: Option<[f32; 16]>,
    pub brightness: Option<f32>,
    pub per_frame_metadata: Option<Vec<PerFrameMetadata>>,
    pub per_frame_metadata_blobs: Option<Vec<PerFrameMetadataBlob>>,
    pub blocking_region: Option<Vec<Rect>>,
}

/// Every change queued for one display, plus its layer commands in order
#[derive(Debug, Default)]
pub struct DisplayCommand {
    pub display: DisplayId,
    pub layers: Vec<LayerCommand>,
    pub color_transform: Option<[f32; 16]>,
    pub client_target: Option<ClientTarget>,
    pub output_buffer: Option<Buffer>,
    pub expected_present_time: Option<i64>,
    pub validate_display: bool,
    pub accept_display_changes: bool,
    pub present_display: bool,
    pub present_or_validate_display: bool,
}

impl DisplayCommand {
    pub fn new(display: DisplayId) -> Self {
        Self { display, ..Default::default() }
    }

    /// Whether a failure of this command fails the flush
    pub fn is_flush(&self) -> bool {
        self.validate_display || self.present_display || self.present_or_validate_display
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandError {
    /// Index into the batch of display commands
    pub command_index: i32,
    pub error_code: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOrValidateResult {
    Validated,
    Presented,
}

/// One entry of the `execute_commands` reply
#[derive(Debug)]
pub enum CommandResultPayload {
    Error(CommandError),
    ChangedCompositionTypes {
        display: DisplayId,
        layers: Vec<(LayerId, Composition)>,
    },
    DisplayRequest {
        display: DisplayId,
        mask: u32,
        layer_requests: Vec<(LayerId, u32)>,
    },
    PresentFence {
        display: DisplayId,
        fence: Option<OwnedFd>,
    },
    ReleaseFences {
        display: DisplayId,
        layers: Vec<(LayerId, Option<OwnedFd>)>,
    },
    PresentOrValidateResult {
        display: DisplayId,
        result: PresentOrValidateResult,
    },
    ClientTargetProperty {
        display: DisplayId,
        property: ClientTargetProperty,
    },
}
