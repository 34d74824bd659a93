//! Legacy command writer
//!
//! Accumulates records for one flush. Display and layer selectors are only
//! emitted when the target actually changes.

use super::command::{self, Command, WireHandle};
use super::queue::MessageQueue;
use crate::hal::{
    BlendMode, BufferHandle, ColorTransform, Composition, Dataspace, DisplayId, FRect, LayerId,
    PerFrameMetadata, PerFrameMetadataBlob, Rect, Transform,
};
use std::os::fd::OwnedFd;
use tracing::warn;

/// Initial word capacity: 64 KiB minus room for the queue header
pub const WRITER_INITIAL_SIZE: usize = 64 * 1024 / std::mem::size_of::<u32>() - 16;

const MAX_PAYLOAD: usize = u16::MAX as usize;

/// What `write_queue` produced for the transport
#[derive(Debug)]
pub struct QueueWrite {
    /// The queue was (re)created and must be registered with the server
    pub changed: bool,
    pub length: u32,
    pub handles: Vec<WireHandle>,
}

#[derive(Debug)]
pub struct CommandWriter {
    data: Vec<u32>,
    handles: Vec<WireHandle>,
    initial_size: usize,
    queue: Option<MessageQueue>,
    current_display: Option<DisplayId>,
    current_layer: Option<LayerId>,
}

impl CommandWriter {
    pub fn new(initial_size: usize) -> Self {
        Self {
            data: Vec::with_capacity(initial_size),
            handles: Vec::new(),
            initial_size,
            queue: None,
            current_display: None,
            current_layer: None,
        }
    }

    /// Drop everything queued since the last flush
    pub fn reset(&mut self) {
        self.data.clear();
        self.handles.clear();
        self.current_display = None;
        self.current_layer = None;
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Words queued so far
    pub fn words(&self) -> &[u32] {
        &self.data
    }

    pub fn queue(&self) -> Option<&MessageQueue> {
        self.queue.as_ref()
    }

    /// Opcode of the record whose header sits at word offset `location`
    pub fn command_at(&self, location: u32) -> Option<Command> {
        let word = *self.data.get(location as usize)?;
        let (opcode, _) = command::split_header(word);
        Command::from_opcode(opcode)
    }

    /// Drop the input queue so the next [`write_queue`](Self::write_queue)
    /// allocates and reports a fresh one
    pub fn forget_queue(&mut self) {
        self.queue = None;
    }

    /// Copy the batch into the input queue, growing the queue if needed
    pub fn write_queue(&mut self) -> Option<QueueWrite> {
        let needed = self.data.len();
        let mut changed = false;

        let queue = match &self.queue {
            Some(queue) if queue.capacity() >= needed => queue.clone(),
            _ => {
                let queue = MessageQueue::new(needed.max(self.initial_size));
                self.queue = Some(queue.clone());
                changed = true;
                queue
            }
        };

        if !queue.write(&self.data) {
            return None;
        }

        Some(QueueWrite {
            changed,
            length: needed as u32,
            handles: std::mem::take(&mut self.handles),
        })
    }

    fn begin(&mut self, command: Command, length: usize) {
        debug_assert!(length <= u16::MAX as usize, "{:?} payload of {} words", command, length);
        self.data.push(command::header(command, length as u16));
    }

    fn write(&mut self, value: u32) {
        self.data.push(value);
    }

    fn write_signed(&mut self, value: i32) {
        self.data.push(value as u32);
    }

    fn write_float(&mut self, value: f32) {
        self.data.push(value.to_bits());
    }

    fn write_u64(&mut self, value: u64) {
        self.data.extend_from_slice(&command::split_u64(value));
    }

    fn write_rect(&mut self, rect: &Rect) {
        self.write_signed(rect.left);
        self.write_signed(rect.top);
        self.write_signed(rect.right);
        self.write_signed(rect.bottom);
    }

    fn write_frect(&mut self, rect: &FRect) {
        self.write_float(rect.left);
        self.write_float(rect.top);
        self.write_float(rect.right);
        self.write_float(rect.bottom);
    }

    fn clamp_rects(&self, command: Command, fixed: usize, rects: &[Rect]) -> usize {
        let max = (MAX_PAYLOAD - fixed) / 4;
        if rects.len() > max {
            warn!("{:?}: truncating {} rects to {}", command, rects.len(), max);
        }
        rects.len().min(max)
    }

    fn write_handle(&mut self, handle: Option<BufferHandle>) {
        match handle {
            Some(h) => {
                let index = self.handles.len() as i32;
                self.handles.push(WireHandle::Buffer(h));
                self.write_signed(index);
            }
            None => self.write_signed(-1),
        }
    }

    fn write_fence(&mut self, fence: Option<OwnedFd>) {
        match fence {
            Some(fd) => {
                let index = self.handles.len() as i32;
                self.handles.push(WireHandle::Fence(fd));
                self.write_signed(index);
            }
            None => self.write_signed(-1),
        }
    }

    pub fn select_display(&mut self, display: DisplayId) {
        if self.current_display == Some(display) {
            return;
        }
        self.begin(Command::SelectDisplay, command::SELECT_DISPLAY_LENGTH as usize);
        self.write_u64(display);
        self.current_display = Some(display);
        self.current_layer = None;
    }

    pub fn select_layer(&mut self, layer: LayerId) {
        if self.current_layer == Some(layer) {
            return;
        }
        self.begin(Command::SelectLayer, command::SELECT_LAYER_LENGTH as usize);
        self.write_u64(layer);
        self.current_layer = Some(layer);
    }

    pub fn set_color_transform(&mut self, matrix: &[f32; 16], hint: ColorTransform) {
        self.begin(Command::SetColorTransform, 17);
        for v in matrix {
            self.write_float(*v);
        }
        self.write_signed(hint.raw());
    }

    pub fn set_client_target(
        &mut self,
        slot: u32,
        target: Option<BufferHandle>,
        acquire_fence: Option<OwnedFd>,
        dataspace: Dataspace,
        damage: &[Rect],
    ) {
        let count = self.clamp_rects(Command::SetClientTarget, 4, damage);
        self.begin(Command::SetClientTarget, 4 + count * 4);
        self.write(slot);
        self.write_handle(target);
        self.write_fence(acquire_fence);
        self.write_signed(dataspace.0);
        for rect in &damage[..count] {
            self.write_rect(rect);
        }
    }

    pub fn set_output_buffer(
        &mut self,
        slot: u32,
        buffer: Option<BufferHandle>,
        release_fence: Option<OwnedFd>,
    ) {
        self.begin(Command::SetOutputBuffer, 3);
        self.write(slot);
        self.write_handle(buffer);
        self.write_fence(release_fence);
    }

    pub fn validate_display(&mut self) {
        self.begin(Command::ValidateDisplay, 0);
    }

    pub fn accept_display_changes(&mut self) {
        self.begin(Command::AcceptDisplayChanges, 0);
    }

    pub fn present_display(&mut self) {
        self.begin(Command::PresentDisplay, 0);
    }

    pub fn present_or_validate_display(&mut self) {
        self.begin(Command::PresentOrValidateDisplay, 0);
    }

    pub fn set_layer_cursor_position(&mut self, x: i32, y: i32) {
        self.begin(Command::SetLayerCursorPosition, 2);
        self.write_signed(x);
        self.write_signed(y);
    }

    pub fn set_layer_buffer(
        &mut self,
        slot: u32,
        buffer: Option<BufferHandle>,
        acquire_fence: Option<OwnedFd>,
    ) {
        self.begin(Command::SetLayerBuffer, 3);
        self.write(slot);
        self.write_handle(buffer);
        self.write_fence(acquire_fence);
    }

    pub fn set_layer_surface_damage(&mut self, damage: &[Rect]) {
        let count = self.clamp_rects(Command::SetLayerSurfaceDamage, 0, damage);
        self.begin(Command::SetLayerSurfaceDamage, count * 4);
        for rect in &damage[..count] {
            self.write_rect(rect);
        }
    }

    pub fn set_layer_blend_mode(&mut self, mode: BlendMode) {
        self.begin(Command::SetLayerBlendMode, 1);
        self.write_signed(mode.raw());
    }

    /// Color packed as r | g << 8 | b << 16 | a << 24
    pub fn set_layer_color(&mut self, rgba: [u8; 4]) {
        self.begin(Command::SetLayerColor, 1);
        self.write(u32::from_le_bytes(rgba));
    }

    pub fn set_layer_composition_type(&mut self, composition: Composition) {
        self.begin(Command::SetLayerCompositionType, 1);
        self.write_signed(composition.raw());
    }

    pub fn set_layer_dataspace(&mut self, dataspace: Dataspace) {
        self.begin(Command::SetLayerDataspace, 1);
        self.write_signed(dataspace.0);
    }

    pub fn set_layer_display_frame(&mut self, frame: &Rect) {
        self.begin(Command::SetLayerDisplayFrame, 4);
        self.write_rect(frame);
    }

    pub fn set_layer_plane_alpha(&mut self, alpha: f32) {
        self.begin(Command::SetLayerPlaneAlpha, 1);
        self.write_float(alpha);
    }

    pub fn set_layer_sideband_stream(&mut self, stream: BufferHandle) {
        self.begin(Command::SetLayerSidebandStream, 1);
        self.write_handle(Some(stream));
    }

    pub fn set_layer_source_crop(&mut self, crop: &FRect) {
        self.begin(Command::SetLayerSourceCrop, 4);
        self.write_frect(crop);
    }

    pub fn set_layer_transform(&mut self, transform: Transform) {
        self.begin(Command::SetLayerTransform, 1);
        self.write_signed(transform.0);
    }

    pub fn set_layer_visible_region(&mut self, visible: &[Rect]) {
        let count = self.clamp_rects(Command::SetLayerVisibleRegion, 0, visible);
        self.begin(Command::SetLayerVisibleRegion, count * 4);
        for rect in &visible[..count] {
            self.write_rect(rect);
        }
    }

    pub fn set_layer_z_order(&mut self, z: u32) {
        self.begin(Command::SetLayerZOrder, 1);
        self.write(z);
    }

    pub fn set_layer_per_frame_metadata(&mut self, metadata: &[PerFrameMetadata]) {
        let max = MAX_PAYLOAD / 2;
        if metadata.len() > max {
            warn!("truncating {} per-frame metadata entries to {}", metadata.len(), max);
        }
        let metadata = &metadata[..metadata.len().min(max)];
        self.begin(Command::SetLayerPerFrameMetadata, metadata.len() * 2);
        for entry in metadata {
            self.write_signed(entry.key.raw());
            self.write_float(entry.value);
        }
    }

    /// Blob layout: count, then per blob key, byte size and the bytes packed
    /// little-endian into words
    pub fn set_layer_per_frame_metadata_blobs(&mut self, blobs: &[PerFrameMetadataBlob]) {
        let length = 1 + blobs
            .iter()
            .map(|b| 2 + b.blob.len().div_ceil(4))
            .sum::<usize>();
        if length > MAX_PAYLOAD {
            warn!("per-frame metadata blobs too large ({} words), dropped", length);
            return;
        }
        self.begin(Command::SetLayerPerFrameMetadataBlobs, length);
        self.write(blobs.len() as u32);
        for blob in blobs {
            self.write_signed(blob.key.raw());
            self.write(blob.blob.len() as u32);
            for chunk in blob.blob.chunks(4) {
                let mut word = [0u8; 4];
                word[..chunk.len()].copy_from_slice(chunk);
                self.write(u32::from_le_bytes(word));
            }
        }
    }

    pub fn set_layer_color_transform(&mut self, matrix: &[f32; 16]) {
        self.begin(Command::SetLayerColorTransform, 16);
        for v in matrix {
            self.write_float(*v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::legacy::command::split_records;

    fn opcodes(writer: &CommandWriter) -> Vec<Command> {
        split_records(writer.words())
            .unwrap()
            .iter()
            .map(|r| r.command().unwrap())
            .collect()
    }

    #[test]
    fn test_selectors_are_not_repeated() {
        let mut w = CommandWriter::new(64);
        w.select_display(1);
        w.select_layer(10);
        w.set_layer_plane_alpha(0.5);
        w.select_display(1);
        w.select_layer(10);
        w.set_layer_z_order(3);
        w.select_layer(11);
        w.set_layer_z_order(4);

        assert_eq!(
            opcodes(&w),
            vec![
                Command::SelectDisplay,
                Command::SelectLayer,
                Command::SetLayerPlaneAlpha,
                Command::SetLayerZOrder,
                Command::SelectLayer,
                Command::SetLayerZOrder,
            ]
        );
    }

    #[test]
    fn test_display_change_clears_layer_selection() {
        let mut w = CommandWriter::new(64);
        w.select_display(1);
        w.select_layer(10);
        w.select_display(2);
        w.select_layer(10);
        assert_eq!(
            opcodes(&w),
            vec![Command::SelectDisplay, Command::SelectLayer, Command::SelectDisplay, Command::SelectLayer]
        );
    }

    #[test]
    fn test_reset_discards_batch_and_selection() {
        let mut w = CommandWriter::new(64);
        w.select_display(1);
        w.validate_display();
        w.reset();
        assert!(w.is_empty());
        w.select_display(1);
        assert_eq!(opcodes(&w), vec![Command::SelectDisplay]);
    }

    #[test]
    fn test_command_at_and_payloads() {
        let mut w = CommandWriter::new(64);
        w.select_display(0x1_0000_0002);
        w.set_layer_color([1, 2, 3, 4]);
        w.validate_display();

        assert_eq!(w.words()[1], 2);
        assert_eq!(w.words()[2], 1);
        assert_eq!(w.words()[4], 0x0403_0201);
        assert_eq!(w.command_at(0), Some(Command::SelectDisplay));
        assert_eq!(w.command_at(3), Some(Command::SetLayerColor));
        assert_eq!(w.command_at(5), Some(Command::ValidateDisplay));
    }

    #[test]
    fn test_write_queue_grows_and_reports_change() {
        let mut w = CommandWriter::new(4);
        w.select_display(1);
        let first = w.write_queue().unwrap();
        assert!(first.changed);
        assert_eq!(first.length, 3);
        let queue = w.queue().unwrap().clone();
        assert_eq!(queue.read(3).unwrap().len(), 3);

        w.reset();
        w.select_display(2);
        let second = w.write_queue().unwrap();
        assert!(!second.changed);
        queue.read(3).unwrap();

        w.reset();
        for _ in 0..3 {
            w.validate_display();
        }
        w.select_display(3);
        let third = w.write_queue().unwrap();
        assert!(third.changed);
        assert_ne!(w.queue().unwrap(), &queue);
    }

    #[test]
    fn test_forgotten_queue_is_reported_again() {
        let mut w = CommandWriter::new(16);
        w.select_display(1);
        assert!(w.write_queue().unwrap().changed);

        w.reset();
        w.forget_queue();
        assert!(w.queue().is_none());
        w.select_display(1);
        assert!(w.write_queue().unwrap().changed);
    }

    #[test]
    fn test_oversized_metadata_is_truncated() {
        let mut w = CommandWriter::new(64);
        let entry = PerFrameMetadata {
            key: crate::hal::PerFrameMetadataKey::MaxLuminance,
            value: 1000.0,
        };
        w.set_layer_per_frame_metadata(&vec![entry; 40_000]);

        let records = split_records(w.words()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].command(), Some(Command::SetLayerPerFrameMetadata));
        assert_eq!(records[0].payload.len(), MAX_PAYLOAD / 2 * 2);
    }

    #[test]
    fn test_blob_packing() {
        let mut w = CommandWriter::new(64);
        w.set_layer_per_frame_metadata_blobs(&[PerFrameMetadataBlob {
            key: crate::hal::PerFrameMetadataKey::Hdr10PlusSei,
            blob: vec![1, 2, 3, 4, 5],
        }]);
        let records = split_records(w.words()).unwrap();
        assert_eq!(records[0].payload, vec![1, 12, 5, 0x0403_0201, 5]);
    }
}
