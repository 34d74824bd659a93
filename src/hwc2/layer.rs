//! Layer shadow objects
//!
//! Each [`Layer`] mirrors one server-side layer and caches the state that is
//! expensive or redundant to resend.

use super::display::Display;
use crate::composer::Composer;
use crate::error::Error;
use crate::hal::{
    BlendMode, BufferHandle, Capability, Color, Composition, Dataspace, DisplayId, FRect,
    HdrMetadata, LayerId, PerFrameMetadata, PerFrameMetadataBlob, PerFrameMetadataKey, Rect,
    Transform, IDENTITY_MATRIX,
};
use crate::Result;
use std::collections::HashSet;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, error};

type Listener = Box<dyn Fn(LayerId) + Send + Sync>;

struct LayerCache {
    visible_region: Vec<Rect>,
    damage: Vec<Rect>,
    blocking_region: Vec<Rect>,
    dataspace: Dataspace,
    color_matrix: [f32; 16],
    hdr_metadata: HdrMetadata,
    plane_alpha: Option<f32>,
    buffer: Option<(u32, BufferHandle)>,
}

impl Default for LayerCache {
    fn default() -> Self {
        Self {
            visible_region: Vec::new(),
            damage: Vec::new(),
            blocking_region: Vec::new(),
            dataspace: Dataspace::UNKNOWN,
            color_matrix: IDENTITY_MATRIX,
            hdr_metadata: HdrMetadata::default(),
            plane_alpha: None,
            buffer: None,
        }
    }
}

pub struct Layer {
    composer: Arc<Composer>,
    capabilities: Arc<HashSet<Capability>>,
    /// Owning display. `None` once the display has been torn down.
    display: Mutex<Option<Weak<Display>>>,
    display_id: DisplayId,
    id: LayerId,
    cache: Mutex<LayerCache>,
    display_destroyed_listener: Mutex<Option<Listener>>,
    layer_destroyed_listener: Mutex<Option<Listener>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Layer {
    pub(crate) fn new(
        composer: Arc<Composer>,
        capabilities: Arc<HashSet<Capability>>,
        display: Weak<Display>,
        display_id: DisplayId,
        id: LayerId,
    ) -> Self {
        debug!("Created layer {} on display {}", id, display_id);
        Self {
            composer,
            capabilities,
            display: Mutex::new(Some(display)),
            display_id,
            id,
            cache: Mutex::new(LayerCache::default()),
            display_destroyed_listener: Mutex::new(None),
            layer_destroyed_listener: Mutex::new(None),
        }
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn display_id(&self) -> DisplayId {
        self.display_id
    }

    /// Whether the owning display is still alive
    pub fn has_display(&self) -> bool {
        self.check_display().is_ok()
    }

    fn check_display(&self) -> Result<()> {
        match lock(&self.display).as_ref().and_then(Weak::upgrade) {
            Some(_) => Ok(()),
            None => Err(Error::BadDisplay),
        }
    }

    /// Called by the owning display while it is torn down. Runs at most once.
    pub(crate) fn on_owning_display_destroyed(&self) {
        if lock(&self.display).take().is_none() {
            return;
        }
        if let Some(listener) = lock(&self.display_destroyed_listener).as_ref() {
            listener(self.id);
        }
    }

    /// Observe the owning display going away
    pub fn set_display_destroyed_listener(&self, listener: impl Fn(LayerId) + Send + Sync + 'static) {
        let mut slot = lock(&self.display_destroyed_listener);
        if slot.is_some() {
            panic!("display destroyed listener already set on layer {}", self.id);
        }
        *slot = Some(Box::new(listener));
    }

    /// Observe this layer being dropped
    pub fn set_layer_destroyed_listener(&self, listener: impl Fn(LayerId) + Send + Sync + 'static) {
        let mut slot = lock(&self.layer_destroyed_listener);
        if slot.is_some() {
            panic!("layer destroyed listener already set on layer {}", self.id);
        }
        *slot = Some(Box::new(listener));
    }

    pub fn set_cursor_position(&self, x: i32, y: i32) -> Result<()> {
        self.check_display()?;
        self.composer.set_cursor_position(self.display_id, self.id, x, y)
    }

    /// Bind `buffer` to `slot`. Rebinding the cached pair sends only the slot.
    pub fn set_buffer(
        &self,
        slot: u32,
        buffer: BufferHandle,
        acquire_fence: Option<OwnedFd>,
    ) -> Result<()> {
        self.check_display()?;
        let mut cache = lock(&self.cache);
        let handle = if cache.buffer == Some((slot, buffer)) {
            None
        } else {
            cache.buffer = Some((slot, buffer));
            Some(buffer)
        };
        drop(cache);
        self.composer
            .set_layer_buffer(self.display_id, self.id, slot, handle, acquire_fence)
    }

    pub fn set_surface_damage(&self, damage: &[Rect]) -> Result<()> {
        self.check_display()?;
        let mut cache = lock(&self.cache);
        if cache.damage == damage {
            return Ok(());
        }
        cache.damage = damage.to_vec();
        drop(cache);

        // Whole-surface damage is a single INVALID rect here and no rects on the wire
        if damage == [Rect::INVALID] {
            self.composer.set_layer_surface_damage(self.display_id, self.id, &[])
        } else {
            self.composer.set_layer_surface_damage(self.display_id, self.id, damage)
        }
    }

    pub fn set_blend_mode(&self, mode: BlendMode) -> Result<()> {
        self.check_display()?;
        self.composer.set_layer_blend_mode(self.display_id, self.id, mode)
    }

    pub fn set_color(&self, color: Color) -> Result<()> {
        self.check_display()?;
        self.composer.set_layer_color(self.display_id, self.id, color)
    }

    pub fn set_composition_type(&self, composition: Composition) -> Result<()> {
        self.check_display()?;
        self.composer
            .set_layer_composition_type(self.display_id, self.id, composition)
    }

    pub fn set_dataspace(&self, dataspace: Dataspace) -> Result<()> {
        self.check_display()?;
        let mut cache = lock(&self.cache);
        if cache.dataspace == dataspace {
            return Ok(());
        }
        cache.dataspace = dataspace;
        drop(cache);
        self.composer.set_layer_dataspace(self.display_id, self.id, dataspace)
    }

    /// Send the HDR metadata types both set in `metadata` and in `supported`
    pub fn set_hdr_metadata(&self, supported: u32, metadata: &HdrMetadata) -> Result<()> {
        self.check_display()?;
        let mut cache = lock(&self.cache);
        if cache.hdr_metadata == *metadata {
            return Ok(());
        }
        cache.hdr_metadata = metadata.clone();
        drop(cache);

        let valid = metadata.valid_types & supported;
        let mut entries = Vec::new();
        if valid & HdrMetadata::SMPTE2086 != 0 {
            let s = &metadata.smpte2086;
            entries.extend([
                (PerFrameMetadataKey::DisplayRedPrimaryX, s.display_primary_red.x),
                (PerFrameMetadataKey::DisplayRedPrimaryY, s.display_primary_red.y),
                (PerFrameMetadataKey::DisplayGreenPrimaryX, s.display_primary_green.x),
                (PerFrameMetadataKey::DisplayGreenPrimaryY, s.display_primary_green.y),
                (PerFrameMetadataKey::DisplayBluePrimaryX, s.display_primary_blue.x),
                (PerFrameMetadataKey::DisplayBluePrimaryY, s.display_primary_blue.y),
                (PerFrameMetadataKey::WhitePointX, s.white_point.x),
                (PerFrameMetadataKey::WhitePointY, s.white_point.y),
                (PerFrameMetadataKey::MaxLuminance, s.max_luminance),
                (PerFrameMetadataKey::MinLuminance, s.min_luminance),
            ]);
        }
        if valid & HdrMetadata::CTA861_3 != 0 {
            let c = &metadata.cta8613;
            entries.extend([
                (PerFrameMetadataKey::MaxContentLightLevel, c.max_content_light_level),
                (PerFrameMetadataKey::MaxFrameAverageLightLevel, c.max_frame_average_light_level),
            ]);
        }
        let entries: Vec<PerFrameMetadata> = entries
            .into_iter()
            .map(|(key, value)| PerFrameMetadata { key, value })
            .collect();

        let mut result = self
            .composer
            .set_layer_per_frame_metadata(self.display_id, self.id, &entries);

        if valid & HdrMetadata::HDR10PLUS != 0 {
            if metadata.hdr10plus.is_empty() {
                return Err(Error::BadParameter);
            }
            let blobs = [PerFrameMetadataBlob {
                key: PerFrameMetadataKey::Hdr10PlusSei,
                blob: metadata.hdr10plus.clone(),
            }];
            result = self
                .composer
                .set_layer_per_frame_metadata_blobs(self.display_id, self.id, &blobs);
        }
        result
    }

    pub fn set_display_frame(&self, frame: &Rect) -> Result<()> {
        self.check_display()?;
        self.composer.set_layer_display_frame(self.display_id, self.id, frame)
    }

    pub fn set_plane_alpha(&self, alpha: f32) -> Result<()> {
        self.check_display()?;
        let mut cache = lock(&self.cache);
        if cache.plane_alpha.map(f32::to_bits) == Some(alpha.to_bits()) {
            return Ok(());
        }
        cache.plane_alpha = Some(alpha);
        drop(cache);
        self.composer.set_layer_plane_alpha(self.display_id, self.id, alpha)
    }

    pub fn set_sideband_stream(&self, stream: BufferHandle) -> Result<()> {
        self.check_display()?;
        if !self.capabilities.contains(&Capability::SidebandStream) {
            error!("set_sideband_stream on layer {} without sideband support", self.id);
            return Err(Error::Unsupported);
        }
        self.composer.set_layer_sideband_stream(self.display_id, self.id, stream)
    }

    pub fn set_source_crop(&self, crop: &FRect) -> Result<()> {
        self.check_display()?;
        self.composer.set_layer_source_crop(self.display_id, self.id, crop)
    }

    pub fn set_transform(&self, transform: Transform) -> Result<()> {
        self.check_display()?;
        self.composer.set_layer_transform(self.display_id, self.id, transform)
    }

    pub fn set_visible_region(&self, region: &[Rect]) -> Result<()> {
        self.check_display()?;
        let mut cache = lock(&self.cache);
        if cache.visible_region == region {
            return Ok(());
        }
        cache.visible_region = region.to_vec();
        drop(cache);
        self.composer.set_layer_visible_region(self.display_id, self.id, region)
    }

    pub fn set_z_order(&self, z: u32) -> Result<()> {
        self.check_display()?;
        self.composer.set_layer_z_order(self.display_id, self.id, z)
    }

    /// The cache only takes the matrix once the composer accepted it
    pub fn set_color_transform(&self, matrix: &[f32; 16]) -> Result<()> {
        self.check_display()?;
        if lock(&self.cache).color_matrix == *matrix {
            return Ok(());
        }
        self.composer
            .set_layer_color_transform(self.display_id, self.id, matrix)?;
        lock(&self.cache).color_matrix = *matrix;
        Ok(())
    }

    pub fn set_brightness(&self, brightness: f32) -> Result<()> {
        self.check_display()?;
        self.composer.set_layer_brightness(self.display_id, self.id, brightness)
    }

    pub fn set_blocking_region(&self, region: &[Rect]) -> Result<()> {
        self.check_display()?;
        let mut cache = lock(&self.cache);
        if cache.blocking_region == region {
            return Ok(());
        }
        cache.blocking_region = region.to_vec();
        drop(cache);
        self.composer.set_layer_blocking_region(self.display_id, self.id, region)
    }
}

impl Drop for Layer {
    fn drop(&mut self) {
        if let Err(e) = self.composer.destroy_layer(self.display_id, self.id) {
            error!("destroy_layer({}, {}) failed: {}", self.display_id, self.id, e);
        }
        if let Some(listener) = lock(&self.layer_destroyed_listener).as_ref() {
            listener(self.id);
        }
    }
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("id", &self.id)
            .field("display_id", &self.display_id)
            .finish()
    }
}
