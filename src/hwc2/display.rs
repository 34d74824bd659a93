//! Display shadow objects and their configs

use super::layer::Layer;
use crate::composer::Composer;
use crate::error::Error;
use crate::hal::{
    Attribute, BufferHandle, Capability, ChangeCounts, ColorMode, Composition, ConfigId,
    Dataspace, DisplayCapability, DisplayId, DisplayType, HdrCapabilities, LayerId,
    OptionalFeature, PowerMode, PresentOrValidate, RenderIntent, Vsync,
};
use crate::Result;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, error, info, warn};

/// Density used for 1080p and larger displays that report no DPI
pub const DENSITY_XHIGH: f32 = 320.0;

/// Density used for smaller displays that report no DPI
pub const DENSITY_TV: f32 = 213.0;

/// One display mode
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    display_id: DisplayId,
    id: ConfigId,
    width: i32,
    height: i32,
    vsync_period: i32,
    dpi_x: f32,
    dpi_y: f32,
    config_group: i32,
}

impl Config {
    pub fn display_id(&self) -> DisplayId {
        self.display_id
    }

    pub fn id(&self) -> ConfigId {
        self.id
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn vsync_period(&self) -> i32 {
        self.vsync_period
    }

    pub fn dpi_x(&self) -> f32 {
        self.dpi_x
    }

    pub fn dpi_y(&self) -> f32 {
        self.dpi_y
    }

    pub fn config_group(&self) -> i32 {
        self.config_group
    }
}

/// Builds a [`Config`] from raw attribute values
#[derive(Debug)]
pub struct ConfigBuilder {
    config: Config,
    raw_dpi_x: i32,
    raw_dpi_y: i32,
}

impl ConfigBuilder {
    pub fn new(display_id: DisplayId, id: ConfigId) -> Self {
        Self {
            config: Config {
                display_id,
                id,
                width: -1,
                height: -1,
                vsync_period: -1,
                dpi_x: -1.0,
                dpi_y: -1.0,
                config_group: -1,
            },
            raw_dpi_x: -1,
            raw_dpi_y: -1,
        }
    }

    pub fn width(mut self, width: i32) -> Self {
        self.config.width = width;
        self
    }

    pub fn height(mut self, height: i32) -> Self {
        self.config.height = height;
        self
    }

    pub fn vsync_period(mut self, period: i32) -> Self {
        self.config.vsync_period = period;
        self
    }

    /// Milli-DPI, or -1 when unknown
    pub fn dpi_x(mut self, dpi: i32) -> Self {
        self.raw_dpi_x = dpi;
        self
    }

    pub fn dpi_y(mut self, dpi: i32) -> Self {
        self.raw_dpi_y = dpi;
        self
    }

    pub fn config_group(mut self, group: i32) -> Self {
        self.config.config_group = group;
        self
    }

    fn default_density(&self) -> f32 {
        if self.config.width.max(self.config.height) >= 1080 {
            DENSITY_XHIGH
        } else {
            DENSITY_TV
        }
    }

    fn density(&self, raw: i32) -> f32 {
        if raw == -1 {
            self.default_density()
        } else {
            raw as f32 / 1000.0
        }
    }

    pub fn build(mut self) -> Config {
        self.config.dpi_x = self.density(self.raw_dpi_x);
        self.config.dpi_y = self.density(self.raw_dpi_y);
        self.config
    }
}

struct DisplayState {
    connected: bool,
    torn_down: bool,
    configs: BTreeMap<ConfigId, Arc<Config>>,
    layers: HashMap<LayerId, Weak<Layer>>,
}

pub struct Display {
    composer: Arc<Composer>,
    capabilities: Arc<HashSet<Capability>>,
    id: DisplayId,
    display_type: DisplayType,
    this: Weak<Display>,
    state: Mutex<DisplayState>,
    /// Filled on the first power-on. `None` until then.
    display_capabilities: Mutex<Option<HashSet<DisplayCapability>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Display {
    /// Create a disconnected display. The device connects it.
    pub(crate) fn new(
        composer: Arc<Composer>,
        capabilities: Arc<HashSet<Capability>>,
        id: DisplayId,
        display_type: DisplayType,
    ) -> Arc<Self> {
        debug!("Created display {} ({:?})", id, display_type);
        Arc::new_cyclic(|this| Self {
            composer,
            capabilities,
            id,
            display_type,
            this: this.clone(),
            state: Mutex::new(DisplayState {
                connected: false,
                torn_down: false,
                configs: BTreeMap::new(),
                layers: HashMap::new(),
            }),
            display_capabilities: Mutex::new(None),
        })
    }

    pub fn id(&self) -> DisplayId {
        self.id
    }

    pub fn display_type(&self) -> DisplayType {
        self.display_type
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    pub fn is_torn_down(&self) -> bool {
        lock(&self.state).torn_down
    }

    fn check(&self) -> Result<()> {
        if lock(&self.state).torn_down {
            Err(Error::BadDisplay)
        } else {
            Ok(())
        }
    }

    /// Live layers currently tracked by this display
    pub fn layer_count(&self) -> usize {
        lock(&self.state)
            .layers
            .values()
            .filter(|layer| layer.strong_count() > 0)
            .count()
    }

    pub fn get_layer_by_id(&self, id: LayerId) -> Option<Arc<Layer>> {
        lock(&self.state).layers.get(&id).and_then(Weak::upgrade)
    }

    /// Update the connection flag. Connecting registers the client target
    /// slot count and, for physical displays, loads the configs.
    pub(crate) fn set_connected(&self, connected: bool) {
        let was_connected = {
            let mut state = lock(&self.state);
            std::mem::replace(&mut state.connected, connected)
        };

        if !was_connected && connected {
            if let Err(e) = self.composer.set_client_target_slot_count(self.id) {
                error!("set_client_target_slot_count({}) failed: {}", self.id, e);
            }
            if self.display_type == DisplayType::Physical {
                self.load_configs();
            }
        }
    }

    fn attribute(&self, config: ConfigId, attribute: Attribute) -> i32 {
        match self.composer.get_display_attribute(self.id, config, attribute) {
            Ok(value) => value,
            Err(e) => {
                error!(
                    "get_display_attribute({}, {}, {:?}) failed: {}",
                    self.id, config, attribute, e
                );
                -1
            }
        }
    }

    fn load_configs(&self) {
        let ids = match self.composer.get_display_configs(self.id) {
            Ok(ids) => ids,
            Err(e) => {
                error!("[{}] get_display_configs failed: {}", self.id, e);
                return;
            }
        };

        let mut builder_configs = BTreeMap::new();
        for id in ids {
            let mut builder = ConfigBuilder::new(self.id, id)
                .width(self.attribute(id, Attribute::Width))
                .height(self.attribute(id, Attribute::Height))
                .vsync_period(self.attribute(id, Attribute::VsyncPeriod))
                .dpi_x(self.attribute(id, Attribute::DpiX))
                .dpi_y(self.attribute(id, Attribute::DpiY));
            if self.composer.is_supported(OptionalFeature::RefreshRateSwitching) {
                builder = builder.config_group(self.attribute(id, Attribute::ConfigGroup));
            }
            builder_configs.insert(id, Arc::new(builder.build()));
        }
        debug!("[{}] loaded {} configs", self.id, builder_configs.len());
        lock(&self.state).configs = builder_configs;
    }

    pub fn get_configs(&self) -> Vec<Arc<Config>> {
        lock(&self.state).configs.values().cloned().collect()
    }

    pub fn accept_changes(&self) -> Result<()> {
        self.check()?;
        self.composer.accept_display_changes(self.id)
    }

    pub fn create_layer(&self) -> Result<Arc<Layer>> {
        self.check()?;
        let id = self.composer.create_layer(self.id)?;
        let layer = Arc::new(Layer::new(
            self.composer.clone(),
            self.capabilities.clone(),
            self.this.clone(),
            self.id,
            id,
        ));
        lock(&self.state).layers.insert(id, Arc::downgrade(&layer));
        Ok(layer)
    }

    /// Stop tracking `layer`. The server-side layer goes away with the last
    /// handle to it.
    pub fn destroy_layer(&self, layer: &Layer) {
        lock(&self.state).layers.remove(&layer.id());
    }

    /// The active config, or `None` if the server reports one we never loaded
    pub fn get_active_config(&self) -> Result<Option<Arc<Config>>> {
        self.check()?;
        let id = match self.composer.get_active_config(self.id) {
            Ok(id) => id,
            Err(Error::BadConfig) => {
                warn!("[{}] no active config", self.id);
                return Ok(None);
            }
            Err(e) => {
                error!("[{}] get_active_config failed: {}", self.id, e);
                return Err(e);
            }
        };

        let config = lock(&self.state).configs.get(&id).cloned();
        if config.is_none() {
            error!("[{}] get_active_config returned unknown config {}", self.id, id);
        }
        Ok(config)
    }

    pub fn set_active_config(&self, config: &Config) -> Result<()> {
        self.check()?;
        if config.display_id() != self.id {
            error!(
                "set_active_config got config {} for display {} (expected {})",
                config.id(),
                config.display_id(),
                self.id
            );
            return Err(Error::BadConfig);
        }
        self.composer.set_active_config(self.id, config.id())
    }

    pub fn get_changed_composition_types(&self) -> Result<Vec<(Arc<Layer>, Composition)>> {
        self.check()?;
        let changes = self.composer.get_changed_composition_types(self.id)?;
        let mut types = Vec::with_capacity(changes.len());
        for (id, composition) in changes {
            match self.get_layer_by_id(id) {
                Some(layer) => types.push((layer, composition)),
                None => error!("changed composition type for unknown layer {} on {}", id, self.id),
            }
        }
        Ok(types)
    }

    pub fn get_requests(&self) -> Result<(u32, Vec<(Arc<Layer>, u32)>)> {
        self.check()?;
        let requests = self.composer.get_display_requests(self.id)?;
        let mut layers = Vec::with_capacity(requests.layer_requests.len());
        for (id, request) in requests.layer_requests {
            match self.get_layer_by_id(id) {
                Some(layer) => layers.push((layer, request)),
                None => error!("request for unknown layer {} on {}", id, self.id),
            }
        }
        Ok((requests.display_requests, layers))
    }

    pub fn get_color_modes(&self) -> Result<Vec<ColorMode>> {
        self.check()?;
        self.composer.get_color_modes(self.id)
    }

    pub fn get_name(&self) -> Result<String> {
        self.check()?;
        self.composer.get_display_name(self.id)
    }

    pub fn supports_doze(&self) -> Result<bool> {
        self.check()?;
        self.composer.get_doze_support(self.id)
    }

    pub fn get_hdr_capabilities(&self) -> Result<HdrCapabilities> {
        self.check()?;
        self.composer.get_hdr_capabilities(self.id)
    }

    /// Release fences keyed by layer. A fence for a layer this display does
    /// not know is an error.
    pub fn get_release_fences(&self) -> Result<HashMap<LayerId, OwnedFd>> {
        self.check()?;
        let fences = self.composer.get_release_fences(self.id)?;
        let state = lock(&self.state);
        let mut out = HashMap::with_capacity(fences.len());
        for (id, fence) in fences {
            if !state.layers.contains_key(&id) {
                error!("release fence for unknown layer {} on {}", id, self.id);
                return Err(Error::BadLayer);
            }
            if let Some(fence) = fence {
                out.insert(id, fence);
            }
        }
        Ok(out)
    }

    pub fn present(&self) -> Result<Option<OwnedFd>> {
        self.check()?;
        self.composer.present_display(self.id)
    }

    pub fn set_client_target(
        &self,
        slot: u32,
        target: Option<BufferHandle>,
        acquire_fence: Option<OwnedFd>,
        dataspace: Dataspace,
    ) -> Result<()> {
        self.check()?;
        self.composer
            .set_client_target(self.id, slot, target, acquire_fence, dataspace, &[])
    }

    pub fn set_color_mode(&self, mode: ColorMode, intent: RenderIntent) -> Result<()> {
        self.check()?;
        self.composer.set_color_mode(self.id, mode, intent)
    }

    pub fn set_color_transform(&self, matrix: &[f32; 16]) -> Result<()> {
        self.check()?;
        self.composer.set_color_transform(self.id, matrix)
    }

    pub fn set_output_buffer(&self, buffer: BufferHandle, release_fence: Option<OwnedFd>) -> Result<()> {
        self.check()?;
        self.composer
            .set_output_buffer(self.id, Some(buffer), release_fence)
    }

    /// Powering fully on for the first time also loads the display
    /// capabilities
    pub fn set_power_mode(&self, mode: PowerMode) -> Result<()> {
        self.check()?;
        let result = self.composer.set_power_mode(self.id, mode);
        if mode == PowerMode::On {
            self.load_display_capabilities();
        }
        result
    }

    fn load_display_capabilities(&self) {
        let mut slot = lock(&self.display_capabilities);
        if slot.is_some() {
            return;
        }

        let capabilities = match self.composer.get_display_capabilities(self.id) {
            Ok(list) => list.into_iter().collect(),
            Err(Error::Unsupported) => {
                let mut set = HashSet::new();
                if self.capabilities.contains(&Capability::SkipClientColorTransform) {
                    set.insert(DisplayCapability::SkipClientColorTransform);
                }
                if matches!(self.composer.get_doze_support(self.id), Ok(true)) {
                    set.insert(DisplayCapability::Doze);
                }
                set
            }
            Err(e) => {
                error!("[{}] get_display_capabilities failed: {}", self.id, e);
                HashSet::new()
            }
        };
        info!("[{}] display capabilities: {:?}", self.id, capabilities);
        *slot = Some(capabilities);
    }

    pub fn display_capabilities(&self) -> HashSet<DisplayCapability> {
        lock(&self.display_capabilities).clone().unwrap_or_default()
    }

    pub fn has_capability(&self, capability: DisplayCapability) -> bool {
        lock(&self.display_capabilities)
            .as_ref()
            .is_some_and(|set| set.contains(&capability))
    }

    pub fn set_vsync_enabled(&self, enabled: Vsync) -> Result<()> {
        self.check()?;
        self.composer.set_vsync_enabled(self.id, enabled)
    }

    pub fn validate(&self, expected_present_time: i64) -> Result<ChangeCounts> {
        self.check()?;
        self.composer.validate_display(self.id, expected_present_time)
    }

    pub fn present_or_validate(&self, expected_present_time: i64) -> Result<PresentOrValidate> {
        self.check()?;
        self.composer
            .present_or_validate_display(self.id, expected_present_time)
    }

    /// Drop everything queued since the last flush
    pub fn discard_commands(&self) {
        self.composer.reset_commands();
    }

    /// Detach every live layer, then release the display on the server.
    /// Later calls do nothing.
    pub(crate) fn teardown(&self) {
        let layers = {
            let mut state = lock(&self.state);
            if state.torn_down {
                return;
            }
            state.torn_down = true;
            state.connected = false;
            std::mem::take(&mut state.layers)
        };

        for layer in layers.values().filter_map(Weak::upgrade) {
            layer.on_owning_display_destroyed();
        }

        match self.display_type {
            DisplayType::Virtual => {
                if let Err(e) = self.composer.destroy_virtual_display(self.id) {
                    error!("destroy_virtual_display({}) failed: {}", self.id, e);
                }
            }
            DisplayType::Physical => {
                if let Err(e) = self.composer.set_vsync_enabled(self.id, Vsync::Disable) {
                    error!("failed to disable vsync for display {}: {}", self.id, e);
                }
            }
            DisplayType::Invalid => {}
        }
        debug!("Tore down display {}", self.id);
    }
}

impl Drop for Display {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for Display {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Display")
            .field("id", &self.id)
            .field("type", &self.display_type)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_density_defaults_from_long_dimension() {
        let config = ConfigBuilder::new(0, 1).width(1080).height(2340).dpi_x(-1).dpi_y(-1).build();
        assert_eq!(config.dpi_x(), DENSITY_XHIGH);
        assert_eq!(config.dpi_y(), DENSITY_XHIGH);

        let config = ConfigBuilder::new(0, 1).width(720).height(480).dpi_x(-1).dpi_y(-1).build();
        assert_eq!(config.dpi_x(), DENSITY_TV);
    }

    #[test]
    fn test_reported_density_is_milli_dpi() {
        let config = ConfigBuilder::new(3, 2)
            .width(1080)
            .height(1920)
            .dpi_x(403_000)
            .dpi_y(401_500)
            .build();
        assert_eq!(config.dpi_x(), 403.0);
        assert_eq!(config.dpi_y(), 401.5);
        assert_eq!(config.display_id(), 3);
        assert_eq!(config.config_group(), -1);
    }
}
