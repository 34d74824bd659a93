//! Composer device: owns the displays and routes hotplug events

use super::display::Display;
use crate::composer::{Composer, ComposerCallback};
use crate::hal::{Capability, DisplayId, DisplayType, PixelFormat};
use crate::Result;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, info, warn};

pub struct Device {
    composer: Arc<Composer>,
    capabilities: Arc<HashSet<Capability>>,
    displays: Mutex<HashMap<DisplayId, Arc<Display>>>,
    registered_callback: AtomicBool,
}

impl Device {
    pub fn new(composer: Composer) -> Self {
        let capabilities: HashSet<Capability> = composer.get_capabilities().into_iter().collect();
        info!("Composer device capabilities: {:?}", capabilities);

        Self {
            composer: Arc::new(composer),
            capabilities: Arc::new(capabilities),
            displays: Mutex::new(HashMap::new()),
            registered_callback: AtomicBool::new(false),
        }
    }

    fn displays(&self) -> MutexGuard<'_, HashMap<DisplayId, Arc<Display>>> {
        self.displays.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn composer(&self) -> &Arc<Composer> {
        &self.composer
    }

    pub fn capabilities(&self) -> &HashSet<Capability> {
        &self.capabilities
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Register for server notifications. Only the first registration counts.
    pub fn register_callback(&self, callback: Arc<dyn ComposerCallback>) {
        if self.registered_callback.swap(true, Ordering::SeqCst) {
            warn!("Callback already registered. Ignored extra registration attempt.");
            return;
        }
        if let Err(e) = self.composer.register_callback(callback) {
            error!("register_callback failed: {}", e);
        }
    }

    pub fn dump(&self) -> String {
        self.composer.dump_debug_info()
    }

    pub fn max_virtual_display_count(&self) -> u32 {
        self.composer.get_max_virtual_display_count().unwrap_or_else(|e| {
            error!("get_max_virtual_display_count failed: {}", e);
            0
        })
    }

    /// Create a virtual display. Returns it with the format the server chose.
    pub fn create_virtual_display(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<(Arc<Display>, PixelFormat)> {
        info!("Creating virtual display {}x{}", width, height);
        let (id, format) = self.composer.create_virtual_display(width, height, format)?;

        let display = Display::new(
            self.composer.clone(),
            self.capabilities.clone(),
            id,
            DisplayType::Virtual,
        );
        display.set_connected(true);
        self.displays().insert(id, display.clone());
        info!("Created virtual display {}", id);
        Ok((display, format))
    }

    pub fn destroy_display(&self, id: DisplayId) {
        info!("Destroying display {}", id);
        let removed = self.displays().remove(&id);
        if let Some(display) = removed {
            display.teardown();
        }
    }

    pub fn get_display_by_id(&self, id: DisplayId) -> Option<Arc<Display>> {
        self.displays().get(&id).cloned()
    }

    pub fn on_hotplug(&self, id: DisplayId, connected: bool) {
        if !connected {
            // Only marked here; destroy_display releases it
            match self.get_display_by_id(id) {
                Some(display) => display.set_connected(false),
                None => warn!("Attempted to disconnect unknown display {}", id),
            }
            return;
        }

        if let Some(display) = self.get_display_by_id(id) {
            if !display.is_connected() {
                display.set_connected(true);
                return;
            }
            info!("Hotplug connecting already connected display {}, resetting its state", id);
            self.destroy_display(id);
        }

        let display_type = match self.composer.get_display_type(id) {
            Ok(display_type) => display_type,
            Err(e) => {
                error!("get_display_type({}) failed: {}. Aborting hotplug.", id, e);
                return;
            }
        };

        let display = Display::new(
            self.composer.clone(),
            self.capabilities.clone(),
            id,
            display_type,
        );
        display.set_connected(true);
        self.displays().insert(id, display);
        info!("Display {} connected ({:?})", id, display_type);
    }

    /// Displays currently tracked, in no particular order
    pub fn display_ids(&self) -> Vec<DisplayId> {
        self.displays().keys().copied().collect()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let displays: Vec<_> = self.displays().drain().map(|(_, d)| d).collect();
        for display in displays {
            display.teardown();
        }
    }
}

