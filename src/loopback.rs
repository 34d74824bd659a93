//! In-process loopback composition server
//!
//! [`LoopbackComposer`] implements both transport generations on top of a
//! small table of fake displays. It decodes every batch it receives the way a
//! real server would, answers validate/present with fences, and records what
//! it saw so callers can inspect the traffic afterwards.
//!
//! It is not a compositor: nothing is ever drawn.
//!
//! ```no_run
//! use hwc2_compat::loopback::{LoopbackComposer, LoopbackDisplay};
//! use hwc2_compat::legacy::LegacyVersion;
//! use hwc2_compat::Composer;
//!
//! let server = LoopbackComposer::legacy(LegacyVersion::V2_4);
//! server.add_display(LoopbackDisplay::physical(0, 1080, 2340));
//! let composer = Composer::create("default", &server);
//! assert!(!composer.is_structured());
//! ```

use crate::composer::{ComposerCallback, ServiceManager};
use crate::error::{Error, RpcError, RpcResult};
use crate::hal::{
    Attribute, Capability, ClientTargetProperty, ColorMode, Composition, ConfigId, ContentType,
    DisplayCapability, DisplayConnectionType, DisplayDecorationSupport, DisplayId,
    DisplayIdentification, DisplayType, HdrCapabilities, LayerId, PerFrameMetadataKey,
    PixelFormat, PowerMode, RenderIntent, Transform, Vsync, VsyncPeriodChangeConstraints,
    VsyncPeriodChangeTimeline,
};
use crate::legacy::command::{self, Command, Record, WireHandle};
use crate::legacy::queue::MessageQueue;
use crate::legacy::{ExecuteReply, LegacyCallback, LegacyClient, LegacyComposerService, LegacyVersion};
use crate::structured::{
    self, CommandError, CommandResultPayload, DisplayCommand, PresentOrValidateResult,
    StructuredClient, StructuredComposerService,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

const OUTPUT_QUEUE_SIZE: usize = 1024;
const FIRST_VIRTUAL_DISPLAY: DisplayId = 100;

/// One mode of a loopback display
#[derive(Debug, Clone, PartialEq)]
pub struct LoopbackConfig {
    pub id: ConfigId,
    pub width: i32,
    pub height: i32,
    pub vsync_period: i32,
    /// Milli-DPI, `-1` when unknown
    pub dpi_x: i32,
    pub dpi_y: i32,
    pub config_group: i32,
}

impl LoopbackConfig {
    fn attribute(&self, attribute: Attribute) -> Option<i32> {
        match attribute {
            Attribute::Width => Some(self.width),
            Attribute::Height => Some(self.height),
            Attribute::VsyncPeriod => Some(self.vsync_period),
            Attribute::DpiX => Some(self.dpi_x),
            Attribute::DpiY => Some(self.dpi_y),
            Attribute::ConfigGroup => Some(self.config_group),
            Attribute::Invalid => None,
        }
    }
}

/// Static description of a display the server exposes
#[derive(Debug, Clone)]
pub struct LoopbackDisplay {
    pub id: DisplayId,
    pub display_type: DisplayType,
    pub name: String,
    pub configs: Vec<LoopbackConfig>,
    pub active_config: Option<ConfigId>,
    pub doze_support: bool,
    /// `None` makes `get_display_capabilities` answer UNSUPPORTED
    pub capabilities: Option<Vec<DisplayCapability>>,
    pub color_modes: Vec<ColorMode>,
    pub hdr: HdrCapabilities,
    pub connection_type: DisplayConnectionType,
    /// Sent back after every validate when set
    pub client_target_property: Option<ClientTargetProperty>,
}

impl LoopbackDisplay {
    /// A 60 Hz internal panel with one config (id 1) and no reported DPI
    pub fn physical(id: DisplayId, width: i32, height: i32) -> Self {
        Self {
            id,
            display_type: DisplayType::Physical,
            name: format!("loopback-{}", id),
            configs: vec![LoopbackConfig {
                id: 1,
                width,
                height,
                vsync_period: 16_666_666,
                dpi_x: -1,
                dpi_y: -1,
                config_group: 0,
            }],
            active_config: Some(1),
            doze_support: false,
            capabilities: Some(Vec::new()),
            color_modes: vec![ColorMode(0)],
            hdr: HdrCapabilities::default(),
            connection_type: DisplayConnectionType::Internal,
            client_target_property: None,
        }
    }

    fn vsync_period(&self) -> u32 {
        self.active_config
            .and_then(|id| self.configs.iter().find(|c| c.id == id))
            .map(|c| c.vsync_period.max(0) as u32)
            .unwrap_or(0)
    }
}

/// What validate reports for a display until the changes are accepted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidateChanges {
    pub composition_types: Vec<(LayerId, Composition)>,
    pub display_requests: u32,
    pub layer_requests: Vec<(LayerId, u32)>,
}

impl ValidateChanges {
    fn is_empty(&self) -> bool {
        self.composition_types.is_empty() && self.layer_requests.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Protocol {
    Legacy(LegacyVersion),
    Structured(Option<i32>),
}

#[derive(Debug, Default)]
struct Faults {
    transport: bool,
    refuse_client: bool,
    omit_present_or_validate_result: bool,
    queue_registration: bool,
    command_errors: HashMap<Command, Error>,
}

#[derive(Default)]
struct ServerState {
    capabilities: Vec<Capability>,
    displays: BTreeMap<DisplayId, LoopbackDisplay>,
    layers: BTreeMap<DisplayId, BTreeSet<LayerId>>,
    next_layer: LayerId,
    next_virtual_display: DisplayId,
    changes: HashMap<DisplayId, ValidateChanges>,
    buffered_layers: BTreeMap<DisplayId, BTreeSet<LayerId>>,
    vsync: HashMap<DisplayId, bool>,
    power: HashMap<DisplayId, PowerMode>,
    brightness: HashMap<DisplayId, f32>,
    faults: Faults,

    input_queue: Option<MessageQueue>,
    output_queue: Option<MessageQueue>,
    input_queue_registrations: usize,

    legacy_callback: Option<Arc<dyn LegacyCallback>>,
    callback: Option<Arc<dyn ComposerCallback>>,

    calls: Vec<&'static str>,
    legacy_batches: Vec<Vec<Record>>,
    structured_batches: Vec<Vec<DisplayCommand>>,
    destroyed_layers: Vec<(DisplayId, LayerId)>,
    fences_issued: usize,
}

/// Shared handle to one loopback server. Clones talk to the same server.
#[derive(Clone)]
pub struct LoopbackComposer {
    protocol: Protocol,
    service_name: String,
    state: Arc<Mutex<ServerState>>,
}

fn rpc_error(error: Error) -> RpcError {
    RpcError::from(error)
}

/// Stand-in for a sync fence: any pollable descriptor will do
fn new_fence() -> Option<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
    if fd < 0 {
        warn!("eventfd failed: {}", std::io::Error::last_os_error());
        return None;
    }
    // SAFETY: eventfd returned a fresh descriptor nothing else owns
    Some(unsafe { OwnedFd::from_raw_fd(fd) })
}

impl LoopbackComposer {
    fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            service_name: crate::config::DEFAULT_SERVICE.to_string(),
            state: Arc::new(Mutex::new(ServerState {
                next_layer: 1,
                next_virtual_display: FIRST_VIRTUAL_DISPLAY,
                ..Default::default()
            })),
        }
    }

    /// A server speaking the legacy command-queue protocol at `version`
    pub fn legacy(version: LegacyVersion) -> Self {
        Self::new(Protocol::Legacy(version))
    }

    /// A server speaking the structured protocol. `None` makes the version
    /// query fail.
    pub fn structured(interface_version: Option<i32>) -> Self {
        Self::new(Protocol::Structured(interface_version))
    }

    /// Register under `name` instead of `default`
    pub fn with_service_name(mut self, name: &str) -> Self {
        self.service_name = name.to_string();
        self
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the state and log `call`
    fn call(&self, call: &'static str) -> MutexGuard<'_, ServerState> {
        let mut state = self.state();
        state.calls.push(call);
        state
    }

    fn display<T>(
        &self,
        call: &'static str,
        display: DisplayId,
        f: impl FnOnce(&LoopbackDisplay) -> RpcResult<T>,
    ) -> RpcResult<T> {
        let state = self.call(call);
        match state.displays.get(&display) {
            Some(d) => f(d),
            None => Err(rpc_error(Error::BadDisplay)),
        }
    }

    fn display_mut<T>(
        &self,
        call: &'static str,
        display: DisplayId,
        f: impl FnOnce(&mut LoopbackDisplay) -> RpcResult<T>,
    ) -> RpcResult<T> {
        let mut state = self.call(call);
        match state.displays.get_mut(&display) {
            Some(d) => f(d),
            None => Err(rpc_error(Error::BadDisplay)),
        }
    }

    // ---- configuration ----

    pub fn set_capabilities(&self, capabilities: Vec<Capability>) {
        self.state().capabilities = capabilities;
    }

    pub fn add_display(&self, new_display: LoopbackDisplay) {
        info!("loopback: adding display {}", new_display.id);
        self.state().displays.insert(new_display.id, new_display);
    }

    pub fn remove_display(&self, display: DisplayId) {
        let mut state = self.state();
        state.displays.remove(&display);
        state.layers.remove(&display);
    }

    /// Report `changes` from every validate of `display` until they are
    /// accepted
    pub fn set_validate_changes(&self, display: DisplayId, changes: ValidateChanges) {
        self.state().changes.insert(display, changes);
    }

    /// Answer every record of kind `command` with `error`
    pub fn fail_command(&self, command: Command, error: Error) {
        self.state().faults.command_errors.insert(command, error);
    }

    pub fn clear_command_failures(&self) {
        self.state().faults.command_errors.clear();
    }

    /// Make `execute_commands` fail before reaching the server
    pub fn fail_transport(&self, fail: bool) {
        self.state().faults.transport = fail;
    }

    /// Make `set_input_command_queue` fail with NO_RESOURCES
    pub fn fail_queue_registration(&self, fail: bool) {
        self.state().faults.queue_registration = fail;
    }

    pub fn refuse_clients(&self, refuse: bool) {
        self.state().faults.refuse_client = refuse;
    }

    pub fn omit_present_or_validate_result(&self, omit: bool) {
        self.state().faults.omit_present_or_validate_result = omit;
    }

    // ---- observation ----

    /// Names of every RPC received, in order
    pub fn calls(&self) -> Vec<&'static str> {
        self.state().calls.clone()
    }

    pub fn call_count(&self, call: &str) -> usize {
        self.state().calls.iter().filter(|c| **c == call).count()
    }

    /// Decoded records of every legacy batch received
    pub fn legacy_batches(&self) -> Vec<Vec<Record>> {
        self.state().legacy_batches.clone()
    }

    pub fn take_structured_batches(&self) -> Vec<Vec<DisplayCommand>> {
        std::mem::take(&mut self.state().structured_batches)
    }

    pub fn input_queue_registrations(&self) -> usize {
        self.state().input_queue_registrations
    }

    pub fn live_layers(&self, display: DisplayId) -> Vec<LayerId> {
        self.state()
            .layers
            .get(&display)
            .map(|layers| layers.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn destroyed_layers(&self) -> Vec<(DisplayId, LayerId)> {
        self.state().destroyed_layers.clone()
    }

    pub fn vsync_enabled(&self, display: DisplayId) -> Option<bool> {
        self.state().vsync.get(&display).copied()
    }

    pub fn power_mode(&self, display: DisplayId) -> Option<PowerMode> {
        self.state().power.get(&display).copied()
    }

    pub fn display_brightness(&self, display: DisplayId) -> Option<f32> {
        self.state().brightness.get(&display).copied()
    }

    pub fn active_config(&self, display: DisplayId) -> Option<ConfigId> {
        self.state().displays.get(&display).and_then(|d| d.active_config)
    }

    pub fn fences_issued(&self) -> usize {
        self.state().fences_issued
    }

    // ---- events ----

    pub fn hotplug(&self, display: DisplayId, connected: bool) {
        let (legacy, callback) = self.callbacks();
        if let Some(cb) = legacy {
            cb.on_hotplug(display, connected);
        }
        if let Some(cb) = callback {
            cb.on_hotplug(display, connected);
        }
    }

    pub fn refresh(&self, display: DisplayId) {
        let (legacy, callback) = self.callbacks();
        if let Some(cb) = legacy {
            cb.on_refresh(display);
        }
        if let Some(cb) = callback {
            cb.on_refresh(display);
        }
    }

    /// Fire a vsync the way a server of this generation would
    pub fn vsync(&self, display: DisplayId, timestamp: i64) {
        let period = self
            .state()
            .displays
            .get(&display)
            .map(LoopbackDisplay::vsync_period)
            .unwrap_or(0);
        let (legacy, callback) = self.callbacks();
        if let Some(cb) = legacy {
            match self.protocol {
                Protocol::Legacy(LegacyVersion::V2_4) => cb.on_vsync_2_4(display, timestamp, period),
                _ => cb.on_vsync(display, timestamp),
            }
        }
        if let Some(cb) = callback {
            cb.on_vsync(display, timestamp, Some(period));
        }
    }

    pub fn vsync_idle(&self, display: DisplayId) {
        if let (_, Some(cb)) = self.callbacks() {
            cb.on_vsync_idle(display);
        }
    }

    fn callbacks(&self) -> (Option<Arc<dyn LegacyCallback>>, Option<Arc<dyn ComposerCallback>>) {
        let state = self.state();
        (state.legacy_callback.clone(), state.callback.clone())
    }

    // ---- shared server behavior ----

    fn capabilities(&self) -> RpcResult<Vec<Capability>> {
        Ok(self.call("getCapabilities").capabilities.clone())
    }

    fn dump(&self) -> RpcResult<String> {
        let state = self.call("dumpDebugInfo");
        let mut out = format!("loopback composer ({:?})\n", self.protocol);
        for (id, display) in &state.displays {
            let layers = state.layers.get(id).map(BTreeSet::len).unwrap_or(0);
            out.push_str(&format!(
                "  display {} '{}' {:?}: {} layers\n",
                id, display.name, display.display_type, layers
            ));
        }
        Ok(out)
    }

    fn create_virtual(&self, width: u32, height: u32, format: PixelFormat) -> RpcResult<(DisplayId, PixelFormat)> {
        let mut state = self.call("createVirtualDisplay");
        let id = state.next_virtual_display;
        state.next_virtual_display += 1;
        let mut display = LoopbackDisplay::physical(id, width as i32, height as i32);
        display.display_type = DisplayType::Virtual;
        state.displays.insert(id, display);
        Ok((id, format))
    }

    fn destroy_virtual(&self, display: DisplayId) -> RpcResult<()> {
        let mut state = self.call("destroyVirtualDisplay");
        match state.displays.get(&display) {
            Some(d) if d.display_type == DisplayType::Virtual => {
                state.displays.remove(&display);
                state.layers.remove(&display);
                Ok(())
            }
            Some(_) => Err(rpc_error(Error::BadParameter)),
            None => Err(rpc_error(Error::BadDisplay)),
        }
    }

    fn create_layer_on(&self, display: DisplayId) -> RpcResult<LayerId> {
        let mut state = self.call("createLayer");
        if !state.displays.contains_key(&display) {
            return Err(rpc_error(Error::BadDisplay));
        }
        let id = state.next_layer;
        state.next_layer += 1;
        state.layers.entry(display).or_default().insert(id);
        Ok(id)
    }

    fn destroy_layer_on(&self, display: DisplayId, layer: LayerId) -> RpcResult<()> {
        let mut state = self.call("destroyLayer");
        if !state.displays.contains_key(&display) {
            return Err(rpc_error(Error::BadDisplay));
        }
        let removed = state
            .layers
            .get_mut(&display)
            .is_some_and(|layers| layers.remove(&layer));
        if !removed {
            return Err(rpc_error(Error::BadLayer));
        }
        state.destroyed_layers.push((display, layer));
        Ok(())
    }

    fn attribute(&self, display: DisplayId, config: ConfigId, attribute: Attribute) -> RpcResult<i32> {
        self.display("getDisplayAttribute", display, |d| {
            let config = d
                .configs
                .iter()
                .find(|c| c.id == config)
                .ok_or_else(|| rpc_error(Error::BadConfig))?;
            config
                .attribute(attribute)
                .ok_or_else(|| rpc_error(Error::BadParameter))
        })
    }

    fn set_active(&self, display: DisplayId, config: ConfigId) -> RpcResult<()> {
        self.display_mut("setActiveConfig", display, |d| {
            if !d.configs.iter().any(|c| c.id == config) {
                return Err(rpc_error(Error::BadConfig));
            }
            d.active_config = Some(config);
            Ok(())
        })
    }

    fn set_power(&self, display: DisplayId, mode: PowerMode) -> RpcResult<()> {
        let mut state = self.call("setPowerMode");
        if !state.displays.contains_key(&display) {
            return Err(rpc_error(Error::BadDisplay));
        }
        state.power.insert(display, mode);
        Ok(())
    }

    fn set_brightness(&self, display: DisplayId, brightness: f32) -> RpcResult<()> {
        let mut state = self.call("setDisplayBrightness");
        if !state.displays.contains_key(&display) {
            return Err(rpc_error(Error::BadDisplay));
        }
        state.brightness.insert(display, brightness);
        Ok(())
    }

    fn set_vsync(&self, display: DisplayId, enabled: bool) -> RpcResult<()> {
        let mut state = self.call("setVsyncEnabled");
        if !state.displays.contains_key(&display) {
            return Err(rpc_error(Error::BadDisplay));
        }
        state.vsync.insert(display, enabled);
        Ok(())
    }

    fn check_display(&self, call: &'static str, display: DisplayId) -> RpcResult<()> {
        self.display(call, display, |_| Ok(()))
    }
}

fn issue_fence(state: &mut ServerState) -> Option<OwnedFd> {
    let fence = new_fence();
    if fence.is_some() {
        state.fences_issued += 1;
    }
    fence
}

fn release_fences(state: &mut ServerState, display: DisplayId) -> Vec<(LayerId, Option<OwnedFd>)> {
    let layers = state.buffered_layers.remove(&display).unwrap_or_default();
    layers
        .into_iter()
        .map(|layer| (layer, issue_fence(state)))
        .collect()
}

/// Builds the legacy reply stream
#[derive(Default)]
struct ReplyWriter {
    words: Vec<u32>,
    handles: Vec<WireHandle>,
    current: Option<DisplayId>,
}

impl ReplyWriter {
    fn begin(&mut self, command: Command, length: usize) {
        self.words.push(command::header(command, length as u16));
    }

    fn select(&mut self, display: DisplayId) {
        if self.current == Some(display) {
            return;
        }
        self.begin(Command::SelectDisplay, command::SELECT_DISPLAY_LENGTH as usize);
        self.words.extend_from_slice(&command::split_u64(display));
        self.current = Some(display);
    }

    fn error(&mut self, location: u32, error: Error) {
        self.begin(Command::SetError, command::SET_ERROR_LENGTH as usize);
        self.words.push(location);
        self.words.push(error.code() as u32);
    }

    fn fence(&mut self, fence: Option<OwnedFd>) -> u32 {
        match fence {
            Some(fd) => {
                self.handles.push(WireHandle::Fence(fd));
                (self.handles.len() - 1) as u32
            }
            None => -1i32 as u32,
        }
    }

    fn changes(&mut self, display: DisplayId, changes: &ValidateChanges) {
        self.select(display);
        if !changes.composition_types.is_empty() {
            self.begin(
                Command::SetChangedCompositionTypes,
                changes.composition_types.len() * 3,
            );
            for (layer, composition) in &changes.composition_types {
                self.words.extend_from_slice(&command::split_u64(*layer));
                self.words.push(composition.raw() as u32);
            }
        }
        if changes.display_requests != 0 || !changes.layer_requests.is_empty() {
            self.begin(Command::SetDisplayRequests, 1 + changes.layer_requests.len() * 3);
            self.words.push(changes.display_requests);
            for (layer, request) in &changes.layer_requests {
                self.words.extend_from_slice(&command::split_u64(*layer));
                self.words.push(*request);
            }
        }
    }

    fn present(&mut self, display: DisplayId, fence: Option<OwnedFd>, releases: Vec<(LayerId, Option<OwnedFd>)>) {
        self.select(display);
        let index = self.fence(fence);
        self.begin(Command::SetPresentFence, command::SET_PRESENT_FENCE_LENGTH as usize);
        self.words.push(index);

        if releases.is_empty() {
            return;
        }
        self.begin(Command::SetReleaseFences, releases.len() * 3);
        for (layer, fence) in releases {
            let index = self.fence(fence);
            self.words.extend_from_slice(&command::split_u64(layer));
            self.words.push(index);
        }
    }

    fn present_or_validate_result(&mut self, display: DisplayId, presented: bool) {
        self.select(display);
        self.begin(
            Command::SetPresentOrValidateDisplayResult,
            command::PRESENT_OR_VALIDATE_RESULT_LENGTH as usize,
        );
        self.words.push(presented as u32);
    }

    fn client_target_property(&mut self, display: DisplayId, property: ClientTargetProperty) {
        self.select(display);
        self.begin(
            Command::SetClientTargetProperty,
            command::SET_CLIENT_TARGET_PROPERTY_LENGTH as usize,
        );
        self.words.push(property.pixel_format.0 as u32);
        self.words.push(property.dataspace.0 as u32);
    }
}

impl LoopbackComposer {
    fn run_legacy_batch(&self, state: &mut ServerState, records: &[Record]) -> ReplyWriter {
        let mut reply = ReplyWriter::default();
        let mut display: Option<DisplayId> = None;
        let mut layer: Option<LayerId> = None;

        for record in records {
            let Some(command) = record.command() else {
                reply.error(record.location, Error::BadParameter);
                continue;
            };

            if command == Command::SelectDisplay {
                let id = record
                    .payload
                    .get(..2)
                    .map(|p| command::join_u64(p[0], p[1]));
                display = id.filter(|id| state.displays.contains_key(id));
                layer = None;
                if display.is_none() {
                    reply.error(record.location, Error::BadDisplay);
                }
                continue;
            }
            if command == Command::SelectLayer {
                layer = record.payload.get(..2).map(|p| command::join_u64(p[0], p[1]));
                continue;
            }

            let Some(current) = display else {
                reply.error(record.location, Error::BadDisplay);
                continue;
            };
            if let Some(error) = state.faults.command_errors.get(&command) {
                reply.error(record.location, *error);
                continue;
            }

            match command {
                Command::SetLayerBuffer => {
                    if let Some(layer) = layer {
                        state.buffered_layers.entry(current).or_default().insert(layer);
                    }
                }
                Command::ValidateDisplay => {
                    let changes = state.changes.get(&current).cloned().unwrap_or_default();
                    reply.changes(current, &changes);
                    self.legacy_client_target_property(state, &mut reply, current);
                }
                Command::AcceptDisplayChanges => {
                    state.changes.remove(&current);
                }
                Command::PresentDisplay => {
                    let fence = issue_fence(state);
                    let releases = release_fences(state, current);
                    reply.present(current, fence, releases);
                }
                Command::PresentOrValidateDisplay => {
                    let changes = state.changes.get(&current).cloned().unwrap_or_default();
                    let presented = changes.is_empty();
                    if presented {
                        let fence = issue_fence(state);
                        let releases = release_fences(state, current);
                        reply.present(current, fence, releases);
                    } else {
                        reply.changes(current, &changes);
                    }
                    if !state.faults.omit_present_or_validate_result {
                        reply.present_or_validate_result(current, presented);
                    }
                }
                _ => {}
            }
        }
        reply
    }

    fn legacy_client_target_property(&self, state: &ServerState, reply: &mut ReplyWriter, display: DisplayId) {
        if !matches!(self.protocol, Protocol::Legacy(LegacyVersion::V2_4)) {
            return;
        }
        if let Some(property) = state.displays.get(&display).and_then(|d| d.client_target_property) {
            reply.client_target_property(display, property);
        }
    }

    fn run_structured_batch(
        &self,
        state: &mut ServerState,
        commands: &[DisplayCommand],
    ) -> Vec<CommandResultPayload> {
        let mut results = Vec::new();
        for (index, command) in commands.iter().enumerate() {
            let display = command.display;
            let failure = if !state.displays.contains_key(&display) {
                Some(Error::BadDisplay)
            } else {
                state
                    .faults
                    .command_errors
                    .iter()
                    .find(|(kind, _)| carries(command, **kind))
                    .map(|(_, error)| *error)
            };
            if let Some(error) = failure {
                results.push(CommandResultPayload::Error(CommandError {
                    command_index: index as i32,
                    error_code: error.code(),
                }));
                continue;
            }

            for layer in &command.layers {
                if layer.buffer.is_some() {
                    state.buffered_layers.entry(display).or_default().insert(layer.layer);
                }
            }
            if command.accept_display_changes {
                state.changes.remove(&display);
            }

            let changes = state.changes.get(&display).cloned().unwrap_or_default();
            if command.validate_display {
                push_changes(&mut results, display, &changes);
                if let Some(property) = state.displays.get(&display).and_then(|d| d.client_target_property) {
                    results.push(CommandResultPayload::ClientTargetProperty { display, property });
                }
            }
            if command.present_display {
                push_present(&mut results, state, display);
            }
            if command.present_or_validate_display {
                let presented = changes.is_empty();
                if presented {
                    push_present(&mut results, state, display);
                } else {
                    push_changes(&mut results, display, &changes);
                }
                if !state.faults.omit_present_or_validate_result {
                    let result = if presented {
                        PresentOrValidateResult::Presented
                    } else {
                        PresentOrValidateResult::Validated
                    };
                    results.push(CommandResultPayload::PresentOrValidateResult { display, result });
                }
            }
        }
        results
    }
}

fn push_changes(results: &mut Vec<CommandResultPayload>, display: DisplayId, changes: &ValidateChanges) {
    if !changes.composition_types.is_empty() {
        results.push(CommandResultPayload::ChangedCompositionTypes {
            display,
            layers: changes.composition_types.clone(),
        });
    }
    if changes.display_requests != 0 || !changes.layer_requests.is_empty() {
        results.push(CommandResultPayload::DisplayRequest {
            display,
            mask: changes.display_requests,
            layer_requests: changes.layer_requests.clone(),
        });
    }
}

fn push_present(results: &mut Vec<CommandResultPayload>, state: &mut ServerState, display: DisplayId) {
    let fence = issue_fence(state);
    results.push(CommandResultPayload::PresentFence { display, fence });
    let layers = release_fences(state, display);
    if !layers.is_empty() {
        results.push(CommandResultPayload::ReleaseFences { display, layers });
    }
}

/// Whether a structured display command carries the change `kind` names
fn carries(command: &DisplayCommand, kind: Command) -> bool {
    let any_layer = |f: fn(&structured::LayerCommand) -> bool| command.layers.iter().any(f);
    match kind {
        Command::SetColorTransform => command.color_transform.is_some(),
        Command::SetClientTarget => command.client_target.is_some(),
        Command::SetOutputBuffer => command.output_buffer.is_some(),
        Command::ValidateDisplay => command.validate_display,
        Command::AcceptDisplayChanges => command.accept_display_changes,
        Command::PresentDisplay => command.present_display,
        Command::PresentOrValidateDisplay => command.present_or_validate_display,
        Command::SetLayerCursorPosition => any_layer(|l| l.cursor_position.is_some()),
        Command::SetLayerBuffer => any_layer(|l| l.buffer.is_some()),
        Command::SetLayerSurfaceDamage => any_layer(|l| l.damage.is_some()),
        Command::SetLayerPerFrameMetadata => any_layer(|l| l.per_frame_metadata.is_some()),
        Command::SetLayerPerFrameMetadataBlobs => any_layer(|l| l.per_frame_metadata_blobs.is_some()),
        Command::SetLayerBlendMode => any_layer(|l| l.blend_mode.is_some()),
        Command::SetLayerColor => any_layer(|l| l.color.is_some()),
        Command::SetLayerCompositionType => any_layer(|l| l.composition.is_some()),
        Command::SetLayerDataspace => any_layer(|l| l.dataspace.is_some()),
        Command::SetLayerDisplayFrame => any_layer(|l| l.display_frame.is_some()),
        Command::SetLayerPlaneAlpha => any_layer(|l| l.plane_alpha.is_some()),
        Command::SetLayerSidebandStream => any_layer(|l| l.sideband_stream.is_some()),
        Command::SetLayerSourceCrop => any_layer(|l| l.source_crop.is_some()),
        Command::SetLayerTransform => any_layer(|l| l.transform.is_some()),
        Command::SetLayerVisibleRegion => any_layer(|l| l.visible_region.is_some()),
        Command::SetLayerZOrder => any_layer(|l| l.z.is_some()),
        Command::SetLayerColorTransform => any_layer(|l| l.color_transform.is_some()),
        _ => false,
    }
}

impl ServiceManager for LoopbackComposer {
    fn is_declared(&self, instance: &str) -> bool {
        matches!(self.protocol, Protocol::Structured(_))
            && instance == structured::instance_name(&self.service_name)
    }

    fn get_structured(&self, instance: &str) -> Option<Arc<dyn StructuredComposerService>> {
        if self.is_declared(instance) {
            Some(Arc::new(self.clone()))
        } else {
            None
        }
    }

    fn get_legacy(&self, name: &str) -> Option<Arc<dyn LegacyComposerService>> {
        match self.protocol {
            Protocol::Legacy(_) if name == self.service_name => Some(Arc::new(self.clone())),
            _ => None,
        }
    }
}

impl LegacyComposerService for LoopbackComposer {
    fn version(&self) -> LegacyVersion {
        match self.protocol {
            Protocol::Legacy(version) => version,
            Protocol::Structured(_) => LegacyVersion::V2_4,
        }
    }

    fn create_client(&self) -> RpcResult<Arc<dyn LegacyClient>> {
        if self.call("createClient").faults.refuse_client {
            return Err(RpcError::Transport("client refused".into()));
        }
        Ok(Arc::new(self.clone()))
    }

    fn get_capabilities(&self) -> RpcResult<Vec<Capability>> {
        self.capabilities()
    }

    fn dump_debug_info(&self) -> RpcResult<String> {
        self.dump()
    }
}

impl LegacyClient for LoopbackComposer {
    fn register_callback(&self, callback: Arc<dyn LegacyCallback>) -> RpcResult<()> {
        self.call("registerCallback").legacy_callback = Some(callback);
        Ok(())
    }

    fn get_max_virtual_display_count(&self) -> RpcResult<u32> {
        self.call("getMaxVirtualDisplayCount");
        Ok(1)
    }

    fn create_virtual_display(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        _buffer_slot_count: u32,
    ) -> RpcResult<(DisplayId, PixelFormat)> {
        self.create_virtual(width, height, format)
    }

    fn destroy_virtual_display(&self, display: DisplayId) -> RpcResult<()> {
        self.destroy_virtual(display)
    }

    fn create_layer(&self, display: DisplayId, _buffer_slot_count: u32) -> RpcResult<LayerId> {
        self.create_layer_on(display)
    }

    fn destroy_layer(&self, display: DisplayId, layer: LayerId) -> RpcResult<()> {
        self.destroy_layer_on(display, layer)
    }

    fn get_active_config(&self, display: DisplayId) -> RpcResult<ConfigId> {
        self.display("getActiveConfig", display, |d| {
            d.active_config.ok_or_else(|| rpc_error(Error::BadConfig))
        })
    }

    fn get_color_modes(&self, display: DisplayId) -> RpcResult<Vec<ColorMode>> {
        self.display("getColorModes", display, |d| Ok(d.color_modes.clone()))
    }

    fn get_display_attribute(&self, display: DisplayId, config: ConfigId, attribute: Attribute) -> RpcResult<i32> {
        self.attribute(display, config, attribute)
    }

    fn get_display_configs(&self, display: DisplayId) -> RpcResult<Vec<ConfigId>> {
        self.display("getDisplayConfigs", display, |d| {
            Ok(d.configs.iter().map(|c| c.id).collect())
        })
    }

    fn get_display_name(&self, display: DisplayId) -> RpcResult<String> {
        self.display("getDisplayName", display, |d| Ok(d.name.clone()))
    }

    fn get_display_type(&self, display: DisplayId) -> RpcResult<DisplayType> {
        self.display("getDisplayType", display, |d| Ok(d.display_type))
    }

    fn get_doze_support(&self, display: DisplayId) -> RpcResult<bool> {
        self.display("getDozeSupport", display, |d| Ok(d.doze_support))
    }

    fn get_hdr_capabilities(&self, display: DisplayId) -> RpcResult<HdrCapabilities> {
        self.display("getHdrCapabilities", display, |d| Ok(d.hdr.clone()))
    }

    fn set_active_config(&self, display: DisplayId, config: ConfigId) -> RpcResult<()> {
        self.set_active(display, config)
    }

    fn set_color_mode(&self, display: DisplayId, _mode: ColorMode, _intent: RenderIntent) -> RpcResult<()> {
        self.check_display("setColorMode", display)
    }

    fn set_power_mode(&self, display: DisplayId, mode: PowerMode) -> RpcResult<()> {
        self.set_power(display, mode)
    }

    fn set_vsync_enabled(&self, display: DisplayId, enabled: Vsync) -> RpcResult<()> {
        self.set_vsync(display, enabled == Vsync::Enable)
    }

    fn set_client_target_slot_count(&self, display: DisplayId, _count: u32) -> RpcResult<()> {
        self.check_display("setClientTargetSlotCount", display)
    }

    fn set_input_command_queue(&self, queue: MessageQueue) -> RpcResult<()> {
        let mut state = self.call("setInputCommandQueue");
        if state.faults.queue_registration {
            return Err(rpc_error(Error::NoResources));
        }
        state.input_queue = Some(queue);
        state.input_queue_registrations += 1;
        Ok(())
    }

    fn get_output_command_queue(&self) -> RpcResult<MessageQueue> {
        let mut state = self.call("getOutputCommandQueue");
        Ok(state
            .output_queue
            .get_or_insert_with(|| MessageQueue::new(OUTPUT_QUEUE_SIZE))
            .clone())
    }

    fn execute_commands(&self, in_length: u32, _in_handles: Vec<WireHandle>) -> RpcResult<ExecuteReply> {
        let mut guard = self.call("executeCommands");
        let state = &mut *guard;
        if state.faults.transport {
            // The batch is lost with the call
            if let Some(queue) = &state.input_queue {
                let _ = queue.read(in_length as usize);
            }
            return Err(RpcError::Transport("loopback transport down".into()));
        }

        let words = state
            .input_queue
            .as_ref()
            .and_then(|queue| queue.read(in_length as usize))
            .ok_or_else(|| rpc_error(Error::NoResources))?;
        let records = command::split_records(&words).ok_or_else(|| rpc_error(Error::BadParameter))?;
        debug!("loopback: executing {} records", records.len());

        let reply = self.run_legacy_batch(state, &records);
        state.legacy_batches.push(records);

        let mut out_queue_changed = false;
        let fits = state
            .output_queue
            .as_ref()
            .is_some_and(|q| q.capacity() >= reply.words.len());
        if !fits {
            state.output_queue = Some(MessageQueue::new(reply.words.len().max(OUTPUT_QUEUE_SIZE)));
            out_queue_changed = true;
        }
        let written = state
            .output_queue
            .as_ref()
            .is_some_and(|q| q.write(&reply.words));
        if !written {
            return Err(rpc_error(Error::NoResources));
        }

        Ok(ExecuteReply {
            out_queue_changed,
            out_length: reply.words.len() as u32,
            out_handles: reply.handles,
        })
    }

    fn get_per_frame_metadata_keys(&self, display: DisplayId) -> RpcResult<Vec<PerFrameMetadataKey>> {
        self.display("getPerFrameMetadataKeys", display, |d| {
            if d.hdr.types.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(vec![PerFrameMetadataKey::MaxLuminance, PerFrameMetadataKey::MinLuminance])
            }
        })
    }

    fn get_display_identification_data(&self, display: DisplayId) -> RpcResult<DisplayIdentification> {
        self.display("getDisplayIdentificationData", display, |d| {
            Ok(DisplayIdentification { port: d.id as u8, data: d.name.as_bytes().to_vec() })
        })
    }

    fn get_display_capabilities(&self, display: DisplayId) -> RpcResult<Vec<DisplayCapability>> {
        self.display("getDisplayCapabilities", display, |d| {
            d.capabilities.clone().ok_or_else(|| rpc_error(Error::Unsupported))
        })
    }

    fn set_display_brightness(&self, display: DisplayId, brightness: f32) -> RpcResult<()> {
        self.set_brightness(display, brightness)
    }

    fn get_display_connection_type(&self, display: DisplayId) -> RpcResult<DisplayConnectionType> {
        self.display("getDisplayConnectionType", display, |d| Ok(d.connection_type))
    }

    fn get_display_vsync_period(&self, display: DisplayId) -> RpcResult<u32> {
        self.display("getDisplayVsyncPeriod", display, |d| Ok(d.vsync_period()))
    }

    fn set_active_config_with_constraints(
        &self,
        display: DisplayId,
        config: ConfigId,
        constraints: VsyncPeriodChangeConstraints,
    ) -> RpcResult<VsyncPeriodChangeTimeline> {
        self.set_active(display, config)?;
        Ok(VsyncPeriodChangeTimeline {
            new_vsync_applied_time_nanos: constraints.desired_time_nanos,
            refresh_required: false,
            refresh_time_nanos: 0,
        })
    }

    fn set_auto_low_latency_mode(&self, display: DisplayId, _on: bool) -> RpcResult<()> {
        self.check_display("setAutoLowLatencyMode", display)
    }

    fn get_supported_content_types(&self, display: DisplayId) -> RpcResult<Vec<ContentType>> {
        self.display("getSupportedContentTypes", display, |_| Ok(vec![ContentType::Graphics]))
    }

    fn set_content_type(&self, display: DisplayId, _content_type: ContentType) -> RpcResult<()> {
        self.check_display("setContentType", display)
    }
}

impl StructuredComposerService for LoopbackComposer {
    fn interface_version(&self) -> RpcResult<i32> {
        match self.protocol {
            Protocol::Structured(Some(version)) => Ok(version),
            _ => Err(RpcError::Transport("version unavailable".into())),
        }
    }

    fn create_client(&self) -> RpcResult<Arc<dyn StructuredClient>> {
        if self.call("createClient").faults.refuse_client {
            return Err(RpcError::Transport("client refused".into()));
        }
        Ok(Arc::new(self.clone()))
    }

    fn get_capabilities(&self) -> RpcResult<Vec<Capability>> {
        self.capabilities()
    }

    fn dump_debug_info(&self) -> RpcResult<String> {
        self.dump()
    }
}

impl StructuredClient for LoopbackComposer {
    fn register_callback(&self, callback: Arc<dyn ComposerCallback>) -> RpcResult<()> {
        self.call("registerCallback").callback = Some(callback);
        Ok(())
    }

    fn execute_commands(&self, commands: Vec<DisplayCommand>) -> RpcResult<Vec<CommandResultPayload>> {
        let mut guard = self.call("executeCommands");
        let state = &mut *guard;
        if state.faults.transport {
            return Err(RpcError::Transport("loopback transport down".into()));
        }
        debug!("loopback: executing {} display commands", commands.len());
        let results = self.run_structured_batch(state, &commands);
        state.structured_batches.push(commands);
        Ok(results)
    }

    fn get_max_virtual_display_count(&self) -> RpcResult<u32> {
        self.call("getMaxVirtualDisplayCount");
        Ok(1)
    }

    fn create_virtual_display(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        _buffer_slot_count: u32,
    ) -> RpcResult<(DisplayId, PixelFormat)> {
        self.create_virtual(width, height, format)
    }

    fn destroy_virtual_display(&self, display: DisplayId) -> RpcResult<()> {
        self.destroy_virtual(display)
    }

    fn create_layer(&self, display: DisplayId, _buffer_slot_count: u32) -> RpcResult<LayerId> {
        self.create_layer_on(display)
    }

    fn destroy_layer(&self, display: DisplayId, layer: LayerId) -> RpcResult<()> {
        self.destroy_layer_on(display, layer)
    }

    fn get_active_config(&self, display: DisplayId) -> RpcResult<ConfigId> {
        self.display("getActiveConfig", display, |d| {
            d.active_config.ok_or_else(|| rpc_error(Error::BadConfig))
        })
    }

    fn get_color_modes(&self, display: DisplayId) -> RpcResult<Vec<ColorMode>> {
        self.display("getColorModes", display, |d| Ok(d.color_modes.clone()))
    }

    fn get_display_attribute(&self, display: DisplayId, config: ConfigId, attribute: Attribute) -> RpcResult<i32> {
        self.attribute(display, config, attribute)
    }

    fn get_display_configs(&self, display: DisplayId) -> RpcResult<Vec<ConfigId>> {
        self.display("getDisplayConfigs", display, |d| {
            Ok(d.configs.iter().map(|c| c.id).collect())
        })
    }

    fn get_display_name(&self, display: DisplayId) -> RpcResult<String> {
        self.display("getDisplayName", display, |d| Ok(d.name.clone()))
    }

    fn get_display_type(&self, display: DisplayId) -> RpcResult<DisplayType> {
        self.display("getDisplayType", display, |d| Ok(d.display_type))
    }

    fn get_hdr_capabilities(&self, display: DisplayId) -> RpcResult<HdrCapabilities> {
        self.display("getHdrCapabilities", display, |d| Ok(d.hdr.clone()))
    }

    fn get_display_capabilities(&self, display: DisplayId) -> RpcResult<Vec<DisplayCapability>> {
        self.display("getDisplayCapabilities", display, |d| {
            d.capabilities.clone().ok_or_else(|| rpc_error(Error::Unsupported))
        })
    }

    fn get_display_identification_data(&self, display: DisplayId) -> RpcResult<DisplayIdentification> {
        self.display("getDisplayIdentificationData", display, |d| {
            Ok(DisplayIdentification { port: d.id as u8, data: d.name.as_bytes().to_vec() })
        })
    }

    fn get_display_connection_type(&self, display: DisplayId) -> RpcResult<DisplayConnectionType> {
        self.display("getDisplayConnectionType", display, |d| Ok(d.connection_type))
    }

    fn get_display_vsync_period(&self, display: DisplayId) -> RpcResult<u32> {
        self.display("getDisplayVsyncPeriod", display, |d| Ok(d.vsync_period()))
    }

    fn get_per_frame_metadata_keys(&self, display: DisplayId) -> RpcResult<Vec<PerFrameMetadataKey>> {
        self.display("getPerFrameMetadataKeys", display, |_| Ok(Vec::new()))
    }

    fn get_supported_content_types(&self, display: DisplayId) -> RpcResult<Vec<ContentType>> {
        self.display("getSupportedContentTypes", display, |_| Ok(vec![ContentType::Graphics]))
    }

    fn set_active_config(&self, display: DisplayId, config: ConfigId) -> RpcResult<()> {
        self.set_active(display, config)
    }

    fn set_active_config_with_constraints(
        &self,
        display: DisplayId,
        config: ConfigId,
        constraints: VsyncPeriodChangeConstraints,
    ) -> RpcResult<VsyncPeriodChangeTimeline> {
        self.set_active(display, config)?;
        Ok(VsyncPeriodChangeTimeline {
            new_vsync_applied_time_nanos: constraints.desired_time_nanos,
            refresh_required: false,
            refresh_time_nanos: 0,
        })
    }

    fn set_color_mode(&self, display: DisplayId, _mode: ColorMode, _intent: RenderIntent) -> RpcResult<()> {
        self.check_display("setColorMode", display)
    }

    fn set_power_mode(&self, display: DisplayId, mode: PowerMode) -> RpcResult<()> {
        self.set_power(display, mode)
    }

    fn set_vsync_enabled(&self, display: DisplayId, enabled: bool) -> RpcResult<()> {
        self.set_vsync(display, enabled)
    }

    fn set_client_target_slot_count(&self, display: DisplayId, _count: u32) -> RpcResult<()> {
        self.check_display("setClientTargetSlotCount", display)
    }

    fn set_display_brightness(&self, display: DisplayId, brightness: f32) -> RpcResult<()> {
        self.set_brightness(display, brightness)
    }

    fn set_auto_low_latency_mode(&self, display: DisplayId, _on: bool) -> RpcResult<()> {
        self.check_display("setAutoLowLatencyMode", display)
    }

    fn set_content_type(&self, display: DisplayId, _content_type: ContentType) -> RpcResult<()> {
        self.check_display("setContentType", display)
    }

    fn set_boot_display_config(&self, display: DisplayId, config: ConfigId) -> RpcResult<()> {
        self.display("setBootDisplayConfig", display, |d| {
            if d.configs.iter().any(|c| c.id == config) {
                Ok(())
            } else {
                Err(rpc_error(Error::BadConfig))
            }
        })
    }

    fn clear_boot_display_config(&self, display: DisplayId) -> RpcResult<()> {
        self.check_display("clearBootDisplayConfig", display)
    }

    fn get_preferred_boot_display_config(&self, display: DisplayId) -> RpcResult<ConfigId> {
        self.display("getPreferredBootDisplayConfig", display, |d| {
            d.configs.first().map(|c| c.id).ok_or_else(|| rpc_error(Error::BadConfig))
        })
    }

    fn get_display_decoration_support(&self, display: DisplayId) -> RpcResult<Option<DisplayDecorationSupport>> {
        self.display("getDisplayDecorationSupport", display, |_| Ok(None))
    }

    fn set_idle_timer_enabled(&self, display: DisplayId, _timeout_ms: i32) -> RpcResult<()> {
        self.check_display("setIdleTimerEnabled", display)
    }

    fn get_display_physical_orientation(&self, display: DisplayId) -> RpcResult<Transform> {
        self.display("getDisplayPhysicalOrientation", display, |_| Ok(Transform::NONE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::legacy::command::header;

    #[test]
    fn test_service_manager_exposes_one_protocol() {
        let legacy = LoopbackComposer::legacy(LegacyVersion::V2_2);
        assert!(!legacy.is_declared(&structured::instance_name("default")));
        assert!(legacy.get_legacy("default").is_some());
        assert!(legacy.get_legacy("vr").is_none());

        let aidl = LoopbackComposer::structured(Some(2)).with_service_name("vr");
        assert!(aidl.is_declared(&structured::instance_name("vr")));
        assert!(!aidl.is_declared(&structured::instance_name("default")));
        assert!(aidl.get_legacy("vr").is_none());
    }

    #[test]
    fn test_legacy_batch_reply() {
        let server = LoopbackComposer::legacy(LegacyVersion::V2_4);
        server.add_display(LoopbackDisplay::physical(0, 720, 1280));
        let mut state = server.state();

        let records = vec![
            Record { location: 0, opcode: Command::SelectDisplay as u16, payload: vec![0, 0] },
            Record { location: 3, opcode: Command::PresentDisplay as u16, payload: vec![] },
        ];
        let reply = server.run_legacy_batch(&mut state, &records);
        assert_eq!(reply.words[0], header(Command::SelectDisplay, 2));
        assert_eq!(reply.words[3], header(Command::SetPresentFence, 1));
        assert_eq!(reply.words[4], 0);
        assert_eq!(reply.handles.len(), 1);
    }

    #[test]
    fn test_unknown_display_is_reported_per_record() {
        let server = LoopbackComposer::legacy(LegacyVersion::V2_1);
        let mut state = server.state();
        let records = vec![
            Record { location: 0, opcode: Command::SelectDisplay as u16, payload: vec![9, 0] },
            Record { location: 3, opcode: Command::ValidateDisplay as u16, payload: vec![] },
        ];
        let reply = server.run_legacy_batch(&mut state, &records);
        let errors: Vec<_> = command::split_records(&reply.words)
            .unwrap()
            .into_iter()
            .filter(|r| r.command() == Some(Command::SetError))
            .map(|r| r.payload[0])
            .collect();
        assert_eq!(errors, vec![0, 3]);
    }

    #[test]
    fn test_carries_matches_layer_fields() {
        let mut command = DisplayCommand::new(1);
        command.layers.push(structured::LayerCommand {
            layer: 4,
            plane_alpha: Some(0.5),
            ..Default::default()
        });
        assert!(carries(&command, Command::SetLayerPlaneAlpha));
        assert!(!carries(&command, Command::SetLayerZOrder));
        assert!(!carries(&command, Command::PresentDisplay));
    }
}
