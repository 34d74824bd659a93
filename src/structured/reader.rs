//! Sorts `execute_commands` results into per-display records

use super::message::{CommandError, CommandResultPayload, PresentOrValidateResult};
use crate::hal::{
    ChangeCounts, ClientTargetProperty, Composition, DisplayId, DisplayRequests, LayerId,
};
use std::collections::HashMap;
use std::os::fd::OwnedFd;

#[derive(Debug, Default)]
struct ReturnData {
    display_requests: u32,
    changed_layers: Vec<(LayerId, Composition)>,
    requested_layers: Vec<(LayerId, u32)>,
    release_fences: Vec<(LayerId, Option<OwnedFd>)>,
    present_fence: Option<OwnedFd>,
    present_or_validate: Option<PresentOrValidateResult>,
    client_target_property: Option<ClientTargetProperty>,
}

#[derive(Debug, Default)]
pub struct ComposerClientReader {
    errors: Vec<CommandError>,
    returns: HashMap<DisplayId, ReturnData>,
}

impl ComposerClientReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the previous results with `results`
    pub fn parse(&mut self, results: Vec<CommandResultPayload>) {
        self.errors.clear();
        self.returns.clear();

        for result in results {
            match result {
                CommandResultPayload::Error(error) => self.errors.push(error),
                CommandResultPayload::ChangedCompositionTypes { display, layers } => {
                    self.data(display).changed_layers.extend(layers);
                }
                CommandResultPayload::DisplayRequest { display, mask, layer_requests } => {
                    let data = self.data(display);
                    data.display_requests = mask;
                    data.requested_layers.extend(layer_requests);
                }
                CommandResultPayload::PresentFence { display, fence } => {
                    self.data(display).present_fence = fence;
                }
                CommandResultPayload::ReleaseFences { display, layers } => {
                    self.data(display).release_fences.extend(layers);
                }
                CommandResultPayload::PresentOrValidateResult { display, result } => {
                    self.data(display).present_or_validate = Some(result);
                }
                CommandResultPayload::ClientTargetProperty { display, property } => {
                    self.data(display).client_target_property = Some(property);
                }
            }
        }
    }

    fn data(&mut self, display: DisplayId) -> &mut ReturnData {
        self.returns.entry(display).or_default()
    }

    pub fn take_errors(&mut self) -> Vec<CommandError> {
        std::mem::take(&mut self.errors)
    }

    pub fn has_changes(&self, display: DisplayId) -> ChangeCounts {
        self.returns
            .get(&display)
            .map(|data| ChangeCounts {
                num_types: data.changed_layers.len() as u32,
                num_requests: data.requested_layers.len() as u32,
            })
            .unwrap_or_default()
    }

    pub fn take_changed_composition_types(
        &mut self,
        display: DisplayId,
    ) -> Vec<(LayerId, Composition)> {
        self.returns
            .get_mut(&display)
            .map(|data| std::mem::take(&mut data.changed_layers))
            .unwrap_or_default()
    }

    pub fn take_display_requests(&mut self, display: DisplayId) -> DisplayRequests {
        match self.returns.get_mut(&display) {
            Some(data) => DisplayRequests {
                display_requests: std::mem::take(&mut data.display_requests),
                layer_requests: std::mem::take(&mut data.requested_layers),
            },
            None => DisplayRequests::default(),
        }
    }

    pub fn take_release_fences(&mut self, display: DisplayId) -> Vec<(LayerId, Option<OwnedFd>)> {
        self.returns
            .get_mut(&display)
            .map(|data| std::mem::take(&mut data.release_fences))
            .unwrap_or_default()
    }

    /// Move the present fence out. A second take yields `None`.
    pub fn take_present_fence(&mut self, display: DisplayId) -> Option<OwnedFd> {
        self.returns.get_mut(&display)?.present_fence.take()
    }

    pub fn take_present_or_validate_result(
        &mut self,
        display: DisplayId,
    ) -> Option<PresentOrValidateResult> {
        self.returns.get_mut(&display)?.present_or_validate.take()
    }

    pub fn take_client_target_property(&mut self, display: DisplayId) -> ClientTargetProperty {
        self.returns
            .get_mut(&display)
            .and_then(|data| data.client_target_property.take())
            .unwrap_or_default()
    }
}
