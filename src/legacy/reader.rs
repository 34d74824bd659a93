//! Legacy command reader
//!
//! Parses the server's reply stream into per-display result records. Any
//! malformed record aborts the parse and the whole reply is discarded.

use super::command::{self, Command, WireHandle};
use super::queue::MessageQueue;
use crate::error::Error;
use crate::hal::{
    ChangeCounts, ClientTargetProperty, Composition, Dataspace, DisplayId, DisplayRequests,
    LayerId, PixelFormat,
};
use std::collections::HashMap;
use std::os::fd::OwnedFd;
use tracing::debug;

/// A per-command failure reported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandError {
    /// Word offset of the failing record in the batch that was sent
    pub location: u32,
    pub code: i32,
}

#[derive(Debug, Default)]
struct ReturnData {
    display_requests: u32,
    changed_layers: Vec<(LayerId, Composition)>,
    requested_layers: Vec<(LayerId, u32)>,
    release_fences: Vec<(LayerId, Option<OwnedFd>)>,
    present_fence: Option<OwnedFd>,
    present_or_validate_state: Option<u32>,
    client_target_property: Option<ClientTargetProperty>,
}

#[derive(Debug, Default)]
pub struct CommandReader {
    queue: Option<MessageQueue>,
    data: Vec<u32>,
    handles: Vec<Option<OwnedFd>>,
    errors: Vec<CommandError>,
    returns: HashMap<DisplayId, ReturnData>,
}

impl CommandReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_queue(&mut self, queue: MessageQueue) {
        self.queue = Some(queue);
    }

    pub fn has_queue(&self) -> bool {
        self.queue.is_some()
    }

    /// Pull `length` words of reply off the output queue
    pub fn read_queue(&mut self, length: u32, handles: Vec<WireHandle>) -> bool {
        self.data.clear();
        self.handles = handles
            .into_iter()
            .map(|h| match h {
                WireHandle::Fence(fd) => Some(fd),
                WireHandle::Buffer(_) => None,
            })
            .collect();

        if length == 0 {
            return true;
        }
        let Some(queue) = &self.queue else {
            return false;
        };
        match queue.read(length as usize) {
            Some(words) => {
                self.data = words;
                true
            }
            None => false,
        }
    }

    /// Parse the words last read. Fails closed on the first bad record.
    pub fn parse(&mut self) -> crate::Result<()> {
        self.errors.clear();
        self.returns.clear();

        let data = std::mem::take(&mut self.data);
        let result = self.parse_words(&data);
        self.handles.clear();
        if result.is_err() {
            debug!("discarding malformed composer reply ({} words)", data.len());
            self.errors.clear();
            self.returns.clear();
        }
        result
    }

    fn parse_words(&mut self, data: &[u32]) -> crate::Result<()> {
        let records = command::split_records(data).ok_or(Error::NoResources)?;
        let mut current: Option<DisplayId> = None;

        for record in records {
            let payload = &record.payload;
            let len = payload.len();
            let command = record.command().ok_or(Error::NoResources)?;

            match command {
                Command::SelectDisplay => {
                    if len != command::SELECT_DISPLAY_LENGTH as usize {
                        return Err(Error::NoResources);
                    }
                    let display = command::join_u64(payload[0], payload[1]);
                    self.returns.entry(display).or_default();
                    current = Some(display);
                }
                Command::SetError => {
                    if len != command::SET_ERROR_LENGTH as usize {
                        return Err(Error::NoResources);
                    }
                    self.errors.push(CommandError {
                        location: payload[0],
                        code: payload[1] as i32,
                    });
                }
                Command::SetChangedCompositionTypes => {
                    let data = self.selected(current)?;
                    if len % 3 != 0 {
                        return Err(Error::NoResources);
                    }
                    for entry in payload.chunks_exact(3) {
                        let layer = command::join_u64(entry[0], entry[1]);
                        let composition =
                            Composition::from_raw(entry[2] as i32).ok_or(Error::NoResources)?;
                        data.changed_layers.push((layer, composition));
                    }
                }
                Command::SetDisplayRequests => {
                    let data = self.selected(current)?;
                    if len % 3 != 1 {
                        return Err(Error::NoResources);
                    }
                    data.display_requests = payload[0];
                    for entry in payload[1..].chunks_exact(3) {
                        let layer = command::join_u64(entry[0], entry[1]);
                        data.requested_layers.push((layer, entry[2]));
                    }
                }
                Command::SetPresentFence => {
                    if len != command::SET_PRESENT_FENCE_LENGTH as usize {
                        return Err(Error::NoResources);
                    }
                    let fence = self.fence(payload[0])?;
                    self.selected(current)?.present_fence = fence;
                }
                Command::SetReleaseFences => {
                    if len % 3 != 0 {
                        return Err(Error::NoResources);
                    }
                    let mut fences = Vec::with_capacity(len / 3);
                    for entry in payload.chunks_exact(3) {
                        let layer = command::join_u64(entry[0], entry[1]);
                        fences.push((layer, self.fence(entry[2])?));
                    }
                    self.selected(current)?.release_fences.extend(fences);
                }
                Command::SetPresentOrValidateDisplayResult => {
                    if len != command::PRESENT_OR_VALIDATE_RESULT_LENGTH as usize {
                        return Err(Error::NoResources);
                    }
                    self.selected(current)?.present_or_validate_state = Some(payload[0]);
                }
                Command::SetClientTargetProperty => {
                    if len != command::SET_CLIENT_TARGET_PROPERTY_LENGTH as usize {
                        return Err(Error::NoResources);
                    }
                    self.selected(current)?.client_target_property = Some(ClientTargetProperty {
                        pixel_format: PixelFormat(payload[0] as i32),
                        dataspace: Dataspace(payload[1] as i32),
                        ..Default::default()
                    });
                }
                // Client-to-server records never appear in a reply
                _ => return Err(Error::NoResources),
            }
        }
        Ok(())
    }

    fn selected(&mut self, current: Option<DisplayId>) -> crate::Result<&mut ReturnData> {
        let display = current.ok_or(Error::NoResources)?;
        Ok(self.returns.entry(display).or_default())
    }

    /// Duplicate the fence at `index` out of the reply handles
    fn fence(&self, index: u32) -> crate::Result<Option<OwnedFd>> {
        if index as i32 == -1 {
            return Ok(None);
        }
        match self.handles.get(index as usize) {
            Some(Some(fd)) => fd.try_clone().map(Some).map_err(|_| Error::NoResources),
            _ => Err(Error::NoResources),
        }
    }

    pub fn take_errors(&mut self) -> Vec<CommandError> {
        std::mem::take(&mut self.errors)
    }

    pub fn has_changes(&self, display: DisplayId) -> ChangeCounts {
        match self.returns.get(&display) {
            Some(data) => ChangeCounts {
                num_types: data.changed_layers.len() as u32,
                num_requests: data.requested_layers.len() as u32,
            },
            None => ChangeCounts::default(),
        }
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

    pub fn take_present_fence(&mut self, display: DisplayId) -> Option<OwnedFd> {
        self.returns.get_mut(&display)?.present_fence.take()
    }

    pub fn take_present_or_validate_state(&mut self, display: DisplayId) -> Option<u32> {
        self.returns.get_mut(&display)?.present_or_validate_state.take()
    }

    pub fn take_client_target_property(&mut self, display: DisplayId) -> ClientTargetProperty {
        self.returns
            .get_mut(&display)
            .and_then(|data| data.client_target_property.take())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::legacy::command::{header, split_u64};

    fn reader_with(words: &[u32], handles: Vec<WireHandle>) -> CommandReader {
        let queue = MessageQueue::new(256);
        assert!(queue.write(words));
        let mut reader = CommandReader::new();
        reader.set_queue(queue);
        assert!(reader.read_queue(words.len() as u32, handles));
        reader
    }

    fn select(display: u64) -> Vec<u32> {
        let mut w = vec![header(Command::SelectDisplay, 2)];
        w.extend(split_u64(display));
        w
    }

    fn dev_null() -> OwnedFd {
        OwnedFd::from(std::fs::File::open("/dev/null").unwrap())
    }

    #[test]
    fn test_parse_changed_types_and_requests() {
        let mut words = select(7);
        words.push(header(Command::SetChangedCompositionTypes, 3));
        words.extend([11, 0, Composition::Client.raw() as u32]);
        words.push(header(Command::SetDisplayRequests, 4));
        words.extend([0x2, 12, 0, 0x1]);

        let mut reader = reader_with(&words, vec![]);
        reader.parse().unwrap();

        assert_eq!(reader.has_changes(7), ChangeCounts { num_types: 1, num_requests: 1 });
        assert_eq!(reader.take_changed_composition_types(7), vec![(11, Composition::Client)]);
        let requests = reader.take_display_requests(7);
        assert_eq!(requests.display_requests, 2);
        assert_eq!(requests.layer_requests, vec![(12, 1)]);
        assert!(reader.take_changed_composition_types(7).is_empty());
    }

    #[test]
    fn test_present_fence_taken_once() {
        let mut words = select(1);
        words.push(header(Command::SetPresentFence, 1));
        words.push(0);

        let mut reader = reader_with(&words, vec![WireHandle::Fence(dev_null())]);
        reader.parse().unwrap();
        assert!(reader.take_present_fence(1).is_some());
        assert!(reader.take_present_fence(1).is_none());
    }

    #[test]
    fn test_errors_are_collected() {
        let words = vec![header(Command::SetError, 2), 3, 4];
        let mut reader = reader_with(&words, vec![]);
        reader.parse().unwrap();
        assert_eq!(reader.take_errors(), vec![CommandError { location: 3, code: 4 }]);
    }

    #[test]
    fn test_bad_select_length_fails_closed() {
        let mut words = vec![header(Command::SelectDisplay, 1), 1];
        words.push(header(Command::SetError, 2));
        words.extend([0, 4]);
        let mut reader = reader_with(&words, vec![]);
        assert_eq!(reader.parse(), Err(Error::NoResources));
        assert!(reader.take_errors().is_empty());
    }

    #[test]
    fn test_record_without_display_fails_closed() {
        let words = vec![header(Command::SetPresentOrValidateDisplayResult, 1), 1];
        let mut reader = reader_with(&words, vec![]);
        assert_eq!(reader.parse(), Err(Error::NoResources));
    }

    #[test]
    fn test_bad_modulus_fails_closed() {
        let mut words = select(1);
        words.push(header(Command::SetReleaseFences, 2));
        words.extend([1, 0]);
        let mut reader = reader_with(&words, vec![]);
        assert_eq!(reader.parse(), Err(Error::NoResources));
        assert!(reader.take_release_fences(1).is_empty());
    }

    #[test]
    fn test_truncated_last_record_fails_closed() {
        let mut words = select(1);
        words.push(header(Command::SetPresentOrValidateDisplayResult, 1));
        let mut reader = reader_with(&words, vec![]);
        assert_eq!(reader.parse(), Err(Error::NoResources));
    }

    #[test]
    fn test_client_target_property_default() {
        let mut reader = CommandReader::new();
        reader.parse().unwrap();
        assert_eq!(reader.take_client_target_property(3), ClientTargetProperty::default());
    }

    #[test]
    fn test_read_without_queue_fails() {
        let mut reader = CommandReader::new();
        assert!(!reader.read_queue(4, vec![]));
        assert!(reader.read_queue(0, vec![]));
    }
}
