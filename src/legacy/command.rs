//! Legacy command-queue record framing
//!
//! Every record is one header word, `(opcode << 16) | length`, followed by
//! `length` payload words. 64-bit values are written low word first.

use crate::hal::BufferHandle;
use std::os::fd::OwnedFd;

pub const OPCODE_SHIFT: u32 = 16;
pub const LENGTH_MASK: u32 = 0xffff;

pub const SELECT_DISPLAY_LENGTH: u16 = 2;
pub const SELECT_LAYER_LENGTH: u16 = 2;
pub const SET_ERROR_LENGTH: u16 = 2;
pub const SET_PRESENT_FENCE_LENGTH: u16 = 1;
pub const PRESENT_OR_VALIDATE_RESULT_LENGTH: u16 = 1;
pub const SET_CLIENT_TARGET_PROPERTY_LENGTH: u16 = 2;

macro_rules! commands {
    ($($name:ident = $value:literal),+ $(,)?) => {
        /// Record opcodes understood by both ends of the queue
        #[repr(u16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Command {
            $($name = $value),+
        }

        impl Command {
            pub fn from_opcode(opcode: u16) -> Option<Self> {
                match opcode {
                    $($value => Some(Command::$name),)+
                    _ => None,
                }
            }
        }
    };
}

commands! {
    SelectDisplay = 0x000,
    SelectLayer = 0x001,

    // server -> client
    SetError = 0x100,
    SetChangedCompositionTypes = 0x101,
    SetDisplayRequests = 0x102,
    SetPresentFence = 0x103,
    SetReleaseFences = 0x104,
    SetClientTargetProperty = 0x105,

    // display commands
    SetColorTransform = 0x200,
    SetClientTarget = 0x201,
    SetOutputBuffer = 0x202,
    ValidateDisplay = 0x203,
    AcceptDisplayChanges = 0x204,
    PresentDisplay = 0x205,
    PresentOrValidateDisplay = 0x206,

    // layer commands
    SetLayerCursorPosition = 0x300,
    SetLayerBuffer = 0x301,
    SetLayerSurfaceDamage = 0x302,
    SetLayerPerFrameMetadata = 0x303,
    SetLayerPerFrameMetadataBlobs = 0x304,
    SetLayerBlendMode = 0x400,
    SetLayerColor = 0x401,
    SetLayerCompositionType = 0x402,
    SetLayerDataspace = 0x403,
    SetLayerDisplayFrame = 0x404,
    SetLayerPlaneAlpha = 0x405,
    SetLayerSidebandStream = 0x406,
    SetLayerSourceCrop = 0x407,
    SetLayerTransform = 0x408,
    SetLayerVisibleRegion = 0x409,
    SetLayerZOrder = 0x40a,
    SetPresentOrValidateDisplayResult = 0x40b,
    SetLayerColorTransform = 0x40d,
}

impl Command {
    /// Commands whose failure fails the whole flush
    pub fn is_flush(self) -> bool {
        matches!(
            self,
            Command::ValidateDisplay | Command::PresentDisplay | Command::PresentOrValidateDisplay
        )
    }
}

pub fn header(command: Command, length: u16) -> u32 {
    ((command as u32) << OPCODE_SHIFT) | length as u32
}

/// Split a header word into (opcode, length)
pub fn split_header(word: u32) -> (u16, u16) {
    ((word >> OPCODE_SHIFT) as u16, (word & LENGTH_MASK) as u16)
}

pub fn split_u64(value: u64) -> [u32; 2] {
    [value as u32, (value >> 32) as u32]
}

pub fn join_u64(low: u32, high: u32) -> u64 {
    (low as u64) | ((high as u64) << 32)
}

/// Out-of-band object carried next to the words of one batch
#[derive(Debug)]
pub enum WireHandle {
    Buffer(BufferHandle),
    Fence(OwnedFd),
}

/// One decoded record, as a server sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Word offset of the header within the batch
    pub location: u32,
    pub opcode: u16,
    pub payload: Vec<u32>,
}

impl Record {
    pub fn command(&self) -> Option<Command> {
        Command::from_opcode(self.opcode)
    }
}

/// Split a batch into records. Returns `None` if a record overruns the batch.
pub fn split_records(words: &[u32]) -> Option<Vec<Record>> {
    let mut records = Vec::new();
    let mut pos = 0usize;
    while pos < words.len() {
        let (opcode, length) = split_header(words[pos]);
        let start = pos + 1;
        let end = start + length as usize;
        if end > words.len() {
            return None;
        }
        records.push(Record {
            location: pos as u32,
            opcode,
            payload: words[start..end].to_vec(),
        });
        pos = end;
    }
    Some(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let word = header(Command::SetLayerPlaneAlpha, 1);
        assert_eq!(word, 0x0405_0001);
        assert_eq!(split_header(word), (0x405, 1));
    }

    #[test]
    fn test_u64_split() {
        let v = 0x1122_3344_5566_7788u64;
        let [lo, hi] = split_u64(v);
        assert_eq!(lo, 0x5566_7788);
        assert_eq!(hi, 0x1122_3344);
        assert_eq!(join_u64(lo, hi), v);
    }

    #[test]
    fn test_split_records_rejects_overrun() {
        let words = [header(Command::SelectDisplay, 2), 5, 0, header(Command::ValidateDisplay, 0)];
        let records = split_records(&words).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].location, 3);
        assert_eq!(records[1].command(), Some(Command::ValidateDisplay));

        assert!(split_records(&[header(Command::SelectDisplay, 2), 5]).is_none());
    }
}
