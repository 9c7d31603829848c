//! Durable per-conduit transfer state.
//!
//! Only the four fields that anti-backflow and double-send detection need
//! across a reload are written: last receive direction and tick, last
//! transfer direction and tick. Caches, scan state, and the recent path are
//! rebuilt on load. Records are `bitcode` with a versioned header.
//!
//! Directions are stored as their index byte. An unknown byte decodes as
//! "unset" instead of failing the whole record.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::direction::Direction;
use crate::sim::Ticks;
use crate::transfer::TransferState;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Magic number identifying a persisted conduit record.
pub const STATE_MAGIC: u32 = 0x4D46_0001;

/// Current format version. Increment when breaking the wire format.
pub const FORMAT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur while encoding.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("bitcode encoding failed: {0}")]
    Encode(String),
}

/// Errors that can occur while decoding.
#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    #[error("invalid magic number: expected 0x{:08X}, got 0x{:08X}", STATE_MAGIC, .0)]
    InvalidMagic(u32),
    #[error("unsupported format version: expected {}, got {}", FORMAT_VERSION, .0)]
    UnsupportedVersion(u32),
    #[error("record from future version {0} (this build supports up to {FORMAT_VERSION})")]
    FutureVersion(u32),
    #[error("bitcode decoding failed: {0}")]
    Decode(String),
}

// ---------------------------------------------------------------------------
// Record header
// ---------------------------------------------------------------------------

/// Header prepended to every record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordHeader {
    pub magic: u32,
    pub version: u32,
}

impl RecordHeader {
    pub fn new() -> Self {
        Self {
            magic: STATE_MAGIC,
            version: FORMAT_VERSION,
        }
    }

    pub fn validate(&self) -> Result<(), RestoreError> {
        if self.magic != STATE_MAGIC {
            return Err(RestoreError::InvalidMagic(self.magic));
        }
        if self.version > FORMAT_VERSION {
            return Err(RestoreError::FutureVersion(self.version));
        }
        if self.version < FORMAT_VERSION {
            return Err(RestoreError::UnsupportedVersion(self.version));
        }
        Ok(())
    }
}

impl Default for RecordHeader {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Persisted state
// ---------------------------------------------------------------------------

/// The durable subset of [`TransferState`], as written to disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedTransferState {
    pub last_receive_direction: Option<u8>,
    pub last_receive_tick: Ticks,
    pub last_transfer_direction: Option<u8>,
    pub last_transfer_tick: Ticks,
}

#[derive(Debug, Serialize, Deserialize)]
struct ConduitRecord {
    header: RecordHeader,
    state: PersistedTransferState,
}

impl PersistedTransferState {
    pub fn capture(state: &TransferState) -> Self {
        Self {
            last_receive_direction: state.last_receive_direction.map(encode_direction),
            last_receive_tick: state.last_receive_tick,
            last_transfer_direction: state.last_transfer_direction.map(encode_direction),
            last_transfer_tick: state.last_transfer_tick,
        }
    }

    /// Rebuild a [`TransferState`]. Unknown direction bytes become `None`.
    pub fn into_state(self) -> TransferState {
        TransferState::from_durable(
            decode_direction(self.last_receive_direction),
            self.last_receive_tick,
            decode_direction(self.last_transfer_direction),
            self.last_transfer_tick,
        )
    }
}

fn encode_direction(direction: Direction) -> u8 {
    direction.index() as u8
}

fn decode_direction(raw: Option<u8>) -> Option<Direction> {
    let byte = raw?;
    let direction = Direction::from_index(byte as usize);
    if direction.is_none() {
        debug!("persisted direction byte {byte} is out of range; treating as unset");
    }
    direction
}

// ---------------------------------------------------------------------------
// Encode / decode
// ---------------------------------------------------------------------------

pub fn encode(state: &PersistedTransferState) -> Result<Vec<u8>, PersistError> {
    let record = ConduitRecord {
        header: RecordHeader::new(),
        state: state.clone(),
    };
    bitcode::serialize(&record).map_err(|e| PersistError::Encode(e.to_string()))
}

pub fn decode(data: &[u8]) -> Result<PersistedTransferState, RestoreError> {
    let record: ConduitRecord =
        bitcode::deserialize(data).map_err(|e| RestoreError::Decode(e.to_string()))?;
    record.header.validate()?;
    Ok(record.state)
}

/// Encode the durable fields of a live [`TransferState`].
pub fn save_transfer_state(state: &TransferState) -> Result<Vec<u8>, PersistError> {
    encode(&PersistedTransferState::capture(state))
}

/// Decode a record straight into a fresh [`TransferState`].
pub fn load_transfer_state(data: &[u8]) -> Result<TransferState, RestoreError> {
    decode(data).map(PersistedTransferState::into_state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;

    #[test]
    fn durable_fields_survive() {
        let config = NetworkConfig::default();
        let mut state = TransferState::new();
        state.record_transfer(Direction::East, 40, &config);
        state.record_receive(Direction::Up, 41);

        let bytes = save_transfer_state(&state).unwrap();
        let restored = load_transfer_state(&bytes).unwrap();

        assert_eq!(restored.last_transfer_direction, Some(Direction::East));
        assert_eq!(restored.last_transfer_tick, 40);
        assert_eq!(restored.last_receive_direction, Some(Direction::Up));
        assert_eq!(restored.last_receive_tick, 41);
        assert_eq!(restored.recent_path().count(), 0, "path is transient");
        assert_eq!(restored.transfers_this_tick(), 0);
    }

    #[test]
    fn unset_directions_stay_unset() {
        let bytes = save_transfer_state(&TransferState::new()).unwrap();
        let restored = load_transfer_state(&bytes).unwrap();
        assert_eq!(restored.last_transfer_direction, None);
        assert_eq!(restored.last_receive_direction, None);
    }

    #[test]
    fn out_of_range_direction_decodes_as_none() {
        let raw = PersistedTransferState {
            last_receive_direction: Some(6),
            last_receive_tick: 9,
            last_transfer_direction: Some(255),
            last_transfer_tick: 10,
        };
        let state = decode(&encode(&raw).unwrap()).unwrap().into_state();
        assert_eq!(state.last_receive_direction, None);
        assert_eq!(state.last_transfer_direction, None);
        assert_eq!(state.last_receive_tick, 9);
        assert_eq!(state.last_transfer_tick, 10);
    }

    #[test]
    fn header_validation() {
        assert!(RecordHeader::new().validate().is_ok());

        let bad_magic = RecordHeader {
            magic: 0xDEAD_BEEF,
            version: FORMAT_VERSION,
        };
        assert!(matches!(bad_magic.validate(), Err(RestoreError::InvalidMagic(0xDEAD_BEEF))));

        let future = RecordHeader {
            magic: STATE_MAGIC,
            version: FORMAT_VERSION + 1,
        };
        assert!(matches!(future.validate(), Err(RestoreError::FutureVersion(_))));

        let old = RecordHeader {
            magic: STATE_MAGIC,
            version: 0,
        };
        assert!(matches!(old.validate(), Err(RestoreError::UnsupportedVersion(0))));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(decode(&[]), Err(RestoreError::Decode(_))));
    }
}
