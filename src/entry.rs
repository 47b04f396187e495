//! Log entries and their on-disk framing.
//!
//! Every persisted entry is framed as
//! `u32 length | u16 type_id | u16 reserved | body | u32 crc32`, little
//! endian, where `length` is the body length and the CRC covers everything
//! from the length prefix through the last body byte. The body itself is
//! produced by the configured [`EntryCodec`].

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// Frame prefix: length (4) + type id (2) + reserved (2).
pub const FRAME_HEADER_BYTES: usize = 8;

/// Full framing overhead: prefix plus trailing CRC.
pub const FRAME_OVERHEAD_BYTES: usize = FRAME_HEADER_BYTES + 4;

/// The kind of operation an entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub enum EntryKind {
    /// A state machine command replicated through the log.
    Command,
    /// A read-only operation; never persisted.
    Query,
    /// A no-op appended by a newly elected leader.
    NoOp,
    /// A cluster membership change.
    Configuration,
    /// A session keep-alive.
    KeepAlive,
    /// A session registration.
    Register,
    /// A session expiration or close.
    Unregister,
}

impl EntryKind {
    /// Wire type id written into the entry frame.
    pub fn type_id(self) -> u16 {
        match self {
            EntryKind::Command => 1,
            EntryKind::Query => 2,
            EntryKind::NoOp => 3,
            EntryKind::Configuration => 4,
            EntryKind::KeepAlive => 5,
            EntryKind::Register => 6,
            EntryKind::Unregister => 7,
        }
    }

    pub fn from_type_id(id: u16) -> Option<Self> {
        match id {
            1 => Some(EntryKind::Command),
            2 => Some(EntryKind::Query),
            3 => Some(EntryKind::NoOp),
            4 => Some(EntryKind::Configuration),
            5 => Some(EntryKind::KeepAlive),
            6 => Some(EntryKind::Register),
            7 => Some(EntryKind::Unregister),
            _ => None,
        }
    }

    /// Tombstone kinds invalidate earlier entries and may only be removed by
    /// major compaction, after their dependencies have been swept.
    pub fn is_tombstone(self) -> bool {
        matches!(self, EntryKind::Unregister | EntryKind::Configuration)
    }

    /// Whether entries of this kind are ever written to the log.
    pub fn is_persistent(self) -> bool {
        !matches!(self, EntryKind::Query)
    }
}

/// One operation at a specific position in the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Entry {
    /// 1-based, strictly increasing position.
    pub index: u64,
    /// Leader epoch, non-decreasing across the log.
    pub term: u64,
    /// Leader wall clock at append, milliseconds since the epoch. Replicas
    /// take it from the entry; the log clamps it non-decreasing.
    pub time_ms: u64,
    /// Owning session, 0 when the entry is not session-scoped.
    pub session: u64,
    pub kind: EntryKind,
    pub payload: Vec<u8>,
}

impl Entry {
    pub fn new(index: u64, term: u64, kind: EntryKind, payload: Vec<u8>) -> Self {
        Self {
            index,
            term,
            time_ms: 0,
            session: 0,
            kind,
            payload,
        }
    }

    pub fn with_time(mut self, time_ms: u64) -> Self {
        self.time_ms = time_ms;
        self
    }

    pub fn with_session(mut self, session: u64) -> Self {
        self.session = session;
        self
    }
}

/// Serialized representation of everything but the kind, which travels in the
/// frame's type id.
#[derive(Debug, Encode, Decode)]
struct EntryBody {
    index: u64,
    term: u64,
    time_ms: u64,
    session: u64,
    payload: Vec<u8>,
}

/// Entry body serializer.
///
/// The framing (length prefix, type id, CRC) is fixed; the codec controls the
/// body bytes. Implementations must be able to decode every body they encode.
pub trait EntryCodec: Send + Sync + 'static {
    fn encode_body(&self, entry: &Entry) -> StorageResult<Vec<u8>>;
    fn decode_body(&self, kind: EntryKind, body: &[u8]) -> StorageResult<Entry>;
}

/// Default codec: bincode with the standard configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeEntryCodec;

impl EntryCodec for BincodeEntryCodec {
    fn encode_body(&self, entry: &Entry) -> StorageResult<Vec<u8>> {
        let body = EntryBody {
            index: entry.index,
            term: entry.term,
            time_ms: entry.time_ms,
            session: entry.session,
            payload: entry.payload.clone(),
        };
        Ok(bincode::encode_to_vec(&body, bincode::config::standard())?)
    }

    fn decode_body(&self, kind: EntryKind, body: &[u8]) -> StorageResult<Entry> {
        let (body, _): (EntryBody, usize) =
            bincode::decode_from_slice(body, bincode::config::standard())?;
        Ok(Entry {
            index: body.index,
            term: body.term,
            time_ms: body.time_ms,
            session: body.session,
            kind,
            payload: body.payload,
        })
    }
}

/// A frame parsed out of a segment body.
#[derive(Debug)]
pub(crate) struct Frame<'a> {
    pub kind: EntryKind,
    pub body: &'a [u8],
    /// Total frame size including prefix and CRC.
    pub len: usize,
}

/// Why a frame could not be parsed.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FrameError {
    /// The buffer ends before the frame does, or the CRC does not match.
    /// At the tail of the active segment this means a torn write.
    Torn,
    /// The frame is intact but carries an unknown type id.
    UnknownType(u16),
}

/// Serialize `entry` into `buf`, returning the number of bytes appended.
pub(crate) fn encode_frame(
    codec: &dyn EntryCodec,
    entry: &Entry,
    buf: &mut Vec<u8>,
) -> StorageResult<usize> {
    let body = codec.encode_body(entry)?;
    let start = buf.len();
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&entry.kind.type_id().to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes());
    buf.extend_from_slice(&body);
    let crc = crc32fast::hash(&buf[start..]);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf.len() - start)
}

/// Parse one frame from the front of `buf`.
pub(crate) fn decode_frame(buf: &[u8]) -> Result<Frame<'_>, FrameError> {
    if buf.len() < FRAME_OVERHEAD_BYTES {
        return Err(FrameError::Torn);
    }
    let body_len = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
    let total = FRAME_OVERHEAD_BYTES + body_len;
    if buf.len() < total {
        return Err(FrameError::Torn);
    }
    let crc_at = FRAME_HEADER_BYTES + body_len;
    let stored = u32::from_le_bytes(buf[crc_at..crc_at + 4].try_into().unwrap());
    if crc32fast::hash(&buf[..crc_at]) != stored {
        return Err(FrameError::Torn);
    }
    let type_id = u16::from_le_bytes(buf[4..6].try_into().unwrap());
    let kind = EntryKind::from_type_id(type_id).ok_or(FrameError::UnknownType(type_id))?;
    Ok(Frame {
        kind,
        body: &buf[FRAME_HEADER_BYTES..crc_at],
        len: total,
    })
}

/// Decode a full frame back into an entry.
pub(crate) fn decode_entry(codec: &dyn EntryCodec, buf: &[u8]) -> StorageResult<Entry> {
    match decode_frame(buf) {
        Ok(frame) => codec.decode_body(frame.kind, frame.body),
        Err(FrameError::Torn) => Err(StorageError::Codec("frame CRC mismatch".into())),
        Err(FrameError::UnknownType(id)) => {
            Err(StorageError::Codec(format!("unknown entry type id {}", id)))
        }
    }
}
