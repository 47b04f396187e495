//! Segment descriptor: the fixed header at offset 0 of every segment file.
//!
//! The descriptor makes on-disk discovery possible without scanning the
//! body. It is rewritten in place exactly once after creation, when the
//! segment is sealed.

use crate::error::{StorageError, StorageResult};

/// "COPYCAT " in ASCII.
pub const DESCRIPTOR_MAGIC: u64 = 0x434F_5059_4341_5420;

/// Current descriptor format.
pub const DESCRIPTOR_FORMAT_VERSION: u16 = 1;

/// Total descriptor size, including reserved padding.
pub const DESCRIPTOR_BYTES: usize = 64;

const FLAG_SEALED: u16 = 1 << 0;
const CRC_OFFSET: usize = 48;

/// Fixed-size segment file header, little endian.
///
/// Layout: `magic:u64 | format_version:u16 | flags:u16 | id:u64 |
/// segment_version:u32 | first_index:u64 | max_entries:u32 | max_bytes:u32 |
/// updated_millis:u64 | crc32:u32 | reserved:[u8;12]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentDescriptor {
    /// Unique per log, monotonically increasing.
    pub id: u64,
    /// Incremented each time a compaction rewrites this id range.
    pub segment_version: u32,
    /// Index of the first entry the segment covers.
    pub first_index: u64,
    /// Maximum number of relative offsets the segment may cover.
    pub max_entries: u32,
    /// Maximum body size in bytes, descriptor included.
    pub max_bytes: u32,
    /// Wall clock of the last descriptor rewrite, milliseconds.
    pub updated_millis: u64,
    /// Whether the segment has been made read-only.
    pub sealed: bool,
}

impl SegmentDescriptor {
    pub fn new(
        id: u64,
        segment_version: u32,
        first_index: u64,
        max_entries: u32,
        max_bytes: u32,
        updated_millis: u64,
    ) -> Self {
        Self {
            id,
            segment_version,
            first_index,
            max_entries,
            max_bytes,
            updated_millis,
            sealed: false,
        }
    }

    pub fn encode(&self) -> [u8; DESCRIPTOR_BYTES] {
        let mut buf = [0u8; DESCRIPTOR_BYTES];
        buf[0..8].copy_from_slice(&DESCRIPTOR_MAGIC.to_le_bytes());
        buf[8..10].copy_from_slice(&DESCRIPTOR_FORMAT_VERSION.to_le_bytes());
        let flags = if self.sealed { FLAG_SEALED } else { 0 };
        buf[10..12].copy_from_slice(&flags.to_le_bytes());
        buf[12..20].copy_from_slice(&self.id.to_le_bytes());
        buf[20..24].copy_from_slice(&self.segment_version.to_le_bytes());
        buf[24..32].copy_from_slice(&self.first_index.to_le_bytes());
        buf[32..36].copy_from_slice(&self.max_entries.to_le_bytes());
        buf[36..40].copy_from_slice(&self.max_bytes.to_le_bytes());
        buf[40..48].copy_from_slice(&self.updated_millis.to_le_bytes());
        let crc = crc32fast::hash(&buf[..CRC_OFFSET]);
        buf[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> StorageResult<Self> {
        if buf.len() < DESCRIPTOR_BYTES {
            return Err(StorageError::Codec(format!(
                "descriptor needs {} bytes, got {}",
                DESCRIPTOR_BYTES,
                buf.len()
            )));
        }
        let magic = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        if magic != DESCRIPTOR_MAGIC {
            return Err(StorageError::Codec(format!(
                "bad descriptor magic {:#018x}",
                magic
            )));
        }
        let format_version = u16::from_le_bytes(buf[8..10].try_into().unwrap());
        if format_version != DESCRIPTOR_FORMAT_VERSION {
            return Err(StorageError::Codec(format!(
                "unsupported descriptor format {}",
                format_version
            )));
        }
        let stored_crc = u32::from_le_bytes(buf[CRC_OFFSET..CRC_OFFSET + 4].try_into().unwrap());
        if crc32fast::hash(&buf[..CRC_OFFSET]) != stored_crc {
            return Err(StorageError::Codec("descriptor CRC mismatch".into()));
        }
        let flags = u16::from_le_bytes(buf[10..12].try_into().unwrap());
        Ok(Self {
            id: u64::from_le_bytes(buf[12..20].try_into().unwrap()),
            segment_version: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            first_index: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            max_entries: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
            max_bytes: u32::from_le_bytes(buf[36..40].try_into().unwrap()),
            updated_millis: u64::from_le_bytes(buf[40..48].try_into().unwrap()),
            sealed: flags & FLAG_SEALED != 0,
        })
    }

    /// Marks the descriptor sealed. The caller rewrites it in place.
    pub fn seal(&mut self, updated_millis: u64) {
        self.sealed = true;
        self.updated_millis = updated_millis;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SegmentDescriptor {
        SegmentDescriptor::new(3, 2, 1001, 1024, 1 << 20, 1_700_000_000_000)
    }

    #[test]
    fn encode_decode_round_trip() {
        let d = sample();
        let buf = d.encode();
        assert_eq!(buf.len(), DESCRIPTOR_BYTES);
        assert_eq!(SegmentDescriptor::decode(&buf).unwrap(), d);
    }

    #[test]
    fn seal_flag_survives_round_trip() {
        let mut d = sample();
        d.seal(1_700_000_000_123);
        let decoded = SegmentDescriptor::decode(&d.encode()).unwrap();
        assert!(decoded.sealed);
        assert_eq!(decoded.updated_millis, 1_700_000_000_123);
    }

    #[test]
    fn layout_is_bit_exact() {
        let mut d = sample();
        d.seal(0x1122_3344_5566_7788);
        let buf = d.encode();

        assert_eq!(&buf[0..8], &0x434F_5059_4341_5420u64.to_le_bytes());
        assert_eq!(&buf[8..10], &1u16.to_le_bytes());
        assert_eq!(&buf[10..12], &1u16.to_le_bytes(), "sealed is bit 0 of flags");
        assert_eq!(&buf[12..20], &3u64.to_le_bytes());
        assert_eq!(&buf[20..24], &2u32.to_le_bytes());
        assert_eq!(&buf[24..32], &1001u64.to_le_bytes());
        assert_eq!(&buf[32..36], &1024u32.to_le_bytes());
        assert_eq!(&buf[36..40], &(1u32 << 20).to_le_bytes());
        assert_eq!(&buf[40..48], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(&buf[52..64], &[0u8; 12], "reserved tail stays zero");
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = sample().encode();
        buf[0] ^= 0x01;
        assert!(SegmentDescriptor::decode(&buf).is_err());
    }

    #[test]
    fn rejects_crc_mismatch() {
        let mut buf = sample().encode();
        buf[25] ^= 0x01;
        assert!(SegmentDescriptor::decode(&buf).is_err());
    }
}
