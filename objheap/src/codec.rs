//! Record encoding shared by every persistent heap variant.
//!
//! A record body is `[metadata][length prefix][payload]`. The prefix is one
//! byte for payloads of at most 127 bytes, otherwise a big-endian `u32` with
//! the top bit set. When guards are enabled the chained layout appends a
//! 2-byte guard after each body, so every record but the first in a space is
//! also preceded by its predecessor's guard.

use crate::{HeapError, Resource, Result, space::ByteStore};

pub const GUARD: [u8; 2] = [101, 74];
pub const GUARD_LEN: usize = GUARD.len();

const SHORT_LEN_MAX: usize = 127;
const EXTENDED_LEN: u32 = 0x8000_0000;
const MAX_PAYLOAD: usize = i32::MAX as usize;

#[derive(Debug, Clone, Copy)]
pub struct ObjectCodec {
    metadata_len: Option<usize>,
    guards: bool,
}

impl ObjectCodec {
    pub fn new(guards: bool) -> Self {
        Self {
            metadata_len: None,
            guards,
        }
    }

    /// Codec restored from a persisted heap whose metadata length is known.
    pub fn with_metadata_len(
        metadata_len: Option<usize>,
        guards: bool,
    ) -> Self {
        Self {
            metadata_len,
            guards,
        }
    }

    #[inline]
    pub fn metadata_len(&self) -> Option<usize> {
        self.metadata_len
    }

    #[inline]
    pub fn guards(&self) -> bool {
        self.guards
    }

    #[inline]
    pub fn guard_len(&self) -> usize {
        if self.guards { GUARD_LEN } else { 0 }
    }

    pub fn require_metadata_len(&self) -> Result<usize> {
        self.metadata_len.ok_or(HeapError::NoDataStored)
    }

    /// Validates `len` against the fixed metadata length without fixing it.
    pub fn check_metadata_len(&self, len: usize) -> Result<()> {
        match self.metadata_len {
            Some(expected) if expected != len => {
                Err(HeapError::MetadataLengthMismatch {
                    expected,
                    actual: len,
                })
            }
            _ => Ok(()),
        }
    }

    /// Fixes the metadata length on first use.
    fn fix_metadata_len(&mut self, len: usize) -> Result<()> {
        self.check_metadata_len(len)?;
        self.metadata_len = Some(len);
        Ok(())
    }

    #[inline]
    pub fn length_prefix_len(payload_len: usize) -> usize {
        if payload_len <= SHORT_LEN_MAX { 1 } else { 4 }
    }

    #[inline]
    pub fn body_len(metadata_len: usize, payload_len: usize) -> usize {
        metadata_len + Self::length_prefix_len(payload_len) + payload_len
    }

    /// Bytes a chained record occupies, trailing guard included.
    #[inline]
    pub fn record_len(&self, metadata_len: usize, payload_len: usize) -> usize {
        Self::body_len(metadata_len, payload_len) + self.guard_len()
    }

    // ── Guards ────────────────────────────────────────────────────────

    pub fn write_guard(store: &mut impl ByteStore, pos: usize) {
        store.set_bytes(pos, &GUARD);
    }

    pub fn check_guard(store: &impl ByteStore, pos: usize) -> Result<()> {
        ensure_in_bounds(store, pos, GUARD_LEN)?;
        let mut found = [0u8; GUARD_LEN];
        store.get_bytes(pos, &mut found);
        if found != GUARD {
            return Err(HeapError::CorruptedRecord {
                position: pos as u64,
                detail: format!(
                    "no guard bytes, found {},{}",
                    found[0], found[1]
                ),
            });
        }
        Ok(())
    }

    /// The guard preceding a record. The first record of a space has none.
    fn check_pre_guard(
        &self,
        store: &impl ByteStore,
        ofs: usize,
    ) -> Result<()> {
        if !self.guards || ofs == 0 {
            return Ok(());
        }
        if ofs < GUARD_LEN {
            return Err(HeapError::CorruptedRecord {
                position: ofs as u64,
                detail: "record starts inside the leading guard".into(),
            });
        }
        Self::check_guard(store, ofs - GUARD_LEN)
    }

    fn check_post_guard(
        &self,
        store: &impl ByteStore,
        pos: usize,
    ) -> Result<()> {
        if !self.guards || pos + GUARD_LEN > store.capacity() {
            return Ok(());
        }
        Self::check_guard(store, pos)
    }

    // ── Record body ───────────────────────────────────────────────────

    /// Writes `[metadata][prefix][payload]` at `ofs` and returns the end of
    /// the body. The first call fixes the metadata length.
    pub fn store_body(
        &mut self,
        store: &mut impl ByteStore,
        ofs: usize,
        payload: &[u8],
        metadata: &[u8],
    ) -> Result<usize> {
        if payload.len() > MAX_PAYLOAD {
            return Err(HeapError::ResourceExhausted(Resource::ObjectSize));
        }
        self.check_metadata_len(metadata.len())?;
        let end = ofs + Self::body_len(metadata.len(), payload.len());
        if end > store.capacity() {
            return Err(HeapError::ResourceExhausted(Resource::ObjectSize));
        }
        self.fix_metadata_len(metadata.len())?;

        let mut pos = ofs;
        store.set_bytes(pos, metadata);
        pos += metadata.len();
        if payload.len() <= SHORT_LEN_MAX {
            store.put_byte(pos, payload.len() as u8);
            pos += 1;
        } else {
            store.put_int(pos, payload.len() as u32 | EXTENDED_LEN);
            pos += 4;
        }
        store.set_bytes(pos, payload);
        Ok(pos + payload.len())
    }

    /// Payload length and prefix width of the body at `ofs`.
    pub fn read_payload_len(
        &self,
        store: &impl ByteStore,
        ofs: usize,
    ) -> Result<(usize, usize)> {
        let data_ofs = ofs + self.require_metadata_len()?;
        ensure_in_bounds(store, data_ofs, 1)?;
        let first = store.get_byte(data_ofs);
        if first & 0x80 == 0 {
            return Ok((first as usize, 1));
        }
        ensure_in_bounds(store, data_ofs, 4)?;
        let raw = store.get_int(data_ofs);
        Ok(((raw & !EXTENDED_LEN) as usize, 4))
    }

    /// End of the body at `ofs`, checked against the store capacity.
    pub fn body_end(
        &self,
        store: &impl ByteStore,
        ofs: usize,
    ) -> Result<usize> {
        let (len, prefix) = self.read_payload_len(store, ofs)?;
        let payload_ofs = ofs + self.require_metadata_len()? + prefix;
        ensure_in_bounds(store, payload_ofs, len)?;
        Ok(payload_ofs + len)
    }

    pub fn read_payload(
        &self,
        store: &impl ByteStore,
        ofs: usize,
    ) -> Result<Vec<u8>> {
        let (len, prefix) = self.read_payload_len(store, ofs)?;
        let payload_ofs = ofs + self.require_metadata_len()? + prefix;
        ensure_in_bounds(store, payload_ofs, len)?;
        let mut payload = vec![0u8; len];
        store.get_bytes(payload_ofs, &mut payload);
        Ok(payload)
    }

    pub fn read_metadata(
        &self,
        store: &impl ByteStore,
        ofs: usize,
    ) -> Result<Vec<u8>> {
        let len = self.require_metadata_len()?;
        ensure_in_bounds(store, ofs, len)?;
        let mut metadata = vec![0u8; len];
        store.get_bytes(ofs, &mut metadata);
        Ok(metadata)
    }

    pub fn write_metadata(
        &self,
        store: &mut impl ByteStore,
        ofs: usize,
        metadata: &[u8],
    ) -> Result<()> {
        let len = self.require_metadata_len()?;
        self.check_metadata_len(metadata.len())?;
        ensure_in_bounds(store, ofs, len)?;
        store.set_bytes(ofs, metadata);
        Ok(())
    }

    // ── Chained records (trailing guards) ─────────────────────────────

    /// Stores a record at `ofs` and returns the new write cursor.
    pub fn store(
        &mut self,
        store: &mut impl ByteStore,
        ofs: usize,
        payload: &[u8],
        metadata: &[u8],
    ) -> Result<usize> {
        self.check_pre_guard(store, ofs)?;
        let record_len = self.record_len(metadata.len(), payload.len());
        if ofs + record_len > store.capacity() {
            return Err(HeapError::ResourceExhausted(Resource::ObjectSize));
        }
        let end = self.store_body(store, ofs, payload, metadata)?;
        if !self.guards {
            return Ok(end);
        }
        Self::write_guard(store, end);
        Ok(end + GUARD_LEN)
    }

    pub fn retrieve(
        &self,
        store: &impl ByteStore,
        ofs: usize,
    ) -> Result<Vec<u8>> {
        self.require_metadata_len()?;
        self.check_pre_guard(store, ofs)?;
        let end = self.body_end(store, ofs)?;
        self.check_post_guard(store, end)?;
        self.read_payload(store, ofs)
    }

    pub fn retrieve_metadata(
        &self,
        store: &impl ByteStore,
        ofs: usize,
    ) -> Result<Vec<u8>> {
        self.require_metadata_len()?;
        self.check_pre_guard(store, ofs)?;
        self.read_metadata(store, ofs)
    }

    pub fn set_metadata(
        &self,
        store: &mut impl ByteStore,
        ofs: usize,
        metadata: &[u8],
    ) -> Result<()> {
        self.require_metadata_len()?;
        self.check_pre_guard(store, ofs)?;
        self.write_metadata(store, ofs, metadata)
    }

    /// Verifies both guards of the record at `ofs` and returns the offset
    /// just past it.
    pub fn check_object(
        &self,
        store: &impl ByteStore,
        ofs: usize,
    ) -> Result<usize> {
        self.require_metadata_len()?;
        self.check_pre_guard(store, ofs)?;
        let end = self.body_end(store, ofs)?;
        self.check_post_guard(store, end)?;
        Ok(end + self.guard_len())
    }
}

fn ensure_in_bounds(
    store: &impl ByteStore,
    pos: usize,
    len: usize,
) -> Result<()> {
    if pos.checked_add(len).is_none_or(|end| end > store.capacity()) {
        return Err(HeapError::CorruptedRecord {
            position: pos as u64,
            detail: format!(
                "{len} bytes past the end of a {} byte space",
                store.capacity()
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::Space;

    fn create_test_space(size: usize) -> Space {
        let mut space = Space::new();
        space.create(size);
        space
    }

    #[test]
    fn test_short_and_extended_prefix() {
        assert_eq!(ObjectCodec::length_prefix_len(0), 1);
        assert_eq!(ObjectCodec::length_prefix_len(127), 1);
        assert_eq!(ObjectCodec::length_prefix_len(128), 4);
        assert_eq!(ObjectCodec::body_len(4, 16), 21);

        let codec = ObjectCodec::new(true);
        assert_eq!(codec.record_len(4, 16), 23);
        assert_eq!(codec.record_len(4, 200), 4 + 4 + 200 + 2);
    }

    #[test]
    fn test_store_and_retrieve_chained() {
        let mut space = create_test_space(1024);
        let mut codec = ObjectCodec::new(true);

        let first = codec
            .store(&mut space, 0, b"payload-one", &[1, 2, 3, 4])
            .unwrap();
        assert_eq!(first, 4 + 1 + 11 + 2);
        let big = vec![0xab; 300];
        let second =
            codec.store(&mut space, first, &big, &[5, 6, 7, 8]).unwrap();
        assert_eq!(second, first + 4 + 4 + 300 + 2);

        assert_eq!(codec.retrieve(&space, 0).unwrap(), b"payload-one");
        assert_eq!(codec.retrieve(&space, first).unwrap(), big);
        assert_eq!(
            codec.retrieve_metadata(&space, first).unwrap(),
            vec![5, 6, 7, 8]
        );
        assert_eq!(codec.check_object(&space, 0).unwrap(), first);
        assert_eq!(codec.check_object(&space, first).unwrap(), second);
        assert_eq!(space.get_byte(first + 4), 0x80, "extended prefix flag");
    }

    #[test]
    fn test_metadata_length_is_fixed_by_first_store() {
        let mut space = create_test_space(256);
        let mut codec = ObjectCodec::new(true);
        assert!(matches!(
            codec.retrieve(&space, 0),
            Err(HeapError::NoDataStored)
        ));

        let top = codec.store(&mut space, 0, b"x", &[0; 4]).unwrap();
        let err = codec.store(&mut space, top, b"y", &[0; 3]).unwrap_err();
        assert!(matches!(
            err,
            HeapError::MetadataLengthMismatch {
                expected: 4,
                actual: 3
            }
        ));
        assert!(matches!(
            codec.set_metadata(&mut space, 0, &[1; 5]),
            Err(HeapError::MetadataLengthMismatch { .. })
        ));
        codec.set_metadata(&mut space, 0, &[9; 4]).unwrap();
        assert_eq!(codec.retrieve_metadata(&space, 0).unwrap(), vec![9; 4]);
    }

    #[test]
    fn test_flipped_guard_is_corruption() {
        let mut space = create_test_space(256);
        let mut codec = ObjectCodec::new(true);
        let top = codec.store(&mut space, 0, b"abc", &[0; 2]).unwrap();
        codec.store(&mut space, top, b"def", &[0; 2]).unwrap();

        // trailing guard of the first record is the leading guard of the second
        space.put_byte(top - 1, 0);
        let err = codec.check_object(&space, 0).unwrap_err();
        assert!(err.is_corruption());
        assert!(codec.retrieve(&space, top).unwrap_err().is_corruption());
    }

    #[test]
    fn test_record_must_fit() {
        let mut space = create_test_space(20);
        let mut codec = ObjectCodec::new(true);
        let err = codec.store(&mut space, 0, &[1; 16], &[0; 4]).unwrap_err();
        assert!(matches!(
            err,
            HeapError::ResourceExhausted(Resource::ObjectSize)
        ));
        assert_eq!(codec.metadata_len(), None, "failed store fixes nothing");
    }

    #[test]
    fn test_without_guards() {
        let mut space = create_test_space(64);
        let mut codec = ObjectCodec::new(false);
        let top = codec.store(&mut space, 0, b"abc", &[7]).unwrap();
        assert_eq!(top, 5);
        let next = codec.store(&mut space, top, b"de", &[8]).unwrap();
        assert_eq!(next, 9);
        assert_eq!(codec.retrieve(&space, top).unwrap(), b"de");
    }

    #[test]
    fn test_truncated_length_is_reported() {
        let mut space = create_test_space(16);
        let codec = ObjectCodec::with_metadata_len(Some(0), false);
        space.put_int(0, 0x8000_0100);
        assert!(codec.read_payload(&space, 0).unwrap_err().is_corruption());
    }
}
