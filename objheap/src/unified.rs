//! Unified free-list heap.
//!
//! All spaces form one logical address range. A record is
//! `[guard][metadata][length prefix][payload]` and its first byte carries a
//! bit in the head bitmap. Free gaps are found by scanning that bitmap, so
//! records can be removed individually and their bytes reused.
//!
//! Every operation takes the inner [`RwLock`]: writers exclusively, point
//! reads and aggregate reads shared.

use std::{fs, path::PathBuf, sync::Arc};

use log::{debug, info};
use parking_lot::RwLock;

use crate::{
    Bitmap, HeapError, HeapSettings, Offset, Resource, Result,
    codec::ObjectCodec,
    desc::{HeapDescription, KeyValueStore},
    space::{ByteStore, Space},
    store::{HeapStats, ObjectStore, Remap},
};

const ALMOST_FULL_PERCENT: u32 = 90;

// ── UnifiedSpace ──────────────────────────────────────────────────────

/// Spaces addressed as one range. Spaces are materialized on first write;
/// bytes of a space never written read as zero.
#[derive(Debug)]
pub struct UnifiedSpace {
    spaces: Vec<Space>,
    space_size: usize,
    mapped_paths: Option<Vec<PathBuf>>,
}

impl UnifiedSpace {
    fn new(settings: &HeapSettings) -> Result<Self> {
        let mapped_paths = if settings.memory_mapped {
            let paths = (0..settings.max_spaces)
                .map(|n| settings.space_file_name(n))
                .collect::<Option<Vec<_>>>()
                .ok_or(HeapError::InvalidConfig("no base path configured"))?;
            Some(paths)
        } else {
            None
        };
        Ok(Self {
            spaces: (0..settings.max_spaces).map(|_| Space::new()).collect(),
            space_size: settings.space_size,
            mapped_paths,
        })
    }

    pub fn space_count(&self) -> usize {
        self.spaces.len()
    }

    pub fn created_spaces(&self) -> usize {
        self.spaces.iter().filter(|s| s.is_created()).count()
    }

    /// Materializes every space overlapping `ofs..ofs + len`.
    fn ensure_range(&mut self, ofs: usize, len: usize) -> Result<()> {
        let first = ofs / self.space_size;
        let last = (ofs + len.max(1) - 1) / self.space_size;
        for n in first..=last.min(self.spaces.len() - 1) {
            self.create_space(n)?;
        }
        Ok(())
    }

    fn create_space(&mut self, n: usize) -> Result<()> {
        if self.spaces[n].is_created() {
            return Ok(());
        }
        match &self.mapped_paths {
            Some(paths) => {
                self.spaces[n].create_memory_mapped(self.space_size, &paths[n])?
            }
            None => self.spaces[n].create(self.space_size),
        }
        self.spaces[n].mem_top = self.space_size;
        debug!("unified space {n} created");
        Ok(())
    }

    /// Splits `ofs..ofs + len` into per-space pieces.
    fn pieces(
        &self,
        ofs: usize,
        len: usize,
    ) -> impl Iterator<Item = (usize, usize, usize, usize)> + use<> {
        let space_size = self.space_size;
        let mut done = 0;
        std::iter::from_fn(move || {
            if done >= len {
                return None;
            }
            let pos = ofs + done;
            let n = pos / space_size;
            let intra = pos % space_size;
            let chunk = (space_size - intra).min(len - done);
            let piece = (n, intra, done, chunk);
            done += chunk;
            Some(piece)
        })
    }
}

impl ByteStore for UnifiedSpace {
    fn capacity(&self) -> usize {
        self.space_size * self.spaces.len()
    }

    fn get_bytes(&self, ofs: usize, dst: &mut [u8]) {
        for (n, intra, at, chunk) in self.pieces(ofs, dst.len()) {
            let space = &self.spaces[n];
            let out = &mut dst[at..at + chunk];
            if space.is_created() {
                space.get_bytes(intra, out);
            } else {
                out.fill(0);
            }
        }
    }

    fn set_bytes(&mut self, ofs: usize, src: &[u8]) {
        for (n, intra, at, chunk) in self.pieces(ofs, src.len()) {
            debug_assert!(self.spaces[n].is_created(), "write to space {n}");
            self.spaces[n].set_bytes(intra, &src[at..at + chunk]);
        }
    }
}

// ── FreeListHeap ──────────────────────────────────────────────────────

#[derive(Debug)]
struct Inner {
    space: UnifiedSpace,
    heads: Bitmap,
    codec: ObjectCodec,
    /// Bytes covered by live records.
    used: u64,
    /// Next-fit hint for [`FreeListHeap::add_object_return_ofs`].
    cursor: u64,
    /// Records marked reachable during a remap.
    marked: Option<Bitmap>,
    root: Offset,
}

pub struct FreeListHeap {
    settings: HeapSettings,
    inner: RwLock<Inner>,
    kv: Option<Arc<dyn KeyValueStore>>,
}

impl std::fmt::Debug for FreeListHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreeListHeap")
            .field("capacity", &self.capacity())
            .field("used", &self.mem_used())
            .finish_non_exhaustive()
    }
}

impl FreeListHeap {
    pub fn new(settings: HeapSettings) -> Result<Self> {
        settings.validate()?;
        let inner = Inner::new(&settings)?;
        info!(
            "unified heap: {} spaces of {} bytes, max object {} bytes",
            settings.max_spaces, settings.space_size, settings.max_object_size
        );
        Ok(Self {
            settings,
            inner: RwLock::new(inner),
            kv: None,
        })
    }

    pub fn reset(&self) -> Result<()> {
        *self.inner.write() = Inner::new(&self.settings)?;
        Ok(())
    }

    pub fn set_description_store(
        &mut self,
        kv: Option<Arc<dyn KeyValueStore>>,
    ) {
        self.kv = kv;
    }

    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    pub fn capacity(&self) -> u64 {
        self.settings.max_memory()
    }

    pub fn set_root_ofs(&self, root: Offset) {
        self.inner.write().root = root;
    }

    pub fn metadata_len(&self) -> Option<usize> {
        self.inner.read().codec.metadata_len()
    }

    // ── Writes ────────────────────────────────────────────────────────

    /// Stores a record in the first gap at or after `hint` and returns its
    /// offset.
    pub fn add_object_at_ofs(
        &self,
        hint: Offset,
        payload: &[u8],
        metadata: &[u8],
    ) -> Result<Offset> {
        let mut inner = self.inner.write();
        inner.add(&self.settings, hint, payload, metadata)
    }

    /// Next-fit allocation from the position after the last stored record.
    pub fn add_object_return_ofs(
        &self,
        payload: &[u8],
        metadata: &[u8],
    ) -> Result<Offset> {
        let mut inner = self.inner.write();
        let hint = Offset::from_raw(inner.cursor as i64);
        inner.add(&self.settings, hint, payload, metadata)
    }

    pub fn set_metadata_by_ofs(
        &self,
        offset: Offset,
        metadata: &[u8],
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let at = inner.locate(offset)?;
        inner.check_leading_guard(at)?;
        let body = at + inner.codec.guard_len();
        let Inner { codec, space, .. } = &mut *inner;
        codec.write_metadata(space, body, metadata)
    }

    /// Frees the record at `offset`; its bytes become a gap.
    pub fn remove_object_by_ofs(&self, offset: Offset) -> Result<()> {
        let mut inner = self.inner.write();
        let at = inner.locate(offset)?;
        let extent = inner.extent(at)?;
        inner.heads.clear(at);
        inner.used -= extent as u64;
        if let Some(marked) = inner.marked.as_mut() {
            marked.clear(at);
        }
        Ok(())
    }

    // ── Reads ─────────────────────────────────────────────────────────

    pub fn retrieve_data_by_ofs(&self, offset: Offset) -> Result<Vec<u8>> {
        let inner = self.inner.read();
        inner.codec.require_metadata_len()?;
        let at = inner.locate(offset)?;
        inner.check_leading_guard(at)?;
        inner
            .codec
            .read_payload(&inner.space, at + inner.codec.guard_len())
    }

    pub fn retrieve_metadata_by_ofs(&self, offset: Offset) -> Result<Vec<u8>> {
        let inner = self.inner.read();
        inner.codec.require_metadata_len()?;
        let at = inner.locate(offset)?;
        inner.check_leading_guard(at)?;
        inner
            .codec
            .read_metadata(&inner.space, at + inner.codec.guard_len())
    }

    pub fn check_object_by_ofs(&self, offset: Offset) -> Result<()> {
        let inner = self.inner.read();
        inner.codec.require_metadata_len()?;
        let at = inner.locate(offset)?;
        inner.check_leading_guard(at)?;
        inner.extent(at).map(|_| ())
    }

    /// Offset just past the record at `offset`.
    pub fn retrieve_next_data_ofs_by_ofs(
        &self,
        offset: Offset,
    ) -> Result<Offset> {
        let inner = self.inner.read();
        let at = inner.locate(offset)?;
        Ok(Offset::from_raw((at + inner.extent(at)?) as i64))
    }

    pub fn is_object_stored_at_ofs(&self, offset: Offset) -> bool {
        let inner = self.inner.read();
        inner.locate(offset).is_ok()
    }

    /// True if no record covers `offset`.
    pub fn is_ofs_avail(&self, offset: Offset) -> Result<bool> {
        let inner = self.inner.read();
        let pos = inner.in_range(offset)?;
        Ok(inner.covering_record(&self.settings, pos)?.is_none())
    }

    /// Nearest record head at or before `offset`, looking back at most one
    /// maximum object size.
    pub fn find_nearest_mark(&self, offset: Offset) -> Result<Option<Offset>> {
        let inner = self.inner.read();
        let pos = inner.in_range(offset)?;
        Ok(inner
            .nearest_mark(&self.settings, pos)
            .map(|h| Offset::from_raw(h as i64)))
    }

    /// Where a record of `len` bytes would be stored when searching from
    /// `hint`.
    pub fn find_uofs_for_object(
        &self,
        hint: Offset,
        len: usize,
    ) -> Result<Offset> {
        let inner = self.inner.read();
        let at = inner.find_gap(&self.settings, hint, len)?;
        Ok(Offset::from_raw(at as i64))
    }

    /// Offsets of all live records in address order.
    pub fn record_offsets(&self) -> Vec<Offset> {
        let inner = self.inner.read();
        inner
            .heads
            .iter_ones()
            .map(|h| Offset::from_raw(h as i64))
            .collect()
    }

    pub fn mem_used(&self) -> u64 {
        self.inner.read().used
    }

    pub fn mem_allocated(&self) -> u64 {
        let inner = self.inner.read();
        inner.space.created_spaces() as u64 * self.settings.space_size as u64
    }

    pub fn mem_max(&self) -> u64 {
        self.capacity()
    }

    pub fn heap_is_almost_full(&self) -> bool {
        HeapStats::usage_percent(self) > ALMOST_FULL_PERCENT
    }

    /// Checks the leading guard and extent of every live record. Returns how
    /// many were checked.
    pub fn check_all(&self) -> Result<usize> {
        let inner = self.inner.read();
        let mut checked = 0;
        for at in inner.heads.iter_ones() {
            inner.check_leading_guard(at)?;
            inner.extent(at)?;
            checked += 1;
        }
        Ok(checked)
    }

    // ── Remap ─────────────────────────────────────────────────────────

    pub fn begin_remap(&self) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.marked.is_some() {
            return Err(HeapError::AlreadyRemapping);
        }
        inner.marked = Some(Bitmap::new(inner.heads.len()));
        debug!("unified heap: mark phase started");
        Ok(())
    }

    pub fn remap_by_ofs(&self, offset: Offset) -> Result<()> {
        let mut inner = self.inner.write();
        let at = inner.locate(offset)?;
        let marked = inner.marked.as_mut().ok_or(HeapError::NotRemapping)?;
        marked.set(at);
        Ok(())
    }

    /// Frees every record the mark walk did not reach. Records never move.
    pub fn end_remap(&self) -> Result<()> {
        let mut inner = self.inner.write();
        let marked = inner.marked.as_ref().ok_or(HeapError::NotRemapping)?;
        let dead = inner
            .heads
            .iter_ones()
            .filter(|&h| !marked.get(h))
            .map(|at| inner.extent(at).map(|extent| (at, extent)))
            .collect::<Result<Vec<_>>>()?;
        inner.marked = None;
        let before = inner.used;
        for &(at, extent) in &dead {
            inner.heads.clear(at);
            inner.used -= extent as u64;
        }
        info!(
            "unified heap: freed {} records, {} of {} bytes retained",
            dead.len(),
            inner.used,
            before
        );
        Ok(())
    }

    pub fn is_remapping(&self) -> bool {
        self.inner.read().marked.is_some()
    }

    // ── Persistence ───────────────────────────────────────────────────

    pub fn desc_file_exists(&self) -> bool {
        HeapDescription::exists(&self.settings, self.kv.as_ref())
    }

    /// Saves created spaces, the head bitmap and the description record.
    pub fn save(&self) -> Result<()> {
        let inner = self.inner.read();
        if inner.marked.is_some() {
            return Err(HeapError::AlreadyRemapping);
        }
        let mut mem_tops = vec![0; self.settings.max_spaces];
        for (n, space) in inner.space.spaces.iter().enumerate() {
            if !space.is_created() {
                continue;
            }
            if space.is_mapped() {
                space.sync()?;
            } else {
                let path = self.settings.space_file_name(n).ok_or(
                    HeapError::InvalidConfig("no base path configured"),
                )?;
                space.save_to_file(&path)?;
            }
            mem_tops[n] = space.mem_top;
        }
        let heads_path = self
            .settings
            .heads_file_name()
            .ok_or(HeapError::InvalidConfig("no base path configured"))?;
        fs::write(heads_path, inner.heads.to_bytes())?;

        let desc = HeapDescription {
            metadata_len: inner.codec.metadata_len(),
            root: inner.root,
            mem_tops,
            used: inner.used,
            cursor: inner.cursor,
            ..HeapDescription::new(&self.settings)
        };
        desc.save(&self.settings, self.kv.as_ref())?;
        info!("unified heap saved ({} bytes used)", inner.used);
        Ok(())
    }

    /// Restores a heap written by [`FreeListHeap::save`] and returns the
    /// root offset.
    pub fn load(&self) -> Result<Offset> {
        let desc = HeapDescription::load(&self.settings, self.kv.as_ref())?;
        let mut fresh = Inner::new(&self.settings)?;
        for (n, &mem_top) in desc.mem_tops.iter().enumerate() {
            if mem_top == 0 {
                continue;
            }
            let path = self
                .settings
                .space_file_name(n)
                .ok_or(HeapError::InvalidConfig("no base path configured"))?;
            let space = &mut fresh.space.spaces[n];
            space.read_from_file(
                &path,
                self.settings.space_size,
                self.settings.memory_mapped,
            )?;
            space.mem_top = self.settings.space_size;
        }
        let heads_path = self
            .settings
            .heads_file_name()
            .ok_or(HeapError::InvalidConfig("no base path configured"))?;
        let bytes = fs::read(heads_path)?;
        fresh.heads = Bitmap::from_bytes(fresh.heads.len(), &bytes);
        fresh.codec = ObjectCodec::with_metadata_len(
            desc.metadata_len,
            self.settings.debug_guards,
        );
        fresh.used = desc.used;
        fresh.cursor = desc.cursor;
        fresh.root = desc.root;
        *self.inner.write() = fresh;
        info!("unified heap loaded ({} bytes used)", desc.used);
        Ok(desc.root)
    }
}

impl Inner {
    fn new(settings: &HeapSettings) -> Result<Self> {
        Ok(Self {
            space: UnifiedSpace::new(settings)?,
            heads: Bitmap::new(settings.max_memory() as usize),
            codec: ObjectCodec::new(settings.debug_guards),
            used: 0,
            cursor: 0,
            marked: None,
            root: Offset::NULL,
        })
    }

    fn in_range(&self, offset: Offset) -> Result<usize> {
        if offset.raw() < 0 {
            return Err(HeapError::InvalidOffset {
                offset,
                detail: "disposed reference",
            });
        }
        if offset.raw() as u64 >= self.heads.len() as u64 {
            return Err(HeapError::InvalidOffset {
                offset,
                detail: "beyond the heap capacity",
            });
        }
        Ok(offset.raw() as usize)
    }

    /// Position of the live record starting at `offset`.
    fn locate(&self, offset: Offset) -> Result<usize> {
        let at = self.in_range(offset)?;
        if !self.heads.get(at) {
            return Err(HeapError::InvalidOffset {
                offset,
                detail: "no record starts here",
            });
        }
        Ok(at)
    }

    fn check_leading_guard(&self, at: usize) -> Result<()> {
        if self.codec.guards() {
            ObjectCodec::check_guard(&self.space, at)?;
        }
        Ok(())
    }

    /// Bytes the record at `at` occupies, guard included.
    fn extent(&self, at: usize) -> Result<usize> {
        let body = at + self.codec.guard_len();
        Ok(self.codec.body_end(&self.space, body)? - at)
    }

    fn nearest_mark(
        &self,
        settings: &HeapSettings,
        pos: usize,
    ) -> Option<usize> {
        let window_start = pos.saturating_sub(settings.max_object_size - 1);
        self.heads.prev_set(pos, window_start)
    }

    /// The live record whose extent contains `pos`, if any.
    fn covering_record(
        &self,
        settings: &HeapSettings,
        pos: usize,
    ) -> Result<Option<(usize, usize)>> {
        let Some(head) = self.nearest_mark(settings, pos) else {
            return Ok(None);
        };
        let end = head + self.extent(head)?;
        Ok((end > pos).then_some((head, end)))
    }

    /// First gap of `len` bytes at or after `hint`, wrapping to offset 0
    /// once when the end of the range is reached.
    fn find_gap(
        &self,
        settings: &HeapSettings,
        hint: Offset,
        len: usize,
    ) -> Result<usize> {
        let capacity = self.heads.len();
        if len > capacity || len > settings.max_object_size {
            return Err(HeapError::ResourceExhausted(Resource::ObjectSize));
        }
        let mut candidate = if hint.raw() < 0 {
            0
        } else {
            (hint.raw() as u64 % capacity as u64) as usize
        };
        if let Some((_, end)) = self.covering_record(settings, candidate)? {
            candidate = end;
        }
        let start = candidate;
        let mut wrapped = false;
        loop {
            if candidate + len > capacity {
                if wrapped {
                    return Err(HeapError::ResourceExhausted(
                        Resource::HeapSpace,
                    ));
                }
                wrapped = true;
                candidate = 0;
            }
            match self.heads.next_set(candidate, candidate + len) {
                None => return Ok(candidate),
                Some(head) => candidate = head + self.extent(head)?,
            }
            if wrapped && candidate >= start {
                return Err(HeapError::ResourceExhausted(Resource::HeapSpace));
            }
        }
    }

    fn add(
        &mut self,
        settings: &HeapSettings,
        hint: Offset,
        payload: &[u8],
        metadata: &[u8],
    ) -> Result<Offset> {
        self.codec.check_metadata_len(metadata.len())?;
        let len = self.codec.guard_len()
            + ObjectCodec::body_len(metadata.len(), payload.len());
        let at = self.find_gap(settings, hint, len)?;
        self.space.ensure_range(at, len)?;
        if self.codec.guards() {
            ObjectCodec::write_guard(&mut self.space, at);
        }
        let body = at + self.codec.guard_len();
        self.codec.store_body(&mut self.space, body, payload, metadata)?;
        self.heads.set(at);
        if let Some(marked) = self.marked.as_mut() {
            marked.set(at);
        }
        self.used += len as u64;
        self.cursor = ((at + len) % self.heads.len()) as u64;
        Ok(Offset::from_raw(at as i64))
    }
}

impl ObjectStore for FreeListHeap {
    fn add_object_return_ofs(
        &mut self,
        payload: &[u8],
        metadata: &[u8],
    ) -> Result<Offset> {
        FreeListHeap::add_object_return_ofs(self, payload, metadata)
    }

    fn retrieve_data_by_ofs(&self, offset: Offset) -> Result<Vec<u8>> {
        FreeListHeap::retrieve_data_by_ofs(self, offset)
    }

    fn retrieve_metadata_by_ofs(&self, offset: Offset) -> Result<Vec<u8>> {
        FreeListHeap::retrieve_metadata_by_ofs(self, offset)
    }

    fn set_metadata_by_ofs(
        &mut self,
        offset: Offset,
        metadata: &[u8],
    ) -> Result<()> {
        FreeListHeap::set_metadata_by_ofs(self, offset, metadata)
    }

    fn check_object_by_ofs(&self, offset: Offset) -> Result<()> {
        FreeListHeap::check_object_by_ofs(self, offset)
    }

    fn remap_by_ofs(&mut self, offset: Offset) -> Result<()> {
        FreeListHeap::remap_by_ofs(self, offset)
    }
}

impl Remap for FreeListHeap {
    fn begin_remap(&mut self) -> Result<()> {
        FreeListHeap::begin_remap(self)
    }

    fn end_remap(&mut self) -> Result<()> {
        FreeListHeap::end_remap(self)
    }

    fn is_remapping(&self) -> bool {
        FreeListHeap::is_remapping(self)
    }
}

impl HeapStats for FreeListHeap {
    fn usage_percent(&self) -> u32 {
        let capacity = self.capacity();
        if capacity == 0 {
            return 0;
        }
        (self.mem_used() * 100 / capacity) as u32
    }

    fn stats(&self) -> Vec<String> {
        vec![
            format!("usage[%]: {}", HeapStats::usage_percent(self)),
            format!("usage[Mb]: {}", self.mem_used() / 1000 / 1000),
            format!("alloc[Mb]: {}", self.mem_allocated() / 1000 / 1000),
            format!("max[Mb]: {}", self.mem_max() / 1000 / 1000),
            format!("records: {}", self.inner.read().heads.count_ones()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn create_test_settings() -> HeapSettings {
        HeapSettings {
            max_object_size: 256,
            ..HeapSettings::in_memory(1_000, 2)
        }
    }

    fn create_test_heap() -> FreeListHeap {
        FreeListHeap::new(create_test_settings()).unwrap()
    }

    // guard 2 + metadata 2 + prefix 1 + payload 45
    const RECORD: usize = 50;

    fn add(heap: &FreeListHeap, fill: u8) -> Offset {
        heap.add_object_return_ofs(&[fill; 45], &[fill, 0]).unwrap()
    }

    #[test]
    fn test_round_trip_and_next_fit() {
        let heap = create_test_heap();
        let a = add(&heap, 1);
        let b = add(&heap, 2);
        assert_eq!(a, Offset::from_raw(0));
        assert_eq!(b, Offset::from_raw(RECORD as i64));
        assert_eq!(heap.retrieve_data_by_ofs(b).unwrap(), vec![2; 45]);
        assert_eq!(heap.retrieve_metadata_by_ofs(b).unwrap(), vec![2, 0]);
        assert_eq!(
            heap.retrieve_next_data_ofs_by_ofs(a).unwrap(),
            Offset::from_raw(RECORD as i64)
        );
        assert_eq!(heap.mem_used(), 2 * RECORD as u64);
        heap.set_metadata_by_ofs(a, &[8, 8]).unwrap();
        assert_eq!(heap.retrieve_metadata_by_ofs(a).unwrap(), vec![8, 8]);
        heap.check_object_by_ofs(a).unwrap();
    }

    #[test]
    fn test_record_spans_space_boundary() {
        let heap = create_test_heap();
        let at = heap
            .add_object_at_ofs(Offset::from_raw(980), &[5; 45], &[5, 0])
            .unwrap();
        assert_eq!(at, Offset::from_raw(980));
        assert_eq!(heap.retrieve_data_by_ofs(at).unwrap(), vec![5; 45]);
        assert_eq!(heap.mem_allocated(), 2_000);
    }

    #[test]
    fn test_hint_inside_record_skips_it() {
        let heap = create_test_heap();
        let a = add(&heap, 1);
        assert!(!heap.is_ofs_avail(Offset::from_raw(10)).unwrap());
        assert!(heap.is_ofs_avail(Offset::from_raw(RECORD as i64)).unwrap());
        assert_eq!(
            heap.find_nearest_mark(Offset::from_raw(30)).unwrap(),
            Some(a)
        );
        let b = heap
            .add_object_at_ofs(Offset::from_raw(10), &[2; 45], &[2, 0])
            .unwrap();
        assert_eq!(b, Offset::from_raw(RECORD as i64));
    }

    #[test]
    fn test_removed_gap_is_reused() {
        let heap = create_test_heap();
        let offsets: Vec<Offset> = (0..4).map(|i| add(&heap, i)).collect();
        heap.remove_object_by_ofs(offsets[1]).unwrap();
        assert!(!heap.is_object_stored_at_ofs(offsets[1]));
        assert!(matches!(
            heap.retrieve_data_by_ofs(offsets[1]),
            Err(HeapError::InvalidOffset { .. })
        ));

        let reused = heap
            .add_object_at_ofs(Offset::from_raw(0), &[9; 45], &[9, 0])
            .unwrap();
        assert_eq!(reused, offsets[1]);
        assert_eq!(heap.retrieve_data_by_ofs(offsets[2]).unwrap(), vec![2; 45]);
    }

    #[test]
    fn test_gap_too_small_is_skipped() {
        let heap = create_test_heap();
        let offsets: Vec<Offset> = (0..3).map(|i| add(&heap, i)).collect();
        heap.remove_object_by_ofs(offsets[1]).unwrap();
        let big = heap
            .add_object_at_ofs(Offset::from_raw(0), &[7; 60], &[7, 0])
            .unwrap();
        assert_eq!(big, Offset::from_raw(3 * RECORD as i64));
    }

    #[test]
    fn test_allocation_wraps_around() {
        let heap = create_test_heap();
        let offsets: Vec<Offset> = (0..40).map(|i| add(&heap, i)).collect();
        assert_eq!(heap.mem_used(), 2_000);
        assert!(matches!(
            heap.add_object_return_ofs(&[0; 45], &[0, 0]),
            Err(HeapError::ResourceExhausted(Resource::HeapSpace))
        ));

        heap.remove_object_by_ofs(offsets[3]).unwrap();
        let again = add(&heap, 99);
        assert_eq!(again, offsets[3], "freed slot is reused");
    }

    #[test]
    fn test_object_larger_than_window() {
        let heap = create_test_heap();
        assert!(matches!(
            heap.add_object_return_ofs(&[0; 300], &[0, 0]),
            Err(HeapError::ResourceExhausted(Resource::ObjectSize))
        ));
    }

    #[test]
    fn test_sweep_frees_unmarked() {
        let heap = create_test_heap();
        let offsets: Vec<Offset> = (0..5).map(|i| add(&heap, i)).collect();
        heap.begin_remap().unwrap();
        assert!(matches!(heap.begin_remap(), Err(HeapError::AlreadyRemapping)));
        heap.remap_by_ofs(offsets[0]).unwrap();
        heap.remap_by_ofs(offsets[3]).unwrap();
        let during = add(&heap, 42);
        heap.end_remap().unwrap();

        assert!(!heap.is_remapping());
        assert_eq!(heap.record_offsets(), vec![offsets[0], offsets[3], during]);
        assert_eq!(heap.retrieve_data_by_ofs(offsets[3]).unwrap(), vec![3; 45]);
        assert_eq!(heap.mem_used(), 3 * RECORD as u64);
        assert_eq!(heap.check_all().unwrap(), 3);
        assert!(matches!(heap.end_remap(), Err(HeapError::NotRemapping)));
    }

    #[test]
    fn test_damaged_dead_record_aborts_sweep() {
        let heap = create_test_heap();
        let offsets: Vec<Offset> = (0..4).map(|i| add(&heap, i)).collect();
        heap.begin_remap().unwrap();
        heap.remap_by_ofs(offsets[0]).unwrap();
        // length prefix of the unmarked record at 50 claims 2 GB
        let intact = heap.inner.read().space.get_int(54);
        heap.inner.write().space.put_int(54, 0xffff_ffff);
        let used = heap.mem_used();

        assert!(heap.end_remap().unwrap_err().is_corruption());
        assert!(heap.is_remapping());
        assert_eq!(heap.mem_used(), used);
        assert_eq!(heap.record_offsets(), offsets);

        heap.inner.write().space.put_int(54, intact);
        heap.end_remap().unwrap();
        assert_eq!(heap.record_offsets(), vec![offsets[0]]);
        assert_eq!(heap.mem_used(), RECORD as u64);
    }

    #[test]
    fn test_corrupted_leading_guard() {
        let heap = create_test_heap();
        let a = add(&heap, 1);
        heap.inner.write().space.put_byte(0, 0);
        assert!(heap.retrieve_data_by_ofs(a).unwrap_err().is_corruption());
        assert!(heap.check_object_by_ofs(a).unwrap_err().is_corruption());
    }

    #[test]
    fn test_concurrent_readers() {
        let heap = Arc::new(create_test_heap());
        let offsets: Vec<Offset> = (0..10).map(|i| add(&heap, i)).collect();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let heap = Arc::clone(&heap);
                let offsets = offsets.clone();
                thread::spawn(move || {
                    for (i, ofs) in offsets.iter().enumerate() {
                        let data = heap.retrieve_data_by_ofs(*ofs).unwrap();
                        assert_eq!(data, vec![i as u8; 45]);
                    }
                })
            })
            .collect();
        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let settings =
            create_test_settings().with_base_path(dir.path().join("uni"));
        let heap = FreeListHeap::new(settings.clone()).unwrap();
        let offsets: Vec<Offset> = (0..4).map(|i| add(&heap, i)).collect();
        heap.remove_object_by_ofs(offsets[2]).unwrap();
        heap.set_root_ofs(offsets[1]);
        heap.save().unwrap();
        assert!(heap.desc_file_exists());
        assert!(dir.path().join("uni.heads").exists());

        let loaded = FreeListHeap::new(settings).unwrap();
        assert_eq!(loaded.load().unwrap(), offsets[1]);
        assert_eq!(loaded.metadata_len(), Some(2));
        assert_eq!(loaded.mem_used(), 3 * RECORD as u64);
        assert_eq!(
            loaded.record_offsets(),
            vec![offsets[0], offsets[1], offsets[3]]
        );
        let data = loaded.retrieve_data_by_ofs(offsets[3]).unwrap();
        assert_eq!(data, vec![3; 45]);
        let next = add(&loaded, 7);
        assert_eq!(next, Offset::from_raw(4 * RECORD as i64));
    }
}
