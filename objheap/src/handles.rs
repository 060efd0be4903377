//! Handle-indirection heap.
//!
//! Wraps a [`SpaceChainHeap`] with a `handle -> offset` table so callers keep
//! stable references while compaction moves records. A cycle is
//! `begin_remap`, one `remap_by_handle` per reachable handle, then
//! `end_remap`, which repacks the victim spaces in place and frees every
//! handle the walk did not visit.

use std::{
    fmt::Write as _,
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
    sync::Arc,
};

use log::{debug, info, warn};

use crate::{
    Bitmap, Handle, HeapError, HeapSettings, Offset, Resource, Result,
    chain::SpaceChainHeap,
    desc::{
        KeyValueStore, invalid_data, read_i32, read_i64, write_i32, write_i64,
    },
    store::{HandleStore, HeapStats, ObjectStore, Remap},
};

#[derive(Debug)]
pub struct HandleHeap {
    base: SpaceChainHeap,
    max_references: usize,
    references: Vec<Offset>,
    /// Free-handle stack; the top is handed out next.
    unused: Vec<u32>,
    highest_handle: Option<usize>,
    /// Mark set of the running cycle.
    touched: Option<Bitmap>,
    /// Handles living in victim spaces, in discovery order.
    moves: Vec<Handle>,
}

impl HandleHeap {
    pub fn new(settings: HeapSettings) -> Result<Self> {
        let max_references = settings.effective_max_references();
        if max_references == 0 {
            return Err(HeapError::InvalidConfig("max_references must be > 0"));
        }
        let base = SpaceChainHeap::new(settings)?;
        let mut heap = Self {
            base,
            max_references,
            references: Vec::new(),
            unused: Vec::new(),
            highest_handle: None,
            touched: None,
            moves: Vec::new(),
        };
        heap.reset_table();
        Ok(heap)
    }

    fn reset_table(&mut self) {
        let max = self.max_references;
        self.references = vec![Offset::NULL; max];
        self.unused = (0..max as u32).rev().collect();
        self.highest_handle = None;
        self.touched = None;
        self.moves.clear();
    }

    /// Clears the table and every space.
    pub fn reset(&mut self) -> Result<()> {
        self.reset_table();
        self.base.reset()
    }

    pub fn chain(&self) -> &SpaceChainHeap {
        &self.base
    }

    pub fn settings(&self) -> &HeapSettings {
        self.base.settings()
    }

    pub fn set_description_store(
        &mut self,
        kv: Option<Arc<dyn KeyValueStore>>,
    ) {
        self.base.set_description_store(kv);
    }

    pub fn set_root_ofs(&mut self, root: Offset) {
        self.base.set_root_ofs(root);
    }

    pub fn max_references(&self) -> usize {
        self.max_references
    }

    /// Resizes the handle table. Only allowed before the first handle is
    /// handed out.
    pub fn set_max_references(&mut self, max_references: usize) -> Result<()> {
        if self.highest_handle.is_some() || self.base.is_remapping() {
            return Err(HeapError::InvalidConfig(
                "cannot resize a handle table in use",
            ));
        }
        if max_references == 0 || max_references > i32::MAX as usize {
            return Err(HeapError::InvalidConfig(
                "max_references must be in 1..=i32::MAX",
            ));
        }
        self.max_references = max_references;
        self.reset_table();
        Ok(())
    }

    pub fn highest_handle(&self) -> Option<Handle> {
        self.highest_handle.map(|h| Handle::new(h as u32))
    }

    pub fn unused_handles_count(&self) -> usize {
        self.unused.len()
    }

    /// Number of handles currently bound to a record.
    pub fn live_handles_count(&self) -> usize {
        self.highest_handle.map_or(0, |highest| {
            self.references[..=highest]
                .iter()
                .filter(|ofs| !ofs.is_null())
                .count()
        })
    }

    // ── Handle checks ─────────────────────────────────────────────────

    /// Validates the handle bounds and its offset.
    pub fn check_handle(&self, handle: Handle) -> Result<()> {
        if self.highest_handle.is_none_or(|h| handle.index() > h) {
            return Err(HeapError::InvalidHandle {
                handle,
                detail: "beyond the highest handle",
            });
        }
        let ofs = self.references[handle.index()];
        if ofs.is_null() {
            return Err(HeapError::InvalidHandle {
                handle,
                detail: "disposed handle",
            });
        }
        if ofs.raw() < 0 || ofs.raw() >= self.base.max_pointer() {
            return Err(HeapError::InvalidHandle {
                handle,
                detail: "offset out of range",
            });
        }
        Ok(())
    }

    pub fn offset_of(&self, handle: Handle) -> Result<Offset> {
        self.check_handle(handle)?;
        Ok(self.references[handle.index()])
    }

    pub fn needs_to_move_handle(&self, handle: Handle) -> Result<bool> {
        self.base.needs_to_move_ofs(self.offset_of(handle)?)
    }

    /// During a mark walk, a handle pointing into a victim space must
    /// already have been remapped.
    pub fn check_during_remap(&self, handle: Handle) -> Result<()> {
        let touched = self.touched.as_ref().ok_or(HeapError::NotRemapping)?;
        if self.needs_to_move_handle(handle)? && !touched.get(handle.index())
        {
            return Err(HeapError::InvalidHandle {
                handle,
                detail: "points into a compacted space without a remap",
            });
        }
        Ok(())
    }

    /// Checks the guards of every live record. Returns how many were
    /// checked.
    pub fn check_all(&self) -> Result<usize> {
        let Some(highest) = self.highest_handle else {
            return Ok(0);
        };
        let mut checked = 0;
        for ofs in &self.references[..=highest] {
            if ofs.is_null() {
                continue;
            }
            self.base.check_object_by_ofs(*ofs)?;
            checked += 1;
        }
        debug!("checked {checked} records");
        Ok(checked)
    }

    /// Multi-line diagnostic dump of a handle and its record.
    pub fn handle_info(&self, handle: Handle) -> Result<String> {
        let mut info = String::new();
        let _ = writeln!(info, "handle: {}", handle.raw());
        let ofs = self.offset_of(handle)?;
        let _ = writeln!(info, "ofs: {}", ofs.raw());
        let (space, internal) = self.base.locate(ofs)?;
        let _ = writeln!(info, "space: {space}");
        let _ = writeln!(info, "internalOfs: {internal}");
        let metadata = self.base.retrieve_metadata_by_ofs(ofs)?;
        let data = self.base.retrieve_data_by_ofs(ofs)?;
        let _ = writeln!(info, "metadataLen: {}", metadata.len());
        let _ = writeln!(info, "dataLen: {}", data.len());
        let _ = writeln!(info, "metadata: {}", to_hex(&metadata));
        let _ = writeln!(info, "data: {}", to_hex(&data));
        Ok(info)
    }

    // ── Mark ──────────────────────────────────────────────────────────

    /// Marks `handle` reachable for the running cycle.
    pub fn remap_by_handle(&mut self, handle: Handle) -> Result<()> {
        if self.touched.is_none() {
            return Err(HeapError::NotRemapping);
        }
        self.check_handle(handle)?;
        let needs_move = self.needs_to_move_handle(handle)?;
        let reject = self.base.settings().reject_double_remaps;
        let Some(touched) = self.touched.as_mut() else {
            return Err(HeapError::NotRemapping);
        };
        if touched.test_and_set(handle.index()) {
            warn!("double remap of handle {}", handle.raw());
            if reject {
                return Err(HeapError::DoubleRemap(handle));
            }
            return Ok(());
        }
        if needs_move {
            self.moves.push(handle);
        }
        Ok(())
    }

    // ── Compact / sweep ───────────────────────────────────────────────

    /// Source position of every moved record, sorted by current offset.
    /// Each record is checked before anything is rewritten, so a failure
    /// leaves the table, the moves and the spaces as they were.
    fn plan_moves(&self) -> Result<Vec<(Handle, usize, usize)>> {
        let mut moves = self.moves.clone();
        moves.sort_by_key(|h| self.references[h.index()]);
        let space_size = self.base.settings().space_size as i64;
        let mut plan = Vec::with_capacity(moves.len());
        for handle in moves {
            let ofs = self.references[handle.index()];
            let n = self.base.space_num_of_pointer(ofs)?;
            if !self.base.is_victim(n) {
                return Err(HeapError::InvalidHandle {
                    handle,
                    detail: "moved handle outside every compacted space",
                });
            }
            let src = (ofs.raw() % space_size) as usize;
            self.base.codec().check_object(&self.base.spaces()[n], src)?;
            plan.push((handle, n, src));
        }
        Ok(plan)
    }

    /// Repacks the moved records of each victim space from offset 0, in
    /// ascending source order so no unread record is overwritten. Returns
    /// the bytes retained.
    fn compress(&mut self) -> Result<u64> {
        let plan = self.plan_moves()?;
        self.moves.clear();
        let victims: Vec<usize> = self.base.victims().collect();

        let mut retained = 0u64;
        let mut next = 0;
        for n in victims {
            let mut dest = 0usize;
            while let Some(&(handle, space_num, src)) = plan.get(next) {
                if space_num != n {
                    break;
                }
                let (codec, spaces) = self.base.codec_and_spaces();
                let space = &mut spaces[n];
                let metadata = codec.read_metadata(&*space, src)?;
                let payload = codec.read_payload(&*space, src)?;
                let new_dest = codec.store(space, dest, &payload, &metadata)?;
                self.references[handle.index()] =
                    self.base.build_pointer(n, dest)?;
                dest = new_dest;
                next += 1;
            }
            self.base.spaces_mut()[n].mem_top = dest;
            retained += dest as u64;
        }
        info!("moved handles: {}", plan.len());
        Ok(retained)
    }

    /// Frees every bound handle the mark walk did not touch.
    fn mark_all_untouched_handles_as_unused(&mut self) -> usize {
        let (Some(touched), Some(highest)) =
            (self.touched.as_ref(), self.highest_handle)
        else {
            return 0;
        };
        let mut disposed = 0;
        for h in 0..=highest {
            if !self.references[h].is_null() && !touched.get(h) {
                self.references[h] = Offset::NULL;
                self.unused.push(h as u32);
                disposed += 1;
            }
        }
        info!(
            "disposed handles: {disposed}, unused handles: {}",
            self.unused.len()
        );
        disposed
    }

    // ── Persistence ───────────────────────────────────────────────────

    pub fn file_exists(&self) -> bool {
        self.base.desc_file_exists()
            && self
                .settings()
                .ref_file_name()
                .is_some_and(|path| path.exists())
    }

    /// Saves the spaces, the description record and `<base>.ref`.
    pub fn save(&self) -> Result<()> {
        self.base.save()?;
        let path = self
            .settings()
            .ref_file_name()
            .ok_or(HeapError::InvalidConfig("no base path configured"))?;
        self.save_references(&path)
    }

    /// Restores a heap written by [`HandleHeap::save`] and returns the root
    /// offset.
    pub fn load(&mut self) -> Result<Offset> {
        let root = self.base.load()?;
        let path = self
            .settings()
            .ref_file_name()
            .ok_or(HeapError::InvalidConfig("no base path configured"))?;
        self.load_references(&path)?;
        Ok(root)
    }

    fn save_references(&self, path: &Path) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        let max = self.max_references;
        write_i32(&mut w, self.unused.len() as i32)?;
        write_i32(&mut w, self.highest_handle.map_or(-1, |h| h as i32))?;
        write_i32(&mut w, max as i32)?;
        write_i32(&mut w, self.references.len() as i32)?;
        write_i32(&mut w, max as i32)?;
        for ofs in &self.references {
            write_i64(&mut w, ofs.raw())?;
        }
        for i in 0..max {
            write_i32(&mut w, self.unused.get(i).map_or(0, |&h| h as i32))?;
        }
        w.flush()?;
        Ok(())
    }

    fn load_references(&mut self, path: &Path) -> Result<()> {
        let mut r = BufReader::new(File::open(path)?);
        let unused_count = read_i32(&mut r)?;
        let highest = read_i32(&mut r)?;
        let max = read_i32(&mut r)?;
        let references_len = read_i32(&mut r)?;
        let unused_len = read_i32(&mut r)?;
        let consistent = max > 0
            && references_len == max
            && unused_len >= 0
            && (0..=unused_len).contains(&unused_count)
            && (-1..max).contains(&highest);
        if !consistent {
            return Err(invalid_data("inconsistent handle table header").into());
        }

        let max_pointer = self.base.max_pointer();
        let mut references = Vec::with_capacity(references_len as usize);
        for h in 0..references_len {
            let ofs = Offset::from_raw(read_i64(&mut r)?);
            if !ofs.is_null() && !(0..max_pointer).contains(&ofs.raw()) {
                return Err(HeapError::InvalidDescription(format!(
                    "handle {h} points to {} outside the heap",
                    ofs.raw()
                )));
            }
            references.push(ofs);
        }
        let mut seen = Bitmap::new(max as usize);
        let mut unused = Vec::with_capacity(unused_count as usize);
        for i in 0..unused_len {
            let h = read_i32(&mut r)?;
            if i >= unused_count {
                continue;
            }
            if !(0..max).contains(&h) {
                return Err(HeapError::InvalidDescription(format!(
                    "unused handle {h} outside the table of {max}"
                )));
            }
            if seen.test_and_set(h as usize) {
                return Err(HeapError::InvalidDescription(format!(
                    "unused handle {h} listed twice"
                )));
            }
            if !references[h as usize].is_null() {
                return Err(HeapError::InvalidDescription(format!(
                    "unused handle {h} is still bound"
                )));
            }
            unused.push(h as u32);
        }
        self.max_references = max as usize;
        self.references = references;
        self.unused = unused;
        self.highest_handle = (highest >= 0).then_some(highest as usize);
        self.touched = None;
        self.moves.clear();
        info!(
            "handle table loaded: highest {highest}, {unused_count} unused"
        );
        Ok(())
    }
}

impl HandleStore for HandleHeap {
    fn add_and_return_handle(
        &mut self,
        payload: &[u8],
        metadata: &[u8],
    ) -> Result<Handle> {
        if self.unused.is_empty() {
            return Err(HeapError::ResourceExhausted(Resource::Handles));
        }
        let ofs = self.base.add_object_return_ofs(payload, metadata)?;
        let Some(h) = self.unused.pop() else {
            return Err(HeapError::ResourceExhausted(Resource::Handles));
        };
        let index = h as usize;
        self.references[index] = ofs;
        if self.highest_handle.is_none_or(|highest| index > highest) {
            self.highest_handle = Some(index);
        }
        // a handle born during the mark walk is live by definition
        if let Some(touched) = self.touched.as_mut() {
            touched.set(index);
        }
        Ok(Handle::new(h))
    }

    fn retrieve_data_by_handle(&self, handle: Handle) -> Result<Vec<u8>> {
        self.base.retrieve_data_by_ofs(self.offset_of(handle)?)
    }

    fn retrieve_metadata_by_handle(&self, handle: Handle) -> Result<Vec<u8>> {
        self.base.retrieve_metadata_by_ofs(self.offset_of(handle)?)
    }

    fn set_metadata_by_handle(
        &mut self,
        handle: Handle,
        metadata: &[u8],
    ) -> Result<()> {
        let ofs = self.offset_of(handle)?;
        self.base.set_metadata_by_ofs(ofs, metadata)
    }

    /// Handles are only freed by the sweep at the end of a cycle.
    fn remove_object_by_handle(&mut self, _handle: Handle) -> Result<()> {
        Ok(())
    }
}

impl Remap for HandleHeap {
    fn begin_remap(&mut self) -> Result<()> {
        self.base.begin_remap()?;
        self.touched = Some(Bitmap::new(self.max_references));
        self.moves.clear();
        Ok(())
    }

    fn end_remap(&mut self) -> Result<()> {
        if !self.base.is_remapping() {
            return Err(HeapError::NotRemapping);
        }
        let original = self.base.victims_mem_used();
        let retained = self.compress()?;
        self.mark_all_untouched_handles_as_unused();
        self.touched = None;
        self.base.finish_remap(original, retained)
    }

    fn is_remapping(&self) -> bool {
        self.base.is_remapping()
    }
}

impl HeapStats for HandleHeap {
    fn usage_percent(&self) -> u32 {
        self.base.usage_percent()
    }

    fn stats(&self) -> Vec<String> {
        let mut stats = self.base.stats();
        let highest = self.highest_handle.map_or(-1, |h| h as i64);
        stats.push(format!("highest Handle: {highest}"));
        stats
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::ByteStore;

    fn create_test_settings() -> HeapSettings {
        HeapSettings {
            max_references: 64,
            ..HeapSettings::in_memory(1_000, 2)
        }
    }

    fn create_test_heap() -> HandleHeap {
        HandleHeap::new(create_test_settings()).unwrap()
    }

    /// Six 105-byte records in space 0, handles 0..6.
    fn fill_six(heap: &mut HandleHeap) -> Vec<Handle> {
        (0..6u8)
            .map(|i| heap.add_and_return_handle(&[i; 100], &[i, 0]).unwrap())
            .collect()
    }

    #[test]
    fn test_handles_start_at_zero() {
        let mut heap = create_test_heap();
        let handles = fill_six(&mut heap);
        let raw: Vec<u32> = handles.iter().map(|h| h.raw()).collect();
        assert_eq!(raw, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(heap.highest_handle(), Some(Handle::new(5)));
        assert_eq!(heap.unused_handles_count(), 58);
        let data = heap.retrieve_data_by_handle(handles[2]).unwrap();
        assert_eq!(data, vec![2; 100]);
        let meta = heap.retrieve_metadata_by_handle(handles[3]).unwrap();
        assert_eq!(meta, vec![3, 0]);

        heap.set_metadata_by_handle(handles[3], &[7, 7]).unwrap();
        let meta = heap.retrieve_metadata_by_handle(handles[3]).unwrap();
        assert_eq!(meta, vec![7, 7]);
    }

    #[test]
    fn test_handle_exhaustion_stores_nothing() {
        let mut heap = HandleHeap::new(HeapSettings {
            max_references: 2,
            ..create_test_settings()
        })
        .unwrap();
        heap.add_and_return_handle(b"a", &[]).unwrap();
        heap.add_and_return_handle(b"b", &[]).unwrap();
        let used = heap.chain().mem_used();
        let err = heap.add_and_return_handle(b"c", &[]).unwrap_err();
        assert!(matches!(err, HeapError::ResourceExhausted(Resource::Handles)));
        assert_eq!(heap.chain().mem_used(), used);
    }

    #[test]
    fn test_invalid_handles() {
        let mut heap = create_test_heap();
        assert!(matches!(
            heap.retrieve_data_by_handle(Handle::new(0)),
            Err(HeapError::InvalidHandle { .. })
        ));
        heap.add_and_return_handle(b"a", &[]).unwrap();
        assert!(matches!(
            heap.check_handle(Handle::new(1)),
            Err(HeapError::InvalidHandle { .. })
        ));
        heap.check_handle(Handle::new(0)).unwrap();
    }

    #[test]
    fn test_compaction_repacks_marked_handles() {
        let mut heap = create_test_heap();
        let handles = fill_six(&mut heap);
        assert_eq!(heap.chain().mem_used(), 630);

        heap.begin_remap().unwrap();
        for &i in &[4usize, 1, 3] {
            heap.remap_by_handle(handles[i]).unwrap();
        }
        heap.end_remap().unwrap();

        assert!(!heap.is_remapping());
        assert_eq!(heap.offset_of(handles[1]).unwrap(), Offset::from_raw(0));
        assert_eq!(heap.offset_of(handles[3]).unwrap(), Offset::from_raw(105));
        assert_eq!(heap.offset_of(handles[4]).unwrap(), Offset::from_raw(210));
        for &i in &[1usize, 3, 4] {
            let data = heap.retrieve_data_by_handle(handles[i]).unwrap();
            assert_eq!(data, vec![i as u8; 100]);
        }
        assert_eq!(heap.chain().mem_used(), 315);
        assert_eq!(heap.chain().compression_percent(), 50);
        assert_eq!(heap.live_handles_count(), 3);
        assert_eq!(heap.check_all().unwrap(), 3);
        heap.chain().check_space_lists().unwrap();

        for &i in &[0usize, 2, 5] {
            assert!(matches!(
                heap.retrieve_data_by_handle(handles[i]),
                Err(HeapError::InvalidHandle { .. })
            ));
        }
    }

    #[test]
    fn test_swept_handles_are_reused() {
        let mut heap = create_test_heap();
        let handles = fill_six(&mut heap);
        heap.begin_remap().unwrap();
        heap.remap_by_handle(handles[0]).unwrap();
        heap.end_remap().unwrap();

        let reused = heap.add_and_return_handle(b"new", &[9, 9]).unwrap();
        assert_eq!(reused, Handle::new(5), "last freed is handed out first");
        assert_eq!(heap.offset_of(reused).unwrap(), Offset::from_raw(105));
        assert_eq!(heap.retrieve_data_by_handle(reused).unwrap(), b"new");
        assert_eq!(
            heap.retrieve_data_by_handle(handles[0]).unwrap(),
            vec![0; 100]
        );
    }

    #[test]
    fn test_double_remap_rejected() {
        let mut heap = create_test_heap();
        let h = heap.add_and_return_handle(b"x", &[]).unwrap();
        heap.begin_remap().unwrap();
        heap.remap_by_handle(h).unwrap();
        assert!(matches!(
            heap.remap_by_handle(h),
            Err(HeapError::DoubleRemap(_))
        ));
    }

    #[test]
    fn test_double_remap_tolerated() {
        let mut heap = HandleHeap::new(HeapSettings {
            reject_double_remaps: false,
            ..create_test_settings()
        })
        .unwrap();
        let handles = fill_six(&mut heap);
        heap.begin_remap().unwrap();
        heap.remap_by_handle(handles[2]).unwrap();
        heap.remap_by_handle(handles[2]).unwrap();
        heap.end_remap().unwrap();
        assert_eq!(heap.offset_of(handles[2]).unwrap(), Offset::from_raw(0));
        assert_eq!(heap.chain().mem_used(), 105);
    }

    #[test]
    fn test_remap_outside_cycle() {
        let mut heap = create_test_heap();
        let h = heap.add_and_return_handle(b"x", &[]).unwrap();
        assert!(matches!(
            heap.remap_by_handle(h),
            Err(HeapError::NotRemapping)
        ));
        assert!(matches!(heap.end_remap(), Err(HeapError::NotRemapping)));
    }

    #[test]
    fn test_handle_added_during_remap_survives() {
        let settings = HeapSettings {
            compress_spaces: 1,
            ..HeapSettings {
                max_references: 64,
                ..HeapSettings::in_memory(1_000, 3)
            }
        };
        let mut heap = HandleHeap::new(settings).unwrap();
        // 10 records: 9 fill space 0, the 10th opens space 1
        let handles: Vec<Handle> = (0..10u8)
            .map(|i| heap.add_and_return_handle(&[i; 100], &[i, 0]).unwrap())
            .collect();
        assert_eq!(heap.chain().filled_spaces(), vec![0]);

        heap.begin_remap().unwrap();
        assert_eq!(heap.chain().removing_spaces_desc(), "0 ");
        let born = heap.add_and_return_handle(b"born", &[1, 1]).unwrap();
        heap.remap_by_handle(handles[9]).unwrap();
        heap.remap_by_handle(handles[8]).unwrap();
        heap.end_remap().unwrap();

        assert_eq!(heap.retrieve_data_by_handle(born).unwrap(), b"born");
        let ofs = heap.offset_of(handles[9]).unwrap();
        assert_eq!(ofs, Offset::from_raw(1_000));
        assert_eq!(heap.offset_of(handles[8]).unwrap(), Offset::from_raw(0));
        assert_eq!(heap.live_handles_count(), 3);
        assert_eq!(heap.chain().partially_filled_spaces(), vec![0, 2]);
    }

    #[test]
    fn test_check_during_remap() {
        let mut heap = create_test_heap();
        let handles = fill_six(&mut heap);
        heap.begin_remap().unwrap();
        assert!(heap.needs_to_move_handle(handles[0]).unwrap());
        assert!(matches!(
            heap.check_during_remap(handles[0]),
            Err(HeapError::InvalidHandle { .. })
        ));
        heap.remap_by_handle(handles[0]).unwrap();
        heap.check_during_remap(handles[0]).unwrap();
    }

    #[test]
    fn test_handle_info_and_stats() {
        let mut heap = create_test_heap();
        let h = heap.add_and_return_handle(&[0xab, 0x01], &[0xff]).unwrap();
        let info = heap.handle_info(h).unwrap();
        assert!(info.contains("handle: 0\n"));
        assert!(info.contains("space: 0\n"));
        assert!(info.contains("metadata: ff\n"));
        assert!(info.contains("data: ab01\n"));

        let stats = heap.stats();
        assert_eq!(stats.last().unwrap(), "highest Handle: 0");
    }

    #[test]
    fn test_set_max_references_only_when_unused() {
        let mut heap = create_test_heap();
        heap.set_max_references(8).unwrap();
        assert_eq!(heap.unused_handles_count(), 8);
        heap.add_and_return_handle(b"x", &[]).unwrap();
        assert!(heap.set_max_references(16).is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let settings =
            create_test_settings().with_base_path(dir.path().join("refs"));
        let mut heap = HandleHeap::new(settings.clone()).unwrap();
        let handles = fill_six(&mut heap);
        heap.begin_remap().unwrap();
        heap.remap_by_handle(handles[1]).unwrap();
        heap.remap_by_handle(handles[5]).unwrap();
        heap.end_remap().unwrap();
        heap.set_root_ofs(heap.offset_of(handles[5]).unwrap());
        heap.save().unwrap();
        assert!(heap.file_exists());

        let ref_path = dir.path().join("refs.ref");
        let ref_len = std::fs::metadata(ref_path).unwrap().len();
        assert_eq!(ref_len, 4 * 5 + 8 * 64 + 4 * 64);

        let mut loaded = HandleHeap::new(settings).unwrap();
        let root = loaded.load().unwrap();
        assert_eq!(root, Offset::from_raw(105));
        assert_eq!(loaded.highest_handle(), Some(Handle::new(5)));
        assert_eq!(loaded.unused_handles_count(), 62);
        let data = loaded.retrieve_data_by_handle(handles[5]).unwrap();
        assert_eq!(data, vec![5; 100]);
        let next = loaded.add_and_return_handle(b"after", &[0, 0]).unwrap();
        assert_eq!(next, Handle::new(4));
    }

    #[test]
    fn test_corrupted_move_leaves_cycle_intact() {
        let mut heap = create_test_heap();
        let handles = fill_six(&mut heap);
        heap.begin_remap().unwrap();
        for h in &handles[..3] {
            heap.remap_by_handle(*h).unwrap();
        }
        // trailing guard of the record at 105
        let saved = heap.chain().spaces()[0].get_byte(209);
        heap.base.spaces_mut()[0].put_byte(209, 0);
        let used = heap.chain().mem_used();

        let err = heap.end_remap().unwrap_err();
        assert!(err.is_corruption(), "unexpected error: {err}");
        assert!(heap.is_remapping());
        assert_eq!(heap.chain().mem_used(), used);
        let ofs = heap.offset_of(handles[2]).unwrap();
        assert_eq!(ofs, Offset::from_raw(210), "nothing was rewritten");
        let data = heap.retrieve_data_by_handle(handles[0]).unwrap();
        assert_eq!(data, vec![0; 100]);
        assert!(heap.end_remap().unwrap_err().is_corruption());

        heap.base.spaces_mut()[0].put_byte(209, saved);
        heap.end_remap().unwrap();
        for (i, h) in handles[..3].iter().enumerate() {
            let data = heap.retrieve_data_by_handle(*h).unwrap();
            assert_eq!(data, vec![i as u8; 100]);
        }
        assert_eq!(heap.live_handles_count(), 3);
    }

    #[test]
    fn test_damaged_reference_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let settings =
            create_test_settings().with_base_path(dir.path().join("bad"));
        let mut heap = HandleHeap::new(settings.clone()).unwrap();
        fill_six(&mut heap);
        heap.save().unwrap();
        let ref_path = dir.path().join("bad.ref");
        let pristine = std::fs::read(&ref_path).unwrap();

        // header 20 bytes, 64 offsets, then the unused stack (top at 57)
        let top = 20 + 8 * 64 + 4 * 57;
        let patches: [(usize, Vec<u8>); 4] = [
            (top, 1000i32.to_be_bytes().to_vec()),
            (top, 63i32.to_be_bytes().to_vec()),
            (top, 2i32.to_be_bytes().to_vec()),
            (20, 1_000_000i64.to_be_bytes().to_vec()),
        ];
        for (at, bytes) in patches {
            let mut damaged = pristine.clone();
            damaged[at..at + bytes.len()].copy_from_slice(&bytes);
            std::fs::write(&ref_path, damaged).unwrap();

            let mut loaded = HandleHeap::new(settings.clone()).unwrap();
            assert!(
                matches!(loaded.load(), Err(HeapError::InvalidDescription(_))),
                "patch at {at} was accepted"
            );
        }

        std::fs::write(&ref_path, pristine).unwrap();
        let mut loaded = HandleHeap::new(settings).unwrap();
        loaded.load().unwrap();
        let next = loaded.add_and_return_handle(b"ok", &[0, 0]).unwrap();
        assert_eq!(next, Handle::new(6));
    }
}
