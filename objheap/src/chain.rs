//! Space-chain heap: records are appended to the current space and
//! addressed by offset.
//!
//! Every space is in exactly one role. The current space receives writes,
//! the partially filled list feeds new current spaces, and full spaces wait
//! on the filled list for compaction. Lists are threaded through
//! [`Space::previous_space_num`], so moving a space between roles never
//! allocates.

use std::{fmt, sync::Arc};

use log::{debug, info, warn};

use crate::{
    Bitmap, HeapError, HeapSettings, Offset, Resource, Result,
    codec::ObjectCodec,
    desc::{HeapDescription, KeyValueStore},
    space::{NO_SPACE, Space},
    store::{HeapStats, ObjectStore, Remap},
};

const ALMOST_FULL_PERCENT: u32 = 90;

// ── SpaceHead ─────────────────────────────────────────────────────────

/// Singly linked list of space indices. New spaces are pushed at the head,
/// so the tail holds the space that joined first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceHead {
    head: usize,
    count: usize,
}

impl Default for SpaceHead {
    fn default() -> Self {
        Self::new()
    }
}

impl SpaceHead {
    pub const fn new() -> Self {
        Self {
            head: NO_SPACE,
            count: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == NO_SPACE
    }

    pub fn peek_first(&self) -> Option<usize> {
        (self.head != NO_SPACE).then_some(self.head)
    }

    pub fn push(&mut self, spaces: &mut [Space], n: usize) {
        spaces[n].previous_space_num = self.head;
        self.head = n;
        self.count += 1;
    }

    pub fn pop_first(&mut self, spaces: &mut [Space]) -> Option<usize> {
        let n = self.peek_first()?;
        self.head = spaces[n].previous_space_num;
        spaces[n].unlink();
        self.count -= 1;
        Some(n)
    }

    /// Pops the tail, the space that has been on the list the longest.
    pub fn remove_last(&mut self, spaces: &mut [Space]) -> Option<usize> {
        let mut last = self.peek_first()?;
        let mut pre_last = NO_SPACE;
        while spaces[last].previous_space_num != NO_SPACE {
            pre_last = last;
            last = spaces[last].previous_space_num;
        }
        if pre_last == NO_SPACE {
            self.head = NO_SPACE;
        } else {
            spaces[pre_last].previous_space_num = NO_SPACE;
        }
        self.count -= 1;
        Some(last)
    }

    /// Unlinks `n` wherever it sits. Returns false if it was not listed.
    pub fn remove(&mut self, spaces: &mut [Space], n: usize) -> bool {
        if self.head == n {
            self.pop_first(spaces);
            return true;
        }
        let mut prev = self.head;
        let mut steps = 0;
        while prev != NO_SPACE && steps < spaces.len() {
            let next = spaces[prev].previous_space_num;
            if next == n {
                spaces[prev].previous_space_num =
                    spaces[n].previous_space_num;
                spaces[n].unlink();
                self.count -= 1;
                return true;
            }
            prev = next;
            steps += 1;
        }
        false
    }

    pub fn clear(&mut self) {
        self.head = NO_SPACE;
        self.count = 0;
    }

    /// Walks the chain head first. Stops after `spaces.len()` steps so a
    /// corrupted link cannot loop forever.
    pub fn iter<'a>(
        self,
        spaces: &'a [Space],
    ) -> impl Iterator<Item = usize> + 'a {
        let mut next = self.head;
        let mut steps = 0;
        std::iter::from_fn(move || {
            if next == NO_SPACE || next >= spaces.len() || steps > spaces.len()
            {
                return None;
            }
            let n = next;
            next = spaces[n].previous_space_num;
            steps += 1;
            Some(n)
        })
    }

    pub fn to_vec(&self, spaces: &[Space]) -> Vec<usize> {
        self.iter(spaces).collect()
    }

    pub fn desc(&self, spaces: &[Space]) -> String {
        self.iter(spaces).map(|n| format!("{n} ")).collect()
    }

    /// Rebuilds a list from indices stored head first.
    pub fn link(spaces: &mut [Space], list: &[usize], filled: bool) -> Self {
        let mut head = Self::new();
        for &n in list.iter().rev() {
            spaces[n].filled = filled;
            head.push(spaces, n);
        }
        head
    }
}

// ── SpaceChainHeap ────────────────────────────────────────────────────

pub struct SpaceChainHeap {
    settings: HeapSettings,
    spaces: Vec<Space>,
    partially_filled: SpaceHead,
    filled: SpaceHead,
    current: Option<usize>,
    /// Compaction victims of the running cycle.
    old_spaces: Bitmap,
    codec: ObjectCodec,
    root: Offset,
    kv: Option<Arc<dyn KeyValueStore>>,
    remapping: bool,
    compression_percent: u32,
}

impl fmt::Debug for SpaceChainHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpaceChainHeap")
            .field("space_size", &self.settings.space_size)
            .field("max_spaces", &self.settings.max_spaces)
            .field("current", &self.current)
            .field("partially_filled", &self.partially_filled)
            .field("filled", &self.filled)
            .field("remapping", &self.remapping)
            .finish_non_exhaustive()
    }
}

impl SpaceChainHeap {
    pub fn new(settings: HeapSettings) -> Result<Self> {
        settings.validate()?;
        let mut heap = Self {
            codec: ObjectCodec::new(settings.debug_guards),
            old_spaces: Bitmap::new(settings.max_spaces),
            spaces: Vec::new(),
            partially_filled: SpaceHead::new(),
            filled: SpaceHead::new(),
            current: None,
            root: Offset::NULL,
            kv: None,
            remapping: false,
            compression_percent: 0,
            settings,
        };
        heap.reset()?;
        Ok(heap)
    }

    /// Drops every space and wires all of them into the partially filled
    /// list, lowest index first. Space 0 becomes current.
    pub fn reset(&mut self) -> Result<()> {
        let max_spaces = self.settings.max_spaces;
        self.spaces = (0..max_spaces).map(|_| Space::new()).collect();
        self.partially_filled.clear();
        self.filled.clear();
        for n in (0..max_spaces).rev() {
            self.partially_filled.push(&mut self.spaces, n);
        }
        self.current = None;
        self.codec = ObjectCodec::new(self.settings.debug_guards);
        self.root = Offset::NULL;
        self.clear_remap_mode();
        self.choose_current_space()?;
        info!(
            "heap reset: {} spaces of {} MB, compress {}, free {}, \
             remap threshold {}%",
            max_spaces,
            self.settings.space_size / 1000 / 1000,
            self.settings.compress_spaces,
            self.settings.free_spaces,
            self.settings.remap_threshold
        );
        Ok(())
    }

    /// Persists the description record in `kv` instead of `<base>.desc`.
    pub fn set_description_store(
        &mut self,
        kv: Option<Arc<dyn KeyValueStore>>,
    ) {
        self.kv = kv;
    }

    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    pub fn spaces(&self) -> &[Space] {
        &self.spaces
    }

    pub(crate) fn spaces_mut(&mut self) -> &mut [Space] {
        &mut self.spaces
    }

    pub fn codec(&self) -> &ObjectCodec {
        &self.codec
    }

    /// Split borrow for in-place rewrites of stored records.
    pub(crate) fn codec_and_spaces(
        &mut self,
    ) -> (&mut ObjectCodec, &mut [Space]) {
        (&mut self.codec, &mut self.spaces)
    }

    pub fn metadata_len(&self) -> Option<usize> {
        self.codec.metadata_len()
    }

    pub fn set_root_ofs(&mut self, root: Offset) {
        self.root = root;
    }

    pub fn root_ofs(&self) -> Offset {
        self.root
    }

    /// Highest encodable offset plus one.
    pub fn max_pointer(&self) -> i64 {
        self.settings.max_memory() as i64
    }

    // ── Offsets ───────────────────────────────────────────────────────

    pub fn build_pointer(
        &self,
        space_num: usize,
        ofs: usize,
    ) -> Result<Offset> {
        let raw = space_num as i64 * self.settings.space_size as i64
            + ofs as i64;
        if ofs >= self.settings.space_size {
            return Err(HeapError::InvalidOffset {
                offset: Offset::from_raw(raw),
                detail: "intra-space offset beyond the space size",
            });
        }
        Ok(Offset::from_raw(raw))
    }

    pub fn space_num_of_pointer(&self, offset: Offset) -> Result<usize> {
        if offset.raw() < 0 {
            return Err(HeapError::InvalidOffset {
                offset,
                detail: "disposed reference",
            });
        }
        let n = (offset.raw() / self.settings.space_size as i64) as usize;
        if n >= self.settings.max_spaces {
            return Err(HeapError::InvalidOffset {
                offset,
                detail: "beyond the last space",
            });
        }
        Ok(n)
    }

    /// Intra-space offset of `offset`, which must lie in `space_num`.
    pub fn space_ofs_from_pointer(
        &self,
        space_num: usize,
        offset: Offset,
    ) -> Result<usize> {
        if self.space_num_of_pointer(offset)? != space_num {
            return Err(HeapError::InvalidOffset {
                offset,
                detail: "offset is not in the given space",
            });
        }
        Ok((offset.raw() % self.settings.space_size as i64) as usize)
    }

    /// Space number and intra-space offset of a stored record.
    pub fn locate(&self, offset: Offset) -> Result<(usize, usize)> {
        let n = self.space_num_of_pointer(offset)?;
        let ofs = self.space_ofs_from_pointer(n, offset)?;
        let space = &self.spaces[n];
        if space.is_empty() {
            return Err(HeapError::InvalidOffset {
                offset,
                detail: "space not allocated",
            });
        }
        if ofs >= space.mem_top {
            return Err(HeapError::InvalidOffset {
                offset,
                detail: "past the write cursor",
            });
        }
        Ok((n, ofs))
    }

    // ── Space roles ───────────────────────────────────────────────────

    pub fn cur_space_num(&self) -> Option<usize> {
        self.current
    }

    pub fn filled_spaces_count(&self) -> usize {
        self.filled.len()
    }

    pub fn partially_filled_spaces_count(&self) -> usize {
        self.partially_filled.len()
    }

    pub fn filled_spaces_desc(&self) -> String {
        self.filled.desc(&self.spaces)
    }

    pub fn partially_filled_spaces_desc(&self) -> String {
        self.partially_filled.desc(&self.spaces)
    }

    pub fn filled_spaces(&self) -> Vec<usize> {
        self.filled.to_vec(&self.spaces)
    }

    pub fn partially_filled_spaces(&self) -> Vec<usize> {
        self.partially_filled.to_vec(&self.spaces)
    }

    fn create_space(&mut self, n: usize) -> Result<()> {
        let size = self.settings.space_size;
        if self.settings.memory_mapped {
            let path = self.settings.space_file_name(n).ok_or(
                HeapError::InvalidConfig("no base path configured"),
            )?;
            self.spaces[n].create_memory_mapped(size, &path)
        } else {
            self.spaces[n].create(size);
            Ok(())
        }
    }

    /// Takes the head of the partially filled list as the current space,
    /// materializing it on first use.
    pub fn choose_current_space(&mut self) -> Result<()> {
        let n = self
            .partially_filled
            .pop_first(&mut self.spaces)
            .ok_or(HeapError::ResourceExhausted(Resource::HeapSpace))?;
        if self.spaces[n].is_empty() {
            self.create_space(n)?;
        } else {
            debug!(
                "space {n} is partially filled ({}%)",
                self.spaces[n].usage_percent()
            );
        }
        self.spaces[n].filled = false;
        self.current = Some(n);
        info!("switching current space to {n}");
        Ok(())
    }

    /// Moves the current space to the filled list. No-op without one.
    pub fn fill_current_space(&mut self) {
        if let Some(n) = self.current.take() {
            self.spaces[n].filled = true;
            self.filled.push(&mut self.spaces, n);
        }
    }

    pub fn move_to_next_cur_space(&mut self) -> Result<()> {
        if self.partially_filled.is_empty() {
            return Err(HeapError::ResourceExhausted(Resource::HeapSpace));
        }
        if let Some(n) = self.current {
            info!("filling space {n}");
        }
        self.fill_current_space();
        self.choose_current_space()
    }

    /// Verifies that every space has exactly one role and that each list
    /// count matches its chain.
    pub fn check_space_lists(&self) -> Result<()> {
        let mut seen = vec![0u32; self.spaces.len()];
        let lists = [
            ("filled", &self.filled),
            ("partially filled", &self.partially_filled),
        ];
        for (name, list) in lists {
            let members = list.to_vec(&self.spaces);
            if members.len() != list.len() {
                return Err(HeapError::InvalidDescription(format!(
                    "{name} list counts {} but links {}",
                    list.len(),
                    members.len()
                )));
            }
            for n in members {
                seen[n] += 1;
            }
        }
        if let Some(n) = self.current {
            seen[n] += 1;
        }
        for (n, &times) in seen.iter().enumerate() {
            let expected = if self.remapping && self.old_spaces.get(n) {
                // victims are off every list until the cycle ends
                times <= 1
            } else {
                times == 1
            };
            if !expected {
                return Err(HeapError::InvalidDescription(format!(
                    "space {n} appears {times} times in the space lists"
                )));
            }
        }
        Ok(())
    }

    /// Walks every record of every allocated space, checking guards and
    /// lengths. Returns how many records were visited.
    pub fn check_all(&self) -> Result<usize> {
        if self.codec.metadata_len().is_none() {
            return Ok(0);
        }
        let mut checked = 0;
        for space in self.spaces.iter().filter(|s| s.is_created()) {
            let mut ofs = 0;
            while ofs < space.mem_top {
                ofs = self.codec.check_object(space, ofs)?;
                checked += 1;
            }
        }
        Ok(checked)
    }

    // ── Usage ─────────────────────────────────────────────────────────

    fn role_members(&self) -> impl Iterator<Item = usize> + '_ {
        self.filled
            .iter(&self.spaces)
            .chain(self.partially_filled.iter(&self.spaces))
            .chain(self.current)
    }

    pub fn mem_used(&self) -> u64 {
        self.role_members()
            .map(|n| self.spaces[n].mem_top as u64)
            .sum()
    }

    /// Bytes of all listed spaces; spaces not yet created count at full
    /// size.
    pub fn mem_allocated(&self) -> u64 {
        self.role_members()
            .map(|n| {
                let space = &self.spaces[n];
                if space.is_created() {
                    space.space_size() as u64
                } else {
                    self.settings.space_size as u64
                }
            })
            .sum()
    }

    pub fn mem_max(&self) -> u64 {
        self.role_members().count() as u64 * self.settings.space_size as u64
    }

    pub fn current_space_is_almost_full(&self) -> bool {
        self.current.is_some_and(|n| {
            self.spaces[n].usage_percent() > self.settings.remap_threshold
        })
    }

    pub fn heap_is_almost_full(&self) -> bool {
        self.usage_percent() > ALMOST_FULL_PERCENT
    }

    /// Keeps `free_spaces` spaces in reserve for writers that keep adding
    /// while a compaction runs.
    pub fn heap_is_almost_full_for_multithreading(&self) -> bool {
        self.partially_filled.len() <= self.settings.free_spaces
            && self.current_space_is_almost_full()
    }

    pub fn compression_percent(&self) -> u32 {
        self.compression_percent
    }

    // ── Compaction ────────────────────────────────────────────────────

    pub fn is_victim(&self, space_num: usize) -> bool {
        self.old_spaces.get(space_num)
    }

    pub fn needs_to_move_ofs(&self, offset: Offset) -> Result<bool> {
        Ok(self.is_victim(self.space_num_of_pointer(offset)?))
    }

    pub fn victims(&self) -> impl Iterator<Item = usize> + '_ {
        self.old_spaces.iter_ones()
    }

    /// Victim list, lowest index first.
    pub fn removing_spaces_desc(&self) -> String {
        self.victims().map(|n| format!("{n} ")).collect()
    }

    pub fn garbage_collection_description(&self) -> String {
        self.removing_spaces_desc()
    }

    fn clear_remap_mode(&mut self) {
        self.remapping = false;
        self.old_spaces.clear_all();
    }

    fn choose_spaces_to_compress(&mut self) -> Result<()> {
        if self.settings.compress_all() {
            self.choose_to_compress_all_spaces();
            Ok(())
        } else {
            self.choose_to_compress_some_spaces()
        }
    }

    fn choose_to_compress_all_spaces(&mut self) {
        self.fill_current_space();
        for n in 0..self.settings.max_spaces {
            self.old_spaces.set(n);
        }
    }

    /// Pops the oldest filled spaces. With nothing filled, the current space
    /// is filled once and taken instead.
    fn choose_to_compress_some_spaces(&mut self) -> Result<()> {
        let mut current_added = false;
        for _ in 0..self.settings.compress_spaces {
            if self.filled.is_empty() {
                if current_added {
                    break;
                }
                current_added = true;
                self.fill_current_space();
            }
            let Some(n) = self.filled.remove_last(&mut self.spaces) else {
                break;
            };
            self.add_victim(n)?;
        }
        Ok(())
    }

    fn add_victim(&mut self, n: usize) -> Result<()> {
        if self.current == Some(n) {
            return Err(HeapError::InvalidCompactionTarget(n));
        }
        if !self.spaces[n].filled {
            warn!("compressing space {n}, which is not filled");
        }
        debug!("add compress space: {n}");
        self.old_spaces.set(n);
        Ok(())
    }

    /// Adds space `n` to the running cycle's victims. The current space is
    /// never a valid victim.
    pub fn mark_victim(&mut self, n: usize) -> Result<()> {
        if !self.remapping {
            return Err(HeapError::NotRemapping);
        }
        if n >= self.settings.max_spaces {
            return Err(HeapError::InvalidCompactionTarget(n));
        }
        if self.current == Some(n) {
            return Err(HeapError::InvalidCompactionTarget(n));
        }
        if !self.filled.remove(&mut self.spaces, n) {
            self.partially_filled.remove(&mut self.spaces, n);
        }
        self.add_victim(n)
    }

    /// Sum of the victims' write cursors.
    pub fn victims_mem_used(&self) -> u64 {
        self.victims().map(|n| self.spaces[n].mem_top as u64).sum()
    }

    /// Ends a cycle after `retained` of `original` victim bytes survived.
    /// Victims rejoin the partially filled list with their cursors as left
    /// by the caller.
    pub(crate) fn finish_remap(
        &mut self,
        original: u64,
        retained: u64,
    ) -> Result<()> {
        self.compression_percent = if original == 0 {
            100
        } else {
            (retained * 100 / original) as u32
        };
        let victims: Vec<usize> = self.victims().collect();
        for &n in victims.iter().rev() {
            if !self.filled.remove(&mut self.spaces, n) {
                self.partially_filled.remove(&mut self.spaces, n);
            }
            self.spaces[n].filled = false;
            self.partially_filled.push(&mut self.spaces, n);
        }
        self.clear_remap_mode();
        if self.current.is_none() {
            self.choose_current_space()?;
        }
        info!(
            "compaction done: spaces [{}], {} of {} bytes retained ({}%)",
            victims
                .iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
                .join(" "),
            retained,
            original,
            self.compression_percent
        );
        Ok(())
    }

    // ── Persistence ───────────────────────────────────────────────────

    pub fn desc_file_exists(&self) -> bool {
        HeapDescription::exists(&self.settings, self.kv.as_ref())
    }

    pub(crate) fn description(&self) -> HeapDescription {
        HeapDescription {
            metadata_len: self.codec.metadata_len(),
            current: self.current,
            root: self.root,
            filled: self.filled.to_vec(&self.spaces),
            partially_filled: self.partially_filled.to_vec(&self.spaces),
            mem_tops: self.spaces.iter().map(|s| s.mem_top).collect(),
            ..HeapDescription::new(&self.settings)
        }
    }

    /// Writes (or syncs) every created space, then the description record.
    pub fn save(&self) -> Result<()> {
        if self.remapping {
            return Err(HeapError::AlreadyRemapping);
        }
        for (n, space) in self.spaces.iter().enumerate() {
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
        }
        self.description().save(&self.settings, self.kv.as_ref())?;
        info!("heap saved ({} bytes used)", self.mem_used());
        Ok(())
    }

    /// Restores a heap written by [`SpaceChainHeap::save`] and returns the
    /// root offset.
    pub fn load(&mut self) -> Result<Offset> {
        let desc = HeapDescription::load(&self.settings, self.kv.as_ref())?;
        self.restore(&desc)?;
        Ok(desc.root)
    }

    pub(crate) fn restore(&mut self, desc: &HeapDescription) -> Result<()> {
        let max_spaces = self.settings.max_spaces;
        let mut spaces: Vec<Space> =
            (0..max_spaces).map(|_| Space::new()).collect();
        self.filled = SpaceHead::link(&mut spaces, &desc.filled, true);
        self.partially_filled =
            SpaceHead::link(&mut spaces, &desc.partially_filled, false);
        for (n, space) in spaces.iter_mut().enumerate() {
            let mem_top = desc.mem_tops[n];
            if mem_top > self.settings.space_size {
                return Err(HeapError::InvalidDescription(format!(
                    "space {n} cursor {mem_top} beyond the space size"
                )));
            }
            if mem_top == 0 && desc.current != Some(n) {
                continue;
            }
            let path = self
                .settings
                .space_file_name(n)
                .ok_or(HeapError::InvalidConfig("no base path configured"))?;
            space.read_from_file(
                &path,
                self.settings.space_size,
                self.settings.memory_mapped,
            )?;
            space.mem_top = mem_top;
        }
        self.spaces = spaces;
        self.current = desc.current;
        self.codec = ObjectCodec::with_metadata_len(
            desc.metadata_len,
            self.settings.debug_guards,
        );
        self.root = desc.root;
        self.clear_remap_mode();
        self.check_space_lists()?;
        info!(
            "heap loaded: current {:?}, filled [{}], partially filled [{}]",
            self.current,
            self.filled_spaces_desc(),
            self.partially_filled_spaces_desc()
        );
        Ok(())
    }

    /// Offset-addressed records are only reclaimed by compaction.
    pub fn remove_object_by_ofs(&mut self, _offset: Offset) {}
}

impl ObjectStore for SpaceChainHeap {
    fn add_object_return_ofs(
        &mut self,
        payload: &[u8],
        metadata: &[u8],
    ) -> Result<Offset> {
        self.codec.check_metadata_len(metadata.len())?;
        let len = self.codec.record_len(metadata.len(), payload.len());
        if len > self.settings.space_size {
            return Err(HeapError::ResourceExhausted(Resource::ObjectSize));
        }
        let cur = loop {
            let Some(cur) = self.current else {
                return Err(if self.remapping {
                    HeapError::RemapWriteUnsupported
                } else {
                    HeapError::ResourceExhausted(Resource::HeapSpace)
                });
            };
            if self.spaces[cur].space_avail_for(len) {
                break cur;
            }
            if self.remapping {
                return Err(HeapError::RemapWriteUnsupported);
            }
            self.move_to_next_cur_space()?;
        };
        let top = self.spaces[cur].mem_top;
        let new_top =
            self.codec.store(&mut self.spaces[cur], top, payload, metadata)?;
        self.spaces[cur].mem_top = new_top;
        self.build_pointer(cur, top)
    }

    fn retrieve_data_by_ofs(&self, offset: Offset) -> Result<Vec<u8>> {
        self.codec.require_metadata_len()?;
        let (n, ofs) = self.locate(offset)?;
        self.codec.retrieve(&self.spaces[n], ofs)
    }

    fn retrieve_metadata_by_ofs(&self, offset: Offset) -> Result<Vec<u8>> {
        self.codec.require_metadata_len()?;
        let (n, ofs) = self.locate(offset)?;
        self.codec.retrieve_metadata(&self.spaces[n], ofs)
    }

    fn set_metadata_by_ofs(
        &mut self,
        offset: Offset,
        metadata: &[u8],
    ) -> Result<()> {
        self.codec.require_metadata_len()?;
        let (n, ofs) = self.locate(offset)?;
        self.codec.set_metadata(&mut self.spaces[n], ofs, metadata)
    }

    fn check_object_by_ofs(&self, offset: Offset) -> Result<()> {
        let (n, ofs) = self.locate(offset)?;
        self.codec.check_object(&self.spaces[n], ofs).map(|_| ())
    }

    /// Records do not move in an offset-addressed heap.
    fn remap_by_ofs(&mut self, _offset: Offset) -> Result<()> {
        Ok(())
    }
}

impl Remap for SpaceChainHeap {
    fn begin_remap(&mut self) -> Result<()> {
        if self.remapping {
            return Err(HeapError::AlreadyRemapping);
        }
        self.old_spaces.clear_all();
        self.choose_spaces_to_compress()?;
        self.remapping = true;
        debug!("compacting spaces [{}]", self.removing_spaces_desc());
        Ok(())
    }

    fn end_remap(&mut self) -> Result<()> {
        if !self.remapping {
            return Err(HeapError::NotRemapping);
        }
        let used = self.victims_mem_used();
        self.finish_remap(used, used)
    }

    fn is_remapping(&self) -> bool {
        self.remapping
    }
}

impl HeapStats for SpaceChainHeap {
    fn usage_percent(&self) -> u32 {
        let total = self.mem_allocated();
        if total == 0 {
            return 0;
        }
        (self.mem_used() * 100 / total) as u32
    }

    fn stats(&self) -> Vec<String> {
        let cur = self
            .current
            .map_or_else(|| "-1".to_string(), |n| n.to_string());
        let cur_usage =
            self.current.map_or(0, |n| self.spaces[n].usage_percent());
        vec![
            format!("usage[%]: {}", self.usage_percent()),
            format!("usage[Mb]: {}", self.mem_used() / 1000 / 1000),
            format!("alloc[Mb]: {}", self.mem_allocated() / 1000 / 1000),
            format!("max[Mb]: {}", self.mem_max() / 1000 / 1000),
            format!(
                "PFilled spaces: {} ({})",
                self.partially_filled_spaces_count(),
                self.partially_filled_spaces_desc()
            ),
            format!(
                "Filled  spaces: {} ({})",
                self.filled_spaces_count(),
                self.filled_spaces_desc()
            ),
            format!("cur space    : {cur}"),
            format!("cur space usage[%]: {cur_usage}"),
        ]
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
