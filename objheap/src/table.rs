//! In-memory handle tables with no compaction and no persistence.

use crate::{Handle, HeapError, Resource, Result, store::HandleStore};

const NO_LINK: u32 = u32::MAX;

#[derive(Debug, Clone)]
struct Entry {
    metadata: Box<[u8]>,
    payload: Box<[u8]>,
}

// ── MemoryHandleTable ─────────────────────────────────────────────────

/// Flat slot array plus a free-handle stack. Freed handles are reused
/// most recent first.
#[derive(Debug, Clone)]
pub struct MemoryHandleTable {
    slots: Vec<Option<Entry>>,
    free: Vec<u32>,
    metadata_len: Option<usize>,
}

impl MemoryHandleTable {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 || capacity > i32::MAX as usize {
            return Err(HeapError::InvalidConfig(
                "table capacity must be in 1..=i32::MAX",
            ));
        }
        Ok(Self {
            slots: vec![None; capacity],
            free: (0..capacity as u32).rev().collect(),
            metadata_len: None,
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metadata_len(&self) -> Option<usize> {
        self.metadata_len
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.entry(handle).is_ok()
    }

    fn check_metadata_len(&self, len: usize) -> Result<()> {
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

    fn entry(&self, handle: Handle) -> Result<&Entry> {
        match self.slots.get(handle.index()) {
            None => Err(HeapError::InvalidHandle {
                handle,
                detail: "beyond the table",
            }),
            Some(None) => Err(HeapError::InvalidHandle {
                handle,
                detail: "not in use",
            }),
            Some(Some(entry)) => Ok(entry),
        }
    }

    fn entry_mut(&mut self, handle: Handle) -> Result<&mut Entry> {
        match self.slots.get_mut(handle.index()) {
            None => Err(HeapError::InvalidHandle {
                handle,
                detail: "beyond the table",
            }),
            Some(None) => Err(HeapError::InvalidHandle {
                handle,
                detail: "not in use",
            }),
            Some(Some(entry)) => Ok(entry),
        }
    }

    pub fn add(&mut self, payload: &[u8], metadata: &[u8]) -> Result<Handle> {
        self.check_metadata_len(metadata.len())?;
        let index = self
            .free
            .pop()
            .ok_or(HeapError::ResourceExhausted(Resource::Handles))?;
        self.metadata_len = Some(metadata.len());
        self.slots[index as usize] = Some(Entry {
            metadata: metadata.into(),
            payload: payload.into(),
        });
        Ok(Handle::new(index))
    }

    pub fn data(&self, handle: Handle) -> Result<&[u8]> {
        Ok(&self.entry(handle)?.payload)
    }

    pub fn metadata(&self, handle: Handle) -> Result<&[u8]> {
        Ok(&self.entry(handle)?.metadata)
    }

    pub fn set_metadata(
        &mut self,
        handle: Handle,
        metadata: &[u8],
    ) -> Result<()> {
        self.check_metadata_len(metadata.len())?;
        self.entry_mut(handle)?.metadata = metadata.into();
        Ok(())
    }

    pub fn remove(&mut self, handle: Handle) -> Result<()> {
        self.entry(handle)?;
        self.slots[handle.index()] = None;
        self.free.push(handle.raw());
        Ok(())
    }

    /// Live handles in slot order.
    pub fn handles(&self) -> impl Iterator<Item = Handle> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(i, _)| Handle::new(i as u32))
    }
}

impl HandleStore for MemoryHandleTable {
    fn add_and_return_handle(
        &mut self,
        payload: &[u8],
        metadata: &[u8],
    ) -> Result<Handle> {
        self.add(payload, metadata)
    }

    fn retrieve_data_by_handle(&self, handle: Handle) -> Result<Vec<u8>> {
        self.data(handle).map(<[u8]>::to_vec)
    }

    fn retrieve_metadata_by_handle(&self, handle: Handle) -> Result<Vec<u8>> {
        self.metadata(handle).map(<[u8]>::to_vec)
    }

    fn set_metadata_by_handle(
        &mut self,
        handle: Handle,
        metadata: &[u8],
    ) -> Result<()> {
        self.set_metadata(handle, metadata)
    }

    fn remove_object_by_handle(&mut self, handle: Handle) -> Result<()> {
        self.remove(handle)
    }
}

// ── LruHandleTable ────────────────────────────────────────────────────

/// A [`MemoryHandleTable`] whose live handles are threaded oldest to
/// newest through `prev`/`next` index arrays.
#[derive(Debug, Clone)]
pub struct LruHandleTable {
    table: MemoryHandleTable,
    prev: Vec<u32>,
    next: Vec<u32>,
    oldest: u32,
    newest: u32,
}

impl LruHandleTable {
    pub fn new(capacity: usize) -> Result<Self> {
        let table = MemoryHandleTable::new(capacity)?;
        Ok(Self {
            table,
            prev: vec![NO_LINK; capacity],
            next: vec![NO_LINK; capacity],
            oldest: NO_LINK,
            newest: NO_LINK,
        })
    }

    pub fn table(&self) -> &MemoryHandleTable {
        &self.table
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    fn link_newest(&mut self, index: u32) {
        self.prev[index as usize] = self.newest;
        self.next[index as usize] = NO_LINK;
        if self.newest == NO_LINK {
            self.oldest = index;
        } else {
            self.next[self.newest as usize] = index;
        }
        self.newest = index;
    }

    fn unlink(&mut self, index: u32) {
        let prev = self.prev[index as usize];
        let next = self.next[index as usize];
        if prev == NO_LINK {
            self.oldest = next;
        } else {
            self.next[prev as usize] = next;
        }
        if next == NO_LINK {
            self.newest = prev;
        } else {
            self.prev[next as usize] = prev;
        }
        self.prev[index as usize] = NO_LINK;
        self.next[index as usize] = NO_LINK;
    }

    pub fn add(&mut self, payload: &[u8], metadata: &[u8]) -> Result<Handle> {
        let handle = self.table.add(payload, metadata)?;
        self.link_newest(handle.raw());
        Ok(handle)
    }

    pub fn data(&self, handle: Handle) -> Result<&[u8]> {
        self.table.data(handle)
    }

    pub fn metadata(&self, handle: Handle) -> Result<&[u8]> {
        self.table.metadata(handle)
    }

    pub fn set_metadata(
        &mut self,
        handle: Handle,
        metadata: &[u8],
    ) -> Result<()> {
        self.table.set_metadata(handle, metadata)
    }

    pub fn remove(&mut self, handle: Handle) -> Result<()> {
        self.table.remove(handle)?;
        self.unlink(handle.raw());
        Ok(())
    }

    /// Moves `handle` to the newest end.
    pub fn set_as_new(&mut self, handle: Handle) -> Result<()> {
        self.table.entry(handle)?;
        if self.newest != handle.raw() {
            self.unlink(handle.raw());
            self.link_newest(handle.raw());
        }
        Ok(())
    }

    pub fn get_oldest(&self) -> Option<Handle> {
        (self.oldest != NO_LINK).then(|| Handle::new(self.oldest))
    }

    pub fn get_newest(&self) -> Option<Handle> {
        (self.newest != NO_LINK).then(|| Handle::new(self.newest))
    }

    /// Removes and returns the least recently used handle.
    pub fn remove_oldest(&mut self) -> Result<Option<Handle>> {
        let Some(oldest) = self.get_oldest() else {
            return Ok(None);
        };
        self.remove(oldest)?;
        Ok(Some(oldest))
    }

    /// Live handles from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = Handle> + '_ {
        let mut cursor = self.oldest;
        std::iter::from_fn(move || {
            if cursor == NO_LINK {
                return None;
            }
            let handle = Handle::new(cursor);
            cursor = self.next[cursor as usize];
            Some(handle)
        })
    }
}

impl HandleStore for LruHandleTable {
    fn add_and_return_handle(
        &mut self,
        payload: &[u8],
        metadata: &[u8],
    ) -> Result<Handle> {
        self.add(payload, metadata)
    }

    fn retrieve_data_by_handle(&self, handle: Handle) -> Result<Vec<u8>> {
        self.data(handle).map(<[u8]>::to_vec)
    }

    fn retrieve_metadata_by_handle(&self, handle: Handle) -> Result<Vec<u8>> {
        self.metadata(handle).map(<[u8]>::to_vec)
    }

    fn set_metadata_by_handle(
        &mut self,
        handle: Handle,
        metadata: &[u8],
    ) -> Result<()> {
        self.set_metadata(handle, metadata)
    }

    fn remove_object_by_handle(&mut self, handle: Handle) -> Result<()> {
        self.remove(handle)
    }
}
