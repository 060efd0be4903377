//! Addressing types and the trait family shared by every heap variant.
//!
//! Offset-addressed stores hand out an [`Offset`] that is only valid until
//! the next compaction touches its space. Handle-addressed stores hand out a
//! [`Handle`] that stays valid across compaction cycles.

use std::fmt;

use crate::Result;

/// A 64-bit record address: `space_index * space_size + intra_offset`.
///
/// `-1` is the null sentinel, matching the on-disk encoding.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Offset(i64);

impl Offset {
    pub const NULL: Offset = Offset(-1);

    #[inline]
    pub const fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == -1
    }
}

impl Default for Offset {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Debug for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("Offset(null)")
        } else {
            write!(f, "Offset({})", self.0)
        }
    }
}

/// A stable logical id indirecting to an [`Offset`].
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(u32);

impl Handle {
    #[inline]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self.0)
    }
}

/// Store addressed by physical offset.
pub trait ObjectStore {
    fn add_object_return_ofs(
        &mut self,
        payload: &[u8],
        metadata: &[u8],
    ) -> Result<Offset>;

    fn retrieve_data_by_ofs(&self, offset: Offset) -> Result<Vec<u8>>;

    fn retrieve_metadata_by_ofs(&self, offset: Offset) -> Result<Vec<u8>>;

    fn set_metadata_by_ofs(
        &mut self,
        offset: Offset,
        metadata: &[u8],
    ) -> Result<()>;

    fn check_object_by_ofs(&self, offset: Offset) -> Result<()>;

    /// Reports `offset` as reachable during a mark phase.
    fn remap_by_ofs(&mut self, offset: Offset) -> Result<()>;
}

/// Store addressed by handle.
pub trait HandleStore {
    fn add_and_return_handle(
        &mut self,
        payload: &[u8],
        metadata: &[u8],
    ) -> Result<Handle>;

    fn retrieve_data_by_handle(&self, handle: Handle) -> Result<Vec<u8>>;

    fn retrieve_metadata_by_handle(&self, handle: Handle) -> Result<Vec<u8>>;

    fn set_metadata_by_handle(
        &mut self,
        handle: Handle,
        metadata: &[u8],
    ) -> Result<()>;

    fn remove_object_by_handle(&mut self, handle: Handle) -> Result<()>;
}

/// The compaction cycle: `begin_remap`, an external mark walk, `end_remap`.
pub trait Remap {
    fn begin_remap(&mut self) -> Result<()>;

    fn end_remap(&mut self) -> Result<()>;

    fn is_remapping(&self) -> bool;
}

/// Diagnostics consumed by operational tooling.
pub trait HeapStats {
    fn usage_percent(&self) -> u32;

    fn stats(&self) -> Vec<String>;
}
