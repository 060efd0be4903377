use std::path::{Path, PathBuf};

use crate::{HeapError, Resource, Result};

/// Size of a memory-mapped space when the space size is derived from a
/// total memory budget.
pub const MAPPED_SPACE_SIZE: usize = 1 << 29;

/// Configuration shared by the space-chain, handle and unified heaps.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Capacity of one space in bytes. Must fit in 31 bits.
    pub space_size: usize,
    /// Number of spaces owned by the heap.
    pub max_spaces: usize,
    /// Spaces selected as compaction victims per cycle.
    /// `>= max_spaces` means every space is compacted.
    pub compress_spaces: usize,
    /// Partially filled spaces to keep in reserve before the heap counts
    /// as almost full for concurrent writers.
    pub free_spaces: usize,
    /// Usage percentage of the current space above which it is almost full.
    pub remap_threshold: u32,
    /// Back spaces with memory-mapped files instead of heap buffers.
    pub memory_mapped: bool,
    /// `<base>` for `<base>.desc`, `<base>.<N>.space` and `<base>.ref`.
    pub base_path: Option<PathBuf>,
    /// Write and verify 2-byte guards around every record.
    pub debug_guards: bool,
    /// Size of the handle table. 0 derives it from the heap capacity.
    pub max_references: usize,
    /// Expected record size, used to derive `max_references`.
    pub average_object_size: usize,
    /// Treat a second remap of the same handle as an error instead of a
    /// warning.
    pub reject_double_remaps: bool,
    /// Largest record extent the unified heap accepts. Bounds the backward
    /// head-bit scan.
    pub max_object_size: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            space_size: 800_000_000, // 1600 MB over two spaces
            max_spaces: 2,
            compress_spaces: 2,
            free_spaces: 1,
            remap_threshold: 95,
            memory_mapped: false,
            base_path: None,
            debug_guards: true,
            max_references: 0,
            average_object_size: 64,
            reject_double_remaps: true,
            max_object_size: 64 * 1024,
        }
    }
}

impl HeapSettings {
    /// Settings for an in-memory heap of `max_spaces` spaces.
    pub fn in_memory(space_size: usize, max_spaces: usize) -> Self {
        Self {
            space_size,
            max_spaces,
            compress_spaces: max_spaces,
            ..Default::default()
        }
    }

    /// Derives `space_size` (and, when memory-mapped, `max_spaces`) from a
    /// total memory budget.
    pub fn with_max_memory(mut self, max_memory: u64) -> Result<Self> {
        let compress_all = self.compress_all();
        if self.memory_mapped {
            let desired = MAPPED_SPACE_SIZE as u64;
            self.max_spaces =
                max_memory.div_ceil(desired).max(1) as usize;
        }
        if self.max_spaces == 0 {
            return Err(HeapError::InvalidConfig("max_spaces must be > 0"));
        }
        let per_space = max_memory / self.max_spaces as u64;
        if per_space > i32::MAX as u64 {
            return Err(HeapError::ResourceExhausted(Resource::SpaceSize));
        }
        self.space_size = per_space as usize;
        if compress_all {
            self.compress_spaces = self.max_spaces;
        }
        Ok(self)
    }

    pub fn with_base_path(mut self, base: impl AsRef<Path>) -> Self {
        self.base_path = Some(base.as_ref().to_path_buf());
        self
    }

    #[inline]
    pub fn compress_all(&self) -> bool {
        self.compress_spaces >= self.max_spaces
    }

    #[inline]
    pub fn max_memory(&self) -> u64 {
        self.space_size as u64 * self.max_spaces as u64
    }

    /// Handle table size: explicit, or capacity divided by the average
    /// object size, capped to what a 32-bit handle can address.
    pub fn effective_max_references(&self) -> usize {
        let derived = if self.max_references == 0 {
            (self.max_memory() / self.average_object_size.max(1) as u64)
                as usize
        } else {
            self.max_references
        };
        derived.min(i32::MAX as usize)
    }

    pub fn validate(&self) -> Result<()> {
        if self.space_size == 0 || self.max_spaces == 0 {
            return Err(HeapError::InvalidConfig("sizes must be > 0"));
        }
        if self.space_size > i32::MAX as usize {
            return Err(HeapError::ResourceExhausted(Resource::SpaceSize));
        }
        if self.compress_spaces == 0 {
            return Err(HeapError::InvalidConfig(
                "compress_spaces must be > 0",
            ));
        }
        if self.remap_threshold > 100 {
            return Err(HeapError::InvalidConfig(
                "remap_threshold is a percentage",
            ));
        }
        if self.memory_mapped && self.base_path.is_none() {
            return Err(HeapError::InvalidConfig(
                "memory-mapped spaces need a base path",
            ));
        }
        if self.max_object_size == 0 {
            return Err(HeapError::InvalidConfig(
                "max_object_size must be > 0",
            ));
        }
        Ok(())
    }

    /// `<base>.<n>.space`
    pub fn space_file_name(&self, n: usize) -> Option<PathBuf> {
        self.base_path
            .as_ref()
            .map(|base| with_suffix(base, &format!(".{n}.space")))
    }

    pub fn desc_file_name(&self) -> Option<PathBuf> {
        self.base_path.as_ref().map(|base| with_suffix(base, ".desc"))
    }

    pub fn ref_file_name(&self) -> Option<PathBuf> {
        self.base_path.as_ref().map(|base| with_suffix(base, ".ref"))
    }

    pub fn heads_file_name(&self) -> Option<PathBuf> {
        self.base_path.as_ref().map(|base| with_suffix(base, ".heads"))
    }

    pub(crate) fn require_base_path(&self) -> Result<&Path> {
        self.base_path
            .as_deref()
            .ok_or(HeapError::InvalidConfig("no base path configured"))
    }
}

pub(crate) fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
