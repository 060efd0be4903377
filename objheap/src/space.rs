//! Fixed-capacity byte regions that hold packed records.
//!
//! A [`Space`] is either not yet materialized, a boxed byte slice, or a
//! shared memory mapping of `<base>.<N>.space`. Spaces are threaded into the
//! heap's lists through `previous_space_num`, an index instead of a pointer.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Write},
    path::{Path, PathBuf},
};

use log::debug;
use memmap2::MmapMut;

use crate::Result;

/// Sentinel for "no space" in intrusive space lists.
pub const NO_SPACE: usize = usize::MAX;

/// Byte-addressable storage consumed by the record codec.
///
/// Integers are big-endian. Callers keep offsets in bounds.
pub trait ByteStore {
    fn capacity(&self) -> usize;

    fn get_bytes(&self, ofs: usize, dst: &mut [u8]);

    fn set_bytes(&mut self, ofs: usize, src: &[u8]);

    fn get_byte(&self, ofs: usize) -> u8 {
        let mut byte = [0u8; 1];
        self.get_bytes(ofs, &mut byte);
        byte[0]
    }

    fn put_byte(&mut self, ofs: usize, value: u8) {
        self.set_bytes(ofs, &[value]);
    }

    fn get_int(&self, ofs: usize) -> u32 {
        let mut raw = [0u8; 4];
        self.get_bytes(ofs, &mut raw);
        u32::from_be_bytes(raw)
    }

    fn put_int(&mut self, ofs: usize, value: u32) {
        self.set_bytes(ofs, &value.to_be_bytes());
    }
}

#[derive(Debug, Default)]
enum Backing {
    #[default]
    Unallocated,
    Memory(Box<[u8]>),
    Mapped { map: MmapMut, path: PathBuf },
}

#[derive(Debug)]
pub struct Space {
    backing: Backing,
    /// Write cursor: bytes in `0..mem_top` hold records.
    pub mem_top: usize,
    /// Intrusive link to the next space of the list this one is threaded in.
    pub previous_space_num: usize,
    pub filled: bool,
}

impl Default for Space {
    fn default() -> Self {
        Self::new()
    }
}

impl Space {
    pub fn new() -> Self {
        Self {
            backing: Backing::Unallocated,
            mem_top: 0,
            previous_space_num: NO_SPACE,
            filled: false,
        }
    }

    pub fn create(&mut self, size: usize) {
        self.backing = Backing::Memory(vec![0u8; size].into_boxed_slice());
        self.mem_top = 0;
    }

    /// Creates (or truncates to `size`) the backing file and maps it.
    pub fn create_memory_mapped(
        &mut self,
        size: usize,
        path: &Path,
    ) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(size as u64)?;
        // SAFETY: the file is owned by this heap instance for its lifetime
        let map = unsafe { MmapMut::map_mut(&file)? };
        debug!("mapped {} ({size} bytes)", path.display());
        self.backing = Backing::Mapped {
            map,
            path: path.to_path_buf(),
        };
        self.mem_top = 0;
        Ok(())
    }

    /// Loads the buffer from `path`. `size` is the space capacity; shorter
    /// files are zero-extended.
    pub fn read_from_file(
        &mut self,
        path: &Path,
        size: usize,
        mapped: bool,
    ) -> Result<()> {
        if mapped {
            let mem_top = self.mem_top;
            self.create_memory_mapped(size, path)?;
            self.mem_top = mem_top;
            return Ok(());
        }
        let mut data = vec![0u8; size];
        let mut file = File::open(path)?;
        let mut read = 0;
        while read < size {
            let n = file.read(&mut data[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        self.backing = Backing::Memory(data.into_boxed_slice());
        Ok(())
    }

    /// Writes the whole buffer to `path`.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(self.as_slice())?;
        file.sync_all()?;
        Ok(())
    }

    /// Flushes a mapped space to disk. No-op for heap buffers.
    pub fn sync(&self) -> Result<()> {
        if let Backing::Mapped { map, .. } = &self.backing {
            map.flush()?;
        }
        Ok(())
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.backing, Backing::Mapped { .. })
    }

    pub fn mapped_path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Mapped { path, .. } => Some(path),
            _ => None,
        }
    }

    /// True while no buffer has been materialized.
    pub fn is_empty(&self) -> bool {
        matches!(self.backing, Backing::Unallocated)
    }

    pub fn is_created(&self) -> bool {
        !self.is_empty()
    }

    /// Detaches the space from whatever list it was threaded in.
    pub fn unlink(&mut self) {
        self.previous_space_num = NO_SPACE;
    }

    /// Forgets the contents but keeps the buffer.
    pub fn soft_destroy(&mut self) {
        self.mem_top = 0;
        self.filled = false;
    }

    /// Releases the buffer or mapping.
    pub fn destroy(&mut self) {
        self.backing = Backing::Unallocated;
        self.mem_top = 0;
        self.filled = false;
    }

    pub fn space_size(&self) -> usize {
        self.as_slice().len()
    }

    pub fn usage_percent(&self) -> u32 {
        let size = self.space_size();
        if size == 0 {
            return 0;
        }
        (self.mem_top as u64 * 100 / size as u64) as u32
    }

    /// Room for `len` more bytes past the write cursor.
    pub fn space_avail_for(&self, len: usize) -> bool {
        self.mem_top + len <= self.space_size()
    }

    fn as_slice(&self) -> &[u8] {
        match &self.backing {
            Backing::Unallocated => &[],
            Backing::Memory(data) => data,
            Backing::Mapped { map, .. } => map,
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.backing {
            Backing::Unallocated => &mut [],
            Backing::Memory(data) => data,
            Backing::Mapped { map, .. } => map,
        }
    }
}

impl ByteStore for Space {
    #[inline]
    fn capacity(&self) -> usize {
        self.space_size()
    }

    #[inline]
    fn get_bytes(&self, ofs: usize, dst: &mut [u8]) {
        dst.copy_from_slice(&self.as_slice()[ofs..ofs + dst.len()]);
    }

    #[inline]
    fn set_bytes(&mut self, ofs: usize, src: &[u8]) {
        self.as_mut_slice()[ofs..ofs + src.len()].copy_from_slice(src);
    }

    #[inline]
    fn get_byte(&self, ofs: usize) -> u8 {
        self.as_slice()[ofs]
    }

    #[inline]
    fn put_byte(&mut self, ofs: usize, value: u8) {
        self.as_mut_slice()[ofs] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lazy_space_is_empty() {
        let space = Space::new();
        assert!(space.is_empty());
        assert_eq!(space.space_size(), 0);
        assert_eq!(space.usage_percent(), 0);
        assert_eq!(space.previous_space_num, NO_SPACE);
    }

    #[test]
    fn test_byte_and_int_access() {
        let mut space = Space::new();
        space.create(64);
        space.put_byte(3, 0x7f);
        space.put_int(8, 0x8000_0102);
        assert_eq!(space.get_byte(3), 0x7f);
        assert_eq!(space.get_int(8), 0x8000_0102);
        assert_eq!(space.get_byte(8), 0x80, "ints are big-endian");

        space.set_bytes(20, b"hello");
        let mut out = [0u8; 5];
        space.get_bytes(20, &mut out);
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn test_usage_and_avail() {
        let mut space = Space::new();
        space.create(200);
        space.mem_top = 150;
        assert_eq!(space.usage_percent(), 75);
        assert!(space.space_avail_for(50));
        assert!(!space.space_avail_for(51));
        space.soft_destroy();
        assert_eq!(space.mem_top, 0);
        assert!(space.is_created());
        space.destroy();
        assert!(space.is_empty());
    }

    #[test]
    fn test_save_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.0.space");

        let mut space = Space::new();
        space.create(32);
        space.set_bytes(0, b"persist");
        space.save_to_file(&path).unwrap();

        let mut loaded = Space::new();
        loaded.read_from_file(&path, 32, false).unwrap();
        let mut out = [0u8; 7];
        loaded.get_bytes(0, &mut out);
        assert_eq!(&out, b"persist");
        assert_eq!(loaded.space_size(), 32);
    }

    #[test]
    fn test_memory_mapped_space_survives_remap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.0.space");

        let mut space = Space::new();
        space.create_memory_mapped(4096, &path).unwrap();
        assert!(space.is_mapped());
        space.set_bytes(100, b"mapped");
        space.sync().unwrap();
        drop(space);

        let mut reopened = Space::new();
        reopened.read_from_file(&path, 4096, true).unwrap();
        let mut out = [0u8; 6];
        reopened.get_bytes(100, &mut out);
        assert_eq!(&out, b"mapped");
    }
}
