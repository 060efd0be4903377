//! The description record: list membership, the current space, the fixed
//! metadata length and the caller's root offset. Stored as `<base>.desc` or
//! under [`DESC_KEY`] in an injected [`KeyValueStore`].

use std::{
    collections::HashMap,
    fs,
    io::{self, Read, Write},
    sync::Arc,
};

use parking_lot::RwLock;

use crate::{HeapError, HeapSettings, Offset, Result};

const DESC_MAGIC: &[u8; 8] = b"OHEAPDSC";
const DESC_VERSION: u32 = 1;

pub const DESC_KEY: &[u8] = b"desc";

/// Byte key-value store that can hold the description record.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
}

/// In-process [`KeyValueStore`].
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.entries.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapDescription {
    pub space_size: u64,
    pub max_spaces: u32,
    pub metadata_len: Option<usize>,
    pub current: Option<usize>,
    pub root: Offset,
    /// Head first.
    pub filled: Vec<usize>,
    /// Head first.
    pub partially_filled: Vec<usize>,
    /// Write cursor of every space, indexed by space number.
    pub mem_tops: Vec<usize>,
    /// Unified heap only.
    pub used: u64,
    /// Unified heap only.
    pub cursor: u64,
}

impl HeapDescription {
    pub fn new(settings: &HeapSettings) -> Self {
        Self {
            space_size: settings.space_size as u64,
            max_spaces: settings.max_spaces as u32,
            metadata_len: None,
            current: None,
            root: Offset::NULL,
            filled: Vec::new(),
            partially_filled: Vec::new(),
            mem_tops: vec![0; settings.max_spaces],
            used: 0,
            cursor: 0,
        }
    }

    /// Rejects a description written by a heap with a different geometry.
    pub fn check_geometry(&self, settings: &HeapSettings) -> Result<()> {
        if self.space_size != settings.space_size as u64 {
            return Err(HeapError::InvalidDescription(format!(
                "space size {} does not match configured {}",
                self.space_size, settings.space_size
            )));
        }
        if self.max_spaces as usize != settings.max_spaces {
            return Err(HeapError::InvalidDescription(format!(
                "{} spaces stored, {} configured",
                self.max_spaces, settings.max_spaces
            )));
        }
        let max = settings.max_spaces;
        let in_range = self.current.is_none_or(|c| c < max)
            && self.filled.iter().all(|&n| n < max)
            && self.partially_filled.iter().all(|&n| n < max)
            && self.mem_tops.len() == max;
        if !in_range {
            return Err(HeapError::InvalidDescription(
                "space index out of range".into(),
            ));
        }
        Ok(())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + 8 * self.mem_tops.len());
        // writes into a Vec cannot fail
        let _ = self.write_to(&mut out);
        out
    }

    fn write_to(&self, w: &mut dyn Write) -> io::Result<()> {
        w.write_all(DESC_MAGIC)?;
        write_u32(w, DESC_VERSION)?;
        write_u64(w, self.space_size)?;
        write_u32(w, self.max_spaces)?;
        write_i32(w, self.metadata_len.map_or(-1, |len| len as i32))?;
        write_i32(w, self.current.map_or(-1, |n| n as i32))?;
        write_i64(w, self.root.raw())?;
        write_list(w, &self.filled)?;
        write_list(w, &self.partially_filled)?;
        write_u32(w, self.mem_tops.len() as u32)?;
        for &top in &self.mem_tops {
            write_u64(w, top as u64)?;
        }
        write_u64(w, self.used)?;
        write_u64(w, self.cursor)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = bytes;
        Self::read_from(&mut reader).map_err(|err| {
            HeapError::InvalidDescription(format!("unreadable record: {err}"))
        })
    }

    fn read_from(r: &mut dyn Read) -> io::Result<Self> {
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if &magic != DESC_MAGIC {
            return Err(invalid_data("invalid description magic"));
        }
        if read_u32(r)? != DESC_VERSION {
            return Err(invalid_data("unsupported description version"));
        }
        let space_size = read_u64(r)?;
        let max_spaces = read_u32(r)?;
        let metadata_len = read_i32(r)?;
        let current = read_i32(r)?;
        let root = Offset::from_raw(read_i64(r)?);
        let filled = read_list(r)?;
        let partially_filled = read_list(r)?;
        let count = read_u32(r)? as usize;
        let mut mem_tops = Vec::with_capacity(count.min(1 << 16));
        for _ in 0..count {
            mem_tops.push(read_u64(r)? as usize);
        }
        let used = read_u64(r)?;
        let cursor = read_u64(r)?;
        Ok(Self {
            space_size,
            max_spaces,
            metadata_len: (metadata_len >= 0).then_some(metadata_len as usize),
            current: (current >= 0).then_some(current as usize),
            root,
            filled,
            partially_filled,
            mem_tops,
            used,
            cursor,
        })
    }

    /// Writes the record to the injected store, or else to `<base>.desc`.
    pub fn save(
        &self,
        settings: &HeapSettings,
        kv: Option<&Arc<dyn KeyValueStore>>,
    ) -> Result<()> {
        let bytes = self.encode();
        match kv {
            Some(kv) => kv.put(DESC_KEY, &bytes),
            None => {
                let path = settings.require_base_path()?;
                let path = crate::settings::with_suffix(path, ".desc");
                fs::write(path, bytes)?;
                Ok(())
            }
        }
    }

    pub fn load(
        settings: &HeapSettings,
        kv: Option<&Arc<dyn KeyValueStore>>,
    ) -> Result<Self> {
        let bytes = match kv {
            Some(kv) => kv.get(DESC_KEY)?.ok_or_else(|| {
                HeapError::InvalidDescription("no description stored".into())
            })?,
            None => {
                let path = settings.require_base_path()?;
                fs::read(crate::settings::with_suffix(path, ".desc"))?
            }
        };
        let desc = Self::decode(&bytes)?;
        desc.check_geometry(settings)?;
        Ok(desc)
    }

    pub fn exists(
        settings: &HeapSettings,
        kv: Option<&Arc<dyn KeyValueStore>>,
    ) -> bool {
        match kv {
            Some(kv) => matches!(kv.get(DESC_KEY), Ok(Some(_))),
            None => settings.desc_file_name().is_some_and(|p| p.exists()),
        }
    }
}

fn write_list(w: &mut dyn Write, list: &[usize]) -> io::Result<()> {
    write_u32(w, list.len() as u32)?;
    for &n in list {
        write_u32(w, n as u32)?;
    }
    Ok(())
}

fn read_list(r: &mut dyn Read) -> io::Result<Vec<usize>> {
    let len = read_u32(r)? as usize;
    let mut list = Vec::with_capacity(len.min(1 << 16));
    for _ in 0..len {
        list.push(read_u32(r)? as usize);
    }
    Ok(list)
}

pub(crate) fn write_u32(w: &mut dyn Write, v: u32) -> io::Result<()> {
    w.write_all(&v.to_be_bytes())
}

pub(crate) fn read_u32(r: &mut dyn Read) -> io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_be_bytes(b))
}

pub(crate) fn write_i32(w: &mut dyn Write, v: i32) -> io::Result<()> {
    w.write_all(&v.to_be_bytes())
}

pub(crate) fn read_i32(r: &mut dyn Read) -> io::Result<i32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(i32::from_be_bytes(b))
}

pub(crate) fn write_u64(w: &mut dyn Write, v: u64) -> io::Result<()> {
    w.write_all(&v.to_be_bytes())
}

pub(crate) fn read_u64(r: &mut dyn Read) -> io::Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_be_bytes(b))
}

pub(crate) fn write_i64(w: &mut dyn Write, v: i64) -> io::Result<()> {
    w.write_all(&v.to_be_bytes())
}

pub(crate) fn read_i64(r: &mut dyn Read) -> io::Result<i64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(i64::from_be_bytes(b))
}

pub(crate) fn invalid_data(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}
