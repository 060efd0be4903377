mod bitmap;
mod error;
mod settings;

pub mod chain;
pub mod codec;
pub mod desc;
pub mod handles;
pub mod space;
pub mod store;
pub mod table;
pub mod unified;

pub use bitmap::Bitmap;
pub use chain::{SpaceChainHeap, SpaceHead};
pub use codec::ObjectCodec;
pub use desc::{HeapDescription, KeyValueStore, MemoryKeyValueStore};
pub use error::{HeapError, Resource, Result};
pub use handles::HandleHeap;
pub use settings::{HeapSettings, MAPPED_SPACE_SIZE};
pub use space::{ByteStore, Space};
pub use store::{Handle, HandleStore, HeapStats, ObjectStore, Offset, Remap};
pub use table::{LruHandleTable, MemoryHandleTable};
pub use unified::{FreeListHeap, UnifiedSpace};
