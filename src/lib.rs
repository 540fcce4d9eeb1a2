//! An on-disk, block-addressed file system core.
//!
//! Three layers, leaves first:
//! * [`cache`] — a fixed-capacity, write-back LRU buffer cache over
//!   sector-sized I/O.
//! * [`inode`] — multi-level indexed inodes (direct, indirect,
//!   doubly-indirect) with sparse growth and a singleton open-inode table.
//! * [`dir`] — hierarchical directories stored as files, with path
//!   resolution, `.`/`..`, and NAME_MAX-bounded entry names.
//!
//! The raw block device and free-space allocator are consumed through the
//! [`device::BlockDevice`] and [`freemap::FreeMap`] traits rather than
//! assumed to be a single global singleton, so the whole stack is
//! host-testable against an in-memory device.

pub mod cache;
pub mod device;
pub mod dir;
pub mod error;
pub mod file;
pub mod freemap;
pub mod fs;
pub mod inode;

pub use cache::{Cache, CacheStats, CACHE_CAPACITY};
pub use device::{BlockDevice, FileBlockDevice, MemBlockDevice, SECTOR_SIZE};
pub use dir::{Directory, NAME_MAX};
pub use error::{FsError, FsResult};
pub use file::FileHandle;
pub use freemap::{BitmapFreeMap, FreeMap};
pub use fs::Filesystem;
pub use inode::{Inode, DIRECT_COUNT, INODE_MAGIC, MAX_FILE_BYTES, MAX_FILE_SECTORS, PTRS_PER_BLOCK};
