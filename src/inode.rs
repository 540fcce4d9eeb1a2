//! Multi-level indexed inodes.
//!
//! An on-disk inode fits in exactly one sector: 122 direct data-sector
//! references, one indirect reference (to a sector holding 128 more
//! references), and one doubly-indirect reference (to a sector holding 128
//! references to indirect sectors, each holding 128 more). A file's length
//! in sectors never exceeds `MAX_FILE_SECTORS`.
//!
//! Exactly one in-memory inode exists per open on-disk sector at a time —
//! [`OpenInodeTable`] is the singleton that enforces this; [`Inode::reopen`]
//! hands out another handle to the same instance rather than a copy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use zerocopy::{AsBytes, FromBytes};

use crate::cache::Cache;
use crate::device::{BlockDevice, SECTOR_SIZE};
use crate::error::{FsError, FsResult};
use crate::freemap::FreeMap;

pub const DIRECT_COUNT: usize = 122;
pub const PTRS_PER_BLOCK: usize = 128;
pub const MAX_FILE_SECTORS: u64 =
    (DIRECT_COUNT + PTRS_PER_BLOCK + PTRS_PER_BLOCK * PTRS_PER_BLOCK) as u64;
pub const MAX_FILE_BYTES: u64 = MAX_FILE_SECTORS * SECTOR_SIZE as u64;
pub const INODE_MAGIC: u32 = 0x494e4f44;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, AsBytes)]
pub struct DiskInode {
    pub direct: [u32; DIRECT_COUNT],
    pub indirect: u32,
    pub doubly_indirect: u32,
    pub length: i32,
    pub magic: u32,
    pub is_dir: i32,
    pub parent: u32,
}

const _: () = assert!(std::mem::size_of::<DiskInode>() == SECTOR_SIZE);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, AsBytes)]
struct IndirectBlock {
    entries: [u32; PTRS_PER_BLOCK],
}

const _: () = assert!(std::mem::size_of::<IndirectBlock>() == SECTOR_SIZE);

struct InodeInner {
    open_count: u32,
    removed: bool,
    deny_write_count: u32,
    disk: DiskInode,
}

/// Format a fresh inode at `sector`: `length` bytes (initially zero-filled,
/// data sectors allocated up front), directory flag, and parent pointer.
pub fn create_inode<D: BlockDevice>(
    cache: &Cache<D>,
    freemap: &dyn FreeMap,
    sector: u32,
    length: u64,
    is_dir: bool,
    parent: u32,
) -> FsResult<()> {
    let mut disk = DiskInode {
        direct: [0; DIRECT_COUNT],
        indirect: 0,
        doubly_indirect: 0,
        length: 0,
        magic: INODE_MAGIC,
        is_dir: is_dir as i32,
        parent,
    };
    let sectors_needed = ((length + SECTOR_SIZE as u64 - 1) / SECTOR_SIZE as u64) as usize;
    let achieved = ensure_allocated(cache, freemap, &mut disk, sectors_needed)?;
    if (achieved as u64) * SECTOR_SIZE as u64 < length {
        return Err(FsError::NoSpace);
    }
    disk.length = length as i32;
    cache.write(sector, disk.as_bytes(), 0, SECTOR_SIZE)?;
    Ok(())
}

/// The singleton in-memory inode table: one [`InodeInner`] per open sector.
pub struct OpenInodeTable<D: BlockDevice> {
    entries: Mutex<HashMap<u32, Weak<Mutex<InodeInner>>>>,
    cache: Arc<Cache<D>>,
    freemap: Arc<dyn FreeMap>,
}

impl<D: BlockDevice> OpenInodeTable<D> {
    pub fn new(cache: Arc<Cache<D>>, freemap: Arc<dyn FreeMap>) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            cache,
            freemap,
        })
    }

    pub fn open(self: &Arc<Self>, sector: u32) -> FsResult<Inode<D>> {
        let mut entries = self.entries.lock().unwrap();

        if let Some(weak) = entries.get(&sector) {
            if let Some(inner) = weak.upgrade() {
                inner.lock().unwrap().open_count += 1;
                return Ok(Inode {
                    sector,
                    inner,
                    cache: self.cache.clone(),
                    freemap: self.freemap.clone(),
                    table: self.clone(),
                });
            }
        }

        let mut raw = [0u8; SECTOR_SIZE];
        self.cache.read(sector, &mut raw, 0, SECTOR_SIZE)?;
        let disk = DiskInode::read_from(&raw[..]).expect("sector-sized buffer");
        debug_assert_eq!(disk.magic, INODE_MAGIC, "inode at sector {sector} has bad magic");

        let inner = Arc::new(Mutex::new(InodeInner {
            open_count: 1,
            removed: false,
            deny_write_count: 0,
            disk,
        }));
        entries.insert(sector, Arc::downgrade(&inner));
        Ok(Inode {
            sector,
            inner,
            cache: self.cache.clone(),
            freemap: self.freemap.clone(),
            table: self.clone(),
        })
    }

    /// Drop the table's entry for `sector`. Called once the last handle's
    /// open count has reached zero under its own lock; the `Weak` left
    /// behind is already unusable at that point; we'd never observe its
    /// strong count as anything but 1 here, since the caller's own `Arc`
    /// field has not yet been dropped; so remove unconditionally rather
    /// than re-check upgradability.
    fn forget(&self, sector: u32) {
        let mut entries = self.entries.lock().unwrap();
        entries.remove(&sector);
    }
}

/// A live handle to an in-memory inode. Cloning the handle is done via
/// [`Inode::reopen`], which bumps the shared open count; dropping the last
/// handle writes back (or, if removed, releases) the inode.
pub struct Inode<D: BlockDevice> {
    sector: u32,
    inner: Arc<Mutex<InodeInner>>,
    cache: Arc<Cache<D>>,
    freemap: Arc<dyn FreeMap>,
    table: Arc<OpenInodeTable<D>>,
}

impl<D: BlockDevice> Inode<D> {
    pub fn reopen(&self) -> Inode<D> {
        self.inner.lock().unwrap().open_count += 1;
        Inode {
            sector: self.sector,
            inner: self.inner.clone(),
            cache: self.cache.clone(),
            freemap: self.freemap.clone(),
            table: self.table.clone(),
        }
    }

    pub fn inumber(&self) -> u32 {
        self.sector
    }

    /// Number of live handles to this in-memory inode, across every
    /// directory and file handle that currently holds one via [`reopen`](Inode::reopen)
    /// or [`OpenInodeTable::open`].
    pub fn open_count(&self) -> u32 {
        self.inner.lock().unwrap().open_count
    }

    pub fn len(&self) -> u64 {
        self.inner.lock().unwrap().disk.length as u64
    }

    pub fn is_dir(&self) -> bool {
        self.inner.lock().unwrap().disk.is_dir != 0
    }

    pub fn set_dir(&self, value: bool) -> FsResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.disk.is_dir = value as i32;
        self.persist(&inner)
    }

    pub fn parent(&self) -> u32 {
        self.inner.lock().unwrap().disk.parent
    }

    pub fn set_parent(&self, sector: u32) -> FsResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.disk.parent = sector;
        self.persist(&inner)
    }

    pub fn mark_removed(&self) {
        self.inner.lock().unwrap().removed = true;
    }

    pub fn deny_write(&self) {
        self.inner.lock().unwrap().deny_write_count += 1;
    }

    pub fn allow_write(&self) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.deny_write_count > 0, "allow_write without matching deny_write");
        inner.deny_write_count = inner.deny_write_count.saturating_sub(1);
    }

    fn persist(&self, inner: &InodeInner) -> FsResult<()> {
        self.cache.write(self.sector, inner.disk.as_bytes(), 0, SECTOR_SIZE)
    }

    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        let inner = self.inner.lock().unwrap();
        let length = inner.disk.length as u64;
        if offset >= length || buf.is_empty() {
            return Ok(0);
        }
        let end = (offset + buf.len() as u64).min(length);
        let mut total = 0usize;
        let mut pos = offset;
        while pos < end {
            let sector_off = (pos % SECTOR_SIZE as u64) as usize;
            let chunk = ((end - pos).min((SECTOR_SIZE - sector_off) as u64)) as usize;
            match byte_to_sector(&self.cache, &inner.disk, pos)? {
                Some(sector) => {
                    self.cache.read(sector, &mut buf[total..total + chunk], sector_off, chunk)?
                }
                None => buf[total..total + chunk].fill(0),
            }
            total += chunk;
            pos += chunk as u64;
        }
        Ok(total)
    }

    pub fn write_at(&self, buf: &[u8], offset: u64) -> FsResult<usize> {
        let mut inner = self.inner.lock().unwrap();
        if inner.deny_write_count > 0 {
            return Ok(0);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let requested_end = offset.saturating_add(buf.len() as u64).min(MAX_FILE_BYTES);
        if requested_end > inner.disk.length as u64 {
            let sectors_needed =
                ((requested_end + SECTOR_SIZE as u64 - 1) / SECTOR_SIZE as u64) as usize;
            let achieved = ensure_allocated(&self.cache, &*self.freemap, &mut inner.disk, sectors_needed)?;
            let achieved_len = ((achieved as u64) * SECTOR_SIZE as u64).min(requested_end);
            if achieved_len > inner.disk.length as u64 {
                inner.disk.length = achieved_len as i32;
                self.persist(&inner)?;
            }
        }

        let end = requested_end.min(inner.disk.length as u64);
        if end <= offset {
            return Ok(0);
        }

        let mut total = 0usize;
        let mut pos = offset;
        while pos < end {
            let sector_off = (pos % SECTOR_SIZE as u64) as usize;
            let chunk = ((end - pos).min((SECTOR_SIZE - sector_off) as u64)) as usize;
            let sector = byte_to_sector(&self.cache, &inner.disk, pos)?
                .expect("sector allocated by growth above");
            self.cache.write(sector, &buf[total..total + chunk], sector_off, chunk)?;
            total += chunk;
            pos += chunk as u64;
        }
        Ok(total)
    }
}

impl<D: BlockDevice> Drop for Inode<D> {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        inner.open_count = inner.open_count.saturating_sub(1);
        if inner.open_count == 0 {
            if inner.removed {
                if let Err(err) = release_blocks(&self.cache, &*self.freemap, &inner.disk) {
                    log::error!("inode {}: failed to release blocks: {err}", self.sector);
                }
                self.freemap.release(self.sector, 1);
            }
            drop(inner);
            self.table.forget(self.sector);
        }
    }
}

fn read_indirect_entry<D: BlockDevice>(
    cache: &Cache<D>,
    block_sector: u32,
    idx: usize,
) -> FsResult<Option<u32>> {
    if block_sector == 0 {
        return Ok(None);
    }
    let mut raw = [0u8; SECTOR_SIZE];
    cache.read(block_sector, &mut raw, 0, SECTOR_SIZE)?;
    let block = IndirectBlock::read_from(&raw[..]).expect("sector-sized buffer");
    let s = block.entries[idx];
    Ok(if s == 0 { None } else { Some(s) })
}

fn byte_to_sector<D: BlockDevice>(cache: &Cache<D>, disk: &DiskInode, pos: u64) -> FsResult<Option<u32>> {
    let idx = (pos / SECTOR_SIZE as u64) as usize;
    if idx < DIRECT_COUNT {
        let s = disk.direct[idx];
        return Ok(if s == 0 { None } else { Some(s) });
    }
    let idx = idx - DIRECT_COUNT;
    if idx < PTRS_PER_BLOCK {
        return read_indirect_entry(cache, disk.indirect, idx);
    }
    let idx = idx - PTRS_PER_BLOCK;
    if idx < PTRS_PER_BLOCK * PTRS_PER_BLOCK {
        let outer = idx / PTRS_PER_BLOCK;
        let inner = idx % PTRS_PER_BLOCK;
        return match read_indirect_entry(cache, disk.doubly_indirect, outer)? {
            Some(indirect_sector) => read_indirect_entry(cache, indirect_sector, inner),
            None => Ok(None),
        };
    }
    Ok(None)
}

/// Allocate data sectors (and any index sectors they require) so that the
/// first `sectors_needed` sectors of the file exist, zero-filling each new
/// sector. Returns the number of sectors now present starting from index 0
/// — this is `sectors_needed` on full success, or fewer if the free map ran
/// out partway through; only device/allocator errors other than exhaustion
/// are propagated as `Err`.
fn ensure_allocated<D: BlockDevice>(
    cache: &Cache<D>,
    freemap: &dyn FreeMap,
    disk: &mut DiskInode,
    sectors_needed: usize,
) -> FsResult<usize> {
    let direct_want = sectors_needed.min(DIRECT_COUNT);
    let direct_got = ensure_direct(cache, freemap, disk, direct_want)?;
    if direct_got < direct_want || sectors_needed <= DIRECT_COUNT {
        return Ok(direct_got);
    }

    if disk.indirect == 0 {
        match freemap.allocate(1) {
            Ok(s) => {
                cache.zero(s)?;
                disk.indirect = s;
            }
            Err(FsError::NoSpace) => return Ok(DIRECT_COUNT),
            Err(e) => return Err(e),
        }
    }
    let indirect_want = (sectors_needed - DIRECT_COUNT).min(PTRS_PER_BLOCK);
    let indirect_got = ensure_indirect_filled(cache, freemap, disk.indirect, indirect_want)?;
    if indirect_got < indirect_want || sectors_needed <= DIRECT_COUNT + PTRS_PER_BLOCK {
        return Ok(DIRECT_COUNT + indirect_got);
    }

    if disk.doubly_indirect == 0 {
        match freemap.allocate(1) {
            Ok(s) => {
                cache.zero(s)?;
                disk.doubly_indirect = s;
            }
            Err(FsError::NoSpace) => return Ok(DIRECT_COUNT + PTRS_PER_BLOCK),
            Err(e) => return Err(e),
        }
    }
    let doubly_want = sectors_needed - DIRECT_COUNT - PTRS_PER_BLOCK;
    let doubly_got = ensure_doubly_filled(cache, freemap, disk.doubly_indirect, doubly_want)?;
    Ok(DIRECT_COUNT + PTRS_PER_BLOCK + doubly_got)
}

fn ensure_direct<D: BlockDevice>(
    cache: &Cache<D>,
    freemap: &dyn FreeMap,
    disk: &mut DiskInode,
    want: usize,
) -> FsResult<usize> {
    for idx in 0..want {
        if disk.direct[idx] == 0 {
            match freemap.allocate(1) {
                Ok(s) => {
                    cache.zero(s)?;
                    disk.direct[idx] = s;
                }
                Err(FsError::NoSpace) => return Ok(idx),
                Err(e) => return Err(e),
            }
        }
    }
    Ok(want)
}

fn ensure_indirect_filled<D: BlockDevice>(
    cache: &Cache<D>,
    freemap: &dyn FreeMap,
    block_sector: u32,
    want: usize,
) -> FsResult<usize> {
    let mut raw = [0u8; SECTOR_SIZE];
    cache.read(block_sector, &mut raw, 0, SECTOR_SIZE)?;
    let mut block = IndirectBlock::read_from(&raw[..]).expect("sector-sized buffer");
    let mut changed = false;
    let mut got = 0usize;
    for i in 0..want {
        if block.entries[i] == 0 {
            match freemap.allocate(1) {
                Ok(s) => {
                    cache.zero(s)?;
                    block.entries[i] = s;
                    changed = true;
                }
                Err(FsError::NoSpace) => break,
                Err(e) => {
                    if changed {
                        cache.write(block_sector, block.as_bytes(), 0, SECTOR_SIZE)?;
                    }
                    return Err(e);
                }
            }
        }
        got = i + 1;
    }
    if changed {
        cache.write(block_sector, block.as_bytes(), 0, SECTOR_SIZE)?;
    }
    Ok(got)
}

fn ensure_doubly_filled<D: BlockDevice>(
    cache: &Cache<D>,
    freemap: &dyn FreeMap,
    block_sector: u32,
    want: usize,
) -> FsResult<usize> {
    let full = want / PTRS_PER_BLOCK;
    let remainder = want % PTRS_PER_BLOCK;
    let outer_count = full + if remainder > 0 { 1 } else { 0 };

    let mut raw = [0u8; SECTOR_SIZE];
    cache.read(block_sector, &mut raw, 0, SECTOR_SIZE)?;
    let mut outer = IndirectBlock::read_from(&raw[..]).expect("sector-sized buffer");
    let mut outer_changed = false;
    let mut achieved = 0usize;

    for o in 0..outer_count {
        if outer.entries[o] == 0 {
            match freemap.allocate(1) {
                Ok(s) => {
                    cache.zero(s)?;
                    outer.entries[o] = s;
                    outer_changed = true;
                }
                Err(FsError::NoSpace) => break,
                Err(e) => {
                    if outer_changed {
                        cache.write(block_sector, outer.as_bytes(), 0, SECTOR_SIZE)?;
                    }
                    return Err(e);
                }
            }
        }
        let this_want = if o < full { PTRS_PER_BLOCK } else { remainder };
        let got = ensure_indirect_filled(cache, freemap, outer.entries[o], this_want)?;
        achieved += got;
        if got < this_want {
            break;
        }
    }
    if outer_changed {
        cache.write(block_sector, outer.as_bytes(), 0, SECTOR_SIZE)?;
    }
    Ok(achieved)
}

fn release_indirect<D: BlockDevice>(cache: &Cache<D>, freemap: &dyn FreeMap, block_sector: u32) -> FsResult<()> {
    let mut raw = [0u8; SECTOR_SIZE];
    cache.read(block_sector, &mut raw, 0, SECTOR_SIZE)?;
    let block = IndirectBlock::read_from(&raw[..]).expect("sector-sized buffer");
    for &s in block.entries.iter() {
        if s != 0 {
            freemap.release(s, 1);
        }
    }
    Ok(())
}

fn release_blocks<D: BlockDevice>(cache: &Cache<D>, freemap: &dyn FreeMap, disk: &DiskInode) -> FsResult<()> {
    for &s in disk.direct.iter() {
        if s != 0 {
            freemap.release(s, 1);
        }
    }
    if disk.indirect != 0 {
        release_indirect(cache, freemap, disk.indirect)?;
        freemap.release(disk.indirect, 1);
    }
    if disk.doubly_indirect != 0 {
        let mut raw = [0u8; SECTOR_SIZE];
        cache.read(disk.doubly_indirect, &mut raw, 0, SECTOR_SIZE)?;
        let outer = IndirectBlock::read_from(&raw[..]).expect("sector-sized buffer");
        for &indirect in outer.entries.iter() {
            if indirect != 0 {
                release_indirect(cache, freemap, indirect)?;
                freemap.release(indirect, 1);
            }
        }
        freemap.release(disk.doubly_indirect, 1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;
    use crate::freemap::BitmapFreeMap;

    fn test_fs() -> (Arc<Cache<MemBlockDevice>>, Arc<dyn FreeMap>, Arc<OpenInodeTable<MemBlockDevice>>) {
        let dev = Arc::new(MemBlockDevice::new(20_000));
        let cache = Arc::new(Cache::new(dev));
        let freemap: Arc<dyn FreeMap> = Arc::new(BitmapFreeMap::new(cache.clone(), 0, 100, 19_900));
        let table = OpenInodeTable::new(cache.clone(), freemap.clone());
        (cache, freemap, table)
    }

    #[test]
    fn max_file_bytes_matches_component_counts() {
        assert_eq!(
            MAX_FILE_SECTORS,
            (122 + 128 + 128 * 128) as u64
        );
        assert_eq!(MAX_FILE_BYTES, MAX_FILE_SECTORS * 512);
    }

    #[test]
    fn create_open_read_write_round_trip() {
        let (cache, freemap, table) = test_fs();
        create_inode(&cache, &*freemap, 10, 0, false, 2).unwrap();
        let inode = table.open(10).unwrap();
        let data = b"hello inode layer";
        let written = inode.write_at(data, 0).unwrap();
        assert_eq!(written, data.len());
        let mut buf = vec![0u8; data.len()];
        let read = inode.read_at(&mut buf, 0).unwrap();
        assert_eq!(read, data.len());
        assert_eq!(&buf, data);
    }

    #[test]
    fn sparse_growth_zero_fills_hole() {
        let (cache, freemap, table) = test_fs();
        create_inode(&cache, &*freemap, 11, 0, false, 2).unwrap();
        let inode = table.open(11).unwrap();
        inode.write_at(&[1u8], 60_000).unwrap();
        assert_eq!(inode.len(), 60_001);
        let mut buf = vec![0xffu8; 60_000];
        let read = inode.read_at(&mut buf, 0).unwrap();
        assert_eq!(read, 60_000);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn doubly_indirect_range_persists_across_reopen() {
        let (cache, freemap, table) = test_fs();
        create_inode(&cache, &*freemap, 12, 0, false, 2).unwrap();
        {
            let inode = table.open(12).unwrap();
            inode.write_at(&[42u8], 4_000_000).unwrap();
            assert_eq!(inode.len(), 4_000_001);
        }
        let inode = table.open(12).unwrap();
        let mut buf = [0u8; 1];
        inode.read_at(&mut buf, 4_000_000).unwrap();
        assert_eq!(buf, [42u8]);
    }

    #[test]
    fn single_in_memory_inode_per_open_sector() {
        let (cache, freemap, table) = test_fs();
        create_inode(&cache, &*freemap, 13, 0, false, 2).unwrap();
        let a = table.open(13).unwrap();
        let b = table.open(13).unwrap();
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
    }

    #[test]
    fn forget_drops_table_entry_on_last_close() {
        let (cache, freemap, table) = test_fs();
        create_inode(&cache, &*freemap, 15, 0, false, 2).unwrap();
        let a = table.open(15).unwrap();
        let b = table.open(15).unwrap();
        assert_eq!(table.entries.lock().unwrap().len(), 1);
        drop(a);
        assert_eq!(table.entries.lock().unwrap().len(), 1, "one handle still open");
        drop(b);
        assert_eq!(table.entries.lock().unwrap().len(), 0, "table entry must not leak past last close");
    }

    #[test]
    fn deny_write_rejects_second_writer() {
        let (cache, freemap, table) = test_fs();
        create_inode(&cache, &*freemap, 14, 0, false, 2).unwrap();
        let a = table.open(14).unwrap();
        let b = table.open(14).unwrap();
        a.deny_write();
        assert_eq!(b.write_at(&[1, 2, 3], 0).unwrap(), 0);
        a.allow_write();
        assert_eq!(b.write_at(&[1, 2, 3], 0).unwrap(), 3);
    }
}
