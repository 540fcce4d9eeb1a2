//! Top-level file system service object: owns the cache, free map, and
//! open-inode table, and wires them together into `create`/`open`/`remove`/
//! `mkdir`/`chdir`-shaped operations over a [`BlockDevice`].
//!
//! Deliberately not a collection of global statics: every collaborator is
//! an explicitly constructed field here, passed to `Directory`/`Inode`
//! handles by `Arc`, so a test can spin up as many independent file systems
//! as it likes against independent `MemBlockDevice`s.

use std::sync::Arc;

use crate::cache::{Cache, CacheStats};
use crate::device::BlockDevice;
use crate::dir::{Directory, NAME_MAX};
use crate::error::{FsError, FsResult};
use crate::file::FileHandle;
use crate::freemap::{BitmapFreeMap, FreeMap, BITS_PER_SECTOR};
use crate::inode::{create_inode, Inode, OpenInodeTable};

/// Sector 0 is the boot sector; the free-map bitmap's raw data starts
/// immediately after it, at sector 1.
const BITMAP_START_SECTOR: u32 = 1;

/// Sector layout: boot, then the free-map bitmap (sized by the fixed-point
/// loop below), then the root directory inode immediately after the
/// bitmap, then data. This is a fixed point of the bitmap-sizing equation
/// so `format` and `mount` always agree without needing a persisted
/// superblock. For any device small enough that the bitmap fits in its one
/// minimum sector, `root_dir_sector` comes out to 2, matching the common
/// case; it floats forward for a device large enough to need more.
fn layout(total_sectors: u32) -> (u32, u32, u32, u32) {
    let mut bitmap_sectors = 1u32;
    loop {
        let root_dir_sector = BITMAP_START_SECTOR + bitmap_sectors;
        let data_start = root_dir_sector + 1;
        let data_sectors = total_sectors.saturating_sub(data_start);
        let needed = ((data_sectors + BITS_PER_SECTOR - 1) / BITS_PER_SECTOR).max(1);
        if needed == bitmap_sectors {
            return (BITMAP_START_SECTOR, root_dir_sector, data_start, data_sectors);
        }
        bitmap_sectors = needed;
    }
}

pub struct Filesystem<D: BlockDevice> {
    cache: Arc<Cache<D>>,
    freemap: Arc<dyn FreeMap>,
    table: Arc<OpenInodeTable<D>>,
    root_dir_sector: u32,
}

impl<D: BlockDevice> Filesystem<D> {
    /// Lay down a fresh, empty file system: a zeroed free-map bitmap
    /// starting at sector 1, and a root directory in the sector right
    /// after it.
    pub fn format(device: Arc<D>) -> FsResult<Self> {
        let total = device.sector_count();
        let (bitmap_start, root_dir_sector, data_start, data_sectors) = layout(total);
        let cache = Arc::new(Cache::new(device));
        let freemap: Arc<dyn FreeMap> = Arc::new(BitmapFreeMap::new(
            cache.clone(),
            bitmap_start,
            data_start,
            data_sectors,
        ));
        let table = OpenInodeTable::new(cache.clone(), freemap.clone());
        create_inode(&cache, &*freemap, root_dir_sector, 0, true, root_dir_sector)?;
        log::info!("formatted file system: {data_sectors} data sectors available");
        Ok(Self { cache, freemap, table, root_dir_sector })
    }

    /// Mount an already-formatted device.
    pub fn mount(device: Arc<D>) -> FsResult<Self> {
        let total = device.sector_count();
        let (bitmap_start, root_dir_sector, data_start, data_sectors) = layout(total);
        let cache = Arc::new(Cache::new(device));
        let freemap: Arc<dyn FreeMap> = Arc::new(BitmapFreeMap::new(
            cache.clone(),
            bitmap_start,
            data_start,
            data_sectors,
        ));
        let table = OpenInodeTable::new(cache.clone(), freemap.clone());
        Ok(Self { cache, freemap, table, root_dir_sector })
    }

    pub fn root(&self) -> FsResult<Directory<D>> {
        Ok(Directory::new(self.table.open(self.root_dir_sector)?, self.table.clone()))
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn shutdown(&self) -> FsResult<()> {
        self.cache.shutdown()
    }

    /// Split `path` into a resolved parent directory and the last,
    /// unresolved component. A trailing slash (or an entirely empty path)
    /// means "this directory": the returned name is empty and the parent
    /// is the fully resolved target.
    pub fn resolve(&self, cwd: &Directory<D>, path: &str) -> FsResult<(Directory<D>, String)> {
        let mut current = if path.starts_with('/') {
            self.root()?
        } else {
            cwd.reopen()
        };

        let trimmed = path.trim_start_matches('/');
        if trimmed.is_empty() {
            return Ok((current, String::new()));
        }
        let trailing_slash = trimmed.ends_with('/');
        let components: Vec<&str> = trimmed.split('/').filter(|c| !c.is_empty()).collect();
        if components.is_empty() {
            return Ok((current, String::new()));
        }

        let split_at = if trailing_slash { components.len() } else { components.len() - 1 };
        for comp in &components[..split_at] {
            current = self.descend(&current, comp)?;
        }

        if trailing_slash {
            Ok((current, String::new()))
        } else {
            Ok((current, components[components.len() - 1].to_string()))
        }
    }

    fn descend(&self, dir: &Directory<D>, component: &str) -> FsResult<Directory<D>> {
        match component {
            "." => Ok(dir.reopen()),
            ".." => {
                let parent_sector = dir.inode().parent();
                if parent_sector == dir.inode().inumber() {
                    return Err(FsError::InvalidPath("root has no parent".into()));
                }
                Ok(Directory::new(self.table.open(parent_sector)?, self.table.clone()))
            }
            name => {
                if name.len() > NAME_MAX {
                    return Err(FsError::InvalidPath(format!("{name} exceeds NAME_MAX")));
                }
                let inode = dir
                    .lookup(name)?
                    .ok_or_else(|| FsError::InvalidPath(format!("{name} not found")))?;
                if !inode.is_dir() {
                    return Err(FsError::InvalidPath(format!("{name} is not a directory")));
                }
                Ok(Directory::new(inode, self.table.clone()))
            }
        }
    }

    pub fn mkdir(&self, cwd: &Directory<D>, path: &str) -> FsResult<()> {
        let (parent, name) = self.resolve(cwd, path)?;
        if name.is_empty() {
            return Err(FsError::InvalidPath("empty path".into()));
        }
        if parent.lookup(&name)?.is_some() {
            return Err(FsError::InvalidPath(format!("{name} already exists")));
        }
        let sector = self.freemap.allocate(1)?;
        if let Err(e) = create_inode(&self.cache, &*self.freemap, sector, 0, true, parent.inode().inumber()) {
            self.freemap.release(sector, 1);
            return Err(e);
        }
        if let Err(e) = parent.add(&name, sector) {
            self.freemap.release(sector, 1);
            return Err(e);
        }
        Ok(())
    }

    pub fn create(&self, cwd: &Directory<D>, path: &str) -> FsResult<()> {
        let (parent, name) = self.resolve(cwd, path)?;
        if name.is_empty() {
            return Err(FsError::InvalidPath("empty path".into()));
        }
        if parent.lookup(&name)?.is_some() {
            return Err(FsError::InvalidPath(format!("{name} already exists")));
        }
        let sector = self.freemap.allocate(1)?;
        if let Err(e) = create_inode(&self.cache, &*self.freemap, sector, 0, false, parent.inode().inumber()) {
            self.freemap.release(sector, 1);
            return Err(e);
        }
        if let Err(e) = parent.add(&name, sector) {
            self.freemap.release(sector, 1);
            return Err(e);
        }
        Ok(())
    }

    fn open_inode(&self, cwd: &Directory<D>, path: &str) -> FsResult<Inode<D>> {
        let (parent, name) = self.resolve(cwd, path)?;
        if name.is_empty() {
            return Ok(parent.inode().reopen());
        }
        parent.lookup(&name)?.ok_or_else(|| FsError::InvalidPath(format!("{name} not found")))
    }

    pub fn open(&self, cwd: &Directory<D>, path: &str) -> FsResult<FileHandle<D>> {
        let inode = self.open_inode(cwd, path)?;
        if inode.is_dir() {
            return Err(FsError::InvalidPath(format!("{path} is a directory")));
        }
        Ok(FileHandle::new(inode))
    }

    pub fn open_dir(&self, cwd: &Directory<D>, path: &str) -> FsResult<Directory<D>> {
        let inode = self.open_inode(cwd, path)?;
        if !inode.is_dir() {
            return Err(FsError::InvalidPath(format!("{path} is not a directory")));
        }
        Ok(Directory::new(inode, self.table.clone()))
    }

    pub fn remove(&self, cwd: &Directory<D>, path: &str) -> FsResult<()> {
        let (parent, name) = self.resolve(cwd, path)?;
        if name.is_empty() {
            return Err(FsError::InvalidPath("cannot remove root".into()));
        }
        parent.remove(&name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;

    fn new_fs() -> Filesystem<MemBlockDevice> {
        let dev = Arc::new(MemBlockDevice::new(4096));
        Filesystem::format(dev).unwrap()
    }

    #[test]
    fn root_directory_sits_at_sector_two_on_a_modest_device() {
        let (bitmap_start, root_dir_sector, data_start, _) = layout(4096);
        assert_eq!(bitmap_start, 1);
        assert_eq!(root_dir_sector, 2);
        assert_eq!(data_start, 3);
    }

    #[test]
    fn mkdir_and_path_traversal_with_dotdot() {
        let fs = new_fs();
        let root = fs.root().unwrap();
        fs.mkdir(&root, "/a").unwrap();
        let a = fs.open_dir(&root, "/a").unwrap();
        fs.mkdir(&a, "/a/b").unwrap();

        let b = fs.open_dir(&root, "/a/b").unwrap();
        let (up_two, name) = fs.resolve(&b, "../..").unwrap();
        assert_eq!(name, "");
        assert_eq!(up_two.inode().inumber(), root.inode().inumber());
    }

    #[test]
    fn mkdir_inside_b_then_remove_a_is_busy() {
        let fs = new_fs();
        let root = fs.root().unwrap();
        fs.mkdir(&root, "/a").unwrap();
        let a = fs.open_dir(&root, "/a").unwrap();
        fs.mkdir(&a, "/a/b").unwrap();
        let b = fs.open_dir(&root, "/a/b").unwrap();
        fs.mkdir(&b, "/a/b/c").unwrap();

        let err = fs.remove(&root, "/a").unwrap_err();
        assert!(matches!(err, FsError::Busy(_)));
    }

    #[test]
    fn create_file_write_close_reopen() {
        let fs = new_fs();
        let root = fs.root().unwrap();
        fs.create(&root, "/f").unwrap();
        {
            let mut handle = fs.open(&root, "/f").unwrap();
            assert_eq!(handle.write(b"abcdef").unwrap(), 6);
        }
        let mut handle = fs.open(&root, "/f").unwrap();
        let mut buf = [0u8; 6];
        assert_eq!(handle.read(&mut buf).unwrap(), 6);
        assert_eq!(&buf, b"abcdef");
    }
}
