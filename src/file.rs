//! File handles: a position cursor layered over an open inode.

use crate::device::BlockDevice;
use crate::error::FsResult;
use crate::inode::Inode;

pub struct FileHandle<D: BlockDevice> {
    inode: Inode<D>,
    position: u64,
}

impl<D: BlockDevice> FileHandle<D> {
    pub fn new(inode: Inode<D>) -> Self {
        Self { inode, position: 0 }
    }

    pub fn inode(&self) -> &Inode<D> {
        &self.inode
    }

    pub fn tell(&self) -> u64 {
        self.position
    }

    pub fn seek(&mut self, position: u64) {
        self.position = position;
    }

    pub fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        let n = self.inode.read_at(buf, self.position)?;
        self.position += n as u64;
        Ok(n)
    }

    pub fn write(&mut self, buf: &[u8]) -> FsResult<usize> {
        let n = self.inode.write_at(buf, self.position)?;
        self.position += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::device::MemBlockDevice;
    use crate::freemap::{BitmapFreeMap, FreeMap};
    use crate::inode::{create_inode, OpenInodeTable};
    use std::sync::Arc;

    #[test]
    fn write_advances_position_and_read_follows() {
        let dev = Arc::new(MemBlockDevice::new(200));
        let cache = Arc::new(Cache::new(dev));
        let freemap: Arc<dyn FreeMap> = Arc::new(BitmapFreeMap::new(cache.clone(), 0, 20, 180));
        let table = OpenInodeTable::new(cache.clone(), freemap.clone());
        create_inode(&cache, &*freemap, 5, 0, false, 0).unwrap();

        let mut handle = FileHandle::new(table.open(5).unwrap());
        assert_eq!(handle.write(b"abc").unwrap(), 3);
        assert_eq!(handle.tell(), 3);
        handle.seek(0);
        let mut buf = [0u8; 3];
        assert_eq!(handle.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"abc");
    }
}
