//! Directories: a directory is a file (inode with `is_dir` set) whose
//! content is a packed sequence of fixed-size entries. Entry position in
//! the file is persistent — [`Directory::remove`] clears `in_use` in place
//! rather than compacting, so concurrent readers never see entries move.

use std::sync::Arc;

use zerocopy::{AsBytes, FromBytes};

use crate::device::BlockDevice;
use crate::error::{FsError, FsResult};
use crate::inode::{Inode, OpenInodeTable};

pub const NAME_MAX: usize = 14;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, AsBytes)]
struct DiskDirEntry {
    inode_sector: u32,
    name: [u8; NAME_MAX + 1],
    in_use: u8,
}

const ENTRY_SIZE: usize = std::mem::size_of::<DiskDirEntry>();

pub struct Directory<D: BlockDevice> {
    inode: Inode<D>,
    table: Arc<OpenInodeTable<D>>,
    cursor: u64,
}

impl<D: BlockDevice> Directory<D> {
    pub fn new(inode: Inode<D>, table: Arc<OpenInodeTable<D>>) -> Self {
        Self {
            inode,
            table,
            cursor: 0,
        }
    }

    pub fn inode(&self) -> &Inode<D> {
        &self.inode
    }

    pub fn reopen(&self) -> Directory<D> {
        Directory {
            inode: self.inode.reopen(),
            table: self.table.clone(),
            cursor: 0,
        }
    }

    fn entry_count(&self) -> u64 {
        self.inode.len() / ENTRY_SIZE as u64
    }

    fn read_entry(&self, index: u64) -> FsResult<Option<DiskDirEntry>> {
        let offset = index * ENTRY_SIZE as u64;
        if offset >= self.inode.len() {
            return Ok(None);
        }
        let mut raw = [0u8; ENTRY_SIZE];
        let n = self.inode.read_at(&mut raw, offset)?;
        if n < ENTRY_SIZE {
            return Ok(None);
        }
        Ok(Some(DiskDirEntry::read_from(&raw[..]).expect("entry-sized buffer")))
    }

    fn write_entry(&self, index: u64, entry: &DiskDirEntry) -> FsResult<()> {
        let offset = index * ENTRY_SIZE as u64;
        self.inode.write_at(entry.as_bytes(), offset)?;
        Ok(())
    }

    /// Linear scan by name; `.` and `..` are handled by the caller (path
    /// resolution), not stored as entries here.
    pub fn lookup(&self, name: &str) -> FsResult<Option<Inode<D>>> {
        validate_name(name)?;
        for i in 0..self.entry_count() {
            if let Some(e) = self.read_entry(i)? {
                if e.in_use != 0 && entry_name(&e) == name {
                    return Ok(Some(self.table.open(e.inode_sector)?));
                }
            }
        }
        Ok(None)
    }

    /// Fill the first free slot, or append if none exists.
    pub fn add(&self, name: &str, inode_sector: u32) -> FsResult<()> {
        validate_name(name)?;
        if self.lookup(name)?.is_some() {
            return Err(FsError::InvalidPath(format!("{name} already exists")));
        }
        let count = self.entry_count();
        let mut slot = None;
        for i in 0..count {
            if let Some(e) = self.read_entry(i)? {
                if e.in_use == 0 {
                    slot = Some(i);
                    break;
                }
            }
        }
        let index = slot.unwrap_or(count);
        self.write_entry(index, &make_entry(name, inode_sector))
    }

    /// Remove `name`. A directory fails with `Busy` if it is non-empty or
    /// open elsewhere (open count > 1 once this lookup's own handle is
    /// counted); a file has no such restriction and is unlinked immediately,
    /// with its blocks released on the last close of any handle still open
    /// on it.
    pub fn remove(&self, name: &str) -> FsResult<()> {
        validate_name(name)?;
        for i in 0..self.entry_count() {
            if let Some(mut e) = self.read_entry(i)? {
                if e.in_use == 0 || entry_name(&e) != name {
                    continue;
                }
                let target = self.table.open(e.inode_sector)?;
                if target.is_dir() {
                    if target.open_count() > 1 {
                        return Err(FsError::Busy(format!("{name} is open elsewhere")));
                    }
                    let dir = Directory::new(target.reopen(), self.table.clone());
                    if !dir.is_empty()? {
                        return Err(FsError::Busy(format!("{name} is not empty")));
                    }
                }
                e.in_use = 0;
                self.write_entry(i, &e)?;
                target.mark_removed();
                return Ok(());
            }
        }
        Err(FsError::InvalidPath(format!("{name} not found")))
    }

    pub fn is_empty(&self) -> FsResult<bool> {
        for i in 0..self.entry_count() {
            if let Some(e) = self.read_entry(i)? {
                if e.in_use != 0 {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Advance the cursor to the next in-use entry. Never yields `.` or
    /// `..`, since those are not materialized as entries.
    pub fn read_dir(&mut self) -> FsResult<Option<String>> {
        loop {
            let index = self.cursor;
            if index >= self.entry_count() {
                return Ok(None);
            }
            self.cursor += 1;
            if let Some(e) = self.read_entry(index)? {
                if e.in_use != 0 {
                    return Ok(Some(entry_name(&e)));
                }
            }
        }
    }
}

fn entry_name(e: &DiskDirEntry) -> String {
    let end = e.name.iter().position(|&b| b == 0).unwrap_or(e.name.len());
    String::from_utf8_lossy(&e.name[..end]).into_owned()
}

fn make_entry(name: &str, inode_sector: u32) -> DiskDirEntry {
    let mut raw = [0u8; NAME_MAX + 1];
    let bytes = name.as_bytes();
    raw[..bytes.len()].copy_from_slice(bytes);
    DiskDirEntry {
        inode_sector,
        name: raw,
        in_use: 1,
    }
}

fn validate_name(name: &str) -> FsResult<()> {
    if name.is_empty() || name.len() > NAME_MAX || name.contains('/') {
        return Err(FsError::InvalidPath(format!("invalid directory entry name: {name:?}")));
    }
    Ok(())
}
