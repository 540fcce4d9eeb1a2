//! Free-map allocator.
//!
//! Tracks which data sectors are in use via a bitmap stored in its own
//! sectors, read and written through the same [`crate::cache::Cache`] every
//! other subsystem uses — there is no separate fast path to the device.

use std::sync::{Arc, Mutex};

use crate::cache::Cache;
use crate::device::BlockDevice;
use crate::error::{FsError, FsResult};

pub(crate) const BITS_PER_SECTOR: u32 = 512 * 8;

pub trait FreeMap: Send + Sync {
    /// Allocate `cnt` contiguously-numbered data sectors, returning the
    /// first. Sectors are tracked one bit at a time internally; callers
    /// should not assume any particular physical locality beyond the
    /// contiguous numbering.
    fn allocate(&self, cnt: u32) -> FsResult<u32>;

    /// Return `cnt` sectors starting at `sector` to the pool.
    fn release(&self, sector: u32, cnt: u32);
}

pub struct BitmapFreeMap<D: BlockDevice> {
    cache: Arc<Cache<D>>,
    bitmap_start: u32,
    data_start: u32,
    data_sectors: u32,
    lock: Mutex<()>,
}

impl<D: BlockDevice> BitmapFreeMap<D> {
    pub fn new(cache: Arc<Cache<D>>, bitmap_start: u32, data_start: u32, data_sectors: u32) -> Self {
        Self {
            cache,
            bitmap_start,
            data_start,
            data_sectors,
            lock: Mutex::new(()),
        }
    }

    fn get_bit(&self, bit: u32) -> FsResult<bool> {
        let sector = self.bitmap_start + bit / BITS_PER_SECTOR;
        let within = bit % BITS_PER_SECTOR;
        let byte_off = (within / 8) as usize;
        let bit_off = within % 8;
        let mut byte = [0u8; 1];
        self.cache.read(sector, &mut byte, byte_off, 1)?;
        Ok(byte[0] & (1 << bit_off) != 0)
    }

    fn set_bit(&self, bit: u32, value: bool) -> FsResult<()> {
        let sector = self.bitmap_start + bit / BITS_PER_SECTOR;
        let within = bit % BITS_PER_SECTOR;
        let byte_off = (within / 8) as usize;
        let bit_off = within % 8;
        let mut byte = [0u8; 1];
        self.cache.read(sector, &mut byte, byte_off, 1)?;
        if value {
            byte[0] |= 1 << bit_off;
        } else {
            byte[0] &= !(1 << bit_off);
        }
        self.cache.write(sector, &byte, byte_off, 1)?;
        Ok(())
    }
}

impl<D: BlockDevice> FreeMap for BitmapFreeMap<D> {
    fn allocate(&self, cnt: u32) -> FsResult<u32> {
        if cnt == 0 {
            return Err(FsError::InvalidPath("allocate: zero-length request".into()));
        }
        let _guard = self.lock.lock().unwrap();

        let mut run_start = 0u32;
        let mut run_len = 0u32;
        for bit in 0..self.data_sectors {
            if !self.get_bit(bit)? {
                if run_len == 0 {
                    run_start = bit;
                }
                run_len += 1;
                if run_len == cnt {
                    for b in run_start..run_start + cnt {
                        self.set_bit(b, true)?;
                    }
                    return Ok(self.data_start + run_start);
                }
            } else {
                run_len = 0;
            }
        }
        Err(FsError::NoSpace)
    }

    fn release(&self, sector: u32, cnt: u32) {
        let _guard = self.lock.lock().unwrap();
        let start_bit = sector - self.data_start;
        for b in start_bit..start_bit + cnt {
            if let Err(err) = self.set_bit(b, false) {
                log::error!("free map: failed to release bit {b}: {err}");
            }
        }
    }
}
