#![forbid(unsafe_code)]
//! Backing storage for the permafrost region cache.
//!
//! `SharedBytes` owns a single preallocated file divided into fixed-size
//! regions and hands out [`RegionChannel`]s doing bounds-checked positional
//! I/O within one region. Contents never survive a restart; the file is
//! truncated on open.

use pf_error::{CacheError, Result};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, trace};

/// File name of the backing store inside the cache directory.
pub const SHARED_CACHE_FILE: &str = "shared_regions.cache";

/// Fixed-size, region-partitioned backing file.
#[derive(Debug, Clone)]
pub struct SharedBytes {
    file: Arc<File>,
    closed: Arc<AtomicBool>,
    num_regions: usize,
    region_size: u64,
    path: PathBuf,
}

impl SharedBytes {
    /// Creates (or truncates) the backing file at `dir/`[`SHARED_CACHE_FILE`]
    /// and sizes it to exactly `num_regions * region_size` bytes.
    pub fn create(dir: &Path, num_regions: usize, region_size: u64) -> Result<Self> {
        if region_size == 0 {
            return Err(CacheError::Configuration(
                "region size must be greater than zero".to_owned(),
            ));
        }
        let total = (num_regions as u64).checked_mul(region_size).ok_or_else(|| {
            CacheError::Configuration(format!(
                "cache of {num_regions} regions x {region_size} bytes overflows u64"
            ))
        })?;
        let path = dir.join(SHARED_CACHE_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(total)?;
        info!(
            target: "pf::bytes",
            event = "backing_file_created",
            path = %path.display(),
            num_regions,
            region_size,
            total_bytes = total
        );
        Ok(Self {
            file: Arc::new(file),
            closed: Arc::new(AtomicBool::new(false)),
            num_regions,
            region_size,
            path,
        })
    }

    #[must_use]
    pub fn num_regions(&self) -> usize {
        self.num_regions
    }

    #[must_use]
    pub fn region_size(&self) -> u64 {
        self.region_size
    }

    #[must_use]
    pub fn total_len(&self) -> u64 {
        self.num_regions as u64 * self.region_size
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Channel over the physical slot `slot`.
    ///
    /// Panics when `slot` is out of range. Re-use of a slot after eviction is
    /// safe: readers must hold a reference on the owning region.
    #[must_use]
    pub fn channel(&self, slot: usize) -> RegionChannel {
        assert!(
            slot < self.num_regions,
            "slot {slot} out of range for {} regions",
            self.num_regions
        );
        RegionChannel {
            file: Arc::clone(&self.file),
            closed: Arc::clone(&self.closed),
            base: slot as u64 * self.region_size,
            len: self.region_size,
        }
    }

    /// Marks the backing file closed. Subsequent channel I/O fails with
    /// `AlreadyClosed`; the handle itself is released once all channels drop.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(
                target: "pf::bytes",
                event = "backing_file_closed",
                path = %self.path.display()
            );
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Random-access window over one physical region of the backing file.
///
/// Positions are region-local; all accesses are bounds-checked against the
/// region length.
#[derive(Debug, Clone)]
pub struct RegionChannel {
    file: Arc<File>,
    closed: Arc<AtomicBool>,
    base: u64,
    len: u64,
}

impl RegionChannel {
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn checked_offset(&self, position: u64, len: usize) -> Result<u64> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CacheError::AlreadyClosed);
        }
        let end = position
            .checked_add(len as u64)
            .ok_or_else(|| oob("range overflows u64", position, len, self.len))?;
        if end > self.len {
            return Err(oob("access beyond region", position, len, self.len));
        }
        Ok(self.base + position)
    }

    /// Reads up to `buf.len()` bytes at the region-local `position`,
    /// returning the byte count.
    pub fn read_at(&self, buf: &mut [u8], position: u64) -> Result<usize> {
        let offset = self.checked_offset(position, buf.len())?;
        let read = self.file.read_at(buf, offset)?;
        trace!(
            target: "pf::bytes",
            event = "region_read",
            position,
            requested = buf.len(),
            read
        );
        Ok(read)
    }

    /// Reads exactly `buf.len()` bytes at the region-local `position`.
    pub fn read_exact_at(&self, buf: &mut [u8], position: u64) -> Result<()> {
        let offset = self.checked_offset(position, buf.len())?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    /// Writes all of `buf` at the region-local `position`.
    pub fn write_all_at(&self, buf: &[u8], position: u64) -> Result<()> {
        let offset = self.checked_offset(position, buf.len())?;
        self.file.write_all_at(buf, offset)?;
        trace!(
            target: "pf::bytes",
            event = "region_write",
            position,
            written = buf.len()
        );
        Ok(())
    }
}

fn oob(reason: &str, position: u64, len: usize, region_len: u64) -> CacheError {
    CacheError::Io(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("{reason}: position={position} len={len} region_len={region_len}"),
    ))
}
