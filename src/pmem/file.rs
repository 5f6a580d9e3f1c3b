use crate::pmem::Region;
use crate::sync::AtomicU64;
use core::fmt::{Debug, Formatter};
use nix::sys::mman::{mmap, msync, munmap, MapFlags, MsFlags, ProtFlags};
use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use tracing::debug;

/// A file mapped shared into memory. On a DAX file system the mapping is the persistent memory
/// itself; elsewhere it behaves like PMEM as long as the process, rather than the machine, dies.
pub struct FileRegion {
    ptr: NonNull<AtomicU64>,
    len: usize,
    path: PathBuf,
    _file: File,
}

// The mapping is only ever accessed through atomics.
unsafe impl Send for FileRegion {}
unsafe impl Sync for FileRegion {}

impl FileRegion {
    /// Map `path`, creating it zero-filled with room for `len` words if it does not exist yet.
    /// Returns the region and whether the file already existed.
    ///
    /// An existing file is mapped at its own size, which need not be `len`. The caller compares it
    /// against the header it expects.
    pub fn open_or_create(path: &Path, len: usize) -> io::Result<(Self, bool)> {
        let file: File = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let actual_len: u64 = file.metadata()?.len();
        if actual_len < core::mem::size_of::<AtomicU64>() as u64 {
            return Ok((Self::map(file, path, len)?, false));
        }
        let byte_len: usize = usize::try_from(actual_len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "pool file is too large"))?;
        let existing_len: usize = byte_len / core::mem::size_of::<AtomicU64>();
        Ok((Self::map(file, path, existing_len)?, true))
    }

    /// Truncate `path` and map it again zero-filled with room for `len` words.
    pub fn create(path: &Path, len: usize) -> io::Result<Self> {
        let file: File = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Self::map(file, path, len)
    }

    fn map(file: File, path: &Path, len: usize) -> io::Result<Self> {
        let byte_len: NonZeroUsize = len
            .checked_mul(core::mem::size_of::<AtomicU64>())
            .and_then(NonZeroUsize::new)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "invalid region length"))?;
        if file.metadata()?.len() < byte_len.get() as u64 {
            file.set_len(byte_len.get() as u64)?;
        }

        let ptr: NonNull<c_void> = unsafe {
            mmap(
                None,
                byte_len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &file,
                0,
            )
        }
        .map_err(io::Error::from)?;
        debug!("mapped {} ({byte_len} bytes)", path.display());

        Ok(Self {
            ptr: ptr.cast(),
            len,
            path: path.to_path_buf(),
            _file: file,
        })
    }
}

impl Region for FileRegion {
    fn words(&self) -> &[AtomicU64] {
        // mmap returns page aligned memory which stays mapped until drop.
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn sync(&self) -> io::Result<()> {
        unsafe {
            msync(
                self.ptr.cast(),
                self.len * core::mem::size_of::<AtomicU64>(),
                MsFlags::MS_SYNC,
            )
        }
        .map_err(io::Error::from)
    }
}

impl Drop for FileRegion {
    fn drop(&mut self) {
        let byte_len: usize = self.len * core::mem::size_of::<AtomicU64>();
        if let Err(errno) = unsafe { munmap(self.ptr.cast(), byte_len) } {
            debug!("failed to unmap {}: {errno}", self.path.display());
        }
    }
}

impl Debug for FileRegion {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FileRegion")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}
