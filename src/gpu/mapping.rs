#![allow(clippy::cast_possible_wrap)]

use crate::error::{QpuError, QpuResult};
use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::ptr::NonNull;
use tracing::error;

/// A process-visible view of a mapped physical range.
///
/// The mapping is owned: it can only be released by handing it back to the
/// [`PhysMapper`] that produced it.
#[derive(Debug)]
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

impl Mapping {
    /// Wraps a raw mapping.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes for as long as the
    /// `Mapping` exists, and must not be aliased by any other live reference.
    #[must_use]
    pub const unsafe fn from_raw_parts(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    #[must_use]
    pub const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

/// Turns a physical address range into process-addressable memory.
pub trait PhysMapper {
    /// Maps `len` bytes starting at `phys`. The returned mapping must cover at least
    /// `len` bytes; [`DmaBuffer::acquire`](crate::gpu::DmaBuffer::acquire) rejects a
    /// shorter one.
    fn map(&self, phys: u32, len: usize) -> QpuResult<Mapping>;

    fn unmap(&self, mapping: Mapping) -> QpuResult<()>;
}

/// Maps physical memory through `/dev/mem`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DevMem;

impl PhysMapper for DevMem {
    fn map(&self, phys: u32, len: usize) -> QpuResult<Mapping> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open("/dev/mem")
            .inspect_err(|e| {
                if e.kind() == io::ErrorKind::PermissionDenied {
                    error!("Need root to open /dev/mem");
                }
            })?;

        let ret = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                phys as libc::off_t,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(QpuError::Io(io::Error::last_os_error()));
        }
        // The mapping stays valid after the descriptor is closed.
        drop(file);

        let ptr = NonNull::new(ret.cast::<u8>())
            .ok_or_else(|| QpuError::Io(io::Error::other("mmap returned null")))?;
        Ok(unsafe { Mapping::from_raw_parts(ptr, len) })
    }

    fn unmap(&self, mapping: Mapping) -> QpuResult<()> {
        let ret = unsafe { libc::munmap(mapping.as_ptr().cast(), mapping.len()) };
        if ret == -1 {
            return Err(QpuError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }
}
