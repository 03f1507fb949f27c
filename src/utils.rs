#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use std::io;

const IOC_NRBITS: u32 = 8;
const IOC_TYPEBITS: u32 = 8;
const IOC_SIZEBITS: u32 = 14;

const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: u32 = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: u32 = IOC_SIZESHIFT + IOC_SIZEBITS;

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

#[must_use]
pub const fn ioc(dir: u32, type_: u32, nr: u32, size: usize) -> u32 {
    (dir << IOC_DIRSHIFT)
        | (type_ << IOC_TYPESHIFT)
        | (nr << IOC_NRSHIFT)
        | ((size as u32) << IOC_SIZESHIFT)
}

/// Equivalent of the C `_IOWR` macro.
#[must_use]
pub const fn iowr<T>(type_: u32, nr: u32) -> u32 {
    ioc(IOC_READ | IOC_WRITE, type_, nr, std::mem::size_of::<T>())
}

/// Rounds `value` up to the next multiple of `to`. `to` must be non-zero.
#[must_use]
pub const fn round_up(value: u32, to: u32) -> u32 {
    value.div_ceil(to) * to
}

/// Queries the platform page size.
///
/// # Errors
/// Returns an error if `sysconf` does not support `_SC_PAGE_SIZE`.
pub fn page_size() -> io::Result<u32> {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
    if ret <= 0 {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "Option not supported: Page size",
        ));
    }
    u32::try_from(ret).map_err(|_| io::Error::other("page size out of range"))
}
