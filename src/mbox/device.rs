use crate::error::{QpuError, QpuResult};
use crate::mbox::message::{PropertyMessage, STATUS_SUCCESS, Tag, check_fw_status};
use crate::mbox::Mailbox;
use crate::utils::iowr;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::RawFd;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use tracing::{debug, error};

const VCIO_IOC_MAGIC: u32 = 100;

/// A handle to the firmware mailbox character device (`/dev/vcio`).
///
/// The file is wrapped in an `Arc`, so the handle is cheap to clone and share between
/// the executor and the diagnostic queries.
#[derive(Clone, Debug)]
pub struct VcioDevice {
    pub file: Arc<File>,
}

impl VcioDevice {
    /// Opens the mailbox device.
    ///
    /// # Errors
    /// Returns an error if `/dev/vcio` cannot be opened (e.g., not a Raspberry Pi, not root).
    pub fn open() -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/vcio")
            .inspect_err(|e| {
                if e.kind() == io::ErrorKind::PermissionDenied {
                    error!("Need root to open /dev/vcio");
                }
            })?;

        Ok(Self {
            file: Arc::new(file),
        })
    }

    /// Sends one property message and waits for the firmware response.
    ///
    /// # Errors
    /// `Io` if the ioctl fails, `FirmwareUnspecified` if the firmware did not mark the
    /// buffer as successfully processed.
    pub fn property(&self, msg: &mut PropertyMessage) -> QpuResult<()> {
        let cmd = iowr::<*mut libc::c_char>(VCIO_IOC_MAGIC, 0);
        let words = msg.seal();
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), cmd as _, words.as_mut_ptr()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            error!("mailbox ioctl failed: {err}");
            return Err(err.into());
        }

        if msg.status() != STATUS_SUCCESS {
            let tag = msg.first_tag().map_or(0, |t| t as u32);
            error!(tag, status = msg.status(), "Firmware: Unspecified error");
            return Err(QpuError::FirmwareUnspecified { tag });
        }

        Ok(())
    }

    /// Sends a single-tag message that reports a firmware status word in its first value.
    fn status_request(&self, tag: Tag, request: &[u32]) -> QpuResult<PropertyMessage> {
        let mut msg = PropertyMessage::single(tag, request, 1);
        self.property(&mut msg)?;
        check_fw_status(tag, msg.word(0, 0))?;
        Ok(msg)
    }
}

impl Mailbox for VcioDevice {
    fn mem_alloc(&self, size: u32, align: u32, flags: u32) -> QpuResult<u32> {
        let mut msg = PropertyMessage::single(Tag::MemAlloc, &[size, align, flags], 1);
        self.property(&mut msg)?;
        let handle = msg.word(0, 0);
        if handle == 0 {
            return Err(QpuError::FirmwareRejected {
                tag: Tag::MemAlloc as u32,
            });
        }
        debug!(size, align, handle, "allocated GPU memory");
        Ok(handle)
    }

    fn mem_free(&self, handle: u32) -> QpuResult<()> {
        self.status_request(Tag::MemFree, &[handle]).map(drop)
    }

    fn mem_lock(&self, handle: u32) -> QpuResult<u32> {
        let mut msg = PropertyMessage::single(Tag::MemLock, &[handle], 1);
        self.property(&mut msg)?;
        let bus = msg.word(0, 0);
        if bus == 0 {
            return Err(QpuError::FirmwareRejected {
                tag: Tag::MemLock as u32,
            });
        }
        Ok(bus)
    }

    fn mem_unlock(&self, handle: u32) -> QpuResult<()> {
        self.status_request(Tag::MemUnlock, &[handle]).map(drop)
    }

    fn execute_qpu(
        &self,
        num_tasks: u32,
        control: u32,
        noflush: bool,
        timeout_ms: u32,
    ) -> QpuResult<()> {
        let request = [num_tasks, control, u32::from(noflush), timeout_ms];
        self.status_request(Tag::ExecQpu, &request).map(drop)
    }

    fn set_qpu_enabled(&self, enable: bool) -> QpuResult<()> {
        self.status_request(Tag::QpuEnable, &[u32::from(enable)])
            .map(drop)
    }
}

impl AsRawFd for VcioDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

