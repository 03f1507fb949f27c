use crate::error::{QpuError, QpuResult};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::fd::IntoRawFd;
use std::path::{Path, PathBuf};

/// Bytes per QPU instruction (two 32-bit words).
pub const INSTRUCTION_FACTOR: u32 = 8;
/// Uniforms and read buffers are arrays of 32-bit words.
pub const WORD_FACTOR: u32 = 4;

/// A file whose contents are copied into the execution region at staging time.
#[derive(Debug)]
pub struct FileInput {
    file: File,
    path: PathBuf,
    len: u32,
    offset: Option<u32>,
}

impl FileInput {
    /// Opens `path` and checks that it is a non-empty regular file whose length is a
    /// multiple of `factor`.
    ///
    /// # Errors
    /// `OpenFile`, `NotRegularFile`, `EmptyFile`, `BadLength` or `FileTooLarge`.
    pub fn open(path: impl AsRef<Path>, factor: u32) -> QpuResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| QpuError::OpenFile {
            path: path.clone(),
            source,
        })?;

        let meta = file.metadata()?;
        if !meta.is_file() {
            return Err(QpuError::NotRegularFile(path));
        }
        if meta.len() == 0 {
            return Err(QpuError::EmptyFile(path));
        }
        if meta.len() % u64::from(factor) != 0 {
            return Err(QpuError::BadLength { path, factor });
        }
        let len = u32::try_from(meta.len()).map_err(|_| QpuError::FileTooLarge(path.clone()))?;

        Ok(Self {
            file,
            path,
            len,
            offset: None,
        })
    }

    /// Opens a second, independent stream onto the same file. The staged offset is not
    /// carried over.
    ///
    /// # Errors
    /// Returns an error if the descriptor cannot be duplicated.
    pub fn try_clone(&self) -> QpuResult<Self> {
        Ok(Self {
            file: self.file.try_clone()?,
            path: self.path.clone(),
            len: self.len,
            offset: None,
        })
    }

    /// Rewinds the stream and reads exactly `len` bytes into `dst`.
    pub(crate) fn read_into(&mut self, dst: &mut [u8]) -> QpuResult<()> {
        debug_assert_eq!(dst.len(), self.len as usize);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(dst)?;
        Ok(())
    }

    pub(crate) fn set_offset(&mut self, offset: u32) {
        self.offset = Some(offset);
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn len(&self) -> u32 {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Offset within the region, once staged.
    #[must_use]
    pub const fn offset(&self) -> Option<u32> {
        self.offset
    }

    #[must_use]
    pub const fn file(&self) -> &File {
        &self.file
    }

    /// Closes the descriptor and reports the result of `close(2)`, which dropping the
    /// input would discard.
    ///
    /// # Errors
    /// Returns the OS error if the close fails.
    pub fn close(self) -> QpuResult<()> {
        let fd = self.file.into_raw_fd();
        let ret = unsafe { libc::close(fd) };
        if ret == -1 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }
}

/// An output buffer. Only its size is declared; the QPUs fill it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteBuffer {
    len: u32,
    offset: Option<u32>,
}

impl WriteBuffer {
    /// # Errors
    /// `InvalidSize` for a zero-length buffer.
    pub fn new(len: u32) -> QpuResult<Self> {
        if len == 0 {
            return Err(QpuError::InvalidSize(len));
        }
        Ok(Self { len, offset: None })
    }

    /// A buffer of the same size with no offset, for a replicated task.
    #[must_use]
    pub const fn replica(&self) -> Self {
        Self {
            len: self.len,
            offset: None,
        }
    }

    pub(crate) fn set_offset(&mut self, offset: u32) {
        self.offset = Some(offset);
    }

    #[must_use]
    pub const fn len(&self) -> u32 {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn offset(&self) -> Option<u32> {
        self.offset
    }
}
