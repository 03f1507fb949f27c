#![allow(clippy::cast_possible_truncation)]

use crate::error::{QpuError, QpuResult};

// ===============================================================================================
// Status Words
// ===============================================================================================

/// Buffer status written by the caller.
pub const STATUS_REQUEST: u32 = 0;
/// Buffer status written by the firmware when every tag was processed.
pub const STATUS_SUCCESS: u32 = 0x8000_0000;
/// Buffer status written by the firmware when parsing the request failed.
pub const STATUS_ERROR: u32 = 0x8000_0001;

/// Per-tag result code for operations that report one (unlock, free, enable, execute).
pub const FW_SUCCESS: u32 = 0;
pub const FW_TIMEOUT: u32 = 1 << 31;

pub const TAG_PROPERTY_END: u32 = 0;

// ===============================================================================================
// Tags
// ===============================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Tag {
    GetFirmwareRevision = 0x0000_0001,
    GetFirmwareVariant = 0x0000_0002,
    GetBoardModel = 0x0001_0001,
    GetBoardRevision = 0x0001_0002,
    GetBoardMac = 0x0001_0003,
    GetBoardSerial = 0x0001_0004,
    GetArmMemory = 0x0001_0005,
    GetVcMemory = 0x0001_0006,
    GetPowerState = 0x0002_0001,
    GetClockState = 0x0003_0001,
    GetClockRate = 0x0003_0002,
    GetVoltage = 0x0003_0003,
    GetClockMax = 0x0003_0004,
    GetVoltageMax = 0x0003_0005,
    GetTemperature = 0x0003_0006,
    GetClockMin = 0x0003_0007,
    GetVoltageMin = 0x0003_0008,
    GetClockTurbo = 0x0003_0009,
    GetTemperatureMax = 0x0003_000a,
    MemAlloc = 0x0003_000c,
    MemLock = 0x0003_000d,
    MemUnlock = 0x0003_000e,
    MemFree = 0x0003_000f,
    ExecQpu = 0x0003_0011,
    QpuEnable = 0x0003_0012,
}

/// Interprets the result word returned by tags that report a firmware status.
///
/// # Errors
/// `FirmwareTimeout` for the dedicated timeout value, `FirmwareUnspecified` for anything
/// other than success.
pub fn check_fw_status(tag: Tag, word: u32) -> QpuResult<()> {
    match word {
        FW_SUCCESS => Ok(()),
        FW_TIMEOUT => Err(QpuError::FirmwareTimeout),
        _ => Err(QpuError::FirmwareUnspecified { tag: tag as u32 }),
    }
}

// ===============================================================================================
// Property Message
// ===============================================================================================

#[derive(Debug, Clone, Copy)]
struct Property {
    tag: Tag,
    offset: usize,
    words: usize,
}

/// A property-interface buffer holding one or more tags.
///
/// Layout, in 32-bit words:
/// `[size, status, (tag, value_size, response_code, values...)*, end]`.
/// Each value area is large enough for both the request and the expected response.
#[derive(Debug, Clone)]
pub struct PropertyMessage {
    buf: Vec<u32>,
    props: Vec<Property>,
    sealed: bool,
}

impl Default for PropertyMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl PropertyMessage {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: vec![0, STATUS_REQUEST],
            props: Vec::new(),
            sealed: false,
        }
    }

    /// Convenience constructor for a single-tag message.
    #[must_use]
    pub fn single(tag: Tag, request: &[u32], response_words: usize) -> Self {
        Self::new().with(tag, request, response_words)
    }

    /// Appends a tag with its request values and the number of response words expected.
    #[must_use]
    pub fn with(mut self, tag: Tag, request: &[u32], response_words: usize) -> Self {
        debug_assert!(!self.sealed, "tag appended to a sealed message");
        let words = request.len().max(response_words);
        self.buf.push(tag as u32);
        self.buf.push((words * 4) as u32);
        self.buf.push(0);
        let offset = self.buf.len();
        self.buf.extend_from_slice(request);
        self.buf.resize(offset + words, 0);
        self.props.push(Property { tag, offset, words });
        self
    }

    /// Terminates the buffer and writes the total size. Idempotent.
    pub fn seal(&mut self) -> &mut [u32] {
        if !self.sealed {
            self.buf.push(TAG_PROPERTY_END);
            self.buf[0] = (self.buf.len() * 4) as u32;
            self.sealed = true;
        }
        &mut self.buf
    }

    #[must_use]
    pub fn status(&self) -> u32 {
        self.buf[1]
    }

    /// Tag of the first property, used for error reporting.
    #[must_use]
    pub fn first_tag(&self) -> Option<Tag> {
        self.props.first().map(|p| p.tag)
    }

    /// Value area of the `index`-th tag. Empty if the index is out of range.
    #[must_use]
    pub fn value(&self, index: usize) -> &[u32] {
        match self.props.get(index) {
            Some(p) => &self.buf[p.offset..p.offset + p.words],
            None => &[],
        }
    }

    /// First value word of the `index`-th tag, or 0.
    #[must_use]
    pub fn word(&self, index: usize, word: usize) -> u32 {
        self.value(index).get(word).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn words(&self) -> &[u32] {
        &self.buf
    }
}
