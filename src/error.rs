use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::gpu::link::LinkErrors;

#[derive(Error, Debug)]
pub enum QpuError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    // Declaration errors
    #[error("Duplicate {0}")]
    DuplicateResource(ResourceKind),

    #[error("{source}: '{}'", path.display())]
    OpenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Not a regular file: '{}'", .0.display())]
    NotRegularFile(PathBuf),

    #[error("Length is zero: '{}'", .0.display())]
    EmptyFile(PathBuf),

    #[error("Length not a factor of {factor}: '{}'", path.display())]
    BadLength { path: PathBuf, factor: u32 },

    #[error("File too large for GPU memory: '{}'", .0.display())]
    FileTooLarge(PathBuf),

    #[error("Invalid buffer size: {0}")]
    InvalidSize(u32),

    #[error("Max GPU tasks exceeded ({max})")]
    TooManyTasks { max: usize },

    #[error("No GPU tasks")]
    NoTask,

    #[error("Task {0} has no instructions")]
    TaskNotActive(usize),

    #[error("Task {0} has already been executed")]
    TaskExecuted(usize),

    #[error("Nothing to replicate (multiplier {0})")]
    NothingToReplicate(u32),

    // Resource lifecycle errors
    #[error("GPU memory allocation of {size} bytes failed: {source}")]
    Alloc {
        size: u32,
        #[source]
        source: Box<QpuError>,
    },

    #[error("Failed to lock GPU memory handle {handle:#x}: {source}")]
    Lock {
        handle: u32,
        #[source]
        source: Box<QpuError>,
    },

    #[error("Failed to map bus address {bus:#010x}: {source}")]
    Map {
        bus: u32,
        #[source]
        source: Box<QpuError>,
    },

    // Layout and consistency errors
    #[error("Staged {staged} bytes but planned {planned}")]
    LayoutMismatch { staged: u32, planned: u32 },

    #[error("Execution region of {0} bytes is too large")]
    RegionTooLarge(u64),

    #[error("Access of {len} bytes at offset {offset} exceeds region of {size} bytes")]
    RegionBounds { offset: usize, len: usize, size: usize },

    #[error("{0} has not been staged")]
    NotStaged(ResourceKind),

    #[error("Task {task} instruction stream of {len} bytes is not a whole number of instructions")]
    MalformedInstructions { task: usize, len: u32 },

    // Linking errors
    #[error("Link failed: {0}")]
    Link(LinkErrors),

    // Firmware errors
    #[error("Firmware: Timeout")]
    FirmwareTimeout,

    #[error("Firmware: Unspecified error (tag {tag:#010x})")]
    FirmwareUnspecified { tag: u32 },

    #[error("Firmware rejected request (tag {tag:#010x})")]
    FirmwareRejected { tag: u32 },
}

/// Identifies a declarable resource in error messages and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    GlobalUniforms,
    GlobalReadBuffer,
    GlobalWriteBuffer,
    TaskInstructions(usize),
    TaskUniforms(usize),
    TaskReadBuffer(usize),
    TaskWriteBuffer(usize),
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GlobalUniforms => write!(f, "global uniforms"),
            Self::GlobalReadBuffer => write!(f, "global read buffer"),
            Self::GlobalWriteBuffer => write!(f, "global write buffer"),
            Self::TaskInstructions(i) => write!(f, "task {i} instructions"),
            Self::TaskUniforms(i) => write!(f, "task {i} uniforms"),
            Self::TaskReadBuffer(i) => write!(f, "task {i} read buffer"),
            Self::TaskWriteBuffer(i) => write!(f, "task {i} write buffer"),
        }
    }
}

// Result type used throughout the crate
pub type QpuResult<T> = Result<T, QpuError>;
