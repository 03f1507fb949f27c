#![allow(dead_code)]

use qpu_rs::error::{QpuError, QpuResult};
use qpu_rs::gpu::{Executor, Mapping, PhysMapper};
use qpu_rs::mbox::Mailbox;
use qpu_rs::mbox::message::Tag;
use std::cell::{Cell, RefCell};
use std::io::Write;
use std::path::Path;
use std::ptr::NonNull;

pub const PAGE_SIZE: u32 = 4096;
pub const BUS_BASE: u32 = 0x4000_0000;

pub const LDI_R0: u32 = 0xe002_0827;
pub const LDI_VPMW: u32 = 0xe002_1ca7;
pub const NOP: u32 = 0x1000_09e7;

pub const GLOBAL_READ_BUFFER: u32 = 0xffff_fff1;
pub const GLOBAL_WRITE_BUFFER: u32 = 0xffff_fff2;
pub const TASK_READ_BUFFER: u32 = 0xffff_fffa;
pub const TASK_WRITE_BUFFER: u32 = 0xffff_fffb;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Alloc { size: u32, align: u32, flags: u32 },
    Lock(u32),
    Unlock(u32),
    Free(u32),
    Execute { num_tasks: u32, control: u32, noflush: bool, timeout_ms: u32 },
    Enable(bool),
}

/// Records every firmware request. Each operation can be made to fail.
#[derive(Debug, Default)]
pub struct MockMailbox {
    calls: RefCell<Vec<Call>>,
    next_handle: Cell<u32>,
    pub fail_alloc: Cell<bool>,
    pub fail_lock: Cell<bool>,
    pub fail_unlock: Cell<bool>,
    pub fail_free: Cell<bool>,
    pub fail_execute: Cell<bool>,
    pub fail_enable: Cell<bool>,
}

impl MockMailbox {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub fn executed(&self) -> Option<Call> {
        self.calls()
            .into_iter()
            .find(|c| matches!(c, Call::Execute { .. }))
    }

    /// Bus address the firmware hands out for `handle`.
    pub const fn bus_for(handle: u32) -> u32 {
        BUS_BASE + handle * 0x0010_0000
    }

    fn record(&self, call: Call, fail: &Cell<bool>, tag: Tag) -> QpuResult<()> {
        self.calls.borrow_mut().push(call);
        if fail.get() {
            return Err(QpuError::FirmwareRejected { tag: tag as u32 });
        }
        Ok(())
    }
}

impl Mailbox for MockMailbox {
    fn mem_alloc(&self, size: u32, align: u32, flags: u32) -> QpuResult<u32> {
        self.record(Call::Alloc { size, align, flags }, &self.fail_alloc, Tag::MemAlloc)?;
        let handle = self.next_handle.get() + 1;
        self.next_handle.set(handle);
        Ok(handle)
    }

    fn mem_free(&self, handle: u32) -> QpuResult<()> {
        self.record(Call::Free(handle), &self.fail_free, Tag::MemFree)
    }

    fn mem_lock(&self, handle: u32) -> QpuResult<u32> {
        self.record(Call::Lock(handle), &self.fail_lock, Tag::MemLock)?;
        Ok(Self::bus_for(handle))
    }

    fn mem_unlock(&self, handle: u32) -> QpuResult<()> {
        self.record(Call::Unlock(handle), &self.fail_unlock, Tag::MemUnlock)
    }

    fn execute_qpu(&self, num_tasks: u32, control: u32, noflush: bool, timeout_ms: u32) -> QpuResult<()> {
        self.calls.borrow_mut().push(Call::Execute {
            num_tasks,
            control,
            noflush,
            timeout_ms,
        });
        if self.fail_execute.get() {
            return Err(QpuError::FirmwareTimeout);
        }
        Ok(())
    }

    fn set_qpu_enabled(&self, enable: bool) -> QpuResult<()> {
        self.record(Call::Enable(enable), &self.fail_enable, Tag::QpuEnable)
    }
}

/// Backs every mapping with zeroed heap memory.
#[derive(Debug, Default)]
pub struct HeapMapper {
    mapped: RefCell<Vec<u32>>,
    live: Cell<usize>,
    pub fail_map: Cell<bool>,
}

impl HeapMapper {
    /// Physical addresses passed to `map`, in order.
    pub fn mapped(&self) -> Vec<u32> {
        self.mapped.borrow().clone()
    }

    /// Mappings not yet handed back.
    pub fn live(&self) -> usize {
        self.live.get()
    }
}

impl PhysMapper for HeapMapper {
    fn map(&self, phys: u32, len: usize) -> QpuResult<Mapping> {
        self.mapped.borrow_mut().push(phys);
        if self.fail_map.get() {
            return Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied).into());
        }
        let raw = Box::into_raw(vec![0u8; len].into_boxed_slice());
        let ptr = NonNull::new(raw.cast::<u8>()).expect("heap pointer");
        self.live.set(self.live.get() + 1);
        Ok(unsafe { Mapping::from_raw_parts(ptr, len) })
    }

    fn unmap(&self, mapping: Mapping) -> QpuResult<()> {
        let raw = std::ptr::slice_from_raw_parts_mut(mapping.as_ptr(), mapping.len());
        drop(unsafe { Box::from_raw(raw) });
        self.live.set(self.live.get() - 1);
        Ok(())
    }
}

pub type TestExecutor = Executor<MockMailbox, HeapMapper>;

pub fn executor() -> TestExecutor {
    Executor::with_page_size(MockMailbox::default(), HeapMapper::default(), PAGE_SIZE)
}

/// Encodes 32-bit words little-endian.
pub fn code(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

pub fn word_at(region: &[u8], offset: u32) -> u32 {
    let o = offset as usize;
    u32::from_le_bytes(region[o..o + 4].try_into().expect("word"))
}

/// Holds the fixture files for one test.
pub struct Fixtures {
    dir: tempfile::TempDir,
}

impl Fixtures {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn file(&self, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = self.dir.path().join(name);
        let mut f = std::fs::File::create(&path).expect("create fixture");
        f.write_all(bytes).expect("write fixture");
        path
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}
