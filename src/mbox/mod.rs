pub mod device;
pub mod info;
pub mod message;

use crate::error::QpuResult;

/// Allocation flag: L2-cache allocating, bus alias `0x4xxx_xxxx`.
pub const MEM_FLAG_L2_ALLOCATING: u32 = 3 << 2;
pub const MEM_FLAG_L2_COHERENT: u32 = 2 << 2;
pub const MEM_FLAG_DIRECT: u32 = 1 << 2;

/// Bits of a bus address that select the cache alias rather than the physical page.
pub const BUS_ALIAS_MASK: u32 = 0xc000_0000;

/// The firmware operations the execution core depends on.
///
/// Each call is one request/response round trip. Implementations must not retry.
pub trait Mailbox {
    /// Allocate `size` bytes of GPU memory aligned to `align`. Returns the firmware handle.
    fn mem_alloc(&self, size: u32, align: u32, flags: u32) -> QpuResult<u32>;

    fn mem_free(&self, handle: u32) -> QpuResult<()>;

    /// Lock an allocation in place and return its bus address.
    fn mem_lock(&self, handle: u32) -> QpuResult<u32>;

    fn mem_unlock(&self, handle: u32) -> QpuResult<()>;

    /// Run `num_tasks` QPU programs described by the control block at `control`.
    fn execute_qpu(&self, num_tasks: u32, control: u32, noflush: bool, timeout_ms: u32)
    -> QpuResult<()>;

    /// Power the QPUs on or off.
    fn set_qpu_enabled(&self, enable: bool) -> QpuResult<()>;
}

// Re-export the device for easy access
pub use device::VcioDevice;
