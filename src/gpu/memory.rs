use crate::error::{QpuError, QpuResult};
use crate::gpu::mapping::{Mapping, PhysMapper};
use crate::mbox::{BUS_ALIAS_MASK, MEM_FLAG_L2_ALLOCATING, Mailbox};
use crate::utils::round_up;
use tracing::{debug, error, warn};

/// One step of the acquisition sequence. Steps complete strictly in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Alloc,
    Lock,
    Map,
}

/// A reference-counted, physically contiguous region shared with the QPUs.
///
/// The region is allocated by the firmware, locked to obtain a stable bus address and
/// mapped into the process. `acquire` and `release` are the only operations that change
/// that state. Dropping a handle that still holds firmware memory is a bug and trips a
/// debug assertion.
#[derive(Debug)]
pub struct DmaBuffer {
    handle: u32,
    bus: u32,
    mapping: Option<Mapping>,
    alloc_size: u32,
    data_size: u32,
    refs: u32,
    // Completed steps; walked in reverse to tear down.
    steps: Vec<Step>,
}

impl DmaBuffer {
    /// Allocates, locks and maps `size` bytes (rounded up to `page_size`).
    ///
    /// On failure every completed step is undone before the error is returned.
    ///
    /// # Errors
    /// `Alloc`, `Lock` or `Map`, wrapping the underlying firmware or platform error. A
    /// mapping shorter than the allocation is a `Map` error wrapping `RegionBounds`.
    pub fn acquire<M, P>(mailbox: &M, mapper: &P, size: u32, page_size: u32) -> QpuResult<Self>
    where
        M: Mailbox + ?Sized,
        P: PhysMapper + ?Sized,
    {
        let mut mem = Self {
            handle: 0,
            bus: 0,
            mapping: None,
            alloc_size: round_up(size, page_size),
            data_size: size,
            refs: 1,
            steps: Vec::with_capacity(3),
        };

        if let Err(e) = mem.advance(mailbox, mapper, page_size) {
            if let Err(teardown) = mem.unwind(mailbox, mapper) {
                warn!("Failed to free GPU memory: {teardown}");
            }
            mem.refs = 0;
            return Err(e);
        }

        debug!(
            handle = mem.handle,
            bus = format_args!("{:#010x}", mem.bus),
            alloc_size = mem.alloc_size,
            data_size = mem.data_size,
            "acquired GPU memory"
        );
        Ok(mem)
    }

    fn advance<M, P>(&mut self, mailbox: &M, mapper: &P, page_size: u32) -> QpuResult<()>
    where
        M: Mailbox + ?Sized,
        P: PhysMapper + ?Sized,
    {
        let size = self.alloc_size;
        self.handle = mailbox
            .mem_alloc(size, page_size, MEM_FLAG_L2_ALLOCATING)
            .map_err(|e| QpuError::Alloc {
                size,
                source: Box::new(e),
            })?;
        self.steps.push(Step::Alloc);

        let handle = self.handle;
        self.bus = mailbox.mem_lock(handle).map_err(|e| QpuError::Lock {
            handle,
            source: Box::new(e),
        })?;
        self.steps.push(Step::Lock);

        let bus = self.bus;
        let mapping = mapper
            .map(bus & !BUS_ALIAS_MASK, size as usize)
            .map_err(|e| QpuError::Map {
                bus,
                source: Box::new(e),
            })?;
        let mapped = mapping.len();
        self.mapping = Some(mapping);
        self.steps.push(Step::Map);
        if mapped < size as usize {
            return Err(QpuError::Map {
                bus,
                source: Box::new(QpuError::RegionBounds {
                    offset: 0,
                    len: size as usize,
                    size: mapped,
                }),
            });
        }

        Ok(())
    }

    /// Undoes every completed step in reverse order. Every step is attempted; the first
    /// failure is returned.
    fn unwind<M, P>(&mut self, mailbox: &M, mapper: &P) -> QpuResult<()>
    where
        M: Mailbox + ?Sized,
        P: PhysMapper + ?Sized,
    {
        let mut first_err = None;

        while let Some(step) = self.steps.pop() {
            let res = match step {
                Step::Map => self.mapping.take().map_or(Ok(()), |m| mapper.unmap(m)),
                Step::Lock => mailbox.mem_unlock(self.handle),
                Step::Alloc => mailbox.mem_free(self.handle),
            };
            if let Err(e) = res {
                warn!(?step, handle = self.handle, "teardown step failed: {e}");
                first_err.get_or_insert(e);
            }
        }

        first_err.map_or(Ok(()), Err)
    }

    /// Registers an additional owner.
    pub fn retain(&mut self) {
        debug_assert!(self.refs > 0, "retain of an unacquired GPU memory handle");
        self.refs += 1;
    }

    /// Drops one owner. The last owner tears the region down (unmap, unlock, free).
    ///
    /// # Errors
    /// The first teardown failure; the remaining steps are still attempted.
    pub fn release<M, P>(&mut self, mailbox: &M, mapper: &P) -> QpuResult<()>
    where
        M: Mailbox + ?Sized,
        P: PhysMapper + ?Sized,
    {
        debug_assert!(self.refs > 0, "release of an unacquired GPU memory handle");
        if self.refs == 0 {
            return Ok(());
        }

        self.refs -= 1;
        if self.refs > 0 {
            return Ok(());
        }

        debug!(handle = self.handle, "releasing GPU memory");
        self.unwind(mailbox, mapper)
    }

    #[must_use]
    pub const fn ref_count(&self) -> u32 {
        self.refs
    }

    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.steps.contains(&Step::Alloc)
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.steps.contains(&Step::Lock)
    }

    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.steps.contains(&Step::Map)
    }

    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        self.steps.is_empty()
    }

    #[must_use]
    pub const fn handle(&self) -> u32 {
        self.handle
    }

    /// Bus address of the start of the region, including its cache alias bits.
    #[must_use]
    pub const fn bus_address(&self) -> u32 {
        self.bus
    }

    /// Bus address of the byte at `offset` within the region.
    #[must_use]
    pub const fn bus_address_at(&self, offset: u32) -> u32 {
        self.bus.wrapping_add(offset)
    }

    /// Page-rounded size backing the region.
    #[must_use]
    pub const fn alloc_size(&self) -> u32 {
        self.alloc_size
    }

    /// Requested, usable size of the region.
    #[must_use]
    pub const fn data_size(&self) -> u32 {
        self.data_size
    }

    /// The usable bytes of the region. Empty once torn down.
    #[must_use]
    pub fn region(&self) -> &[u8] {
        let len = self.data_size as usize;
        self.mapping
            .as_ref()
            .and_then(|m| m.as_slice().get(..len))
            .unwrap_or_default()
    }

    pub fn region_mut(&mut self) -> &mut [u8] {
        let len = self.data_size as usize;
        self.mapping
            .as_mut()
            .and_then(|m| m.as_mut_slice().get_mut(..len))
            .unwrap_or_default()
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        if !self.steps.is_empty() {
            error!(
                handle = self.handle,
                "GPU memory dropped while still acquired; firmware allocation leaked"
            );
            debug_assert!(
                std::thread::panicking(),
                "DmaBuffer dropped without release"
            );
        }
    }
}
