#![allow(clippy::cast_possible_truncation)]

use crate::error::{QpuError, QpuResult};
use crate::gpu::layout::LayoutPlan;
use crate::gpu::link::link;
use crate::gpu::mapping::PhysMapper;
use crate::gpu::memory::DmaBuffer;
use crate::gpu::resource::{FileInput, INSTRUCTION_FACTOR, WORD_FACTOR, WriteBuffer};
use crate::gpu::stage::stage;
use crate::gpu::task::{Globals, MAX_TASKS, SlotState, TaskSlot};
use crate::mbox::Mailbox;
use crate::utils::page_size;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Firmware execute timeout used until [`Executor::set_timeout`] is called.
pub const DEFAULT_TIMEOUT_MS: u32 = 10_000;

/// What `dispatch` does besides running the tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct DispatchOptions {
    /// Stop after linking; the firmware is never asked to execute.
    pub dry_run: bool,
    /// Write the whole linked region to the output before execution.
    pub dump_before: bool,
    /// Write the whole region to the output after execution.
    pub dump_after: bool,
    /// Write the global and per-task write buffers after execution. Ignored when a full
    /// dump was requested.
    pub dump_outputs: bool,
    pub verbose: bool,
    pub measure_time: bool,
}

impl DispatchOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    #[must_use]
    pub const fn dump_before(mut self) -> Self {
        self.dump_before = true;
        self
    }

    #[must_use]
    pub const fn dump_after(mut self) -> Self {
        self.dump_after = true;
        self
    }

    #[must_use]
    pub const fn dump_outputs(mut self) -> Self {
        self.dump_outputs = true;
        self
    }

    #[must_use]
    pub const fn verbose(mut self) -> Self {
        self.verbose = true;
        self
    }

    #[must_use]
    pub const fn measure_time(mut self) -> Self {
        self.measure_time = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    /// Bytes of GPU memory the tasks used, before page rounding.
    pub region_size: u32,
    pub tasks: usize,
    /// False for a dry run or when no task was declared.
    pub executed: bool,
    /// Wall time of the firmware execute call, when measured.
    pub elapsed: Option<Duration>,
}

/// Collects task declarations and runs them on the QPUs.
///
/// Tasks are declared one at a time: [`begin_next_task`](Self::begin_next_task) opens a
/// slot, the `declare_task_*` methods fill the most recent one. Each `dispatch` acquires
/// a fresh GPU memory region and releases it before returning.
pub struct Executor<M: Mailbox, P: PhysMapper> {
    mailbox: M,
    mapper: P,
    slots: [TaskSlot; MAX_TASKS],
    count: usize,
    globals: Globals,
    timeout_ms: u32,
    page_size: u32,
}

impl<M: Mailbox, P: PhysMapper> Executor<M, P> {
    /// Creates an executor using the system page size.
    ///
    /// # Errors
    /// Returns an error if the page size cannot be queried.
    pub fn new(mailbox: M, mapper: P) -> QpuResult<Self> {
        Ok(Self::with_page_size(mailbox, mapper, page_size()?))
    }

    #[must_use]
    pub fn with_page_size(mailbox: M, mapper: P, page_size: u32) -> Self {
        Self {
            mailbox,
            mapper,
            slots: std::array::from_fn(|_| TaskSlot::default()),
            count: 0,
            globals: Globals::default(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            page_size: page_size.max(1),
        }
    }

    // =========================================================================
    // Declarations
    // =========================================================================

    /// # Errors
    /// `DuplicateResource` or any file validation error.
    pub fn declare_global_uniforms(&mut self, path: impl AsRef<Path>) -> QpuResult<()> {
        let input = FileInput::open(path, WORD_FACTOR)?;
        self.globals.set_uniforms(input)
    }

    /// # Errors
    /// `DuplicateResource` or any file validation error.
    pub fn declare_global_read_buffer(&mut self, path: impl AsRef<Path>) -> QpuResult<()> {
        let input = FileInput::open(path, WORD_FACTOR)?;
        self.globals.set_read_buffer(input)
    }

    /// # Errors
    /// `DuplicateResource` or `InvalidSize`.
    pub fn declare_global_write_buffer(&mut self, size: u32) -> QpuResult<()> {
        self.globals.set_write_buffer(WriteBuffer::new(size)?)
    }

    /// Opens the next task slot. Later `declare_task_*` calls apply to it.
    ///
    /// # Errors
    /// `TooManyTasks` once every slot is in use.
    pub fn begin_next_task(&mut self) -> QpuResult<usize> {
        if self.count >= MAX_TASKS {
            return Err(QpuError::TooManyTasks { max: MAX_TASKS });
        }
        let index = self.count;
        self.count += 1;
        debug!(task = index, "begin task");
        Ok(index)
    }

    fn current(&mut self) -> QpuResult<(usize, &mut TaskSlot)> {
        let index = self.count.checked_sub(1).ok_or(QpuError::NoTask)?;
        Ok((index, &mut self.slots[index]))
    }

    /// # Errors
    /// `NoTask`, `DuplicateResource`, `TaskExecuted` or any file validation error.
    pub fn declare_task_instructions(&mut self, path: impl AsRef<Path>) -> QpuResult<()> {
        let (index, slot) = self.current()?;
        let input = FileInput::open(path, INSTRUCTION_FACTOR)?;
        slot.set_instructions(index, input)
    }

    /// # Errors
    /// `NoTask`, `TaskNotActive`, `DuplicateResource`, `TaskExecuted` or any file
    /// validation error.
    pub fn declare_task_uniforms(&mut self, path: impl AsRef<Path>) -> QpuResult<()> {
        let (index, slot) = self.current()?;
        let input = FileInput::open(path, WORD_FACTOR)?;
        slot.set_uniforms(index, input)
    }

    /// # Errors
    /// `NoTask`, `TaskNotActive`, `DuplicateResource`, `TaskExecuted` or any file
    /// validation error.
    pub fn declare_task_read_buffer(&mut self, path: impl AsRef<Path>) -> QpuResult<()> {
        let (index, slot) = self.current()?;
        let input = FileInput::open(path, WORD_FACTOR)?;
        slot.set_read_buffer(index, input)
    }

    /// # Errors
    /// `NoTask`, `TaskNotActive`, `DuplicateResource`, `TaskExecuted` or `InvalidSize`.
    pub fn declare_task_write_buffer(&mut self, size: u32) -> QpuResult<()> {
        let (index, slot) = self.current()?;
        slot.set_write_buffer(index, WriteBuffer::new(size)?)
    }

    /// Repeats the declared tasks until there are `mult` times as many.
    ///
    /// Task `dst` copies task `dst % n`, where `n` is the count before replication. Input
    /// files are reopened, write buffers are new. On error nothing changes.
    ///
    /// # Errors
    /// `NothingToReplicate`, `TooManyTasks`, `TaskExecuted`, or the error from
    /// duplicating a file handle.
    pub fn replicate(&mut self, mult: u32) -> QpuResult<()> {
        let n = self.count;
        if mult <= 1 || n == 0 {
            return Err(QpuError::NothingToReplicate(mult));
        }
        let total = n
            .checked_mul(mult as usize)
            .filter(|&t| t <= MAX_TASKS)
            .ok_or(QpuError::TooManyTasks { max: MAX_TASKS })?;
        if let Some(i) = self.tasks().iter().position(|t| t.state() == SlotState::Executed) {
            return Err(QpuError::TaskExecuted(i));
        }

        let replicas = (n..total)
            .map(|dst| self.slots[dst % n].replica())
            .collect::<QpuResult<Vec<_>>>()?;
        for (slot, replica) in self.slots[n..total].iter_mut().zip(replicas) {
            *slot = replica;
        }
        self.count = total;

        info!(from = n, to = total, "replicated tasks");
        Ok(())
    }

    // =========================================================================
    // Configuration and queries
    // =========================================================================

    /// Sets the firmware execute timeout. Zero restores the default.
    pub fn set_timeout(&mut self, secs: u32) {
        self.timeout_ms = if secs == 0 {
            DEFAULT_TIMEOUT_MS
        } else {
            secs.saturating_mul(1000)
        };
    }

    #[must_use]
    pub const fn timeout_ms(&self) -> u32 {
        self.timeout_ms
    }

    #[must_use]
    pub const fn page_size(&self) -> u32 {
        self.page_size
    }

    #[must_use]
    pub const fn has_any_task(&self) -> bool {
        self.count > 0
    }

    #[must_use]
    pub const fn task_count(&self) -> usize {
        self.count
    }

    #[must_use]
    pub fn tasks(&self) -> &[TaskSlot] {
        &self.slots[..self.count]
    }

    #[must_use]
    pub fn task(&self, index: usize) -> Option<&TaskSlot> {
        self.tasks().get(index)
    }

    #[must_use]
    pub const fn globals(&self) -> &Globals {
        &self.globals
    }

    #[must_use]
    pub const fn mailbox(&self) -> &M {
        &self.mailbox
    }

    #[must_use]
    pub const fn mapper(&self) -> &P {
        &self.mapper
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    fn check_dispatchable(&self) -> QpuResult<()> {
        for (i, task) in self.tasks().iter().enumerate() {
            match task.state() {
                SlotState::Empty => return Err(QpuError::TaskNotActive(i)),
                SlotState::Executed => return Err(QpuError::TaskExecuted(i)),
                SlotState::Active | SlotState::Resourced => {}
            }
        }
        Ok(())
    }

    /// Plans, stages and links every declared task, then runs them on the QPUs.
    ///
    /// Dumps requested in `opts` are written to `out`. Once the tasks have run, a failed
    /// write to `out` is logged and the dispatch still succeeds. The GPU memory region is released
    /// before this returns, whatever the outcome. After success every task is executed
    /// and cannot be dispatched again. With no declared tasks nothing is planned or
    /// allocated and an empty report is returned.
    ///
    /// # Errors
    /// Any declaration, lifecycle, consistency, linking or firmware error. A teardown
    /// failure is returned only when nothing else failed.
    pub fn dispatch(
        &mut self,
        opts: &DispatchOptions,
        out: &mut dyn Write,
    ) -> QpuResult<DispatchReport> {
        if self.count == 0 {
            debug!("no tasks declared, nothing to dispatch");
            return Ok(DispatchReport {
                region_size: 0,
                tasks: 0,
                executed: false,
                elapsed: None,
            });
        }
        self.check_dispatchable()?;

        let plan = LayoutPlan::plan(self.tasks(), &self.globals)?;
        if opts.verbose {
            for p in &plan.placements {
                info!(slot = %p.slot, len = p.len, "planned");
            }
            info!(total = plan.total, tasks = self.count, "layout");
        }

        let mut mem = DmaBuffer::acquire(&self.mailbox, &self.mapper, plan.total, self.page_size)?;
        let outcome = self.run(&mut mem, &plan, opts, out);
        let released = mem.release(&self.mailbox, &self.mapper);

        let (executed, elapsed) = match (outcome, released) {
            (Ok(run), Ok(())) => run,
            (Ok(_), Err(e)) => return Err(e),
            (Err(e), released) => {
                if let Err(teardown) = released {
                    warn!("Failed to free GPU memory: {teardown}");
                }
                return Err(e);
            }
        };

        for task in &mut self.slots[..self.count] {
            task.mark_executed();
        }

        Ok(DispatchReport {
            region_size: plan.total,
            tasks: self.count,
            executed,
            elapsed,
        })
    }

    fn run(
        &mut self,
        mem: &mut DmaBuffer,
        plan: &LayoutPlan,
        opts: &DispatchOptions,
        out: &mut dyn Write,
    ) -> QpuResult<(bool, Option<Duration>)> {
        let bus = mem.bus_address();
        let tasks = &mut self.slots[..self.count];

        stage(mem.region_mut(), bus, plan, tasks, &mut self.globals)?;
        link(mem.region_mut(), bus, tasks, &self.globals)?;

        if opts.dump_before {
            out.write_all(mem.region())?;
            out.flush()?;
        }
        if opts.dry_run {
            info!("dry run, skipping execution");
            return Ok((false, None));
        }

        self.mailbox.set_qpu_enabled(true)?;

        let start = opts.measure_time.then(Instant::now);
        let executed = self
            .mailbox
            .execute_qpu(self.count as u32, bus, false, self.timeout_ms);
        let elapsed = start.map(|t| t.elapsed());

        if let Err(e) = &executed {
            error!("Failed to execute GPU program: {e}");
        }
        if let Some(elapsed) = elapsed {
            info!(?elapsed, "execution time");
        }

        let dumped = self.dump_after(mem, opts, out);
        let disabled = self.mailbox.set_qpu_enabled(false);

        if let Err(e) = executed {
            for err in [dumped.err(), disabled.err()].into_iter().flatten() {
                warn!("{err}");
            }
            return Err(e);
        }
        // The tasks ran, so a lost dump is only reported.
        if let Err(e) = dumped {
            warn!("Failed to dump GPU memory: {e}");
        }
        disabled?;

        Ok((true, elapsed))
    }

    fn dump_after(&self, mem: &DmaBuffer, opts: &DispatchOptions, out: &mut dyn Write) -> QpuResult<()> {
        if opts.dump_after {
            out.write_all(mem.region())?;
        } else if opts.dump_outputs && !opts.dump_before {
            let region = mem.region();
            let buffers = self
                .globals
                .write_buffer()
                .into_iter()
                .chain(self.tasks().iter().filter_map(TaskSlot::write_buffer));
            for buf in buffers {
                let offset = buf.offset().unwrap_or_default() as usize;
                let len = buf.len() as usize;
                let bytes = region.get(offset..offset + len).ok_or(QpuError::RegionBounds {
                    offset,
                    len,
                    size: region.len(),
                })?;
                out.write_all(bytes)?;
            }
        }
        out.flush()?;
        Ok(())
    }

    /// Closes every declared input and returns to the empty state. Safe to call at any
    /// time, any number of times. The executor is empty afterwards even if a close fails.
    ///
    /// # Errors
    /// The first input that failed to close. Every input is still closed and each
    /// failure is logged.
    pub fn teardown(&mut self) -> QpuResult<()> {
        if self.count > 0 {
            debug!(tasks = self.count, "tearing down tasks");
        }
        let slots = std::mem::replace(&mut self.slots, std::array::from_fn(|_| TaskSlot::default()));
        let globals = std::mem::take(&mut self.globals);
        self.count = 0;

        let mut first = None;
        let inputs = slots
            .into_iter()
            .flat_map(TaskSlot::into_inputs)
            .chain(globals.into_inputs());
        for input in inputs {
            let path = input.path().to_path_buf();
            if let Err(e) = input.close() {
                warn!(path = %path.display(), "Failed to close input: {e}");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}
