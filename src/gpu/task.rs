use crate::error::{QpuError, QpuResult, ResourceKind};
use crate::gpu::resource::{FileInput, WriteBuffer};

/// Number of task slots in the control block.
pub const MAX_TASKS: usize = 12;

/// Lifecycle of one task slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotState {
    /// Begun, but no instructions declared yet.
    #[default]
    Empty,
    /// Instructions declared.
    Active,
    /// At least one uniforms/read/write resource attached.
    Resourced,
    /// Part of a completed dispatch. Terminal.
    Executed,
}

fn put<T>(slot: &mut Option<T>, value: T, kind: ResourceKind) -> QpuResult<()> {
    if slot.is_some() {
        return Err(QpuError::DuplicateResource(kind));
    }
    *slot = Some(value);
    Ok(())
}

/// One unit of QPU work: an instruction stream and its optional resources.
#[derive(Debug, Default)]
pub struct TaskSlot {
    state: SlotState,
    pub(crate) instructions: Option<FileInput>,
    pub(crate) uniforms: Option<FileInput>,
    pub(crate) read_buffer: Option<FileInput>,
    pub(crate) write_buffer: Option<WriteBuffer>,
}

impl TaskSlot {
    pub(crate) fn set_instructions(&mut self, index: usize, input: FileInput) -> QpuResult<()> {
        if self.state == SlotState::Executed {
            return Err(QpuError::TaskExecuted(index));
        }
        put(
            &mut self.instructions,
            input,
            ResourceKind::TaskInstructions(index),
        )?;
        self.state = SlotState::Active;
        Ok(())
    }

    fn check_attachable(&self, index: usize) -> QpuResult<()> {
        match self.state {
            SlotState::Empty => Err(QpuError::TaskNotActive(index)),
            SlotState::Executed => Err(QpuError::TaskExecuted(index)),
            SlotState::Active | SlotState::Resourced => Ok(()),
        }
    }

    pub(crate) fn set_uniforms(&mut self, index: usize, input: FileInput) -> QpuResult<()> {
        self.check_attachable(index)?;
        put(&mut self.uniforms, input, ResourceKind::TaskUniforms(index))?;
        self.state = SlotState::Resourced;
        Ok(())
    }

    pub(crate) fn set_read_buffer(&mut self, index: usize, input: FileInput) -> QpuResult<()> {
        self.check_attachable(index)?;
        put(
            &mut self.read_buffer,
            input,
            ResourceKind::TaskReadBuffer(index),
        )?;
        self.state = SlotState::Resourced;
        Ok(())
    }

    pub(crate) fn set_write_buffer(&mut self, index: usize, buf: WriteBuffer) -> QpuResult<()> {
        self.check_attachable(index)?;
        put(
            &mut self.write_buffer,
            buf,
            ResourceKind::TaskWriteBuffer(index),
        )?;
        self.state = SlotState::Resourced;
        Ok(())
    }

    /// Builds a copy for replication: new streams onto the same input files and a fresh,
    /// unshared write buffer of the same size.
    pub(crate) fn replica(&self) -> QpuResult<Self> {
        let dup = |input: &Option<FileInput>| input.as_ref().map(FileInput::try_clone).transpose();

        Ok(Self {
            state: self.state,
            instructions: dup(&self.instructions)?,
            uniforms: dup(&self.uniforms)?,
            read_buffer: dup(&self.read_buffer)?,
            write_buffer: self.write_buffer.as_ref().map(WriteBuffer::replica),
        })
    }

    /// The file inputs held by the slot, in declaration order.
    pub(crate) fn into_inputs(self) -> impl Iterator<Item = FileInput> {
        [self.instructions, self.uniforms, self.read_buffer]
            .into_iter()
            .flatten()
    }

    pub(crate) fn mark_executed(&mut self) {
        self.state = SlotState::Executed;
    }

    #[must_use]
    pub const fn state(&self) -> SlotState {
        self.state
    }

    /// True once instructions are declared.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.instructions.is_some()
    }

    #[must_use]
    pub const fn instructions(&self) -> Option<&FileInput> {
        self.instructions.as_ref()
    }

    #[must_use]
    pub const fn uniforms(&self) -> Option<&FileInput> {
        self.uniforms.as_ref()
    }

    #[must_use]
    pub const fn read_buffer(&self) -> Option<&FileInput> {
        self.read_buffer.as_ref()
    }

    #[must_use]
    pub const fn write_buffer(&self) -> Option<&WriteBuffer> {
        self.write_buffer.as_ref()
    }
}

/// Resources shared by every task.
///
/// Global uniforms apply only to tasks without their own uniforms. Global read and write
/// buffers are reachable from any task that references their placeholder, whether or not
/// the task declares its own buffers.
#[derive(Debug, Default)]
pub struct Globals {
    pub(crate) uniforms: Option<FileInput>,
    pub(crate) read_buffer: Option<FileInput>,
    pub(crate) write_buffer: Option<WriteBuffer>,
}

impl Globals {
    pub(crate) fn into_inputs(self) -> impl Iterator<Item = FileInput> {
        [self.uniforms, self.read_buffer].into_iter().flatten()
    }

    pub(crate) fn set_uniforms(&mut self, input: FileInput) -> QpuResult<()> {
        put(&mut self.uniforms, input, ResourceKind::GlobalUniforms)
    }

    pub(crate) fn set_read_buffer(&mut self, input: FileInput) -> QpuResult<()> {
        put(&mut self.read_buffer, input, ResourceKind::GlobalReadBuffer)
    }

    pub(crate) fn set_write_buffer(&mut self, buf: WriteBuffer) -> QpuResult<()> {
        put(&mut self.write_buffer, buf, ResourceKind::GlobalWriteBuffer)
    }

    #[must_use]
    pub const fn uniforms(&self) -> Option<&FileInput> {
        self.uniforms.as_ref()
    }

    #[must_use]
    pub const fn read_buffer(&self) -> Option<&FileInput> {
        self.read_buffer.as_ref()
    }

    #[must_use]
    pub const fn write_buffer(&self) -> Option<&WriteBuffer> {
        self.write_buffer.as_ref()
    }
}
