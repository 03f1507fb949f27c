#![allow(clippy::cast_possible_truncation)]

use crate::error::{QpuError, QpuResult};
use crate::gpu::control::CONTROL_BLOCK_SIZE;
use crate::gpu::task::{Globals, TaskSlot};
use std::fmt;

/// Upper bound on a single execution region; the firmware carves it out of GPU memory.
pub const MAX_REGION_SIZE: u64 = 1 << 30;

/// A resource that occupies bytes in the execution region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    ControlBlock,
    Instructions(usize),
    GlobalUniforms,
    Uniforms(usize),
    GlobalReadBuffer,
    ReadBuffer(usize),
    GlobalWriteBuffer,
    WriteBuffer(usize),
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ControlBlock => write!(f, "control block"),
            Self::Instructions(i) => write!(f, "task {i} instructions"),
            Self::GlobalUniforms => write!(f, "global uniforms"),
            Self::Uniforms(i) => write!(f, "task {i} uniforms"),
            Self::GlobalReadBuffer => write!(f, "global read buffer"),
            Self::ReadBuffer(i) => write!(f, "task {i} read buffer"),
            Self::GlobalWriteBuffer => write!(f, "global write buffer"),
            Self::WriteBuffer(i) => write!(f, "task {i} write buffer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub slot: Slot,
    pub len: u32,
}

/// The ordered list of resources to stage and the total region size.
///
/// Order: control block, all instructions, global then per-task uniforms, global then
/// per-task read buffers, global then per-task write buffers. Tasks are visited in slot
/// order within each group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayoutPlan {
    pub placements: Vec<Placement>,
    pub total: u32,
}

impl LayoutPlan {
    /// Plans the region for `tasks` and `globals`.
    ///
    /// # Errors
    /// `RegionTooLarge` if the resources add up to more than [`MAX_REGION_SIZE`].
    pub fn plan(tasks: &[TaskSlot], globals: &Globals) -> QpuResult<Self> {
        let mut plan = Self::default();
        plan.push(Slot::ControlBlock, CONTROL_BLOCK_SIZE);

        for (i, task) in tasks.iter().enumerate() {
            if let Some(inst) = task.instructions() {
                plan.push(Slot::Instructions(i), inst.len());
            }
        }

        if let Some(unif) = globals.uniforms() {
            plan.push(Slot::GlobalUniforms, unif.len());
        }
        for (i, task) in tasks.iter().enumerate() {
            if let Some(unif) = task.uniforms() {
                plan.push(Slot::Uniforms(i), unif.len());
            }
        }

        if let Some(rbuf) = globals.read_buffer() {
            plan.push(Slot::GlobalReadBuffer, rbuf.len());
        }
        for (i, task) in tasks.iter().enumerate() {
            if let Some(rbuf) = task.read_buffer() {
                plan.push(Slot::ReadBuffer(i), rbuf.len());
            }
        }

        if let Some(wbuf) = globals.write_buffer() {
            plan.push(Slot::GlobalWriteBuffer, wbuf.len());
        }
        for (i, task) in tasks.iter().enumerate() {
            if let Some(wbuf) = task.write_buffer() {
                plan.push(Slot::WriteBuffer(i), wbuf.len());
            }
        }

        let total: u64 = plan.placements.iter().map(|p| u64::from(p.len)).sum::<u64>();
        if total > MAX_REGION_SIZE {
            return Err(QpuError::RegionTooLarge(total));
        }
        plan.total = total as u32;
        Ok(plan)
    }

    fn push(&mut self, slot: Slot, len: u32) {
        self.placements.push(Placement { slot, len });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::resource::{FileInput, INSTRUCTION_FACTOR, WORD_FACTOR, WriteBuffer};
    use std::io::Write;

    fn fixture(len: usize) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().expect("tempfile");
        f.write_all(&vec![0u8; len]).expect("write");
        f
    }

    #[test]
    fn empty_plan_is_control_block_only() {
        let plan = LayoutPlan::plan(&[], &Globals::default()).expect("plan");
        assert_eq!(plan.total, CONTROL_BLOCK_SIZE);
        assert_eq!(plan.placements.len(), 1);
    }

    #[test]
    fn groups_by_kind_in_task_order() {
        let inst = fixture(16);
        let unif = fixture(4);
        let rbuf = fixture(8);

        let mut globals = Globals::default();
        globals
            .set_uniforms(FileInput::open(unif.path(), WORD_FACTOR).expect("unif"))
            .expect("global unif");
        globals
            .set_write_buffer(WriteBuffer::new(32).expect("wbuf"))
            .expect("global wbuf");

        let mut tasks: Vec<TaskSlot> = (0..2).map(|_| TaskSlot::default()).collect();
        for (i, task) in tasks.iter_mut().enumerate() {
            task.set_instructions(i, FileInput::open(inst.path(), INSTRUCTION_FACTOR).expect("inst"))
                .expect("set inst");
        }
        tasks[1]
            .set_read_buffer(1, FileInput::open(rbuf.path(), WORD_FACTOR).expect("rbuf"))
            .expect("set rbuf");
        tasks[0]
            .set_write_buffer(0, WriteBuffer::new(64).expect("wbuf"))
            .expect("set wbuf");

        let plan = LayoutPlan::plan(&tasks, &globals).expect("plan");
        let slots: Vec<Slot> = plan.placements.iter().map(|p| p.slot).collect();
        assert_eq!(
            slots,
            vec![
                Slot::ControlBlock,
                Slot::Instructions(0),
                Slot::Instructions(1),
                Slot::GlobalUniforms,
                Slot::ReadBuffer(1),
                Slot::GlobalWriteBuffer,
                Slot::WriteBuffer(0),
            ]
        );
        assert_eq!(plan.total, CONTROL_BLOCK_SIZE + 16 + 16 + 4 + 8 + 32 + 64);
    }
}
