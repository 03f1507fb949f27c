use crate::error::{QpuError, QpuResult};
use crate::gpu::control::{CONTROL_BLOCK_SIZE, ControlBlock};
use crate::gpu::layout::{LayoutPlan, Slot};
use crate::gpu::resource::{FileInput, WriteBuffer};
use crate::gpu::task::{Globals, TaskSlot};
use tracing::debug;

enum Target<'a> {
    Control,
    File(&'a mut FileInput),
    Buffer(&'a mut WriteBuffer),
}

fn resolve<'a>(slot: Slot, tasks: &'a mut [TaskSlot], globals: &'a mut Globals) -> Option<Target<'a>> {
    let target = match slot {
        Slot::ControlBlock => Target::Control,
        Slot::Instructions(i) => Target::File(tasks.get_mut(i)?.instructions.as_mut()?),
        Slot::GlobalUniforms => Target::File(globals.uniforms.as_mut()?),
        Slot::Uniforms(i) => Target::File(tasks.get_mut(i)?.uniforms.as_mut()?),
        Slot::GlobalReadBuffer => Target::File(globals.read_buffer.as_mut()?),
        Slot::ReadBuffer(i) => Target::File(tasks.get_mut(i)?.read_buffer.as_mut()?),
        Slot::GlobalWriteBuffer => Target::Buffer(globals.write_buffer.as_mut()?),
        Slot::WriteBuffer(i) => Target::Buffer(tasks.get_mut(i)?.write_buffer.as_mut()?),
    };
    Some(target)
}

fn region_slice(region: &mut [u8], offset: u32, len: u32) -> QpuResult<&mut [u8]> {
    let (offset, len) = (offset as usize, len as usize);
    let size = region.len();
    region
        .get_mut(offset..offset + len)
        .ok_or(QpuError::RegionBounds { offset, len, size })
}

/// Copies every file-backed input into `region` in plan order, assigns offsets to the
/// write buffers and writes the control block at the start of the region.
///
/// `bus` is the bus address of `region[0]`.
///
/// # Errors
/// `LayoutMismatch` if the staged bytes do not add up to the planned size, `RegionBounds`
/// if the region is smaller than planned, or the I/O error from reading an input.
pub fn stage(
    region: &mut [u8],
    bus: u32,
    plan: &LayoutPlan,
    tasks: &mut [TaskSlot],
    globals: &mut Globals,
) -> QpuResult<ControlBlock> {
    let mut cursor: u32 = 0;
    let mismatch = |staged| QpuError::LayoutMismatch {
        staged,
        planned: plan.total,
    };

    for placement in &plan.placements {
        let offset = cursor;
        let Some(target) = resolve(placement.slot, tasks, globals) else {
            return Err(mismatch(cursor));
        };

        match target {
            Target::Control => {
                if placement.len != CONTROL_BLOCK_SIZE {
                    return Err(mismatch(cursor));
                }
            }
            Target::File(input) => {
                if input.len() != placement.len {
                    return Err(mismatch(cursor));
                }
                input.read_into(region_slice(region, offset, placement.len)?)?;
                input.set_offset(offset);
            }
            Target::Buffer(buf) => {
                if buf.len() != placement.len {
                    return Err(mismatch(cursor));
                }
                region_slice(region, offset, placement.len)?;
                buf.set_offset(offset);
            }
        }

        debug!(slot = %placement.slot, offset, len = placement.len, "staged");
        cursor += placement.len;
    }

    if cursor != plan.total {
        return Err(mismatch(cursor));
    }

    let control = control_block(bus, tasks, globals);
    region_slice(region, 0, CONTROL_BLOCK_SIZE)?.copy_from_slice(&control.to_bytes());
    Ok(control)
}

/// Per-task uniforms win over the global uniforms; a task with neither gets address 0.
fn control_block(bus: u32, tasks: &[TaskSlot], globals: &Globals) -> ControlBlock {
    let mut control = ControlBlock::default();
    let global_unif = globals.uniforms().and_then(FileInput::offset);

    for (entry, task) in control.entries.iter_mut().zip(tasks) {
        let unif = task.uniforms().and_then(FileInput::offset).or(global_unif);
        if let Some(offset) = unif {
            entry.uniforms = bus.wrapping_add(offset);
        }
        if let Some(offset) = task.instructions().and_then(FileInput::offset) {
            entry.instructions = bus.wrapping_add(offset);
        }
    }

    control
}
