use crate::gpu::task::MAX_TASKS;

/// Bytes per control-block entry: uniforms address, instructions address.
pub const ENTRY_SIZE: usize = 8;

/// Size of the control block at the start of every execution region.
pub const CONTROL_BLOCK_SIZE: u32 = (MAX_TASKS * ENTRY_SIZE) as u32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlEntry {
    pub uniforms: u32,
    pub instructions: u32,
}

/// Per-slot bus addresses read by the QPU scheduler. Unused slots stay zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlBlock {
    pub entries: [ControlEntry; MAX_TASKS],
}

impl ControlBlock {
    /// Little-endian wire form, in slot order.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; CONTROL_BLOCK_SIZE as usize] {
        let mut out = [0u8; CONTROL_BLOCK_SIZE as usize];
        for (chunk, entry) in out.chunks_exact_mut(ENTRY_SIZE).zip(&self.entries) {
            chunk[..4].copy_from_slice(&entry.uniforms.to_le_bytes());
            chunk[4..].copy_from_slice(&entry.instructions.to_le_bytes());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_covers_every_slot() {
        assert_eq!(CONTROL_BLOCK_SIZE, 96);
    }

    #[test]
    fn encodes_pairs_in_slot_order() {
        let mut cb = ControlBlock::default();
        cb.entries[0] = ControlEntry {
            uniforms: 0x4000_1000,
            instructions: 0x4000_0060,
        };
        cb.entries[2].instructions = 0xdead_beef;

        let bytes = cb.to_bytes();
        assert_eq!(&bytes[0..4], &[0x00, 0x10, 0x00, 0x40]);
        assert_eq!(&bytes[4..8], &[0x60, 0x00, 0x00, 0x40]);
        assert_eq!(&bytes[8..16], &[0; 8]);
        assert_eq!(&bytes[16..20], &[0; 4]);
        assert_eq!(&bytes[20..24], &[0xef, 0xbe, 0xad, 0xde]);
        assert!(bytes[24..].iter().all(|&b| b == 0));
    }
}
