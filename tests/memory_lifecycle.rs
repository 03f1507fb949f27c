mod common;

use common::*;
use qpu_rs::error::QpuError;
use qpu_rs::error::QpuResult;
use qpu_rs::gpu::{DmaBuffer, Mapping, PhysMapper};

/// Hands out mappings one page shorter than asked for.
#[derive(Default)]
struct ShortMapper(HeapMapper);

impl PhysMapper for ShortMapper {
    fn map(&self, phys: u32, len: usize) -> QpuResult<Mapping> {
        self.0.map(phys, len.saturating_sub(PAGE_SIZE as usize))
    }

    fn unmap(&self, mapping: Mapping) -> QpuResult<()> {
        self.0.unmap(mapping)
    }
}

#[test]
fn acquire_allocates_locks_and_maps() {
    let mailbox = MockMailbox::default();
    let mapper = HeapMapper::default();

    let mut mem = DmaBuffer::acquire(&mailbox, &mapper, 5000, PAGE_SIZE).expect("acquire");
    assert!(mem.is_allocated() && mem.is_locked() && mem.is_mapped());
    assert_eq!(mem.ref_count(), 1);
    assert_eq!(mem.alloc_size(), 2 * PAGE_SIZE);
    assert_eq!(mem.data_size(), 5000);
    assert_eq!(mem.region().len(), 5000);
    assert_eq!(mem.bus_address(), MockMailbox::bus_for(mem.handle()));
    assert_eq!(mem.bus_address_at(96), mem.bus_address() + 96);
    assert_eq!(mapper.mapped(), vec![mem.bus_address() & 0x3fff_ffff]);

    mem.region_mut()[4999] = 0xaa;
    assert_eq!(mem.region()[4999], 0xaa);

    mem.release(&mailbox, &mapper).expect("release");
    assert!(mem.is_quiescent());
    assert!(mem.region().is_empty());
    assert_eq!(mapper.live(), 0);
    assert_eq!(
        mailbox.calls(),
        vec![
            Call::Alloc {
                size: 2 * PAGE_SIZE,
                align: PAGE_SIZE,
                flags: 3 << 2,
            },
            Call::Lock(1),
            Call::Unlock(1),
            Call::Free(1),
        ]
    );
}

#[test]
fn lock_failure_frees_allocation() {
    let mailbox = MockMailbox::default();
    let mapper = HeapMapper::default();
    mailbox.fail_lock.set(true);

    let err = DmaBuffer::acquire(&mailbox, &mapper, 100, PAGE_SIZE).unwrap_err();
    assert!(matches!(err, QpuError::Lock { handle: 1, .. }));
    assert_eq!(
        mailbox.calls(),
        vec![
            Call::Alloc {
                size: PAGE_SIZE,
                align: PAGE_SIZE,
                flags: 3 << 2,
            },
            Call::Lock(1),
            Call::Free(1),
        ]
    );
    assert!(mapper.mapped().is_empty());
}

#[test]
fn map_failure_unlocks_then_frees() {
    let mailbox = MockMailbox::default();
    let mapper = HeapMapper::default();
    mapper.fail_map.set(true);

    let err = DmaBuffer::acquire(&mailbox, &mapper, 100, PAGE_SIZE).unwrap_err();
    assert!(matches!(err, QpuError::Map { .. }));
    assert!(mailbox.calls().ends_with(&[Call::Lock(1), Call::Unlock(1), Call::Free(1)]));
    assert_eq!(mapper.live(), 0);
}

#[test]
fn alloc_failure_has_nothing_to_undo() {
    let mailbox = MockMailbox::default();
    let mapper = HeapMapper::default();
    mailbox.fail_alloc.set(true);

    let err = DmaBuffer::acquire(&mailbox, &mapper, 100, PAGE_SIZE).unwrap_err();
    assert!(matches!(err, QpuError::Alloc { size: PAGE_SIZE, .. }));
    assert_eq!(mailbox.calls().len(), 1);
}

#[test]
fn last_owner_tears_down() {
    let mailbox = MockMailbox::default();
    let mapper = HeapMapper::default();

    let mut mem = DmaBuffer::acquire(&mailbox, &mapper, 64, PAGE_SIZE).expect("acquire");
    mem.retain();
    assert_eq!(mem.ref_count(), 2);

    mem.release(&mailbox, &mapper).expect("first release");
    assert!(mem.is_mapped());
    assert!(!mailbox.calls().contains(&Call::Free(1)));

    mem.release(&mailbox, &mapper).expect("second release");
    assert_eq!(mem.ref_count(), 0);
    assert!(mem.is_quiescent());
    assert!(mailbox.calls().contains(&Call::Free(1)));
}

#[test]
fn teardown_continues_past_a_failed_step() {
    let mailbox = MockMailbox::default();
    let mapper = HeapMapper::default();
    let mut mem = DmaBuffer::acquire(&mailbox, &mapper, 64, PAGE_SIZE).expect("acquire");

    mailbox.fail_unlock.set(true);
    let err = mem.release(&mailbox, &mapper).unwrap_err();
    assert!(matches!(err, QpuError::FirmwareRejected { .. }));
    assert!(mem.is_quiescent());
    assert_eq!(mapper.live(), 0);
    assert!(mailbox.calls().ends_with(&[Call::Unlock(1), Call::Free(1)]));
}

#[test]
fn short_mapping_is_rejected_and_undone() {
    let mailbox = MockMailbox::default();
    let mapper = ShortMapper::default();

    let err = DmaBuffer::acquire(&mailbox, &mapper, 5000, PAGE_SIZE).unwrap_err();
    match err {
        QpuError::Map { source, .. } => assert!(matches!(
            *source,
            QpuError::RegionBounds { offset: 0, len, size }
                if len == 2 * PAGE_SIZE as usize && size == PAGE_SIZE as usize
        )),
        other => panic!("expected map failure, got {other:?}"),
    }
    assert_eq!(mapper.0.mapped().len(), 1);
    assert_eq!(mapper.0.live(), 0);
    assert!(mailbox.calls().ends_with(&[Call::Lock(1), Call::Unlock(1), Call::Free(1)]));
}
