use crate::error::{QpuError, QpuResult, ResourceKind};
use crate::gpu::resource::{FileInput, INSTRUCTION_FACTOR, WriteBuffer};
use crate::gpu::task::{Globals, TaskSlot};
use std::fmt;
use tracing::{debug, warn};

/// Load-immediate encodings whose immediate word may carry a placeholder.
pub const LINK_OPCODES: [u32; 8] = [
    0xe002_0827, // ldi r0
    0xe002_0867, // ldi r1
    0xe002_08a7, // ldi r2
    0xe002_08e7, // ldi r3
    0xe002_0ca7, // ldi vpm read setup
    0xe002_1ca7, // ldi vpm write setup
    0xe002_0e27, // ldi tmu0 s
    0xe002_0f27, // ldi tmu1 s
];

pub const GLOBAL_READ_BUFFER: u32 = 0xffff_fff1;
pub const GLOBAL_WRITE_BUFFER: u32 = 0xffff_fff2;
pub const TASK_READ_BUFFER: u32 = 0xffff_fffa;
pub const TASK_WRITE_BUFFER: u32 = 0xffff_fffb;

#[must_use]
pub fn is_link_instruction(word: u32) -> bool {
    LINK_OPCODES.contains(&word)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderKind {
    GlobalReadBuffer,
    GlobalWriteBuffer,
    TaskReadBuffer,
    TaskWriteBuffer,
}

impl PlaceholderKind {
    pub const ALL: [Self; 4] = [
        Self::GlobalReadBuffer,
        Self::GlobalWriteBuffer,
        Self::TaskReadBuffer,
        Self::TaskWriteBuffer,
    ];

    #[must_use]
    pub const fn from_word(word: u32) -> Option<Self> {
        match word {
            GLOBAL_READ_BUFFER => Some(Self::GlobalReadBuffer),
            GLOBAL_WRITE_BUFFER => Some(Self::GlobalWriteBuffer),
            TASK_READ_BUFFER => Some(Self::TaskReadBuffer),
            TASK_WRITE_BUFFER => Some(Self::TaskWriteBuffer),
            _ => None,
        }
    }

    const fn index(self) -> usize {
        self as usize
    }

    const fn label(self) -> &'static str {
        match self {
            Self::GlobalReadBuffer => "global read buffer",
            Self::GlobalWriteBuffer => "global write buffer",
            Self::TaskReadBuffer => "read buffer",
            Self::TaskWriteBuffer => "write buffer",
        }
    }
}

impl fmt::Display for PlaceholderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Which side of the binding is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkProblem {
    /// The code references a buffer that was never declared.
    MissingResource,
    /// A declared per-task buffer is never referenced by the task's code.
    MissingPlaceholder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkIssue {
    pub task: usize,
    pub kind: PlaceholderKind,
    pub problem: LinkProblem,
}

impl fmt::Display for LinkIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (task, kind) = (self.task, self.kind);
        match self.problem {
            LinkProblem::MissingResource => write!(f, "Missing {kind} for task {task} placeholder"),
            LinkProblem::MissingPlaceholder => {
                write!(f, "Missing placeholder for task {task} {kind}")
            }
        }
    }
}

/// Every binding mismatch found across all tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkErrors(Vec<LinkIssue>);

impl LinkErrors {
    #[must_use]
    pub fn issues(&self) -> &[LinkIssue] {
        &self.0
    }
}

impl fmt::Display for LinkErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, issue) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{issue}")?;
        }
        Ok(())
    }
}

/// Bus addresses the four placeholders resolve to for one task. `None` for an undeclared
/// buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkTargets {
    pub global_read: Option<u32>,
    pub global_write: Option<u32>,
    pub task_read: Option<u32>,
    pub task_write: Option<u32>,
}

impl LinkTargets {
    const fn get(&self, kind: PlaceholderKind) -> Option<u32> {
        match kind {
            PlaceholderKind::GlobalReadBuffer => self.global_read,
            PlaceholderKind::GlobalWriteBuffer => self.global_write,
            PlaceholderKind::TaskReadBuffer => self.task_read,
            PlaceholderKind::TaskWriteBuffer => self.task_write,
        }
    }
}

/// Placeholder kinds seen while scanning one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Found([bool; 4]);

impl Found {
    #[must_use]
    pub const fn contains(&self, kind: PlaceholderKind) -> bool {
        self.0[kind.index()]
    }

    fn insert(&mut self, kind: PlaceholderKind) {
        self.0[kind.index()] = true;
    }
}

/// Rewrites the placeholders in one instruction stream.
///
/// `stream` is a run of 64-bit little-endian instructions. A placeholder whose target is
/// `None` is recorded but left untouched.
///
/// # Errors
/// `MalformedInstructions` if `stream` is not a whole number of instructions.
pub fn patch_stream(task: usize, stream: &mut [u8], targets: &LinkTargets) -> QpuResult<Found> {
    if stream.len() % INSTRUCTION_FACTOR as usize != 0 {
        return Err(QpuError::MalformedInstructions {
            task,
            len: u32::try_from(stream.len()).unwrap_or(u32::MAX),
        });
    }

    let mut found = Found::default();
    for (n, inst) in stream.chunks_exact_mut(INSTRUCTION_FACTOR as usize).enumerate() {
        let (imm, op) = inst.split_at_mut(4);
        if !is_link_instruction(u32::from_le_bytes([op[0], op[1], op[2], op[3]])) {
            continue;
        }
        let word = u32::from_le_bytes([imm[0], imm[1], imm[2], imm[3]]);
        let Some(kind) = PlaceholderKind::from_word(word) else {
            continue;
        };

        found.insert(kind);
        if let Some(addr) = targets.get(kind) {
            imm.copy_from_slice(&addr.to_le_bytes());
            debug!(task, instruction = n, %kind, addr = format_args!("{addr:#010x}"), "linked");
        }
    }

    Ok(found)
}

fn check(task: usize, found: Found, slot: &TaskSlot, globals: &Globals, issues: &mut Vec<LinkIssue>) {
    let mut issue = |kind, problem| issues.push(LinkIssue { task, kind, problem });

    if found.contains(PlaceholderKind::GlobalReadBuffer) && globals.read_buffer().is_none() {
        issue(PlaceholderKind::GlobalReadBuffer, LinkProblem::MissingResource);
    }
    if found.contains(PlaceholderKind::GlobalWriteBuffer) && globals.write_buffer().is_none() {
        issue(PlaceholderKind::GlobalWriteBuffer, LinkProblem::MissingResource);
    }

    for (kind, declared) in [
        (PlaceholderKind::TaskReadBuffer, slot.read_buffer().is_some()),
        (PlaceholderKind::TaskWriteBuffer, slot.write_buffer().is_some()),
    ] {
        match (found.contains(kind), declared) {
            (true, false) => issue(kind, LinkProblem::MissingResource),
            (false, true) => issue(kind, LinkProblem::MissingPlaceholder),
            _ => {}
        }
    }
}

fn staged(offset: Option<u32>, kind: ResourceKind) -> QpuResult<u32> {
    offset.ok_or(QpuError::NotStaged(kind))
}

/// Patches every task's staged instruction stream in `region` and checks that each
/// placeholder has a declared buffer and each per-task buffer has a placeholder.
///
/// `bus` is the bus address of `region[0]`. Every task is scanned before any mismatch is
/// reported.
///
/// # Errors
/// `Link` carrying every mismatch, or a consistency error if a resource was never staged.
pub fn link(region: &mut [u8], bus: u32, tasks: &[TaskSlot], globals: &Globals) -> QpuResult<()> {
    let addr = |offset: u32| bus.wrapping_add(offset);
    let global_read = globals
        .read_buffer()
        .map(|b| staged(b.offset(), ResourceKind::GlobalReadBuffer))
        .transpose()?;
    let global_write = globals
        .write_buffer()
        .map(|b| staged(b.offset(), ResourceKind::GlobalWriteBuffer))
        .transpose()?;

    let mut issues = Vec::new();
    for (i, task) in tasks.iter().enumerate() {
        let inst = task.instructions().ok_or(QpuError::TaskNotActive(i))?;
        let offset = staged(inst.offset(), ResourceKind::TaskInstructions(i))? as usize;
        let len = inst.len() as usize;
        let size = region.len();
        let stream = region
            .get_mut(offset..offset + len)
            .ok_or(QpuError::RegionBounds { offset, len, size })?;

        let targets = LinkTargets {
            global_read: global_read.map(addr),
            global_write: global_write.map(addr),
            task_read: task
                .read_buffer()
                .map(|b| staged(FileInput::offset(b), ResourceKind::TaskReadBuffer(i)))
                .transpose()?
                .map(addr),
            task_write: task
                .write_buffer()
                .map(|b| staged(WriteBuffer::offset(b), ResourceKind::TaskWriteBuffer(i)))
                .transpose()?
                .map(addr),
        };

        let found = patch_stream(i, stream, &targets)?;
        check(i, found, task, globals, &mut issues);
    }

    if issues.is_empty() {
        return Ok(());
    }
    for issue in &issues {
        warn!("{issue}");
    }
    Err(QpuError::Link(LinkErrors(issues)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LDI_R0: u32 = 0xe002_0827;
    const LDI_VPMW: u32 = 0xe002_1ca7;
    const NOP: u32 = 0x1000_09e7;

    fn stream(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    fn words(bytes: &[u8]) -> Vec<u32> {
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn recognizes_every_link_opcode() {
        for op in LINK_OPCODES {
            assert!(is_link_instruction(op));
        }
        assert!(!is_link_instruction(NOP));
    }

    #[test]
    fn patches_first_word_of_matching_pairs() {
        let mut code = stream(&[TASK_READ_BUFFER, LDI_R0, GLOBAL_WRITE_BUFFER, LDI_VPMW, 0, NOP]);
        let targets = LinkTargets {
            task_read: Some(0x4000_1000),
            global_write: Some(0x4000_2000),
            ..LinkTargets::default()
        };

        let found = patch_stream(0, &mut code, &targets).expect("patch");
        assert!(found.contains(PlaceholderKind::TaskReadBuffer));
        assert!(found.contains(PlaceholderKind::GlobalWriteBuffer));
        assert!(!found.contains(PlaceholderKind::TaskWriteBuffer));
        assert_eq!(
            words(&code),
            vec![0x4000_1000, LDI_R0, 0x4000_2000, LDI_VPMW, 0, NOP]
        );
    }

    #[test]
    fn ignores_placeholder_without_load_immediate() {
        let mut code = stream(&[TASK_WRITE_BUFFER, NOP]);
        let targets = LinkTargets {
            task_write: Some(0x4000_0100),
            ..LinkTargets::default()
        };
        let found = patch_stream(0, &mut code, &targets).expect("patch");
        assert_eq!(found, Found::default());
        assert_eq!(words(&code), vec![TASK_WRITE_BUFFER, NOP]);
    }

    #[test]
    fn placeholder_word_in_second_position_is_not_a_placeholder() {
        let mut code = stream(&[LDI_R0, TASK_READ_BUFFER]);
        let found = patch_stream(0, &mut code, &LinkTargets::default()).expect("patch");
        assert_eq!(found, Found::default());
    }

    #[test]
    fn unresolved_placeholder_is_recorded_and_left_alone() {
        let mut code = stream(&[GLOBAL_READ_BUFFER, LDI_R0]);
        let found = patch_stream(3, &mut code, &LinkTargets::default()).expect("patch");
        assert!(found.contains(PlaceholderKind::GlobalReadBuffer));
        assert_eq!(words(&code), vec![GLOBAL_READ_BUFFER, LDI_R0]);
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let mut code = stream(&[TASK_READ_BUFFER, LDI_R0, 0]);
        let err = patch_stream(5, &mut code, &LinkTargets::default()).unwrap_err();
        assert!(matches!(err, QpuError::MalformedInstructions { task: 5, len: 12 }));
    }

    #[test]
    fn issues_read_like_diagnostics() {
        let errors = LinkErrors(vec![
            LinkIssue {
                task: 0,
                kind: PlaceholderKind::GlobalReadBuffer,
                problem: LinkProblem::MissingResource,
            },
            LinkIssue {
                task: 1,
                kind: PlaceholderKind::TaskReadBuffer,
                problem: LinkProblem::MissingResource,
            },
            LinkIssue {
                task: 2,
                kind: PlaceholderKind::TaskWriteBuffer,
                problem: LinkProblem::MissingPlaceholder,
            },
        ]);
        assert_eq!(
            errors.to_string(),
            "Missing global read buffer for task 0 placeholder; \
             Missing read buffer for task 1 placeholder; \
             Missing placeholder for task 2 write buffer"
        );
        assert_eq!(errors.issues().len(), 3);
    }

    #[test]
    fn placeholder_kinds_round_trip_their_words() {
        let words = [
            GLOBAL_READ_BUFFER,
            GLOBAL_WRITE_BUFFER,
            TASK_READ_BUFFER,
            TASK_WRITE_BUFFER,
        ];
        for (kind, word) in PlaceholderKind::ALL.into_iter().zip(words) {
            assert_eq!(PlaceholderKind::from_word(word), Some(kind));
        }
        assert_eq!(PlaceholderKind::from_word(0xffff_fff3), None);
    }
}
