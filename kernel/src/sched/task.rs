//! Task records: state, priority, CPU context, owned kernel stack and the
//! intrusive links of the scheduler's circular list.

use alloc::{boxed::Box, string::String, vec};
use bitflags::bitflags;

use crate::{arch::context::CpuContext, mm::VirtAddr, vfs};

/// Task identifier; monotonically increasing, never reused.
pub type TaskId = u64;

/// Kernel stack size per task.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;
/// Fill pattern for fresh kernel stacks (stack-depth diagnostics).
pub const STACK_FILL: u8 = 0xAA;
/// Sentinel below the stack top; a clobbered canary means overflow.
pub const STACK_CANARY: u32 = 0xDEAD_BEEF;
/// Longest task name kept (longer names are truncated).
pub const TASK_NAME_MAX: usize = 31;
/// Per-task file descriptor table size.
pub const MAX_OPEN_FILES: usize = 16;

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Ready,
    Running,
    Sleeping,
    Waiting,
    Finished,
    Zombie,
}

/// Task priority; lower numeric value is preferred by the scheduler.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    High = 0,
    #[default]
    Normal = 1,
    Low = 2,
}

bitflags! {
    /// Task attribute flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskFlags: u32 {
        /// The task runs in Ring 3 after its first dispatch.
        const USER_MODE = 1 << 0;
    }
}

/// An owned, pattern-filled kernel stack with a canary under its top.
pub struct KernelStack {
    mem: Box<[u8]>,
    top: usize,
}

impl KernelStack {
    /// Allocate a stack, fill it with [`STACK_FILL`], align the top down
    /// to 16 bytes and plant [`STACK_CANARY`] directly below it.
    pub fn new() -> Self {
        let mem = vec![STACK_FILL; KERNEL_STACK_SIZE].into_boxed_slice();
        let base = mem.as_ptr() as usize;
        let top = (base + KERNEL_STACK_SIZE) & !0xF;
        let mut stack = Self { mem, top };
        let off = stack.top - 4 - base;
        stack.mem[off..off + 4].copy_from_slice(&STACK_CANARY.to_le_bytes());
        stack
    }

    fn base(&self) -> usize {
        self.mem.as_ptr() as usize
    }

    /// 16-byte-aligned stack top.
    pub fn top(&self) -> usize {
        self.top
    }

    /// Initial ESP: 16 bytes below the top, keeping the canary intact and
    /// the stack pointer 16-byte aligned.
    pub fn initial_esp(&self) -> usize {
        self.top - 16
    }

    /// Whether the canary word still holds its value.
    pub fn canary_intact(&self) -> bool {
        let off = self.top - 4 - self.base();
        self.mem[off..off + 4] == STACK_CANARY.to_le_bytes()
    }

    /// Bytes of the fill pattern still untouched at the low end; an
    /// approximation of the deepest stack use so far.
    pub fn bytes_free(&self) -> usize {
        self.mem.iter().take_while(|&&b| b == STACK_FILL).count()
    }
}

impl Default for KernelStack {
    fn default() -> Self {
        Self::new()
    }
}

/// User stack placement of a Ring-3 task.
#[derive(Debug, Clone, Copy)]
pub struct UserStack {
    /// Lowest page of the allocation; left unmapped as a guard page.
    pub guard_page: VirtAddr,
    /// First mapped byte (guard_page + 4 KiB).
    pub base: VirtAddr,
    /// Mapped size in bytes.
    pub size: usize,
    /// ESP after the argv block was built (points at argc).
    pub initial_esp: u32,
}

/// A schedulable task.
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub state: TaskState,
    pub priority: Priority,
    pub context: CpuContext,
    pub kernel_stack: KernelStack,
    pub user_stack: Option<UserStack>,
    pub user_entry: Option<u32>,
    pub user_code_base: u32,
    pub user_code_size: u32,
    pub flags: TaskFlags,
    /// Ticks left in the current quantum.
    pub time_slice: u32,
    /// Total ticks this task has been the running task.
    pub total_runtime: u64,
    /// Times this task has been switched in.
    pub switch_count: u64,
    pub exit_code: i32,
    /// Tick at which a sleeping task becomes ready again.
    pub sleep_until_tick: u64,
    /// Kernel entry point and argument, consumed by the entry trampoline.
    pub entry: Option<(fn(usize), usize)>,
    pub fd_table: [Option<vfs::Fd>; MAX_OPEN_FILES],
    // Circular list links, maintained by the scheduler.
    pub(super) next: TaskId,
    pub(super) prev: TaskId,
}

impl Task {
    /// Create a task record in the `Created` state. The scheduler assigns
    /// links and readies it on insert.
    pub fn new(id: TaskId, name: &str, priority: Priority) -> Self {
        let name: String = name.chars().take(TASK_NAME_MAX).collect();
        Self {
            id,
            name,
            state: TaskState::Created,
            priority,
            context: CpuContext::zeroed(),
            kernel_stack: KernelStack::new(),
            user_stack: None,
            user_entry: None,
            user_code_base: 0,
            user_code_size: 0,
            flags: TaskFlags::empty(),
            time_slice: 0,
            total_runtime: 0,
            switch_count: 0,
            exit_code: 0,
            sleep_until_tick: 0,
            entry: None,
            fd_table: [None; MAX_OPEN_FILES],
            next: id,
            prev: id,
        }
    }

    pub fn is_user(&self) -> bool {
        self.flags.contains(TaskFlags::USER_MODE)
    }
}
