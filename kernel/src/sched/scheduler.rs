//! Core scheduler implementation.
//!
//! Round-robin with priority preference over a circular task list. Task
//! records live in an id-keyed arena owned by the scheduler; the circular
//! next/prev links are ids, not pointers. Every decision starts at
//! `current.next` and picks the READY task with the numerically lowest
//! priority, ties breaking in list order; the idle task runs only when no
//! other task is ready. All scheduler state is mutated with interrupts
//! disabled.

use alloc::{boxed::Box, collections::BTreeMap, string::String, vec::Vec};
use spin::Mutex;

use super::task::{Priority, Task, TaskFlags, TaskId, TaskState, UserStack};
use crate::{
    arch::context::CpuContext,
    error::{KernelError, KernelResult},
    mm::{
        align_down_4k,
        user::{is_user_addr, UserMemory, USER_LIMIT},
        VirtAddr, PAGE_SIZE,
    },
    timer, vfs,
};

/// Ticks a task may hold the CPU before preemption.
pub const DEFAULT_QUANTUM_TICKS: u32 = 10;

/// User stack size (excluding the guard page).
pub const USER_STACK_SIZE: usize = 64 * 1024;

/// Base of the per-task user stack slots.
const USER_STACK_REGION: u32 = 0xA000_0000;

/// Scheduler state
pub struct Scheduler {
    /// Arena of task records, keyed by id. Boxing keeps each record (and
    /// its CPU context) at a stable address across arena mutation.
    tasks: BTreeMap<TaskId, Box<Task>>,
    /// Any member of the circular list; insertion point for new tasks.
    list_head: Option<TaskId>,
    /// The task currently holding the CPU.
    current: Option<TaskId>,
    /// The idle task, selected only when nothing else is ready.
    idle: Option<TaskId>,
    next_task_id: TaskId,
    pub quantum_ticks: u32,
    pub enabled: bool,
    /// Context switches performed since boot.
    pub total_switches: u64,
}

/// One row of [`Scheduler::tasks_snapshot`].
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: String,
    pub state: TaskState,
    pub priority: Priority,
    pub time_slice: u32,
    pub total_runtime: u64,
    pub switch_count: u64,
}

impl Scheduler {
    /// Create new scheduler
    pub const fn new() -> Self {
        Self {
            tasks: BTreeMap::new(),
            list_head: None,
            current: None,
            idle: None,
            next_task_id: 1,
            quantum_ticks: DEFAULT_QUANTUM_TICKS,
            enabled: false,
            total_switches: 0,
        }
    }

    /// Create the idle task and enable scheduling. The caller's context
    /// becomes the idle task's on the first switch away from it.
    pub fn init(&mut self) -> KernelResult<TaskId> {
        if self.idle.is_some() {
            return Err(KernelError::InvalidState {
                expected: "uninitialized scheduler",
                actual: "idle task exists",
            });
        }
        let id = self.spawn_kernel_task("idle", Priority::Low, idle_main, 0)?;
        self.idle = Some(id);
        self.current = Some(id);
        self.tasks.get_mut(&id).expect("idle task").state = TaskState::Running;
        self.enabled = true;
        Ok(id)
    }

    pub fn current_id(&self) -> Option<TaskId> {
        self.current
    }

    pub fn idle_id(&self) -> Option<TaskId> {
        self.idle
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// The currently running task.
    pub fn current_task(&self) -> Option<&Task> {
        self.current.and_then(|id| self.tasks.get(&id)).map(|t| &**t)
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id).map(|t| &**t)
    }

    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&id).map(|t| &mut **t)
    }

    fn alloc_id(&mut self) -> TaskId {
        let id = self.next_task_id;
        self.next_task_id += 1;
        id
    }

    /// Create a kernel task and insert it as READY.
    pub fn spawn_kernel_task(
        &mut self,
        name: &str,
        priority: Priority,
        entry: fn(usize),
        arg: usize,
    ) -> KernelResult<TaskId> {
        let id = self.alloc_id();
        let mut task = Box::new(Task::new(id, name, priority));
        task.entry = Some((entry, arg));
        task.context = CpuContext::kernel(
            task_entry_trampoline as usize as u32,
            task.kernel_stack.initial_esp() as u32,
        );
        task.time_slice = self.quantum_ticks;
        self.tasks.insert(id, task);
        self.link_tail(id);
        self.tasks.get_mut(&id).expect("fresh task").state = TaskState::Ready;
        log::debug!("created task {} '{}' ({:?})", id, name, priority);
        Ok(id)
    }

    /// Create a user task: validate and expose the code pages, build the
    /// guarded user stack with its System-V i386 argv block, then insert
    /// a kernel task whose first dispatch drops to Ring 3.
    pub fn spawn_user_task(
        &mut self,
        name: &str,
        priority: Priority,
        user: &mut dyn UserMemory,
        user_entry: u32,
        code_base: u32,
        code_size: u32,
        argv: &[&str],
    ) -> KernelResult<TaskId> {
        if !is_user_addr(user_entry) || !is_user_addr(code_base) {
            return Err(KernelError::InvalidAddress {
                addr: user_entry as usize,
            });
        }

        // The code pages must be present and user-visible before the task
        // ever reaches Ring 3; pages a kernel mapping already claimed are
        // patched rather than remapped.
        let first = align_down_4k(code_base);
        let last = align_down_4k(code_base + code_size.saturating_sub(1));
        let mut page = first;
        loop {
            user.ensure_user(VirtAddr::new(page))?;
            if page >= last {
                break;
            }
            page += PAGE_SIZE as u32;
        }

        // One stack slot per task id: guard page, then the mapped stack.
        let slot = (USER_STACK_SIZE + 2 * PAGE_SIZE) as u32;
        let guard = USER_STACK_REGION + self.next_task_id as u32 * slot;
        let base = guard + PAGE_SIZE as u32;
        if base + USER_STACK_SIZE as u32 >= USER_LIMIT {
            return Err(KernelError::ResourceExhausted {
                resource: "user stack slots",
            });
        }
        // The guard page stays unmapped: user stack underflow faults.
        user.map_region(VirtAddr::new(base), USER_STACK_SIZE, name)?;
        let top = base + USER_STACK_SIZE as u32;
        let initial_esp = build_user_stack(user, top, argv)?;

        let id = self.spawn_kernel_task(name, priority, user_task_trampoline, 0)?;
        let task = self.tasks.get_mut(&id).expect("fresh user task");
        task.flags |= TaskFlags::USER_MODE;
        task.user_entry = Some(user_entry);
        task.user_code_base = code_base;
        task.user_code_size = code_size;
        task.user_stack = Some(UserStack {
            guard_page: VirtAddr::new(guard),
            base: VirtAddr::new(base),
            size: USER_STACK_SIZE,
            initial_esp,
        });
        Ok(id)
    }

    /// Insert `id` at the tail of the circular list.
    fn link_tail(&mut self, id: TaskId) {
        match self.list_head {
            None => {
                self.list_head = Some(id);
                let task = self.tasks.get_mut(&id).expect("linking unknown task");
                task.next = id;
                task.prev = id;
            }
            Some(head) => {
                let tail = self.tasks[&head].prev;
                {
                    let task = self.tasks.get_mut(&id).expect("linking unknown task");
                    task.next = head;
                    task.prev = tail;
                }
                self.tasks.get_mut(&tail).expect("corrupted task list").next = id;
                self.tasks.get_mut(&head).expect("corrupted task list").prev = id;
            }
        }
    }

    /// Remove `id` from the circular list, leaving it self-linked.
    fn unlink(&mut self, id: TaskId) {
        let (next, prev) = {
            let task = &self.tasks[&id];
            (task.next, task.prev)
        };
        if next == id {
            self.list_head = None;
        } else {
            self.tasks.get_mut(&prev).expect("corrupted task list").next = next;
            self.tasks.get_mut(&next).expect("corrupted task list").prev = prev;
            if self.list_head == Some(id) {
                self.list_head = Some(next);
            }
        }
        let task = self.tasks.get_mut(&id).expect("unlinking unknown task");
        task.next = id;
        task.prev = id;
    }

    /// Ids in ring order starting at `start`. Panics on a corrupted ring.
    fn ring_from(&self, start: TaskId) -> Vec<TaskId> {
        let mut ids = Vec::with_capacity(self.tasks.len());
        let mut id = start;
        for _ in 0..self.tasks.len() {
            ids.push(id);
            id = self.tasks.get(&id).expect("scheduler: corrupted task list").next;
            if id == start {
                return ids;
            }
        }
        panic!("scheduler: corrupted task list (no cycle back to {})", start);
    }

    fn has_ready_non_idle(&self) -> bool {
        self.tasks
            .iter()
            .any(|(id, t)| Some(*id) != self.idle && t.state == TaskState::Ready)
    }

    /// Select the next task: round-robin from `current.next`, preferring
    /// the numerically lowest priority; ties break in list order. Returns
    /// `None` when no non-idle task is ready.
    pub fn pick_next(&self) -> Option<TaskId> {
        let cur = self.current?;
        let start = self.tasks.get(&cur)?.next;
        let mut best: Option<TaskId> = None;
        for id in self.ring_from(start) {
            if Some(id) == self.idle {
                continue;
            }
            let task = &self.tasks[&id];
            if task.state != TaskState::Ready {
                continue;
            }
            let better = match best {
                None => true,
                Some(b) => task.priority < self.tasks[&b].priority,
            };
            if better {
                best = Some(id);
            }
        }
        best
    }

    /// Process one timer tick: wake due sleepers, account runtime and
    /// quantum, and return the task to switch to (if any).
    pub fn timer_tick(&mut self, now: u64) -> Option<TaskId> {
        if !self.enabled {
            return None;
        }

        // 1. Wake sleepers whose deadline has passed.
        let ids: Vec<TaskId> = self.tasks.keys().copied().collect();
        for id in ids {
            let task = self.tasks.get_mut(&id).expect("task vanished");
            if task.state == TaskState::Sleeping && now >= task.sleep_until_tick {
                task.state = TaskState::Ready;
            }
        }

        let cur = self.current?;

        // 2. Runtime accounting; 3. quantum (the idle task is exempt).
        let (state, slice) = {
            let task = self.tasks.get_mut(&cur).expect("current task vanished");
            task.total_runtime += 1;
            if Some(cur) != self.idle && task.state == TaskState::Running && task.time_slice > 0 {
                task.time_slice -= 1;
            }
            (task.state, task.time_slice)
        };

        let idle_with_work = Some(cur) == self.idle && self.has_ready_non_idle();
        if state == TaskState::Running && slice > 0 && !idle_with_work {
            return None;
        }

        let next = match self.pick_next().or(self.idle) {
            Some(next) => next,
            None => panic!("scheduler: no runnable task and no idle task"),
        };
        if next == cur {
            // Sole runnable task: grant a fresh quantum and keep going.
            self.tasks.get_mut(&cur).expect("current task vanished").time_slice =
                self.quantum_ticks;
            return None;
        }
        Some(next)
    }

    /// Voluntary yield: the task to switch to, or `None` to continue.
    pub fn yield_current(&mut self) -> Option<TaskId> {
        if !self.enabled {
            return None;
        }
        let next = self.pick_next()?;
        if Some(next) == self.current {
            return None;
        }
        Some(next)
    }

    /// Put the current task to sleep for at least `ceil(ms / tick)` ticks
    /// (minimum one) and return the task to switch to.
    pub fn sleep_current(&mut self, now: u64, ms: u64) -> KernelResult<Option<TaskId>> {
        let cur = self.current.ok_or(KernelError::InvalidState {
            expected: "current task",
            actual: "none",
        })?;
        if Some(cur) == self.idle {
            return Err(KernelError::InvalidState {
                expected: "non-idle task",
                actual: "idle",
            });
        }
        {
            let task = self.tasks.get_mut(&cur).expect("current task vanished");
            task.sleep_until_tick = now + timer::ms_to_ticks(ms);
            task.state = TaskState::Sleeping;
        }
        Ok(self.pick_next().or(self.idle).filter(|n| *n != cur))
    }

    /// Mark the current task FINISHED and return the task to switch to.
    /// Exiting the idle task is forbidden.
    pub fn exit_current(&mut self, code: i32) -> KernelResult<Option<TaskId>> {
        let cur = self.current.ok_or(KernelError::InvalidState {
            expected: "current task",
            actual: "none",
        })?;
        if Some(cur) == self.idle {
            return Err(KernelError::InvalidState {
                expected: "non-idle task",
                actual: "idle",
            });
        }
        {
            let task = self.tasks.get_mut(&cur).expect("current task vanished");
            task.state = TaskState::Finished;
            task.exit_code = code;
        }
        log::debug!("task {} finished (code {})", cur, code);
        Ok(self.pick_next().or(self.idle).filter(|n| *n != cur))
    }

    /// Destroy a task. The current task is only marked ZOMBIE (the caller
    /// must switch away and let the reaper free it); any other task is
    /// unlinked and freed immediately, closing its file descriptors.
    pub fn destroy(
        &mut self,
        id: TaskId,
        vfs: Option<&mut dyn vfs::Vfs>,
    ) -> KernelResult<Option<TaskId>> {
        if !self.tasks.contains_key(&id) {
            return Err(KernelError::TaskNotFound { id });
        }
        if Some(id) == self.current {
            self.tasks.get_mut(&id).expect("current task vanished").state = TaskState::Zombie;
            return Ok(self.pick_next().or(self.idle).filter(|n| *n != id));
        }
        self.remove_task(id, vfs);
        Ok(None)
    }

    fn remove_task(&mut self, id: TaskId, vfs: Option<&mut dyn vfs::Vfs>) {
        self.unlink(id);
        let task = self.tasks.remove(&id).expect("removing unknown task");
        if !task.kernel_stack.canary_intact() {
            log::error!("task {} '{}': kernel stack canary clobbered", id, task.name);
        }
        if let Some(vfs) = vfs {
            for fd in task.fd_table.iter().flatten() {
                let _ = vfs.close(*fd);
            }
        }
        // Kernel stack (and any user stack bookkeeping) freed with the box.
    }

    /// Free every FINISHED/ZOMBIE task that is not current. Runs from the
    /// idle loop after each halt.
    pub fn reap(&mut self, mut vfs: Option<&mut dyn vfs::Vfs>) -> usize {
        let victims: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|(id, t)| {
                Some(**id) != self.current
                    && matches!(t.state, TaskState::Finished | TaskState::Zombie)
            })
            .map(|(id, _)| *id)
            .collect();
        let count = victims.len();
        for id in victims {
            let vfs_ref: Option<&mut dyn vfs::Vfs> = match vfs.as_mut() {
                Some(v) => Some(&mut **v),
                None => None,
            };
            self.remove_task(id, vfs_ref);
        }
        count
    }

    /// Commit a switch decision: state transitions, quantum refill and
    /// statistics. The architectural register switch happens around this
    /// in the bare-metal glue.
    pub fn switch_to(&mut self, next: TaskId) -> KernelResult<(TaskId, TaskId)> {
        let cur = self.current.ok_or(KernelError::InvalidState {
            expected: "current task",
            actual: "none",
        })?;
        assert_ne!(cur, next, "scheduler: context switch with identical tasks");
        if !self.tasks.contains_key(&next) {
            return Err(KernelError::TaskNotFound { id: next });
        }
        {
            let task = self.tasks.get_mut(&cur).expect("current task vanished");
            if task.state == TaskState::Running {
                task.state = TaskState::Ready;
            }
        }
        {
            let task = self.tasks.get_mut(&next).expect("next task vanished");
            task.state = TaskState::Running;
            task.time_slice = self.quantum_ticks;
            task.switch_count += 1;
        }
        self.current = Some(next);
        self.total_switches += 1;
        Ok((cur, next))
    }

    /// Debug snapshot of every task in ring order.
    pub fn tasks_snapshot(&self) -> Vec<TaskInfo> {
        let Some(head) = self.list_head else {
            return Vec::new();
        };
        self.ring_from(head)
            .into_iter()
            .map(|id| {
                let task = &self.tasks[&id];
                TaskInfo {
                    id,
                    name: task.name.clone(),
                    state: task.state,
                    priority: task.priority,
                    time_slice: task.time_slice,
                    total_runtime: task.total_runtime,
                    switch_count: task.switch_count,
                }
            })
            .collect()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the System-V i386 `_start` argument block on a user stack.
///
/// From the top downwards: string bodies, 4-byte alignment, the NULL
/// argv sentinel, the argv pointers in reverse, then argc. The returned
/// ESP points at argc.
pub fn build_user_stack(
    user: &mut dyn UserMemory,
    top: u32,
    argv: &[&str],
) -> KernelResult<u32> {
    let mut sp = top;
    let mut ptrs = Vec::with_capacity(argv.len());
    ptrs.resize(argv.len(), 0u32);

    for i in (0..argv.len()).rev() {
        let bytes = argv[i].as_bytes();
        sp -= bytes.len() as u32 + 1;
        user.copy_out(VirtAddr::new(sp), bytes)?;
        user.copy_out(VirtAddr::new(sp + bytes.len() as u32), &[0])?;
        ptrs[i] = sp;
    }

    sp &= !3;
    sp -= 4;
    user.write_u32(VirtAddr::new(sp), 0)?; // argv NULL sentinel
    for i in (0..argv.len()).rev() {
        sp -= 4;
        user.write_u32(VirtAddr::new(sp), ptrs[i])?;
    }
    sp -= 4;
    user.write_u32(VirtAddr::new(sp), argv.len() as u32)?; // argc

    Ok(sp)
}

/// First code every kernel task runs: enable interrupts, call the entry
/// function, then exit with status 0 if it returns.
extern "C" fn task_entry_trampoline() -> ! {
    let (entry, arg) = with_scheduler(|s| s.current_task().and_then(|t| t.entry))
        .expect("task trampoline without an entry point");
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    crate::arch::x86::enable_interrupts();
    entry(arg);
    task_exit(0);
}

/// Kernel-side entry of a user task. On first dispatch it confirms the
/// code page is present and user-visible, synthesizes the Ring-3 context
/// and drops to user mode. Never returns.
fn user_task_trampoline(_arg: usize) {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        use crate::mm::PageFlags;

        let ctx = with_scheduler(|s| {
            let task = s.current_task().expect("user trampoline without current task");
            let entry = task.user_entry.expect("user task without an entry point");
            let stack = task.user_stack.expect("user task without a stack");
            (entry, stack.initial_esp)
        });
        let entry_page = VirtAddr::new(align_down_4k(ctx.0));
        let flags = crate::mm::paging::kernel_space()
            .lock()
            .get_flags(entry_page)
            .unwrap_or(PageFlags::empty());
        assert!(
            flags.contains(PageFlags::PRESENT | PageFlags::USER),
            "user code page {:#x} not present+user",
            entry_page.as_u32()
        );
        let user_ctx = CpuContext::user(ctx.0, ctx.1);
        // SAFETY: Code page verified mapped and user-accessible; the stack
        // was mapped and populated at spawn time.
        unsafe { crate::arch::x86::usermode::enter_usermode(&user_ctx) }
    }
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    unreachable!("user tasks require the bare-metal target");
}

/// Idle loop: halt until an interrupt, then reap finished tasks.
fn idle_main(_arg: usize) {
    loop {
        crate::arch::halt();
        with_scheduler(|s| s.reap(None));
    }
}

/// Global scheduler instance.
pub static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());

/// Run `f` against the global scheduler with interrupts disabled.
pub fn with_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    crate::arch::without_interrupts(|| f(&mut SCHEDULER.lock()))
}

/// Architectural register switch between two committed tasks.
#[cfg(all(target_arch = "x86", target_os = "none"))]
fn perform_switch(old: TaskId, new: TaskId) {
    let (old_ctx, new_ctx) = {
        let mut sched = SCHEDULER.lock();
        let old_ctx = sched
            .task_mut(old)
            .map(|t| &mut t.context as *mut CpuContext)
            .expect("switching from unknown task");
        let new_ctx = sched
            .task(new)
            .map(|t| &t.context as *const CpuContext)
            .expect("switching to unknown task");
        (old_ctx, new_ctx)
    };
    // SAFETY: Both contexts live in boxed task records the arena keeps at
    // stable addresses; interrupts are disabled by every caller.
    unsafe { crate::arch::x86::switch::context_switch(old_ctx, new_ctx) }
}

fn commit_and_switch(pair: Option<(TaskId, TaskId)>) {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    if let Some((old, new)) = pair {
        perform_switch(old, new);
    }
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    let _ = pair;
}

/// Voluntarily give up the CPU.
pub fn yield_now() {
    crate::arch::without_interrupts(|| {
        let pair = {
            let mut sched = SCHEDULER.lock();
            sched.yield_current().and_then(|next| sched.switch_to(next).ok())
        };
        commit_and_switch(pair);
    });
}

/// Sleep for at least `ms` milliseconds (10 ms resolution).
pub fn sleep_ms(ms: u64) {
    crate::arch::without_interrupts(|| {
        let now = timer::ticks();
        let pair = {
            let mut sched = SCHEDULER.lock();
            match sched.sleep_current(now, ms) {
                Ok(Some(next)) => sched.switch_to(next).ok(),
                _ => None,
            }
        };
        commit_and_switch(pair);
    });
}

/// Terminate the current task. Never returns; if the scheduler ever hands
/// control back to a finished task the CPU halts for good.
pub fn task_exit(code: i32) -> ! {
    crate::arch::without_interrupts(|| {
        let pair = {
            let mut sched = SCHEDULER.lock();
            match sched.exit_current(code) {
                Ok(Some(next)) => sched.switch_to(next).ok(),
                _ => None,
            }
        };
        commit_and_switch(pair);
    });
    crate::arch::halt_forever()
}

/// Timer-interrupt entry: run the tick bookkeeping and preempt if due.
pub fn on_tick(now: u64) {
    crate::arch::without_interrupts(|| {
        let pair = {
            let mut sched = SCHEDULER.lock();
            sched.timer_tick(now).and_then(|next| sched.switch_to(next).ok())
        };
        commit_and_switch(pair);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockUserMemory;

    fn noop(_arg: usize) {}

    /// Scheduler with idle plus `n` normal-priority tasks; current=idle.
    fn sched_with_tasks(n: usize) -> (Scheduler, Vec<TaskId>) {
        let mut sched = Scheduler::new();
        sched.init().expect("init");
        let ids = (0..n)
            .map(|i| {
                sched
                    .spawn_kernel_task(&alloc::format!("task{}", i), Priority::Normal, noop, 0)
                    .expect("spawn")
            })
            .collect();
        (sched, ids)
    }

    #[test]
    fn init_leaves_exactly_one_running_task() {
        let (sched, _) = sched_with_tasks(2);
        let running: Vec<TaskId> = sched
            .tasks_snapshot()
            .into_iter()
            .filter(|t| t.state == TaskState::Running)
            .map(|t| t.id)
            .collect();
        assert_eq!(running, alloc::vec![sched.current_id().unwrap()]);
        assert!(sched.enabled);
        assert_eq!(sched.current_id(), sched.idle_id());
    }

    #[test]
    fn task_ids_are_monotonic() {
        let (_, ids) = sched_with_tasks(3);
        assert!(ids.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[test]
    fn tick_moves_off_idle_when_work_is_ready() {
        let (mut sched, ids) = sched_with_tasks(2);
        let next = sched.timer_tick(1).expect("switch decision");
        // First inserted task after idle in ring order.
        assert_eq!(next, ids[0]);
        sched.switch_to(next).expect("switch");
        assert_eq!(sched.current_id(), Some(ids[0]));
        assert_eq!(sched.task(ids[0]).unwrap().state, TaskState::Running);
        assert_eq!(sched.task(sched.idle_id().unwrap()).unwrap().state, TaskState::Ready);
    }

    #[test]
    fn equal_priorities_rotate_round_robin() {
        let (mut sched, ids) = sched_with_tasks(3);
        sched.switch_to(ids[0]).expect("switch");
        // From task0, the next ready peer in ring order is task1.
        assert_eq!(sched.pick_next(), Some(ids[1]));
        sched.switch_to(ids[1]).expect("switch");
        assert_eq!(sched.pick_next(), Some(ids[2]));
        sched.switch_to(ids[2]).expect("switch");
        assert_eq!(sched.pick_next(), Some(ids[0]));
    }

    #[test]
    fn lowest_priority_value_wins() {
        let (mut sched, ids) = sched_with_tasks(1);
        let high = sched
            .spawn_kernel_task("hi", Priority::High, noop, 0)
            .expect("spawn");
        let low = sched
            .spawn_kernel_task("lo", Priority::Low, noop, 0)
            .expect("spawn");
        assert_eq!(sched.pick_next(), Some(high));
        sched.switch_to(high).expect("switch");
        // With the high task running, normal beats low.
        assert_eq!(sched.pick_next(), Some(ids[0]));
        let _ = low;
    }

    #[test]
    fn priority_ties_break_in_list_order() {
        let (sched, ids) = sched_with_tasks(2);
        // Starting from idle.next, task0 is encountered first.
        assert_eq!(sched.pick_next(), Some(ids[0]));
    }

    #[test]
    fn quantum_expiry_preempts_after_quantum_ticks() {
        let (mut sched, ids) = sched_with_tasks(2);
        sched.switch_to(ids[0]).expect("switch");
        let quantum = sched.quantum_ticks as u64;
        for now in 1..quantum {
            assert_eq!(sched.timer_tick(now), None, "preempted early at tick {}", now);
        }
        // The tick that drains the quantum forces a switch.
        let next = sched.timer_tick(quantum).expect("preemption");
        assert_eq!(next, ids[1]);
        assert_eq!(sched.task(ids[0]).unwrap().time_slice, 0);
        sched.switch_to(next).expect("switch");
        assert_eq!(sched.task(ids[1]).unwrap().time_slice, sched.quantum_ticks);
    }

    #[test]
    fn sole_runnable_task_gets_a_fresh_quantum() {
        let (mut sched, ids) = sched_with_tasks(1);
        sched.switch_to(ids[0]).expect("switch");
        for now in 1..=sched.quantum_ticks as u64 {
            assert_eq!(sched.timer_tick(now), None);
        }
        assert_eq!(sched.task(ids[0]).unwrap().time_slice, sched.quantum_ticks);
    }

    #[test]
    fn runtime_accrues_to_the_running_task() {
        let (mut sched, ids) = sched_with_tasks(2);
        sched.switch_to(ids[0]).expect("switch");
        for now in 1..=5 {
            sched.timer_tick(now);
        }
        assert_eq!(sched.task(ids[0]).unwrap().total_runtime, 5);
        assert_eq!(sched.task(ids[1]).unwrap().total_runtime, 0);
    }

    #[test]
    fn sleep_wakes_no_earlier_than_the_deadline() {
        let (mut sched, ids) = sched_with_tasks(2);
        sched.switch_to(ids[0]).expect("switch");

        // sleep(25ms) at tick 100 -> wake at tick 103 (ceil(25/10)).
        let next = sched.sleep_current(100, 25).expect("sleep").expect("next");
        assert_eq!(sched.task(ids[0]).unwrap().sleep_until_tick, 103);
        sched.switch_to(next).expect("switch");

        for now in 101..103 {
            sched.timer_tick(now);
            assert_eq!(
                sched.task(ids[0]).unwrap().state,
                TaskState::Sleeping,
                "woke early at tick {}",
                now
            );
        }
        sched.timer_tick(103);
        assert_eq!(sched.task(ids[0]).unwrap().state, TaskState::Ready);
    }

    #[test]
    fn sleep_lasts_at_least_one_tick() {
        let (mut sched, ids) = sched_with_tasks(2);
        sched.switch_to(ids[0]).expect("switch");
        sched.sleep_current(7, 0).expect("sleep");
        assert_eq!(sched.task(ids[0]).unwrap().sleep_until_tick, 8);
    }

    #[test]
    fn finished_tasks_are_reaped_but_never_the_current_one() {
        let (mut sched, ids) = sched_with_tasks(2);
        sched.switch_to(ids[0]).expect("switch");

        let next = sched.exit_current(42).expect("exit").expect("next");
        assert_eq!(sched.task(ids[0]).unwrap().state, TaskState::Finished);
        assert_eq!(sched.task(ids[0]).unwrap().exit_code, 42);

        // Still current: the reaper must skip it.
        assert_eq!(sched.reap(None), 0);
        sched.switch_to(next).expect("switch");
        assert_eq!(sched.reap(None), 1);
        assert!(sched.task(ids[0]).is_none());
        assert_eq!(sched.task_count(), 2); // idle + task1
    }

    #[test]
    fn exiting_the_idle_task_is_rejected() {
        let (mut sched, _) = sched_with_tasks(1);
        // current == idle after init
        assert!(sched.exit_current(0).is_err());
        assert!(sched.sleep_current(0, 10).is_err());
    }

    #[test]
    fn idle_runs_only_when_nothing_is_ready() {
        let (mut sched, ids) = sched_with_tasks(1);
        sched.switch_to(ids[0]).expect("switch");
        sched.sleep_current(0, 50).expect("sleep");
        // Only the idle task is runnable now.
        assert_eq!(sched.pick_next(), None);
        let next = sched.timer_tick(1).expect("switch to idle");
        assert_eq!(Some(next), sched.idle_id());
    }

    #[test]
    fn destroying_a_peer_unlinks_it_from_the_ring() {
        let (mut sched, ids) = sched_with_tasks(3);
        sched.destroy(ids[1], None).expect("destroy");
        assert!(sched.task(ids[1]).is_none());
        let ring: Vec<TaskId> = sched.tasks_snapshot().iter().map(|t| t.id).collect();
        assert_eq!(ring.len(), 3); // idle + 2 survivors
        assert!(!ring.contains(&ids[1]));
    }

    #[test]
    fn destroying_the_current_task_marks_it_zombie() {
        let (mut sched, ids) = sched_with_tasks(2);
        sched.switch_to(ids[0]).expect("switch");
        let next = sched.destroy(ids[0], None).expect("destroy").expect("next");
        assert_eq!(sched.task(ids[0]).unwrap().state, TaskState::Zombie);
        sched.switch_to(next).expect("switch");
        assert_eq!(sched.reap(None), 1);
    }

    #[test]
    fn destroying_an_unknown_task_fails() {
        let (mut sched, _) = sched_with_tasks(1);
        assert!(matches!(
            sched.destroy(999, None),
            Err(KernelError::TaskNotFound { id: 999 })
        ));
    }

    #[test]
    #[should_panic(expected = "identical tasks")]
    fn switching_to_the_current_task_panics() {
        let (mut sched, _) = sched_with_tasks(1);
        let cur = sched.current_id().unwrap();
        let _ = sched.switch_to(cur);
    }

    #[test]
    fn switches_are_counted() {
        let (mut sched, ids) = sched_with_tasks(2);
        sched.switch_to(ids[0]).expect("switch");
        sched.switch_to(ids[1]).expect("switch");
        assert_eq!(sched.total_switches, 2);
        assert_eq!(sched.task(ids[1]).unwrap().switch_count, 1);
    }

    // --- user task creation -------------------------------------------------

    #[test]
    fn user_task_builds_a_guarded_stack_and_argv() {
        let mut sched = Scheduler::new();
        sched.init().expect("init");
        let mut user = MockUserMemory::new();
        // Code page the program was loaded at.
        user.map_region(VirtAddr::new(0x0040_0000), PAGE_SIZE, "code")
            .expect("code map");

        let id = sched
            .spawn_user_task(
                "init",
                Priority::Normal,
                &mut user,
                0x0040_0000,
                0x0040_0000,
                PAGE_SIZE as u32,
                &["init", "--verbose"],
            )
            .expect("spawn user");

        let task = sched.task(id).unwrap();
        assert!(task.is_user());
        assert_eq!(task.user_entry, Some(0x0040_0000));
        let stack = task.user_stack.expect("user stack");

        // The guard page (lowest page of the slot) is not mapped.
        assert!(!user.is_mapped(stack.guard_page));
        assert!(user.is_mapped(stack.base));

        // ESP points at argc, then come the argv pointers and NULL.
        let esp = VirtAddr::new(stack.initial_esp);
        assert_eq!(stack.initial_esp % 4, 0);
        assert_eq!(user.read_u32(esp).unwrap(), 2);
        let argv0 = user.read_u32(esp.add(4)).unwrap();
        let argv1 = user.read_u32(esp.add(8)).unwrap();
        assert_eq!(user.read_u32(esp.add(12)).unwrap(), 0);
        assert_eq!(user.read_c_string(VirtAddr::new(argv0)), "init");
        assert_eq!(user.read_c_string(VirtAddr::new(argv1)), "--verbose");
    }

    #[test]
    fn user_entry_outside_the_user_window_is_rejected() {
        let mut sched = Scheduler::new();
        sched.init().expect("init");
        let mut user = MockUserMemory::new();
        for bad in [0x1000u32, 0xC000_0000] {
            assert!(matches!(
                sched.spawn_user_task("bad", Priority::Normal, &mut user, bad, bad, 0x1000, &[]),
                Err(KernelError::InvalidAddress { .. })
            ));
        }
    }

    #[test]
    fn user_code_pages_must_be_mapped() {
        let mut sched = Scheduler::new();
        sched.init().expect("init");
        let mut user = MockUserMemory::new();
        // No code mapped at the entry address.
        assert!(sched
            .spawn_user_task(
                "bad",
                Priority::Normal,
                &mut user,
                0x0040_0000,
                0x0040_0000,
                0x1000,
                &[]
            )
            .is_err());
    }

    #[test]
    fn argv_block_with_no_arguments_is_just_argc_and_null() {
        let mut user = MockUserMemory::new();
        user.map_region(VirtAddr::new(0x0100_0000), PAGE_SIZE, "stack")
            .expect("map");
        let esp = build_user_stack(&mut user, 0x0100_1000, &[]).expect("build");
        assert_eq!(user.read_u32(VirtAddr::new(esp)).unwrap(), 0);
        assert_eq!(user.read_u32(VirtAddr::new(esp + 4)).unwrap(), 0);
    }
}
