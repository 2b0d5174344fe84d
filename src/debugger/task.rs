use crate::debugger::address::{GlobalAddress, RelocatedAddress};
use crate::debugger::debugee::dwarf::DebugInfo;
use crate::debugger::error::Error;
use crate::debugger::TargetMemory;
use crate::muted_error;
use log::debug;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};

/// Identifier of a logical task (green thread), as assigned by the debugee
/// runtime. Id 0 stands for "no task": an OS thread executing on a
/// runtime-internal stack.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl TaskId {
    pub const NONE: TaskId = TaskId(0);
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A logical task sighted by the debugger.
pub struct Task {
    pub id: TaskId,
    /// OS thread that executed the task at the moment of the last trap.
    pub tid: Pid,
    /// Program counter recorded before a single step over a displaced
    /// breakpoint. The trap byte is written back there once the step lands.
    pub(super) last_pc: Option<RelocatedAddress>,
}

/// Registry of all logical tasks sighted since the debugee start.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<TaskId, Task>,
}

impl TaskRegistry {
    /// Create or update a task record, binding it to the observing thread.
    pub fn attach(&mut self, id: TaskId, tid: Pid) -> &mut Task {
        let task = self.tasks.entry(id).or_insert_with(|| {
            debug!(target: "debugger", "new task {id} sighted on thread {tid}");
            Task {
                id,
                tid,
                last_pc: None,
            }
        });
        task.tid = tid;
        task
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    /// Drop every record. Called on debugee exit.
    pub fn teardown(&mut self) {
        self.tasks.clear();
    }
}

/// Memory layout of a single task record of the debugee runtime.
///
/// The layout is read from the type information of the runtime (`runtime.g`
/// and friends); when the members cannot be found the well known offsets of
/// the supported runtime version are used.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskRecordLayout {
    pub stack_lo: u64,
    pub stack_hi: u64,
    pub id: u64,
    pub sched_pc: Option<u64>,
}

impl TaskRecordLayout {
    const FALLBACK: TaskRecordLayout = TaskRecordLayout {
        stack_lo: 0,
        stack_hi: 8,
        id: 128,
        sched_pc: None,
    };

    fn discover(info: &DebugInfo) -> TaskRecordLayout {
        let stack = info.member_offset("runtime.g", "stack");
        let goid = info.member_offset("runtime.g", "goid");
        let (Some(stack), Some(goid)) = (stack, goid) else {
            debug!(target: "debugger", "task record layout not found, use well known offsets");
            return Self::FALLBACK;
        };

        let lo = info.member_offset("runtime.stack", "lo").unwrap_or(0);
        let hi = info.member_offset("runtime.stack", "hi").unwrap_or(8);
        let sched_pc = info.member_offset("runtime.g", "sched").and_then(|sched| {
            info.member_offset("runtime.gobuf", "pc")
                .map(|pc| sched + pc)
        });

        TaskRecordLayout {
            stack_lo: stack + lo,
            stack_hi: stack + hi,
            id: goid,
            sched_pc,
        }
    }

    fn record_len(&self) -> usize {
        let tail = self
            .stack_hi
            .max(self.id)
            .max(self.sched_pc.unwrap_or_default());
        tail as usize + 8
    }
}

/// Addresses of the two scheduler roots exported by the runtime: the length
/// of the task record array and the array itself.
#[derive(Clone, Copy, Debug)]
pub struct SchedulerRoots {
    /// Address of the 64-bit array length.
    pub len: RelocatedAddress,
    /// Address of the first task record pointer.
    pub records: RelocatedAddress,
}

/// A task record reconstructed from debugee memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub stack_lo: u64,
    pub stack_hi: u64,
    pub entry_pc: Option<GlobalAddress>,
}

impl TaskSnapshot {
    fn contains_sp(&self, sp: u64) -> bool {
        self.stack_lo <= sp && sp <= self.stack_hi
    }
}

/// Reconstructs logical tasks of the debugee from the in-memory structures of
/// its user-space scheduler.
#[derive(Default)]
pub struct TaskScheduler {
    layout: Option<TaskRecordLayout>,
    roots: Option<SchedulerRoots>,
}

impl TaskScheduler {
    const LEN_SYMBOL: &'static str = "runtime.allglen";
    const RECORDS_SYMBOL: &'static str = "runtime.allg";
    /// Newer runtime revisions export the records pointer under this name.
    const RECORDS_SYMBOL_ALT: &'static str = "runtime.allgptr";

    fn layout(&mut self, info: &DebugInfo) -> TaskRecordLayout {
        *self
            .layout
            .get_or_insert_with(|| TaskRecordLayout::discover(info))
    }

    fn roots(
        &mut self,
        info: &DebugInfo,
        mem: &dyn TargetMemory,
        mapping_offset: usize,
    ) -> Result<SchedulerRoots, Error> {
        if let Some(roots) = self.roots {
            return Ok(roots);
        }

        let len_addr = Self::symbol_address(info, Self::LEN_SYMBOL)?.relocate(mapping_offset);
        let records_ptr = Self::symbol_address(info, Self::RECORDS_SYMBOL)
            .or_else(|_| Self::symbol_address(info, Self::RECORDS_SYMBOL_ALT))?;
        let records =
            RelocatedAddress::from(read_u64(mem, records_ptr.relocate(mapping_offset))? as usize);

        let roots = SchedulerRoots {
            len: len_addr,
            records,
        };
        self.roots = Some(roots);
        Ok(roots)
    }

    fn symbol_address(info: &DebugInfo, name: &str) -> Result<GlobalAddress, Error> {
        if let Some(addr) = muted_error!(info.global_variable_address(name)) {
            return Ok(addr);
        }
        info.find_symbol(name)
            .map(|sym| GlobalAddress::from(sym.addr))
            .ok_or_else(|| Error::SymbolNotFound(name.to_string()))
    }

    /// Reconstruct every task known to the debugee scheduler.
    pub fn snapshot(
        &mut self,
        info: &DebugInfo,
        mem: &dyn TargetMemory,
        mapping_offset: usize,
    ) -> Result<Vec<TaskSnapshot>, Error> {
        let layout = self.layout(info);
        let roots = self.roots(info, mem, mapping_offset)?;
        scan_tasks(roots, layout, mem, mapping_offset)
    }

    /// Resolve the logical task executing on a thread whose stack pointer is
    /// `sp`. Returns [`TaskId::NONE`] if no task stack contains `sp`.
    pub fn resolve_task(
        &mut self,
        sp: u64,
        info: &DebugInfo,
        mem: &dyn TargetMemory,
        mapping_offset: usize,
    ) -> Result<TaskId, Error> {
        let tasks = self.snapshot(info, mem, mapping_offset)?;
        Ok(resolve_task_by_sp(sp, &tasks))
    }

    /// Forget cached roots, e.g. on debugee restart.
    pub fn reset(&mut self) {
        self.roots = None;
    }
}

/// Scan the scheduler task array.
fn scan_tasks(
    roots: SchedulerRoots,
    layout: TaskRecordLayout,
    mem: &dyn TargetMemory,
    mapping_offset: usize,
) -> Result<Vec<TaskSnapshot>, Error> {
    let len = read_u64(mem, roots.len)?;
    let ptrs = mem.read_memory(roots.records, len as usize * 8)?;

    let mut tasks = Vec::with_capacity(len as usize);
    for chunk in ptrs.chunks_exact(8) {
        let record_addr = u64::from_le_bytes(chunk.try_into().expect("8 byte chunk"));
        let record = mem.read_memory(
            RelocatedAddress::from(record_addr as usize),
            layout.record_len(),
        )?;

        let field = |offset: u64| -> u64 {
            let offset = offset as usize;
            u64::from_le_bytes(record[offset..offset + 8].try_into().expect("8 byte field"))
        };

        tasks.push(TaskSnapshot {
            id: TaskId(field(layout.id)),
            stack_lo: field(layout.stack_lo),
            stack_hi: field(layout.stack_hi),
            entry_pc: layout.sched_pc.and_then(|off| {
                let pc = field(off);
                (pc as usize > mapping_offset)
                    .then(|| RelocatedAddress::from(pc as usize).into_global(mapping_offset))
            }),
        });
    }

    Ok(tasks)
}

/// The stack pointer is the portable discriminator of a task: reading thread
/// local storage differs between supported hosts, SP containment does not.
fn resolve_task_by_sp(sp: u64, tasks: &[TaskSnapshot]) -> TaskId {
    tasks
        .iter()
        .find(|task| task.contains_sp(sp))
        .map(|task| task.id)
        .unwrap_or(TaskId::NONE)
}

fn read_u64(mem: &dyn TargetMemory, addr: RelocatedAddress) -> Result<u64, Error> {
    let bytes = mem.read_memory(addr, 8)?;
    let bytes: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::TypeBinaryRepr("u64"))?;
    Ok(u64::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct FakeMemory(RefCell<Vec<u8>>);

    impl FakeMemory {
        fn new(size: usize) -> Self {
            Self(RefCell::new(vec![0; size]))
        }

        fn put_u64(&self, addr: usize, value: u64) {
            self.0.borrow_mut()[addr..addr + 8].copy_from_slice(&value.to_le_bytes());
        }
    }

    impl TargetMemory for FakeMemory {
        fn read_memory(&self, addr: RelocatedAddress, len: usize) -> Result<Vec<u8>, Error> {
            let addr = addr.as_usize();
            Ok(self.0.borrow()[addr..addr + len].to_vec())
        }

        fn write_memory(&self, addr: RelocatedAddress, data: &[u8]) -> Result<(), Error> {
            let addr = addr.as_usize();
            self.0.borrow_mut()[addr..addr + data.len()].copy_from_slice(data);
            Ok(())
        }
    }

    fn fake_scheduler() -> (FakeMemory, SchedulerRoots, TaskRecordLayout) {
        let layout = TaskRecordLayout::FALLBACK;
        let mem = FakeMemory::new(0x6000);

        // two task records
        mem.put_u64(0x100, 2);
        mem.put_u64(0x200, 0x300);
        mem.put_u64(0x208, 0x400);

        mem.put_u64(0x300, 0x1000); // stack lower bound
        mem.put_u64(0x308, 0x2000); // stack upper bound
        mem.put_u64(0x300 + 128, 1); // id

        mem.put_u64(0x400, 0x3000);
        mem.put_u64(0x408, 0x4000);
        mem.put_u64(0x400 + 128, 2);

        let roots = SchedulerRoots {
            len: RelocatedAddress::from(0x100usize),
            records: RelocatedAddress::from(0x200usize),
        };
        (mem, roots, layout)
    }

    #[test]
    fn test_scan_tasks() {
        let (mem, roots, layout) = fake_scheduler();

        let tasks = scan_tasks(roots, layout, &mem, 0).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, TaskId(1));
        assert_eq!(tasks[0].stack_lo, 0x1000);
        assert_eq!(tasks[0].stack_hi, 0x2000);
        assert_eq!(tasks[1].id, TaskId(2));
        assert_eq!(tasks[1].stack_lo, 0x3000);
        assert_eq!(tasks[1].stack_hi, 0x4000);
    }

    #[test]
    fn test_resolve_task_by_stack_pointer() {
        let (mem, roots, layout) = fake_scheduler();
        let tasks = scan_tasks(roots, layout, &mem, 0).unwrap();

        assert_eq!(resolve_task_by_sp(0x1800, &tasks), TaskId(1));
        assert_eq!(resolve_task_by_sp(0x3fff, &tasks), TaskId(2));
        // boundaries are inclusive
        assert_eq!(resolve_task_by_sp(0x1000, &tasks), TaskId(1));
        assert_eq!(resolve_task_by_sp(0x2000, &tasks), TaskId(1));
        // outside any task stack: a runtime-internal thread
        assert_eq!(resolve_task_by_sp(0x5000, &tasks), TaskId::NONE);
    }

    #[test]
    fn test_fallback_layout_offsets() {
        let layout = TaskRecordLayout::FALLBACK;
        assert_eq!(layout.stack_lo, 0);
        assert_eq!(layout.stack_hi, 8);
        assert_eq!(layout.id, 128);
        assert_eq!(layout.record_len(), 136);
    }

    #[test]
    fn test_registry_attach_rebinds_thread() {
        let mut registry = TaskRegistry::default();

        registry.attach(TaskId(5), Pid::from_raw(100));
        registry.attach(TaskId(5), Pid::from_raw(200));

        let task = registry.get_mut(TaskId(5)).unwrap();
        assert_eq!(task.tid, Pid::from_raw(200));
        assert_eq!(task.last_pc, None);
    }
}
