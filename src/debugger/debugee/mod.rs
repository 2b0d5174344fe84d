pub mod dwarf;
pub mod tracee;
pub mod tracer;

use crate::debugger::address::{GlobalAddress, RelocatedAddress};
use crate::debugger::debugee::dwarf::DebugInfo;
use crate::debugger::error::Error;
use crate::debugger::task::{TaskId, TaskScheduler, TaskSnapshot};
use crate::debugger::TargetMemory;
use log::info;
use nix::unistd::Pid;
use object::{Object, ObjectKind};
use proc_maps::MapRange;
use std::fs;
use std::path::{Path, PathBuf};

/// Thread position. Contains pid of the thread, relocated and global address
/// of the instruction where the thread is stopped.
#[derive(Clone, Copy, Debug)]
pub struct Location {
    pub pc: RelocatedAddress,
    pub global_pc: GlobalAddress,
    pub pid: Pid,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExecutionStatus {
    Unload,
    InProgress,
    /// The debugger let the process go.
    Detached,
    Exited,
}

/// Debugee - static and runtime information about the debugged program.
pub struct Debugee {
    /// Debugee running-status.
    pub execution_status: ExecutionStatus,
    /// Path to the debugee file.
    pub path: PathBuf,
    /// Debugee process mapping offset, zero for a statically linked
    /// executable, known after the start for a dynamic one.
    mapping_addr: Option<usize>,
    /// Preparsed debugee debug information.
    pub debug_info: DebugInfo,
    /// Kind of the executable object file.
    object_kind: ObjectKind,
    /// Reconstructor of the debugee logical tasks.
    scheduler: TaskScheduler,
}

impl Debugee {
    pub fn new(path: &Path) -> Result<Self, Error> {
        let file = fs::File::open(path)?;
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        let object = object::File::parse(&*mmap)?;

        Ok(Self {
            execution_status: ExecutionStatus::Unload,
            path: path.into(),
            mapping_addr: None,
            debug_info: DebugInfo::new(&object)?,
            object_kind: object.kind(),
            scheduler: TaskScheduler::default(),
        })
    }

    /// Return the debugee process mapping offset. Zero until the debugee is
    /// started and for non position independent executables.
    pub fn mapping_offset(&self) -> usize {
        self.mapping_addr.unwrap_or(0)
    }

    /// Called once the debugee reaches its entry point: the VAS mapping
    /// exists from now on.
    pub fn on_start(&mut self, proc_pid: Pid) -> Result<(), Error> {
        self.execution_status = ExecutionStatus::InProgress;
        if self.object_kind == ObjectKind::Dynamic {
            self.mapping_addr = Some(self.define_mapping_addr(proc_pid)?);
            info!(target: "debugger", "debugee mapped at {:#x}", self.mapping_offset());
        }
        Ok(())
    }

    /// Called when the debugee process is gone.
    pub fn on_exit(&mut self) {
        self.execution_status = ExecutionStatus::Exited;
        self.scheduler.reset();
    }

    fn define_mapping_addr(&mut self, proc_pid: Pid) -> Result<usize, Error> {
        let absolute_debugee_path_buf = self.path.canonicalize()?;
        let absolute_debugee_path = absolute_debugee_path_buf.as_path();

        let proc_maps: Vec<MapRange> = proc_maps::get_process_maps(proc_pid.as_raw())
            .map_err(Error::IO)?
            .into_iter()
            .filter(|map| map.filename() == Some(absolute_debugee_path))
            .collect();

        let lowest_map = proc_maps
            .iter()
            .min_by(|map1, map2| map1.start().cmp(&map2.start()))
            .ok_or(Error::NoDebugInformation("mapping"))?;

        Ok(lowest_map.start())
    }

    /// Reconstruct the logical task list from the debugee scheduler state.
    pub fn tasks(&mut self, mem: &dyn TargetMemory) -> Result<Vec<TaskSnapshot>, Error> {
        let mapping_offset = self.mapping_offset();
        self.scheduler
            .snapshot(&self.debug_info, mem, mapping_offset)
    }

    /// Resolve a logical task from a thread stack pointer.
    pub fn resolve_task(&mut self, sp: u64, mem: &dyn TargetMemory) -> Result<TaskId, Error> {
        let mapping_offset = self.mapping_offset();
        self.scheduler
            .resolve_task(sp, &self.debug_info, mem, mapping_offset)
    }
}
