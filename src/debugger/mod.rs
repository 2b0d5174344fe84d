pub mod address;
pub mod breakpoint;
pub mod debugee;
pub mod error;
pub mod process;
pub mod register;
mod step;
pub mod task;
pub mod variable;

pub use debugee::dwarf::{Place, PlaceOwned};
pub use error::Error;
pub use variable::Variable;

use crate::debugger::address::{GlobalAddress, RelocatedAddress};
use crate::debugger::breakpoint::{BreakpointOwner, BreakpointRegistry, BreakpointView, TRAP_BYTE};
use crate::debugger::debugee::tracee::Tracee;
use crate::debugger::debugee::tracer::{
    StopHandle, TracerHandle, TrapEvent, TrapKind, Tracer, TRAP_QUEUE_CAPACITY,
};
use crate::debugger::debugee::{Debugee, ExecutionStatus, Location};
use crate::debugger::error::Error::{AlreadyRun, ProcessExit, ProcessNotStarted};
use crate::debugger::process::{Child, Installed, Template};
use crate::debugger::register::{Register, RegisterMap};
use crate::debugger::task::{TaskId, TaskRegistry, TaskSnapshot};
use crate::{muted_error, weak_error};
use log::debug;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;

/// Suspended debugee memory. The single seam through which every part of the
/// debugger reads and writes the target address space.
pub trait TargetMemory {
    fn read_memory(&self, addr: RelocatedAddress, len: usize) -> Result<Vec<u8>, Error>;
    fn write_memory(&self, addr: RelocatedAddress, data: &[u8]) -> Result<(), Error>;
}

/// Reactions to debugee events, installed by the UI (or tests).
pub trait EventHook {
    fn on_breakpoint(
        &self,
        pc: RelocatedAddress,
        num: u32,
        place: Option<PlaceOwned>,
        task: TaskId,
    ) -> anyhow::Result<()>;
    fn on_step(&self, pc: RelocatedAddress, place: Option<PlaceOwned>) -> anyhow::Result<()>;
    fn on_signal(&self, signal: Signal);
    fn on_task_switch(&self, from: TaskId, to: TaskId);
    fn on_exit(&self, code: i32);
}

/// Hook that reacts to nothing.
pub struct NopHook;

impl EventHook for NopHook {
    fn on_breakpoint(
        &self,
        _: RelocatedAddress,
        _: u32,
        _: Option<PlaceOwned>,
        _: TaskId,
    ) -> anyhow::Result<()> {
        Ok(())
    }
    fn on_step(&self, _: RelocatedAddress, _: Option<PlaceOwned>) -> anyhow::Result<()> {
        Ok(())
    }
    fn on_signal(&self, _: Signal) {}
    fn on_task_switch(&self, _: TaskId, _: TaskId) {}
    fn on_exit(&self, _: i32) {}
}

/// Stop of the whole debugee observed by the event loop.
#[derive(Debug)]
pub(crate) enum Stop {
    /// Stopped on a breakpoint that applies to the stopping task.
    Breakpoint {
        tid: Pid,
        addr: RelocatedAddress,
        num: u32,
        task: TaskId,
    },
    /// A single instruction was executed with the trap flag set.
    SingleStep { tid: Pid, task: TaskId },
    /// User interrupt.
    Manual { tid: Pid, task: TaskId },
    /// Debugee stopped with an OS signal.
    Signal { tid: Pid, signal: Signal },
    /// Debugee reached the entry point.
    Start { tid: Pid },
    /// Debugee process is gone. Terminal.
    Exited(i32),
}

pub struct DebuggerBuilder {
    hooks: Box<dyn EventHook>,
}

impl Default for DebuggerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DebuggerBuilder {
    pub fn new() -> Self {
        Self {
            hooks: Box::new(NopHook),
        }
    }

    pub fn with_hooks(self, hooks: impl EventHook + 'static) -> Self {
        Self {
            hooks: Box::new(hooks),
        }
    }

    /// Create a debugger for a process template. The process is forked and
    /// seized on the trace thread but not yet executed.
    pub fn build(self, process: Child<Template>) -> Result<Debugger, Error> {
        Debugger::new(move || process.install(), self.hooks)
    }

    /// Create a debugger attached to a running process.
    pub fn attach(
        self,
        pid: Pid,
        stdout: os_pipe::PipeWriter,
        stderr: os_pipe::PipeWriter,
    ) -> Result<Debugger, Error> {
        Debugger::new(
            move || Child::from_external(pid, stdout, stderr),
            self.hooks,
        )
    }
}

/// Debugger session over a single debugee process.
///
/// Owns the breakpoint table, the task table and the debugee handle; talks to
/// the trace thread for every process interaction and consumes the trap
/// queue it fills.
pub struct Debugger {
    debugee: Debugee,
    tracer: TracerHandle,
    stop_handle: StopHandle,
    trap_queue: Receiver<TrapEvent>,
    breakpoints: BreakpointRegistry,
    tasks: TaskRegistry,
    /// Task in focus: the next verb operates on it.
    current_task: TaskId,
    /// Thread that executed the focused task at the last stop.
    current_tid: Pid,
    /// Thread whose single-step exception the controller is waiting for.
    /// Step traps of other threads are bookkeeping only: the trap flag may
    /// linger on a thread that was stepped over a displaced breakpoint and
    /// got suspended before its step trap was consumed.
    pub(crate) expect_step: Option<Pid>,
    process_pid: Pid,
    external: bool,
    exit_code: Option<i32>,
    hooks: Box<dyn EventHook>,
}

impl Debugger {
    fn new(
        install: impl FnOnce() -> Result<Child<Installed>, Error> + Send + 'static,
        hooks: Box<dyn EventHook>,
    ) -> Result<Self, Error> {
        let (trap_tx, trap_rx) = sync_channel(TRAP_QUEUE_CAPACITY);
        let halt = Arc::new(AtomicBool::new(false));

        let (tracer, stop_handle, pid, program, external) =
            Tracer::start(install, trap_tx, halt)?;

        let mut debugee = Debugee::new(Path::new(&program))?;
        if external {
            // an attached process is past its entry point already
            debugee.on_start(pid)?;
        }

        Ok(Self {
            debugee,
            tracer,
            stop_handle,
            trap_queue: trap_rx,
            breakpoints: BreakpointRegistry::default(),
            tasks: TaskRegistry::default(),
            current_task: TaskId::NONE,
            current_tid: pid,
            expect_step: None,
            process_pid: pid,
            external,
            exit_code: None,
            hooks,
        })
    }

    /// Handle for interrupting a running debugee from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop_handle.clone()
    }

    pub fn process_pid(&self) -> Pid {
        self.process_pid
    }

    pub fn is_external(&self) -> bool {
        self.external
    }

    pub fn execution_status(&self) -> ExecutionStatus {
        self.debugee.execution_status
    }

    fn ensure_in_progress(&self) -> Result<(), Error> {
        match self.debugee.execution_status {
            ExecutionStatus::Unload => Err(ProcessNotStarted),
            ExecutionStatus::Detached => Err(Error::Detached),
            ExecutionStatus::Exited => Err(ProcessExit(self.exit_code.unwrap_or_default())),
            ExecutionStatus::InProgress => Ok(()),
        }
    }

    /// Start the debugee and continue it to the first stop.
    pub fn start_debugee(&mut self) -> Result<(), Error> {
        if self.debugee.execution_status != ExecutionStatus::Unload {
            return Err(AlreadyRun);
        }

        loop {
            match self.resume_and_wait()? {
                Stop::Start { tid } => {
                    self.current_tid = tid;
                    break;
                }
                stop @ Stop::Exited(_) => return self.deliver(stop),
                stop => {
                    debug!(target: "debugger", "pre-start stop skipped: {stop:?}");
                }
            }
        }

        let stop = self.continue_internal()?;
        self.deliver(stop)
    }

    /// Continue execution until the next stop.
    pub fn continue_debugee(&mut self) -> Result<(), Error> {
        self.ensure_in_progress()?;
        let stop = self.continue_internal()?;
        self.deliver(stop)
    }

    /// Single-step one instruction of the focused task.
    pub fn step_instruction(&mut self) -> Result<(), Error> {
        self.ensure_in_progress()?;
        let stop = self.single_step(self.current_tid, self.current_task)?;
        self.deliver(stop)
    }

    /// Step over one source line of the focused task: calls are executed to
    /// completion, the debugee stops on the next line.
    pub fn step_over(&mut self) -> Result<(), Error> {
        self.ensure_in_progress()?;
        match self.step_over_line() {
            // without a frame description the call detection cannot work,
            // degrade to a single instruction step
            Err(Error::UnknownFde(_)) => self.step_instruction(),
            Ok(stop) => self.deliver(stop),
            Err(e) => Err(e),
        }
    }

    /// Detach from the debugee and leave it running. Breakpoint bytes are
    /// restored first.
    pub fn detach(&mut self) -> Result<(), Error> {
        if self.debugee.execution_status == ExecutionStatus::InProgress {
            self.breakpoints.disable_all(&self.tracer)?;
        }
        self.breakpoints.teardown();
        self.tasks.teardown();
        self.tracer.detach()?;
        self.debugee.execution_status = ExecutionStatus::Detached;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // trap handling
    // ---------------------------------------------------------------------

    pub(crate) fn resume_and_wait(&mut self) -> Result<Stop, Error> {
        self.tracer.resume()?;
        self.wait_trap()
    }

    /// Receive the next trap event and react on it. The whole debugee is
    /// already suspended when an event is delivered.
    fn wait_trap(&mut self) -> Result<Stop, Error> {
        let mut event = self.trap_queue.recv().map_err(|_| Error::TracerGone)?;
        debug!(target: "debugger", "trap event {:?} on thread {}", event.kind, event.tid);

        match event.kind {
            TrapKind::DebugeeStart => {
                self.debugee.on_start(self.process_pid)?;
                self.breakpoints.enable_all(&self.tracer)?;
                Ok(Stop::Start { tid: event.tid })
            }
            TrapKind::Exit(code) => {
                self.exit_code = Some(code);
                self.debugee.on_exit();
                self.breakpoints.teardown();
                self.tasks.teardown();
                Ok(Stop::Exited(code))
            }
            TrapKind::Manual => {
                // prefer a thread executing a real task over a runtime
                // internal one
                let mut tid = event.tid;
                let mut task = self.resolve_task_from_thread(tid);
                if task == TaskId::NONE {
                    for tracee in self.tracer.threads()? {
                        let candidate = self.resolve_task_from_thread(tracee.pid);
                        if candidate != TaskId::NONE {
                            tid = tracee.pid;
                            task = candidate;
                            break;
                        }
                    }
                }
                self.tasks.attach(task, tid);
                self.focus(tid, task);
                Ok(Stop::Manual { tid, task })
            }
            TrapKind::SingleStep => {
                let task = match event.task {
                    Some(task) => task,
                    None => self.resolve_task_from_thread(event.tid),
                };
                event.task = Some(task);
                self.tasks.attach(task, event.tid);

                // drop the trap flag
                let mut regs = self.tracer.registers(event.tid)?;
                if regs.single_step_flag() {
                    regs.set_single_step_flag(false);
                    self.tracer.set_registers(event.tid, regs)?;
                }

                // if the step was taken over a displaced breakpoint, put the
                // trap byte back
                if let Some(task_record) = self.tasks.get_mut(task) {
                    if let Some(last_pc) = task_record.last_pc.take() {
                        if let Some(bp) = self.breakpoints.get(last_pc) {
                            if bp.is_enabled() {
                                let mem = self.tracer.read_memory(last_pc, 1)?;
                                if mem[0] != TRAP_BYTE {
                                    self.tracer.write_memory(last_pc, &[TRAP_BYTE])?;
                                }
                            }
                        }
                    }
                }

                if self.expect_step != Some(event.tid) {
                    // a stale trap flag, not the step the controller drives
                    return self.resume_and_wait();
                }

                Ok(Stop::SingleStep {
                    tid: event.tid,
                    task,
                })
            }
            TrapKind::Breakpoint => {
                let task = match event.task {
                    Some(task) => task,
                    None => self.resolve_task_from_thread(event.tid),
                };
                self.tasks.attach(task, event.tid);

                // the thread is one byte past the trap instruction
                let mut regs = self.tracer.registers(event.tid)?;
                let bp_addr = RelocatedAddress::from(regs.value(Register::Rip)).offset(-1);

                let Some(bp) = self.breakpoints.get(bp_addr) else {
                    return Err(Error::UnrecognizedBreakpoint(bp_addr));
                };
                let num = bp.id;
                let applies = bp.applies_to(task);
                let saved_byte = bp.saved_byte();
                let enabled = bp.is_enabled();

                // restore the real instruction and rewind the thread onto it
                if enabled {
                    let mem = self.tracer.read_memory(bp_addr, 1)?;
                    if mem[0] == TRAP_BYTE {
                        self.tracer.write_memory(bp_addr, &[saved_byte])?;
                    }
                }
                regs.update(Register::Rip, bp_addr.as_u64());
                self.tracer.set_registers(event.tid, regs)?;

                if applies {
                    self.focus(event.tid, task);
                    return Ok(Stop::Breakpoint {
                        tid: event.tid,
                        addr: bp_addr,
                        num,
                        task,
                    });
                }

                // the breakpoint belongs to a different task: step through
                // the restored instruction, re-arm the trap byte and keep the
                // debugee going
                debug!(
                    target: "debugger",
                    "skip breakpoint {num} at {bp_addr}, it does not belong to task {task}"
                );
                let stop = self.single_step(event.tid, task)?;
                if !matches!(stop, Stop::SingleStep { .. }) {
                    // a real stop won the race with the skip
                    return Ok(stop);
                }
                self.resume_and_wait()
            }
            TrapKind::Signal(signal) => {
                let task = match event.task {
                    Some(task) => task,
                    None => self.resolve_task_from_thread(event.tid),
                };
                self.tasks.attach(task, event.tid);
                self.focus(event.tid, task);
                Ok(Stop::Signal {
                    tid: event.tid,
                    signal,
                })
            }
        }
    }

    /// Make a stop visible to the user.
    fn deliver(&mut self, stop: Stop) -> Result<(), Error> {
        match stop {
            Stop::Breakpoint {
                tid,
                addr,
                num,
                task,
            } => {
                self.focus(tid, task);
                let place = self.place_for_pc(addr);
                if let Err(e) = self.hooks.on_breakpoint(addr, num, place, task) {
                    debug!(target: "debugger", "breakpoint hook: {e:#}");
                }
                Ok(())
            }
            Stop::SingleStep { tid, task } => {
                self.focus(tid, task);
                let pc = self.thread_pc(tid)?;
                let place = self.place_for_pc(pc);
                if let Err(e) = self.hooks.on_step(pc, place) {
                    debug!(target: "debugger", "step hook: {e:#}");
                }
                Ok(())
            }
            Stop::Manual { tid, task } => {
                self.focus(tid, task);
                Err(Error::Interrupt)
            }
            Stop::Signal { tid, signal } => {
                self.current_tid = tid;
                self.hooks.on_signal(signal);
                Ok(())
            }
            Stop::Exited(code) => {
                self.hooks.on_exit(code);
                Ok(())
            }
            Stop::Start { tid } => {
                self.current_tid = tid;
                Ok(())
            }
        }
    }

    /// Remember the new focus and announce a task switch to the user.
    fn focus(&mut self, tid: Pid, task: TaskId) {
        self.current_tid = tid;
        if task != self.current_task {
            let old = self.current_task;
            self.current_task = task;
            self.hooks.on_task_switch(old, task);
        }
    }

    /// Resolve the logical task of an OS thread by its stack pointer.
    /// Threads outside of any task stack (and any thread before the debugee
    /// runtime is up) resolve to [`TaskId::NONE`].
    fn resolve_task_from_thread(&mut self, tid: Pid) -> TaskId {
        let resolved = (|| {
            let regs = self.tracer.registers(tid)?;
            let sp = regs.value(Register::Rsp);
            self.debugee.resolve_task(sp, &self.tracer)
        })();
        muted_error!(resolved, "task resolution:").unwrap_or(TaskId::NONE)
    }

    // ---------------------------------------------------------------------
    // breakpoints
    // ---------------------------------------------------------------------

    /// Set a user visible breakpoint at an address.
    pub fn set_breakpoint_at_address(
        &mut self,
        addr: RelocatedAddress,
    ) -> Result<BreakpointView, Error> {
        let global = addr.into_global(self.debugee.mapping_offset());
        let place = self
            .debugee
            .debug_info
            .find_place_from_pc(global)
            .map(|p| p.to_owned())
            .ok_or(Error::InvalidAddress(addr))?;
        let function = self
            .debugee
            .debug_info
            .find_function_by_pc(global)
            .and_then(|(_, die)| die.name.clone());

        if self.breakpoints.exists(addr, true) {
            return Err(Error::BreakpointExists(addr));
        }

        // the trap byte can be written only into a started debugee, earlier
        // registrations are armed at the entry point
        let mem: Option<&dyn TargetMemory> = match self.debugee.execution_status {
            ExecutionStatus::InProgress => Some(&self.tracer),
            _ => None,
        };
        self.breakpoints
            .set(addr, BreakpointOwner::AllTasks, Some(place), function, mem)
            .map(BreakpointView::from)
    }

    /// Set a user visible breakpoint at the first statement of `file:line`.
    pub fn set_breakpoint_at_line(
        &mut self,
        file: &str,
        line: u64,
    ) -> Result<BreakpointView, Error> {
        let place = self
            .debugee
            .debug_info
            .find_stmt_line(file, line)
            .ok_or_else(|| Error::LineNotFound {
                file: file.to_string(),
                line,
            })?
            .to_owned();
        let addr = place.address.relocate(self.debugee.mapping_offset());
        self.set_breakpoint_at_address(addr)
    }

    /// Set a user visible breakpoint at a function entry.
    pub fn set_breakpoint_at_fn(&mut self, name: &str) -> Result<BreakpointView, Error> {
        let (_, function) = self
            .debugee
            .debug_info
            .find_function_by_name(name)
            .ok_or_else(|| Error::FunctionNotFound(name.to_string()))?;
        let entry = function
            .low_pc
            .ok_or_else(|| Error::FunctionNotFound(name.to_string()))?;
        let addr = GlobalAddress::from(entry).relocate(self.debugee.mapping_offset());
        self.set_breakpoint_at_address(addr)
    }

    /// Remove a user visible breakpoint. If the focused thread sits one byte
    /// past the trap, its pc is rewound onto the restored instruction.
    pub fn remove_breakpoint(&mut self, addr: RelocatedAddress) -> Result<BreakpointView, Error> {
        if self.debugee.execution_status == ExecutionStatus::InProgress {
            if let Some(mut regs) = weak_error!(self.tracer.registers(self.current_tid)) {
                if RelocatedAddress::from(regs.value(Register::Rip)) == addr.offset(1) {
                    regs.update(Register::Rip, addr.as_u64());
                    self.tracer.set_registers(self.current_tid, regs)?;
                }
            }
        }

        let mem: Option<&dyn TargetMemory> = match self.debugee.execution_status {
            ExecutionStatus::InProgress => Some(&self.tracer),
            _ => None,
        };
        self.breakpoints.clear(addr, BreakpointOwner::AllTasks, mem)
    }

    /// Active breakpoints ordered by id.
    pub fn breakpoints_snapshot(&self) -> Vec<BreakpointView> {
        self.breakpoints
            .snapshot()
            .into_iter()
            .filter(|view| view.visible)
            .collect()
    }

    /// Find a breakpoint address by its id.
    pub fn breakpoint_by_id(&self, id: u32) -> Option<RelocatedAddress> {
        self.breakpoints.find_by_id(id).map(|bp| bp.addr)
    }

    // ---------------------------------------------------------------------
    // inspection
    // ---------------------------------------------------------------------

    /// Location of the focused thread.
    pub fn current_location(&self) -> Result<Location, Error> {
        self.ensure_in_progress()?;
        let pc = self.thread_pc(self.current_tid)?;
        Ok(Location {
            pc,
            global_pc: pc.into_global(self.debugee.mapping_offset()),
            pid: self.current_tid,
        })
    }

    /// Source place of the focused thread.
    pub fn current_place(&self) -> Result<Option<PlaceOwned>, Error> {
        let location = self.current_location()?;
        Ok(self.place_for_pc(location.pc))
    }

    /// Task in focus.
    pub fn current_task(&self) -> TaskId {
        self.current_task
    }

    /// Register snapshot of the focused thread.
    pub fn registers(&self) -> Result<RegisterMap, Error> {
        self.ensure_in_progress()?;
        self.tracer.registers(self.current_tid)
    }

    /// Read debugee memory.
    pub fn read_memory(&self, addr: RelocatedAddress, len: usize) -> Result<Vec<u8>, Error> {
        self.ensure_in_progress()?;
        self.tracer.read_memory(addr, len)
    }

    /// State of every OS thread of the debugee.
    pub fn thread_state(&mut self) -> Result<Vec<ThreadSnapshot>, Error> {
        self.ensure_in_progress()?;
        let threads = self.tracer.threads()?;
        Ok(threads
            .into_iter()
            .map(|tracee| {
                let pc = weak_error!(self.tracer.registers(tracee.pid))
                    .map(|regs| RelocatedAddress::from(regs.value(Register::Rip)));
                let place = pc.and_then(|pc| self.place_for_pc(pc));
                let function = pc.and_then(|pc| {
                    self.debugee
                        .debug_info
                        .find_function_by_pc(pc.into_global(self.debugee.mapping_offset()))
                        .and_then(|(_, die)| die.name.clone())
                });
                ThreadSnapshot {
                    in_focus: tracee.pid == self.current_tid,
                    tracee,
                    pc,
                    place,
                    function,
                }
            })
            .collect())
    }

    /// State of every logical task of the debugee runtime.
    pub fn task_state(&mut self) -> Result<Vec<TaskView>, Error> {
        self.ensure_in_progress()?;
        let tasks = self.debugee.tasks(&self.tracer)?;
        let current = self.current_task;
        Ok(tasks
            .into_iter()
            .map(|snapshot| {
                let place = snapshot.entry_pc.and_then(|pc| {
                    self.debugee
                        .debug_info
                        .find_place_from_pc(pc)
                        .map(|place| place.to_owned())
                });
                let function = snapshot.entry_pc.and_then(|pc| {
                    self.debugee
                        .debug_info
                        .find_function_by_pc(pc)
                        .and_then(|(_, die)| die.name.clone())
                });
                TaskView {
                    in_focus: snapshot.id == current,
                    task: snapshot,
                    place,
                    function,
                }
            })
            .collect())
    }

    pub(crate) fn thread_pc(&self, tid: Pid) -> Result<RelocatedAddress, Error> {
        let regs = self.tracer.registers(tid)?;
        Ok(RelocatedAddress::from(regs.value(Register::Rip)))
    }

    /// Source place behind an instruction address.
    pub fn place_for_pc(&self, pc: RelocatedAddress) -> Option<PlaceOwned> {
        self.debugee
            .debug_info
            .find_place_from_pc(pc.into_global(self.debugee.mapping_offset()))
            .map(|place| place.to_owned())
    }
}

/// Thread state with a resolved source position.
pub struct ThreadSnapshot {
    pub tracee: Tracee,
    pub pc: Option<RelocatedAddress>,
    pub place: Option<PlaceOwned>,
    pub function: Option<String>,
    pub in_focus: bool,
}

/// Logical task state with a resolved source position of its entry.
pub struct TaskView {
    pub task: TaskSnapshot,
    pub place: Option<PlaceOwned>,
    pub function: Option<String>,
    pub in_focus: bool,
}

impl Drop for Debugger {
    fn drop(&mut self) {
        match self.debugee.execution_status {
            ExecutionStatus::InProgress => {
                if self.external {
                    weak_error!(self.detach(), "detach on drop:");
                } else {
                    weak_error!(self.tracer.kill(), "kill on drop:");
                }
            }
            ExecutionStatus::Unload => {
                weak_error!(self.tracer.kill(), "kill on drop:");
            }
            ExecutionStatus::Detached | ExecutionStatus::Exited => {}
        }
    }
}
