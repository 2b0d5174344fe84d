use crate::debugger::address::RelocatedAddress;
use crate::debugger::breakpoint::BreakpointOwner;
use crate::debugger::debugee::ExecutionStatus;
use crate::debugger::error::Error;
use crate::debugger::register::Register;
use crate::debugger::task::TaskId;
use crate::debugger::{Debugger, Stop, TargetMemory};
use crate::muted_error;
use log::debug;
use nix::unistd::Pid;

impl Debugger {
    /// Execute exactly one instruction of a task.
    ///
    /// The trap flag is set on the executing thread and the whole debugee is
    /// resumed; the flag raises a single-step exception after one
    /// instruction. A breakpoint under the current pc is displaced for the
    /// duration of the step and re-armed by the trap handling once the step
    /// lands (the task `last_pc` slot carries the address between the two).
    pub(crate) fn single_step(&mut self, tid: Pid, task: TaskId) -> Result<Stop, Error> {
        let mut regs = self.tracer.registers(tid)?;
        let pc = RelocatedAddress::from(regs.value(Register::Rip));
        regs.set_single_step_flag(true);
        self.tracer.set_registers(tid, regs)?;

        if let Some(bp) = self.breakpoints.get(pc) {
            if bp.is_enabled() {
                let original = bp.saved_byte();
                self.tracer.write_memory(pc, &[original])?;
            }
        }
        self.tasks.attach(task, tid).last_pc = Some(pc);

        let expected = self.expect_step.replace(tid);
        let result = self.resume_and_wait();
        self.expect_step = expected;
        result
    }

    /// Resume the debugee until the next stop. If the focused thread stands
    /// on a restored breakpoint instruction, it is single-stepped first so
    /// that the trap byte goes back in place.
    pub(crate) fn continue_internal(&mut self) -> Result<Stop, Error> {
        if let Some(stop) = self.step_over_breakpoint()? {
            return Ok(stop);
        }
        self.resume_and_wait()
    }

    /// Step the focused thread over a breakpoint it stands on, if any.
    /// Returns a stop when something else stopped the debugee during the
    /// step.
    fn step_over_breakpoint(&mut self) -> Result<Option<Stop>, Error> {
        let tid = self.current_tid;
        let pc = self.thread_pc(tid)?;
        let on_breakpoint = self
            .breakpoints
            .get(pc)
            .map(|bp| bp.is_enabled())
            .unwrap_or(false);

        if on_breakpoint {
            let stop = self.single_step(tid, self.current_task)?;
            if !matches!(stop, Stop::SingleStep { .. }) {
                return Ok(Some(stop));
            }
        }
        Ok(None)
    }

    /// Step over one source line of the focused task.
    ///
    /// Instruction steps are repeated until the source line changes; leaving
    /// the frame description entry of the starting frame through anything
    /// but its return address means a call was entered, which is then run to
    /// completion.
    pub(crate) fn step_over_line(&mut self) -> Result<Stop, Error> {
        let task = self.current_task;
        let mapping_offset = self.debugee.mapping_offset();

        let regs = self.tracer.registers(self.current_tid)?;
        let pc = RelocatedAddress::from(regs.value(Register::Rip));
        let global_pc = pc.into_global(mapping_offset);

        let fde = self.debugee.debug_info.frame_table.fde_bounds(global_pc)?;
        let ra_offset = self
            .debugee
            .debug_info
            .frame_table
            .return_address_offset(global_pc)?;
        let ret = self.return_address_from_offset(regs.value(Register::Rsp), ra_offset)?;
        let start_line = self
            .debugee
            .debug_info
            .find_place_from_pc(global_pc)
            .map(|place| place.line_number);

        debug!(
            target: "debugger",
            "step over line {start_line:?}, return address {ret}"
        );

        loop {
            let stop = self.single_step(self.task_tid(task), task)?;
            let Stop::SingleStep { tid: step_tid, .. } = stop else {
                return Ok(stop);
            };

            let mut pc = self.thread_pc(step_tid)?;
            if !fde.cover(pc.into_global(mapping_offset)) && pc != ret {
                // the task entered a call and stands on the callee's first
                // instruction: the stack is untouched yet, the word under the
                // stack pointer is the address the callee will return to
                let regs = self.tracer.registers(step_tid)?;
                let call_ret = self.return_address_from_offset(regs.value(Register::Rsp), 0)?;
                if let Some(stop) = self.continue_to_return(call_ret)? {
                    return Ok(stop);
                }
                pc = self.thread_pc(self.task_tid(task))?;
            }

            let line = self
                .debugee
                .debug_info
                .find_place_from_pc(pc.into_global(mapping_offset))
                .map(|place| place.line_number);
            if line != start_line {
                return Ok(Stop::SingleStep {
                    tid: self.task_tid(task),
                    task,
                });
            }
        }
    }

    /// Run the focused task to a return address.
    ///
    /// A temporary breakpoint owned by the task alone is planted at `ret`;
    /// stops at any other breakpoint resume the debugee again. Returns a
    /// stop when the debugee stopped for a reason that must reach the user
    /// (interrupt, signal, exit).
    fn continue_to_return(&mut self, ret: RelocatedAddress) -> Result<Option<Stop>, Error> {
        let task = self.current_task;
        debug!(
            target: "debugger",
            "plant temporary breakpoint at return address {ret}, task {task}"
        );

        let place = self.place_for_pc(ret);
        self.breakpoints.set(
            ret,
            BreakpointOwner::Task(task),
            place,
            None,
            Some(&self.tracer),
        )?;

        let outcome = loop {
            let stop = self.continue_internal()?;
            match stop {
                Stop::Breakpoint {
                    addr,
                    task: stop_task,
                    ..
                } if addr == ret && stop_task == task => break None,
                Stop::Breakpoint { .. } => {
                    // not at the return address yet, keep the task going
                    continue;
                }
                other => break Some(other),
            }
        };

        if self.debugee.execution_status == ExecutionStatus::InProgress {
            muted_error!(self
                .breakpoints
                .clear(ret, BreakpointOwner::Task(task), Some(&self.tracer)));
        }
        Ok(outcome)
    }

    /// Return address of the frame the focused task is stopped in.
    pub fn return_address(&self) -> Result<RelocatedAddress, Error> {
        let location = self.current_location()?;
        let regs = self.tracer.registers(location.pid)?;
        let offset = self
            .debugee
            .debug_info
            .frame_table
            .return_address_offset(location.global_pc)?;
        self.return_address_from_offset(regs.value(Register::Rsp), offset)
    }

    /// Dereference the return address slot `offset` bytes from the stack
    /// pointer.
    fn return_address_from_offset(
        &self,
        sp: u64,
        offset: i64,
    ) -> Result<RelocatedAddress, Error> {
        let slot = RelocatedAddress::from(sp.wrapping_add_signed(offset));
        let data = self.tracer.read_memory(slot, 8)?;
        let bytes: [u8; 8] = data.try_into().map_err(|_| Error::TypeBinaryRepr("u64"))?;
        Ok(RelocatedAddress::from(u64::from_le_bytes(bytes)))
    }

    /// Thread that executed the task at the last stop.
    fn task_tid(&self, task: TaskId) -> Pid {
        self.tasks
            .get(task)
            .map(|t| t.tid)
            .unwrap_or(self.current_tid)
    }
}
