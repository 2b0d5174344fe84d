use gostalker::debugger::address::RelocatedAddress;
use gostalker::debugger::task::TaskId;
use gostalker::debugger::{EventHook, PlaceOwned};
use nix::sys::signal::Signal;
use std::cell::Cell;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct DebugeeRunInfo {
    pub line: Arc<Cell<Option<u64>>>,
    pub file: Arc<Cell<Option<String>>>,
    pub task: Arc<Cell<Option<TaskId>>>,
    pub exit_code: Arc<Cell<Option<i32>>>,
}

#[derive(Default)]
pub struct TestHooks {
    info: DebugeeRunInfo,
}

impl TestHooks {
    pub fn new(info: DebugeeRunInfo) -> Self {
        Self { info }
    }
}

impl EventHook for TestHooks {
    fn on_breakpoint(
        &self,
        _pc: RelocatedAddress,
        _num: u32,
        place: Option<PlaceOwned>,
        task: TaskId,
    ) -> anyhow::Result<()> {
        self.info.file.set(place.as_ref().map(|p| p.file.clone()));
        self.info.line.set(place.map(|p| p.line_number));
        self.info.task.set(Some(task));
        Ok(())
    }

    fn on_step(&self, _pc: RelocatedAddress, place: Option<PlaceOwned>) -> anyhow::Result<()> {
        self.info.file.set(place.as_ref().map(|p| p.file.clone()));
        self.info.line.set(place.map(|p| p.line_number));
        Ok(())
    }

    fn on_signal(&self, _: Signal) {}

    fn on_task_switch(&self, _: TaskId, _: TaskId) {}

    fn on_exit(&self, code: i32) {
        self.info.exit_code.set(Some(code));
    }
}
