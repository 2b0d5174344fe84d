use crate::debugger::address::RelocatedAddress;
use crate::debugger::task::TaskId;
use crate::debugger::{EventHook, PlaceOwned};
use nix::sys::signal::Signal;
use std::fs;

/// Hook that renders debugee events right into the terminal.
pub struct TerminalHook;

impl TerminalHook {
    /// Print the source line behind a place, best effort.
    fn print_source(place: &PlaceOwned) {
        println!("{}:{}", place.file, place.line_number);
        let Ok(content) = fs::read_to_string(&place.file) else {
            return;
        };
        if let Some(line) = content.lines().nth(place.line_number.saturating_sub(1) as usize) {
            println!("{:>6}: {}", place.line_number, line);
        }
    }
}

impl EventHook for TerminalHook {
    fn on_breakpoint(
        &self,
        pc: RelocatedAddress,
        num: u32,
        place: Option<PlaceOwned>,
        _task: TaskId,
    ) -> anyhow::Result<()> {
        println!("Hit breakpoint {num} at address {pc}");
        if let Some(place) = place {
            Self::print_source(&place);
        }
        Ok(())
    }

    fn on_step(&self, _pc: RelocatedAddress, place: Option<PlaceOwned>) -> anyhow::Result<()> {
        if let Some(place) = place {
            Self::print_source(&place);
        }
        Ok(())
    }

    fn on_signal(&self, signal: Signal) {
        println!("Signal {signal} received");
    }

    fn on_task_switch(&self, _from: TaskId, to: TaskId) {
        println!("Switch to goroutine {to}");
    }

    fn on_exit(&self, code: i32) {
        println!("Process exit with code {code}");
    }
}
