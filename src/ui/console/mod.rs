pub mod hook;

use crate::debugger::address::RelocatedAddress;
use crate::debugger::debugee::ExecutionStatus;
use crate::debugger::error::Error;
use crate::debugger::register;
use crate::debugger::{Debugger, Variable};
use crate::ui::command::parser;
use crate::ui::command::{BreakpointIdentity, Command, CommandError, CommandResult};
use crate::weak_error;
use os_pipe::PipeReader;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::io::{BufRead, BufReader, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

const WELCOME_TEXT: &str = "gostalker greets. Type 'help' for a list of commands.";
const PROMPT: &str = "(gos) ";
const HISTORY_FILE: &str = ".gostalker_history";
const HELP_TEXT: &str = r#"
break <loc>      set a breakpoint (file:line, function, 0xaddr)
clear <loc|id>   remove a breakpoint
breakpoints      list breakpoints
continue         run until the next breakpoint or event
step             execute one machine instruction
next             step over one source line
print <expr>     print a variable, var.member or 0xaddr
locals           print local variables of the current function
args             print arguments of the current function
regs             print registers of the focused thread
threads          list OS threads
goroutines       list logical tasks of the debugee runtime
exit             detach or kill the debugee and leave
"#;

/// Console application: a line editor in front of the debugger event loop.
pub struct TerminalApplication {
    debugger: Debugger,
    debugee_out: PipeReader,
    debugee_err: PipeReader,
}

impl TerminalApplication {
    pub fn new(debugger: Debugger, debugee_out: PipeReader, debugee_err: PipeReader) -> Self {
        Self {
            debugger,
            debugee_out,
            debugee_err,
        }
    }

    pub fn run(mut self) -> anyhow::Result<()> {
        // while a control verb blocks this thread, SIGINT must turn into a
        // manual debugee stop instead of killing the session
        let running = Arc::new(AtomicBool::new(false));
        let stop_handle = self.debugger.stop_handle();
        {
            let running = running.clone();
            ctrlc::set_handler(move || {
                if running.load(Ordering::Acquire) {
                    stop_handle.stop();
                }
            })?;
        }

        mirror_debugee_output(self.debugee_out.try_clone()?, false);
        mirror_debugee_output(self.debugee_err.try_clone()?, true);

        let mut editor = DefaultEditor::new()?;
        if editor.load_history(HISTORY_FILE).is_err() {
            println!("No previous history.");
        }
        println!("{WELCOME_TEXT}");

        loop {
            match editor.readline(PROMPT) {
                Ok(line) => {
                    let line = line.trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    let _ = editor.add_history_entry(&line);

                    let command = match parser::parse(&line) {
                        Ok(command) => command,
                        Err(e) => {
                            eprintln!("{e}");
                            continue;
                        }
                    };

                    if command == Command::Exit {
                        self.handle_exit(&mut editor);
                        return Ok(());
                    }

                    running.store(true, Ordering::Release);
                    let result = self.handle(command);
                    running.store(false, Ordering::Release);

                    if let Err(e) = result {
                        eprintln!("Command failed: {e}");
                    }
                }
                Err(ReadlineError::Interrupted) => continue,
                Err(ReadlineError::Eof) => {
                    self.handle_exit(&mut editor);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn handle(&mut self, command: Command) -> CommandResult<()> {
        let debugger = &mut self.debugger;
        match command {
            Command::Continue => {
                let result = if debugger.execution_status() == ExecutionStatus::Unload {
                    debugger.start_debugee()
                } else {
                    debugger.continue_debugee()
                };
                self.finish_control_verb(result)
            }
            Command::Step => {
                let result = self.debugger.step_instruction();
                self.finish_control_verb(result)
            }
            Command::Next => {
                let result = self.debugger.step_over();
                self.finish_control_verb(result)
            }
            Command::Break(identity) => {
                let view = match identity {
                    BreakpointIdentity::Line(file, line) => {
                        debugger.set_breakpoint_at_line(&file, line)?
                    }
                    BreakpointIdentity::Function(name) => debugger.set_breakpoint_at_fn(&name)?,
                    BreakpointIdentity::Address(addr) => {
                        debugger.set_breakpoint_at_address(RelocatedAddress::from(addr))?
                    }
                    BreakpointIdentity::Number(number) => {
                        let addr = RelocatedAddress::from(number as usize);
                        debugger.set_breakpoint_at_address(addr)?
                    }
                };
                match &view.place {
                    Some(place) => println!(
                        "Breakpoint {} set at {} {}:{}",
                        view.id, view.addr, place.file, place.line_number
                    ),
                    None => println!("Breakpoint {} set at {}", view.id, view.addr),
                }
                Ok(())
            }
            Command::Clear(identity) => {
                let addr = self.resolve_breakpoint_addr(identity)?;
                let view = self.debugger.remove_breakpoint(addr)?;
                println!("Breakpoint {} cleared at {}", view.id, view.addr);
                Ok(())
            }
            Command::BreakpointList => {
                for view in self.debugger.breakpoints_snapshot() {
                    let function = view.function.as_deref().unwrap_or("?");
                    match &view.place {
                        Some(place) => println!(
                            "{}\t{}\t{}:{}\t{}",
                            view.id, view.addr, place.file, place.line_number, function
                        ),
                        None => println!("{}\t{}\t?\t{}", view.id, view.addr, function),
                    }
                }
                Ok(())
            }
            Command::Print(expr) => {
                let variable = self.debugger.read_variable(&expr)?;
                print_variable(&variable);
                Ok(())
            }
            Command::Locals => {
                for variable in self.debugger.read_locals()? {
                    print_variable(&variable);
                }
                Ok(())
            }
            Command::Arguments => {
                for variable in self.debugger.read_arguments()? {
                    print_variable(&variable);
                }
                Ok(())
            }
            Command::Registers => {
                let regs = self.debugger.registers()?;
                for descr in register::LIST.iter() {
                    println!("{:>10}: {:#018x}", descr.name, regs.value(descr.r));
                }
                Ok(())
            }
            Command::Threads => {
                for snapshot in self.debugger.thread_state()? {
                    let focus = if snapshot.in_focus { "*" } else { " " };
                    match (snapshot.pc, &snapshot.place) {
                        (Some(pc), Some(place)) => println!(
                            "{focus}Thread {} at {} {}:{} {}",
                            snapshot.tracee.pid,
                            pc,
                            place.file,
                            place.line_number,
                            snapshot.function.as_deref().unwrap_or("?"),
                        ),
                        (Some(pc), None) => {
                            println!("{focus}Thread {} at {}", snapshot.tracee.pid, pc)
                        }
                        _ => println!("{focus}Thread {}", snapshot.tracee.pid),
                    }
                }
                Ok(())
            }
            Command::Tasks => {
                let tasks = self.debugger.task_state()?;
                println!("[{} goroutines]", tasks.len());
                for view in tasks {
                    let focus = if view.in_focus { "*" } else { " " };
                    let position = match &view.place {
                        Some(place) => format!(
                            "{}:{} {}",
                            place.file,
                            place.line_number,
                            view.function.as_deref().unwrap_or("?")
                        ),
                        None => "?".to_string(),
                    };
                    println!(
                        "{focus}Goroutine {} - {} stack:[{:#x}-{:#x})",
                        view.task.id, position, view.task.stack_lo, view.task.stack_hi
                    );
                }
                Ok(())
            }
            Command::Help => {
                println!("{HELP_TEXT}");
                Ok(())
            }
            Command::Exit => unreachable!("exit is handled by the main loop"),
        }
    }

    /// Interrupt is a normal outcome of a control verb: show where the
    /// debugee stopped and go back to the prompt.
    fn finish_control_verb(&self, result: Result<(), Error>) -> CommandResult<()> {
        match result {
            Err(Error::Interrupt) => {
                println!("Interrupted");
                if let Some(Some(place)) = weak_error!(self.debugger.current_place()) {
                    println!("{}:{}", place.file, place.line_number);
                }
                Ok(())
            }
            other => Ok(other?),
        }
    }

    fn resolve_breakpoint_addr(
        &self,
        identity: BreakpointIdentity,
    ) -> CommandResult<RelocatedAddress> {
        let addr = match identity {
            BreakpointIdentity::Address(addr) => RelocatedAddress::from(addr),
            BreakpointIdentity::Number(number) => self
                .debugger
                .breakpoint_by_id(number as u32)
                .unwrap_or(RelocatedAddress::from(number as usize)),
            BreakpointIdentity::Line(ref file, line) => self
                .debugger
                .breakpoints_snapshot()
                .into_iter()
                .find(|view| {
                    view.place.as_ref().is_some_and(|place| {
                        place.file.ends_with(file) && place.line_number == line
                    })
                })
                .map(|view| view.addr)
                .ok_or_else(|| {
                    CommandError::Handle(Error::NoSuchBreakpoint(format!("{file}:{line}")))
                })?,
            BreakpointIdentity::Function(ref name) => self
                .debugger
                .breakpoints_snapshot()
                .into_iter()
                .find(|view| view.function.as_deref() == Some(name))
                .map(|view| view.addr)
                .ok_or_else(|| {
                    CommandError::Handle(Error::NoSuchBreakpoint(name.to_string()))
                })?,
        };
        Ok(addr)
    }

    fn handle_exit(&mut self, editor: &mut DefaultEditor) {
        if let Err(e) = editor.save_history(HISTORY_FILE) {
            log::warn!(target: "console", "save history: {e}");
        }

        // restore the debugee text before leaving
        for view in self.debugger.breakpoints_snapshot() {
            weak_error!(self.debugger.remove_breakpoint(view.addr));
        }

        if self.debugger.execution_status() != ExecutionStatus::InProgress {
            return;
        }

        if self.debugger.is_external() {
            println!("Detaching from process {}...", self.debugger.process_pid());
            weak_error!(self.debugger.detach());
            return;
        }

        let answer = editor
            .readline("Would you like to kill the process? [y/n] ")
            .unwrap_or_else(|_| "y".to_string());
        if answer.trim() == "y" {
            println!("Killing process {}", self.debugger.process_pid());
            // dropping the debugger kills the spawned debugee
        } else {
            println!("Detaching from process {}...", self.debugger.process_pid());
            weak_error!(self.debugger.detach());
        }
    }
}

fn print_variable(variable: &Variable) {
    println!(
        "{} = {} ({})",
        variable.name, variable.value, variable.type_name
    );
}

/// Mirror a debugee output pipe into our stdout/stderr.
fn mirror_debugee_output(pipe: PipeReader, errors: bool) {
    thread::spawn(move || {
        let mut reader = BufReader::new(pipe);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if errors {
                        let _ = write!(std::io::stderr(), "{line}");
                    } else {
                        let _ = write!(std::io::stdout(), "{line}");
                    }
                }
            }
        }
    });
}
