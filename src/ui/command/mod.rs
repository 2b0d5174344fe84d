//! Commands the console accepts and hands over to the debugger.

pub mod parser;

/// Ways a user can point at a breakpoint location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakpointIdentity {
    /// Raw instruction address.
    Address(usize),
    /// File and line number.
    Line(String, u64),
    /// Function name.
    Function(String),
    /// Breakpoint number (or a raw decimal address as a fallback).
    Number(u64),
}

/// External command processed by the debugger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Continue,
    Step,
    Next,
    Break(BreakpointIdentity),
    Clear(BreakpointIdentity),
    BreakpointList,
    Print(String),
    Locals,
    Arguments,
    Registers,
    Threads,
    Tasks,
    Help,
    Exit,
}

#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error("malformed command: {0}")]
    Parsing(String),
    #[error(transparent)]
    Handle(#[from] crate::debugger::Error),
}

pub type CommandResult<T> = Result<T, CommandError>;
