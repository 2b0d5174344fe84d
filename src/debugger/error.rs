use crate::debugger::address::{GlobalAddress, RelocatedAddress};
use crate::debugger::task::TaskId;
use nix::unistd::Pid;
use std::str::Utf8Error;
use std::string::FromUtf8Error;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error("debugee already run")]
    AlreadyRun,
    #[error("program is not being started")]
    ProcessNotStarted,
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    Utf8(#[from] Utf8Error),
    #[error(transparent)]
    FromUtf8(#[from] FromUtf8Error),

    // --------------------------------- debugger entity not found----------------------------------
    #[error("no debug information for {0}")]
    NoDebugInformation(&'static str),
    #[error("unknown register {0:?}")]
    RegisterNotFound(gimli::Register),
    #[error("unknown register {0:?}")]
    RegisterNameNotFound(String),
    #[error("source place not found at address {0}")]
    PlaceNotFound(GlobalAddress),
    #[error("no source code at {file}:{line}")]
    LineNotFound { file: String, line: u64 },
    #[error("function {0} not found")]
    FunctionNotFound(String),
    #[error("function not found at address {0}")]
    FunctionByAddressNotFound(GlobalAddress),
    #[error("symbol {0} not found")]
    SymbolNotFound(String),
    #[error("variable or argument {0} not found in the current scope")]
    VariableNotFound(String),
    #[error("{0} has no member {1}")]
    MemberNotFound(String, String),
    #[error("task {0} not found")]
    TaskNotFound(TaskId),
    #[error("thread {0} not found")]
    TraceeNotFound(Pid),

    // --------------------------------- breakpoint errors -----------------------------------------
    #[error("invalid address {0}, no source code behind it")]
    InvalidAddress(RelocatedAddress),
    #[error("no breakpoint at {0}")]
    NoSuchBreakpoint(String),
    #[error("breakpoint already exists at {0}")]
    BreakpointExists(RelocatedAddress),
    #[error("trap at {0} does not hit a recognized breakpoint")]
    UnrecognizedBreakpoint(RelocatedAddress),

    // --------------------------------- stepping errors -------------------------------------------
    #[error("no frame description entry covers address {0}")]
    UnknownFde(GlobalAddress),

    // --------------------------------- syscall errors --------------------------------------------
    #[error("waitpid syscall error: {0}")]
    Waitpid(nix::Error),
    #[error("ptrace syscall error: {0}")]
    Ptrace(nix::Error),
    #[error("{0} syscall error: {1}")]
    Syscall(&'static str, nix::Error),
    #[error("multiple syscall errors: {0}")]
    MultipleErrors(String),
    #[error("trace thread is gone")]
    TracerGone,

    // --------------------------------- parsing errors --------------------------------------------
    #[error("dwarf parsing error: {0}")]
    DwarfParsing(#[from] gimli::Error),
    #[error("object file parsing error: {0}")]
    ObjParsing(#[from] object::Error),

    // --------------------------------- inspection errors -----------------------------------------
    #[error("invalid binary representation of type `{0}`")]
    TypeBinaryRepr(&'static str),
    #[error("dwarf expression evaluation: eval option `{0}` required")]
    EvalOptionRequired(&'static str),
    #[error("dwarf expression evaluation: unsupported evaluation require ({0})")]
    EvalUnsupportedRequire(&'static str),
    #[error("{0} is nil")]
    NilPointer(String),
    #[error("could not render a value of type {0}")]
    UnsupportedType(String),

    // --------------------------------- debugee process errors ------------------------------------
    #[error("debugee process exit with code {0}")]
    ProcessExit(i32),
    #[error("debugee process is detached")]
    Detached,
    #[error("interrupt")]
    Interrupt,

    // --------------------------------- attach debugee errors -------------------------------------
    #[error("process pid {0} not found")]
    AttachedProcessNotFound(Pid),
    #[error("attach a running process: {0}")]
    Attach(nix::Error),
}

impl Error {
    /// Return a hint to an interface - continue debugging after error or stop whole process.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::AlreadyRun => false,
            Error::ProcessNotStarted => false,
            Error::IO(_) => false,
            Error::Utf8(_) => false,
            Error::FromUtf8(_) => false,
            Error::NoDebugInformation(_) => false,
            Error::RegisterNotFound(_) => false,
            Error::RegisterNameNotFound(_) => false,
            Error::PlaceNotFound(_) => false,
            Error::LineNotFound { .. } => false,
            Error::FunctionNotFound(_) => false,
            Error::FunctionByAddressNotFound(_) => false,
            Error::SymbolNotFound(_) => false,
            Error::VariableNotFound(_) => false,
            Error::MemberNotFound(_, _) => false,
            Error::TaskNotFound(_) => false,
            Error::TraceeNotFound(_) => false,
            Error::InvalidAddress(_) => false,
            Error::NoSuchBreakpoint(_) => false,
            Error::BreakpointExists(_) => false,
            Error::UnknownFde(_) => false,
            Error::Waitpid(_) => false,
            Error::Ptrace(_) => false,
            Error::MultipleErrors(_) => false,
            Error::TypeBinaryRepr(_) => false,
            Error::EvalOptionRequired(_) => false,
            Error::EvalUnsupportedRequire(_) => false,
            Error::NilPointer(_) => false,
            Error::UnsupportedType(_) => false,
            Error::ProcessExit(_) => false,
            Error::Detached => false,
            Error::Interrupt => false,

            // currently fatal errors
            Error::UnrecognizedBreakpoint(_) => true,
            Error::Syscall(_, _) => true,
            Error::TracerGone => true,
            Error::DwarfParsing(_) => true,
            Error::ObjParsing(_) => true,
            Error::AttachedProcessNotFound(_) => true,
            Error::Attach(_) => true,
        }
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
