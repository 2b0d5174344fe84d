use anyhow::Context;
use clap::Parser;
use gostalker::debugger::process::Child;
use gostalker::debugger::DebuggerBuilder;
use gostalker::log::LOGGER_SWITCHER;
use gostalker::ui::console::hook::TerminalHook;
use gostalker::ui::console::TerminalApplication;
use nix::unistd::Pid;
use std::process::Command;

#[derive(Parser)]
#[command(version, about = "Source-level debugger for green-threaded targets")]
struct Args {
    /// Path to the debugee executable (or to a source package with --build)
    debugee: Option<String>,

    /// Arguments passed to the debugee
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,

    /// Attach to a running process instead of launching one
    #[arg(long)]
    pid: Option<i32>,

    /// Compile the target without optimizations before launching
    #[arg(long)]
    build: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_logger = env_logger::Builder::from_default_env().build();
    let filter = env_logger.filter();
    LOGGER_SWITCHER.switch(env_logger, filter);

    let (out_reader, out_writer) = os_pipe::pipe()?;
    let (err_reader, err_writer) = os_pipe::pipe()?;

    let builder = DebuggerBuilder::new().with_hooks(TerminalHook);
    let debugger = match args.pid {
        Some(pid) => builder.attach(Pid::from_raw(pid), out_writer, err_writer)?,
        None => {
            let mut program = args.debugee.context("debugee executable expected")?;
            if args.build {
                program = build_debugee(&program)?;
            }
            let child = Child::new(program, args.args, out_writer, err_writer);
            builder.build(child)?
        }
    };

    TerminalApplication::new(debugger, out_reader, err_reader).run()
}

/// Compile a debuggable binary: optimizations and inlining get in the way of
/// the line table.
fn build_debugee(package: &str) -> anyhow::Result<String> {
    const OUTPUT: &str = "./debug";

    let status = Command::new("go")
        .args(["build", "-o", OUTPUT, "-gcflags", "-N -l", package])
        .status()
        .context("run go build")?;
    anyhow::ensure!(status.success(), "could not compile {package}");

    Ok(OUTPUT.to_string())
}
