mod common;

mod breakpoints;
mod steps;
mod tasks;

use gostalker::debugger::process::{Child, Template};
use std::io::Read;
use std::process::Command;
use std::sync::Once;
use std::thread;

pub const HW_APP: &str = "./target/fixtures/helloworld";
pub const NEXT_APP: &str = "./target/fixtures/testnextprog";
pub const CONC_APP: &str = "./target/fixtures/concurrentprog";
pub const SLEEPER_APP: &str = "./target/fixtures/sleeper";

static BUILD_FIXTURES: Once = Once::new();

/// Compile debug friendly fixture binaries once per test run.
fn build_fixtures() {
    BUILD_FIXTURES.call_once(|| {
        std::fs::create_dir_all("./target/fixtures").expect("fixture dir");
        for fixture in ["helloworld", "testnextprog", "concurrentprog", "sleeper"] {
            let status = Command::new("go")
                .args([
                    "build",
                    "-o",
                    &format!("./target/fixtures/{fixture}"),
                    "-gcflags",
                    "-N -l",
                    &format!("./fixtures/{fixture}.go"),
                ])
                .status()
                .expect("go toolchain expected in PATH");
            assert!(status.success(), "fixture {fixture} must compile");
        }
    });
}

/// Prepare a debugee process template with drained stdio.
pub fn prepare_debugee_process(app: &str, args: &[&str]) -> Child<Template> {
    build_fixtures();

    let (out_reader, out_writer) = os_pipe::pipe().expect("stdout pipe");
    let (err_reader, err_writer) = os_pipe::pipe().expect("stderr pipe");
    drain(out_reader);
    drain(err_reader);

    Child::new(app, args.to_vec(), out_writer, err_writer)
}

fn drain(mut pipe: os_pipe::PipeReader) {
    thread::spawn(move || {
        let mut sink = Vec::new();
        let _ = pipe.read_to_end(&mut sink);
    });
}

#[macro_export]
macro_rules! assert_no_proc {
    ($pid:expr) => {
        let mut exists = true;
        for _ in 0..50 {
            exists = std::path::Path::new(&format!("/proc/{}", $pid.as_raw())).exists();
            if !exists {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(!exists, "debugee process must be gone");
    };
}
