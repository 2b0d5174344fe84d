use crate::common::{DebugeeRunInfo, TestHooks};
use crate::{assert_no_proc, prepare_debugee_process, HW_APP};
use gostalker::debugger::breakpoint::TRAP_BYTE;
use gostalker::debugger::DebuggerBuilder;
use serial_test::serial;
use std::mem;

#[test]
#[serial]
fn test_debugee_run() {
    let process = prepare_debugee_process(HW_APP, &[]);
    let info = DebugeeRunInfo::default();
    let mut debugger = DebuggerBuilder::new()
        .with_hooks(TestHooks::new(info.clone()))
        .build(process)
        .unwrap();
    let debugee_pid = debugger.process_pid();

    debugger.start_debugee().unwrap();

    assert_eq!(info.exit_code.take(), Some(0));
    assert_no_proc!(debugee_pid);
}

#[test]
#[serial]
fn test_multiple_breakpoints() {
    let process = prepare_debugee_process(HW_APP, &[]);
    let info = DebugeeRunInfo::default();
    let mut debugger = DebuggerBuilder::new()
        .with_hooks(TestHooks::new(info.clone()))
        .build(process)
        .unwrap();
    let debugee_pid = debugger.process_pid();

    debugger.set_breakpoint_at_line("helloworld.go", 6).unwrap();
    debugger
        .set_breakpoint_at_line("helloworld.go", 11)
        .unwrap();

    debugger.start_debugee().unwrap();
    assert_eq!(info.line.take(), Some(6));

    debugger.continue_debugee().unwrap();
    assert_eq!(info.line.take(), Some(11));

    debugger.continue_debugee().unwrap();
    assert_eq!(info.exit_code.take(), Some(0));
    assert_no_proc!(debugee_pid);
}

#[test]
#[serial]
fn test_breakpoint_at_fn_entry() {
    let process = prepare_debugee_process(HW_APP, &[]);
    let info = DebugeeRunInfo::default();
    let mut debugger = DebuggerBuilder::new()
        .with_hooks(TestHooks::new(info.clone()))
        .build(process)
        .unwrap();
    let debugee_pid = debugger.process_pid();

    debugger.set_breakpoint_at_fn("main.myprint").unwrap();

    debugger.start_debugee().unwrap();
    let pc1 = debugger.current_location().unwrap().pc;
    assert_eq!(info.line.take(), Some(5));

    debugger.continue_debugee().unwrap();
    assert_eq!(info.exit_code.take(), Some(0));
    assert!(u64::from(pc1) > 0);
    assert_no_proc!(debugee_pid);
}

#[test]
#[serial]
fn test_breakpoint_stop_and_step() {
    let process = prepare_debugee_process(HW_APP, &[]);
    let info = DebugeeRunInfo::default();
    let mut debugger = DebuggerBuilder::new()
        .with_hooks(TestHooks::new(info.clone()))
        .build(process)
        .unwrap();
    let debugee_pid = debugger.process_pid();

    let view = debugger.set_breakpoint_at_fn("main.myprint").unwrap();
    let entry = view.addr;

    debugger.start_debugee().unwrap();

    // the stop lands exactly on the rewound breakpoint address
    let pc1 = debugger.current_location().unwrap().pc;
    assert_eq!(pc1, entry);

    debugger.step_instruction().unwrap();
    let pc2 = debugger.current_location().unwrap().pc;
    assert!(pc2 > pc1);

    debugger.continue_debugee().unwrap();
    assert_no_proc!(debugee_pid);
}

#[test]
#[serial]
fn test_clear_breakpoint_restores_text() {
    let process = prepare_debugee_process(HW_APP, &[]);
    let info = DebugeeRunInfo::default();
    let mut debugger = DebuggerBuilder::new()
        .with_hooks(TestHooks::new(info.clone()))
        .build(process)
        .unwrap();
    let debugee_pid = debugger.process_pid();

    debugger.set_breakpoint_at_line("helloworld.go", 10).unwrap();
    debugger.start_debugee().unwrap();
    assert_eq!(info.line.take(), Some(10));

    // a breakpoint installed while the debugee is alive is armed at once
    let view = debugger.set_breakpoint_at_fn("main.myprint").unwrap();
    let entry = view.addr;
    assert_eq!(debugger.read_memory(entry, 1).unwrap()[0], TRAP_BYTE);

    let removed = debugger.remove_breakpoint(entry).unwrap();
    assert_eq!(removed.addr, entry);
    assert_ne!(debugger.read_memory(entry, 1).unwrap()[0], TRAP_BYTE);
    assert_eq!(debugger.breakpoints_snapshot().len(), 1);

    debugger.continue_debugee().unwrap();
    assert_no_proc!(debugee_pid);
}

#[test]
#[serial]
fn test_debugger_graceful_shutdown() {
    let process = prepare_debugee_process(HW_APP, &[]);
    let info = DebugeeRunInfo::default();
    let mut debugger = DebuggerBuilder::new()
        .with_hooks(TestHooks::new(info.clone()))
        .build(process)
        .unwrap();
    let debugee_pid = debugger.process_pid();

    debugger.set_breakpoint_at_line("helloworld.go", 6).unwrap();
    debugger.start_debugee().unwrap();
    assert_eq!(info.line.take(), Some(6));

    mem::drop(debugger);
    assert_no_proc!(debugee_pid);
}
