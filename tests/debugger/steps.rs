use crate::common::{DebugeeRunInfo, TestHooks};
use crate::{assert_no_proc, prepare_debugee_process, HW_APP, NEXT_APP};
use gostalker::debugger::DebuggerBuilder;
use serial_test::serial;

#[test]
#[serial]
fn test_step_instruction_moves_forward() {
    let process = prepare_debugee_process(HW_APP, &[]);
    let info = DebugeeRunInfo::default();
    let mut debugger = DebuggerBuilder::new()
        .with_hooks(TestHooks::new(info.clone()))
        .build(process)
        .unwrap();
    let debugee_pid = debugger.process_pid();

    debugger.set_breakpoint_at_fn("main.main").unwrap();
    debugger.start_debugee().unwrap();

    let pc1 = debugger.current_location().unwrap().pc;
    debugger.step_instruction().unwrap();
    let pc2 = debugger.current_location().unwrap().pc;
    assert!(pc2 > pc1);

    debugger.continue_debugee().unwrap();
    assert_no_proc!(debugee_pid);
}

#[test]
#[serial]
fn test_next_over_call() {
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

    // the call on line 10 runs to completion, the stop is on the next line
    debugger.step_over().unwrap();
    assert_eq!(info.line.take(), Some(11));

    debugger.continue_debugee().unwrap();
    assert_no_proc!(debugee_pid);
}

#[test]
#[serial]
fn test_next_through_loop() {
    let process = prepare_debugee_process(NEXT_APP, &[]);
    let info = DebugeeRunInfo::default();
    let mut debugger = DebuggerBuilder::new()
        .with_hooks(TestHooks::new(info.clone()))
        .build(process)
        .unwrap();
    let debugee_pid = debugger.process_pid();

    debugger
        .set_breakpoint_at_line("testnextprog.go", 19)
        .unwrap();
    debugger.start_debugee().unwrap();
    assert_eq!(info.line.take(), Some(19));

    let mut expected = vec![20, 23];
    for _ in 0..3 {
        expected.extend_from_slice(&[24, 26, 31, 23]);
    }
    expected.push(34);

    for line in expected {
        debugger.step_over().unwrap();
        assert_eq!(info.line.take(), Some(line), "stepping over to line {line}");
    }

    debugger.continue_debugee().unwrap();
    assert_no_proc!(debugee_pid);
}

#[test]
#[serial]
fn test_find_return_address() {
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

    // the return address must resolve right behind the call site
    let ret = debugger.return_address().unwrap();
    let place = debugger.place_for_pc(ret).unwrap();
    assert_eq!(place.line_number, 11);

    debugger.continue_debugee().unwrap();
    assert_no_proc!(debugee_pid);
}
