use crate::common::{DebugeeRunInfo, TestHooks};
use crate::{assert_no_proc, prepare_debugee_process, CONC_APP, SLEEPER_APP};
use gostalker::debugger::task::TaskId;
use gostalker::debugger::{DebuggerBuilder, Error};
use serial_test::serial;
use std::thread;
use std::time::Duration;

#[test]
#[serial]
fn test_breakpoint_stops_both_tasks() {
    let process = prepare_debugee_process(CONC_APP, &[]);
    let info = DebugeeRunInfo::default();
    let mut debugger = DebuggerBuilder::new()
        .with_hooks(TestHooks::new(info.clone()))
        .build(process)
        .unwrap();
    let debugee_pid = debugger.process_pid();

    debugger.set_breakpoint_at_fn("main.sayhi").unwrap();
    debugger.start_debugee().unwrap();

    let first_task = info.task.take().expect("stop must carry a task id");
    assert_ne!(first_task, TaskId::NONE);

    debugger.continue_debugee().unwrap();
    let second_task = info.task.take().expect("stop must carry a task id");
    assert_ne!(second_task, TaskId::NONE);

    // two concurrent tasks traverse the function, each stops once
    assert_ne!(first_task, second_task);

    debugger.continue_debugee().unwrap();
    assert_eq!(info.exit_code.take(), Some(0));
    assert_no_proc!(debugee_pid);
}

#[test]
#[serial]
fn test_task_listing() {
    let process = prepare_debugee_process(CONC_APP, &[]);
    let info = DebugeeRunInfo::default();
    let mut debugger = DebuggerBuilder::new()
        .with_hooks(TestHooks::new(info.clone()))
        .build(process)
        .unwrap();
    let debugee_pid = debugger.process_pid();

    debugger.set_breakpoint_at_fn("main.sayhi").unwrap();
    debugger.start_debugee().unwrap();

    let tasks = debugger.task_state().unwrap();
    // the main task plus the two spawned ones at least
    assert!(tasks.len() >= 3, "unexpected task count: {}", tasks.len());
    assert!(tasks.iter().all(|view| view.task.stack_lo <= view.task.stack_hi));

    let current = debugger.current_task();
    assert!(tasks.iter().any(|view| view.task.id == current));

    debugger.continue_debugee().unwrap();
    debugger.continue_debugee().unwrap();
    assert_no_proc!(debugee_pid);
}

#[test]
#[serial]
fn test_manual_stop() {
    let process = prepare_debugee_process(SLEEPER_APP, &[]);
    let info = DebugeeRunInfo::default();
    let mut debugger = DebuggerBuilder::new()
        .with_hooks(TestHooks::new(info.clone()))
        .build(process)
        .unwrap();
    let debugee_pid = debugger.process_pid();

    let stop_handle = debugger.stop_handle();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        stop_handle.stop();
    });

    let result = debugger.start_debugee();
    assert!(matches!(result, Err(Error::Interrupt)));

    drop(debugger);
    assert_no_proc!(debugee_pid);
}
