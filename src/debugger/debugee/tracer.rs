use crate::debugger::address::RelocatedAddress;
use crate::debugger::debugee::tracee::{Tracee, TraceeCtl};
use crate::debugger::error::Error;
use crate::debugger::process::{Child, Installed};
use crate::debugger::register::RegisterMap;
use crate::debugger::task::TaskId;
use crate::debugger::TargetMemory;
use log::{debug, warn};
use nix::errno::Errno;
use nix::libc::{c_long, c_void, pid_t};
use nix::sys;
use nix::sys::signal::{kill, Signal};
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::libc;
use nix::unistd::Pid;
use std::collections::VecDeque;
use std::io::IoSliceMut;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, SyncSender};
use std::sync::{mpsc, Arc};
use std::thread;

// SIGTRAP si_code values (linux siginfo.h)
const TRAP_BRKPT: i32 = 0x1;
const TRAP_TRACE: i32 = 0x2;
const SI_KERNEL: i32 = 0x80;

/// Capacity of the trap event queue between the trace thread and the event
/// loop.
pub const TRAP_QUEUE_CAPACITY: usize = 64;

/// What stopped the debugee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    /// Debugee reached its entry point (just after execve).
    DebugeeStart,
    /// A software breakpoint byte was executed.
    Breakpoint,
    /// Trap flag single-step exception.
    SingleStep,
    /// Stop requested by the user.
    Manual,
    /// Debugee stopped with an OS signal.
    Signal(Signal),
    /// Whole debugee process exited with code.
    Exit(i32),
}

/// Event pushed by the trace thread into the trap queue.
#[derive(Debug, Clone, Copy)]
pub struct TrapEvent {
    pub kind: TrapKind,
    /// OS thread the event happened on.
    pub tid: Pid,
    /// Logical task of `tid`. The trace thread never resolves tasks (that
    /// requires debug info reads), the receiver does it on delivery.
    pub task: Option<TaskId>,
}

enum Request {
    Resume,
    Registers(Pid),
    SetRegisters(Pid, RegisterMap),
    ReadMemory(usize, usize),
    WriteMemory(usize, Vec<u8>),
    Threads,
    Detach,
    Kill,
}

enum Reply {
    Unit,
    Registers(RegisterMap),
    Memory(Vec<u8>),
    Threads(Vec<Tracee>),
}

struct Command {
    request: Request,
    reply_tx: Sender<Result<Reply, Error>>,
}

/// Requester side of the trace thread.
///
/// Every ptrace interaction with the debugee goes through this handle: the
/// kernel accepts trace requests only from the attaching thread, so one
/// dedicated thread owns them all and the rest of the debugger talks to it.
#[derive(Clone)]
pub struct TracerHandle {
    request_tx: Sender<Command>,
}

impl TracerHandle {
    fn request(&self, request: Request) -> Result<Reply, Error> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.request_tx
            .send(Command { request, reply_tx })
            .map_err(|_| Error::TracerGone)?;
        reply_rx.recv().map_err(|_| Error::TracerGone)?
    }

    /// Resume every stopped thread of the debugee. The next stop arrives
    /// through the trap queue.
    pub fn resume(&self) -> Result<(), Error> {
        self.request(Request::Resume).map(|_| ())
    }

    pub fn registers(&self, tid: Pid) -> Result<RegisterMap, Error> {
        match self.request(Request::Registers(tid))? {
            Reply::Registers(regs) => Ok(regs),
            _ => Err(Error::TracerGone),
        }
    }

    pub fn set_registers(&self, tid: Pid, regs: RegisterMap) -> Result<(), Error> {
        self.request(Request::SetRegisters(tid, regs)).map(|_| ())
    }

    pub fn threads(&self) -> Result<Vec<Tracee>, Error> {
        match self.request(Request::Threads)? {
            Reply::Threads(threads) => Ok(threads),
            _ => Err(Error::TracerGone),
        }
    }

    pub fn detach(&self) -> Result<(), Error> {
        self.request(Request::Detach).map(|_| ())
    }

    pub fn kill(&self) -> Result<(), Error> {
        self.request(Request::Kill).map(|_| ())
    }
}

impl TargetMemory for TracerHandle {
    fn read_memory(&self, addr: RelocatedAddress, len: usize) -> Result<Vec<u8>, Error> {
        match self.request(Request::ReadMemory(addr.as_usize(), len))? {
            Reply::Memory(data) => Ok(data),
            _ => Err(Error::TracerGone),
        }
    }

    fn write_memory(&self, addr: RelocatedAddress, data: &[u8]) -> Result<(), Error> {
        self.request(Request::WriteMemory(addr.as_usize(), data.to_vec()))
            .map(|_| ())
    }
}

/// Side door for interrupting a running debugee. Unlike [`TracerHandle`] it
/// may be used from any thread (a signal handler included): it only sets the
/// halt flag and sends SIGSTOP, the trace thread does the rest.
#[derive(Clone)]
pub struct StopHandle {
    pid: Pid,
    halt: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.halt.store(true, Ordering::Release);
        if let Err(e) = kill(self.pid, Signal::SIGSTOP) {
            warn!(target: "tracer", "manual stop: {e}");
        }
    }
}

/// Ptrace tracer. Lives on its own thread, converts wait statuses into trap
/// events and serves state requests between stops.
pub struct Tracer {
    tracee_ctl: TraceeCtl,
    sink: SyncSender<TrapEvent>,
    halt: Arc<AtomicBool>,
    /// Stops observed while the world was being stopped for an earlier event.
    /// Delivered one by one by subsequent resume requests.
    pending: VecDeque<TrapEvent>,
    /// Signal to inject on the next resume.
    inject: Option<(Pid, Signal)>,
    _child: Child<Installed>,
}

impl Tracer {
    /// Install the debugee (spawn or attach) on a fresh trace thread and
    /// start serving requests.
    ///
    /// # Arguments
    ///
    /// * `install`: debugee installation routine, executed on the trace
    ///   thread so that this thread becomes the ptrace tracer.
    /// * `sink`: trap event queue producer end.
    /// * `halt`: manual stop flag shared with [`StopHandle`].
    pub fn start(
        install: impl FnOnce() -> Result<Child<Installed>, Error> + Send + 'static,
        sink: SyncSender<TrapEvent>,
        halt: Arc<AtomicBool>,
    ) -> Result<(TracerHandle, StopHandle, Pid, String, bool), Error> {
        let (request_tx, request_rx) = mpsc::channel();
        let (boot_tx, boot_rx) = mpsc::channel();

        let thread_halt = halt.clone();
        thread::Builder::new()
            .name("gostalker-trace".into())
            .spawn(move || {
                let child = match install() {
                    Ok(child) => child,
                    Err(e) => {
                        let _ = boot_tx.send(Err(e));
                        return;
                    }
                };

                let pid = child.pid();
                let mut tracee_ctl = TraceeCtl::new(pid);
                if let Some(info) = child.external_info() {
                    for &tid in &info.threads {
                        if tid != pid {
                            tracee_ctl.add(tid);
                        }
                    }
                }

                let boot_info = (pid, child.program().to_string(), child.is_external());
                let tracer = Tracer {
                    tracee_ctl,
                    sink,
                    halt: thread_halt,
                    pending: VecDeque::new(),
                    inject: None,
                    _child: child,
                };

                let _ = boot_tx.send(Ok(boot_info));
                tracer.run(request_rx);
            })?;

        let (pid, program, external) = boot_rx.recv().map_err(|_| Error::TracerGone)??;
        Ok((
            TracerHandle { request_tx },
            StopHandle { pid, halt },
            pid,
            program,
            external,
        ))
    }

    fn run(mut self, request_rx: Receiver<Command>) {
        while let Ok(cmd) = request_rx.recv() {
            let reply = self.handle(cmd.request);
            let _ = cmd.reply_tx.send(reply);
        }
        debug!(target: "tracer", "request channel closed, trace thread exits");
    }

    fn handle(&mut self, request: Request) -> Result<Reply, Error> {
        match request {
            Request::Resume => self.resume().map(|_| Reply::Unit),
            Request::Registers(tid) => RegisterMap::current(tid)
                .map(Reply::Registers)
                .map_err(Error::Ptrace),
            Request::SetRegisters(tid, regs) => {
                regs.persist(tid).map(|_| Reply::Unit).map_err(Error::Ptrace)
            }
            Request::ReadMemory(addr, len) => {
                self.read_memory(addr, len).map(Reply::Memory)
            }
            Request::WriteMemory(addr, data) => {
                self.write_memory(addr, &data).map(|_| Reply::Unit)
            }
            Request::Threads => Ok(Reply::Threads(self.tracee_ctl.snapshot())),
            Request::Detach => {
                for tracee in self.tracee_ctl.snapshot() {
                    if let Err(e) = sys::ptrace::detach(tracee.pid, None) {
                        if e != Errno::ESRCH {
                            return Err(Error::Ptrace(e));
                        }
                    }
                    self.tracee_ctl.remove(tracee.pid);
                }
                Ok(Reply::Unit)
            }
            Request::Kill => {
                let pid = self.tracee_ctl.proc_pid();
                if let Err(e) = kill(pid, Signal::SIGKILL) {
                    if e != Errno::ESRCH {
                        return Err(Error::Syscall("kill", e));
                    }
                }
                // detach leftovers so SIGKILL can be delivered, then reap
                for tracee in self.tracee_ctl.snapshot() {
                    let _ = sys::ptrace::detach(tracee.pid, None);
                }
                let _ = waitpid(pid, Some(WaitPidFlag::__WALL));
                Ok(Reply::Unit)
            }
        }
    }

    /// Resume the debugee and trace it until the next stop, then push the
    /// stop into the trap queue. If stops were queued while the world was
    /// stopping, deliver the next of them instead of resuming.
    fn resume(&mut self) -> Result<(), Error> {
        if let Some(event) = self.pending.pop_front() {
            return self.sink.send(event).map_err(|_| Error::TracerGone);
        }

        let event = self.trace_until_stop()?;
        self.sink.send(event).map_err(|_| Error::TracerGone)
    }

    fn trace_until_stop(&mut self) -> Result<TrapEvent, Error> {
        loop {
            let inject = self.inject.take();
            self.tracee_ctl
                .cont_stopped(inject)
                .map_err(|e| Error::MultipleErrors(e.to_string()))?;

            let status =
                waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL)).map_err(Error::Waitpid)?;
            if let Some(event) = self.observe(status)? {
                return Ok(event);
            }
        }
    }

    /// Handle a tracee event wired by the `wait` syscall. After this function
    /// ends the tracee registry must be in a consistent state. If a debugee
    /// stop is detected - returns the trap event.
    fn observe(&mut self, status: WaitStatus) -> Result<Option<TrapEvent>, Error> {
        match status {
            WaitStatus::Exited(pid, code) => {
                self.tracee_ctl.remove(pid);
                if pid == self.tracee_ctl.proc_pid() {
                    return Ok(Some(TrapEvent {
                        kind: TrapKind::Exit(code),
                        tid: pid,
                        task: None,
                    }));
                }
                Ok(None)
            }
            WaitStatus::Signaled(pid, signal, _) => {
                self.tracee_ctl.remove(pid);
                if pid == self.tracee_ctl.proc_pid() {
                    return Ok(Some(TrapEvent {
                        kind: TrapKind::Exit(128 + signal as i32),
                        tid: pid,
                        task: None,
                    }));
                }
                Ok(None)
            }
            WaitStatus::PtraceEvent(pid, _, code) => {
                match code {
                    libc::PTRACE_EVENT_EXEC => {
                        // fires just before the debugee starts, once: fork()
                        // in the debugee is unsupported
                        self.tracee_ctl.tracee_ensure_mut(pid).stop();
                        return Ok(Some(TrapEvent {
                            kind: TrapKind::DebugeeStart,
                            tid: pid,
                            task: None,
                        }));
                    }
                    libc::PTRACE_EVENT_CLONE => {
                        // fires just before a new thread is created
                        self.tracee_ctl.tracee_ensure_mut(pid).stop();
                        let new_tid =
                            Pid::from_raw(sys::ptrace::getevent(pid).map_err(Error::Ptrace)?
                                as pid_t);

                        // PTRACE_EVENT_STOP may be received first, and the new
                        // tracee may already be registered at this point
                        if self.tracee_ctl.tracee(new_tid).is_none() {
                            let new_tracee = self.tracee_ctl.add(new_tid);
                            let status = new_tracee.wait_one().map_err(Error::Waitpid)?;
                            debug_assert!(matches!(
                                status,
                                WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_STOP)
                            ));
                        }
                    }
                    libc::PTRACE_EVENT_STOP => {
                        // fires right after a new thread started, on
                        // PTRACE_INTERRUPT, or on a group-stop
                        if self.halt.swap(false, Ordering::AcqRel) {
                            match self.tracee_ctl.tracee_mut(pid) {
                                Some(tracee) => tracee.stop(),
                                None => {
                                    self.tracee_ctl.add(pid);
                                }
                            }
                            self.group_stop_interrupt(pid)?;
                            return Ok(Some(TrapEvent {
                                kind: TrapKind::Manual,
                                tid: pid,
                                task: None,
                            }));
                        }

                        match self.tracee_ctl.tracee_mut(pid) {
                            Some(tracee) => tracee.stop(),
                            None => {
                                self.tracee_ctl.add(pid);
                            }
                        }
                    }
                    libc::PTRACE_EVENT_EXIT => {
                        // stop the tracee at exit
                        let tracee = self.tracee_ctl.remove(pid);
                        if let Some(mut tracee) = tracee {
                            tracee.r#continue(None).ok();
                        }
                    }
                    _ => {
                        warn!(target: "tracer", "unsupported (ignored) ptrace event, code: {code}");
                    }
                }
                Ok(None)
            }
            WaitStatus::Stopped(pid, signal) => {
                let info = match sys::ptrace::getsiginfo(pid) {
                    Ok(info) => info,
                    Err(Errno::ESRCH) => {
                        // thread is gone, it will be reaped later
                        warn!(target: "tracer", "thread {pid} not found, ESRCH");
                        self.tracee_ctl.remove(pid);
                        return Ok(None);
                    }
                    Err(e) => return Err(Error::Ptrace(e)),
                };

                match signal {
                    Signal::SIGTRAP => match info.si_code {
                        TRAP_TRACE => {
                            self.tracee_ctl.tracee_ensure_mut(pid).stop();
                            self.group_stop_interrupt(pid)?;
                            Ok(Some(TrapEvent {
                                kind: TrapKind::SingleStep,
                                tid: pid,
                                task: None,
                            }))
                        }
                        TRAP_BRKPT | SI_KERNEL => {
                            self.tracee_ctl.tracee_ensure_mut(pid).stop();
                            self.group_stop_interrupt(pid)?;
                            Ok(Some(TrapEvent {
                                kind: TrapKind::Breakpoint,
                                tid: pid,
                                task: None,
                            }))
                        }
                        code => {
                            warn!(target: "tracer", "unexpected SIGTRAP code {code}");
                            Ok(None)
                        }
                    },
                    Signal::SIGSTOP if self.halt.swap(false, Ordering::AcqRel) => {
                        self.tracee_ctl.tracee_ensure_mut(pid).stop();
                        self.group_stop_interrupt(pid)?;
                        Ok(Some(TrapEvent {
                            kind: TrapKind::Manual,
                            tid: pid,
                            task: None,
                        }))
                    }
                    _ => {
                        self.tracee_ctl.tracee_ensure_mut(pid).stop();
                        self.group_stop_interrupt(pid)?;
                        self.inject = Some((pid, signal));
                        Ok(Some(TrapEvent {
                            kind: TrapKind::Signal(signal),
                            tid: pid,
                            task: None,
                        }))
                    }
                }
            }
            _ => {
                warn!(target: "tracer", "unexpected wait status: {status:?}");
                Ok(None)
            }
        }
    }

    /// Stop the whole debugee process: every running thread is interrupted
    /// one by one with PTRACE_INTERRUPT. If a thread receives other stops
    /// before the interrupt - handle them (breakpoint hits become pending
    /// trap events, signals are re-injected).
    fn group_stop_interrupt(&mut self, initiator: Pid) -> Result<(), Error> {
        let has_non_stopped = self
            .tracee_ctl
            .snapshot()
            .into_iter()
            .any(|t| t.pid != initiator && !t.is_stopped());
        if !has_non_stopped {
            return Ok(());
        }

        // two rounds: a thread created while the first round was in progress
        // is caught by the second one
        for _ in 0..2 {
            let tracees = self.tracee_ctl.snapshot();

            for mut tracee in tracees {
                if tracee.is_stopped() {
                    continue;
                }

                if let Err(e) = sys::ptrace::interrupt(tracee.pid) {
                    // if no such process - it will be removed later, on
                    // PTRACE_EVENT_EXIT event
                    if e == Errno::ESRCH {
                        warn!(target: "tracer", "thread {} not found, ESRCH", tracee.pid);
                        if let Some(t) = self.tracee_ctl.tracee_mut(tracee.pid) {
                            t.stop();
                        }
                        continue;
                    }
                    return Err(Error::Ptrace(e));
                }

                loop {
                    let status = match tracee.wait_one() {
                        Ok(status) => status,
                        Err(Errno::ESRCH) => {
                            self.tracee_ctl.remove(tracee.pid);
                            break;
                        }
                        Err(e) => return Err(Error::Waitpid(e)),
                    };

                    match status {
                        WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_STOP) => {
                            if let Some(t) = self.tracee_ctl.tracee_mut(tracee.pid) {
                                t.stop();
                            }
                            break;
                        }
                        WaitStatus::Stopped(pid, Signal::SIGTRAP) => {
                            // a trap won the race with the interrupt, keep it
                            // for the next resume
                            let info = sys::ptrace::getsiginfo(pid).map_err(Error::Ptrace)?;
                            let kind = match info.si_code {
                                TRAP_TRACE => TrapKind::SingleStep,
                                _ => TrapKind::Breakpoint,
                            };
                            self.pending.push_back(TrapEvent {
                                kind,
                                tid: pid,
                                task: None,
                            });
                            if let Some(t) = self.tracee_ctl.tracee_mut(pid) {
                                t.stop();
                            }
                            break;
                        }
                        WaitStatus::Stopped(pid, signal) => {
                            // tracee in signal-stop, inject the signal and
                            // keep waiting for the interrupt
                            tracee.r#continue(Some(signal)).map_err(Error::Ptrace)?;
                            debug!(target: "tracer", "signal {signal} injected, thread: {pid}");
                        }
                        WaitStatus::Exited(pid, _) => {
                            self.tracee_ctl.remove(pid);
                            break;
                        }
                        WaitStatus::PtraceEvent(pid, _, libc::PTRACE_EVENT_EXIT) => {
                            tracee.r#continue(None).ok();
                            self.tracee_ctl.remove(pid);
                            break;
                        }
                        _ => {
                            warn!(
                                target: "tracer",
                                "unexpected status {status:?} while stopping the world"
                            );
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn read_memory(&self, addr: usize, len: usize) -> Result<Vec<u8>, Error> {
        let pid = self.tracee_ctl.proc_pid();
        let mut buf = vec![0u8; len];

        let read = process_vm_readv(
            pid,
            &mut [IoSliceMut::new(&mut buf)],
            &[RemoteIoVec { base: addr, len }],
        );
        match read {
            Ok(_) => Ok(buf),
            // fall back to word-sized ptrace reads (e.g. no CAP_SYS_PTRACE
            // for the vm read path)
            Err(_) => {
                const WORD: usize = mem::size_of::<c_long>();
                let mut pos = 0;
                while pos < len {
                    let word = sys::ptrace::read(pid, (addr + pos) as *mut c_void)
                        .map_err(Error::Ptrace)?;
                    let bytes = word.to_ne_bytes();
                    let n = WORD.min(len - pos);
                    buf[pos..pos + n].copy_from_slice(&bytes[..n]);
                    pos += n;
                }
                Ok(buf)
            }
        }
    }

    fn write_memory(&self, addr: usize, data: &[u8]) -> Result<(), Error> {
        const WORD: usize = mem::size_of::<c_long>();
        let pid = self.tracee_ctl.proc_pid();
        let end = addr + data.len();

        // read-modify-write of every affected word: ptrace pokes ignore page
        // protection, which a breakpoint byte in .text needs
        let mut word_addr = addr - addr % WORD;
        while word_addr < end {
            let word =
                sys::ptrace::read(pid, word_addr as *mut c_void).map_err(Error::Ptrace)?;
            let mut bytes = word.to_ne_bytes();
            for (i, b) in bytes.iter_mut().enumerate() {
                let mem_addr = word_addr + i;
                if mem_addr >= addr && mem_addr < end {
                    *b = data[mem_addr - addr];
                }
            }
            unsafe {
                sys::ptrace::write(
                    pid,
                    word_addr as *mut c_void,
                    c_long::from_ne_bytes(bytes) as *mut c_void,
                )
                .map_err(Error::Ptrace)?;
            }
            word_addr += WORD;
        }
        Ok(())
    }
}

